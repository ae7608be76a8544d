use crate::ProtocolError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the number of frames in one message. Result batches are
/// the largest messages on the wire; the pusher chunks batches that would
/// exceed this.
pub const MAX_FRAMES: u32 = 4096;

/// Upper bound on a single frame. Task buffers are user payloads and can be
/// large, but anything beyond this is a corrupt length prefix in practice.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Reads one multipart message: `u32le` frame count, then per frame a
/// `u32le` length prefix followed by the payload bytes.
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<Bytes>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u32_le().await?;
    read_frames(reader, count).await
}

/// Like [`read_message`], but returns `None` when the peer closed the
/// connection cleanly at a message boundary.
pub async fn read_message_opt<R>(reader: &mut R) -> Result<Option<Vec<Bytes>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let count = u32::from_le_bytes(header);
    Ok(Some(read_frames(reader, count).await?))
}

async fn read_frames<R>(reader: &mut R, count: u32) -> Result<Vec<Bytes>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if count == 0 || count > MAX_FRAMES {
        return Err(ProtocolError::TooManyFrames(count));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32_le().await?;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        frames.push(Bytes::from(buf));
    }
    Ok(frames)
}

/// Writes one multipart message and flushes it.
pub async fn write_message<W>(writer: &mut W, frames: &[Bytes]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() || frames.len() > MAX_FRAMES as usize {
        return Err(ProtocolError::TooManyFrames(frames.len() as u32));
    }
    writer.write_u32_le(frames.len() as u32).await?;
    for frame in frames {
        if frame.len() > MAX_FRAME_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge(frame.len() as u32));
        }
        writer.write_u32_le(frame.len() as u32).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::check;

    #[test]
    async fn multipart_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frames = vec![
            Bytes::from_static(b"worker-1"),
            Bytes::from_static(b"TASK_RET"),
            Bytes::from_static(&[0xBB, 0x00, 0x01]),
        ];
        write_message(&mut client, &frames).await.unwrap();

        let read = read_message(&mut server).await.unwrap();
        check!(read == frames);
    }

    #[test]
    async fn single_empty_frame_survives() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_message(&mut client, &[Bytes::new()]).await.unwrap();

        let read = read_message(&mut server).await.unwrap();
        check!(read.len() == 1);
        check!(read[0].is_empty());
    }

    #[test]
    async fn zero_frames_is_rejected() {
        let (mut client, _server) = tokio::io::duplex(64);
        let result = write_message(&mut client, &[]).await;
        check!(matches!(result, Err(ProtocolError::TooManyFrames(0))));
    }

    #[test]
    async fn oversized_frame_count_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_u32_le(MAX_FRAMES + 1)
            .await
            .unwrap();

        let result = read_message(&mut server).await;
        check!(matches!(result, Err(ProtocolError::TooManyFrames(_))));
    }

    #[test]
    async fn oversized_frame_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32_le(1).await.unwrap();
        client.write_u32_le(MAX_FRAME_SIZE + 1).await.unwrap();

        let result = read_message(&mut server).await;
        check!(matches!(result, Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    async fn clean_eof_reads_as_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let read = read_message_opt(&mut server).await.unwrap();
        check!(read.is_none());
    }
}
