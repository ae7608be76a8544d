use crate::error::ManagerError;
use crate::metrics;
use crate::net::uplink::ResultUplink;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MIN_PUSH_POLL_PERIOD: Duration = Duration::from_millis(10);

/// Batches completed task results and forwards them to the interchange.
/// Owns the result uplink; the dispatcher only ever touches the channel.
pub struct ResultPusher {
    uplink: ResultUplink,
    pending: mpsc::UnboundedReceiver<Bytes>,
    max_batch: usize,
    push_poll_period: Duration,
    shutdown: CancellationToken,
}

impl ResultPusher {
    pub fn new(
        uplink: ResultUplink,
        pending: mpsc::UnboundedReceiver<Bytes>,
        max_batch: usize,
        poll_period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            uplink,
            pending,
            max_batch,
            push_poll_period: poll_period.max(MIN_PUSH_POLL_PERIOD),
            shutdown,
        }
    }

    /// Accumulates results and flushes whenever the batch is full or the
    /// push period has elapsed. Exits on cancellation, dropping whatever
    /// was not flushed; redelivery is the interchange's business.
    pub async fn run(mut self) -> Result<(), ManagerError> {
        let mut batch: Vec<Bytes> = Vec::new();
        let mut last_flush = Instant::now();

        loop {
            let deadline = last_flush + self.push_poll_period;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.pending.recv() => match received {
                    Some(result) => batch.push(result),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {}
            }

            if batch.len() >= self.max_batch || last_flush.elapsed() >= self.push_poll_period {
                last_flush = Instant::now();
                if !batch.is_empty() {
                    match self.uplink.send_batch(&batch).await {
                        Ok(()) => {
                            metrics::RESULT_BATCHES_FLUSHED_TOTAL.inc();
                            debug!(results = batch.len(), "flushed result batch");
                            batch.clear();
                        }
                        // Kept for the next flush; the socket may come back.
                        Err(e) => warn!("result flush failed: {e}"),
                    }
                }
            }
        }

        debug!(unflushed = batch.len(), "result pusher exiting");
        Ok(())
    }
}
