pub mod router;
pub mod uplink;

use crate::error::ManagerError;

/// Resolves a `tcp://host:port` URL into a `host:port` connect string.
pub(crate) fn tcp_endpoint(url: &str) -> Result<String, ManagerError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| ManagerError::Config(format!("invalid endpoint url {url:?}: {e}")))?;
    if parsed.scheme() != "tcp" {
        return Err(ManagerError::Config(format!(
            "unsupported endpoint scheme {:?} in {url:?}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| ManagerError::Config(format!("endpoint url {url:?} has no host")))?;
    let port = parsed
        .port()
        .ok_or_else(|| ManagerError::Config(format!("endpoint url {url:?} has no port")))?;
    Ok(format!("{host}:{port}"))
}
