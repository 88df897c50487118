use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use thiserror::Error;

/// Failure modes of a single downstream exchange.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DispatchError {
    /// No response head was received (refused, DNS failure, reset, TLS failure)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A response head arrived but its body could not be read to the end
    #[error("Response processing error: {0}")]
    Processing(String),

    /// The outbound request could not be constructed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for downstream operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// DownstreamClient defines the port (interface) for talking to destinations
#[async_trait]
pub trait DownstreamClient: Send + Sync + 'static {
    /// Send a fully buffered request and buffer the complete response
    ///
    /// # Arguments
    /// * `req` - Absolute-URI request addressed to a destination
    ///
    /// # Returns
    /// The destination's response, whatever its status, or the failure that
    /// prevented receiving it in full
    async fn send(&self, req: Request<Bytes>) -> DispatchResult<Response<Bytes>>;

    /// Perform a health probe
    ///
    /// # Returns
    /// true when `url` answered with a 2xx status within `timeout`
    async fn probe(&self, url: &str, timeout: Duration) -> DispatchResult<bool>;
}
