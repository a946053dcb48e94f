use thiserror::Error;

/// terminal failure of a single `stream_completion` call.
#[derive(Debug, Error)]
pub enum StreamError {
    /// the endpoint answered with a non-success status.
    #[error("API Error: {0}")]
    Status(u16),
    /// the request never produced a response (dns, connect, tls, ...).
    #[error("transport error: {0}")]
    Transport(String),
    /// the response carried no readable body.
    #[error("no reader available")]
    MissingBody,
    /// reading the next increment of the body failed.
    #[error("stream read error: {0}")]
    Read(String),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::Read(err.to_string())
    }
}
