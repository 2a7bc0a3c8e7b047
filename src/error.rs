use thiserror::Error;

/// Error taxonomy for the download engine.
///
/// Transient network failures and HTTP 458 (expired IPTV play token) are
/// retried internally by [`crate::chunk_fetcher`] and [`crate::file_downloader`];
/// only exhausted-retry and fatal conditions surface here.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("server does not support range requests")]
    NoRangeSupport,

    #[error("download cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Server answered 200 to a ranged request on a chunk other than the
    /// first; the planned multi-chunk layout can no longer be satisfied.
    #[error("server returned 200 to a range request on chunk {0} (not chunk 0)")]
    ProtocolMismatch(usize),

    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// A Job exhausted its outer retry budget. Wraps the last underlying
    /// error encountered by the failing attempt.
    #[error("job failed for {destination}: {source}")]
    JobFailed {
        destination: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Network(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}
