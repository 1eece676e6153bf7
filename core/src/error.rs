use thiserror::Error;

pub type Result<T> = std::result::Result<T, OverpassErr>;

/// Error taxonomy for the orchestrator and its subsystems.
///
/// Tool and policy failures never appear here; they are always recovered
/// into tool results inside the loop. What remains is the small set of
/// conditions that abort a request.
#[derive(Debug, Error)]
pub enum OverpassErr {
    /// Session-store failures are fatal to the request.
    #[error("session store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OverpassErr {
    pub fn store(err: anyhow::Error) -> Self {
        OverpassErr::Store(err)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        OverpassErr::Internal(message.into())
    }
}
