use thiserror::Error;

/// A chat platform call that reached the API but did not succeed.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{ctx}: {source}")]
    Request {
        ctx: &'static str,
        #[source]
        source: teloxide::RequestError,
    },
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("ai backend not configured")]
    Unavailable,

    #[error("ai request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ai backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("ai response had no text")]
    Empty,
}
