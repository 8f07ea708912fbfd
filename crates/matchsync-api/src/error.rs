use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid api base url {url}: {message}")]
    InvalidBaseUrl { url: String, message: String },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Whether the request timed out rather than being answered.
    pub fn is_timeout(&self) -> bool {
        match self {
            ApiError::Request { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}
