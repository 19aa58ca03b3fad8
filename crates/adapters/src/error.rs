use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("provider unavailable (credentials or quota): {0}")]
    Unavailable(String),
    #[error("malformed streaming chunk: {0}")]
    MalformedChunk(String),
    #[error("API returned an empty response")]
    EmptyResponse,
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<AdapterError>,
    },
    #[error("all providers in the chain failed")]
    AllProvidersExhausted,
}

impl AdapterError {
    pub fn retry_exhausted(attempts: u32, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    /// Errors worth another attempt against the same provider: network and
    /// timeout failures, 5xx, 429-style throttling, and garbled stream data.
    /// Credential, quota and configuration problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Http(_) => true,
            AdapterError::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            AdapterError::RateLimited(_) => true,
            AdapterError::MalformedChunk(_) => true,
            AdapterError::EmptyResponse => true,
            AdapterError::Json(_) => true,
            AdapterError::InvalidConfig(_)
            | AdapterError::Unavailable(_)
            | AdapterError::RetryExhausted { .. }
            | AdapterError::AllProvidersExhausted => false,
        }
    }
}

/// Maps a failed HTTP response onto the error taxonomy the retry layer and
/// the provider chain act on.
pub fn classify_status(status: StatusCode, body: String) -> AdapterError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        AdapterError::RateLimited(body)
    } else if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::PAYMENT_REQUIRED
    {
        AdapterError::Unavailable(body)
    } else {
        AdapterError::HttpStatus { status, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AdapterError::RateLimited("429".into()).is_transient());
        assert!(AdapterError::EmptyResponse.is_transient());
        assert!(AdapterError::MalformedChunk("x".into()).is_transient());
        assert!(AdapterError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        }
        .is_transient());

        assert!(!AdapterError::Unavailable("401".into()).is_transient());
        assert!(!AdapterError::InvalidConfig("bad".into()).is_transient());
        assert!(!AdapterError::HttpStatus {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        }
        .is_transient());
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            AdapterError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            AdapterError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()),
            AdapterError::HttpStatus { .. }
        ));
    }
}
