use std::time::Duration;

/// Failure of a call to an external dependency (AI/image providers).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExternalError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit breaker for '{0}' is open")]
    CircuitOpen(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("gave up after {attempts} attempt(s) in {elapsed:?}: {source}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<ExternalError>,
    },

    #[error("{0}")]
    Other(String),
}

impl ExternalError {
    /// Connection-level failures that are worth another attempt
    pub fn is_transient_network(&self) -> bool {
        match self {
            ExternalError::Network(_) | ExternalError::Timeout(_) => true,
            ExternalError::Exhausted { source, .. } => source.is_transient_network(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ExternalError::Status { status, .. } => Some(*status),
            ExternalError::Exhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        match self {
            ExternalError::CircuitOpen(_) => true,
            ExternalError::Exhausted { source, .. } => source.is_circuit_open(),
            _ => false,
        }
    }

    /// The error that ended the last attempt, without retry bookkeeping
    pub fn root(&self) -> &ExternalError {
        match self {
            ExternalError::Exhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for ExternalError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            ExternalError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_timeout() || err.is_connect() || err.is_request() {
            ExternalError::Network(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ExternalError::InvalidResponse(err.to_string())
        } else {
            ExternalError::Other(err.to_string())
        }
    }
}
