use std::time::Duration;

/// Failures raised by a `StreamTransport` through `on_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Server answered with a non-2xx status.
    #[error("generation request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// Connection or body read failed.
    #[error("network error: {0}")]
    Network(String),
    /// Response could not be interpreted as an event stream.
    #[error("malformed stream response: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Gateway-class statuses and network failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => is_gateway_status(*status),
            Self::Network(_) => true,
            Self::Malformed(_) => false,
        }
    }
}

/// Error type for a generation job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// No usable bearer credential.
    #[error("authentication error: {0}")]
    Authentication(String),
    /// HTTP exchange or stream read failed.
    #[error(transparent)]
    Transport(TransportError),
    /// Server reported a failure in-band with an `error` payload.
    #[error("{message}")]
    Protocol { message: String },
    /// The size-scaled deadline elapsed before the stream closed.
    #[error("generation timed out after {}s", after.as_secs())]
    Timeout { after: Duration },
    /// Job parameters could not be turned into a request.
    #[error("validation error: {0}")]
    Validation(String),
    /// Client configuration is unusable.
    #[error("config error: {0}")]
    Config(String),
    /// Job was cancelled by the caller.
    #[error("generation cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, when there is one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Transport(TransportError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

impl From<TransportError> for GenerationError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

pub(crate) fn is_gateway_status(status: u16) -> bool {
    matches!(status, 502..=504)
}

/// In-band server messages have no structure, so gateway and network
/// failures relayed by the server are recognised by their wording.
pub(crate) fn message_looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["502", "503", "504", "network", "timeout", "timed out", "unavailable"]
        .iter()
        .any(|needle| lower.contains(needle))
}
