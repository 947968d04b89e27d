use crate::protocol::ProtocolStage;

/// Errors returned to callers of the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Session '{0}' already exists")]
    SessionExists(String),
    #[error("Session '{0}' not found")]
    SessionNotFound(String),
    #[error("Session '{0}' is not active")]
    SessionInactive(String),
    #[error("Session '{0}' is already streaming")]
    AlreadyStreaming(String),
    #[error("Session '{id}' cannot {action} while in stage {stage:?}")]
    InvalidStage {
        id: String,
        action: &'static str,
        stage: ProtocolStage,
    },
    #[error("Timed out waiting for session '{id}' to reach stage {expected:?}")]
    PrerequisiteTimeout { id: String, expected: ProtocolStage },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Stream-level failures surfaced by the inference transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Model error: {0}")]
    Model(String),
    #[error("Internal server error: {0}")]
    Server(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

impl TransportError {
    /// Machine-readable kind delivered to the caller's error handler.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Model(_) => "model_error",
            TransportError::Server(_) => "server_error",
            TransportError::Stream(_) => "stream_error",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            TransportError::Model(d) | TransportError::Server(d) | TransportError::Stream(d) => d,
        }
    }
}

/// An inbound message that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Inbound message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Inbound message has no `event` object")]
    MissingEnvelope,
    #[error("Inbound `{kind}` event is malformed: {source}")]
    Malformed {
        kind: &'static str,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_kinds() {
        assert_eq!(TransportError::Model("x".into()).kind(), "model_error");
        assert_eq!(TransportError::Server("x".into()).kind(), "server_error");
        assert_eq!(TransportError::Stream("x".into()).kind(), "stream_error");
        assert_eq!(TransportError::Server("boom".into()).detail(), "boom");
    }

    #[test]
    fn test_stream_error_display() {
        let err = StreamError::InvalidStage {
            id: "s1".to_string(),
            action: "start audio",
            stage: ProtocolStage::Idle,
        };
        assert_eq!(err.to_string(), "Session 's1' cannot start audio while in stage Idle");

        let err: StreamError = TransportError::Model("throttled".into()).into();
        assert_eq!(err.to_string(), "Model error: throttled");
    }
}
