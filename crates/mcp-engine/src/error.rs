use std::fmt::Display;

pub use crate::model::ErrorData;

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Unified error for everything the engine can surface to an embedder.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ErrorData),
    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("Pub/sub error: {0}")]
    PubSub(#[from] crate::pubsub::PubSubError),
    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use crate::model::{ErrorCode, ErrorData};

    #[test]
    fn test_error_data_display_without_data() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: None,
        };
        assert_eq!(format!("{}", error), "-32600: Invalid Request");
    }

    #[test]
    fn test_error_data_display_with_data() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: Some(serde_json::json!({"detail": "missing field"})),
        };
        assert_eq!(
            format!("{}", error),
            "-32600: Invalid Request({\"detail\":\"missing field\"})"
        );
    }

    #[test]
    fn test_error_data_is_std_error() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: None,
        };
        let _: &dyn std::error::Error = &error;
    }
}
