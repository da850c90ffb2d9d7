//! Error types for the toolpilot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all toolpilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the transport client.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Backend does not support streaming with tools: {0}")]
    StreamingToolsUnsupported(String),

    #[error("Duplicate value for 'tool_call_id': {0}")]
    DuplicateToolCallId(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The caller cancelled the request. Not a failure.
    #[error("Request aborted")]
    Aborted,
}

impl ProviderError {
    /// Whether this error is a caller-initiated abort rather than a failure.
    pub fn is_abort(&self) -> bool {
        match self {
            Self::Aborted => true,
            Self::StreamInterrupted(msg) | Self::Network(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("aborted") || msg.contains("aborterror")
            }
            _ => false,
        }
    }

    /// Whether the backend rejected a streaming request because tools were attached.
    ///
    /// Backends rarely report this with a dedicated code, so API error text
    /// mentioning both streaming and tools is treated the same way.
    pub fn is_streaming_tools_incompatibility(&self) -> bool {
        match self {
            Self::StreamingToolsUnsupported(_) => true,
            Self::ApiError { message, .. } | Self::StreamInterrupted(message) => {
                let msg = message.to_lowercase();
                msg.contains("stream") && msg.contains("tool")
            }
            _ => false,
        }
    }

    /// Whether the backend rejected the transcript for repeating a tool-call id.
    pub fn is_duplicate_tool_call_id(&self) -> bool {
        match self {
            Self::DuplicateToolCallId(_) => true,
            Self::ApiError { message, .. } => message.to_lowercase().contains("duplicate"),
            _ => false,
        }
    }
}

/// Failures of a single tool invocation.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool protocol error: {0}")]
    Protocol(String),
}

impl ToolError {
    /// Malformed arguments and unknown tools will not fix themselves on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::InvalidArguments(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn abort_classification() {
        assert!(ProviderError::Aborted.is_abort());
        assert!(ProviderError::StreamInterrupted("BodyStreamBuffer was aborted".into()).is_abort());
        assert!(!ProviderError::Network("connection refused".into()).is_abort());
        assert!(!ProviderError::Timeout("slow".into()).is_abort());
    }

    #[test]
    fn streaming_tools_incompatibility_detected_from_text() {
        let err = ProviderError::ApiError {
            status_code: 400,
            message: "Streaming is not supported when tools are provided".into(),
        };
        assert!(err.is_streaming_tools_incompatibility());

        let unrelated = ProviderError::ApiError {
            status_code: 400,
            message: "context length exceeded".into(),
        };
        assert!(!unrelated.is_streaming_tools_incompatibility());
    }

    #[test]
    fn duplicate_tool_call_id_detected_from_text() {
        let err = ProviderError::ApiError {
            status_code: 400,
            message: "Duplicate value for 'tool_call_id' of call_1 in message[4]".into(),
        };
        assert!(err.is_duplicate_tool_call_id());
        assert!(ProviderError::DuplicateToolCallId("call_1".into()).is_duplicate_tool_call_id());
        assert!(!ProviderError::Aborted.is_duplicate_tool_call_id());
    }

    #[test]
    fn tool_error_retryability() {
        assert!(!ToolError::NotFound("x".into()).is_retryable());
        assert!(!ToolError::InvalidArguments("bad json".into()).is_retryable());
        assert!(ToolError::ExecutionFailed {
            tool_name: "x".into(),
            reason: "flaky".into()
        }
        .is_retryable());
        assert!(ToolError::Protocol("server gone".into()).is_retryable());
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::PermissionDenied {
            tool_name: "script".into(),
            reason: "interpreter not allowed".into(),
        });
        assert!(err.to_string().contains("script"));
        assert!(err.to_string().contains("interpreter"));
    }
}
