//! Broker error types — JSON-RPC error codes + A2A-specific errors.
//!
//! Two layers share this type: protocol errors that map onto JSON-RPC
//! `code`/`message` pairs (-32700 through -32603, -32001 through -32006),
//! and runtime failure kinds (device gone, timeout, overloaded) that are
//! attached to a task's terminal status rather than returned to the caller.

use crate::types::JsonRpcError;

// ---------------------------------------------------------------------------
// Standard JSON-RPC 2.0 error codes
// ---------------------------------------------------------------------------

/// Invalid JSON was received by the server.
pub const PARSE_ERROR: i64 = -32700;

/// The JSON sent is not a valid Request object.
pub const INVALID_REQUEST: i64 = -32600;

/// The method does not exist / is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Invalid method parameter(s).
pub const INVALID_PARAMS: i64 = -32602;

/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

// ---------------------------------------------------------------------------
// A2A-specific error codes
// ---------------------------------------------------------------------------

/// The requested task was not found.
pub const TASK_NOT_FOUND: i64 = -32001;

/// The task cannot be canceled in its current state.
pub const TASK_NOT_CANCELABLE: i64 = -32002;

/// Push notifications are not supported by this service.
pub const PUSH_NOTIFICATION_NOT_SUPPORTED: i64 = -32003;

/// The requested operation is not supported.
pub const UNSUPPORTED_OPERATION: i64 = -32004;

/// The content type is not supported.
pub const CONTENT_TYPE_NOT_SUPPORTED: i64 = -32005;

/// A delegated agent returned an invalid response.
pub const INVALID_AGENT_RESPONSE: i64 = -32006;

// ---------------------------------------------------------------------------
// BrokerError enum
// ---------------------------------------------------------------------------

/// Unified error type for protocol, routing, and runtime failures.
///
/// Protocol variants carry a human-readable message and an optional
/// structured `data` payload that is propagated into the JSON-RPC error
/// object. Runtime variants (`DeviceGone`, `Timeout`, `Overloaded`) describe
/// conditions that fail a task; at the RPC boundary they map to an internal
/// error, but their kind label ends up in the task's terminal status message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    // -- Protocol errors (map to JSON-RPC error codes) --
    /// Invalid JSON payload (code -32700).
    #[error("Parse error: {message}")]
    ParseError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Request payload validation error (code -32600).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Method not found (code -32601).
    #[error("Method not found: {message}")]
    MethodNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Invalid parameters (code -32602).
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Internal error (code -32603).
    #[error("Internal error: {message}")]
    InternalError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Task not found (code -32001).
    #[error("Task not found: {message}")]
    TaskNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Task cannot be canceled (code -32002).
    #[error("Task not cancelable: {message}")]
    TaskNotCancelable {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Push notifications not supported (code -32003).
    #[error("Push notification not supported: {message}")]
    PushNotificationNotSupported {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Operation not supported (code -32004).
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Content type not supported (code -32005).
    #[error("Content type not supported: {message}")]
    ContentTypeNotSupported {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// A delegated agent returned a nonconformant payload (code -32006).
    #[error("Invalid agent response: {message}")]
    InvalidAgentResponse {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    // -- Runtime failure kinds (fail the owning task) --
    /// The device backing a task was removed or its port is unreachable.
    #[error("Device gone: {0}")]
    DeviceGone(String),

    /// A request, tool invocation, or LLM call exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The worker queue stayed full past the submission grace period.
    #[error("Overloaded: {0}")]
    Overloaded(String),

    // -- Client/transport-side errors --
    /// Transport-level error (connection failed, request failed, etc.).
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP error with status code and response body.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Invalid JSON received from a remote peer.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// A JSON-RPC error response was received from a remote agent.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Catch-all for errors that don't fit other categories.
    #[error("{0}")]
    Other(String),
}

/// Convenience result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    // -- Convenience constructors (message-only, no data) --

    /// Create a `ParseError` with a message and no data.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidRequest` with a message and no data.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `MethodNotFound` with a message and no data.
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::MethodNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidParams` with a message and no data.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InternalError` with a message and no data.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskNotFound` with a message and no data.
    pub fn task_not_found(message: impl Into<String>) -> Self {
        Self::TaskNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskNotCancelable` with a message and no data.
    pub fn task_not_cancelable(message: impl Into<String>) -> Self {
        Self::TaskNotCancelable {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `PushNotificationNotSupported` with a message and no data.
    pub fn push_notification_not_supported(message: impl Into<String>) -> Self {
        Self::PushNotificationNotSupported {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `UnsupportedOperation` with a message and no data.
    pub fn unsupported_operation(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `ContentTypeNotSupported` with a message and no data.
    pub fn content_type_not_supported(message: impl Into<String>) -> Self {
        Self::ContentTypeNotSupported {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidAgentResponse` with a message and no data.
    pub fn invalid_agent_response(message: impl Into<String>) -> Self {
        Self::InvalidAgentResponse {
            message: message.into(),
            data: None,
        }
    }

    /// Returns the JSON-RPC error code for this error variant.
    ///
    /// Runtime and transport errors that don't have an assigned A2A code
    /// map to -32603 (internal error).
    pub fn code(&self) -> i64 {
        match self {
            BrokerError::ParseError { .. } => PARSE_ERROR,
            BrokerError::InvalidRequest { .. } => INVALID_REQUEST,
            BrokerError::MethodNotFound { .. } => METHOD_NOT_FOUND,
            BrokerError::InvalidParams { .. } => INVALID_PARAMS,
            BrokerError::InternalError { .. } => INTERNAL_ERROR,
            BrokerError::TaskNotFound { .. } => TASK_NOT_FOUND,
            BrokerError::TaskNotCancelable { .. } => TASK_NOT_CANCELABLE,
            BrokerError::PushNotificationNotSupported { .. } => PUSH_NOTIFICATION_NOT_SUPPORTED,
            BrokerError::UnsupportedOperation { .. } => UNSUPPORTED_OPERATION,
            BrokerError::ContentTypeNotSupported { .. } => CONTENT_TYPE_NOT_SUPPORTED,
            BrokerError::InvalidAgentResponse { .. } => INVALID_AGENT_RESPONSE,
            BrokerError::DeviceGone(_)
            | BrokerError::Timeout(_)
            | BrokerError::Overloaded(_)
            | BrokerError::Transport(_)
            | BrokerError::Http { .. }
            | BrokerError::InvalidJson(_)
            | BrokerError::Other(_) => INTERNAL_ERROR,
            BrokerError::JsonRpc { code, .. } => *code,
        }
    }

    /// Short label identifying a failure kind, used in the terminal status
    /// message of a failed task.
    pub fn failure_kind(&self) -> &'static str {
        match self {
            BrokerError::DeviceGone(_) => "device-gone",
            BrokerError::Timeout(_) => "timeout",
            BrokerError::Overloaded(_) => "overloaded",
            BrokerError::InvalidAgentResponse { .. } => "invalid-agent-response",
            BrokerError::UnsupportedOperation { .. } => "unsupported-operation",
            BrokerError::ContentTypeNotSupported { .. } => "content-type-not-supported",
            _ => "error",
        }
    }
}

impl From<BrokerError> for JsonRpcError {
    fn from(err: BrokerError) -> Self {
        let code = err.code();
        let message = err.to_string();
        // Preserve structured data from protocol error variants.
        let data = match &err {
            BrokerError::ParseError { data, .. }
            | BrokerError::InvalidRequest { data, .. }
            | BrokerError::MethodNotFound { data, .. }
            | BrokerError::InvalidParams { data, .. }
            | BrokerError::InternalError { data, .. }
            | BrokerError::TaskNotFound { data, .. }
            | BrokerError::TaskNotCancelable { data, .. }
            | BrokerError::PushNotificationNotSupported { data, .. }
            | BrokerError::UnsupportedOperation { data, .. }
            | BrokerError::ContentTypeNotSupported { data, .. }
            | BrokerError::InvalidAgentResponse { data, .. }
            | BrokerError::JsonRpc { data, .. } => data.clone(),
            _ => None,
        };
        JsonRpcError {
            code,
            message,
            data,
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::ParseError {
            message: err.to_string(),
            data: None,
        }
    }
}
