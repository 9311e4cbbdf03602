//! Error types for the vMCP gateway

use std::io;

use thiserror::Error;

/// Result type alias for the vMCP gateway
pub type Result<T> = std::result::Result<T, Error>;

/// vMCP gateway errors
///
/// The first group is the resolution/connection taxonomy surfaced to
/// clients by kind; the second group is infrastructure.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend could not be reached or spoke invalid protocol
    #[error("Connection to backend '{backend}' failed: {message}")]
    Connection {
        /// Backend name
        backend: String,
        /// Cause
        message: String,
    },

    /// Backend demands delegated authorization that is not complete yet
    #[error("Backend '{0}' requires authorization")]
    AuthRequired(String),

    /// Callback `state` does not match the pending one
    #[error("Authorization state mismatch")]
    StateMismatch,

    /// Callback `state` matched but is older than the TTL
    #[error("Authorization state expired")]
    StateExpired,

    /// No backend exposes the referenced tool
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Unqualified reference exposed by several backends
    #[error("Ambiguous reference '{name}', exposed by: {}", backends.join(", "))]
    AmbiguousReference {
        /// Reference as written
        name: String,
        /// Backends exposing it, sorted
        backends: Vec<String>,
    },

    /// Backend reported the tool call as failed
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution {
        /// Tool reference
        tool: String,
        /// Backend-reported failure text
        message: String,
    },

    /// No resource matches the locator
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Resource content is binary and cannot be spliced into a prompt
    #[error("Resource '{uri}' is not textual ({content_type})")]
    UnrenderableResource {
        /// Locator
        uri: String,
        /// Reported content type
        content_type: String,
    },

    /// Required variable not supplied
    #[error("Missing required parameter '{name}' for prompt '{prompt}'")]
    MissingRequiredParameter {
        /// Prompt being resolved
        prompt: String,
        /// Variable name
        name: String,
    },

    /// Argument or `@param` reference outside the declared variables
    #[error("Unknown parameter '{name}' for prompt '{prompt}'")]
    UnknownParameter {
        /// Prompt being resolved
        prompt: String,
        /// Parameter name
        name: String,
    },

    /// `@config` key not declared in the prompt's `environment_variables`
    #[error("Prompt '{prompt}' is not allowed to read config '{name}'")]
    UnauthorizedConfigAccess {
        /// Prompt being resolved
        prompt: String,
        /// Config key
        name: String,
    },

    /// Declared `@config` key has no value on the virtual server
    #[error("Unknown config '{0}'")]
    UnknownConfig(String),

    /// `@prompt` chain loops back to a prompt being expanded
    #[error("Cyclic prompt reference: {}", chain.join(" -> "))]
    CyclicPromptReference {
        /// Expansion stack ending with the repeated name
        chain: Vec<String>,
    },

    /// `@prompt` chain deeper than the configured bound
    #[error("Prompt reference depth exceeds {0}")]
    RecursionDepthExceeded(usize),

    /// Resolution abandoned by the caller or by timeout
    #[error("Resolution cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Custom or backend prompt not found
    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    /// Virtual server not registered
    #[error("Virtual server not found: {0}")]
    VirtualServerNotFound(String),

    /// Backend not part of the virtual server
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error returned by a backend
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a connection error
    pub fn connection(backend: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Stable kind name, carried as `data.kind` in JSON-RPC errors
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "ConnectionError",
            Self::AuthRequired(_) => "AuthRequired",
            Self::StateMismatch => "StateMismatch",
            Self::StateExpired => "StateExpired",
            Self::ToolNotFound(_) => "ToolNotFound",
            Self::AmbiguousReference { .. } => "AmbiguousReference",
            Self::ToolExecution { .. } => "ToolExecutionError",
            Self::ResourceNotFound(_) => "ResourceNotFound",
            Self::UnrenderableResource { .. } => "UnrenderableResource",
            Self::MissingRequiredParameter { .. } => "MissingRequiredParameter",
            Self::UnknownParameter { .. } => "UnknownParameter",
            Self::UnauthorizedConfigAccess { .. } => "UnauthorizedConfigAccess",
            Self::UnknownConfig(_) => "UnknownConfig",
            Self::CyclicPromptReference { .. } => "CyclicPromptReference",
            Self::RecursionDepthExceeded(_) => "RecursionDepthExceeded",
            Self::Cancelled => "Cancelled",
            Self::Config(_) => "ConfigError",
            Self::PromptNotFound(_) => "PromptNotFound",
            Self::VirtualServerNotFound(_) => "VirtualServerNotFound",
            Self::BackendNotFound(_) => "BackendNotFound",
            Self::Transport(_) => "TransportError",
            Self::Protocol(_) => "ProtocolError",
            Self::JsonRpc { .. } => "JsonRpcError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Http(_) => "HttpError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::MissingRequiredParameter { .. }
            | Self::UnknownParameter { .. }
            | Self::AmbiguousReference { .. }
            | Self::StateMismatch
            | Self::StateExpired => rpc_codes::INVALID_PARAMS,
            Self::ToolNotFound(_)
            | Self::ResourceNotFound(_)
            | Self::PromptNotFound(_)
            | Self::VirtualServerNotFound(_)
            | Self::BackendNotFound(_) => rpc_codes::NOT_FOUND,
            Self::AuthRequired(_) | Self::UnauthorizedConfigAccess { .. } => {
                rpc_codes::UNAUTHORIZED
            }
            Self::Cancelled => rpc_codes::REQUEST_CANCELLED,
            Self::Connection { .. }
            | Self::Transport(_)
            | Self::Http(_)
            | Self::ToolExecution { .. }
            | Self::UnrenderableResource { .. }
            | Self::UnknownConfig(_)
            | Self::CyclicPromptReference { .. }
            | Self::RecursionDepthExceeded(_) => rpc_codes::SERVER_ERROR_START,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Referenced item does not exist
    pub const NOT_FOUND: i32 = -32001;
    /// Caller or backend lacks authorization
    pub const UNAUTHORIZED: i32 = -32002;
    /// Request cancelled before completion
    pub const REQUEST_CANCELLED: i32 = -32800;
}
