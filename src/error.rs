use thiserror::Error;

use crate::domain::host::Host;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Failed to send to {host}: {message}")]
    Transport { host: Host, message: String },

    #[error("Remote call {method} on {host} failed: {message}")]
    Rpc { host: Host, method: String, message: String },

    #[error("No available node for target {target}")]
    NoAvailableNode { target: String },

    #[error("Dispatch of {method} to {target} failed, all candidates exhausted (tried: {tried:?})")]
    DispatchExhausted { target: String, method: String, tried: Vec<Host> },

    #[error("Lifecycle event handler failed: {0}")]
    Handler(String),

    #[error("Election failed: {0}")]
    Election(String),

    #[error("Registry operation failed: {0}")]
    Registry(String),

    #[error("Inconsistent instance data: {0}")]
    Data(String),

    #[error("graph has cycle")]
    GraphHasCycle,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Closed set of error categories. Callers branch on the kind instead of matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Protocol,
    Transport,
    Dispatch,
    Handler,
    Election,
    Registry,
    Data,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol(_) | Error::DeserializationError(_) => ErrorKind::Protocol,
            Error::Transport { .. } | Error::IoError(_) => ErrorKind::Transport,
            Error::Rpc { .. } | Error::NoAvailableNode { .. } | Error::DispatchExhausted { .. } => ErrorKind::Dispatch,
            Error::Handler(_) => ErrorKind::Handler,
            Error::Election(_) => ErrorKind::Election,
            Error::Registry(_) => ErrorKind::Registry,
            Error::Data(_) | Error::GraphHasCycle => ErrorKind::Data,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Short, stable name used as the exception tag in RPC metrics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Error::IoError(_) => "IoError",
            Error::DeserializationError(_) => "DeserializationError",
            Error::Protocol(_) => "ProtocolError",
            Error::Transport { .. } => "TransportError",
            Error::Rpc { .. } => "RpcError",
            Error::NoAvailableNode { .. } => "NoAvailableNode",
            Error::DispatchExhausted { .. } => "DispatchExhausted",
            Error::Handler(_) => "HandlerError",
            Error::Election(_) => "ElectionError",
            Error::Registry(_) => "RegistryError",
            Error::Data(_) => "DataError",
            Error::GraphHasCycle => "GraphHasCycle",
            Error::Config(_) => "ConfigError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
