//! Error taxonomy shared by the registry, dispatcher and lifecycle controller.

use std::time::Duration;
use thiserror::Error;

/// Every failure the bridge can report, to a client or to its owner.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("command already registered: {0}")]
    DuplicateCommand(String),
    #[error("invalid command name {0:?}")]
    InvalidCommandName(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("command did not complete within {0:?}")]
    ExecutionTimeout(Duration),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("service is stopping")]
    ServiceStopping,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("service is already running")]
    AlreadyRunning,
    #[error("service is not running")]
    NotRunning,
    #[error("service is already initialized")]
    AlreadyInitialized,
    #[error("service has not been initialized")]
    NotInitialized,
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },
    #[error("failed to build network runtime: {0}")]
    Runtime(std::io::Error),
}

impl BridgeError {
    /// Stable name used on the wire, e.g. `UnknownCommandError`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "MalformedRequestError",
            Self::UnknownCommand(_) => "UnknownCommandError",
            Self::DuplicateCommand(_) => "DuplicateCommandError",
            Self::InvalidCommandName(_) => "InvalidCommandNameError",
            Self::Handler(_) => "HandlerError",
            Self::ExecutionTimeout(_) => "ExecutionTimeoutError",
            Self::ServiceUnavailable(_) => "ServiceUnavailableError",
            Self::ServiceStopping => "ServiceStoppingError",
            Self::Connection(_) => "ConnectionError",
            Self::AlreadyRunning => "AlreadyRunningError",
            Self::NotRunning => "NotRunningError",
            Self::AlreadyInitialized => "AlreadyInitializedError",
            Self::NotInitialized => "NotInitializedError",
            Self::Bind { .. } => "BindError",
            Self::Runtime(_) => "RuntimeError",
        }
    }

    /// The part of the message after the kind, without the Display prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::MalformedRequest(msg)
            | Self::UnknownCommand(msg)
            | Self::DuplicateCommand(msg)
            | Self::InvalidCommandName(msg)
            | Self::Handler(msg)
            | Self::ServiceUnavailable(msg)
            | Self::Connection(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// `"<Kind>: <detail>"`, the form carried in a response's `error` field.
    pub fn wire_message(&self) -> String {
        format!("{}: {}", self.kind(), self.detail())
    }
}
