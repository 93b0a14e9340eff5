//! Error taxonomy. One `thiserror` enum per component boundary, matching
//! the granularity application code actually wants to match on.

use thiserror::Error;

use crate::frame::ErrorObject;

/// Errors from `ConnectionCore::connect`/`disconnect`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect() called while a connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

/// Errors surfaced through a [`crate::request_registry::RequestHandle`].
#[derive(Debug, Error, Clone)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("request was cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("request failed: {0}")]
    Failed(#[from] ErrorObject),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for ErrorObject {}

/// Errors from [`crate::method_registry::MethodRegistry::register`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MethodError {
    #[error("invalid method name '{0}': must start with a letter, contain only alphanumerics/underscore/colon, and be at least 3 characters")]
    InvalidName(String),

    #[error("method namespace '{0}' is reserved")]
    NamespaceReserved(String),

    #[error("method '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Errors returned from a [`crate::method_registry::RequestContext`] call
/// made after the request already reached a terminal state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("request context already resolved with a success or error response")]
    AlreadyFinished,
}

/// Errors from [`crate::state_manager::StateManager`].
#[derive(Debug, Error)]
pub enum StateError {
    #[error("a refresh is already in progress")]
    RefreshInProgress,

    #[error("minimum refresh interval not yet reached")]
    TooSoon,

    #[error("state refresh request failed: {0}")]
    RequestFailed(#[from] RequestError),

    #[error("no active connection")]
    NotConnected,
}

/// Errors from [`crate::topic_router::TopicRouter`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("invalid topic pattern '{0}'")]
    InvalidPattern(String),
}
