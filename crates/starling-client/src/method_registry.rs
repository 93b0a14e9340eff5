//! Server-callable method handlers registered by the application.
//!
//! A registered handler receives a [`RequestContext`] and must resolve it
//! exactly once via `success`/`error`, optionally sending any number of
//! progress notifications first via `notification`. Handlers run as
//! detached tasks raced against a per-method timeout by `ConnectionCore`;
//! this module only owns naming, registration, and the terminal-once
//! bookkeeping.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{ContextError, MethodError};
use crate::frame::ErrorObject;

const RESERVED_NAMESPACES: [&str; 4] = ["system", "internal", "stream", "helios"];

/// The namespace the state-refresh RPC (`starling:state`) lives under. Not
/// one of the server-defined `RESERVED_NAMESPACES`, but callable-not-
/// registrable all the same: it names this client's own protocol-level
/// machinery, not an application method.
const PROTOCOL_NAMESPACE: &str = "starling";

/// Validates a method name as it may be *registered* by application code.
/// Stricter than the wire method regex: no dots, namespace convention is
/// `namespace:action`.
pub fn validate_registered_method_name(name: &str) -> Result<(), MethodError> {
    if name.len() < 3 {
        return Err(MethodError::InvalidName(name.to_string()));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphabetic() {
        return Err(MethodError::InvalidName(name.to_string()));
    }
    if !chars.all(|c| c.is_alphanumeric() || c == '_' || c == ':') {
        return Err(MethodError::InvalidName(name.to_string()));
    }

    let namespace = name.split(':').next().unwrap_or(name);
    if RESERVED_NAMESPACES.contains(&namespace) || namespace == PROTOCOL_NAMESPACE {
        return Err(MethodError::NamespaceReserved(namespace.to_string()));
    }

    Ok(())
}

/// Messages a [`RequestContext`] sends back toward the reactor while a
/// handler is running.
#[derive(Debug, Clone)]
pub enum ContextMessage {
    Notification(Value),
    Success(Value),
    Error(ErrorObject),
}

/// Handed to a registered method handler for exactly one inbound request.
/// Resolving it (`success` or `error`) is terminal; any call after that
/// returns [`ContextError::AlreadyFinished`].
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub method: String,
    pub timestamp: u64,
    payload: Option<Value>,
    options: Option<Value>,
    finished: Arc<AtomicBool>,
    messages: tokio::sync::mpsc::UnboundedSender<ContextMessage>,
}

impl RequestContext {
    pub fn new(
        request_id: Uuid,
        method: String,
        timestamp: u64,
        payload: Option<Value>,
        options: Option<Value>,
        finished: Arc<AtomicBool>,
        messages: tokio::sync::mpsc::UnboundedSender<ContextMessage>,
    ) -> Self {
        Self {
            request_id,
            method,
            timestamp,
            payload,
            options,
            finished,
            messages,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn options(&self) -> Option<&Value> {
        self.options.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Send a progress notification. Has no effect on the terminal state.
    pub fn notify(&self, data: Value) -> Result<(), ContextError> {
        if self.is_finished() {
            return Err(ContextError::AlreadyFinished);
        }
        let _ = self.messages.send(ContextMessage::Notification(data));
        Ok(())
    }

    /// Resolve the request successfully. Terminal.
    pub fn success(&self, data: Value) -> Result<(), ContextError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(ContextError::AlreadyFinished);
        }
        let _ = self.messages.send(ContextMessage::Success(data));
        Ok(())
    }

    /// Resolve the request with an error. Terminal.
    pub fn error(&self, error: ErrorObject) -> Result<(), ContextError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(ContextError::AlreadyFinished);
        }
        let _ = self.messages.send(ContextMessage::Error(error));
        Ok(())
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type MethodHandler = Arc<dyn Fn(RequestContext) -> HandlerFuture + Send + Sync>;

pub struct MethodEntry {
    pub handler: MethodHandler,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MethodOptions {
    pub timeout_ms: Option<u64>,
}

/// Registered server-callable method handlers, keyed by name.
///
/// Owned exclusively by `ConnectionCore`'s reactor task.
#[derive(Default)]
pub struct MethodRegistry {
    default_timeout_ms: u64,
    methods: HashMap<String, MethodEntry>,
}

impl MethodRegistry {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            default_timeout_ms,
            methods: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        handler: MethodHandler,
        options: MethodOptions,
    ) -> Result<(), MethodError> {
        validate_registered_method_name(name)?;
        if self.methods.contains_key(name) {
            return Err(MethodError::AlreadyRegistered(name.to_string()));
        }
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                handler,
                timeout_ms: options.timeout_ms.unwrap_or(self.default_timeout_ms),
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> MethodHandler {
        Arc::new(|ctx: RequestContext| -> HandlerFuture {
            Box::pin(async move {
                let _ = ctx.success(Value::Null);
            })
        })
    }

    #[test]
    fn registers_valid_method() {
        let mut registry = MethodRegistry::new(30_000);
        assert!(registry
            .register("users:get", noop_handler(), MethodOptions::default())
            .is_ok());
        assert!(registry.is_registered("users:get"));
    }

    #[test]
    fn rejects_short_name() {
        let mut registry = MethodRegistry::new(30_000);
        let err = registry
            .register("ab", noop_handler(), MethodOptions::default())
            .unwrap_err();
        assert!(matches!(err, MethodError::InvalidName(_)));
    }

    #[test]
    fn rejects_reserved_namespace() {
        let mut registry = MethodRegistry::new(30_000);
        let err = registry
            .register("system:ping", noop_handler(), MethodOptions::default())
            .unwrap_err();
        assert!(matches!(err, MethodError::NamespaceReserved(_)));
    }

    #[test]
    fn rejects_protocol_namespace() {
        let mut registry = MethodRegistry::new(30_000);
        let err = registry
            .register("starling:state", noop_handler(), MethodOptions::default())
            .unwrap_err();
        assert!(matches!(err, MethodError::NamespaceReserved(_)));
    }

    #[test]
    fn rejects_duplicate_registration() {
        let mut registry = MethodRegistry::new(30_000);
        registry
            .register("users:get", noop_handler(), MethodOptions::default())
            .unwrap();
        let err = registry
            .register("users:get", noop_handler(), MethodOptions::default())
            .unwrap_err();
        assert!(matches!(err, MethodError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn context_cannot_resolve_twice() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RequestContext::new(
            Uuid::new_v4(),
            "users:get".to_string(),
            0,
            None,
            None,
            Arc::new(AtomicBool::new(false)),
            tx,
        );
        ctx.success(Value::Null).unwrap();
        let err = ctx.success(Value::Null).unwrap_err();
        assert_eq!(err, ContextError::AlreadyFinished);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ContextMessage::Success(_)
        ));
    }

    #[tokio::test]
    async fn notify_after_finish_is_rejected() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = RequestContext::new(
            Uuid::new_v4(),
            "users:get".to_string(),
            0,
            None,
            None,
            Arc::new(AtomicBool::new(false)),
            tx,
        );
        ctx.error(ErrorObject::new("E", "failed")).unwrap();
        assert_eq!(
            ctx.notify(Value::Null).unwrap_err(),
            ContextError::AlreadyFinished
        );
    }
}
