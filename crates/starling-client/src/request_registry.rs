//! Client-initiated request bookkeeping: correlates outbound requests with
//! their eventual response or timeout, and fans out progress notifications.
//!
//! Mirrors the pending-request table in a ZeroMQ DEALER client, generalized
//! from a single response channel per request to a response channel plus an
//! open-ended progress stream, since Helios-Starling lets a handler emit
//! notifications before it resolves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::RequestError;
use crate::frame::ErrorObject;

/// Per-request options, mirroring the wire `options` object.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the registry's default timeout for this request.
    pub timeout_ms: Option<u64>,
    /// If `false`, the request is not buffered while disconnected; it
    /// fails immediately with `RequestError::ConnectionClosed` instead.
    pub retry: bool,
    pub metadata: Option<Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self {
            retry: true,
            ..Default::default()
        }
    }
}

struct PendingRequest {
    response_tx: Option<oneshot::Sender<Result<Value, RequestError>>>,
    notification_tx: mpsc::UnboundedSender<Value>,
    deadline: Instant,
}

/// A handle to an in-flight request. Awaiting it resolves to the final
/// response; `on_progress` may be called any number of times before that to
/// observe intermediate notifications the handler sent.
pub struct RequestHandle {
    pub id: Uuid,
    response_rx: oneshot::Receiver<Result<Value, RequestError>>,
    notification_rx: Option<mpsc::UnboundedReceiver<Value>>,
    cancel_tx: mpsc::UnboundedSender<(Uuid, String)>,
}

impl RequestHandle {
    /// Subscribe to progress/notification messages delivered before the
    /// final response. `onNotification` in the wire protocol's vocabulary;
    /// provided as an alias below since the two names refer to the same
    /// stream.
    pub fn on_progress<F>(&mut self, mut f: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        if let Some(mut rx) = self.notification_rx.take() {
            tokio::spawn(async move {
                while let Some(value) = rx.recv().await {
                    f(value);
                }
            });
        }
    }

    pub fn on_notification<F>(&mut self, f: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.on_progress(f);
    }

    /// Cancel the request. The eventual response resolves to
    /// `RequestError::Cancelled`.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.cancel_tx.send((self.id, reason.into()));
    }
}

impl Future for RequestHandle {
    type Output = Result<Value, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.response_rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Tracks every outstanding client-initiated request.
///
/// Owned exclusively by `ConnectionCore`'s reactor task; the periodic sweep
/// is driven by the reactor's own interval, mirroring the health-check
/// cadence of a Lazy Pirate style client.
#[derive(Default)]
pub struct RequestRegistry {
    pending: HashMap<Uuid, PendingRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request and return the handle given back to
    /// the caller, retaining the sender halves internally for later
    /// resolution by `complete`/`fail`/`deliver_progress`.
    pub fn track(
        &mut self,
        id: Uuid,
        timeout_ms: u64,
        cancel_tx: mpsc::UnboundedSender<(Uuid, String)>,
    ) -> RequestHandle {
        let (response_tx, response_rx) = oneshot::channel();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();

        self.pending.insert(
            id,
            PendingRequest {
                response_tx: Some(response_tx),
                notification_tx,
                deadline: Instant::now() + Duration::from_millis(timeout_ms),
            },
        );

        RequestHandle {
            id,
            response_rx,
            notification_rx: Some(notification_rx),
            cancel_tx,
        }
    }

    pub fn deliver_progress(&mut self, id: Uuid, data: Value) {
        if let Some(req) = self.pending.get(&id) {
            let _ = req.notification_tx.send(data);
        }
    }

    pub fn complete(&mut self, id: Uuid, data: Value) {
        if let Some(mut req) = self.pending.remove(&id) {
            if let Some(tx) = req.response_tx.take() {
                let _ = tx.send(Ok(data));
            }
        }
    }

    pub fn fail(&mut self, id: Uuid, error: ErrorObject) {
        if let Some(mut req) = self.pending.remove(&id) {
            if let Some(tx) = req.response_tx.take() {
                let _ = tx.send(Err(RequestError::Failed(error)));
            }
        }
    }

    pub fn cancel(&mut self, id: Uuid, reason: String) {
        if let Some(mut req) = self.pending.remove(&id) {
            if let Some(tx) = req.response_tx.take() {
                let _ = tx.send(Err(RequestError::Cancelled { reason }));
            }
        }
    }

    /// Resolve every still-pending request as disconnected, for use when
    /// the connection drops with no prospect of a buffered retry.
    pub fn cancel_all(&mut self, reason: &str) {
        for (_, mut req) in self.pending.drain() {
            if let Some(tx) = req.response_tx.take() {
                let _ = tx.send(Err(RequestError::Cancelled {
                    reason: reason.to_string(),
                }));
            }
        }
    }

    /// Resolve every request whose deadline has passed as timed out.
    /// Returns the number swept, for logging.
    pub fn sweep_timeouts(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(mut req) = self.pending.remove(id) {
                if let Some(tx) = req.response_tx.take() {
                    let _ = tx.send(Err(RequestError::Timeout));
                }
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_the_handle() {
        let mut registry = RequestRegistry::new();
        let (cancel_tx, _cancel_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let handle = registry.track(id, 30_000, cancel_tx);
        registry.complete(id, serde_json::json!({"ok": true}));
        let result = handle.await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn fail_resolves_with_request_error() {
        let mut registry = RequestRegistry::new();
        let (cancel_tx, _cancel_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let handle = registry.track(id, 30_000, cancel_tx);
        registry.fail(id, ErrorObject::new("E_BOOM", "boom"));
        let err = handle.await.unwrap_err();
        assert!(matches!(err, RequestError::Failed(_)));
    }

    #[tokio::test]
    async fn progress_delivered_before_completion() {
        let mut registry = RequestRegistry::new();
        let (cancel_tx, _cancel_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let mut handle = registry.track(id, 30_000, cancel_tx);

        let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let r = std::sync::Arc::clone(&received);
        handle.on_progress(move |v| r.lock().unwrap().push(v));

        registry.deliver_progress(id, serde_json::json!(1));
        registry.deliver_progress(id, serde_json::json!(2));
        registry.complete(id, serde_json::json!("done"));

        let result = handle.await.unwrap();
        assert_eq!(result, serde_json::json!("done"));
        // Give the forwarding task a chance to drain before asserting.
        tokio::task::yield_now().await;
        assert_eq!(
            *received.lock().unwrap(),
            vec![serde_json::json!(1), serde_json::json!(2)]
        );
    }

    #[tokio::test]
    async fn sweep_times_out_expired_requests() {
        let mut registry = RequestRegistry::new();
        let (cancel_tx, _cancel_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let handle = registry.track(id, 0, cancel_tx);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let swept = registry.sweep_timeouts();
        assert_eq!(swept, 1);
        assert!(matches!(handle.await.unwrap_err(), RequestError::Timeout));
    }

    #[tokio::test]
    async fn cancel_all_resolves_every_pending_request() {
        let mut registry = RequestRegistry::new();
        let (cancel_tx, _cancel_rx) = mpsc::unbounded_channel();
        let h1 = registry.track(Uuid::new_v4(), 30_000, cancel_tx.clone());
        let h2 = registry.track(Uuid::new_v4(), 30_000, cancel_tx);
        registry.cancel_all("connection closed");
        assert!(matches!(
            h1.await.unwrap_err(),
            RequestError::Cancelled { .. }
        ));
        assert!(matches!(
            h2.await.unwrap_err(),
            RequestError::Cancelled { .. }
        ));
    }
}
