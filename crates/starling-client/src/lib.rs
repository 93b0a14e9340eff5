//! Client library for the Helios-Starling application protocol: JSON-framed
//! RPC plus topic pub/sub over a WebSocket, with automatic reconnection,
//! offline send buffering, and server-assisted session recovery.
//!
//! The connection is driven by a single reactor task (`ConnectionCore`,
//! realized as [`connection::ConnectionReactor`]) that exclusively owns the
//! transport and every mutable component. Application code talks to it
//! through [`StarlingClient`], a cheaply cloneable handle:
//!
//! ```no_run
//! use starling_client::StarlingClient;
//! use starling_config::StarlingConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StarlingConfig::load()?;
//! let client = StarlingClient::new(config);
//! client.connect().await?;
//!
//! let handle = client.request("users:get", Some(serde_json::json!({"id": 1})), Default::default()).await?;
//! let response = handle.await?;
//! println!("{response}");
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`frame`] - the wire format (`Frame`/`ProtocolFrame`) and
//!   [`frame::MessageCodec`].
//! - [`event_bus`] - synchronous lifecycle pub/sub ([`event_bus::EventBus`]).
//! - [`send_buffer`] - bounded offline outbound queue.
//! - [`request_registry`] - client-initiated request/response correlation.
//! - [`method_registry`] - server-callable method registration and dispatch.
//! - [`topic_router`] - topic-pattern notification routing.
//! - [`reconnect`] - exponential backoff bookkeeping.
//! - [`state_manager`] - recovery-token refresh policy.
//! - [`transport`] - the `Stream`+`Sink` abstraction over the socket.
//! - [`connection`] - `ConnectionCore`'s reactor task and [`StarlingClient`].

pub mod connection;
pub mod error;
pub mod event_bus;
pub mod frame;
pub mod method_registry;
pub mod reconnect;
pub mod request_registry;
pub mod send_buffer;
pub mod state_manager;
pub mod topic_router;
pub mod transport;

pub use connection::{StarlingClient, SubscriptionId};
pub use error::{ConnectError, ContextError, MethodError, RequestError, StateError, TopicError};
pub use event_bus::{Disposer, Event, EventBus};
pub use frame::{ErrorObject, Frame, ProtocolFrame};
pub use method_registry::{MethodOptions, RequestContext};
pub use reconnect::ReconnectMetrics;
pub use request_registry::{RequestHandle, RequestOptions};
pub use state_manager::StateMetrics;
pub use topic_router::TopicOptions;
pub use state_manager::RecoveryToken;
