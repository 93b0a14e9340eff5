//! Transport abstraction over the WebSocket wire.
//!
//! Generalizes the trait-bound socket helpers used for a DEALER socket into
//! a `Stream`+`Sink` bound any duplex WebSocket connection satisfies, so
//! `ConnectionCore` never needs to know whether it is talking to
//! `tokio-tungstenite` or a fake peer spun up for a test.

use futures::{Sink, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Anything that can send and receive WebSocket messages.
pub trait Transport:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

/// Dial a WebSocket server, optionally appending a `?recover=<token>` query
/// parameter for session recovery.
pub async fn connect(
    url: &str,
    recovery_token: Option<&str>,
) -> Result<impl Transport, WsError> {
    let dial_url = match recovery_token {
        Some(token) => append_recover_param(url, token),
        None => url.to_string(),
    };
    let (stream, _response) = tokio_tungstenite::connect_async(dial_url).await?;
    Ok(stream)
}

fn append_recover_param(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}recover={token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_recover_param_without_existing_query() {
        assert_eq!(
            append_recover_param("wss://example/ws", "abc"),
            "wss://example/ws?recover=abc"
        );
    }

    #[test]
    fn appends_recover_param_with_existing_query() {
        assert_eq!(
            append_recover_param("wss://example/ws?foo=bar", "abc"),
            "wss://example/ws?foo=bar&recover=abc"
        );
    }
}
