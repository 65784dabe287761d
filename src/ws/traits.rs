//! Core traits for generic WebSocket infrastructure.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Message parser trait for converting raw bytes to messages.
///
/// # Example
///
/// ```ignore
/// pub struct SimpleParser;
///
/// impl MessageParser<MyMessage> for SimpleParser {
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<MyMessage>> {
///         let msg: MyMessage = serde_json::from_slice(bytes)?;
///         Ok(vec![msg])
///     }
/// }
/// ```
pub trait MessageParser<M: DeserializeOwned>: Send + Sync + 'static {
    /// Parse incoming bytes into messages.
    ///
    /// Handles both single objects and arrays of messages.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>>;
}

/// Outbound half of a connection as seen by the subscription layer.
///
/// Implemented by [`ConnectionManager`](super::ConnectionManager); tests swap in
/// a recording sink so subscription bookkeeping can be checked without a socket.
pub trait FrameSink: Send + Sync + 'static {
    /// Queue a JSON frame for the open connection.
    ///
    /// Fails with [`WsError::NotConnected`](super::WsError::NotConnected) when
    /// no connection is open.
    fn send_frame<R: Serialize>(&self, frame: &R) -> crate::Result<()>;
}

impl<T: FrameSink> FrameSink for Arc<T> {
    fn send_frame<R: Serialize>(&self, frame: &R) -> crate::Result<()> {
        (**self).send_frame(frame)
    }
}
