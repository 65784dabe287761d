//! Core WebSocket infrastructure.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns the single socket, keepalive, and fixed-delay reconnection
//! - [`MessageParser`]: Trait for parsing incoming WebSocket messages
//! - [`FrameSink`]: Outbound seam used by the subscription layer
//!
//! # Example
//!
//! ```ignore
//! let connection = ConnectionManager::new(url, Config::default(), FrameParser);
//! let events = connection.take_events();
//! connection.connect()?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod traits;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
