//! Deriv API client: subscription multiplexing, request correlation and
//! connection lifecycle callbacks over a single WebSocket.
//!
//! # Overview
//!
//! - [`Client`]: owns the connection and routes every inbound frame
//! - [`Subscription`]: a deduplicated `(name, payload)` stream; any number of
//!   [`Listener`]s share one server-side subscription
//! - [`Endpoint`]: builds the `wss://…/websockets/v3` URL
//!
//! Frames are routed in this order: live subscriptions (by subscription id,
//! then by the `req_id` of the subscribe frame), then pending one-shot
//! requests. Anything else is dropped.
//!
//! # Example
//!
//! ```rust, no_run
//! use deriv_api_client::api::{Client, Endpoint};
//! use deriv_api_client::ws::config::Config;
//! use futures::StreamExt as _;
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = Client::for_endpoint(&Endpoint::from_env()?, Config::default())?;
//! client.wait_connected().await?;
//!
//! let stream = client.subscribe("ticks", &json!({ "ticks": "R_100" }))?.stream()?;
//! let mut stream = Box::pin(stream);
//! while let Some(tick) = stream.next().await {
//!     println!("{:?}", tick?.data());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod error;
pub mod fingerprint;
pub mod lifecycle;
pub mod pending;
pub mod registry;
pub mod types;

pub use client::{Client, Listener, Subscription};
pub use endpoint::Endpoint;
pub use error::ApiError;
pub use fingerprint::Fingerprint;
pub use types::response::Response;
