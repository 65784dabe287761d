#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use backoff::backoff::{Backoff as _, Constant};
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::error::WsError;
use super::traits::{FrameSink, MessageParser};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// No-op frame sent on every keepalive tick.
pub const KEEPALIVE_FRAME: &str = r#"{"ping":1}"#;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but `connect` has not been called yet
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the reconnect delay after a lost connection or failed attempt
    Reconnecting {
        /// Consecutive failed connection attempts so far
        attempt: u32,
    },
    /// Shut down by `disconnect` or by an exhausted reconnect policy
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if the connection has reached its terminal state.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Lifecycle notifications emitted by the connection task, in arrival order.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnectionEvent<M> {
    /// A socket opened. `reconnect` is `false` only for the very first open.
    Opened {
        /// Whether a socket had been opened before this one
        reconnect: bool,
    },
    /// A parsed inbound message
    Message(M),
    /// An open socket went away, or the loop stopped for good after one had
    /// been open.
    ///
    /// `Closed { reconnecting: false }` is always the last event once a socket
    /// has opened. It may follow a `Closed { reconnecting: true }` when the
    /// reconnect policy runs out.
    Closed {
        /// `true` when the reconnect loop will try again, `false` once it has stopped
        reconnecting: bool,
    },
}

/// Pieces moved into the connection task on the first `connect`.
struct Startup<M, P> {
    sender_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent<M>>,
    parser: P,
}

/// Manages the WebSocket connection lifecycle, reconnection, and keepalive.
///
/// A single socket is open at a time. It is replaced on every reconnect cycle;
/// frames queued for a socket that went away are discarded rather than replayed.
///
/// # Type Parameters
///
/// - `M`: Message type that implements [`DeserializeOwned`]
/// - `P`: Parser type that implements [`MessageParser<M>`]
///
/// # Example
///
/// ```ignore
/// let connection = ConnectionManager::new(url, Config::default(), FrameParser);
/// let mut events = connection.take_events().unwrap();
/// connection.connect()?;
///
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager<M, P>
where
    M: DeserializeOwned + Debug + Send + 'static,
    P: MessageParser<M>,
{
    endpoint: String,
    config: Config,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Watch channel receiver for checking the current state
    state_rx: watch::Receiver<ConnectionState>,
    /// Sender channel for outgoing frames
    sender_tx: mpsc::UnboundedSender<String>,
    startup: Arc<Mutex<Option<Startup<M, P>>>>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent<M>>>>>,
    cancel: CancellationToken,
}

impl<M, P> ConnectionManager<M, P>
where
    M: DeserializeOwned + Debug + Send + 'static,
    P: MessageParser<M>,
{
    /// Create a new connection manager in the [`ConnectionState::Idle`] state.
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called.
    pub fn new(endpoint: String, config: Config, parser: P) -> Self {
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        Self {
            endpoint,
            config,
            state_tx,
            state_rx,
            sender_tx,
            startup: Arc::new(Mutex::new(Some(Startup {
                sender_rx,
                events_tx,
                parser,
            }))),
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the connection loop in a background task.
    ///
    /// Calling this while the loop is already running does nothing. Calling it
    /// after [`disconnect`](Self::disconnect) fails with
    /// [`WsError::ConnectionClosed`].
    pub fn connect(&self) -> Result<()> {
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(Startup {
            sender_rx,
            events_tx,
            parser,
        }) = startup
        else {
            if self.state().is_closed() {
                return Err(WsError::ConnectionClosed.into());
            }
            return Ok(());
        };

        tokio::spawn(Self::connection_loop(
            self.endpoint.clone(),
            self.config.clone(),
            sender_rx,
            events_tx,
            parser,
            self.state_tx.clone(),
            self.cancel.clone(),
        ));

        Ok(())
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        self.cancel.cancel();

        // Never started, so no task will report the transition
        let never_started = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if never_started {
            self.state_tx.send_replace(ConnectionState::Closed);
        }
    }

    /// Main connection loop with fixed-delay reconnection.
    async fn connection_loop(
        endpoint: String,
        config: Config,
        mut sender_rx: mpsc::UnboundedReceiver<String>,
        events_tx: mpsc::UnboundedSender<ConnectionEvent<M>>,
        parser: P,
        state_tx: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let mut attempt = 0_u32;
        let mut opened = 0_u64;
        let mut backoff: Constant = config.reconnect.clone().into();

        loop {
            state_tx.send_replace(ConnectionState::Connecting);

            let connected = tokio::select! {
                () = cancel.cancelled() => break,
                result = connect_async(endpoint.as_str()) => result,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    attempt = 0;
                    backoff.reset();
                    opened = opened.saturating_add(1);

                    // Frames queued for the previous socket are stale
                    let mut discarded = 0_usize;
                    while sender_rx.try_recv().is_ok() {
                        discarded += 1;
                    }
                    #[cfg(feature = "tracing")]
                    if discarded > 0 {
                        tracing::debug!(discarded, "Dropped frames queued for a closed socket");
                    }
                    #[cfg(not(feature = "tracing"))]
                    let _ = discarded;

                    state_tx.send_replace(ConnectionState::Connected {
                        since: Instant::now(),
                    });
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%endpoint, opened, "WebSocket connected");
                    _ = events_tx.send(ConnectionEvent::Opened {
                        reconnect: opened > 1,
                    });

                    match Self::handle_connection(
                        ws_stream,
                        &mut sender_rx,
                        &events_tx,
                        &config,
                        &parser,
                        &cancel,
                    )
                    .await
                    {
                        // Disconnect requested
                        Ok(()) => break,
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("Connection lost: {e:?}");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;

                            state_tx.send_replace(ConnectionState::Reconnecting { attempt });
                            _ = events_tx.send(ConnectionEvent::Closed { reconnecting: true });
                        }
                    }
                }
                Err(e) => {
                    let error = crate::error::Error::from(e);
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Unable to connect: {error:?}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &error;
                    attempt = attempt.saturating_add(1);
                }
            }

            if config.reconnect.is_exhausted(attempt) {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, "Reconnect attempts exhausted, giving up");
                break;
            }

            state_tx.send_replace(ConnectionState::Reconnecting { attempt });

            if let Some(duration) = backoff.next_backoff() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = sleep(duration) => {}
                }
            }
        }

        state_tx.send_replace(ConnectionState::Closed);
        // Sent after an exhausted reconnect policy too
        if opened > 0 {
            _ = events_tx.send(ConnectionEvent::Closed {
                reconnecting: false,
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%endpoint, "WebSocket connection loop stopped");
    }

    /// Handle an active WebSocket connection.
    ///
    /// Returns `Ok` only when shutdown was requested; every other exit is an
    /// unexpected close.
    async fn handle_connection(
        ws_stream: WsStream,
        sender_rx: &mut mpsc::UnboundedReceiver<String>,
        events_tx: &mpsc::UnboundedSender<ConnectionEvent<M>>,
        config: &Config,
        parser: &P,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        let period = config.keepalive_interval;
        let mut keepalive = interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                // Handle incoming messages
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");

                            match parser.parse(text.as_bytes()) {
                                Ok(messages) => {
                                    for message in messages {
                                        _ = events_tx.send(ConnectionEvent::Message(message));
                                    }
                                }
                                Err(e) => {
                                    #[cfg(feature = "tracing")]
                                    tracing::warn!(%text, error = %e, "Failed to parse WebSocket message");
                                    #[cfg(not(feature = "tracing"))]
                                    let _ = (&text, &e);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(WsError::ConnectionClosed.into());
                        }
                        Some(Err(e)) => return Err(WsError::Connection(e).into()),
                        Some(Ok(_)) => {
                            // Binary frames and protocol-level ping/pong are not part of the API
                        }
                    }
                }

                // Outgoing frames from the subscription layer
                outgoing = sender_rx.recv() => {
                    let Some(text) = outgoing else {
                        // Every manager handle is gone
                        _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    write
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(WsError::Connection)?;
                }

                _ = keepalive.tick() => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Sending keepalive");
                    write
                        .send(Message::Text(KEEPALIVE_FRAME.into()))
                        .await
                        .map_err(WsError::Connection)?;
                }
            }
        }
    }

    /// Queue a frame for the open connection.
    ///
    /// Fails with [`WsError::NotConnected`] unless the state is
    /// [`ConnectionState::Connected`].
    pub fn send<R: Serialize>(&self, request: &R) -> Result<()> {
        if !self.state().is_connected() {
            return Err(WsError::NotConnected.into());
        }

        let json = serde_json::to_string(request)?;
        self.sender_tx
            .send(json)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the connection is open.
    ///
    /// Fails with [`WsError::ConnectionClosed`] if the manager shuts down first.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        let state = *state_rx
            .wait_for(|state| state.is_connected() || state.is_closed())
            .await
            .map_err(|_e| WsError::ConnectionClosed)?;

        if state.is_connected() {
            Ok(())
        } else {
            Err(WsError::ConnectionClosed.into())
        }
    }

    /// Take the receiver of [`ConnectionEvent`]s.
    ///
    /// There is exactly one receiver; later calls return `None`.
    #[must_use]
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent<M>>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<M, P> FrameSink for ConnectionManager<M, P>
where
    M: DeserializeOwned + Debug + Send + 'static,
    P: MessageParser<M>,
{
    fn send_frame<R: Serialize>(&self, frame: &R) -> Result<()> {
        self.send(frame)
    }
}
