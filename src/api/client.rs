use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::endpoint::Endpoint;
use super::fingerprint::Fingerprint;
use super::lifecycle::Lifecycle;
use super::pending::{PendingRequests, RequestIds};
use super::registry::{ConsumerId, FrameParser, SubscriptionRegistry};
use super::types::request::Request;
use super::types::response::Response;
use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::ws::WsError;

/// The connection type the client drives.
pub type Connection = ConnectionManager<Response, FrameParser>;

type Registry = SubscriptionRegistry<Connection>;

/// Client for the Deriv WebSocket API.
///
/// Owns one connection, deduplicates subscriptions over it and correlates
/// one-shot requests with their responses. Cloning is cheap; the connection
/// closes when the last clone is dropped or [`shutdown`](Self::shutdown) is
/// called.
///
/// # Examples
///
/// ```rust, no_run
/// use deriv_api_client::api::{Client, Endpoint};
/// use deriv_api_client::ws::config::Config;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let endpoint = Endpoint::builder().app_id(1089).build();
///     let client = Client::for_endpoint(&endpoint, Config::default())?;
///     client.wait_connected().await?;
///
///     let ticks = client.subscribe("ticks", &json!({ "ticks": "R_100" }))?;
///     let _listener = ticks.subscribe(|tick| println!("{tick:?}"))?;
///
///     let time = client.request(&json!({ "time": 1 })).await?;
///     println!("server time: {:?}", time.data());
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Base endpoint for the WebSocket
    endpoint: String,
    connection: Connection,
    registry: Arc<Registry>,
    pending: Arc<PendingRequests>,
    lifecycle: Arc<Lifecycle>,
    /// Shared with the registry so subscriptions and requests never reuse a `req_id`
    ids: Arc<RequestIds>,
    torn_down: Arc<AtomicBool>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

impl Client {
    /// Create a client for `endpoint` and start connecting in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        url::Url::parse(endpoint)?;

        let resubscribe = config.resubscribe_on_reconnect;
        let connection = Connection::new(endpoint.to_owned(), config, FrameParser);
        let events = connection
            .take_events()
            .ok_or_else(|| Error::validation("connection events already taken"))?;

        let ids = Arc::new(RequestIds::default());
        let registry = Arc::new(SubscriptionRegistry::new(
            connection.clone(),
            Arc::clone(&ids),
        ));
        let pending = Arc::new(PendingRequests::default());
        let lifecycle = Arc::new(Lifecycle::default());
        let torn_down = Arc::new(AtomicBool::new(false));

        let router = Router {
            registry: Arc::clone(&registry),
            pending: Arc::clone(&pending),
            lifecycle: Arc::clone(&lifecycle),
            torn_down: Arc::clone(&torn_down),
            resubscribe,
        };
        tokio::spawn(router.run(events));

        connection.connect()?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint: endpoint.to_owned(),
                connection,
                registry,
                pending,
                lifecycle,
                ids,
                torn_down,
            }),
        })
    }

    /// Create a client for the URL built from `endpoint`.
    pub fn for_endpoint(endpoint: &Endpoint, config: Config) -> Result<Self> {
        Self::new(&endpoint.url()?, config)
    }

    /// The URL this client connects to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// The underlying connection, for sending raw frames.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Describe a subscription to the `name` stream with request `payload`.
    ///
    /// Nothing is sent until a consumer attaches with
    /// [`Subscription::subscribe`] or [`Subscription::stream`]. Handles for
    /// the same `(name, payload)` share one server-side subscription.
    ///
    /// `payload` must serialize to a JSON object or `null`.
    pub fn subscribe<P: Serialize>(&self, name: &str, payload: &P) -> Result<Subscription> {
        let payload = serde_json::to_value(payload)?;
        if !(payload.is_object() || payload.is_null()) {
            return Err(Error::validation(format!(
                "subscription payload for {name} must be a JSON object"
            )));
        }

        Ok(Subscription {
            id: Fingerprint::of(name, &payload),
            name: name.to_owned(),
            payload,
            registry: Arc::clone(&self.inner.registry),
        })
    }

    /// Stop the subscription identified by `id`, dropping all of its consumers.
    ///
    /// Unknown or already stopped ids are ignored.
    pub fn unsubscribe(&self, id: &Fingerprint) {
        self.inner.registry.unsubscribe(id);
    }

    /// Send a one-shot request and wait for the response carrying its `req_id`.
    ///
    /// Server-side errors surface as [`Kind::Api`](crate::error::Kind::Api).
    /// Fails with [`WsError::NotConnected`] when no connection is open and
    /// with [`WsError::ConnectionClosed`] when the connection drops first.
    pub async fn request<R: Serialize>(&self, request: &R) -> Result<Response> {
        let payload = serde_json::to_value(request)?;
        let req_id = self.inner.ids.next();
        let request = Request::new(&payload, req_id)?;

        let response = self.inner.pending.register(req_id);
        if let Err(e) = self.inner.connection.send(&request) {
            self.inner.pending.cancel(req_id);
            return Err(e);
        }

        let response = response.await.map_err(|_e| WsError::ConnectionClosed)??;
        response.into_result()
    }

    /// Run `callback` once the connection is open.
    ///
    /// Runs immediately when it already is; otherwise on the next open. Replaces
    /// a callback registered earlier that has not run yet.
    pub fn set_on_connected<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(callback) = self.inner.lifecycle.set_on_connected(Box::new(callback)) {
            callback();
        }
    }

    /// Run `callback` after every reconnect, never on the first open.
    ///
    /// Replaces a callback registered earlier.
    pub fn set_on_reconnected<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lifecycle.set_on_reconnected(Arc::new(callback));
    }

    /// Get the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Resolve once the connection is open.
    pub async fn wait_connected(&self) -> Result<()> {
        self.inner.connection.wait_connected().await
    }

    /// Number of live server-side subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.subscription_count()
    }

    /// Number of one-shot requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Close the connection for good.
    ///
    /// Live subscriptions are unsubscribed best-effort and their consumers
    /// dropped without further calls. Pending requests fail with
    /// [`WsError::ConnectionClosed`]. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.inner.endpoint, "Shutting down client");

        self.inner.connection.disconnect();
        self.inner.registry.teardown();
        self.inner.pending.reject_all();
    }
}

/// Consumes connection events on a single task, so frames are handled in
/// arrival order.
struct Router {
    registry: Arc<Registry>,
    pending: Arc<PendingRequests>,
    lifecycle: Arc<Lifecycle>,
    torn_down: Arc<AtomicBool>,
    resubscribe: bool,
}

impl Router {
    async fn run(self, mut events: mpsc::UnboundedReceiver<ConnectionEvent<Response>>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Event router stopped");
    }

    fn handle(&self, event: ConnectionEvent<Response>) {
        match event {
            ConnectionEvent::Opened { reconnect } => {
                if reconnect && self.resubscribe {
                    self.registry.resubscribe_all();
                }
                self.lifecycle.opened(reconnect).run();
            }
            ConnectionEvent::Message(response) => {
                if self.torn_down.load(Ordering::Acquire) {
                    return;
                }
                let Some(response) = self.registry.dispatch(response) else {
                    return;
                };
                if let Some(response) = self.pending.resolve(response) {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(
                        msg_type = %response.msg_type,
                        req_id = ?response.req_id,
                        "Dropping unmatched response"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = &response;
                }
            }
            ConnectionEvent::Closed { reconnecting } => {
                self.lifecycle.closed();
                self.pending.reject_all();
                if self.torn_down.load(Ordering::Acquire) {
                    return;
                }
                if reconnecting && self.resubscribe {
                    self.registry.mark_stale();
                } else {
                    self.registry.invalidate();
                }
            }
        }
    }
}

/// A deduplicated subscription to one `(name, payload)` stream.
///
/// Obtained from [`Client::subscribe`]. The subscribe frame is sent when the
/// first consumer attaches; the unsubscribe frame when the last one leaves.
#[derive(Clone)]
pub struct Subscription {
    id: Fingerprint,
    name: String,
    payload: Value,
    registry: Arc<Registry>,
}

impl Subscription {
    /// Identifier shared by every handle for the same `(name, payload)`.
    #[must_use]
    pub fn id(&self) -> &Fingerprint {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a consumer.
    ///
    /// `on_data` receives every frame of the stream in arrival order, or an
    /// error once if the server rejects the subscription or the connection
    /// drops. Fails with [`WsError::NotConnected`] when the subscribe frame
    /// cannot be sent.
    pub fn subscribe<F>(&self, on_data: F) -> Result<Listener>
    where
        F: Fn(Result<Response>) + Send + Sync + 'static,
    {
        let consumer = self.registry.subscribe(&self.name, &self.payload, on_data)?;
        Ok(Listener {
            consumer,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Attach a consumer as a stream. Dropping the stream detaches it.
    ///
    /// The stream ends after an error item or when the subscription is stopped.
    pub fn stream(&self) -> Result<impl Stream<Item = Result<Response>> + use<>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = self.subscribe(move |result| {
            _ = tx.send(result);
        })?;
        // Held by the stream itself so it detaches even if never polled
        let guard = DetachOnDrop(listener);

        Ok(stream! {
            let _guard = guard;
            while let Some(item) = rx.recv().await {
                let failed = item.is_err();
                yield item;
                if failed {
                    break;
                }
            }
        })
    }

    /// Stop the subscription, dropping every consumer attached to it.
    pub fn unsubscribe(&self) {
        self.registry.unsubscribe(&self.id);
    }
}

/// One consumer attached to a [`Subscription`].
#[derive(Clone)]
pub struct Listener {
    consumer: ConsumerId,
    registry: Arc<Registry>,
}

impl Listener {
    #[must_use]
    pub fn id(&self) -> &ConsumerId {
        &self.consumer
    }

    /// Detach this consumer only. The subscription stops once no consumer is left.
    pub fn unsubscribe(&self) {
        self.registry.remove_consumer(&self.consumer);
    }
}

struct DetachOnDrop(Listener);

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}
