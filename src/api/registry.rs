#![expect(
    clippy::module_name_repetitions,
    reason = "Registry types deliberately include the module name for clarity"
)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::error::ApiError;
use super::fingerprint::Fingerprint;
use super::pending::RequestIds;
use super::types::request::{ForgetRequest, SubscribeRequest};
use super::types::response::{Response, parse_frames};
use crate::Result;
use crate::error::Error;
use crate::ws::WsError;
use crate::ws::traits::{FrameSink, MessageParser};

/// Consumer callback. Receives every frame of its subscription, or an error
/// when the subscription fails or goes stale.
pub type Callback = Arc<dyn Fn(Result<Response>) + Send + Sync>;

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct FrameParser;

impl MessageParser<Response> for FrameParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<Response>> {
        parse_frames(bytes)
    }
}

/// Handle to one consumer registered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId {
    fingerprint: Fingerprint,
    seq: u64,
}

impl ConsumerId {
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

struct Consumer {
    seq: u64,
    on_data: Callback,
}

/// One deduplicated subscription stream.
struct Entry {
    name: String,
    payload: Value,
    /// `req_id` of the subscribe frame on the current connection
    req_id: u64,
    /// Assigned by the server with the first response
    subscription_id: Option<String>,
    /// Registration order is delivery order
    consumers: Vec<Consumer>,
}

#[derive(Default)]
struct State {
    entries: HashMap<Fingerprint, Entry>,
    /// `req_id` of each entry's subscribe frame on the current connection
    by_req_id: HashMap<u64, Fingerprint>,
    by_subscription_id: HashMap<String, Fingerprint>,
    /// `req_id`s of entries removed before the server assigned an id
    orphans: HashSet<u64>,
    next_consumer: u64,
}

/// What a frame turned into once it was matched to an entry.
enum Delivery {
    Data(Vec<Callback>),
    Failed(Vec<Callback>, ApiError),
}

/// Deduplicates subscriptions by [`Fingerprint`] and fans inbound frames out
/// to their consumers.
///
/// At most one transport-level subscription exists per fingerprint: the first
/// consumer sends the subscribe frame, later consumers attach to the entry,
/// and the unsubscribe frame goes out when the last consumer leaves.
pub struct SubscriptionRegistry<S: FrameSink> {
    sink: S,
    ids: Arc<RequestIds>,
    state: Mutex<State>,
}

impl<S: FrameSink> SubscriptionRegistry<S> {
    #[must_use]
    pub fn new(sink: S, ids: Arc<RequestIds>) -> Self {
        Self {
            sink,
            ids,
            state: Mutex::new(State::default()),
        }
    }

    // No method leaves the state half-updated across a panic point, so a
    // poisoned lock is still consistent.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `on_data` for the stream identified by `(name, payload)`.
    ///
    /// Sends a subscribe frame only when no entry exists for the fingerprint
    /// yet. The entry is created only if that send succeeds.
    pub fn subscribe<F>(&self, name: &str, payload: &Value, on_data: F) -> Result<ConsumerId>
    where
        F: Fn(Result<Response>) + Send + Sync + 'static,
    {
        self.subscribe_callback(name, payload, Arc::new(on_data))
    }

    pub(crate) fn subscribe_callback(
        &self,
        name: &str,
        payload: &Value,
        on_data: Callback,
    ) -> Result<ConsumerId> {
        let fingerprint = Fingerprint::of(name, payload);

        let mut guard = self.state();
        let state = &mut *guard;
        let seq = state.next_consumer;
        state.next_consumer += 1;

        if let Some(entry) = state.entries.get_mut(&fingerprint) {
            entry.consumers.push(Consumer { seq, on_data });
            #[cfg(feature = "tracing")]
            tracing::debug!(
                %name,
                %fingerprint,
                consumers = entry.consumers.len(),
                "Subscription already live, multiplexing"
            );
            return Ok(ConsumerId { fingerprint, seq });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(%name, %fingerprint, "Opening subscription");

        // Sent while holding the lock so a concurrent unsubscribe cannot race it
        let req_id = self.ids.next();
        let request = SubscribeRequest::new(name, payload, req_id)?;
        self.sink.send_frame(&request)?;

        state.by_req_id.insert(req_id, fingerprint.clone());
        state.entries.insert(
            fingerprint.clone(),
            Entry {
                name: name.to_owned(),
                payload: payload.clone(),
                req_id,
                subscription_id: None,
                consumers: vec![Consumer { seq, on_data }],
            },
        );

        Ok(ConsumerId { fingerprint, seq })
    }

    /// Remove one consumer. The last one out stops the stream.
    ///
    /// Unknown or already removed consumers are ignored.
    pub fn remove_consumer(&self, consumer: &ConsumerId) {
        let removed = {
            let mut guard = self.state();
            let state = &mut *guard;

            let Some(entry) = state.entries.get_mut(&consumer.fingerprint) else {
                return;
            };
            let before = entry.consumers.len();
            entry.consumers.retain(|c| c.seq != consumer.seq);
            if entry.consumers.len() == before || !entry.consumers.is_empty() {
                return;
            }

            self.remove_entry(state, &consumer.fingerprint)
        };
        drop(removed);
    }

    /// Remove every consumer of `fingerprint` and stop the stream.
    ///
    /// Unknown or already removed fingerprints are ignored.
    pub fn unsubscribe(&self, fingerprint: &Fingerprint) {
        let removed = {
            let mut guard = self.state();
            self.remove_entry(&mut guard, fingerprint)
        };
        // Consumers are dropped outside the lock
        drop(removed);
    }

    fn remove_entry(&self, state: &mut State, fingerprint: &Fingerprint) -> Option<Entry> {
        let entry = state.entries.remove(fingerprint)?;
        let awaiting_ack = state.by_req_id.remove(&entry.req_id).is_some();

        #[cfg(feature = "tracing")]
        tracing::debug!(name = %entry.name, %fingerprint, "Closing subscription");

        match &entry.subscription_id {
            Some(id) => {
                state.by_subscription_id.remove(id);
                self.forget(id);
            }
            // The id arrives with the first response; forget it then
            None if awaiting_ack => {
                state.orphans.insert(entry.req_id);
            }
            None => {}
        }

        Some(entry)
    }

    fn forget(&self, subscription_id: &str) {
        if let Err(e) = self.sink.send_frame(&ForgetRequest::new(subscription_id)) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%subscription_id, error = %e, "Unsubscribe frame not sent");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    /// Deliver `response` to the consumers of the subscription it belongs to,
    /// in registration order.
    ///
    /// Returns the response back when it belongs to no subscription.
    pub fn dispatch(&self, response: Response) -> Option<Response> {
        let delivery = {
            let mut guard = self.state();
            let state = &mut *guard;

            let by_subscription = response
                .subscription_id()
                .and_then(|id| state.by_subscription_id.get(id).cloned());
            let fingerprint = by_subscription.or_else(|| {
                response
                    .req_id
                    .and_then(|req_id| state.by_req_id.get(&req_id).cloned())
            });

            let Some(fingerprint) = fingerprint else {
                if let Some(req_id) = response.req_id
                    && state.orphans.remove(&req_id)
                {
                    if let Some(id) = response.subscription_id() {
                        self.forget(id);
                    }
                    return None;
                }
                return Some(response);
            };

            if let Some(error) = &response.error {
                let Some(entry) = state.entries.remove(&fingerprint) else {
                    return None;
                };
                state.by_req_id.remove(&entry.req_id);
                if let Some(id) = &entry.subscription_id {
                    state.by_subscription_id.remove(id);
                }

                #[cfg(feature = "tracing")]
                tracing::debug!(name = %entry.name, %error, "Subscription rejected by server");

                Delivery::Failed(
                    entry.consumers.into_iter().map(|c| c.on_data).collect(),
                    error.clone(),
                )
            } else {
                let Some(entry) = state.entries.get_mut(&fingerprint) else {
                    return None;
                };

                if entry.subscription_id.is_none()
                    && let Some(id) = response.subscription_id()
                {
                    entry.subscription_id = Some(id.to_owned());
                    state
                        .by_subscription_id
                        .insert(id.to_owned(), fingerprint.clone());
                }

                Delivery::Data(
                    entry
                        .consumers
                        .iter()
                        .map(|c| Arc::clone(&c.on_data))
                        .collect(),
                )
            }
        };

        // Callbacks run outside the lock so they may subscribe or unsubscribe
        match delivery {
            Delivery::Data(callbacks) => {
                for on_data in &callbacks {
                    on_data(Ok(response.clone()));
                }
            }
            Delivery::Failed(callbacks, error) => {
                for on_data in &callbacks {
                    on_data(Err(error.clone().into()));
                }
            }
        }

        None
    }

    /// Drop every subscription after the connection went away, telling each
    /// consumer once with [`WsError::ConnectionClosed`].
    pub fn invalidate(&self) {
        let entries: Vec<Entry> = {
            let mut guard = self.state();
            let state = &mut *guard;
            state.by_req_id.clear();
            state.by_subscription_id.clear();
            state.orphans.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        #[cfg(feature = "tracing")]
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "Invalidating subscriptions");
        }

        for entry in entries {
            for consumer in entry.consumers {
                (consumer.on_data)(Err(WsError::ConnectionClosed.into()));
            }
        }
    }

    /// Forget server-side ids after the connection went away, keeping every
    /// entry and its consumers for [`resubscribe_all`](Self::resubscribe_all).
    pub fn mark_stale(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        state.by_req_id.clear();
        state.by_subscription_id.clear();
        state.orphans.clear();
        for entry in state.entries.values_mut() {
            entry.subscription_id = None;
        }
    }

    /// Re-send a subscribe frame for every entry.
    ///
    /// Entries whose frame cannot be sent are dropped, and each of their
    /// consumers is told once with the send failure.
    pub fn resubscribe_all(&self) {
        let failed: Vec<(Entry, Error)> = {
            let mut guard = self.state();
            let state = &mut *guard;

            #[cfg(feature = "tracing")]
            if !state.entries.is_empty() {
                tracing::debug!(count = state.entries.len(), "Re-subscribing");
            }

            let mut failed = Vec::new();
            for (fingerprint, entry) in &mut state.entries {
                let req_id = self.ids.next();
                let sent = SubscribeRequest::new(&entry.name, &entry.payload, req_id)
                    .and_then(|request| self.sink.send_frame(&request));

                match sent {
                    Ok(()) => {
                        entry.req_id = req_id;
                        state.by_req_id.insert(req_id, fingerprint.clone());
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(name = %entry.name, error = %e, "Failed to re-subscribe");
                        failed.push((fingerprint.clone(), e));
                    }
                }
            }

            failed
                .into_iter()
                .filter_map(|(fingerprint, e)| {
                    state.entries.remove(&fingerprint).map(|entry| (entry, e))
                })
                .collect()
        };

        for (entry, e) in failed {
            for consumer in entry.consumers {
                (consumer.on_data)(Err(send_failure(&e)));
            }
        }
    }

    /// Stop every subscription and clear the registry. Unsubscribe frames are
    /// best-effort; consumers are dropped without being called.
    pub fn teardown(&self) {
        let entries = {
            let mut guard = self.state();
            let state = &mut *guard;

            for entry in state.entries.values() {
                if let Some(id) = &entry.subscription_id {
                    self.forget(id);
                }
            }

            state.by_req_id.clear();
            state.by_subscription_id.clear();
            state.orphans.clear();
            std::mem::take(&mut state.entries)
        };
        drop(entries);
    }

    /// Number of live subscriptions (distinct fingerprints).
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state().entries.len()
    }

    /// Number of consumers attached to `fingerprint`.
    #[must_use]
    pub fn consumer_count(&self, fingerprint: &Fingerprint) -> usize {
        self.state()
            .entries
            .get(fingerprint)
            .map_or(0, |entry| entry.consumers.len())
    }

    /// Server-assigned id of `fingerprint`, once its first response arrived.
    #[must_use]
    pub fn subscription_id(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.state()
            .entries
            .get(fingerprint)
            .and_then(|entry| entry.subscription_id.clone())
    }
}

/// Per-consumer copy of a failed send. Sends only fail on the connection
/// state, so anything but `NotConnected` is reported as a closed connection.
fn send_failure(e: &Error) -> Error {
    match e.downcast_ref::<WsError>() {
        Some(WsError::NotConnected) => WsError::NotConnected.into(),
        _ => WsError::ConnectionClosed.into(),
    }
}
