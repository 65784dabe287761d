use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::types::response::Response;
use crate::Result;
use crate::ws::WsError;

/// Source of `req_id`s shared by subscriptions and one-shot requests so the
/// two never collide.
#[derive(Debug)]
pub struct RequestIds(AtomicU64);

impl Default for RequestIds {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl RequestIds {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// In-flight one-shot requests keyed by `req_id`.
#[derive(Default)]
pub struct PendingRequests {
    waiters: DashMap<u64, oneshot::Sender<Result<Response>>>,
}

impl PendingRequests {
    /// Register a waiter for `req_id`.
    pub fn register(&self, req_id: u64) -> oneshot::Receiver<Result<Response>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(req_id, tx);
        rx
    }

    /// Forget a waiter whose request never made it onto the wire.
    pub fn cancel(&self, req_id: u64) {
        self.waiters.remove(&req_id);
    }

    /// Hand `response` to its waiter. Returns the response back when nobody
    /// is waiting for it.
    pub fn resolve(&self, response: Response) -> Option<Response> {
        let Some(req_id) = response.req_id else {
            return Some(response);
        };
        let Some((_, waiter)) = self.waiters.remove(&req_id) else {
            return Some(response);
        };

        // The requester may have given up; nothing else to do then
        _ = waiter.send(Ok(response));
        None
    }

    /// Fail every waiter with [`WsError::ConnectionClosed`].
    pub fn reject_all(&self) {
        let req_ids: Vec<u64> = self.waiters.iter().map(|entry| *entry.key()).collect();

        #[cfg(feature = "tracing")]
        if !req_ids.is_empty() {
            tracing::debug!(count = req_ids.len(), "Rejecting pending requests");
        }

        for req_id in req_ids {
            if let Some((_, waiter)) = self.waiters.remove(&req_id) {
                _ = waiter.send(Err(WsError::ConnectionClosed.into()));
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
