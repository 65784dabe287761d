use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Invoked once, on the next open.
pub type OnConnected = Box<dyn FnOnce() + Send>;
/// Invoked on every open after the first.
pub type OnReconnected = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct State {
    open: bool,
    on_connected: Option<OnConnected>,
    on_reconnected: Option<OnReconnected>,
}

/// Callbacks due after an open, to be run outside the lock.
#[derive(Default)]
#[must_use]
pub struct Opened {
    on_connected: Option<OnConnected>,
    on_reconnected: Option<OnReconnected>,
}

impl Opened {
    pub fn run(self) {
        if let Some(on_connected) = self.on_connected {
            on_connected();
        }
        if let Some(on_reconnected) = self.on_reconnected {
            on_reconnected();
        }
    }
}

/// Connected/reconnected callback slots.
///
/// `on_connected` is one-shot; `on_reconnected` persists. Each slot holds one
/// callback and a new registration replaces the previous one.
#[derive(Default)]
pub struct Lifecycle {
    state: Mutex<State>,
}

impl Lifecycle {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `callback` for the next open, or hand it back when the
    /// connection is open right now so the caller can run it immediately.
    pub fn set_on_connected(&self, callback: OnConnected) -> Option<OnConnected> {
        let mut state = self.state();
        if state.open {
            return Some(callback);
        }
        state.on_connected = Some(callback);
        None
    }

    pub fn set_on_reconnected(&self, callback: OnReconnected) {
        self.state().on_reconnected = Some(callback);
    }

    pub fn opened(&self, reconnect: bool) -> Opened {
        let mut state = self.state();
        state.open = true;

        Opened {
            on_connected: state.on_connected.take(),
            on_reconnected: if reconnect {
                state.on_reconnected.clone()
            } else {
                None
            },
        }
    }

    pub fn closed(&self) {
        self.state().open = false;
    }
}
