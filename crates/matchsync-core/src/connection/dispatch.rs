// Event handler registry for inbound push frames.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::error;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Opaque handle returned by `on`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Id handed out when no registration actually took place.
    pub const NONE: HandlerId = HandlerId(0);
}

/// Terminal connection errors. Each failure episode delivers exactly one of
/// these to the registered error handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("authentication rejected: {0}")]
    AuthenticationFailed(String),
    #[error("gave up after {attempts} reconnect attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
}

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: u64,
    events: HashMap<String, Vec<(HandlerId, EventHandler)>>,
    errors: Vec<(HandlerId, ErrorHandler)>,
}

impl HandlerRegistry {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub fn on(&mut self, event: &str, handler: EventHandler) -> HandlerId {
        let id = self.allocate();
        self.events
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn on_error(&mut self, handler: ErrorHandler) -> HandlerId {
        let id = self.allocate();
        self.errors.push((id, handler));
        id
    }

    /// Remove a handler (event or error). Returns whether anything was removed.
    pub fn off(&mut self, id: HandlerId) -> bool {
        let mut removed = false;
        self.events.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(hid, _)| *hid != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        let before = self.errors.len();
        self.errors.retain(|(hid, _)| *hid != id);
        removed || self.errors.len() != before
    }

    /// Snapshot of the handlers for `event`, so they can run without holding
    /// the registry lock.
    pub fn handlers_for(&self, event: &str) -> Vec<EventHandler> {
        self.events
            .get(event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn error_handlers(&self) -> Vec<ErrorHandler> {
        self.errors.iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum::<usize>() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Invoke every handler with `data`. A panicking handler is logged and
/// skipped; the rest still run. Returns how many handlers panicked.
pub fn dispatch(event: &str, handlers: &[EventHandler], data: &Value) -> usize {
    let mut panicked = 0;
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
            panicked += 1;
            error!("handler for '{event}' panicked; continuing with remaining handlers");
        }
    }
    panicked
}

/// Deliver a terminal error to every error handler, containing panics the
/// same way as `dispatch`.
pub fn dispatch_error(handlers: &[ErrorHandler], err: &ConnectionError) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
            error!("connection error handler panicked");
        }
    }
}
