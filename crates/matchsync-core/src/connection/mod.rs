// Process-wide push connection.
//
// `get_connection` hands out clones of one `ConnectionHandle`. If the socket
// endpoint is unusable the handle is a `Fallback` whose methods are logged
// no-ops, so watchers keep working off REST alone.

pub mod backoff;
pub mod dispatch;
pub mod manager;
pub mod transport;
pub mod wire;

use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

pub use backoff::ReconnectPolicy;
pub use dispatch::{ConnectionError, ErrorHandler, EventHandler, HandlerId};
pub use manager::{ConnectionManager, ConnectionPhase, ConnectionState};
pub use transport::{Connector, Transport, TransportError, WsConnector};

use crate::config::Config;

static CONNECTION: OnceLock<ConnectionHandle> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub socket_url: String,
    pub policy: ReconnectPolicy,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            socket_url: config.server.socket_url.clone(),
            policy: config.reconnect.policy(),
        }
    }
}

/// The shared connection for this process, created on first call. Settings
/// passed to later calls are ignored.
pub fn get_connection(settings: &ConnectionSettings) -> ConnectionHandle {
    CONNECTION
        .get_or_init(|| ConnectionHandle::open(settings, Arc::new(WsConnector)))
        .clone()
}

/// Either a live connection manager or a no-op stand-in.
#[derive(Clone)]
pub enum ConnectionHandle {
    Live(Arc<ConnectionManager>),
    Fallback,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionHandle::Live(m) => f.debug_tuple("Live").field(&m.phase()).finish(),
            ConnectionHandle::Fallback => f.write_str("Fallback"),
        }
    }
}

impl ConnectionHandle {
    /// Build a handle outside the process-wide singleton (tests, tools).
    pub fn open(settings: &ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        match ConnectionManager::new(&settings.socket_url, settings.policy, connector) {
            Ok(manager) => ConnectionHandle::Live(Arc::new(manager)),
            Err(e) => {
                warn!("push connection unavailable, updates will not be pushed: {e}");
                ConnectionHandle::Fallback
            }
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionHandle::Live(_))
    }

    pub fn authenticate(&self, token: &str) {
        match self {
            ConnectionHandle::Live(m) => m.authenticate(token),
            ConnectionHandle::Fallback => warn!("authenticate ignored: no push connection"),
        }
    }

    pub fn join_room(&self, room: &str) {
        match self {
            ConnectionHandle::Live(m) => m.join_room(room),
            ConnectionHandle::Fallback => warn!(room, "join_room ignored: no push connection"),
        }
    }

    pub fn leave_room(&self, room: &str) {
        match self {
            ConnectionHandle::Live(m) => m.leave_room(room),
            ConnectionHandle::Fallback => warn!(room, "leave_room ignored: no push connection"),
        }
    }

    pub fn emit(&self, event: &str, data: Value) -> bool {
        match self {
            ConnectionHandle::Live(m) => m.emit(event, data),
            ConnectionHandle::Fallback => {
                warn!("emit '{event}' ignored: no push connection");
                false
            }
        }
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        match self {
            ConnectionHandle::Live(m) => m.on(event, handler),
            ConnectionHandle::Fallback => HandlerId::NONE,
        }
    }

    pub fn on_error(&self, handler: ErrorHandler) -> HandlerId {
        match self {
            ConnectionHandle::Live(m) => m.on_error(handler),
            ConnectionHandle::Fallback => HandlerId::NONE,
        }
    }

    pub fn off(&self, id: HandlerId) -> bool {
        match self {
            ConnectionHandle::Live(m) => m.off(id),
            ConnectionHandle::Fallback => false,
        }
    }

    /// A fallback handle never connects, so it reports `Failed`.
    pub fn phase(&self) -> ConnectionPhase {
        match self {
            ConnectionHandle::Live(m) => m.phase(),
            ConnectionHandle::Fallback => ConnectionPhase::Failed,
        }
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        match self {
            ConnectionHandle::Live(m) => m.subscribe_phase(),
            ConnectionHandle::Fallback => watch::channel(ConnectionPhase::Failed).1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            ConnectionHandle::Live(m) => m.state(),
            ConnectionHandle::Fallback => ConnectionState::failed(),
        }
    }

    pub fn malformed_frames(&self) -> u64 {
        match self {
            ConnectionHandle::Live(m) => m.malformed_frames(),
            ConnectionHandle::Fallback => 0,
        }
    }

    /// Stop the socket. Meant for process exit only; watchers release their
    /// rooms through `RoomSubscription` instead.
    pub fn shutdown(&self) {
        if let ConnectionHandle::Live(m) = self {
            m.shutdown();
        }
    }

    /// Register `handler` for `event` and join `room`. Both are undone when
    /// the returned subscription is dropped.
    pub fn subscribe(&self, room: &str, event: &str, handler: EventHandler) -> RoomSubscription {
        let handler = self.on(event, handler);
        self.join_room(room);
        RoomSubscription {
            handle: self.clone(),
            room: room.to_string(),
            handler,
        }
    }
}

/// One watcher's interest in a room. Dropping it unregisters the handler and
/// releases the room membership.
pub struct RoomSubscription {
    handle: ConnectionHandle,
    room: String,
    handler: HandlerId,
}

impl RoomSubscription {
    pub fn room(&self) -> &str {
        &self.room
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.handle.off(self.handler);
        self.handle.leave_room(&self.room);
    }
}
