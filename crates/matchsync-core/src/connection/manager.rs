// Connection manager: one authenticated push socket shared by every watcher.
//
// Public methods mutate shared state under a mutex and hand frames to a
// single driver task, which owns the socket and runs the connect / session /
// backoff cycle. Handlers run on the driver task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use super::dispatch::{
    self, ConnectionError, ErrorHandler, EventHandler, HandlerId, HandlerRegistry,
};
use super::transport::{validate_url, Connector, Transport, TransportError};
use super::wire::{self, Frame};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Snapshot of the manager's state.
#[derive(Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Consecutive failed connects in the current cycle.
    pub attempt: u32,
    /// Room name -> number of active subscribers.
    pub room_memberships: BTreeMap<String, usize>,
    pub last_error: Option<ConnectionError>,
    auth_token: Option<String>,
}

impl ConnectionState {
    /// State reported by a connection that never came up.
    pub fn failed() -> Self {
        Self {
            phase: ConnectionPhase::Failed,
            ..Self::default()
        }
    }

    pub fn has_token(&self) -> bool {
        self.auth_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_member(&self, room: &str) -> bool {
        self.room_memberships.contains_key(room)
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("phase", &self.phase)
            .field("attempt", &self.attempt)
            .field("room_memberships", &self.room_memberships)
            .field("last_error", &self.last_error)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

enum Command {
    Send(Frame),
    Shutdown,
}

struct Inner {
    state: ConnectionState,
    handlers: HandlerRegistry,
    /// Present while a driver task is running.
    commands: Option<mpsc::UnboundedSender<Command>>,
    /// Bumped whenever a driver is started or detached. A driver only writes
    /// state while its epoch is current.
    epoch: u64,
}

impl Inner {
    fn queue(&self, frame: Frame) -> bool {
        match &self.commands {
            Some(tx) => tx.send(Command::Send(frame)).is_ok(),
            None => false,
        }
    }

    fn set_phase(&mut self, phase: ConnectionPhase, tx: &watch::Sender<ConnectionPhase>) {
        self.state.phase = phase;
        tx.send_replace(phase);
    }
}

struct Shared {
    url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    phase_tx: watch::Sender<ConnectionPhase>,
    malformed: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        url: &str,
        policy: ReconnectPolicy,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TransportError> {
        validate_url(url)?;
        let (phase_tx, _) = watch::channel(ConnectionPhase::Idle);
        Ok(Self {
            shared: Arc::new(Shared {
                url: url.to_string(),
                policy,
                connector,
                inner: Mutex::new(Inner {
                    state: ConnectionState::default(),
                    handlers: HandlerRegistry::default(),
                    commands: None,
                    epoch: 0,
                }),
                phase_tx,
                malformed: AtomicU64::new(0),
            }),
        })
    }

    /// Store `token` as the current credential and make sure a connection is
    /// (being) established with it.
    ///
    /// - idle / failed: starts a fresh connect cycle from attempt 0.
    /// - connecting / reconnecting: the in-flight attempt picks up the new
    ///   token; no second connection is opened.
    /// - connected: re-announces the token on the open socket.
    pub fn authenticate(&self, token: &str) {
        let mut inner = self.shared.lock();
        inner.state.auth_token = Some(token.to_string());
        match inner.state.phase {
            ConnectionPhase::Connected => {
                if inner.queue(Frame::authenticate(token)) {
                    info!("re-announcing rotated credentials");
                }
            }
            ConnectionPhase::Connecting | ConnectionPhase::Reconnecting => {
                debug!("credentials updated while connecting");
            }
            ConnectionPhase::Idle | ConnectionPhase::Failed => self.start_driver(&mut inner),
        }
    }

    fn start_driver(&self, inner: &mut Inner) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("cannot start push connection outside a tokio runtime: {e}");
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        inner.epoch += 1;
        inner.commands = Some(tx);
        inner.state.attempt = 0;
        inner.state.last_error = None;
        inner.set_phase(ConnectionPhase::Connecting, &self.shared.phase_tx);
        info!(url = %self.shared.url, "starting push connection");
        runtime.spawn(drive(Arc::clone(&self.shared), inner.epoch, rx));
    }

    /// Subscribe to a room. Only the first subscriber causes a join frame;
    /// while disconnected the join is replayed on the next connect.
    pub fn join_room(&self, room: &str) {
        let mut inner = self.shared.lock();
        let count = inner
            .state
            .room_memberships
            .entry(room.to_string())
            .or_insert(0);
        *count += 1;
        let first = *count == 1;
        if first && inner.state.phase == ConnectionPhase::Connected {
            inner.queue(Frame::join_room(room));
        }
        debug!(room, first, "join_room");
    }

    /// Drop one subscription. The leave frame goes out when the last
    /// subscriber leaves; leaving a room never joined is a no-op.
    pub fn leave_room(&self, room: &str) {
        let mut inner = self.shared.lock();
        let Some(count) = inner.state.room_memberships.get_mut(room) else {
            debug!(room, "leave_room for a room not joined");
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        inner.state.room_memberships.remove(room);
        if inner.state.phase == ConnectionPhase::Connected {
            inner.queue(Frame::leave_room(room));
        }
        debug!(room, "left room");
    }

    /// Send an arbitrary event. Returns false (and drops it) unless connected.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        let inner = self.shared.lock();
        if inner.state.phase != ConnectionPhase::Connected {
            warn!(phase = ?inner.state.phase, "dropping '{event}' emitted while not connected");
            return false;
        }
        inner.queue(Frame::new(event, data))
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.shared.lock().handlers.on(event, handler)
    }

    pub fn on_error(&self, handler: ErrorHandler) -> HandlerId {
        self.shared.lock().handlers.on_error(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.lock().handlers.off(id)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.lock().state.phase
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.shared.phase_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    /// Inbound frames dropped because they could not be parsed.
    pub fn malformed_frames(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    /// Close the socket and stop the driver. Room memberships and the token
    /// are kept, so a later `authenticate` restores everything.
    pub fn shutdown(&self) {
        let mut inner = self.shared.lock();
        inner.epoch += 1;
        if let Some(tx) = inner.commands.take() {
            let _ = tx.send(Command::Shutdown);
        }
        inner.state.attempt = 0;
        if inner.state.phase != ConnectionPhase::Idle {
            inner.set_phase(ConnectionPhase::Idle, &self.shared.phase_tx);
            info!("push connection shut down");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Driver task
// ---------------------------------------------------------------------------

enum SessionEnd {
    /// Close frame or end of stream from the server.
    ServerClosed,
    Dropped(TransportError),
    AuthRejected(String),
    Shutdown,
}

async fn drive(shared: Arc<Shared>, epoch: u64, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut failures: u32 = 0;

    loop {
        let token = {
            let inner = shared.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.state.auth_token.clone().unwrap_or_default()
        };

        let last_error = match shared.connector.connect(&shared.url, &token).await {
            Ok(mut transport) => {
                let started = Instant::now();
                let mut heard = false;
                let end =
                    run_session(&shared, epoch, transport.as_mut(), &mut commands, &mut heard)
                        .await;
                // Only a session the server spoke on, or one that outlived the
                // shortest backoff, ends a failure streak.
                let settled = heard || started.elapsed() >= shared.policy.min_delay;
                if settled {
                    failures = 0;
                }
                match end {
                    SessionEnd::ServerClosed if settled => {
                        info!("server closed the push socket; reconnecting");
                        let mut inner = shared.lock();
                        if inner.epoch != epoch {
                            return;
                        }
                        inner.state.attempt = 0;
                        inner.set_phase(ConnectionPhase::Reconnecting, &shared.phase_tx);
                        continue;
                    }
                    SessionEnd::ServerClosed => {
                        failures += 1;
                        warn!(attempt = failures, "server closed a fresh push socket");
                        "server closed the connection".to_string()
                    }
                    SessionEnd::Dropped(e) => {
                        failures += 1;
                        warn!(attempt = failures, "push socket dropped: {e}");
                        e.to_string()
                    }
                    SessionEnd::AuthRejected(msg) => {
                        fail(&shared, epoch, ConnectionError::AuthenticationFailed(msg));
                        return;
                    }
                    SessionEnd::Shutdown => {
                        debug!("push connection driver stopped");
                        return;
                    }
                }
            }
            Err(TransportError::Unauthorized(msg)) => {
                fail(&shared, epoch, ConnectionError::AuthenticationFailed(msg));
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(attempt = failures, "push connect failed: {e}");
                e.to_string()
            }
        };

        if !shared.policy.allows(failures) {
            let err = ConnectionError::ReconnectExhausted {
                attempts: shared.policy.max_attempts,
                last_error,
            };
            fail(&shared, epoch, err);
            return;
        }

        let delay = shared.policy.delay_for(failures);
        {
            let mut inner = shared.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.state.attempt = failures;
            inner.set_phase(ConnectionPhase::Reconnecting, &shared.phase_tx);
        }
        info!(attempt = failures, "reconnecting in {}ms", delay.as_millis());

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Send(frame)) => {
                        debug!(event = %frame.event, "discarding frame queued while disconnected");
                    }
                    Some(Command::Shutdown) | None => return,
                },
            }
        }
    }
}

async fn run_session(
    shared: &Shared,
    epoch: u64,
    transport: &mut dyn Transport,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    heard: &mut bool,
) -> SessionEnd {
    // Frames queued against an earlier socket are stale; memberships are
    // replayed from state below.
    while let Ok(cmd) = commands.try_recv() {
        if let Command::Shutdown = cmd {
            let _ = transport.close().await;
            return SessionEnd::Shutdown;
        }
    }

    let (token, rooms) = {
        let mut inner = shared.lock();
        if inner.epoch != epoch {
            return SessionEnd::Shutdown;
        }
        inner.state.attempt = 0;
        inner.state.last_error = None;
        inner.set_phase(ConnectionPhase::Connected, &shared.phase_tx);
        let rooms: Vec<String> = inner.state.room_memberships.keys().cloned().collect();
        (inner.state.auth_token.clone(), rooms)
    };
    info!(rooms = rooms.len(), "push connection established");

    let mut greeting = Vec::with_capacity(rooms.len() + 1);
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        greeting.push(Frame::authenticate(&token));
    }
    greeting.extend(rooms.iter().map(|room| Frame::join_room(room)));
    for frame in &greeting {
        if let Err(e) = send_frame(transport, frame).await {
            return SessionEnd::Dropped(e);
        }
    }

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(frame)) => {
                    if let Err(e) = send_frame(transport, &frame).await {
                        return SessionEnd::Dropped(e);
                    }
                }
                Some(Command::Shutdown) | None => {
                    if let Err(e) = transport.close().await {
                        debug!("error closing push socket: {e}");
                    }
                    return SessionEnd::Shutdown;
                }
            },
            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => {
                    *heard = true;
                    if let Some(reason) = handle_text(shared, &text) {
                        let _ = transport.close().await;
                        return SessionEnd::AuthRejected(reason);
                    }
                }
                Some(Err(e)) => return SessionEnd::Dropped(e),
                None => return SessionEnd::ServerClosed,
            },
        }
    }
}

async fn send_frame(transport: &mut dyn Transport, frame: &Frame) -> Result<(), TransportError> {
    let text = frame
        .encode()
        .map_err(|e| TransportError::Send(format!("encode {}: {e}", frame.event)))?;
    debug!(?frame, "sending push frame");
    transport.send(text).await
}

/// Route one inbound frame. Returns the rejection reason if the server
/// refused our credentials.
fn handle_text(shared: &Shared, text: &str) -> Option<String> {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            let total = shared.malformed.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total, "dropping malformed push frame: {e}");
            return None;
        }
    };

    match frame.event.as_str() {
        wire::AUTH_ERROR => {
            return Some(
                frame
                    .message()
                    .unwrap_or("credentials rejected")
                    .to_string(),
            );
        }
        wire::AUTHENTICATED => debug!("server accepted credentials"),
        _ => {}
    }

    let handlers = shared.lock().handlers.handlers_for(&frame.event);
    if handlers.is_empty() {
        debug!(event = %frame.event, "no handlers registered");
        return None;
    }
    dispatch::dispatch(&frame.event, &handlers, &frame.data);
    None
}

fn fail(shared: &Shared, epoch: u64, err: ConnectionError) {
    let handlers = {
        let mut inner = shared.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.commands = None;
        inner.state.last_error = Some(err.clone());
        inner.set_phase(ConnectionPhase::Failed, &shared.phase_tx);
        inner.handlers.error_handlers()
    };
    error!("push connection failed: {err}");
    dispatch::dispatch_error(&handlers, &err);
}
