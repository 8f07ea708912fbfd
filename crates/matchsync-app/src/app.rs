// Watcher event loop: keeps one match in sync with the server.
//
// Push events only bump the poll version; every change to the match goes
// through the same fetch-and-merge path in `SessionState`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use matchsync_api::MatchApi;
use matchsync_core::config::SyncConfig;
use matchsync_core::connection::{ConnectionHandle, EventHandler, RoomSubscription};
use matchsync_core::edit::ResultPayload;
use matchsync_core::push::{TournamentUpdate, TOURNAMENT_UPDATED};

use crate::protocol::{FetchEvent, MatchTarget, MatchView, SessionCommand, ViewUpdate};
use crate::session::{Merge, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Capacity of the push-hint channel between the socket and the loop.
    pub push_buffer: usize,
    pub recent_matches_limit: u32,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for WatcherSettings {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            push_buffer: sync.push_buffer,
            recent_matches_limit: sync.recent_matches_limit,
        }
    }
}

/// Session state plus the fetch tasks working for it.
struct Watcher {
    session: SessionState,
    api: Arc<dyn MatchApi>,
    settings: WatcherSettings,
    tasks: JoinSet<Option<FetchEvent>>,
    last_view: Option<MatchView>,
}

impl Watcher {
    fn new(target: MatchTarget, api: Arc<dyn MatchApi>, settings: WatcherSettings) -> Self {
        Self {
            session: SessionState::new(target),
            api,
            settings,
            tasks: JoinSet::new(),
            last_view: None,
        }
    }

    /// Bump the poll version and refetch match, tournament and lobby.
    fn refresh(&mut self) {
        let version = self.session.bump();
        self.spawn_refetch(version);
    }

    fn spawn_refetch(&mut self, version: u64) {
        debug!(version, "refetching match");
        self.spawn_core(version);
        self.spawn_lobby(version);
    }

    fn spawn_core(&mut self, version: u64) {
        let api = Arc::clone(&self.api);
        let target = self.session.target.clone();
        self.tasks.spawn(async move {
            let result = tokio::try_join!(
                api.fetch_match(&target.tournament_id, &target.match_id),
                api.fetch_tournament(&target.tournament_id),
            )
            .map_err(|e| e.to_string());
            Some(FetchEvent::Core {
                match_id: target.match_id,
                version,
                result,
            })
        });
    }

    fn spawn_lobby(&mut self, version: u64) {
        let api = Arc::clone(&self.api);
        let match_id = self.session.target.match_id.clone();
        self.tasks.spawn(async move {
            let snapshot = match api.fetch_lobby_stats(&match_id, version).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(version, "lobby stats unavailable: {e}");
                    None
                }
            };
            Some(FetchEvent::Lobby {
                match_id,
                version,
                snapshot,
            })
        });
    }

    fn spawn_recent(&mut self, side_id: String) {
        let api = Arc::clone(&self.api);
        let match_id = self.session.target.match_id.clone();
        let limit = self.settings.recent_matches_limit;
        self.tasks.spawn(async move {
            match api.fetch_recent_matches(&side_id, limit).await {
                Ok(matches) => Some(FetchEvent::Recent {
                    match_id,
                    side_id,
                    matches,
                }),
                Err(e) => {
                    warn!(side_id = %side_id, "recent matches unavailable: {e}");
                    None
                }
            }
        });
    }

    fn spawn_submit(&mut self, payload: ResultPayload) {
        let api = Arc::clone(&self.api);
        let target = self.session.target.clone();
        self.tasks.spawn(async move {
            let result = api
                .submit_result(&target.tournament_id, &target.match_id, &payload)
                .await
                .map_err(|e| e.to_string());
            Some(FetchEvent::Submitted {
                match_id: target.match_id,
                result,
            })
        });
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Edit(edit) => match self.session.begin_edit(&edit) {
                Ok(payload) => {
                    info!(match_id = %self.session.target.match_id, "submitting result edit");
                    self.spawn_submit(payload);
                }
                Err(e) => self.session.reject_edit(&e),
            },
            SessionCommand::Retry => {
                info!("manual refresh");
                let version = self.session.retry();
                self.spawn_refetch(version);
            }
            // Handled by the loop, which owns the room subscription.
            SessionCommand::Switch(_) | SessionCommand::Shutdown => {}
        }
    }

    /// Drop everything about the current match and start on `target`.
    fn switch(&mut self, target: MatchTarget) {
        info!(
            from = %self.session.target.match_id,
            to = %target.match_id,
            "switching watched match"
        );
        self.tasks.abort_all();
        self.session = SessionState::new(target);
        self.last_view = None;
        self.refresh();
    }

    fn handle_push(&mut self, update: TournamentUpdate) {
        let target = &self.session.target;
        if update.concerns(&target.tournament_id, &target.match_id) {
            debug!(kind = ?update.kind, "tournament update, refetching");
            self.refresh();
        } else {
            debug!(kind = ?update.kind, "ignoring update for another match");
        }
    }

    fn handle_fetch(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::Core {
                match_id,
                version,
                result: Ok((m, tournament)),
            } => {
                if self.session.apply_fetch(&match_id, version, m, tournament) == Merge::Applied {
                    for side in self.session.take_recent_request() {
                        self.spawn_recent(side);
                    }
                }
            }
            FetchEvent::Core {
                match_id,
                version,
                result: Err(e),
            } => {
                self.session.apply_fetch_error(&match_id, version, e);
            }
            FetchEvent::Lobby {
                match_id,
                version,
                snapshot,
            } => {
                self.session.apply_lobby(&match_id, version, snapshot);
            }
            FetchEvent::Recent {
                match_id,
                side_id,
                matches,
            } => {
                self.session.apply_recent(&match_id, side_id, matches);
            }
            FetchEvent::Submitted { match_id, result } => {
                if let Some(version) = self.session.finish_edit(&match_id, result) {
                    self.spawn_refetch(version);
                }
            }
        }
    }

    /// Send the read model if it changed since the last send.
    async fn publish(&mut self, view_tx: &mpsc::Sender<ViewUpdate>) {
        let view = self.session.view();
        if self.last_view.as_ref() == Some(&view) {
            return;
        }
        self.last_view = Some(view.clone());
        if view_tx.send(ViewUpdate::Snapshot(Box::new(view))).await.is_err() {
            debug!("view receiver dropped");
        }
    }
}

/// Register a push handler for the target's tournament room. Hints are
/// forwarded into a bounded channel; when it is full a refetch is already
/// queued, so the extra hint is dropped.
fn subscribe(
    connection: &ConnectionHandle,
    target: &MatchTarget,
    buffer: usize,
) -> (mpsc::Receiver<TournamentUpdate>, RoomSubscription) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let handler: EventHandler = Arc::new(move |data: &Value| {
        match TournamentUpdate::parse(data) {
            Ok(update) => match tx.try_send(update) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("push buffer full, hint coalesced"),
                Err(TrySendError::Closed(_)) => debug!("watcher gone, hint dropped"),
            },
            Err(e) => warn!("ignoring unparseable tournament update: {e}"),
        }
    });
    let subscription = connection.subscribe(&target.tournament_id, TOURNAMENT_UPDATED, handler);
    (rx, subscription)
}

/// Run the watcher loop for `target` until `Shutdown` or the command channel
/// closes.
///
/// Listens on three sources using `tokio::select!`:
/// 1. commands from the consumer
/// 2. push hints from the tournament room
/// 3. completed fetch / submit tasks
///
/// On exit the room is left and in-flight tasks are aborted. The shared
/// connection itself stays up.
pub async fn run(
    target: MatchTarget,
    api: Arc<dyn MatchApi>,
    connection: ConnectionHandle,
    settings: WatcherSettings,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    view_tx: mpsc::Sender<ViewUpdate>,
) -> anyhow::Result<()> {
    info!(
        tournament_id = %target.tournament_id,
        match_id = %target.match_id,
        "watcher started"
    );

    // Join the room before the first fetch so no update slips in between.
    let (mut push_rx, mut subscription) = subscribe(&connection, &target, settings.push_buffer);
    // A fallback connection drops the handler immediately, closing the
    // channel. Stop polling it then so select! never spins on it.
    let mut push_open = true;

    let mut watcher = Watcher::new(target, api, settings);
    watcher.refresh();
    watcher.publish(&view_tx).await;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Shutdown) | None => {
                        info!("watcher shutting down");
                        break;
                    }
                    Some(SessionCommand::Switch(next)) => {
                        if next == watcher.session.target {
                            debug!("switch to the match already watched");
                        } else {
                            // Subscribe first so a shared room is not left and rejoined.
                            let (rx, sub) = subscribe(&connection, &next, settings.push_buffer);
                            push_rx = rx;
                            subscription = sub;
                            push_open = true;
                            watcher.switch(next);
                        }
                    }
                    Some(cmd) => watcher.handle_command(cmd),
                }
            }

            update = push_rx.recv(), if push_open => {
                match update {
                    Some(update) => watcher.handle_push(update),
                    None => {
                        info!("push hints unavailable; updates need a manual refresh");
                        push_open = false;
                    }
                }
            }

            Some(joined) = watcher.tasks.join_next() => {
                match joined {
                    Ok(Some(event)) => watcher.handle_fetch(event),
                    Ok(None) => {}
                    Err(e) if e.is_cancelled() => debug!("fetch task cancelled"),
                    Err(e) => error!("fetch task failed: {e}"),
                }
            }
        }

        watcher.publish(&view_tx).await;
    }

    watcher.tasks.abort_all();
    drop(subscription);
    let _ = view_tx.send(ViewUpdate::Stopped).await;
    info!("watcher exited");
    Ok(())
}
