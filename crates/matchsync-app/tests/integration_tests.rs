// End-to-end watcher tests: scripted REST api, in-memory push socket, paused
// time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use matchsync_api::{ApiError, MatchApi, SubmitResponse};
use matchsync_app::app::{self, WatcherSettings};
use matchsync_app::protocol::{
    EditOutcome, LoadState, MatchTarget, MatchView, SessionCommand, ViewUpdate,
};
use matchsync_core::connection::{
    ConnectionHandle, ConnectionPhase, ConnectionSettings, Connector, ReconnectPolicy, Transport,
    TransportError,
};
use matchsync_core::edit::{EditPermission, ResultEdit, ResultPayload};
use matchsync_core::model::{
    BracketMatch, LobbyMap, LobbySnapshot, MapResult, Match, MatchStatus, MatchSummary, Score,
    Tournament,
};

// ---------------------------------------------------------------------------
// Scripted api
// ---------------------------------------------------------------------------

type Scripted<T> = (Duration, Result<T, u16>);

struct MockApi {
    match_script: Mutex<VecDeque<Scripted<Match>>>,
    default_match: Mutex<Match>,
    tournament: Mutex<Tournament>,
    lobby: Mutex<Option<LobbySnapshot>>,
    submit_script: Mutex<VecDeque<Scripted<SubmitResponse>>>,
    submitted: Mutex<Vec<ResultPayload>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MockApi {
    fn new(m: Match) -> Arc<Self> {
        Arc::new(Self {
            match_script: Mutex::new(VecDeque::new()),
            default_match: Mutex::new(m),
            tournament: Mutex::new(tournament(false)),
            lobby: Mutex::new(None),
            submit_script: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn script_match(&self, delay_ms: u64, result: Result<Match, u16>) {
        self.match_script
            .lock()
            .unwrap()
            .push_back((Duration::from_millis(delay_ms), result));
    }

    fn script_submit(&self, delay_ms: u64, result: Result<SubmitResponse, u16>) {
        self.submit_script
            .lock()
            .unwrap()
            .push_back((Duration::from_millis(delay_ms), result));
    }

    fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn count(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }
}

fn http_error(status: u16) -> ApiError {
    ApiError::Status {
        url: "mock".into(),
        status,
        body: String::new(),
    }
}

#[async_trait]
impl MatchApi for MockApi {
    async fn fetch_match(&self, _tid: &str, _mid: &str) -> Result<Match, ApiError> {
        self.count("match");
        let scripted = self.match_script.lock().unwrap().pop_front();
        match scripted {
            Some((delay, result)) => {
                tokio::time::sleep(delay).await;
                result.map_err(http_error)
            }
            None => Ok(self.default_match.lock().unwrap().clone()),
        }
    }

    async fn fetch_tournament(&self, _tid: &str) -> Result<Tournament, ApiError> {
        self.count("tournament");
        Ok(self.tournament.lock().unwrap().clone())
    }

    async fn fetch_lobby_stats(
        &self,
        _mid: &str,
        _version: u64,
    ) -> Result<Option<LobbySnapshot>, ApiError> {
        self.count("lobby");
        Ok(self.lobby.lock().unwrap().clone())
    }

    async fn fetch_recent_matches(
        &self,
        side_id: &str,
        _limit: u32,
    ) -> Result<Vec<MatchSummary>, ApiError> {
        self.count("recent");
        Ok(vec![MatchSummary {
            id: format!("prev-{side_id}"),
            tournament_id: None,
            side1_id: Some(side_id.to_string()),
            side2_id: None,
            status: MatchStatus::Completed,
            score1: 2,
            score2: 0,
            winner_id: Some(side_id.to_string()),
            played_at: None,
        }])
    }

    async fn submit_result(
        &self,
        _tid: &str,
        _mid: &str,
        payload: &ResultPayload,
    ) -> Result<SubmitResponse, ApiError> {
        self.count("submit");
        self.submitted.lock().unwrap().push(payload.clone());
        let scripted = self.submit_script.lock().unwrap().pop_front();
        match scripted {
            Some((delay, result)) => {
                tokio::time::sleep(delay).await;
                result.map_err(http_error)
            }
            None => Err(http_error(500)),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory push socket
// ---------------------------------------------------------------------------

struct PushTransport {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for PushTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Accepts exactly one connection and hands its inbound sender to the test.
struct PushConnector {
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Result<String, TransportError>>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connector for PushConnector {
    async fn connect(&self, _url: &str, _token: &str) -> Result<Box<dyn Transport>, TransportError> {
        match self.inbound.lock().unwrap().take() {
            Some(inbound) => Ok(Box::new(PushTransport {
                inbound,
                sent: Arc::clone(&self.sent),
            })),
            None => Err(TransportError::Connect("already used".into())),
        }
    }
}

struct PushServer {
    tx: mpsc::UnboundedSender<Result<String, TransportError>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl PushServer {
    fn push(&self, data: serde_json::Value) {
        let frame = json!({ "event": "tournament-updated", "data": data });
        self.tx.send(Ok(frame.to_string())).unwrap();
    }

    fn sent_events(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|t| serde_json::from_str::<serde_json::Value>(t).unwrap()["event"].to_string())
            .collect()
    }
}

async fn live_connection() -> (ConnectionHandle, PushServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let connector = Arc::new(PushConnector {
        inbound: Mutex::new(Some(rx)),
        sent: Arc::clone(&sent),
    });
    let settings = ConnectionSettings {
        socket_url: "ws://localhost:3000/ws".into(),
        policy: ReconnectPolicy::default(),
    };
    let handle = ConnectionHandle::open(&settings, connector);
    handle.authenticate("tok");
    let mut phase = handle.subscribe_phase();
    timeout(
        Duration::from_secs(10),
        phase.wait_for(|p| *p == ConnectionPhase::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    (handle, PushServer { tx, sent })
}

// ---------------------------------------------------------------------------
// Fixtures and helpers
// ---------------------------------------------------------------------------

fn base_match() -> Match {
    Match {
        id: "m1".into(),
        tournament_id: "t1".into(),
        side1_id: Some("a".into()),
        side2_id: Some("b".into()),
        status: MatchStatus::Live,
        next_match_id: Some("m9".into()),
        ..Match::default()
    }
}

fn tournament(next_played: bool) -> Tournament {
    Tournament {
        id: "t1".into(),
        matches: vec![BracketMatch {
            id: "m9".into(),
            status: if next_played {
                MatchStatus::Completed
            } else {
                MatchStatus::Scheduled
            },
            ..BracketMatch::default()
        }],
        ..Tournament::default()
    }
}

struct Harness {
    cmd_tx: mpsc::Sender<SessionCommand>,
    view_rx: mpsc::Receiver<ViewUpdate>,
    handle: JoinHandle<anyhow::Result<()>>,
}

fn start(api: Arc<MockApi>, connection: ConnectionHandle) -> Harness {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (view_tx, view_rx) = mpsc::channel(256);
    let handle = tokio::spawn(app::run(
        MatchTarget::new("t1", "m1"),
        api,
        connection,
        WatcherSettings::default(),
        cmd_rx,
        view_tx,
    ));
    Harness {
        cmd_tx,
        view_rx,
        handle,
    }
}

impl Harness {
    /// Receive views until one satisfies `pred`.
    async fn wait_for(&mut self, pred: impl Fn(&MatchView) -> bool) -> MatchView {
        loop {
            let update = timeout(Duration::from_secs(60), self.view_rx.recv())
                .await
                .expect("timed out waiting for view")
                .expect("watcher stopped");
            if let ViewUpdate::Snapshot(view) = update {
                if pred(&view) {
                    return *view;
                }
            }
        }
    }

    async fn ready(&mut self) -> MatchView {
        self.wait_for(|v| v.load_state == LoadState::Ready).await
    }

    async fn send(&self, cmd: SessionCommand) {
        self.cmd_tx.send(cmd).await.unwrap();
    }

    async fn shutdown(mut self) {
        self.send(SessionCommand::Shutdown).await;
        self.handle.await.unwrap().unwrap();
        while let Some(update) = self.view_rx.recv().await {
            if update == ViewUpdate::Stopped {
                return;
            }
        }
        panic!("no Stopped update");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn loads_match_with_derived_score() {
    let mut m = base_match();
    m.map_results = vec![
        MapResult::new("Bind", 13, 7),
        MapResult::new("Haven", 9, 13),
        MapResult::new("Ascent", 13, 11),
    ];
    let api = MockApi::new(m);
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);

    let view = h.ready().await;
    assert_eq!(view.score, Some(Score::new(2, 1)));
    assert_eq!(view.winner_id.as_deref(), Some("a"));
    assert_eq!(view.permission, EditPermission::EditableLive);
    assert!(!view.has_lobby);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn recent_matches_fetched_once_per_side() {
    let api = MockApi::new(base_match());
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);

    h.wait_for(|v| v.recent_matches.len() == 2).await;
    h.send(SessionCommand::Retry).await;
    h.wait_for(|v| v.committed_version == 2).await;
    assert_eq!(api.calls("recent"), 2);
    assert_eq!(api.calls("match"), 2);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn initial_failure_then_manual_retry() {
    let api = MockApi::new(base_match());
    api.script_match(0, Err(503));
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);

    let failed = h
        .wait_for(|v| matches!(v.load_state, LoadState::Failed(_)))
        .await;
    assert!(failed.match_data.is_none());

    h.send(SessionCommand::Retry).await;
    let view = h.ready().await;
    assert!(view.match_data.is_some());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lobby_snapshot_merged_into_view() {
    let api = MockApi::new(base_match());
    *api.lobby.lock().unwrap() = Some(LobbySnapshot {
        maps: vec![LobbyMap {
            map_name: "Ascent".into(),
            score1: Some(13),
            score2: Some(9),
            winner_side_id: Some("a".into()),
        }],
        match_correlation_id: Some("corr-9".into()),
        ..LobbySnapshot::default()
    });
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);

    let view = h.wait_for(|v| v.has_lobby && v.match_data.is_some()).await;
    assert_eq!(view.score, Some(Score::new(13, 9)));
    assert_eq!(view.correlation_id.as_deref(), Some("corr-9"));
    h.shutdown().await;
}

/// Scenario E: two refetches complete out of order; the higher version wins.
#[tokio::test(start_paused = true)]
async fn out_of_order_refetches_highest_version_wins() {
    let api = MockApi::new(base_match());
    let (connection, server) = live_connection().await;
    let mut h = start(Arc::clone(&api), connection.clone());
    h.ready().await;

    let mut slow = base_match();
    slow.score1 = 1;
    let mut fast = base_match();
    fast.score1 = 2;
    api.script_match(5_000, Ok(slow));
    api.script_match(1_000, Ok(fast));

    server.push(json!({ "type": "match_updated", "tournamentId": "t1", "matchId": "m1" }));
    h.wait_for(|v| v.poll_version == 2).await;
    server.push(json!({ "type": "matches_update", "tournamentId": "t1" }));

    let view = h.wait_for(|v| v.committed_version == 3).await;
    assert_eq!(view.match_data.as_ref().unwrap().score1, 2);

    // Let the slow version-2 fetch land; it must not win.
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.send(SessionCommand::Edit(ResultEdit::default())).await;
    let view = h.wait_for(|v| v.last_edit.is_some()).await;
    assert_eq!(view.committed_version, 3);
    assert_eq!(view.match_data.as_ref().unwrap().score1, 2);
    assert_eq!(api.calls("match"), 3);

    assert!(server.sent_events().contains(&"\"join-room\"".to_string()));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pushes_for_other_tournaments_are_ignored() {
    let api = MockApi::new(base_match());
    let (connection, server) = live_connection().await;
    let mut h = start(Arc::clone(&api), connection);
    h.ready().await;

    server.push(json!({ "type": "match_updated", "tournamentId": "t2", "matchId": "x" }));
    server.push(json!("not an update"));
    server.push(json!({ "type": "match_updated", "tournamentId": "t1", "matchId": "m1" }));

    let view = h.wait_for(|v| v.committed_version == 2).await;
    assert_eq!(view.poll_version, 2);
    h.shutdown().await;
}

/// Scenario D: limited edit adopts the server snapshot without local winner
/// recomputation.
#[tokio::test(start_paused = true)]
async fn limited_edit_adopts_server_snapshot() {
    let api = MockApi::new(base_match());
    let mut server_match = base_match();
    server_match.score1 = 0;
    server_match.score2 = 2;
    server_match.winner_id = None;
    api.script_submit(
        500,
        Ok(SubmitResponse {
            updated: server_match.clone(),
            limited_edit: true,
            message: Some("winner is managed by the bracket".into()),
        }),
    );
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);
    h.ready().await;

    // The refetch after the submit sees what the server stored.
    *api.default_match.lock().unwrap() = server_match.clone();

    h.send(SessionCommand::Edit(ResultEdit {
        winner_id: Some("b".into()),
        score1: Some(0),
        score2: Some(2),
        map_results: None,
    }))
    .await;

    let optimistic = h.wait_for(|v| v.edit_in_flight).await;
    assert_eq!(optimistic.winner_id.as_deref(), Some("b"));

    let settled = h.wait_for(|v| !v.edit_in_flight).await;
    assert_eq!(
        settled.last_edit,
        Some(EditOutcome::LimitedEdit {
            message: Some("winner is managed by the bracket".into())
        })
    );
    assert_eq!(settled.match_data.as_ref().unwrap().winner_id, None);
    assert_eq!(settled.match_data.as_ref().unwrap().score2, 2);
    assert_eq!(api.submitted.lock().unwrap()[0].winner_id.as_deref(), Some("b"));

    let refetched = h.wait_for(|v| v.committed_version == v.poll_version && v.poll_version == 2).await;
    assert_eq!(refetched.match_data.unwrap().winner_id, None);
    h.shutdown().await;
}

/// Scenario D on a completed match: a map-score edit whose recomputed winner
/// the server does not accept.
#[tokio::test(start_paused = true)]
async fn limited_map_edit_keeps_server_winner() {
    let mut done = base_match();
    done.status = MatchStatus::Completed;
    done.map_results = vec![MapResult::new("Bind", 13, 5), MapResult::new("Haven", 4, 13)];
    let api = MockApi::new(done.clone());

    let mut stored = done;
    stored.score1 = 1;
    stored.score2 = 1;
    stored.winner_id = Some("b".into());
    api.script_submit(
        200,
        Ok(SubmitResponse {
            updated: stored.clone(),
            limited_edit: true,
            message: Some("winner is fixed by the bracket".into()),
        }),
    );
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);
    let view = h.ready().await;
    assert_eq!(view.permission, EditPermission::EditableCompleted);
    *api.default_match.lock().unwrap() = stored;

    h.send(SessionCommand::Edit(ResultEdit::map_scores(vec![
        MapResult::new("Bind", 13, 5),
        MapResult::new("Haven", 13, 4),
    ])))
    .await;

    let optimistic = h.wait_for(|v| v.edit_in_flight).await;
    assert_eq!(optimistic.winner_id.as_deref(), Some("a"));

    let settled = h.wait_for(|v| !v.edit_in_flight).await;
    let sent = api.submitted.lock().unwrap()[0].clone();
    assert_eq!((sent.score1, sent.score2), (2, 0));
    assert_eq!(sent.winner_id.as_deref(), Some("a"));
    assert!(matches!(settled.last_edit, Some(EditOutcome::LimitedEdit { .. })));
    assert_eq!(settled.winner_id.as_deref(), Some("b"));
    assert_eq!(settled.score, Some(Score::new(1, 1)));

    let refetched = h
        .wait_for(|v| v.poll_version == 2 && v.committed_version == 2)
        .await;
    assert_eq!(refetched.winner_id.as_deref(), Some("b"));
    assert_eq!(
        refetched.match_data.unwrap().winner_id.as_deref(),
        Some("b")
    );
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_edit_rolls_back() {
    let api = MockApi::new(base_match());
    api.script_submit(100, Err(500));
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);
    let before = h.ready().await;

    h.send(SessionCommand::Edit(ResultEdit {
        score1: Some(3),
        ..ResultEdit::default()
    }))
    .await;
    let view = h
        .wait_for(|v| matches!(v.last_edit, Some(EditOutcome::Failed { .. })))
        .await;
    assert_eq!(view.match_data, before.match_data);
    assert!(!view.edit_in_flight);
    assert_eq!(api.calls("submit"), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn locked_match_rejects_edit_without_network() {
    let mut done = base_match();
    done.status = MatchStatus::Completed;
    done.map_results = vec![MapResult::new("Bind", 13, 4)];
    let api = MockApi::new(done);
    *api.tournament.lock().unwrap() = tournament(true);
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);
    let view = h.ready().await;
    assert_eq!(view.permission, EditPermission::EditLocked);

    h.send(SessionCommand::Edit(ResultEdit::map_scores(vec![MapResult::new(
        "Bind", 4, 13,
    )])))
    .await;
    let view = h
        .wait_for(|v| matches!(v.last_edit, Some(EditOutcome::Rejected { .. })))
        .await;
    assert_eq!(view.score, Some(Score::new(13, 4)));
    assert_eq!(api.calls("submit"), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_edit_while_in_flight_is_rejected() {
    let api = MockApi::new(base_match());
    let mut ok = base_match();
    ok.score1 = 1;
    api.script_submit(
        2_000,
        Ok(SubmitResponse {
            updated: ok,
            limited_edit: false,
            message: None,
        }),
    );
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);
    h.ready().await;

    let edit = ResultEdit {
        score1: Some(1),
        ..ResultEdit::default()
    };
    h.send(SessionCommand::Edit(edit.clone())).await;
    h.wait_for(|v| v.edit_in_flight).await;
    h.send(SessionCommand::Edit(edit)).await;
    h.wait_for(|v| matches!(v.last_edit, Some(EditOutcome::Rejected { .. })))
        .await;

    let view = h
        .wait_for(|v| v.last_edit == Some(EditOutcome::Applied))
        .await;
    assert_eq!(view.match_data.unwrap().score1, 1);
    assert_eq!(api.calls("submit"), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_room_but_keeps_connection() {
    let api = MockApi::new(base_match());
    let (connection, server) = live_connection().await;
    let mut h = start(Arc::clone(&api), connection.clone());
    h.ready().await;
    assert!(connection.state().is_member("t1"));

    h.shutdown().await;
    assert!(!connection.state().is_member("t1"));
    assert_eq!(connection.phase(), ConnectionPhase::Connected);

    // leave-room is delivered over the still-open socket.
    timeout(Duration::from_secs(5), async {
        while !server.sent_events().contains(&"\"leave-room\"".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn switch_discards_results_for_previous_match() {
    let api = MockApi::new(base_match());
    let mut h = start(Arc::clone(&api), ConnectionHandle::Fallback);
    h.ready().await;

    let mut other = base_match();
    other.id = "m2".into();
    api.script_match(0, Ok(other));
    h.send(SessionCommand::Switch(MatchTarget::new("t1", "m2")))
        .await;

    let view = h
        .wait_for(|v| v.target.match_id == "m2" && v.load_state == LoadState::Ready)
        .await;
    assert_eq!(view.match_data.unwrap().id, "m2");
    assert_eq!(view.committed_version, 1);
    h.shutdown().await;
}
