// Messages exchanged between the watcher loop, its fetch tasks and its
// consumers.

use std::collections::BTreeMap;

use thiserror::Error;

use matchsync_api::SubmitResponse;
use matchsync_core::bracket::BracketKind;
use matchsync_core::edit::{EditPermission, EditRejection, ResultEdit};
use matchsync_core::model::{LobbySnapshot, Match, MatchSummary, Score, SideId, Tournament};

/// Which match a session watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchTarget {
    pub tournament_id: String,
    pub match_id: String,
}

impl MatchTarget {
    pub fn new(tournament_id: impl Into<String>, match_id: impl Into<String>) -> Self {
        Self {
            tournament_id: tournament_id.into(),
            match_id: match_id.into(),
        }
    }
}

/// Commands from the consumer to the watcher loop.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Submit an admin result edit.
    Edit(ResultEdit),
    /// Manual refetch, e.g. after a load failure.
    Retry,
    /// Stop watching the current match and watch another one.
    Switch(MatchTarget),
    Shutdown,
}

/// Updates from the watcher loop to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    /// The read model changed.
    Snapshot(Box<MatchView>),
    /// The loop has exited.
    Stopped,
}

/// Results delivered by spawned fetch tasks. Each carries the match id (and,
/// where it matters, the poll version) it was started for.
#[derive(Debug)]
pub enum FetchEvent {
    Core {
        match_id: String,
        version: u64,
        result: Result<(Match, Tournament), String>,
    },
    Lobby {
        match_id: String,
        version: u64,
        snapshot: Option<LobbySnapshot>,
    },
    Recent {
        match_id: String,
        side_id: SideId,
        matches: Vec<MatchSummary>,
    },
    Submitted {
        match_id: String,
        result: Result<SubmitResponse, String>,
    },
}

impl FetchEvent {
    pub fn match_id(&self) -> &str {
        match self {
            FetchEvent::Core { match_id, .. }
            | FetchEvent::Lobby { match_id, .. }
            | FetchEvent::Recent { match_id, .. }
            | FetchEvent::Submitted { match_id, .. } => match_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Loading,
    Ready,
    /// The initial fetch failed. Cleared by a successful retry.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Applied,
    /// The server applied part of the edit; its snapshot replaced ours.
    LimitedEdit { message: Option<String> },
    /// The submit failed and the last known-good snapshot was restored.
    Failed { error: String },
    /// Refused before any network call.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("an edit is already being submitted")]
    InFlight,
    #[error("match data has not loaded yet")]
    NotLoaded,
    #[error(transparent)]
    Rejected(#[from] EditRejection),
}

/// Read model for one watched match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchView {
    pub target: MatchTarget,
    pub load_state: LoadState,
    /// Canonical match with lobby data merged in.
    pub match_data: Option<Match>,
    pub score: Option<Score>,
    pub winner_id: Option<SideId>,
    pub permission: EditPermission,
    pub bracket: BracketKind,
    pub poll_version: u64,
    pub committed_version: u64,
    pub has_lobby: bool,
    /// Key for downloadable demo artifacts, from the lobby snapshot.
    pub correlation_id: Option<String>,
    pub recent_matches: BTreeMap<SideId, Vec<MatchSummary>>,
    /// Last refetch failure while data was already loaded.
    pub last_error: Option<String>,
    pub last_edit: Option<EditOutcome>,
    pub edit_in_flight: bool,
}
