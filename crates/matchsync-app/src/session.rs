// Per-match session state.
//
// Everything the watcher loop knows about one match, plus the rules for
// merging fetch results into it. Kept free of I/O so the ordering rules can
// be tested directly.
//
// Ordering:
// - every refetch is tagged with the poll version current when it started;
// - a result older than the last committed version is discarded;
// - while an edit is in flight, and after it until the refetch started by
//   the post-submit bump lands, the local snapshot wins over fetch results.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use matchsync_api::SubmitResponse;
use matchsync_core::bracket::BracketKind;
use matchsync_core::edit::{EditPermission, ResultEdit, ResultPayload};
use matchsync_core::model::{LobbySnapshot, Match, MatchSummary, SideId, Tournament};
use matchsync_core::score;

use crate::protocol::{EditError, EditOutcome, LoadState, MatchTarget, MatchView};

/// What happened to a fetch result handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Applied,
    /// Older than what is already committed.
    Stale,
    /// Superseded by the local snapshot of a recent edit.
    Held,
    /// Started for a different match.
    Unrelated,
}

#[derive(Debug, Clone)]
struct PendingEdit {
    /// Snapshot restored if the submit fails.
    previous: Match,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub target: MatchTarget,
    pub load_state: LoadState,
    /// Canonical match as last committed (server data or an edit snapshot).
    pub current: Option<Match>,
    pub tournament: Option<Tournament>,
    pub lobby: Option<LobbySnapshot>,
    pub recent_matches: BTreeMap<SideId, Vec<MatchSummary>>,
    pub permission: EditPermission,
    /// Latest poll version handed out.
    pub poll_version: u64,
    /// Version of the core fetch currently reflected in `current`.
    pub committed_version: u64,
    lobby_version: u64,
    pending_edit: Option<PendingEdit>,
    /// Core fetches below this version are held back after an edit.
    /// `u64::MAX` while the submit is in flight.
    edit_floor: Option<u64>,
    pub last_error: Option<String>,
    pub last_edit: Option<EditOutcome>,
    recent_requested: bool,
}

impl SessionState {
    pub fn new(target: MatchTarget) -> Self {
        Self {
            target,
            load_state: LoadState::Loading,
            current: None,
            tournament: None,
            lobby: None,
            recent_matches: BTreeMap::new(),
            permission: EditPermission::EditableLive,
            poll_version: 0,
            committed_version: 0,
            lobby_version: 0,
            pending_edit: None,
            edit_floor: None,
            last_error: None,
            last_edit: None,
            recent_requested: false,
        }
    }

    /// Hand out the next poll version. Strictly increasing.
    pub fn bump(&mut self) -> u64 {
        self.poll_version += 1;
        self.poll_version
    }

    /// Manual retry: leave the failed state and hand out a fresh version.
    pub fn retry(&mut self) -> u64 {
        if matches!(self.load_state, LoadState::Failed(_)) {
            self.load_state = LoadState::Loading;
        }
        self.bump()
    }

    pub fn edit_in_flight(&self) -> bool {
        self.pending_edit.is_some()
    }

    fn concerns(&self, match_id: &str) -> bool {
        if match_id == self.target.match_id {
            true
        } else {
            debug!(
                match_id,
                watching = %self.target.match_id,
                "ignoring result for a match no longer watched"
            );
            false
        }
    }

    // -----------------------------------------------------------------------
    // Fetch results
    // -----------------------------------------------------------------------

    /// Merge a match+tournament fetch started at `version`.
    ///
    /// Applying the same result twice leaves the state unchanged.
    pub fn apply_fetch(
        &mut self,
        match_id: &str,
        version: u64,
        mut fetched: Match,
        tournament: Tournament,
    ) -> Merge {
        if !self.concerns(match_id) {
            return Merge::Unrelated;
        }
        if version < self.committed_version {
            debug!(
                version,
                committed = self.committed_version,
                "discarding stale match fetch"
            );
            return Merge::Stale;
        }
        if let Some(floor) = self.edit_floor {
            if version < floor {
                debug!(version, floor, "holding local edit snapshot over fetch");
                return Merge::Held;
            }
            self.edit_floor = None;
        }

        fetched.normalize();
        let permission =
            EditPermission::compute(&fetched, Some(&tournament)).latch(self.permission);
        if permission != self.permission {
            info!(from = ?self.permission, to = ?permission, "edit permission changed");
        }
        self.permission = permission;
        self.current = Some(fetched);
        self.tournament = Some(tournament);
        self.committed_version = version;
        self.load_state = LoadState::Ready;
        self.last_error = None;
        Merge::Applied
    }

    /// Record a failed match fetch. Loaded data is kept; only the very first
    /// load turns into the failed state.
    pub fn apply_fetch_error(&mut self, match_id: &str, version: u64, error: String) -> Merge {
        if !self.concerns(match_id) {
            return Merge::Unrelated;
        }
        if version < self.committed_version {
            debug!(version, "discarding stale fetch failure: {error}");
            return Merge::Stale;
        }
        warn!(version, "match fetch failed: {error}");
        if self.current.is_some() {
            self.last_error = Some(error);
        } else {
            self.load_state = LoadState::Failed(error);
        }
        Merge::Applied
    }

    pub fn apply_lobby(
        &mut self,
        match_id: &str,
        version: u64,
        snapshot: Option<LobbySnapshot>,
    ) -> Merge {
        if !self.concerns(match_id) {
            return Merge::Unrelated;
        }
        if version < self.lobby_version {
            debug!(version, "discarding stale lobby fetch");
            return Merge::Stale;
        }
        self.lobby_version = version;
        self.lobby = snapshot;
        Merge::Applied
    }

    pub fn apply_recent(
        &mut self,
        match_id: &str,
        side_id: SideId,
        matches: Vec<MatchSummary>,
    ) -> Merge {
        if !self.concerns(match_id) {
            return Merge::Unrelated;
        }
        self.recent_matches.insert(side_id, matches);
        Merge::Applied
    }

    /// Side ids whose recent matches should be fetched. Returns them once per
    /// session, after the match has loaded.
    pub fn take_recent_request(&mut self) -> Vec<SideId> {
        if self.recent_requested {
            return Vec::new();
        }
        let Some(m) = &self.current else {
            return Vec::new();
        };
        self.recent_requested = true;
        m.side_ids().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Edits
    // -----------------------------------------------------------------------

    /// Validate an edit and switch to its speculative snapshot. Returns the
    /// request body to submit.
    pub fn begin_edit(&mut self, edit: &ResultEdit) -> Result<ResultPayload, EditError> {
        if self.pending_edit.is_some() {
            return Err(EditError::InFlight);
        }
        let Some(current) = &self.current else {
            return Err(EditError::NotLoaded);
        };
        self.permission.check(edit)?;

        let next = edit.apply(current, self.permission);
        let payload = ResultPayload::from(&next);
        self.pending_edit = Some(PendingEdit {
            previous: current.clone(),
        });
        self.edit_floor = Some(u64::MAX);
        self.current = Some(next);
        Ok(payload)
    }

    /// Record an edit refused before submission.
    pub fn reject_edit(&mut self, error: &EditError) {
        info!("edit rejected: {error}");
        self.last_edit = Some(EditOutcome::Rejected {
            reason: error.to_string(),
        });
    }

    /// Settle the in-flight edit and bump the poll version. The caller
    /// refetches at the returned version; until that lands, the snapshot
    /// chosen here stays authoritative.
    pub fn finish_edit(
        &mut self,
        match_id: &str,
        result: Result<SubmitResponse, String>,
    ) -> Option<u64> {
        if !self.concerns(match_id) {
            return None;
        }
        let Some(pending) = self.pending_edit.take() else {
            warn!("submit result arrived with no edit in flight");
            return None;
        };

        let outcome = match result {
            Ok(resp) => {
                let mut updated = resp.updated;
                updated.normalize();
                if let Some(t) = &self.tournament {
                    self.permission =
                        EditPermission::compute(&updated, Some(t)).latch(self.permission);
                }
                self.current = Some(updated);
                if resp.limited_edit {
                    info!(message = ?resp.message, "limited edit: adopting server snapshot");
                    EditOutcome::LimitedEdit {
                        message: resp.message,
                    }
                } else {
                    info!("edit applied");
                    EditOutcome::Applied
                }
            }
            Err(error) => {
                warn!("edit failed, restoring last known-good snapshot: {error}");
                self.current = Some(pending.previous);
                self.last_error = Some(error.clone());
                EditOutcome::Failed { error }
            }
        };
        self.last_edit = Some(outcome);

        let version = self.bump();
        self.edit_floor = Some(version);
        Some(version)
    }

    // -----------------------------------------------------------------------
    // Read model
    // -----------------------------------------------------------------------

    /// Current match with lobby data filled in where the match has none.
    pub fn merged_match(&self) -> Option<Match> {
        let mut m = self.current.clone()?;
        if let Some(lobby) = &self.lobby {
            if m.map_results.is_empty() && !lobby.maps.is_empty() {
                m.map_results = lobby.map_results();
            }
            if m.selections.is_empty() && !lobby.pickban.is_empty() {
                m.selections = lobby.pickban.clone();
                m.normalize();
            }
            m.lobby_snapshot = Some(lobby.clone());
        }
        Some(m)
    }

    pub fn view(&self) -> MatchView {
        let merged = self.merged_match();
        MatchView {
            target: self.target.clone(),
            load_state: self.load_state.clone(),
            score: merged.as_ref().map(score::derived_score),
            winner_id: merged.as_ref().and_then(score::resolve_winner),
            bracket: merged
                .as_ref()
                .map(|m| BracketKind::of_match(m, self.tournament.as_ref()))
                .unwrap_or(BracketKind::Unknown),
            match_data: merged,
            permission: self.permission,
            poll_version: self.poll_version,
            committed_version: self.committed_version,
            has_lobby: self.lobby.is_some(),
            correlation_id: self
                .lobby
                .as_ref()
                .and_then(|l| l.match_correlation_id.clone()),
            recent_matches: self.recent_matches.clone(),
            last_error: self.last_error.clone(),
            last_edit: self.last_edit.clone(),
            edit_in_flight: self.edit_in_flight(),
        }
    }
}
