// Edit permissions for admin result edits.
//
// A match moves through three states:
//
//   EditableLive ──(completed)──▶ EditableCompleted ──(downstream played)──▶ EditLocked
//
// The lock is driven by server-reported bracket state and is never undone by
// client-side logic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bracket;
use crate::model::{MapResult, Match, SideId, Tournament};
use crate::score;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditPermission {
    /// Not completed: every result field may be set.
    EditableLive,
    /// Completed, no dependent match played yet: per-map scores only.
    EditableCompleted,
    /// Completed and a dependent match already has a result.
    EditLocked,
}

impl EditPermission {
    /// Compute the permission for a match from its own status and the
    /// tournament's bracket state.
    pub fn compute(m: &Match, tournament: Option<&Tournament>) -> Self {
        if !m.status.is_completed() {
            return EditPermission::EditableLive;
        }
        let downstream = tournament.is_some_and(|t| bracket::downstream_played(m, t));
        if m.result_locked || downstream {
            EditPermission::EditLocked
        } else {
            EditPermission::EditableCompleted
        }
    }

    /// Combine with a previously observed permission. Once locked, stays
    /// locked.
    pub fn latch(self, previous: EditPermission) -> Self {
        if previous == EditPermission::EditLocked {
            EditPermission::EditLocked
        } else {
            self
        }
    }

    /// Check an edit against this permission before anything is sent.
    pub fn check(self, edit: &ResultEdit) -> Result<(), EditRejection> {
        if edit.is_empty() {
            return Err(EditRejection::Empty);
        }
        match self {
            EditPermission::EditableLive => Ok(()),
            EditPermission::EditLocked => Err(EditRejection::Locked),
            EditPermission::EditableCompleted => {
                if edit.winner_id.is_some() {
                    return Err(EditRejection::FieldNotEditable { field: "winnerId" });
                }
                if edit.score1.is_some() || edit.score2.is_some() {
                    return Err(EditRejection::FieldNotEditable { field: "score" });
                }
                Ok(())
            }
        }
    }
}

/// Why an edit was refused client-side, before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditRejection {
    #[error("result is locked: a dependent bracket match has already been played")]
    Locked,
    #[error("field `{field}` cannot be edited on a completed match")]
    FieldNotEditable { field: &'static str },
    #[error("edit does not change anything")]
    Empty,
}

/// Admin edit command. `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultEdit {
    pub winner_id: Option<SideId>,
    pub score1: Option<i32>,
    pub score2: Option<i32>,
    pub map_results: Option<Vec<MapResult>>,
}

impl ResultEdit {
    pub fn map_scores(map_results: Vec<MapResult>) -> Self {
        Self {
            map_results: Some(map_results),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.winner_id.is_none()
            && self.score1.is_none()
            && self.score2.is_none()
            && self.map_results.is_none()
    }

    /// Build the speculative post-edit match.
    ///
    /// On a completed match only map scores change and the counters and
    /// winner are recomputed from them. On a live match explicit fields are
    /// taken as given; counters missing from the edit are derived from new
    /// map results, and the winner is recomputed unless set explicitly.
    pub fn apply(&self, current: &Match, permission: EditPermission) -> Match {
        let mut next = current.clone();
        if let Some(maps) = &self.map_results {
            next.map_results = maps.clone();
        }

        if permission == EditPermission::EditableCompleted {
            score::apply_derived(&mut next);
            return next;
        }

        if self.map_results.is_some() && self.score1.is_none() && self.score2.is_none() {
            let derived = score::derived_score(&next);
            next.score1 = derived.side1;
            next.score2 = derived.side2;
        }
        if let Some(s1) = self.score1 {
            next.score1 = s1;
        }
        if let Some(s2) = self.score2 {
            next.score2 = s2;
        }
        next.winner_id = match &self.winner_id {
            Some(w) => Some(w.clone()),
            None => score::winner_from_scores(&next),
        };
        next
    }
}

/// Request body for the match-result endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub winner_id: Option<SideId>,
    pub score1: i32,
    pub score2: i32,
    pub map_results: Vec<MapResult>,
}

impl From<&Match> for ResultPayload {
    fn from(m: &Match) -> Self {
        Self {
            winner_id: m.winner_id.clone(),
            score1: m.score1,
            score2: m.score2,
            map_results: m.map_results.clone(),
        }
    }
}
