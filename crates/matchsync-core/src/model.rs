// Match, tournament and lobby data as served by the tournament API.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque reference to a team or solo entrant.
pub type SideId = String;

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

/// Lifecycle of a single match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    #[serde(alias = "pending")]
    Scheduled,
    #[serde(alias = "in_progress", alias = "ongoing")]
    Live,
    Completed,
    Cancelled,
}

impl MatchStatus {
    pub fn is_completed(self) -> bool {
        self == MatchStatus::Completed
    }
}

/// One played map/game within a match. Points stay `None` until reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapResult {
    pub map_name: String,
    #[serde(default)]
    pub score1: Option<i32>,
    #[serde(default)]
    pub score2: Option<i32>,
}

impl MapResult {
    pub fn new(map_name: impl Into<String>, score1: i32, score2: i32) -> Self {
        Self {
            map_name: map_name.into(),
            score1: Some(score1),
            score2: Some(score2),
        }
    }

    /// A map with no points on either side has not been played or reported.
    pub fn is_reported(&self) -> bool {
        self.score1.is_some() || self.score2.is_some()
    }

    /// Points for both sides, treating an unreported side as zero.
    pub fn points(&self) -> (i32, i32) {
        (self.score1.unwrap_or(0), self.score2.unwrap_or(0))
    }
}

/// Whether a veto step picked or banned the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAction {
    Pick,
    Ban,
}

/// One step of a pick/ban negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionEvent {
    pub step_index: u32,
    pub action_type: SelectionAction,
    pub actor_side_id: SideId,
    pub map_name: String,
}

/// Canonical entity for one contest between two sides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: String,
    pub tournament_id: String,
    #[serde(default)]
    pub side1_id: Option<SideId>,
    #[serde(default)]
    pub side2_id: Option<SideId>,
    #[serde(default)]
    pub status: MatchStatus,
    /// Match-level counters. Only authoritative when there are no map results.
    #[serde(default)]
    pub score1: i32,
    #[serde(default)]
    pub score2: i32,
    #[serde(default)]
    pub map_results: Vec<MapResult>,
    /// Veto history in chronological order.
    #[serde(default)]
    pub selections: Vec<SelectionEvent>,
    #[serde(default)]
    pub winner_id: Option<SideId>,
    #[serde(default)]
    pub lobby_snapshot: Option<LobbySnapshot>,
    #[serde(default)]
    pub round: Option<u32>,
    /// Free-form bracket tag ("winners", "losers", "third_place", ...).
    #[serde(default)]
    pub bracket: Option<String>,
    /// Match the winner advances to.
    #[serde(default)]
    pub next_match_id: Option<String>,
    /// Match the loser drops to (double elimination).
    #[serde(default)]
    pub loser_next_match_id: Option<String>,
    /// Set by the server once downstream bracket state freezes this result.
    #[serde(default)]
    pub result_locked: bool,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Match {
    /// Sort the veto history by step index and drop repeated steps.
    ///
    /// Applying the same server payload twice must not duplicate entries, so
    /// every merge path runs through here.
    pub fn normalize(&mut self) {
        self.selections.sort_by_key(|s| s.step_index);
        self.selections.dedup_by_key(|s| s.step_index);
    }

    /// Which side (1 or 2) a participant reference belongs to.
    pub fn side_number(&self, side_id: &str) -> Option<u8> {
        if self.side1_id.as_deref() == Some(side_id) {
            Some(1)
        } else if self.side2_id.as_deref() == Some(side_id) {
            Some(2)
        } else {
            None
        }
    }

    /// The participant opposite to `side_id`, if both sides are known.
    pub fn opponent_of(&self, side_id: &str) -> Option<&SideId> {
        match self.side_number(side_id)? {
            1 => self.side2_id.as_ref(),
            _ => self.side1_id.as_ref(),
        }
    }

    pub fn side_ids(&self) -> impl Iterator<Item = &SideId> {
        self.side1_id.iter().chain(self.side2_id.iter())
    }
}

// ---------------------------------------------------------------------------
// Lobby snapshot
// ---------------------------------------------------------------------------

/// Per-map line score produced by the match-hosting lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyMap {
    pub map_name: String,
    #[serde(default)]
    pub score1: Option<i32>,
    #[serde(default)]
    pub score2: Option<i32>,
    #[serde(default)]
    pub winner_side_id: Option<SideId>,
}

/// One player's stat line. Stat keys vary per game title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatRow {
    pub player_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub side_id: Option<SideId>,
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leader {
    pub category: String,
    pub player_id: String,
    #[serde(default)]
    pub nickname: String,
    pub value: f64,
}

/// Richer statistics for matches driven through the in-app veto lobby.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbySnapshot {
    #[serde(default)]
    pub maps: Vec<LobbyMap>,
    #[serde(default)]
    pub pickban: Vec<SelectionEvent>,
    #[serde(default)]
    pub players_by_team: BTreeMap<SideId, Vec<PlayerStatRow>>,
    #[serde(default)]
    pub players_by_map: BTreeMap<String, Vec<PlayerStatRow>>,
    #[serde(default)]
    pub leaders: Vec<Leader>,
    /// Correlation key for downloadable artifacts (demo files).
    #[serde(default)]
    pub match_correlation_id: Option<String>,
}

impl LobbySnapshot {
    /// Line scores expressed as match map results.
    pub fn map_results(&self) -> Vec<MapResult> {
        self.maps
            .iter()
            .map(|m| MapResult {
                map_name: m.map_name.clone(),
                score1: m.score1,
                score2: m.score2,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tournament / bracket metadata
// ---------------------------------------------------------------------------

/// Bracket-level view of a match, as listed on the tournament.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketMatch {
    pub id: String,
    #[serde(default)]
    pub round: Option<u32>,
    #[serde(default)]
    pub bracket: Option<String>,
    #[serde(default)]
    pub status: MatchStatus,
    #[serde(default)]
    pub side1_id: Option<SideId>,
    #[serde(default)]
    pub side2_id: Option<SideId>,
    #[serde(default)]
    pub winner_id: Option<SideId>,
    #[serde(default)]
    pub next_match_id: Option<String>,
    #[serde(default)]
    pub loser_next_match_id: Option<String>,
}

impl BracketMatch {
    /// A result has been recorded for this match.
    pub fn has_result(&self) -> bool {
        self.status.is_completed() || self.winner_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tournament {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Bracket format tag ("single_elimination", "double_elimination", ...).
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub matches: Vec<BracketMatch>,
}

impl Tournament {
    pub fn bracket_match(&self, match_id: &str) -> Option<&BracketMatch> {
        self.matches.iter().find(|m| m.id == match_id)
    }
}

/// Compact record used for a side's recent match history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSummary {
    pub id: String,
    #[serde(default)]
    pub tournament_id: Option<String>,
    #[serde(default)]
    pub side1_id: Option<SideId>,
    #[serde(default)]
    pub side2_id: Option<SideId>,
    #[serde(default)]
    pub status: MatchStatus,
    #[serde(default)]
    pub score1: i32,
    #[serde(default)]
    pub score2: i32,
    #[serde(default)]
    pub winner_id: Option<SideId>,
    #[serde(default)]
    pub played_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Score
// ---------------------------------------------------------------------------

/// A pair of per-side counters (points or maps won).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Score {
    pub side1: i32,
    pub side2: i32,
}

impl Score {
    pub const fn new(side1: i32, side2: i32) -> Self {
        Self { side1, side2 }
    }

    pub fn is_tied(&self) -> bool {
        self.side1 == self.side2
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.side1, self.side2)
    }
}
