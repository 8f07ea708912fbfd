// Tournament-room push payloads.
//
// Push events are hints that something changed, never state to merge. They
// are parsed just far enough to decide whether a watcher should refetch.

use serde::Deserialize;
use serde_json::Value;

/// Inbound event name carrying tournament updates.
pub const TOURNAMENT_UPDATED: &str = "tournament-updated";

/// Update-type discriminator. Unknown types are kept as `Other` so new server
/// update kinds still trigger a refetch instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    MatchUpdated,
    MatchesUpdate,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    #[serde(default)]
    pub tournament_id: Option<String>,
    #[serde(default)]
    pub match_id: Option<String>,
}

impl TournamentUpdate {
    pub fn parse(value: &Value) -> Result<Self, serde_json::Error> {
        TournamentUpdate::deserialize(value)
    }

    /// Whether this update plausibly concerns the watched match: the subject
    /// match is ours, or the update is scoped to our tournament (bracket
    /// changes elsewhere can alter our edit lock).
    pub fn concerns(&self, tournament_id: &str, match_id: &str) -> bool {
        if self.match_id.as_deref() == Some(match_id) {
            return true;
        }
        self.tournament_id.as_deref() == Some(tournament_id)
    }
}
