// Response envelopes that differ from the core model.

use serde::Deserialize;

use matchsync_core::model::{LobbySnapshot, Match};

/// Body of the lobby-stats endpoint: the snapshot fields plus a `success`
/// flag. Anything but `success: true` means no lobby data for the match.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyStatsResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(flatten)]
    pub snapshot: LobbySnapshot,
}

impl LobbyStatsResponse {
    pub fn into_snapshot(self) -> Option<LobbySnapshot> {
        if self.success == Some(true) {
            Some(self.snapshot)
        } else {
            None
        }
    }
}

/// Body of the match-result endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(rename = "match")]
    pub updated: Match,
    /// The server applied only part of the edit; `updated` is authoritative.
    #[serde(default)]
    pub limited_edit: bool,
    #[serde(default)]
    pub message: Option<String>,
}
