// REST collaborator for the tournament API.
//
// `MatchApi` is the seam the reconciler depends on; `HttpMatchApi` is the
// reqwest implementation used by the binary.

pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

use matchsync_core::edit::ResultPayload;
use matchsync_core::model::{LobbySnapshot, Match, MatchSummary, Tournament};

pub use client::HttpMatchApi;
pub use error::ApiError;
pub use types::SubmitResponse;

#[async_trait]
pub trait MatchApi: Send + Sync {
    async fn fetch_match(&self, tournament_id: &str, match_id: &str) -> Result<Match, ApiError>;

    async fn fetch_tournament(&self, tournament_id: &str) -> Result<Tournament, ApiError>;

    /// Optional lobby stats. A 404 or `success: false` is `Ok(None)`.
    async fn fetch_lobby_stats(
        &self,
        match_id: &str,
        version: u64,
    ) -> Result<Option<LobbySnapshot>, ApiError>;

    async fn fetch_recent_matches(
        &self,
        side_id: &str,
        limit: u32,
    ) -> Result<Vec<MatchSummary>, ApiError>;

    async fn submit_result(
        &self,
        tournament_id: &str,
        match_id: &str,
        payload: &ResultPayload,
    ) -> Result<SubmitResponse, ApiError>;
}
