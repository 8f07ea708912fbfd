// reqwest implementation of `MatchApi`.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use matchsync_core::config::Config;
use matchsync_core::edit::ResultPayload;
use matchsync_core::model::{LobbySnapshot, Match, MatchSummary, Tournament};

use crate::error::ApiError;
use crate::types::{LobbyStatsResponse, SubmitResponse};
use crate::MatchApi;

/// Error bodies are truncated to this many bytes in `ApiError::Status`.
const MAX_ERROR_BODY: usize = 512;

pub struct HttpMatchApi {
    http: reqwest::Client,
    base_url: Url,
    token: RwLock<Option<String>>,
}

impl HttpMatchApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let parsed = Url::parse(base_url).map_err(|e| ApiError::InvalidBaseUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl {
                url: base_url.to_string(),
                message: "not a hierarchical url".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self {
            http,
            base_url: parsed,
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            &config.server.api_base_url,
            config.credentials.token.clone(),
            Duration::from_secs(config.sync.request_timeout_secs),
        )
    }

    /// Replace the bearer token used for subsequent requests.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) =
            token.filter(|t| !t.is_empty());
    }

    /// Base url with `segments` appended as percent-encoded path segments.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects cannot-be-a-base urls, so this always succeeds.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().unwrap_or_else(PoisonError::into_inner);
        match token.as_deref() {
            Some(t) => request.bearer_auth(t),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, url: &Url) -> Result<reqwest::Response, ApiError> {
        debug!(%url, "api request");
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|source| ApiError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response, url: &Url) -> Result<T, ApiError> {
        let bytes = response.bytes().await.map_err(|source| ApiError::Request {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let response = self.send(self.http.get(url.clone()), &url).await?;
        Self::decode(response, &url).await
    }
}

#[async_trait]
impl MatchApi for HttpMatchApi {
    async fn fetch_match(&self, tournament_id: &str, match_id: &str) -> Result<Match, ApiError> {
        let url = self.endpoint(&["tournaments", tournament_id, "matches", match_id]);
        let mut m: Match = self.get_json(url).await?;
        m.normalize();
        Ok(m)
    }

    async fn fetch_tournament(&self, tournament_id: &str) -> Result<Tournament, ApiError> {
        let url = self.endpoint(&["tournaments", tournament_id]);
        self.get_json(url).await
    }

    async fn fetch_lobby_stats(
        &self,
        match_id: &str,
        version: u64,
    ) -> Result<Option<LobbySnapshot>, ApiError> {
        let mut url = self.endpoint(&["matches", match_id, "lobby-stats"]);
        url.query_pairs_mut()
            .append_pair("version", &version.to_string());

        let response = match self.send(self.http.get(url.clone()), &url).await {
            Ok(response) => response,
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                debug!(match_id, "no lobby stats (404)");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let body: LobbyStatsResponse = Self::decode(response, &url).await?;
        let snapshot = body.into_snapshot();
        if snapshot.is_none() {
            debug!(match_id, "lobby stats response carried no snapshot");
        }
        Ok(snapshot)
    }

    async fn fetch_recent_matches(
        &self,
        side_id: &str,
        limit: u32,
    ) -> Result<Vec<MatchSummary>, ApiError> {
        let mut url = self.endpoint(&["sides", side_id, "matches"]);
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn submit_result(
        &self,
        tournament_id: &str,
        match_id: &str,
        payload: &ResultPayload,
    ) -> Result<SubmitResponse, ApiError> {
        let url = self.endpoint(&["tournaments", tournament_id, "matches", match_id, "result"]);
        let response = self
            .send(self.http.put(url.clone()).json(payload), &url)
            .await?;
        let mut body: SubmitResponse = Self::decode(response, &url).await?;
        body.updated.normalize();
        if body.limited_edit {
            warn!(
                match_id,
                message = body.message.as_deref().unwrap_or(""),
                "server applied a limited edit"
            );
        }
        Ok(body)
    }
}
