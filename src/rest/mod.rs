//! Typed client for the agent server's HTTP API
//!
//! Endpoints live under the versioned `/api/v1` prefix except `/health`. A
//! bearer token, when present, is attached to every request; a 401 clears the
//! stored token and surfaces as [`Error::Unauthorized`] with no retry.
//!
//! Session creation gets a long per-call timeout because the remote agent may
//! load models and warm its memory stores before responding; everything else
//! uses the short default.

pub mod types;

use std::sync::RwLock;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use types::{
    AgentQueryRequest, AgentQueryResponse, AgentStatusResponse, CleanupResponse,
    CreateSessionRequest, CreateSessionResponse, DeleteSessionResponse, DormantSessionsResponse,
    EntityDetailsResponse, GraphDataResponse, GraphQueryParams, GraphStatsResponse,
    HealthResponse, MemoryDataResponse, MemoryQueryParams, MemorySearchRequest,
    MemorySearchResponse, MemoryStatsResponse, RestoreSessionResponse, SessionInfo,
    SessionListResponse, SessionLogsResponse,
};

/// HTTP client for the agent server
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    session_create_timeout: Duration,
}

impl RestClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(config.auth_token.clone()),
            session_create_timeout: config.session_create_timeout(),
        })
    }

    /// Replace the bearer token used for subsequent requests
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    /// Attach auth, send, and map non-success statuses to errors.
    ///
    /// FastAPI error bodies carry the reason under `detail`; that is pulled
    /// out when present so callers get a readable message.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.set_token(None);
            tracing::warn!("Request rejected with 401, clearing stored token");
            return Err(Error::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("detail")?.as_str().map(str::to_string))
                .unwrap_or_else(|| {
                    if body.is_empty() {
                        status.to_string()
                    } else {
                        body
                    }
                });
            tracing::debug!(status = status.as_u16(), message = %message, "Request failed");
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        Ok(self.send(request).await?.json().await?)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.execute(self.http.get(self.url("/health"))).await
    }

    /// Create a session. Uses the extended per-call timeout; the agent may
    /// spend minutes initializing.
    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        let builder = self
            .http
            .post(self.api("/sessions"))
            .json(request)
            .timeout(self.session_create_timeout);
        self.execute(builder).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionInfo> {
        self.execute(self.http.get(self.api(&format!("/sessions/{session_id}"))))
            .await
    }

    pub async fn list_sessions(&self, user_id: Option<&str>) -> Result<SessionListResponse> {
        let mut builder = self.http.get(self.api("/sessions"));
        if let Some(user_id) = user_id {
            builder = builder.query(&[("user_id", user_id)]);
        }
        self.execute(builder).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<DeleteSessionResponse> {
        self.execute(
            self.http
                .delete(self.api(&format!("/sessions/{session_id}"))),
        )
        .await
    }

    pub async fn cleanup_sessions(&self) -> Result<CleanupResponse> {
        self.execute(self.http.post(self.api("/sessions/cleanup")))
            .await
    }

    pub async fn dormant_sessions(&self) -> Result<DormantSessionsResponse> {
        self.execute(self.http.get(self.api("/sessions/dormant")))
            .await
    }

    pub async fn restore_session(&self, session_id: &str) -> Result<RestoreSessionResponse> {
        self.execute(
            self.http
                .post(self.api(&format!("/sessions/{session_id}/restore"))),
        )
        .await
    }

    /// HTTP fallback for the WebSocket `query` message
    pub async fn query_agent(
        &self,
        session_id: &str,
        request: &AgentQueryRequest,
    ) -> Result<AgentQueryResponse> {
        self.execute(
            self.http
                .post(self.api(&format!("/sessions/{session_id}/query")))
                .json(request),
        )
        .await
    }

    pub async fn agent_status(&self, session_id: &str) -> Result<AgentStatusResponse> {
        self.execute(
            self.http
                .get(self.api(&format!("/sessions/{session_id}/status"))),
        )
        .await
    }

    pub async fn memory_data(
        &self,
        session_id: &str,
        params: &MemoryQueryParams,
    ) -> Result<MemoryDataResponse> {
        self.execute(
            self.http
                .get(self.api(&format!("/sessions/{session_id}/memory")))
                .query(params),
        )
        .await
    }

    pub async fn search_memory(
        &self,
        session_id: &str,
        request: &MemorySearchRequest,
    ) -> Result<MemorySearchResponse> {
        self.execute(
            self.http
                .post(self.api(&format!("/sessions/{session_id}/memory/search")))
                .json(request),
        )
        .await
    }

    pub async fn memory_stats(&self, session_id: &str) -> Result<MemoryStatsResponse> {
        self.execute(
            self.http
                .get(self.api(&format!("/sessions/{session_id}/memory/stats"))),
        )
        .await
    }

    pub async fn graph_data(
        &self,
        session_id: &str,
        params: &GraphQueryParams,
    ) -> Result<GraphDataResponse> {
        self.execute(
            self.http
                .get(self.api(&format!("/sessions/{session_id}/graph")))
                .query(params),
        )
        .await
    }

    pub async fn entity_details(
        &self,
        session_id: &str,
        entity_id: &str,
    ) -> Result<EntityDetailsResponse> {
        self.execute(self.http.get(self.api(&format!(
            "/sessions/{session_id}/graph/entity/{entity_id}"
        ))))
        .await
    }

    pub async fn graph_stats(&self, session_id: &str) -> Result<GraphStatsResponse> {
        self.execute(
            self.http
                .get(self.api(&format!("/sessions/{session_id}/graph/stats"))),
        )
        .await
    }

    pub async fn session_logs(&self, session_id: &str) -> Result<SessionLogsResponse> {
        self.execute(
            self.http
                .get(self.api(&format!("/sessions/{session_id}/logs"))),
        )
        .await
    }

    /// Raw contents of one server-side session log file
    pub async fn session_log(&self, session_id: &str, name: &str) -> Result<String> {
        let response = self
            .send(
                self.http
                    .get(self.api(&format!("/sessions/{session_id}/logs/{name}"))),
            )
            .await?;
        Ok(response.text().await?)
    }
}
