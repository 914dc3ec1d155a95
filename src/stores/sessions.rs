//! Session list store
//!
//! Wraps the REST client with the list/current-selection state the console
//! renders. Every action records its failure in the error slot before
//! returning it, so a panel can stay up and show the message while the
//! caller decides what to do.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::ChangeSignal;
use crate::error::{Error, Result};
use crate::rest::types::{
    CleanupResponse, CreateSessionRequest, DormantSession, SessionConfig, SessionInfo,
};
use crate::rest::RestClient;

/// Owns the active and dormant session lists and the current selection
pub struct SessionStore {
    rest: Arc<RestClient>,
    state: Mutex<SessionState>,
    signal: ChangeSignal,
}

struct SessionState {
    sessions: Vec<SessionInfo>,
    dormant: Vec<DormantSession>,
    current: Option<String>,
    error: Option<String>,
}

impl SessionStore {
    pub(crate) fn new(rest: Arc<RestClient>) -> Self {
        Self {
            rest,
            state: Mutex::new(SessionState {
                sessions: Vec::new(),
                dormant: Vec::new(),
                current: None,
                error: None,
            }),
            signal: ChangeSignal::new(),
        }
    }

    /// Create a session and select it.
    ///
    /// The create response only carries the new id, so the full record is
    /// fetched immediately after.
    pub async fn create_session(
        &self,
        config: SessionConfig,
        user_id: Option<&str>,
    ) -> Result<SessionInfo> {
        let request = CreateSessionRequest {
            config,
            user_id: user_id.map(str::to_string),
        };
        let created = match self.rest.create_session(&request).await {
            Ok(created) => created,
            Err(e) => return Err(self.record(e)),
        };
        tracing::info!(session_id = %created.session_id, "Session created");
        let info = match self.rest.get_session(&created.session_id).await {
            Ok(info) => info,
            Err(e) => return Err(self.record(e)),
        };
        self.adopt(info.clone());
        Ok(info)
    }

    /// Select a session, fetching its record when it is not already listed
    pub async fn select_session(&self, session_id: &str) -> Result<SessionInfo> {
        let cached = {
            let state = self.lock();
            state
                .sessions
                .iter()
                .find(|s| s.session_id == session_id)
                .cloned()
        };
        if let Some(info) = cached {
            self.lock().current = Some(session_id.to_string());
            self.signal.notify();
            return Ok(info);
        }

        let info = match self.rest.get_session(session_id).await {
            Ok(info) => info,
            Err(e) => return Err(self.record(e)),
        };
        self.adopt(info.clone());
        Ok(info)
    }

    /// Delete a session. Destructive; callers confirm before invoking.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        if let Err(e) = self.rest.delete_session(session_id).await {
            return Err(self.record(e));
        }
        {
            let mut state = self.lock();
            state.sessions.retain(|s| s.session_id != session_id);
            if state.current.as_deref() == Some(session_id) {
                state.current = None;
            }
        }
        self.signal.notify();
        tracing::info!(session_id, "Session deleted");
        Ok(())
    }

    /// Reload the active session list from the server.
    ///
    /// The current selection is kept only when it is still listed.
    pub async fn refresh_sessions(&self, user_id: Option<&str>) -> Result<Vec<SessionInfo>> {
        let response = match self.rest.list_sessions(user_id).await {
            Ok(response) => response,
            Err(e) => return Err(self.record(e)),
        };
        {
            let mut state = self.lock();
            if let Some(current) = state.current.clone() {
                if !response.sessions.iter().any(|s| s.session_id == current) {
                    state.current = None;
                }
            }
            state.sessions = response.sessions.clone();
        }
        self.signal.notify();
        Ok(response.sessions)
    }

    /// Reload the dormant session list
    pub async fn refresh_dormant(&self) -> Result<Vec<DormantSession>> {
        let response = match self.rest.dormant_sessions().await {
            Ok(response) => response,
            Err(e) => return Err(self.record(e)),
        };
        self.lock().dormant = response.sessions.clone();
        self.signal.notify();
        Ok(response.sessions)
    }

    /// Restore a dormant session and select it
    pub async fn restore_session(&self, session_id: &str) -> Result<SessionInfo> {
        if let Err(e) = self.rest.restore_session(session_id).await {
            return Err(self.record(e));
        }
        let info = match self.rest.get_session(session_id).await {
            Ok(info) => info,
            Err(e) => return Err(self.record(e)),
        };
        {
            let mut state = self.lock();
            state.dormant.retain(|s| s.session_id != session_id);
        }
        self.adopt(info.clone());
        tracing::info!(session_id, "Session restored");
        Ok(info)
    }

    /// Ask the server to sweep idle sessions, then reload the list
    pub async fn cleanup(&self) -> Result<CleanupResponse> {
        let response = match self.rest.cleanup_sessions().await {
            Ok(response) => response,
            Err(e) => return Err(self.record(e)),
        };
        self.refresh_sessions(None).await?;
        Ok(response)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.lock().sessions.clone()
    }

    pub fn dormant(&self) -> Vec<DormantSession> {
        self.lock().dormant.clone()
    }

    pub fn current_id(&self) -> Option<String> {
        self.lock().current.clone()
    }

    pub fn current(&self) -> Option<SessionInfo> {
        let state = self.lock();
        let current = state.current.as_deref()?;
        state
            .sessions
            .iter()
            .find(|s| s.session_id == current)
            .cloned()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
        self.signal.notify();
    }

    /// Change counter for console redraw loops
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }

    /// Put `info` at the head of the list (dropping any stale copy) and
    /// select it
    fn adopt(&self, info: SessionInfo) {
        {
            let mut state = self.lock();
            state.sessions.retain(|s| s.session_id != info.session_id);
            state.current = Some(info.session_id.clone());
            state.sessions.insert(0, info);
            state.error = None;
        }
        self.signal.notify();
    }

    fn record(&self, e: Error) -> Error {
        self.lock().error = Some(e.to_string());
        self.signal.notify();
        e
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::extract::Path;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "session_id": id,
            "user_id": "operator",
            "created_at": "2025-01-01T00:00:00Z",
            "last_activity": "2025-01-01T00:05:00Z",
            "status": "active",
            "config": { "domain": "adventure", "llm_model": "llama3.2:3b" },
        })
    }

    struct TestServer {
        base_url: String,
        get_calls: Arc<AtomicUsize>,
    }

    async fn spawn_server() -> TestServer {
        let get_calls = Arc::new(AtomicUsize::new(0));
        let counting = get_calls.clone();
        let app = Router::new()
            .route(
                "/api/v1/sessions",
                post(|| async {
                    Json(serde_json::json!({"session_id": "s1", "status": "created"}))
                })
                .get(|| async {
                    Json(serde_json::json!({"sessions": [], "total": 0}))
                }),
            )
            .route(
                "/api/v1/sessions/dormant",
                get(|| async {
                    Json(serde_json::json!({
                        "sessions": [{
                            "session_id": "s2",
                            "domain": "adventure",
                            "state": "dormant",
                            "age_days": 3,
                        }],
                        "total": 1,
                    }))
                }),
            )
            .route(
                "/api/v1/sessions/:id",
                get(move |Path(id): Path<String>| {
                    let calls = counting.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Json(session_json(&id))
                    }
                })
                .delete(|Path(id): Path<String>| async move {
                    Json(serde_json::json!({
                        "status": "deleted",
                        "message": format!("session {id} removed"),
                    }))
                }),
            )
            .route(
                "/api/v1/sessions/:id/restore",
                post(|Path(id): Path<String>| async move {
                    Json(serde_json::json!({"session_id": id, "status": "restored"}))
                }),
            )
            .route(
                "/api/v1/sessions/cleanup",
                post(|| async {
                    Json(serde_json::json!({
                        "status": "ok",
                        "message": "cleaned 2 sessions",
                        "active_sessions": 1,
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestServer {
            base_url: format!("http://{addr}"),
            get_calls,
        }
    }

    fn store_for(base_url: &str) -> SessionStore {
        let config = ServerConfig {
            base_url: base_url.to_string(),
            ..ServerConfig::default()
        };
        SessionStore::new(Arc::new(RestClient::new(&config).unwrap()))
    }

    #[tokio::test]
    async fn test_create_fetches_record_and_selects() {
        let server = spawn_server().await;
        let store = store_for(&server.base_url);

        let info = store
            .create_session(SessionConfig::default(), Some("operator"))
            .await
            .unwrap();
        assert_eq!(info.session_id, "s1");
        assert_eq!(info.status, "active");
        assert_eq!(store.current_id().as_deref(), Some("s1"));
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(server.get_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_select_reuses_cached_record() {
        let server = spawn_server().await;
        let store = store_for(&server.base_url);

        store
            .create_session(SessionConfig::default(), None)
            .await
            .unwrap();
        let fetched = server.get_calls.load(Ordering::SeqCst);

        let info = store.select_session("s1").await.unwrap();
        assert_eq!(info.session_id, "s1");
        assert_eq!(server.get_calls.load(Ordering::SeqCst), fetched);

        // An unknown id is fetched and prepended.
        let info = store.select_session("s9").await.unwrap();
        assert_eq!(info.session_id, "s9");
        assert_eq!(store.sessions()[0].session_id, "s9");
        assert_eq!(store.current_id().as_deref(), Some("s9"));
        assert_eq!(server.get_calls.load(Ordering::SeqCst), fetched + 1);
    }

    #[tokio::test]
    async fn test_delete_removes_and_clears_selection() {
        let server = spawn_server().await;
        let store = store_for(&server.base_url);
        store
            .create_session(SessionConfig::default(), None)
            .await
            .unwrap();

        store.delete_session("s1").await.unwrap();
        assert!(store.sessions().is_empty());
        assert!(store.current_id().is_none());
    }

    #[tokio::test]
    async fn test_restore_moves_dormant_to_active() {
        let server = spawn_server().await;
        let store = store_for(&server.base_url);

        let dormant = store.refresh_dormant().await.unwrap();
        assert_eq!(dormant.len(), 1);
        assert_eq!(dormant[0].session_id, "s2");
        assert_eq!(dormant[0].age_days, 3);

        let info = store.restore_session("s2").await.unwrap();
        assert_eq!(info.session_id, "s2");
        assert!(store.dormant().is_empty());
        assert_eq!(store.sessions()[0].session_id, "s2");
        assert_eq!(store.current_id().as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_refresh_drops_vanished_selection() {
        let server = spawn_server().await;
        let store = store_for(&server.base_url);
        store
            .create_session(SessionConfig::default(), None)
            .await
            .unwrap();

        // The list endpoint returns nothing, so the selection goes away.
        let sessions = store.refresh_sessions(None).await.unwrap();
        assert!(sessions.is_empty());
        assert!(store.current_id().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_reports_and_refreshes() {
        let server = spawn_server().await;
        let store = store_for(&server.base_url);

        let response = store.cleanup().await.unwrap();
        assert_eq!(response.status, "ok");
        assert_eq!(response.active_sessions, Some(1));
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        // Nothing is listening on this port.
        let store = store_for("http://127.0.0.1:1");
        let err = store.refresh_sessions(None).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(store.error().is_some());

        store.clear_error();
        assert!(store.error().is_none());
    }
}
