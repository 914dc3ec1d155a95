//! End-to-end tests driving a real client against an in-process agent server

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use agentdeck::error::Error;
use agentdeck::rest::types::{CreateSessionRequest, SessionConfig};
use agentdeck::stores::{BindingState, MessageKind};
use agentdeck::{AgentClient, AgentdeckConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
struct ServerOptions {
    /// Subscription confirmations carry the full cumulative set when true,
    /// only the just-requested sources (legacy field name) when false
    cumulative_subscriptions: bool,
    create_delay: Duration,
    fetch_delay: Duration,
    required_token: Option<&'static str>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            cumulative_subscriptions: true,
            create_delay: Duration::ZERO,
            fetch_delay: Duration::ZERO,
            required_token: None,
        }
    }
}

struct ServerState {
    options: ServerOptions,
    sessions: Mutex<HashMap<String, Value>>,
    dormant: Mutex<HashMap<String, Value>>,
    subscribed: Mutex<BTreeSet<String>>,
    created: AtomicUsize,
    connections: AtomicUsize,
    /// Session id of every accepted WebSocket upgrade, in order
    upgrades: Mutex<Vec<String>>,
    /// (session id, message) for every query received over a socket
    queries: Mutex<Vec<(String, String)>>,
}

async fn spawn_server(options: ServerOptions) -> (String, Arc<ServerState>) {
    let mut dormant = HashMap::new();
    dormant.insert(
        "old_session".to_string(),
        json!({
            "session_id": "old_session",
            "domain": "adventure",
            "state": "dormant",
            "conversation_count": 12,
            "memory_size_mb": 1.5,
            "age_days": 9,
            "last_message": "The party made camp.",
        }),
    );
    let state = Arc::new(ServerState {
        options,
        sessions: Mutex::new(HashMap::new()),
        dormant: Mutex::new(dormant),
        subscribed: Mutex::new(BTreeSet::new()),
        created: AtomicUsize::new(0),
        connections: AtomicUsize::new(0),
        upgrades: Mutex::new(Vec::new()),
        queries: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/sessions", post(create_session).get(list_sessions))
        .route("/api/v1/sessions/dormant", get(dormant_sessions))
        .route("/api/v1/sessions/cleanup", post(cleanup_sessions))
        .route(
            "/api/v1/sessions/:id",
            get(get_session).delete(delete_session),
        )
        .route("/api/v1/sessions/:id/restore", post(restore_session))
        .route("/api/v1/sessions/:id/query", post(query_session))
        .route("/api/v1/ws/sessions/:id", get(ws_upgrade))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"detail": "Session not found"})),
    )
        .into_response()
}

async fn health(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Some(required) = state.options.required_token {
        let expected = format!("Bearer {required}");
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != expected {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "Invalid token"})),
            )
                .into_response();
        }
    }
    let count = state.sessions.lock().unwrap().len();
    Json(json!({
        "status": "healthy",
        "session_count": count,
        "timestamp": "2025-06-01T12:00:00Z",
    }))
    .into_response()
}

async fn create_session(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<Value>,
) -> Response {
    tokio::time::sleep(state.options.create_delay).await;
    let n = state.created.fetch_add(1, Ordering::SeqCst);
    let session_id = format!("abc{}", 123 + n);
    let info = json!({
        "session_id": session_id,
        "user_id": request.get("user_id").cloned().unwrap_or(Value::Null),
        "created_at": "2025-06-01T12:00:00Z",
        "last_activity": "2025-06-01T12:00:00Z",
        "status": "active",
        "config": request.get("config").cloned().unwrap_or_else(|| json!({})),
    });
    state
        .sessions
        .lock()
        .unwrap()
        .insert(session_id.clone(), info);
    Json(json!({"session_id": session_id, "status": "created"})).into_response()
}

async fn list_sessions(State(state): State<Arc<ServerState>>) -> Response {
    let sessions: Vec<Value> = state.sessions.lock().unwrap().values().cloned().collect();
    let total = sessions.len();
    Json(json!({"sessions": sessions, "total": total})).into_response()
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    tokio::time::sleep(state.options.fetch_delay).await;
    match state.sessions.lock().unwrap().get(&id) {
        Some(info) => Json(info.clone()).into_response(),
        None => not_found(),
    }
}

async fn delete_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.lock().unwrap().remove(&id) {
        Some(_) => Json(json!({
            "status": "deleted",
            "message": format!("session {id} removed"),
        }))
        .into_response(),
        None => not_found(),
    }
}

async fn dormant_sessions(State(state): State<Arc<ServerState>>) -> Response {
    let sessions: Vec<Value> = state.dormant.lock().unwrap().values().cloned().collect();
    let total = sessions.len();
    Json(json!({"sessions": sessions, "total": total})).into_response()
}

async fn restore_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    let Some(dormant) = state.dormant.lock().unwrap().remove(&id) else {
        return not_found();
    };
    let info = json!({
        "session_id": id,
        "created_at": "2025-05-20T08:00:00Z",
        "last_activity": "2025-06-01T12:00:00Z",
        "status": "active",
        "config": { "domain": dormant.get("domain").cloned().unwrap_or(Value::Null) },
    });
    state.sessions.lock().unwrap().insert(id.clone(), info);
    Json(json!({"session_id": id, "status": "restored"})).into_response()
}

async fn cleanup_sessions(State(state): State<Arc<ServerState>>) -> Response {
    let count = state.sessions.lock().unwrap().len();
    Json(json!({
        "status": "ok",
        "message": "cleaned 0 sessions",
        "active_sessions": count,
    }))
    .into_response()
}

async fn query_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<Value>,
) -> Response {
    if !state.sessions.lock().unwrap().contains_key(&id) {
        return not_found();
    }
    let message = request
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Json(json!({
        "response": format!("echo: {message}"),
        "session_id": id,
        "timestamp": "2025-06-01T12:00:01Z",
    }))
    .into_response()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    state.upgrades.lock().unwrap().push(id.clone());
    ws.on_upgrade(move |socket| serve_socket(socket, id, state))
}

async fn serve_socket(mut socket: WebSocket, session_id: String, state: Arc<ServerState>) {
    let n = state.connections.fetch_add(1, Ordering::SeqCst);
    let connection_id = format!("{session_id}_{n}");
    let hello = json!({
        "type": "connection_established",
        "data": { "connection_id": connection_id, "session_id": session_id },
    });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap_or_default();
        let reply = match frame["type"].as_str() {
            Some("query") => {
                let msg = frame["data"]["message"].as_str().unwrap_or_default();
                state
                    .queries
                    .lock()
                    .unwrap()
                    .push((session_id.clone(), msg.to_string()));
                let typing = json!({
                    "type": "typing_start",
                    "data": { "session_id": session_id },
                });
                let _ = socket.send(Message::Text(typing.to_string())).await;
                vec![json!({
                    "type": "query_response",
                    "data": {
                        "message": format!("echo: {msg}"),
                        "session_id": session_id,
                        "timestamp": "2025-06-01T12:00:01Z",
                    },
                })]
            }
            Some("get_log_sources") => vec![json!({
                "type": "log_sources_response",
                "data": {
                    "available_sources": ["agent", "api", "memory_manager"],
                    "subscription_status": {},
                },
            })],
            Some("subscribe_logs") => {
                let requested: Vec<String> = frame["data"]["log_sources"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let confirmation = {
                    let mut subscribed = state.subscribed.lock().unwrap();
                    subscribed.extend(requested.iter().cloned());
                    if state.options.cumulative_subscriptions {
                        let full: Vec<String> = subscribed.iter().cloned().collect();
                        json!({
                            "type": "logs_subscribed",
                            "data": { "subscribed_sources": full },
                        })
                    } else {
                        json!({
                            "type": "logs_subscribed",
                            "data": { "log_sources": requested.clone() },
                        })
                    }
                };
                let mut frames = vec![confirmation];
                // Stream a burst for the newly requested sources; the DEBUG
                // line should never reach the store's buffer.
                for source in &requested {
                    frames.push(json!({
                        "type": "log_stream",
                        "data": {
                            "timestamp": "2025-06-01T12:00:02Z",
                            "level": "INFO",
                            "logger": source,
                            "message": format!("hello from {source}"),
                            "source": source,
                        },
                    }));
                    frames.push(json!({
                        "type": "log_stream",
                        "data": {
                            "timestamp": "2025-06-01T12:00:02Z",
                            "level": "DEBUG",
                            "logger": source,
                            "message": format!("noise from {source}"),
                            "source": source,
                        },
                    }));
                }
                frames
            }
            Some("unsubscribe_logs") => vec![json!({
                "type": "logs_unsubscribed",
                "data": { "log_sources": "all" },
            })],
            Some("subscribe_verbose") => vec![
                json!({
                    "type": "verbose_subscribed",
                    "data": { "connection_id": connection_id },
                }),
                json!({
                    "type": "verbose_status",
                    "data": {
                        "message": "Condensing conversation history",
                        "message_type": "status",
                        "level": 1,
                    },
                }),
            ],
            Some("unsubscribe_verbose") => vec![json!({
                "type": "verbose_unsubscribed",
                "data": { "connection_id": connection_id },
            })],
            Some("heartbeat") => vec![json!({
                "type": "heartbeat_response",
                "data": { "session_id": session_id },
            })],
            Some("ping") => vec![json!({
                "type": "pong",
                "data": { "session_id": session_id },
            })],
            _ => Vec::new(),
        };
        for frame in reply {
            if socket.send(Message::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
    }
}

fn client_for(base_url: &str) -> AgentClient {
    let mut config = AgentdeckConfig::default();
    config.server.base_url = base_url.to_string();
    config.transport.connect_timeout_secs = 2;
    config.transport.reconnect_base_delay_ms = 50;
    AgentClient::new(config).unwrap()
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn dnd_config() -> SessionConfig {
    SessionConfig {
        domain: Some("dnd".to_string()),
        enable_graph: Some(true),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_chat_round_trip_then_rest_fallback() {
    let (base_url, _state) = spawn_server(ServerOptions::default()).await;
    let client = client_for(&base_url);

    let info = tokio::time::timeout(
        TIMEOUT,
        client.sessions().create_session(dnd_config(), Some("operator")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(info.session_id, "abc123");
    assert_eq!(info.config.domain.as_deref(), Some("dnd"));
    assert_eq!(info.config.enable_graph, Some(true));

    tokio::time::timeout(TIMEOUT, client.enter_session(&info.session_id))
        .await
        .unwrap()
        .unwrap();
    assert!(client.is_connected());
    wait_until("handshake", || client.transport().connection_id().is_some()).await;
    assert_eq!(client.chat().binding(), BindingState::Bound);

    // Socket path: user bubble lands before any reply exists.
    client.chat().send_message("Hello", None).await.unwrap();
    let history = client.chat().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, MessageKind::User);
    wait_until("socket reply", || client.chat().history().len() == 2).await;
    assert_eq!(client.chat().history()[1].content, "echo: Hello");
    assert!(!client.chat().is_typing());

    // HTTP fallback: exactly one agent bubble, no duplicate.
    client.disconnect();
    assert!(!client.is_connected());
    tokio::time::timeout(TIMEOUT, client.chat().send_message("Still there?", None))
        .await
        .unwrap()
        .unwrap();
    let history = client.chat().history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].kind, MessageKind::User);
    assert_eq!(history[3].kind, MessageKind::Agent);
    assert_eq!(history[3].content, "echo: Still there?");
}

#[tokio::test]
async fn test_entering_another_session_moves_traffic_to_its_socket() {
    let (base_url, state) = spawn_server(ServerOptions::default()).await;
    let client = client_for(&base_url);
    client.sessions().create_session(dnd_config(), None).await.unwrap();
    client.sessions().create_session(dnd_config(), None).await.unwrap();

    client.enter_session("abc123").await.unwrap();
    wait_until("first handshake", || client.transport().connection_id().is_some()).await;
    client.chat().send_message("first", None).await.unwrap();
    wait_until("first reply", || client.chat().history().len() == 2).await;

    // Switching tears the old binding and socket down before the new one
    // comes up; the old connection must not keep carrying frames.
    client.enter_session("abc124").await.unwrap();
    wait_until("second handshake", || {
        client
            .transport()
            .connection_id()
            .map(|id| id.starts_with("abc124"))
            .unwrap_or(false)
    })
    .await;
    wait_until("second upgrade", || state.upgrades.lock().unwrap().len() == 2).await;
    assert_eq!(
        *state.upgrades.lock().unwrap(),
        vec!["abc123".to_string(), "abc124".to_string()]
    );
    assert!(client.chat().history().is_empty());
    assert_eq!(client.chat().session_id().as_deref(), Some("abc124"));

    client
        .chat()
        .send_message("hello after switch", None)
        .await
        .unwrap();
    wait_until("reply over the new socket", || {
        client.chat().history().len() == 2
    })
    .await;
    assert_eq!(client.chat().history()[1].content, "echo: hello after switch");
    assert_eq!(
        *state.queries.lock().unwrap(),
        vec![
            ("abc123".to_string(), "first".to_string()),
            ("abc124".to_string(), "hello after switch".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_cumulative_confirmations_build_the_union() {
    let (base_url, _state) = spawn_server(ServerOptions::default()).await;
    let client = client_for(&base_url);
    client.sessions().create_session(dnd_config(), None).await.unwrap();
    client.enter_session("abc123").await.unwrap();
    wait_until("handshake", || client.transport().connection_id().is_some()).await;

    client.logs().subscribe(&["agent".to_string()]).unwrap();
    wait_until("first confirmation", || {
        client.tracker().tracked() == vec!["agent".to_string()]
    })
    .await;

    client.logs().subscribe(&["api".to_string()]).unwrap();
    wait_until("second confirmation", || {
        client.tracker().tracked() == vec!["agent".to_string(), "api".to_string()]
    })
    .await;

    // The INFO burst arrived, the DEBUG lines did not.
    wait_until("log entries", || client.logs().entries().len() == 2).await;
    let entries = client.logs().entries();
    assert!(entries.iter().all(|e| e.message.starts_with("hello from")));
    assert_eq!(client.logs().tab_logs(&["agent"], 15).len(), 1);
    assert_eq!(client.logs().tab_logs(&["api"], 15).len(), 1);
    assert_eq!(client.logs().tab_logs(&["memory_manager"], 15).len(), 0);
}

#[tokio::test]
async fn test_replacing_confirmations_win() {
    let options = ServerOptions {
        cumulative_subscriptions: false,
        ..ServerOptions::default()
    };
    let (base_url, _state) = spawn_server(options).await;
    let client = client_for(&base_url);
    client.sessions().create_session(dnd_config(), None).await.unwrap();
    client.enter_session("abc123").await.unwrap();
    wait_until("handshake", || client.transport().connection_id().is_some()).await;

    client.logs().subscribe(&["agent".to_string()]).unwrap();
    wait_until("first confirmation", || {
        client.tracker().tracked() == vec!["agent".to_string()]
    })
    .await;

    // The server confirms only the latest request (legacy field shape), so
    // the tracked set is replaced, not unioned.
    client.logs().subscribe(&["api".to_string()]).unwrap();
    wait_until("second confirmation", || {
        client.tracker().tracked() == vec!["api".to_string()]
    })
    .await;
}

#[tokio::test]
async fn test_available_sources_arrive_after_binding() {
    let (base_url, _state) = spawn_server(ServerOptions::default()).await;
    let client = client_for(&base_url);
    client.sessions().create_session(dnd_config(), None).await.unwrap();
    client.enter_session("abc123").await.unwrap();

    wait_until("source listing", || {
        client.logs().available_sources() == vec!["agent", "api", "memory_manager"]
    })
    .await;
}

#[tokio::test]
async fn test_session_lifecycle_over_rest() {
    let (base_url, _state) = spawn_server(ServerOptions::default()).await;
    let client = client_for(&base_url);
    let sessions = client.sessions();

    let health = client.rest().health().await.unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.session_count, 0);

    let info = sessions.create_session(dnd_config(), None).await.unwrap();
    let listed = sessions.refresh_sessions(None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, info.session_id);

    let dormant = sessions.refresh_dormant().await.unwrap();
    assert_eq!(dormant.len(), 1);
    assert_eq!(dormant[0].session_id, "old_session");
    assert_eq!(dormant[0].conversation_count, 12);

    let restored = sessions.restore_session("old_session").await.unwrap();
    assert_eq!(restored.status, "active");
    assert!(sessions.dormant().is_empty());
    assert_eq!(sessions.current_id().as_deref(), Some("old_session"));

    sessions.delete_session(&info.session_id).await.unwrap();
    let listed = sessions.refresh_sessions(None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, "old_session");

    let cleaned = sessions.cleanup().await.unwrap();
    assert_eq!(cleaned.active_sessions, Some(1));
}

#[tokio::test]
async fn test_unauthorized_clears_stored_token() {
    let options = ServerOptions {
        required_token: Some("good-token"),
        ..ServerOptions::default()
    };
    let (base_url, _state) = spawn_server(options).await;

    let mut config = AgentdeckConfig::default();
    config.server.base_url = base_url.clone();
    config.server.auth_token = Some("stale-token".to_string());
    let client = AgentClient::new(config).unwrap();

    let err = client.rest().health().await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized));
    assert!(client.rest().token().is_none());

    // With the right token the same call goes through.
    client.set_token(Some("good-token".to_string()));
    let health = client.rest().health().await.unwrap();
    assert_eq!(health.status, "healthy");
}

#[tokio::test]
async fn test_session_create_gets_the_long_timeout() {
    let options = ServerOptions {
        create_delay: Duration::from_millis(1500),
        fetch_delay: Duration::from_millis(1500),
        ..ServerOptions::default()
    };
    let (base_url, _state) = spawn_server(options).await;

    let mut config = AgentdeckConfig::default();
    config.server.base_url = base_url;
    config.server.request_timeout_secs = 1;
    config.server.session_create_timeout_secs = 8;
    let client = AgentClient::new(config).unwrap();

    // Slow create succeeds under the extended per-call timeout.
    let request = CreateSessionRequest {
        config: dnd_config(),
        user_id: None,
    };
    let created = client.rest().create_session(&request).await.unwrap();
    assert_eq!(created.session_id, "abc123");

    // The same delay on an ordinary call trips the short default.
    let err = client.rest().get_session("abc123").await.unwrap_err();
    assert!(matches!(err, Error::Http(_)));
}

#[tokio::test]
async fn test_verbose_subscription_end_to_end() {
    let (base_url, _state) = spawn_server(ServerOptions::default()).await;
    let client = client_for(&base_url);
    client.sessions().create_session(dnd_config(), None).await.unwrap();
    client.enter_session("abc123").await.unwrap();
    wait_until("handshake", || client.transport().connection_id().is_some()).await;

    client.verbose().subscribe().unwrap();
    wait_until("verbose ack", || client.verbose().is_subscribed()).await;
    wait_until("verbose status", || !client.verbose().messages().is_empty()).await;
    assert_eq!(
        client.verbose().messages()[0].message,
        "Condensing conversation history"
    );

    client.verbose().unsubscribe().unwrap();
    wait_until("verbose unsubscribed", || !client.verbose().is_subscribed()).await;
}
