//! Client root
//!
//! [`AgentClient`] owns one connection's worth of machinery: dispatcher,
//! transport, REST client, subscription tracker, and the four feature
//! stores. There is no process-wide instance; construct as many clients as
//! needed and they stay fully isolated from each other.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::AgentdeckConfig;
use crate::error::Result;
use crate::events::Dispatcher;
use crate::rest::RestClient;
use crate::stores::{ChatStore, LogStore, SessionStore, VerboseStore};
use crate::subscriptions::{MessageSink, SubscriptionTracker};
use crate::transport::{ConnectionState, Transport};

/// One agent server connection and the state built on top of it
pub struct AgentClient {
    config: AgentdeckConfig,
    dispatcher: Dispatcher,
    transport: Arc<Transport>,
    rest: Arc<RestClient>,
    tracker: Arc<SubscriptionTracker>,
    chat: ChatStore,
    logs: LogStore,
    sessions: SessionStore,
    verbose: VerboseStore,
}

impl AgentClient {
    pub fn builder() -> AgentClientBuilder {
        AgentClientBuilder::new()
    }

    pub fn new(config: AgentdeckConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(config.dispatcher.dedup_handlers);
        let transport = Arc::new(Transport::new(&config, dispatcher.clone()));
        let rest = Arc::new(RestClient::new(&config.server)?);

        let sink: Arc<dyn MessageSink> = transport.clone();
        let tracker = Arc::new(SubscriptionTracker::new(sink));
        tracker.bind(&dispatcher);

        let chat = ChatStore::new(
            transport.clone(),
            rest.clone(),
            dispatcher.clone(),
            &config.limits,
        );
        let logs = LogStore::new(tracker.clone(), dispatcher.clone(), &config.limits);
        let sessions = SessionStore::new(rest.clone());
        let verbose = VerboseStore::new(transport.clone(), dispatcher.clone(), &config.limits);

        Ok(Self {
            config,
            dispatcher,
            transport,
            rest,
            tracker,
            chat,
            logs,
            sessions,
            verbose,
        })
    }

    /// Enter a session: tear down previous bindings, connect the socket, and
    /// bind every store to the new session.
    ///
    /// A failed connect still leaves the chat store targeting the session so
    /// messages can go out over the HTTP fallback; logs and verbose stay
    /// unbound in that case.
    pub async fn enter_session(&self, session_id: &str) -> Result<()> {
        self.logs.cleanup();
        self.verbose.unbind();
        self.chat.set_session(session_id).await?;
        self.logs.bind();
        self.verbose.bind(session_id);
        Ok(())
    }

    /// Open the socket for a session without touching store bindings
    pub async fn connect(&self, session_id: &str) -> Result<()> {
        self.transport.connect(session_id).await
    }

    /// Tear the connection down, telling the server to drop log and verbose
    /// subscriptions first when the handshake is still valid
    pub fn disconnect(&self) {
        if let Err(e) = self.tracker.unsubscribe_all() {
            tracing::debug!(error = %e, "Log unsubscribe skipped on disconnect");
        }
        if let Err(e) = self.verbose.unsubscribe() {
            tracing::debug!(error = %e, "Verbose unsubscribe skipped on disconnect");
        }
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Watch connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe_state()
    }

    /// Replace the bearer token for subsequent REST calls
    pub fn set_token(&self, token: Option<String>) {
        self.rest.set_token(token);
    }

    pub fn config(&self) -> &AgentdeckConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn rest(&self) -> &Arc<RestClient> {
        &self.rest
    }

    pub fn tracker(&self) -> &Arc<SubscriptionTracker> {
        &self.tracker
    }

    pub fn chat(&self) -> &ChatStore {
        &self.chat
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn verbose(&self) -> &VerboseStore {
        &self.verbose
    }
}

/// Builds an [`AgentClient`] from a config plus inline overrides
pub struct AgentClientBuilder {
    config: AgentdeckConfig,
}

impl AgentClientBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentdeckConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: AgentdeckConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.server.base_url = base_url.into();
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.server.auth_token = Some(token.into());
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.server.request_timeout_secs = secs;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.transport.connect_timeout_secs = secs;
        self
    }

    pub fn build(self) -> Result<AgentClient> {
        AgentClient::new(self.config)
    }
}

impl Default for AgentClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::BindingState;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Server that handshakes and answers every query with `reply`
    async fn spawn_ws_server(reply: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                        return;
                    };
                    let hello = serde_json::json!({
                        "type": "connection_established",
                        "data": { "connection_id": "conn_1" },
                    });
                    let _ = ws.send(Message::Text(hello.to_string())).await;
                    while let Some(Ok(message)) = ws.next().await {
                        let Message::Text(text) = message else {
                            continue;
                        };
                        let value: serde_json::Value =
                            serde_json::from_str(&text).unwrap_or_default();
                        if value["type"] == "query" {
                            let response = serde_json::json!({
                                "type": "query_response",
                                "data": { "message": reply },
                            });
                            let _ = ws.send(Message::Text(response.to_string())).await;
                        }
                    }
                });
            }
        });
        format!("http://{addr}")
    }

    fn client_for(base_url: &str) -> AgentClient {
        AgentClient::builder()
            .base_url(base_url)
            .connect_timeout_secs(2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_applies_overrides() {
        let client = AgentClient::builder()
            .base_url("https://agents.example.com")
            .auth_token("tok-9")
            .request_timeout_secs(15)
            .build()
            .unwrap();
        assert_eq!(client.config().server.base_url, "https://agents.example.com");
        assert_eq!(client.rest().token().as_deref(), Some("tok-9"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = AgentdeckConfig::default();
        config.transport.max_reconnect_attempts = 2;
        assert!(AgentClient::builder().config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_enter_session_binds_all_stores() {
        let base_url = spawn_ws_server("ok").await;
        let client = client_for(&base_url);

        client.enter_session("abc123").await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.chat().binding(), BindingState::Bound);
        assert_eq!(client.logs().binding(), BindingState::Bound);
        assert_eq!(client.verbose().binding(), BindingState::Bound);
        assert_eq!(client.dispatcher().handler_count("query_response"), 1);
        assert_eq!(client.dispatcher().handler_count("log_stream"), 1);

        client.disconnect();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_two_clients_do_not_interfere() {
        let url_a = spawn_ws_server("from a").await;
        let url_b = spawn_ws_server("from b").await;
        let client_a = client_for(&url_a);
        let client_b = client_for(&url_b);

        client_a.enter_session("left").await.unwrap();
        client_b.enter_session("right").await.unwrap();

        client_a.chat().send_message("hello", None).await.unwrap();
        wait_until("a's reply", || client_a.chat().history().len() == 2).await;

        // Client B never saw any of it.
        assert!(client_b.chat().history().is_empty());
        assert_eq!(client_a.chat().history()[1].content, "from a");

        client_b.chat().send_message("hey", None).await.unwrap();
        wait_until("b's reply", || client_b.chat().history().len() == 2).await;
        assert_eq!(client_b.chat().history()[1].content, "from b");
        assert_eq!(client_a.chat().history().len(), 2);
    }
}
