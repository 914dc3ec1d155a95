//! Tagged WebSocket protocol types
//!
//! Defines all message types exchanged with the agent server over the
//! per-session socket:
//! - Client → Server: `{"type": <tag>, "data": <payload>}`
//! - Server → Client: `{"type": <tag>, "data": <payload>, "session_id"?, "timestamp"?}`
//!
//! Frames are decoded into these enums at the transport boundary; nothing
//! downstream handles raw JSON maps. Unknown tags and malformed payloads are
//! logged and dropped.

use serde::{Deserialize, Serialize};

// =============================================================================
// Client → Server messages
// =============================================================================

/// Outbound message (serialized as `{"type", "data"}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Query(QueryPayload),
    Heartbeat(HeartbeatPayload),
    GetStatus(EmptyPayload),
    GetMemory(MemoryRequest),
    SearchMemory(SearchRequest),
    GetGraph(GraphRequest),
    Ping(PingPayload),
    GetLogSources(EmptyPayload),
    SubscribeLogs(LogSubscription),
    UnsubscribeLogs(LogSubscription),
    SubscribeVerbose(VerboseSubscription),
    UnsubscribeVerbose(VerboseSubscription),
}

/// Agent query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Keep-alive carrying the server-assigned connection id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub connection_id: String,
    pub timestamp: String,
}

/// Empty request payload (serializes as `{}`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// Memory page request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRequest {
    #[serde(rename = "type")]
    pub memory_type: String,
    pub limit: u32,
    pub offset: u32,
}

impl Default for MemoryRequest {
    fn default() -> Self {
        Self {
            memory_type: "conversations".to_string(),
            limit: 50,
            offset: 0,
        }
    }
}

/// Memory text search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
}

/// Graph export request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRequest {
    pub format: String,
    pub include_metadata: bool,
}

impl Default for GraphRequest {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            include_metadata: true,
        }
    }
}

/// Connection test
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Log source subscribe/unsubscribe request.
///
/// `log_sources: None` on an unsubscribe means "everything currently
/// subscribed"; the field is omitted on the wire in that case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSubscription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_sources: Option<Vec<String>>,
    pub connection_id: String,
}

/// Verbose status subscribe/unsubscribe request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseSubscription {
    pub connection_id: String,
}

// =============================================================================
// Server → Client messages
// =============================================================================

/// Inbound message (parsed from `{"type", "data", ...}` frames; extra
/// top-level fields are ignored)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished(ConnectionEstablished),
    QueryResponse(QueryResponse),
    TypingStart(TypingEvent),
    #[serde(alias = "typing_stop")]
    TypingEnd(TypingEvent),
    StatusResponse(StatusResponse),
    MemoryResponse(MemoryResponse),
    SearchResponse(SearchResponse),
    GraphResponse(GraphResponse),
    #[serde(alias = "memory_updated")]
    MemoryUpdate(UpdateNotice),
    #[serde(alias = "graph_updated")]
    GraphUpdate(UpdateNotice),
    Error(ErrorPayload),
    LogSourcesResponse(LogSourcesResponse),
    LogsSubscribed(LogsSubscribed),
    LogsUnsubscribed(LogsUnsubscribed),
    LogStream(LogEntry),
    VerboseStatus(VerboseStatus),
    VerboseSubscribed(VerboseAck),
    VerboseUnsubscribed(VerboseAck),
    HeartbeatResponse(HeartbeatAck),
    Pong(PongPayload),
}

impl ServerMessage {
    /// Wire tag for this message (the registry key handlers subscribe under)
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished(_) => "connection_established",
            Self::QueryResponse(_) => "query_response",
            Self::TypingStart(_) => "typing_start",
            Self::TypingEnd(_) => "typing_end",
            Self::StatusResponse(_) => "status_response",
            Self::MemoryResponse(_) => "memory_response",
            Self::SearchResponse(_) => "search_response",
            Self::GraphResponse(_) => "graph_response",
            Self::MemoryUpdate(_) => "memory_update",
            Self::GraphUpdate(_) => "graph_update",
            Self::Error(_) => "error",
            Self::LogSourcesResponse(_) => "log_sources_response",
            Self::LogsSubscribed(_) => "logs_subscribed",
            Self::LogsUnsubscribed(_) => "logs_unsubscribed",
            Self::LogStream(_) => "log_stream",
            Self::VerboseStatus(_) => "verbose_status",
            Self::VerboseSubscribed(_) => "verbose_subscribed",
            Self::VerboseUnsubscribed(_) => "verbose_unsubscribed",
            Self::HeartbeatResponse(_) => "heartbeat_response",
            Self::Pong(_) => "pong",
        }
    }
}

/// Handshake completion; supplies the connection id heartbeats must carry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub connection_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Agent reply to a query.
///
/// Older servers put the text under `response` instead of `message`;
/// [`QueryResponse::text`] reads whichever is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub partial: Option<bool>,
}

impl QueryResponse {
    /// Reply text, whichever field the server used
    pub fn text(&self) -> &str {
        self.message
            .as_deref()
            .or(self.response.as_deref())
            .unwrap_or("")
    }
}

/// Typing indicator event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypingEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Session status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_initialized: bool,
    #[serde(default)]
    pub memory_manager_initialized: bool,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Memory page; the body shape depends on the requested memory type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(rename = "type", default)]
    pub memory_type: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Memory search results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub results: serde_json::Value,
    #[serde(default)]
    pub total_results: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Graph export; `graph_data` is the server's export format, passed through
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub graph_data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Push notification that server-side memory or graph state changed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateNotice {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub update_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Application-level error. Dismissible, never fatal to the connection.
///
/// Servers have used both `error` and `message` for the text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ErrorPayload {
    /// Error text, whichever field the server used
    pub fn text(&self) -> &str {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("An error occurred")
    }
}

/// Available log sources and current subscription status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSourcesResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub available_sources: Vec<String>,
    #[serde(default)]
    pub subscription_status: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Log subscription confirmation.
///
/// Newer servers report the full subscribed set in `subscribed_sources`;
/// older ones echo the just-confirmed batch in `log_sources`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsSubscribed {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub subscribed_sources: Option<Vec<String>>,
    #[serde(default)]
    pub log_sources: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl LogsSubscribed {
    /// Confirmed source list, whichever field the server used
    pub fn confirmed(&self) -> Option<&[String]> {
        self.subscribed_sources
            .as_deref()
            .or(self.log_sources.as_deref())
    }
}

/// Log unsubscription confirmation.
///
/// `log_sources` is the older field and may be a list or the string "all".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsUnsubscribed {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub unsubscribed_sources: Option<Vec<String>>,
    #[serde(default)]
    pub log_sources: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl LogsUnsubscribed {
    /// Sources removed by this confirmation; `None` means "all"
    pub fn removed(&self) -> Option<Vec<String>> {
        if let Some(sources) = &self.unsubscribed_sources {
            return Some(sources.clone());
        }
        match &self.log_sources {
            Some(serde_json::Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
            ),
            // "all" (or anything non-list) means the whole set
            Some(_) => None,
            None => None,
        }
    }
}

/// Streamed server log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub timestamp: String,
    pub level: LogLevel,
    #[serde(default)]
    pub logger: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// Server log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// All levels, lowest to highest
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Fine-grained progress event for a long-running agent operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerboseStatus {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_type: VerboseKind,
    /// Indent depth for nested operations
    #[serde(default)]
    pub level: u32,
    /// Elapsed seconds, when the operation timed itself
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Verbose event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerboseKind {
    Status,
    Success,
    Warning,
    Error,
    #[serde(other)]
    Other,
}

impl Default for VerboseKind {
    fn default() -> Self {
        VerboseKind::Other
    }
}

/// Verbose subscribe/unsubscribe acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerboseAck {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Heartbeat acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatAck {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Ping reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PongPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// =============================================================================
// Helper functions
// =============================================================================

/// Parse one inbound text frame, logging and dropping anything undecodable
pub fn parse_server_frame(text: &str) -> Option<ServerMessage> {
    serde_json::from_str::<ServerMessage>(text)
        .map_err(|e| {
            let preview: String = text.chars().take(200).collect();
            tracing::debug!("Dropping undecodable frame: {} (frame: {})", e, preview);
        })
        .ok()
}
