//! Request and response bodies for the agent server's HTTP API

use serde::{Deserialize, Serialize};

/// Session creation parameters; every field is optional, the server fills
/// in its own defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_graph: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub config: SessionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Creation only returns the id; fetch the full [`SessionInfo`] separately
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_activity: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionListResponse {
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSessionResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub active_sessions: Option<u64>,
}

/// A session persisted to disk that can be restored into an active one
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DormantSession {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub enable_graph: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_activity: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub conversation_count: u64,
    #[serde(default)]
    pub memory_size_mb: f64,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub age_days: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DormantSessionsResponse {
    #[serde(default)]
    pub sessions: Vec<DormantSession>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub status: String,
}

/// HTTP fallback for the WebSocket `query` message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentQueryRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentQueryResponse {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub memory_updates: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub graph_updates: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatusResponse {
    #[serde(default)]
    pub status: String,
    pub session_id: String,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub last_activity: String,
}

/// Query string for the memory page endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryQueryParams {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDataResponse {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySearchRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySearchResponse {
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub relevance_scores: Vec<f64>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStatsResponse {
    #[serde(default)]
    pub conversation_count: u64,
    #[serde(default)]
    pub entity_count: u64,
    #[serde(default)]
    pub relationship_count: u64,
    #[serde(default)]
    pub total_memory_size: u64,
}

/// Query string for the graph export endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQueryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_metadata: Option<bool>,
}

/// Graph node as served over HTTP; the file export in [`crate::graph`] is a
/// richer shape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default)]
    pub edge_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDataResponse {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRelationship {
    #[serde(rename = "type", default)]
    pub relationship_type: String,
    #[serde(default)]
    pub target_entity: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityDetailsResponse {
    pub entity_id: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub relationships: Vec<EntityRelationship>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStatsResponse {
    #[serde(default)]
    pub node_count: u64,
    #[serde(default)]
    pub edge_count: u64,
    #[serde(default)]
    pub entity_types: std::collections::HashMap<String, u64>,
    #[serde(default)]
    pub relationship_types: std::collections::HashMap<String, u64>,
}

/// One log file advertised by the per-session log listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFileInfo {
    pub name: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionLogsResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogFileInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub session_count: u64,
    #[serde(default)]
    pub timestamp: String,
}
