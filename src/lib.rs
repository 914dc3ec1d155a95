//! Agentdeck - Operator console client for conversational agent servers
//!
//! Agentdeck is a client SDK plus a small CLI for driving a remote
//! conversational-agent server: chatting over a per-session WebSocket,
//! streaming server logs and verbose progress, and managing the session
//! lifecycle over the HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         AgentClient                          │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐     │
//! │  │   Chat   │  │   Logs   │  │ Sessions │  │ Verbose  │     │
//! │  │  store   │  │  store   │  │  store   │  │  store   │     │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘  └────┬─────┘     │
//! │       │             │             │             │           │
//! │       │      ┌──────▼─────┐      │             │           │
//! │       │      │ Sub tracker│      │             │           │
//! │       │      └──────┬─────┘      │             │           │
//! │  ┌────▼─────────────▼────┐  ┌────▼─────────────▼──────┐    │
//! │  │ Dispatcher + Transport│  │       REST client       │    │
//! │  └───────────┬───────────┘  └────────────┬────────────┘    │
//! └──────────────┼───────────────────────────┼─────────────────┘
//!                │ WebSocket (one/session)   │ HTTP
//! ┌──────────────▼───────────────────────────▼─────────────────┐
//! │                    Remote agent server                     │
//! │    /api/v1/ws/sessions/{id}        /api/v1 REST API        │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Behaviors
//!
//! ### Connection lifecycle
//! - One socket per session, replaced wholesale on session switch
//! - Linear-capped reconnection backoff with a bounded attempt budget,
//!   suppressed by explicit disconnect
//! - Heartbeats gated on the server handshake (`connection_established`)
//!
//! ### Typed wire protocol
//! - Tagged `{type, data}` frames decoded into enums at the transport edge
//! - Legacy server shape variations (field aliases, old tags) absorbed in
//!   the protocol layer, invisible to stores
//!
//! ### Store bindings
//! - Each store binds to one session at a time via RAII handler guards
//! - Chat sends fall back to the HTTP query endpoint when the socket is down
//!
//! ## Modules
//!
//! - [`client`]: the `AgentClient` root object and its builder
//! - [`transport`]: WebSocket connection, reconnection, heartbeats
//! - [`protocol`]: wire message types and frame parsing
//! - [`events`]: tag-keyed dispatcher with RAII handler guards
//! - [`subscriptions`]: confirmation-driven log source tracking
//! - [`rest`]: typed HTTP API client
//! - [`stores`]: chat, log, session, and verbose-status state
//! - [`graph`]: memory graph export loading
//! - [`config`]: configuration management

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod protocol;
pub mod rest;
pub mod stores;
pub mod subscriptions;
pub mod transport;

pub use client::{AgentClient, AgentClientBuilder};
pub use config::AgentdeckConfig;
pub use error::{Error, Result};
