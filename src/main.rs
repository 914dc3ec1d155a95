//! Agentdeck - Operator console for conversational agent servers
//!
//! Drives a remote agent server from the terminal: interactive chat over the
//! per-session WebSocket, live log streaming, session lifecycle management,
//! and offline inspection of memory graph exports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentdeck::config::default_config_path;
use agentdeck::graph::GraphSnapshot;
use agentdeck::protocol::LogEntry;
use agentdeck::rest::types::SessionConfig;
use agentdeck::stores::MessageKind;
use agentdeck::{AgentClient, AgentdeckConfig};

#[derive(Parser)]
#[command(name = "agentdeck")]
#[command(version)]
#[command(about = "Operator console for conversational agent servers")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENTDECK_CONFIG")]
    config: Option<PathBuf>,

    /// Agent server base URL (overrides the config file)
    #[arg(short, long, env = "AGENTDECK_SERVER")]
    server: Option<String>,

    /// Bearer token for API requests (overrides the config file)
    #[arg(short, long, env = "AGENTDECK_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health
    Health,

    /// Manage sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Chat interactively with a session
    Chat {
        /// Session id to enter
        session_id: String,
    },

    /// Stream server logs for a session
    Logs {
        /// Session id to attach to
        session_id: String,

        /// Log sources to subscribe to (all available when omitted)
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
    },

    /// Show agent status and memory statistics for a session
    Status {
        /// Session id to inspect
        session_id: String,
    },

    /// Inspect an exported memory graph
    Graph {
        /// Nodes file (JSON object keyed by node id)
        nodes: PathBuf,

        /// Edges file (JSON array)
        edges: PathBuf,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List active sessions
    List {
        /// Only sessions belonging to this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Create a session and print its id
    Create {
        /// Agent domain (e.g. dnd, adventure)
        #[arg(long, default_value = "general")]
        domain: String,

        /// LLM model override
        #[arg(long)]
        model: Option<String>,

        /// Enable the memory graph
        #[arg(long)]
        graph: bool,

        /// Owner user id
        #[arg(long)]
        user: Option<String>,
    },

    /// Delete a session
    Delete {
        /// Session id to delete
        session_id: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// List dormant sessions
    Dormant,

    /// Restore a dormant session
    Restore {
        /// Session id to restore
        session_id: String,
    },

    /// Ask the server to sweep idle sessions
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agentdeck={log_level}").into());
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Health => run_health(config).await?,
        Commands::Sessions { command } => run_sessions(config, command).await?,
        Commands::Chat { session_id } => run_chat(config, &session_id).await?,
        Commands::Logs {
            session_id,
            sources,
        } => run_logs(config, &session_id, sources).await?,
        Commands::Status { session_id } => run_status(config, &session_id).await?,
        Commands::Graph { nodes, edges } => run_graph(&nodes, &edges)?,
    }

    Ok(())
}

/// Resolve configuration: file (explicit or default path), then CLI/env
/// overrides on top
fn load_config(cli: &Cli) -> Result<AgentdeckConfig> {
    let mut config = if let Some(path) = &cli.config {
        AgentdeckConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?
    } else if let Some(path) = default_config_path().filter(|p| p.exists()) {
        AgentdeckConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?
    } else {
        AgentdeckConfig::default()
    };

    if let Some(server) = &cli.server {
        config.server.base_url = server.clone();
    }
    if let Some(token) = &cli.token {
        config.server.auth_token = Some(token.clone());
    }
    Ok(config)
}

fn client_for(config: AgentdeckConfig) -> Result<AgentClient> {
    AgentClient::new(config).context("building client")
}

async fn run_health(config: AgentdeckConfig) -> Result<()> {
    let client = client_for(config)?;
    let health = client.rest().health().await.context("health check")?;
    println!("Server status: {}", health.status);
    println!("Active sessions: {}", health.session_count);
    if !health.timestamp.is_empty() {
        println!("Server time: {}", health.timestamp);
    }
    Ok(())
}

async fn run_sessions(config: AgentdeckConfig, command: SessionCommands) -> Result<()> {
    let client = client_for(config)?;
    let sessions = client.sessions();

    match command {
        SessionCommands::List { user } => {
            let list = sessions.refresh_sessions(user.as_deref()).await?;
            if list.is_empty() {
                println!("No active sessions.");
                return Ok(());
            }
            println!("{:<36}  {:<12}  {:<10}  last activity", "SESSION", "DOMAIN", "STATUS");
            for info in list {
                println!(
                    "{:<36}  {:<12}  {:<10}  {}",
                    info.session_id,
                    info.config.domain.as_deref().unwrap_or("-"),
                    info.status,
                    info.last_activity,
                );
            }
        }
        SessionCommands::Create {
            domain,
            model,
            graph,
            user,
        } => {
            let session_config = SessionConfig {
                domain: Some(domain),
                llm_model: model,
                enable_graph: Some(graph),
                ..SessionConfig::default()
            };
            println!("Creating session (the agent may take a while to warm up)...");
            let info = sessions.create_session(session_config, user.as_deref()).await?;
            println!("Created session {}", info.session_id);
        }
        SessionCommands::Delete { session_id, yes } => {
            if !yes && !confirm(&format!("Delete session {session_id}? This cannot be undone."))? {
                println!("Aborted.");
                return Ok(());
            }
            sessions.delete_session(&session_id).await?;
            println!("Deleted session {session_id}");
        }
        SessionCommands::Dormant => {
            let dormant = sessions.refresh_dormant().await?;
            if dormant.is_empty() {
                println!("No dormant sessions.");
                return Ok(());
            }
            println!("{:<36}  {:<12}  {:>8}  {:>10}  last message", "SESSION", "DOMAIN", "AGE", "MEMORY");
            for session in dormant {
                println!(
                    "{:<36}  {:<12}  {:>6}d  {:>8.1}MB  {}",
                    session.session_id,
                    session.domain,
                    session.age_days,
                    session.memory_size_mb,
                    truncate(&session.last_message, 40),
                );
            }
        }
        SessionCommands::Restore { session_id } => {
            println!("Restoring session {session_id}...");
            let info = sessions.restore_session(&session_id).await?;
            println!("Restored session {} ({})", info.session_id, info.status);
        }
        SessionCommands::Cleanup => {
            let response = sessions.cleanup().await?;
            println!("{}", response.message);
            if let Some(active) = response.active_sessions {
                println!("Active sessions remaining: {active}");
            }
        }
    }
    Ok(())
}

async fn run_chat(config: AgentdeckConfig, session_id: &str) -> Result<()> {
    let client = Arc::new(client_for(config)?);

    match client.enter_session(session_id).await {
        Ok(()) => println!("Connected to session {session_id}."),
        Err(e) => {
            // Chat still works over the HTTP fallback.
            println!("Socket unavailable ({e}); replies will use the HTTP API.");
        }
    }
    println!("Type a message and press enter. /quit leaves.");

    let printer = tokio::spawn(print_chat_updates(client.clone()));

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = LinesStream::new(tokio::io::AsyncBufReadExt::lines(stdin));
    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else { break };
                let line = line.context("reading stdin")?;
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" || text == "/exit" {
                    break;
                }
                if let Err(e) = client.chat().send_message(text, None).await {
                    println!("! {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    printer.abort();
    client.disconnect();
    println!("Left session {session_id}.");
    Ok(())
}

/// Print transcript additions and typing/error transitions as they land
async fn print_chat_updates(client: Arc<AgentClient>) {
    let mut changes = client.chat().subscribe_changes();
    let mut printed = 0usize;
    let mut was_typing = false;
    let mut last_error: Option<String> = None;

    loop {
        if changes.changed().await.is_err() {
            return;
        }
        let history = client.chat().history();
        for message in history.iter().skip(printed) {
            match message.kind {
                MessageKind::User => println!("you> {}", message.content),
                MessageKind::Agent => println!("agent> {}", message.content),
                MessageKind::System => println!("! {}", message.content),
            }
        }
        printed = history.len();

        let typing = client.chat().is_typing();
        if typing && !was_typing {
            println!("(agent is thinking...)");
        }
        was_typing = typing;

        let error = client.chat().error();
        if error != last_error {
            if let Some(e) = &error {
                println!("! {e}");
            }
            last_error = error;
        }
    }
}

async fn run_logs(config: AgentdeckConfig, session_id: &str, sources: Vec<String>) -> Result<()> {
    let client = Arc::new(client_for(config)?);
    client.enter_session(session_id).await?;
    await_handshake(&client).await?;

    let logs = client.logs();
    let targets = if sources.is_empty() {
        let available = wait_for_sources(&client).await?;
        println!("Subscribing to all sources: {}", available.join(", "));
        available
    } else {
        sources
    };
    logs.subscribe(&targets)?;

    let mut changes = logs.subscribe_changes();
    let mut printed = 0usize;
    println!("Streaming logs for session {session_id} (Ctrl+C to stop).");
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let entries = logs.entries();
                // A cap eviction can shrink the buffer under us.
                if printed > entries.len() {
                    printed = entries.len();
                }
                for entry in entries.iter().skip(printed) {
                    print_log_entry(entry);
                }
                printed = entries.len();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect();
    Ok(())
}

fn print_log_entry(entry: &LogEntry) {
    println!(
        "{} {:<8} [{}] {}",
        entry.timestamp, entry.level, entry.source, entry.message
    );
}

async fn run_status(config: AgentdeckConfig, session_id: &str) -> Result<()> {
    let client = client_for(config)?;
    let rest = client.rest();

    let status = rest.agent_status(session_id).await.context("agent status")?;
    println!("Session {session_id}");
    println!("  Agent status: {}", status.status);
    if !status.last_activity.is_empty() {
        println!("  Last activity: {}", status.last_activity);
    }

    match rest.memory_stats(session_id).await {
        Ok(stats) => {
            println!(
                "  Memory: {} conversations, {} entities, {} relationships ({} bytes)",
                stats.conversation_count,
                stats.entity_count,
                stats.relationship_count,
                stats.total_memory_size,
            );
        }
        Err(e) => println!("  Memory stats unavailable: {e}"),
    }

    match rest.graph_stats(session_id).await {
        Ok(stats) => {
            println!("  Graph: {} nodes, {} edges", stats.node_count, stats.edge_count);
            for (entity_type, count) in &stats.entity_types {
                println!("    {entity_type}: {count}");
            }
        }
        Err(e) => println!("  Graph stats unavailable: {e}"),
    }
    Ok(())
}

fn run_graph(nodes: &PathBuf, edges: &PathBuf) -> Result<()> {
    let snapshot = GraphSnapshot::load(nodes, edges).with_context(|| {
        format!(
            "loading graph export ({}, {})",
            nodes.display(),
            edges.display()
        )
    })?;

    println!(
        "Graph: {} nodes, {} edges",
        snapshot.node_count(),
        snapshot.edge_count()
    );
    if snapshot.dangling_edges() > 0 {
        println!("  ({} edges reference missing nodes)", snapshot.dangling_edges());
    }
    println!();
    println!("Entities by type:");
    for (entity_type, count) in snapshot.counts_by_type() {
        println!("  {entity_type:<14} {count}");
    }

    let mut nodes: Vec<_> = snapshot.nodes().collect();
    nodes.sort_by(|a, b| b.mention_count.cmp(&a.mention_count).then(a.id.cmp(&b.id)));
    println!();
    println!("Most mentioned:");
    for node in nodes.iter().take(10) {
        println!(
            "  {:<24} {:<12} mentions={:<4} links={}",
            truncate(&node.name, 24),
            node.entity_type,
            node.mention_count,
            snapshot.edges_for(&node.id).len(),
        );
    }
    Ok(())
}

/// Wait for the server handshake so subscription calls have a connection id
async fn await_handshake(client: &AgentClient) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), async {
        while client.transport().connection_id().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timed out waiting for the server handshake")
}

/// Wait for the available-source listing requested at bind time
async fn wait_for_sources(client: &AgentClient) -> Result<Vec<String>> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let available = client.logs().available_sources();
            if !available.is_empty() {
                return available;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timed out waiting for the log source listing")
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
