use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use rolodex_mcp_rs::config::{default_db_path, validate_db_path, GatewayConfig};
use rolodex_mcp_rs::extract::Extractor;
use rolodex_mcp_rs::graph::{Event, Person, Relationship};
use rolodex_mcp_rs::logging::{init_logging, TransportMode};
use rolodex_mcp_rs::manager::RolodexManager;
use rolodex_mcp_rs::session::StoryReply;
use rolodex_mcp_rs::storage::open_store;
use rolodex_mcp_rs::transcribe::{mime_type_for, Transcriber};

/// Personal rolodex knowledge graph built from narrated stories
#[derive(Debug, Parser)]
#[command(name = "rolodex-mcp-rs", version, about)]
struct Cli {
    /// Serve streamable HTTP instead of stdio
    #[arg(short = 's', long)]
    stream: bool,

    /// HTTP port (stream mode)
    #[arg(short = 'p', long, default_value_t = 8000)]
    port: u16,

    /// HTTP bind address (stream mode)
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: String,

    /// Snapshot file (.db for SQLite, .json for a JSON document)
    #[arg(long, env = "ROLODEX_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Append logs to this file
    #[arg(short = 'l', long)]
    log: Option<PathBuf>,
}

#[derive(Clone)]
struct RolodexServer {
    manager: Arc<RolodexManager>,
    tool_router: ToolRouter<Self>,
}

impl RolodexServer {
    fn new(manager: Arc<RolodexManager>) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "rolodex-mcp-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Tell stories with process_story or process_audio. When new people are found, \
                 confirm them with confirm_persons before they are added to the rolodex."
                    .to_string(),
            ),
        }
    }
}

fn reply_result(reply: StoryReply) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(reply.response())],
        structured_content: Some(json!(reply)),
        is_error: Some(matches!(reply, StoryReply::Failed { .. })),
        meta: None,
    }
}

#[tool_router]
impl RolodexServer {
    /// Read entire knowledge graph
    #[tool(
        name = "read_graph",
        description = "Read the entire rolodex knowledge graph (persons, events, relationships)"
    )]
    async fn read_graph(&self) -> Result<CallToolResult, McpError> {
        let graph = self.manager.read_graph().await;
        let summary = format!("Knowledge graph contains {}", graph.summary());

        Ok(CallToolResult {
            content: vec![Content::text(&summary)],
            structured_content: Some(json!(graph)),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Detect which candidate persons are new
    #[tool(
        name = "identify_new_persons",
        description = "Given candidate persons (by name), list those not yet in the rolodex, with canonical IDs. Nothing is stored."
    )]
    async fn identify_new_persons(
        &self,
        Parameters(args): Parameters<IdentifyNewPersonsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let new_persons = self.manager.identify_new_persons(args.persons).await;
        let summary = format!("{} new persons identified", new_persons.len());

        Ok(CallToolResult {
            content: vec![Content::text(&summary)],
            structured_content: Some(json!({ "persons": new_persons })),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Merge confirmed data directly
    #[tool(
        name = "merge_confirmed",
        description = "Merge confirmed persons plus candidate events and relationships into the rolodex. Existing entries are never overwritten; relationships with unknown endpoints are skipped and reported."
    )]
    async fn merge_confirmed(
        &self,
        Parameters(args): Parameters<MergeConfirmedArgs>,
    ) -> Result<CallToolResult, McpError> {
        let merged = self
            .manager
            .merge_confirmed(args.confirmed_persons, args.events, args.relationships)
            .await;

        let report = &merged.report;
        let mut summary = format!(
            "Added {} persons, {} events and {} relationships; skipped {} relationships ({} dangling)",
            report.added_persons.len(),
            report.added_events.len(),
            report.added_relationships.len(),
            report.skipped.len(),
            report.dangling().count()
        );
        if !merged.persisted {
            summary.push_str(" (warning: graph could not be saved)");
        }

        Ok(CallToolResult {
            content: vec![Content::text(&summary)],
            structured_content: Some(json!(merged)),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Process a story told as text
    #[tool(
        name = "process_story",
        description = "Extract people, events and relationships from a story and add them to the rolodex. New people must be confirmed with confirm_persons."
    )]
    async fn process_story(
        &self,
        Parameters(args): Parameters<ProcessStoryArgs>,
    ) -> Result<CallToolResult, McpError> {
        if args.text.trim().is_empty() {
            return Err(McpError::invalid_params("Story text cannot be empty", None));
        }
        let reply = self
            .manager
            .process_story(&args.text)
            .await
            .map_err(invalid_params("Cannot process story now"))?;
        Ok(reply_result(reply))
    }

    /// Process a recorded story
    #[tool(
        name = "process_audio",
        description = "Transcribe an audio file (wav, mp3, ogg, m4a) and process the story it tells"
    )]
    async fn process_audio(
        &self,
        Parameters(args): Parameters<ProcessAudioArgs>,
    ) -> Result<CallToolResult, McpError> {
        let path = PathBuf::from(&args.path);
        let audio = tokio::fs::read(&path)
            .await
            .map_err(invalid_params("Failed to read audio file"))?;
        let reply = self
            .manager
            .process_audio(&audio, mime_type_for(&path))
            .await
            .map_err(invalid_params("Cannot process story now"))?;
        Ok(reply_result(reply))
    }

    /// Confirm proposed persons
    #[tool(
        name = "confirm_persons",
        description = "Confirm which of the proposed new persons to add (by ID); the rest of the pending story is then merged"
    )]
    async fn confirm_persons(
        &self,
        Parameters(args): Parameters<ConfirmPersonsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let reply = self
            .manager
            .confirm_persons(&args.person_ids)
            .await
            .map_err(invalid_params("Nothing to confirm"))?;
        Ok(reply_result(reply))
    }

    /// Show session state
    #[tool(
        name = "session_status",
        description = "Show the story session state and any persons awaiting confirmation"
    )]
    async fn session_status(&self) -> Result<CallToolResult, McpError> {
        let status = self.manager.status().await;
        let summary = format!(
            "Session is {} with {} persons awaiting confirmation",
            status.state,
            status.proposals.len()
        );

        Ok(CallToolResult {
            content: vec![Content::text(&summary)],
            structured_content: Some(json!(status)),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Read conversation transcript
    #[tool(
        name = "chat_history",
        description = "Read the conversation transcript of told stories and responses"
    )]
    async fn chat_history(&self) -> Result<CallToolResult, McpError> {
        let history = self.manager.chat_history().await;

        Ok(CallToolResult {
            content: vec![Content::text(format!("{} messages", history.len()))],
            structured_content: Some(json!({ "messages": history })),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Clear all data
    #[tool(
        name = "clear_all",
        description = "Delete the whole rolodex and the conversation transcript"
    )]
    async fn clear_all(&self) -> Result<CallToolResult, McpError> {
        self.manager
            .clear_all()
            .await
            .map_err(internal_err("Failed to clear data"))?;

        Ok(CallToolResult::success(vec![Content::text(
            "All data cleared successfully",
        )]))
    }
}

#[tool_handler]
impl ServerHandler for RolodexServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }
}

// Tool argument schemas

#[derive(Debug, Deserialize, JsonSchema)]
struct IdentifyNewPersonsArgs {
    persons: Vec<Person>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MergeConfirmedArgs {
    #[serde(default)]
    confirmed_persons: Vec<Person>,
    #[serde(default)]
    events: Vec<Event>,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ProcessStoryArgs {
    text: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ProcessAudioArgs {
    /// Path to the audio file on the server
    path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ConfirmPersonsArgs {
    person_ids: Vec<String>,
}

// Helpers for error conversion
fn internal_err<T: std::fmt::Display>(msg: &'static str) -> impl FnOnce(T) -> McpError + Clone {
    move |err| McpError::internal_error(msg, Some(json!({ "error": format!("{err:#}") })))
}

fn invalid_params<T: ToString>(msg: &'static str) -> impl FnOnce(T) -> McpError + Clone {
    move |err| McpError::invalid_params(msg, Some(json!({ "error": err.to_string() })))
}

async fn serve_http(server: RolodexServer, bind: &str, port: u16) -> anyhow::Result<()> {
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    };

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );
    let router = axum::Router::new()
        .route("/health", axum::routing::get(|| async { "OK" }))
        .nest_service("/mcp", service);

    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "Serving MCP over streamable HTTP at /mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so it can feed both clap's env fallbacks and the gateways
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mode = if cli.stream { TransportMode::Stream } else { TransportMode::Stdio };
    // CRITICAL: stdio mode must stay silent on stderr (see logging)
    init_logging(mode, cli.log.as_deref())?;

    let db_path = validate_db_path(&cli.db_path.clone().unwrap_or_else(default_db_path))?;
    let store = Arc::from(open_store(&db_path)?);

    let gateways = GatewayConfig::from_env();
    let extractor = Extractor::from_config(&gateways.openai)?;
    let transcriber = Transcriber::from_config(&gateways.deepgram)?;

    let manager = Arc::new(RolodexManager::new(store, extractor, transcriber));
    let server = RolodexServer::new(manager);

    match mode {
        TransportMode::Stdio => {
            let svc = server.serve(stdio()).await?;
            svc.waiting().await?;
        }
        TransportMode::Stream => serve_http(server, &cli.bind, cli.port).await?,
    }

    Ok(())
}
