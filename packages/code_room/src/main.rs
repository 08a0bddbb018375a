use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod error;
mod handlers;
mod metrics;
mod questions;
mod session;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::config::{CodeRoomConfig, FileConfig, RoomConfig, RunConfig, load_config};
use crate::metrics::ServerMetrics;
use crate::questions::QuestionBank;
use crate::session::SessionRegistry;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "code-room")]
#[command(about = "Collaborative code editing rooms with sandboxed execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.code-room)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collaboration server in the foreground
    Server(ServerArgs),

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub run_config: Arc<RunConfig>,
    pub questions: Arc<QuestionBank>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    pub fn new(room_config: RoomConfig, run_config: RunConfig, questions: QuestionBank) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let run_config = Arc::new(run_config);
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(room_config),
            run_config.clone(),
            metrics.clone(),
        ));

        Self {
            registry,
            run_config,
            questions: Arc::new(questions),
            metrics,
        }
    }
}

/// All routes, without the HTTP tracing and CORS layers
pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/rooms", get(handlers::list_rooms))
        .route("/api/rooms/{room_id}", get(handlers::get_room))
        .route("/api/languages", get(handlers::list_languages))
        .route(
            "/api/questions/random",
            get(handlers::random_question_handler),
        )
        .route("/ws/{room_id}", get(handlers::room_websocket_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args, cli.data_dir).await,
        Commands::Config => print_config(cli.data_dir),
    }
}

fn resolve_config(data_dir: Option<PathBuf>) -> Result<(CodeRoomConfig, FileConfig)> {
    let config = CodeRoomConfig::new(data_dir)?;
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration from {}",
                config.config_toml_path().display()
            )
        })?;
    file_config.validate()?;
    Ok((config, file_config))
}

fn print_config(data_dir: Option<PathBuf>) -> Result<()> {
    let (_, file_config) = resolve_config(data_dir)?;
    let rendered =
        toml::to_string_pretty(&file_config).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

async fn run_server(args: ServerArgs, data_dir: Option<PathBuf>) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "code_room=debug,run_sandbox=debug,tower_http=debug,info"
    } else {
        "code_room=info,run_sandbox=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Code Room");

    let (_config, mut file_config) = resolve_config(data_dir)?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }

    let questions = QuestionBank::load(file_config.questions.path.as_deref())?;
    let room_config = RoomConfig::from_file(&file_config.rooms);
    let run_config = RunConfig::from_file(&file_config.run);

    info!(
        capacity = room_config.capacity,
        grace_secs = room_config.grace_period.as_secs(),
        run_timeout_secs = run_config.timeout.as_secs(),
        languages = ?run_config.languages.keys().collect::<Vec<_>>(),
        questions = questions.len(),
        "Configuration loaded"
    );
    if questions.is_empty() {
        info!("No question bank configured, /api/questions/random will answer 404");
    }
    if run_config.sandbox_prefix.is_empty() {
        warn!("run.sandbox_prefix is empty: code runs as this user with only process-level isolation");
    }

    let app_state = AppState::new(room_config, run_config, questions);
    let registry_for_shutdown = app_state.registry.clone();

    let app = build_router(app_state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", file_config.server.host, file_config.server.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    info!("Code Room listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET /ws/{{room_id}}          - Join a room (WebSocket)");
    info!("  GET /api/rooms              - List live rooms");
    info!("  GET /api/languages          - Runnable languages");
    info!("  GET /api/questions/random   - Random question (difficulty, topic_tags)");
    info!("  GET /health, /metrics");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!(
        rooms = registry_for_shutdown.len().await,
        "Shutdown complete"
    );
    server_result
}
