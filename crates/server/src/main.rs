//! vibecheck server
//!
//! Remote control for headless coding agents: exposes pending tool
//! approvals, input requests and the agent's conversation over HTTP and a
//! per-session WebSocket event stream.

mod api;
mod auth;
mod backlog;
mod bridge;
mod config;
mod connections;
mod discovery;
mod logging;
mod manager;
mod paths;
mod pending;
mod state;
#[cfg(test)]
mod test_support;
mod transition;
mod translate;
mod websocket;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use vibecheck_connectors::{AgentRuntime, StdioRuntime, UnavailableRuntime};

use crate::config::{Cli, Command, ServerArgs};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start) {
        Command::GeneratePsk => {
            println!("{}", config::generate_psk());
            Ok(())
        }
        Command::Start => run_server(cli.server).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    paths::ensure_dirs(&config.data_dir)?;
    let logging = logging::init_logging(&paths::log_dir(&config.data_dir))?;

    let runtime: Arc<dyn AgentRuntime> = match &config.agent {
        Some(agent) => Arc::new(StdioRuntime::new(
            agent.program.clone(),
            agent.args.clone(),
            agent.cwd.clone(),
        )),
        None => Arc::new(UnavailableRuntime::new("no agent command configured")),
    };

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %config.data_dir.display(),
        logs_root = %config.logs_root.display(),
        runtime = runtime.name(),
        "Starting vibecheck server"
    );

    let state = AppState::new(
        config.psk.clone(),
        config.logs_root.clone(),
        Some(runtime),
        config.static_dir.clone(),
        config.heartbeat_interval,
    );
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind((config.bind.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %addr,
        "Listening on {}",
        addr
    );
    eprintln!(
        "vibecheck listening on {addr} (logs: {})",
        logging.log_path.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

/// Wait for ctrl-c, then tear down every bridge so pending approvals and
/// input requests fail and sockets see the `disconnected` state.
async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    let detached = state.sessions.detach_all();
    info!(
        component = "server",
        event = "server.shutdown",
        detached_sessions = detached,
        connected_clients = state.connections.total_clients(),
        "Shutting down"
    );
}

fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(api::root))
        .route("/api/health", get(api::health))
        .route("/api/state", get(api::fleet_state))
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/sessions/{session_id}", get(api::session_detail))
        .route("/api/sessions/{session_id}/state", get(api::session_state))
        .route("/api/sessions/{session_id}/approve", post(api::approve))
        .route("/api/sessions/{session_id}/input", post(api::input_response))
        .route("/api/sessions/{session_id}/message", post(api::message))
        .route("/ws/events/{session_id}", get(websocket::ws_handler))
        .fallback(api::not_found);

    if let Some(dir) = &state.static_dir {
        router = router.nest_service("/static", ServeDir::new(dir));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.psk.clone(),
            auth::psk_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
