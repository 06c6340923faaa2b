/// Schmux binary version. Bump this when releasing.
pub const VERSION: &str = "0.4.0";

use anyhow::{Context, Result, bail};
use axum::{
    Router, middleware,
    routing::{delete, get, post, put},
};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod error;
mod git;
mod handlers;
mod models;
mod nudge;
mod prs;
mod remote;
mod session;
mod state;
mod streamjson;
mod sync;
mod tmux;
mod tracker;
mod workspace;
mod ws;

use crate::auth::AuthService;
use crate::config::{Config, DataDirs, load_config};
use crate::handlers::remote::RateLimiter;
use crate::prs::PrCache;
use crate::remote::{RemoteEvent, RemoteHostManager};
use crate::session::SessionSupervisor;
use crate::state::StateStore;
use crate::sync::{HttpResolver, LinearSync, RealSyncGit};
use crate::tmux::TmuxGateway;
use crate::workspace::WorkspaceManager;

type SyncService = LinearSync<RealSyncGit, HttpResolver>;

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
#[command(name = "schmux")]
#[command(version = VERSION)]
#[command(about = "Supervisor for terminal-multiplexed agent sessions across branch workspaces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.schmux)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor in the foreground
    Server(ServerArgs),

    /// Check that external dependencies (tmux, git) are usable
    Doctor,
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server
    #[arg(short, long, default_value = "7337")]
    port: u16,

    /// Host to bind to
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub store: Arc<StateStore>,
    pub config: Arc<RwLock<Config>>,
    pub dirs: DataDirs,
    pub workspaces: Arc<WorkspaceManager>,
    pub supervisor: Arc<SessionSupervisor>,
    pub sync: Arc<SyncService>,
    pub remotes: Arc<RemoteHostManager>,
    pub prs: Arc<PrCache>,
    pub auth: Arc<AuthService>,
    /// Coalesced session-list snapshots for `/ws/sessions` forwarders.
    pub snapshots: broadcast::Sender<String>,
    pub rate_limiter: Arc<RateLimiter>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dirs = DataDirs::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Doctor => doctor(),
        Commands::Server(args) => run_server(args, dirs).await,
    }
}

fn doctor() -> Result<()> {
    for (bin, arg) in [("tmux", "-V"), ("git", "--version")] {
        match std::process::Command::new(bin).arg(arg).output() {
            Ok(out) if out.status.success() => {
                println!("{bin}: {}", String::from_utf8_lossy(&out.stdout).trim());
            }
            _ => bail!("{bin} is not usable; install it and ensure it is on PATH"),
        }
    }
    println!("ok");
    Ok(())
}

fn check_external_binaries() -> Result<()> {
    for (bin, arg) in [("tmux", "-V"), ("git", "--version")] {
        let usable = std::process::Command::new(bin)
            .arg(arg)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !usable {
            bail!("{bin} binary missing or unusable; refusing to start");
        }
    }
    Ok(())
}

async fn run_server(args: ServerArgs, dirs: DataDirs) -> Result<()> {
    let default_directive = if args.debug {
        "schmux=debug,tower_http=debug,info"
    } else {
        "schmux=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting schmux {VERSION}");
    check_external_binaries()?;

    // Startup failures past this point are fatal: an unreadable config or
    // state file must not be silently replaced.
    let config = load_config(&dirs.config_path).context("loading config")?;
    let store = Arc::new(StateStore::load(&dirs.state_path).context("loading state")?);

    let tmux = TmuxGateway::new(config.internal.command_timeout());
    let config = Arc::new(RwLock::new(config));

    let workspaces = Arc::new(WorkspaceManager::new(
        Arc::clone(&store),
        config.read().await.workspace_root(),
    ));
    let supervisor = Arc::new(SessionSupervisor::new(
        Arc::clone(&store),
        Arc::clone(&workspaces),
        tmux.clone(),
        Arc::clone(&config),
        dirs.clone(),
    ));

    let (resolver, confidence_floor) = {
        let config = config.read().await;
        let resolver = config.internal.resolver.clone().map(HttpResolver::new);
        let floor = config
            .internal
            .resolver
            .as_ref()
            .map(|r| r.confidence_floor)
            .unwrap_or(0.5);
        (resolver, floor)
    };
    let sync = Arc::new(LinearSync::new(
        Arc::clone(&store),
        Arc::clone(&workspaces),
        RealSyncGit {
            fetch_timeout: Duration::from_secs(120),
        },
        resolver,
        confidence_floor,
    ));

    let remotes = Arc::new(RemoteHostManager::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&supervisor),
    ));
    let prs = Arc::new(PrCache::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&workspaces),
    ));
    let auth = Arc::new(AuthService::new(
        config.read().await.access_control.clone(),
        &dirs.data_dir,
    )?);

    let (snapshots, _) = broadcast::channel(16);
    let state = AppState {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        dirs,
        workspaces: Arc::clone(&workspaces),
        supervisor: Arc::clone(&supervisor),
        sync,
        remotes: Arc::clone(&remotes),
        prs,
        auth,
        snapshots: snapshots.clone(),
        rate_limiter: Arc::new(RateLimiter::default()),
    };

    // Reconcile disk state before accepting traffic: pick up workspaces
    // created outside us and re-track sessions that survived a restart.
    match workspaces.scan().await {
        Ok(delta) if !delta.is_empty() => info!(
            "boot scan: {} added, {} updated, {} removed",
            delta.added.len(),
            delta.updated.len(),
            delta.removed.len()
        ),
        Ok(_) => {}
        Err(e) => warn!("boot scan failed: {e}"),
    }
    supervisor.restore_trackers().await;

    // Background machinery.
    supervisor.start_background();
    remotes.start_expiry_ticker();
    ws::sessions::spawn_snapshot_broadcaster(state.clone(), snapshots);
    spawn_periodic_saver(Arc::clone(&store));
    spawn_remote_cascade(Arc::clone(&remotes), Arc::clone(&supervisor), Arc::clone(&store));

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutting down; persisting state");
    store.save().await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/healthz", get(handlers::health::health))
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me));

    let protected = Router::new()
        .route("/api/sessions", get(handlers::sessions::list_sessions))
        .route("/api/spawn", post(handlers::sessions::spawn))
        .route("/api/dispose/{id}", post(handlers::sessions::dispose))
        .route(
            "/api/dispose-workspace/{id}",
            post(handlers::sessions::dispose_workspace),
        )
        .route(
            "/api/sessions-nickname/{id}",
            put(handlers::sessions::set_nickname),
        )
        .route("/api/workspaces", get(handlers::workspaces::list_workspaces))
        .route("/api/workspaces/scan", post(handlers::workspaces::scan))
        .route(
            "/api/workspaces/{id}/refresh-status",
            post(handlers::workspaces::refresh_status),
        )
        .route("/api/diff/{id}", get(handlers::workspaces::diff))
        .route("/api/git-graph/{id}", get(handlers::workspaces::git_graph))
        .route("/api/linear-sync/{id}", post(handlers::sync::start_sync))
        .route("/api/linear-sync/{id}", get(handlers::sync::get_sync))
        .route("/api/linear-sync/{id}", delete(handlers::sync::dismiss_sync))
        .route("/api/config", get(handlers::config::get_config))
        .route("/api/config", post(handlers::config::set_config))
        .route(
            "/api/config/remote-flavors",
            get(handlers::config::list_flavors),
        )
        .route(
            "/api/config/remote-flavors",
            post(handlers::config::add_flavor),
        )
        .route(
            "/api/config/remote-flavors/{id}",
            put(handlers::config::update_flavor),
        )
        .route(
            "/api/config/remote-flavors/{id}",
            delete(handlers::config::remove_flavor),
        )
        .route("/api/remote/hosts", get(handlers::remote::list_hosts))
        .route(
            "/api/remote/hosts/connect",
            post(handlers::remote::connect),
        )
        .route(
            "/api/remote/hosts/{id}/reconnect",
            post(handlers::remote::reconnect),
        )
        .route(
            "/api/remote/hosts/{id}",
            delete(handlers::remote::disconnect),
        )
        .route("/api/prs", get(handlers::prs::list_prs))
        .route("/api/prs/refresh", post(handlers::prs::refresh_prs))
        .route("/api/prs/checkout", post(handlers::prs::checkout_pr))
        .route("/ws/sessions", get(ws::sessions::sessions_handler))
        .route("/ws/terminal/{session_id}", get(ws::terminal::terminal_handler))
        .route(
            "/ws/provision/{session_id}",
            get(ws::terminal::provision_handler),
        )
        .route(
            "/ws/streamjson/{session_id}",
            get(ws::streamjson::streamjson_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Save on a timer, but only when the generation moved.
fn spawn_periodic_saver(store: Arc<StateStore>) {
    tokio::spawn(async move {
        let mut saved_generation = store.generation().await;
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let generation = store.generation().await;
            if generation == saved_generation {
                continue;
            }
            match store.save().await {
                Ok(()) => saved_generation = generation,
                Err(e) => warn!("periodic save failed: {e}"),
            }
        }
    });
}

/// Host going down cascades to workspaces (and their sessions) pinned to it.
fn spawn_remote_cascade(
    remotes: Arc<RemoteHostManager>,
    supervisor: Arc<SessionSupervisor>,
    store: Arc<StateStore>,
) {
    let mut events = remotes.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RemoteEvent::HostDown { host_id }) => {
                    for workspace in store.list_workspaces().await {
                        if workspace.remote_host_id.as_deref() == Some(host_id.as_str()) {
                            info!(
                                "host {host_id} down, disposing workspace {}",
                                workspace.id
                            );
                            if let Err(e) = supervisor.dispose_workspace(&workspace.id).await {
                                warn!("cascade dispose of {}: {e}", workspace.id);
                            }
                        }
                    }
                }
                Ok(RemoteEvent::Connected { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
