use anyhow::{Context, Result};
use clap::Parser;
use podgate_api::listener::{self, ActivationEnv, ApiListener};
use podgate_api::{ApiServer, AppState, ServerConfig, create_router};
use podgate_core::{Config, MemoryEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "podgate-daemon")]
#[command(author, version, about, long_about = None)]
pub struct DaemonArgs {
    /// Listen URI (`unix:///path`, `tcp:host:port`). Without one the daemon
    /// uses a socket-activated listener, or the configured socket path.
    pub uri: Option<String>,

    /// Seconds of inactivity before the service exits; 0 serves forever.
    #[arg(short, long, env = "PODGATE_TIME")]
    pub time: Option<u64>,

    /// Configuration file to load instead of the default locations.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(time) = args.time {
        config.service.idle_timeout_secs = time;
    }

    init_logging(&config);
    run(args, config).await
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        format!("podgate_daemon={level},podgate_api={level},podgate_core={level},tower_http=warn")
            .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn run(args: DaemonArgs, config: Config) -> Result<()> {
    let listener = open_listener(args.uri.as_deref(), &config).await?;
    let socket_path = listener::unix_socket_path(&listener);

    let engine = Arc::new(MemoryEngine::with_demo_registry());
    let state = AppState::new(engine).with_stream_buffer(config.service.stream_buffer);
    let server = ApiServer::new(
        listener,
        create_router(state),
        ServerConfig::from(&config.service),
    );

    info!(
        addr = %server.local_addr(),
        idle_timeout_secs = config.service.idle_timeout_secs,
        "podgate API service starting"
    );
    let result = server.serve().await.context("API server failed");

    // A socket-activated listener belongs to the service manager.
    if args.uri.is_some() || !ActivationEnv::from_process().is_active() {
        if let Some(path) = socket_path {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove socket {}: {}", path.display(), e);
                }
            }
        }
    }

    info!("podgate API service stopped");
    result
}

async fn open_listener(uri: Option<&str>, config: &Config) -> Result<ApiListener> {
    if let Some(uri) = uri {
        return listener::bind(uri)
            .await
            .with_context(|| format!("Failed to bind {uri}"));
    }
    if ActivationEnv::from_process().is_active() {
        return listener::acquire(None).context("Failed to acquire socket-activated listener");
    }
    listener::bind_unix(&config.service.socket_path).with_context(|| {
        format!(
            "Failed to bind {}",
            config.service.socket_path.display()
        )
    })
}
