//! The `octo` binary: backend, agent daemon and Telegram bot in one.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    secrecy::Secret,
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    octo_agent::{
        AgentCredentials, BackendClient, Dispatcher, PollConfig, PortAllocator, ProjectRegistry,
        WorkerConfig, WorkerSupervisor, run_poll_loop,
    },
    octo_backend::BackendState,
    octo_common::{Clock, SystemClock},
    octo_pairing::{PairingPersistence, PairingStore, SqlitePairingPersistence},
    octo_queue::{CommandQueue, MemoryQueue, SqliteQueue},
    octo_telegram::{BotConfig, start_bot},
};

#[derive(Parser)]
#[command(name = "octo", about = "octo — Telegram-driven control plane for a local code-gen CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the central backend.
    Backend {
        /// Address to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on.
        #[arg(long, default_value_t = 8787, env = "OCTO_PORT")]
        port: u16,
        /// SQLite database path; stores stay in memory when omitted.
        #[arg(long, env = "OCTO_DB")]
        db: Option<PathBuf>,
    },
    /// Agent daemon management.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Run the Telegram bot.
    Bot {
        /// Bot token from @BotFather.
        #[arg(long, env = "OCTO_TELEGRAM_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long, default_value = "http://127.0.0.1:8787", env = "OCTO_BACKEND_URL")]
        backend_url: String,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Claim a pairing code and store the agent credentials.
    Pair {
        /// Pairing code displayed by the bot.
        #[arg(long)]
        code: String,
        #[arg(long, default_value = "http://127.0.0.1:8787", env = "OCTO_BACKEND_URL")]
        backend_url: String,
        /// Where credentials and the project registry live.
        #[arg(long, env = "OCTO_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Free-form device description sent with the claim.
        #[arg(long, default_value = "octo-agent")]
        device_info: String,
    },
    /// Run the agent daemon.
    Run {
        /// Override the backend URL stored at pairing time.
        #[arg(long, env = "OCTO_BACKEND_URL")]
        backend_url: Option<String>,
        /// The worker CLI binary to supervise.
        #[arg(long, default_value = "opencode", env = "OCTO_WORKER_CLI")]
        worker_cli: String,
        #[arg(long, env = "OCTO_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
}

fn init_tracing(level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn default_data_dir() -> PathBuf {
    dirs_next::data_dir()
        .map(|dir| dir.join("octo"))
        .unwrap_or_else(|| PathBuf::from(".octo"))
}

/// Cancel the token on Ctrl-C.
fn spawn_shutdown_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Backend { bind, port, db } => run_backend(bind, port, db).await,
        Commands::Agent { action } => match action {
            AgentAction::Pair {
                code,
                backend_url,
                data_dir,
                device_info,
            } => agent_pair(code, backend_url, data_dir, device_info).await,
            AgentAction::Run {
                backend_url,
                worker_cli,
                data_dir,
            } => agent_run(backend_url, worker_cli, data_dir).await,
        },
        Commands::Bot { token, backend_url } => run_bot(token, backend_url).await,
    }
}

async fn run_backend(bind: String, port: u16, db: Option<PathBuf>) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (pairing, queue): (Arc<PairingStore>, Arc<dyn CommandQueue>) = match db {
        Some(path) => {
            let url = format!("sqlite://{}?mode=rwc", path.display());
            let pool = sqlx::SqlitePool::connect(&url)
                .await
                .with_context(|| format!("opening database at {}", path.display()))?;
            SqliteQueue::init(&pool).await?;
            SqlitePairingPersistence::init(&pool).await?;
            let persistence = Arc::new(SqlitePairingPersistence::new(pool.clone()));
            let pairing = Arc::new(
                PairingStore::new(Arc::clone(&clock))
                    .with_persistence(persistence as Arc<dyn PairingPersistence>),
            );
            pairing.hydrate().await;
            info!(db = %path.display(), "backend using durable stores");
            (
                pairing,
                Arc::new(SqliteQueue::new(pool, Arc::clone(&clock))),
            )
        },
        None => {
            info!("backend using in-memory stores");
            (
                Arc::new(PairingStore::new(Arc::clone(&clock))),
                Arc::new(MemoryQueue::new(Arc::clone(&clock))),
            )
        },
    };

    let state = Arc::new(BackendState::new(pairing, queue, clock));
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;
    let cancel = CancellationToken::new();
    spawn_shutdown_watcher(cancel.clone());
    octo_backend::serve(state, addr, cancel).await
}

async fn agent_pair(
    code: String,
    backend_url: String,
    data_dir: Option<PathBuf>,
    device_info: String,
) -> anyhow::Result<()> {
    let claimed = BackendClient::claim_pairing(&backend_url, &code, &device_info).await?;
    let credentials = AgentCredentials {
        agent_id: claimed.agent_id.clone(),
        agent_key: claimed.agent_key,
        backend_url,
    };
    let path = data_dir.unwrap_or_else(default_data_dir).join("agent.toml");
    credentials.save(&path)?;
    println!(
        "Paired as {} — credentials stored at {}",
        claimed.agent_id,
        path.display()
    );
    Ok(())
}

async fn agent_run(
    backend_url: Option<String>,
    worker_cli: String,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let data_dir = data_dir.unwrap_or_else(default_data_dir);
    let credentials = AgentCredentials::load(&data_dir.join("agent.toml"))
        .context("no agent credentials found; run `octo agent pair --code <code>` first")?;
    let backend_url = backend_url.unwrap_or_else(|| credentials.backend_url.clone());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(ProjectRegistry::open(data_dir.join("projects.toml"))?);
    let ports = Arc::new(PortAllocator::with_default_range());
    let workers = Arc::new(WorkerSupervisor::new(
        WorkerConfig {
            cli_bin: worker_cli,
            ..WorkerConfig::default()
        },
        Arc::clone(&ports),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        credentials.agent_id.clone(),
        clock,
        registry,
        workers,
    ));
    let client = Arc::new(BackendClient::new(
        backend_url,
        Secret::new(credentials.agent_key.clone()),
    )?);

    let cancel = CancellationToken::new();
    spawn_shutdown_watcher(cancel.clone());
    info!(agent_id = credentials.agent_id, "agent started");
    run_poll_loop(client, dispatcher, PollConfig::default(), cancel).await;
    Ok(())
}

async fn run_bot(token: String, backend_url: String) -> anyhow::Result<()> {
    let config = BotConfig::new(Secret::new(token), backend_url);
    let cancel = start_bot(config).await?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            cancel.cancel();
        },
        _ = cancel.cancelled() => {},
    }
    Ok(())
}
