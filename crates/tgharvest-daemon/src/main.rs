use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use tgharvest_core::HarvesterConfig;
use tgharvest_engine::ephemeral::EphemeralStore;
use tgharvest_engine::notify::{Notify, NoopNotifier};
use tgharvest_engine::{Harvester, MemoryEphemeral, RedisEphemeral, TickOutcome};
use tgharvest_store::Store;
use tgharvest_upstream::loopback::{LoopbackFactory, LoopbackWorld};
use tgharvest_upstream::{ClientFactory, ClientPool};

mod notifier;

#[derive(Parser)]
#[command(name = "tgharvestd", about = "Channel message harvesting worker")]
struct Cli {
    /// Path to tgharvest.toml (default: ~/.tgharvest/tgharvest.toml).
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single tick and exit: 0 = completed, 2 = lock held.
    Once {
        /// Run even if the tick lock is held by another instance.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tgharvestd=info,tgharvest_engine=info,tgharvest_store=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "tgharvestd: fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = HarvesterConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        HarvesterConfig::default()
    });

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&config.database.path)?);

    // The loopback adapter is fully self-contained: it gets an in-process
    // ephemeral store too, so development runs need no Redis.
    let loopback = config.upstream.adapter == "loopback";
    let ephemeral: Arc<dyn EphemeralStore> = if loopback {
        Arc::new(MemoryEphemeral::new())
    } else {
        Arc::new(RedisEphemeral::connect(&config.ephemeral.url)?)
    };

    let factory: Arc<dyn ClientFactory> = match config.upstream.adapter.as_str() {
        "loopback" => Arc::new(LoopbackFactory::new(LoopbackWorld::new())),
        other => anyhow::bail!(
            "unknown upstream adapter '{other}': concrete transports are \
             provided by adapter crates implementing ClientFactory"
        ),
    };
    let pool = Arc::new(ClientPool::new(factory, config.upstream.clone()));

    let notifier: Arc<dyn Notify> = match config.notify.bot_token.as_deref() {
        Some(token) if !token.is_empty() => Arc::new(notifier::TelegramNotifier::new(
            token,
            config.notify.operator_chat_id,
            store.clone(),
        )),
        _ => {
            info!("notify: no bot token configured, notifications disabled");
            Arc::new(NoopNotifier)
        }
    };

    let harvester = Harvester::new(store, pool, ephemeral, notifier, config);

    match cli.command {
        Some(Command::Once { force }) => match harvester.run_once(force).await? {
            TickOutcome::Completed => Ok(ExitCode::SUCCESS),
            TickOutcome::SkippedLockHeld => Ok(ExitCode::from(2)),
        },
        None => {
            harvester.run_loop().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}
