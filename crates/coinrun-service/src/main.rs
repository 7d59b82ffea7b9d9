use clap::{Parser, ValueEnum};
use coinrun_core::{Coins, EngineConfig, FundingPolicy, StorageConfig};
use coinrun_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "coinrund", version, about = "coinrun funding ledger REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092")]
    listen: SocketAddr,
    /// JSON file holding registered resources. In-memory when omitted.
    #[arg(long, env = "COINRUN_REGISTRY_PATH")]
    registry_path: Option<PathBuf>,
    /// State persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "COINRUN_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for wallet, request, run and ledger persistence.
    #[arg(long, env = "COINRUN_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "COINRUN_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Coins consumed by one run.
    #[arg(long, default_value_t = 10, env = "COINRUN_RUN_THRESHOLD")]
    run_threshold: u64,
    /// Coins granted to every newly onboarded principal.
    #[arg(long, default_value_t = 50, env = "COINRUN_STARTER_GRANT")]
    starter_grant: u64,
    /// Largest single commitment accepted.
    #[arg(long, default_value_t = 10_000, env = "COINRUN_MAX_COMMITMENT")]
    max_commitment: u64,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "coinrun_service=info,coinrun_core=info,coinrun_adapters=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let policy = FundingPolicy {
        run_threshold: Coins(cli.run_threshold),
        starter_grant: Coins(cli.starter_grant),
        max_commitment: Coins(cli.max_commitment),
    };
    let config = ServiceConfig {
        registry_path: cli.registry_path,
        engine: EngineConfig { policy, storage },
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        "coinrun-service REST listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;

    Ok(())
}
