use clap::{Parser, ValueEnum};
use marketflow_core::{EngineConfig, StoreConfig, WorkflowConfig};
use marketflow_service::{build_router, ServiceConfig, ServiceState};
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
#[command(name = "marketflowd", version, about = "Marketplace job/bid/transaction REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
    /// Entity store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "MARKETFLOW_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for the jobs/bids/transactions tables.
    #[arg(long, env = "MARKETFLOW_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "MARKETFLOW_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Platform commission in basis points of the bid price.
    #[arg(long, default_value_t = 1_000, env = "MARKETFLOW_COMMISSION_RATE_BPS")]
    commission_rate_bps: u32,
    /// JSON file mapping bearer tokens to {user_id, role}.
    #[arg(long, env = "MARKETFLOW_IDENTITIES")]
    identities: Option<PathBuf>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StoreConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "marketflow_service=info,marketflow_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let store = resolve_storage(&cli)?;
    info!(backend = store.label(), "resolved entity store");
    let config = ServiceConfig {
        engine: EngineConfig {
            store,
            workflow: WorkflowConfig::with_commission_bps(cli.commission_rate_bps)?,
        },
        identities: cli.identities,
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("marketflow-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
