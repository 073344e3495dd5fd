use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use atelier::config::Config;
use atelier::events::EventBus;
use atelier::github::GitHubClient;
use atelier::gitrepo::LocalGitRepo;
use atelier::llm::OpenAiFixer;
use atelier::orchestrator::Orchestrator;
use atelier::server::{self, AppState};
use atelier::store::{DbHandle, Store};
use atelier::tunnel;

#[derive(Parser)]
#[command(name = "atelier", about = "AI web-app factory backend")]
struct Args {
    #[arg(long, default_value_t = 3141)]
    port: u16,

    #[arg(long, default_value = ".atelier/factory.db")]
    db_path: PathBuf,

    /// Local development mode: permissive CORS and a webhook tunnel.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::from_env(args.port, args.db_path, args.dev)?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = DbHandle::new(Store::new(&config.db_path)?);

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        Arc::new(GitHubClient::new(&config)),
        Arc::new(OpenAiFixer::new(&config)),
        Arc::new(LocalGitRepo::new(&config)),
        EventBus::new(256),
    ));

    // Replay CI state missed while the process was down.
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.reconcile().await });
    }

    // In dev mode the webhook endpoint is only reachable through a tunnel;
    // every reconnect triggers another sweep.
    {
        let orchestrator = orchestrator.clone();
        tunnel::spawn_if_local(&config, move || {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.reconcile().await }
        });
    }

    let state = Arc::new(AppState { db, orchestrator });
    server::start_server(&config, state).await
}
