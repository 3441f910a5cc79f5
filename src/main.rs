//! Dockhand daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info};

mod backend;
mod checkout;
mod config;
mod error;
mod hook;
mod httpd;
mod lock;
mod orchestrator;
mod pipeline;
mod publish;
mod rpcd;
mod runtime;
mod service;
mod ssh;
mod store;
mod types;

use backend::{Backend, BackendRegistry};
use config::{Configuration, CONFIG_PATH_ENV};
use httpd::HttpService;
use rpcd::RpcService;
use service::{ServiceConstructor, Supervisor};
use ssh::SshService;
use store::{ConfigStore, KeyStore};

#[derive(Parser)]
#[command(name = "dockhand", about = "Push-to-deploy over git and SSH")]
struct Cli {
    /// Configuration file (TOML, or JSON by extension).
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SSH, HTTP and RPC services (default).
    Serve,
    /// Pre-receive hook entry point, run by git.
    Hook { repository: String },
    /// Manage the public keys allowed to push.
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Register every key in an authorized_keys style file.
    Add { file: PathBuf },
    List,
    Remove { fingerprint: String },
}

/// Services started by `serve`, in start order.
const SERVICES: [ServiceConstructor; 3] = [
    SshService::construct,
    HttpService::construct,
    RpcService::construct,
];

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let loaded = Configuration::load(cli.config.as_deref())?;
    init_logging(loaded.debug);

    let registry = BackendRegistry::new();
    let backend = registry
        .open(loaded.backend.kind, &loaded.backend.uri, &loaded.data_dir)
        .with_context(|| format!("could not open {} backend", loaded.backend.kind))?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&loaded, backend).await,
        Commands::Hook { repository } => {
            let mut config = ConfigStore::new(Arc::clone(&backend))
                .load_or_seed(&loaded)
                .await?;
            // git runs hooks inside the repository; keep the absolute dir
            config.data_dir = loaded.data_dir.clone();
            let result = hook::run(&config, Arc::clone(&backend), &repository).await;
            backend.close().await?;
            if let Err(e) = result {
                error!("{:#}", e);
                std::process::exit(hook::FAILURE_EXIT);
            }
            Ok(())
        }
        Commands::Keys { action } => {
            let result = keys(action, KeyStore::new(Arc::clone(&backend))).await;
            backend.close().await?;
            result
        }
    }
}

async fn serve(loaded: &Configuration, backend: Arc<dyn Backend>) -> anyhow::Result<()> {
    let config = ConfigStore::new(Arc::clone(&backend))
        .load_or_seed(loaded)
        .await?;
    info!(
        "Starting dockhand for {} ({} backend)",
        config.hostname, config.backend.kind
    );

    let mut supervisor = Supervisor::new(&SERVICES, &config, Arc::clone(&backend));
    let result = supervisor.run().await;
    backend.close().await?;
    info!("Shutdown complete.");
    result
}

async fn keys(action: KeyCommands, store: KeyStore) -> anyhow::Result<()> {
    match action {
        KeyCommands::Add { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("could not read {}", file.display()))?;
            for line in text.lines().map(str::trim) {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let key = ssh::parse_authorized_key(line)?;
                store.add(&key).await?;
                println!("added {} {}", key.fingerprint, key.comment);
            }
        }
        KeyCommands::List => {
            for key in store.list().await? {
                println!("{}  {}", key.fingerprint, key.comment);
            }
        }
        KeyCommands::Remove { fingerprint } => {
            store.get(&fingerprint).await?;
            store.remove(&fingerprint).await?;
            println!("removed {}", fingerprint);
        }
    }
    Ok(())
}
