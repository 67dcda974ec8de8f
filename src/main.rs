// ABOUTME: Entry point for the statekeep binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs get/set/clear/keys against a storage backend.

mod config;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use statekeep_core::{Storage, StoragePersister, StoragePersisterOptions};
use statekeep_store::{FileStorage, SqliteStorage};

use crate::config::{Backend, StatekeepConfig};

#[derive(Parser)]
#[command(
    name = "statekeep",
    version,
    about = "Keyed state persistence with expiry and cache busting"
)]
struct Cli {
    /// Data directory (overrides STATEKEEP_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Storage backend (overrides STATEKEEP_BACKEND)
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// Version tag records must carry (overrides STATEKEEP_BUSTER)
    #[arg(long, global = true)]
    buster: Option<String>,

    /// Expiry in milliseconds, 0 never expires (overrides STATEKEEP_MAX_AGE_MS)
    #[arg(long, global = true)]
    max_age_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the state stored under a key
    Get { key: String },
    /// Store a JSON value under a key
    Set { key: String, json: String },
    /// Remove the state stored under a key
    Clear { key: String },
    /// List stored keys
    Keys,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("statekeep=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = StatekeepConfig::from_env()?;
    if let Some(home) = cli.home {
        config.home = home;
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(buster) = cli.buster {
        config.buster = Some(buster);
    }
    if let Some(millis) = cli.max_age_ms {
        config.max_age = Some(Duration::from_millis(millis));
    }

    let storage = open_storage(&config)?;
    tracing::debug!(home = %config.home.display(), backend = ?config.backend, "storage opened");

    match cli.command {
        Commands::Get { key } => {
            let (persister, failures) = persister_for(&config, &storage, &key);
            let state = persister.load_state();
            check_failures(&failures)?;
            match state {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => bail!("no state stored under '{key}'"),
            }
        }
        Commands::Set { key, json } => {
            let value: Value =
                serde_json::from_str(&json).context("value must be valid JSON")?;
            let (persister, failures) = persister_for(&config, &storage, &key);
            persister.save_state(&value);
            check_failures(&failures)?;
        }
        Commands::Clear { key } => {
            let (persister, failures) = persister_for(&config, &storage, &key);
            persister.clear_state(false);
            check_failures(&failures)?;
        }
        Commands::Keys => {
            let mut keys = storage.keys()?;
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
    }

    Ok(())
}

fn open_storage(config: &StatekeepConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.backend {
        Backend::File => Arc::new(
            FileStorage::open(&config.state_dir())
                .with_context(|| format!("opening {}", config.state_dir().display()))?,
        ),
        Backend::Sqlite => {
            std::fs::create_dir_all(&config.home)?;
            Arc::new(
                SqliteStorage::open(&config.database_path())
                    .with_context(|| format!("opening {}", config.database_path().display()))?,
            )
        }
    };
    Ok(storage)
}

type Failures = Arc<Mutex<Vec<String>>>;

/// Build a persister for `key` whose load and save failures are collected
/// so the CLI can exit non-zero.
fn persister_for(
    config: &StatekeepConfig,
    storage: &Arc<dyn Storage>,
    key: &str,
) -> (StoragePersister<Value>, Failures) {
    let failures: Failures = Arc::new(Mutex::new(Vec::new()));
    let on_load = Arc::clone(&failures);
    let on_save = Arc::clone(&failures);

    let mut options = StoragePersisterOptions::<Value>::new(key)
        .with_storage(Arc::clone(storage))
        .on_load_state_error(move |err, _| {
            if let Ok(mut failures) = on_load.lock() {
                failures.push(format!("load failed: {err}"));
            }
        })
        .on_save_state_error(move |err, _| {
            if let Ok(mut failures) = on_save.lock() {
                failures.push(format!("save failed: {err}"));
            }
        });
    options.buster = config.buster.clone();
    options.max_age = config.max_age;

    (StoragePersister::new(options), failures)
}

fn check_failures(failures: &Failures) -> Result<()> {
    let failures = failures
        .lock()
        .map_err(|_| anyhow::anyhow!("failure log poisoned"))?;
    if let Some(first) = failures.first() {
        bail!("{first}");
    }
    Ok(())
}
