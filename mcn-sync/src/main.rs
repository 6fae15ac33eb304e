//! mcn-sync - MCN affiliation dataset sync and harvest tool
//!
//! Subcommands map onto the consumer interface of the annotation layer:
//! `lookup`, `harvest`, `refresh` and `export`. `observe` is the entry
//! point of a secondary harvest context and is normally only invoked by
//! `harvest` itself.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcn_common::config::{self, TomlConfig};
use mcn_common::store::{local_records, read_envelope, SqliteStore};
use mcn_common::{time, PersistentStore};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use mcn_sync::export::{write_export, ExportOutcome};
use mcn_sync::fetcher::RemoteDatasetFetcher;
use mcn_sync::harvest::{HarvestTiming, LoggingEvents};
use mcn_sync::launcher::{ContextLauncher, InProcessLauncher, ProcessLauncher};
use mcn_sync::observer::{ExtractionObserver, HttpPageLoader};
use mcn_sync::{AppState, HarvestCoordinator, ReconciliationEngine, RefreshOutcome};

#[derive(Parser)]
#[command(name = "mcn-sync", version, about = "Sync and harvest Zhihu MCN affiliations")]
struct Cli {
    /// Configuration file (default: ~/.config/mcn-sync/config.toml)
    #[arg(long, env = "MCN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Root folder holding the store and exports
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the affiliation of one or more authors
    Lookup {
        #[arg(required = true)]
        subject_ids: Vec<String>,
        /// Refresh the dataset first if the cache has expired
        #[arg(long)]
        refresh_if_stale: bool,
    },
    /// Fetch the shared dataset and rebuild the cache
    Refresh {
        /// Skip the fetch while the cache is still valid
        #[arg(long)]
        if_stale: bool,
    },
    /// Harvest authors' affiliations from their profile pages
    Harvest {
        #[arg(required = true)]
        subject_ids: Vec<String>,
        /// Run harvest contexts as tasks instead of child processes
        #[arg(long)]
        in_process: bool,
    },
    /// Extract the affiliation from one profile page (harvest context)
    Observe { url: String },
    /// Write every known affiliation to a timestamped JSON file
    Export {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show cache and store statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let toml_config = match &config_path {
        Some(path) => config::load_toml_config(path)?,
        None => TomlConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&toml_config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        "Starting mcn-sync v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    match &config_path {
        Some(path) if path.exists() => info!("Config: {}", path.display()),
        _ => warn!("No config file found, using defaults"),
    }

    let root_folder = config::resolve_root_folder(cli.root.as_deref(), &toml_config);
    let db_path = config::database_path(&root_folder);
    info!("Store: {}", db_path.display());

    let store: Arc<dyn PersistentStore> = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .with_context(|| format!("Failed to open store {}", db_path.display()))?,
    );

    match cli.command {
        Command::Observe { url } => observe(store, &toml_config, &url).await,
        Command::Lookup {
            subject_ids,
            refresh_if_stale,
        } => {
            let engine = build_engine(store, &toml_config)?;
            engine.load_cache().await;
            if refresh_if_stale {
                engine.refresh_if_stale().await;
            }
            for subject_id in &subject_ids {
                print_affiliation(subject_id, engine.lookup(subject_id).await);
            }
            Ok(())
        }
        Command::Refresh { if_stale } => {
            let engine = build_engine(store, &toml_config)?;
            engine.load_cache().await;
            let outcome = if if_stale {
                engine.refresh_if_stale().await
            } else {
                engine.refresh().await
            };
            match outcome {
                RefreshOutcome::Updated { entries } => println!("Updated MCN data ({entries} entries)"),
                RefreshOutcome::Unpersisted { entries, error } => {
                    println!("Updated MCN data ({entries} entries) but could not save it: {error}")
                }
                RefreshOutcome::Fresh => println!("Cache still valid, nothing to update"),
                RefreshOutcome::Failed(e) => println!("Failed to update MCN data: {e}"),
            }
            Ok(())
        }
        Command::Harvest {
            subject_ids,
            in_process,
        } => {
            let launcher: Arc<dyn ContextLauncher> = if in_process {
                let observer = Arc::new(ExtractionObserver::new(
                    Arc::clone(&store),
                    time::millis_to_duration(toml_config.harvest.settle_delay_ms),
                ));
                Arc::new(InProcessLauncher::new(observer, Arc::new(HttpPageLoader::new()?)))
            } else {
                Arc::new(ProcessLauncher::current_exe(child_args(&root_folder, config_path.as_deref()))?)
            };
            harvest(store, launcher, &toml_config, &subject_ids).await
        }
        Command::Export { dir } => {
            let engine = build_engine(store, &toml_config)?;
            let data = engine.export_all().await;
            let dir = dir.unwrap_or_else(|| config::exports_dir(&root_folder));
            match write_export(&data, &dir, time::now())? {
                ExportOutcome::Written { path, entries } => {
                    println!("Exported {entries} MCN entries to {}", path.display())
                }
                ExportOutcome::Empty => println!("No MCN data found to export"),
            }
            Ok(())
        }
        Command::Status => status(store).await,
    }
}

fn build_engine(store: Arc<dyn PersistentStore>, toml_config: &TomlConfig) -> Result<ReconciliationEngine> {
    let fetcher = RemoteDatasetFetcher::new(toml_config.dataset.resolved_url())?;
    Ok(ReconciliationEngine::new(
        store,
        Arc::new(fetcher),
        toml_config.dataset.cache_ttl(),
    ))
}

/// Arguments a child harvest context needs to share this process's store
fn child_args(root_folder: &Path, config_path: Option<&Path>) -> Vec<OsString> {
    let mut args = vec![OsString::from("--root"), root_folder.as_os_str().to_owned()];
    if let Some(path) = config_path.filter(|p| p.exists()) {
        args.push(OsString::from("--config"));
        args.push(path.as_os_str().to_owned());
    }
    args
}

async fn observe(store: Arc<dyn PersistentStore>, toml_config: &TomlConfig, url: &str) -> Result<()> {
    let target = Url::parse(url).with_context(|| format!("Invalid profile URL: {url}"))?;
    let observer = ExtractionObserver::new(
        store,
        time::millis_to_duration(toml_config.harvest.settle_delay_ms),
    );
    let loader = HttpPageLoader::new()?;

    let observation = observer.run(&loader, &target).await?;
    match observation.record {
        Some(record) => println!("{}: {}", record.subject_id, record.affiliation),
        None => println!("{}: no MCN info on profile", observation.subject_id),
    }
    Ok(())
}

async fn harvest(
    store: Arc<dyn PersistentStore>,
    launcher: Arc<dyn ContextLauncher>,
    toml_config: &TomlConfig,
    subject_ids: &[String],
) -> Result<()> {
    let engine = Arc::new(build_engine(Arc::clone(&store), toml_config)?);
    engine.load_cache().await;

    let coordinator = Arc::new(HarvestCoordinator::new(
        store,
        launcher,
        Arc::new(LoggingEvents),
        HarvestTiming::from(&toml_config.harvest),
        toml_config.harvest.profile_base_url.clone(),
    ));
    let state = AppState::new(engine, coordinator);

    let starts: Vec<_> = subject_ids
        .iter()
        .map(|subject_id| (subject_id, state.harvest(subject_id)))
        .collect();

    for (subject_id, start) in starts {
        if let Some(outcome) = start.outcome().await {
            info!(subject_id = %subject_id, ?outcome, "Harvest finished");
        }
    }

    // Re-render: pick up whatever the harvest contexts wrote
    state.engine.load_cache().await;
    for subject_id in subject_ids {
        print_affiliation(subject_id, state.lookup(subject_id).await);
    }
    Ok(())
}

async fn status(store: Arc<dyn PersistentStore>) -> Result<()> {
    let local = local_records(store.as_ref()).await;
    match read_envelope(store.as_ref()).await {
        Some(envelope) => {
            let valid = envelope.is_valid_at(time::now());
            println!(
                "Cache: {} entries, expires {} ({})",
                envelope.data.len(),
                envelope.expires_at.to_rfc3339(),
                if valid { "valid" } else { "expired" }
            );
        }
        None => println!("Cache: none"),
    }
    println!("Local records: {}", local.len());
    Ok(())
}

fn print_affiliation(subject_id: &str, affiliation: Option<String>) {
    match affiliation {
        Some(mcn) => println!("{subject_id}: {mcn}"),
        None => println!("{subject_id}: (unknown)"),
    }
}
