//! CLI interface for qfusion

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{data_dir, FusionConfig};
use crate::data::{DataCollector, DataSource, SourceData, StaticSource};
use crate::learning::ContinuousLearner;
use crate::model::{FusionModel, Matrix};
use crate::store::PersistentStore;

#[derive(Parser)]
#[command(name = "qfusion")]
#[command(about = "Hybrid quantum-classical prediction system with continuous learning", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "QFUSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the continuous learning loop
    Run {
        /// Text file read as a data source on every cycle (repeatable)
        #[arg(short, long)]
        feed: Vec<PathBuf>,
        /// Feed a built-in sample payload instead of external sources
        #[arg(long)]
        demo: bool,
    },
    /// Predict on one input sample
    Predict {
        /// Comma-separated feature values, e.g. "0.3,0.7"
        values: String,
        /// Ignore stored checkpoints and use a freshly initialized model
        #[arg(long)]
        fresh: bool,
    },
    /// Inspect and maintain the persistent store
    Store {
        #[command(subcommand)]
        command: StoreCommands,
    },
    /// Show or initialize the configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// Show entry and checkpoint counts
    Stats,
    /// List recent entries, newest first
    List {
        /// Maximum entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Only entries of this type
        #[arg(short, long)]
        entry_type: Option<String>,
    },
    /// List stored checkpoints
    Checkpoints,
    /// Delete entries, optionally only those older than N days
    Clear {
        /// Only delete entries older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

/// Text file re-read on every collection cycle
struct FileSource {
    path: PathBuf,
}

#[async_trait::async_trait]
impl DataSource for FileSource {
    fn name(&self) -> &str {
        self.path.to_str().unwrap_or("file")
    }

    async fn fetch(&self) -> crate::error::Result<SourceData> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("source".to_string(), self.name().to_string());
        Ok(SourceData { text, metadata })
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir().join("config.toml"));
    let config = load_config(&config_path)?;

    match cli.command {
        None => {
            println!("{}", crate::info());
            println!("Run 'qfusion --help' for available commands.");
        }
        Some(Commands::Run { feed, demo }) => {
            run_loop(config, feed, demo).await?;
        }
        Some(Commands::Predict { values, fresh }) => {
            predict_once(config, &values, fresh).await?;
        }
        Some(Commands::Store { command }) => {
            let store = PersistentStore::new(&config.database_path).await?;
            match command {
                StoreCommands::Stats => {
                    let stats = store.stats().await?;
                    println!("Entries:     {}", stats.total_entries);
                    println!("Checkpoints: {}", stats.total_checkpoints);
                }
                StoreCommands::List { limit, entry_type } => {
                    let entries = store.retrieve(entry_type.as_deref(), limit).await?;
                    if entries.is_empty() {
                        println!("No entries found.");
                    }
                    for entry in entries {
                        println!(
                            "[{}] {} {} {}",
                            entry.id, entry.timestamp, entry.entry_type, entry.content
                        );
                    }
                }
                StoreCommands::Checkpoints => {
                    let checkpoints = store.list_checkpoints().await?;
                    if checkpoints.is_empty() {
                        println!("No checkpoints stored.");
                    }
                    for ckpt in checkpoints {
                        println!("{}  {}", ckpt.key, ckpt.created_at);
                    }
                }
                StoreCommands::Clear { older_than_days } => {
                    let deleted = store.clear(older_than_days).await?;
                    println!("Deleted {deleted} entries.");
                }
            }
        }
        Some(Commands::Config { init }) => {
            if init {
                config.save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &std::path::Path) -> Result<FusionConfig> {
    let config = if path.exists() {
        FusionConfig::load(path)?
    } else {
        FusionConfig::default()
    };
    config.validate()?;
    Ok(config)
}

async fn run_loop(config: FusionConfig, feed: Vec<PathBuf>, demo: bool) -> Result<()> {
    let mut sources: Vec<Box<dyn DataSource>> = feed
        .into_iter()
        .map(|path| Box::new(FileSource { path }) as Box<dyn DataSource>)
        .collect();
    if demo {
        sources.push(Box::new(StaticSource::new(
            "demo",
            "Quantum systems evolve under unitary dynamics.\n\
             Classical networks learn by gradient descent.",
        )));
    }
    if sources.is_empty() {
        println!("No data sources configured; the loop will idle. Use --feed or --demo.");
    }

    let store = Arc::new(PersistentStore::new(&config.database_path).await?);
    let model = resume_or_create(&store, &config).await?;
    let collector = Arc::new(DataCollector::new(sources));

    let learner = Arc::new(ContinuousLearner::new(
        Arc::new(RwLock::new(model)),
        store,
        collector,
        &config,
    ));
    let handle = learner.clone().spawn();

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    learner.stop();
    handle.await??;
    Ok(())
}

async fn predict_once(config: FusionConfig, values: &str, fresh: bool) -> Result<()> {
    let input: Vec<f32> = values
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()?;

    let model = if fresh {
        FusionModel::new(config.hyperparams())?
    } else {
        let store = PersistentStore::new(&config.database_path).await?;
        resume_or_create(&store, &config).await?
    };

    let output = model.predict(&Matrix::row(&input))?;
    let probs: Vec<String> = output
        .row_slice(0)
        .iter()
        .map(|p| format!("{p:.4}"))
        .collect();
    println!("[{}]", probs.join(", "));
    Ok(())
}

/// Restore the latest checkpoint when one exists, otherwise build a fresh
/// model from the configured hyperparameters
async fn resume_or_create(store: &PersistentStore, config: &FusionConfig) -> Result<FusionModel> {
    match store.load_latest_checkpoint().await? {
        Some((key, state, optimizer)) => {
            info!("Resuming from checkpoint {key}");
            Ok(FusionModel::load_state_with_optimizer(state, optimizer)?)
        }
        None => {
            info!("No checkpoint found, starting fresh");
            Ok(FusionModel::new(config.hyperparams())?)
        }
    }
}
