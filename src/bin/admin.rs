//! Kainos Admin CLI
//!
//! Operator tool for schedules and trigger drift. Translates schedule
//! descriptions, lists presets, manages the workflow catalog and reconciles
//! stored subscriptions against the configured trigger engine.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use uuid::Uuid;

use kainos::engine::schedule::preset_names;
use kainos::engine::temporal::encode_spec;
use kainos::engine::TriggerLifecycleManager;
use kainos::models::CatalogWorkflow;
use kainos::server::{build_engine, connect_store, default_catalog, init_tracing, seed_default_catalog};
use kainos::settings::{EngineKind, ENV_PREFIX};
use kainos::{translate, AppConfig};

#[derive(Parser)]
#[command(name = "kainos-admin")]
#[command(about = "Kainos Admin CLI - Schedules, catalog and trigger reconciliation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to kainos.toml)
    #[arg(long, env = "KAINOS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the trigger spec for a schedule description
    Translate {
        /// Preset name or HH:MM
        schedule: String,

        /// Print the calendar the Temporal engine would receive
        #[arg(long)]
        temporal: bool,
    },

    /// List schedule presets
    Presets,

    /// Reconcile subscriptions with the trigger engine
    Reconcile {
        /// Only report drift, change nothing
        #[arg(long)]
        dry_run: bool,

        /// Limit to one subscription
        #[arg(long)]
        subscription: Option<Uuid>,
    },

    /// Workflow catalog management
    Catalog {
        #[command(subcommand)]
        action: CatalogCommands,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// List catalog workflows
    List,

    /// Insert the default catalog if the catalog is empty
    Seed,

    /// Add or replace a catalog workflow
    Upsert {
        id: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Schedule used when a tenant turns the workflow on
        #[arg(long)]
        schedule: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    init_tracing(log_level);
    let _ = dotenv::dotenv();

    match cli.command {
        Commands::Translate { schedule, temporal } => translate_schedule(&schedule, temporal),
        Commands::Presets => list_presets(),
        Commands::Reconcile {
            dry_run,
            subscription,
        } => {
            let config = load_config(cli.config)?;
            reconcile(&config, dry_run, subscription).await
        }
        Commands::Catalog { action } => {
            let config = load_config(cli.config)?;
            handle_catalog(&config, action).await
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(Some(&path), ENV_PREFIX)?,
        None => AppConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn translate_schedule(schedule: &str, temporal: bool) -> Result<()> {
    let spec = translate(schedule)?;
    let rendered = if temporal {
        encode_spec(&spec)
    } else {
        serde_json::to_value(&spec)?
    };
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

fn list_presets() -> Result<()> {
    println!("\n🗓️ Schedule presets ({})", preset_names().len());
    println!("=====================================");
    for name in preset_names() {
        let spec = translate(name)?;
        println!(
            "  {:<20} {}",
            name,
            spec.comment.as_deref().unwrap_or_default()
        );
    }
    println!("\nAny HH:MM (24-hour) time is accepted as a daily schedule.");
    Ok(())
}

async fn reconcile(config: &AppConfig, dry_run: bool, subscription: Option<Uuid>) -> Result<()> {
    if config.engine.kind == EngineKind::Local {
        bail!("the local engine lives inside the server process; set engine.kind = \"temporal\" to reconcile from here");
    }

    let store = connect_store(config).await?;
    let (engine, _) = build_engine(config, store.clone())?;
    let manager = TriggerLifecycleManager::new(engine, store.clone(), config.lifecycle_config());

    let subs = match subscription {
        Some(id) => match store.get_subscription(&id).await? {
            Some(sub) => vec![sub],
            None => bail!("subscription {} not found", id),
        },
        None => store.list_subscriptions().await?,
    };
    info!("🔍 Checking {} subscriptions", subs.len());

    let mut drifted = 0;
    let mut failed = 0;
    for sub in &subs {
        let drift = match manager.detect_drift(sub).await {
            Ok(drift) => drift,
            Err(e) => {
                error!("❌ {}: {}", sub.id, e);
                failed += 1;
                continue;
            }
        };
        let Some(drift) = drift else {
            continue;
        };
        drifted += 1;
        println!("⚠️  {} ({}, {}): {:?}", sub.id, sub.workflow_definition_id, sub.status, drift);

        if !dry_run {
            match manager.reconcile(sub).await {
                Ok(saved) => println!("   ✅ converged to {}", saved.status),
                Err(e) => {
                    warn!("reconcile of {} failed: {}", sub.id, e);
                    println!("   ❌ {}", e);
                    failed += 1;
                }
            }
        }
    }

    println!("\n📊 Reconcile summary");
    println!("====================");
    println!("Checked: {}", subs.len());
    println!("Drifted: {}", drifted);
    println!("Failed:  {}", failed);
    if dry_run {
        println!("(dry run, nothing changed)");
    }
    if failed > 0 {
        bail!("{} subscriptions could not be checked or converged", failed);
    }
    Ok(())
}

async fn handle_catalog(config: &AppConfig, action: CatalogCommands) -> Result<()> {
    let store = connect_store(config).await?;
    match action {
        CatalogCommands::List => {
            let catalog = store.list_catalog().await?;
            println!("\n📋 Catalog workflows ({})", catalog.len());
            println!("=====================================");
            if catalog.is_empty() {
                println!("No workflows found. Run `catalog seed` to add the defaults.");
            }
            for workflow in catalog {
                println!("🔧 ID: {}", workflow.id);
                println!("   Name: {}", workflow.name);
                if let Some(schedule) = &workflow.default_schedule {
                    println!("   Default schedule: {}", schedule);
                }
                println!();
            }
        }
        CatalogCommands::Seed => {
            let added = seed_default_catalog(store.as_ref()).await?;
            if added == 0 {
                println!("Catalog already populated, nothing added.");
            } else {
                println!("✅ Added {} of {} default workflows", added, default_catalog().len());
            }
        }
        CatalogCommands::Upsert {
            id,
            name,
            description,
            schedule,
        } => {
            if let Some(schedule) = &schedule {
                translate(schedule)?;
            }
            let saved = store
                .upsert_catalog_workflow(CatalogWorkflow {
                    id,
                    name,
                    description,
                    default_schedule: schedule,
                })
                .await?;
            println!("✅ Saved catalog workflow {}", saved.id);
        }
    }
    Ok(())
}
