use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use tokenflow::compiler::core::Compiler;
use tokenflow::compiler::loader::load_specification_from_yaml;
use tokenflow::config::EngineConfig;
use tokenflow::runtime::case::CaseStatus;
use tokenflow::runtime::engine::Engine;
use tokenflow::runtime::events::TracingListener;
use tokenflow::runtime::redis_storage::RedisCaseStore;
use tokenflow::runtime::runner::CaseId;
use tokenflow::runtime::storage::CaseStore;
use tokenflow::runtime::work_item::{WorkItem, WorkItemStatus};

/// Participant used for items nobody was offered.
const CLI_PARTICIPANT: &str = "cli";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a specification and report its nets
    Check {
        /// Path to the specification YAML file
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Run one case to completion, completing every work item automatically
    Run {
        /// Path to the specification YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Engine configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Initial case data (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
    },

    /// Print a persisted case snapshot from Redis
    Show {
        /// Case id
        #[arg(long)]
        case: Uuid,

        /// Redis connection URL
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // JSON if it parses, a plain string otherwise
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => {
            let def = load_specification_from_yaml(&file)?;
            let spec = Compiler::new().compile(def)?;
            info!(specification = %spec.id, version = %spec.version, "specification is valid");
            let mut nets: Vec<_> = spec.nets.values().collect();
            nets.sort_by(|a, b| a.id.cmp(&b.id));
            for net in nets {
                println!(
                    "net {}: {} conditions, {} tasks{}",
                    net.id,
                    net.conditions.len(),
                    net.tasks.len(),
                    if net.id == spec.root_net { " (root)" } else { "" }
                );
            }
        }

        Commands::Run { file, config, vars } => {
            let config = match config {
                Some(path) => EngineConfig::load(path)?,
                None => EngineConfig::default(),
            };
            let engine = Arc::new(
                Engine::builder()
                    .config(config)
                    .listener(Arc::new(TracingListener))
                    .build()?,
            );
            let timers = tokio::spawn({
                let engine = engine.clone();
                async move { engine.run_timers().await }
            });

            let def = load_specification_from_yaml(&file)?;
            let spec_id = engine.load_definition(def)?;
            engine.activate_specification(&spec_id)?;

            let data: Map<String, Value> = vars.into_iter().collect();
            let case_id = engine.launch_case(&spec_id, data).await?;
            info!(case_id = %case_id, "case launched");

            let outcome = drive(&engine, case_id).await;
            let status = engine.case_status(case_id).await?;
            let data = engine.case_data(case_id).await?;
            engine.shutdown();
            if let Err(e) = timers.await {
                warn!("timer loop ended abnormally: {}", e);
            }

            println!("{}", serde_json::to_string_pretty(&Value::Object(data))?);
            outcome?;
            if status != CaseStatus::Completed {
                return Err(anyhow!("case {} ended in status {:?}", case_id, status));
            }
            info!(case_id = %case_id, "case completed");
        }

        Commands::Show { case, redis } => {
            let store = RedisCaseStore::open(&redis)?;
            match store.load(case).await? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => error!(case_id = %case, "no snapshot stored for this case"),
            }
        }
    }

    Ok(())
}

/// Pushes every actionable work item forward until the case finishes or
/// nothing moves any more.
async fn drive(engine: &Engine, case_id: CaseId) -> Result<()> {
    let mut handled: BTreeSet<(Uuid, WorkItemStatus)> = BTreeSet::new();
    loop {
        if engine.case_status(case_id).await?.is_finished() {
            return Ok(());
        }
        let items = engine.work_items_for_case(case_id).await?;
        let mut progressed = false;
        for item in items.iter().filter(|w| w.is_active()) {
            if !handled.insert((item.id, item.status())) {
                continue;
            }
            match step(engine, item).await {
                Ok(true) => progressed = true,
                Ok(false) => {}
                // the item may have been withdrawn by an earlier step
                Err(e) => warn!(work_item = %item.id, task = %item.task_id, error = %e, "step skipped"),
            }
        }
        if !progressed {
            warn!(case_id = %case_id, "no work item can progress");
            return Ok(());
        }
    }
}

async fn step(engine: &Engine, item: &WorkItem) -> Result<bool> {
    // composite items finish with their sub-case
    if item.child_runner.is_some() {
        return Ok(false);
    }
    let holder = item
        .allocated_to
        .clone()
        .or_else(|| item.offered_to.iter().next().cloned())
        .unwrap_or_else(|| CLI_PARTICIPANT.to_string());

    match item.status() {
        WorkItemStatus::Enabled => {
            engine.fire_work_item(item.id).await?;
        }
        WorkItemStatus::Offered => {
            engine.allocate_work_item(item.id, &holder).await?;
            engine.start_work_item(item.id, &holder).await?;
            engine.complete_work_item(item.id, &holder, Map::new()).await?;
        }
        WorkItemStatus::Fired | WorkItemStatus::Allocated => {
            engine.start_work_item(item.id, &holder).await?;
            engine.complete_work_item(item.id, &holder, Map::new()).await?;
        }
        WorkItemStatus::Started | WorkItemStatus::Suspended => {
            if item.status() == WorkItemStatus::Suspended {
                engine.resume_work_item(item.id, &holder).await?;
            }
            engine.complete_work_item(item.id, &holder, Map::new()).await?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}
