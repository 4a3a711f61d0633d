//! `sluice` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`: run pending database migrations.
//! - `validate`: validate a workflow file.
//! - `register`: store a workflow and a new DAG version.
//! - `run`: execute a registered DAG version.
//! - `sync`: import finished Airflow runs.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use db::{
    pool::{create_pool, run_migrations},
    repository::{dags, workflows},
    DbError, DbPool,
};
use engine::{
    reconcile::AirflowConnector, validate_dag, ExecutionEnv, PreviewCacheManager, Reconciler,
    StoragePreviewCache, Workflow, WorkflowDag, WorkflowExecutor,
};
use jobs::process::ProcessJobManager;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "sluice", about = "Workflow orchestration core", version)]
struct Cli {
    /// Path to `sluice.toml`.
    #[arg(long, global = true, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `[database] url`.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate,
    /// Validate a workflow file without storing it.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Store the workflow (if new) and a new DAG version of it.
    Register {
        path: PathBuf,
    },
    /// Execute a DAG version. Ctrl-C cancels the run.
    Run {
        /// DAG version to run; defaults to the workflow's latest.
        #[arg(long, conflicts_with = "workflow_id", required_unless_present = "workflow_id")]
        dag_id: Option<Uuid>,
        #[arg(long)]
        workflow_id: Option<Uuid>,
        /// Run without writing results, reusing cached outputs.
        #[arg(long)]
        preview: bool,
    },
    /// Import finished runs of Airflow-bound DAGs.
    Sync {
        /// Only these DAGs; all Airflow-bound DAGs when omitted.
        #[arg(long = "dag-id")]
        dag_ids: Vec<Uuid>,
    },
}

/// A workflow and one DAG version, as written by authoring tools.
#[derive(Deserialize)]
struct WorkflowFile {
    workflow: Workflow,
    dag: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }

    match cli.command {
        Command::Migrate => {
            let pool = connect(&config).await?;
            run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
        }
        Command::Validate { path } => {
            let (workflow, dag) = load_workflow_file(&path, &config)?;
            match validate_dag(&dag) {
                Ok(plan) => {
                    let names: Vec<&str> = plan
                        .order
                        .iter()
                        .filter_map(|id| dag.operator(*id))
                        .map(|op| op.name.as_str())
                        .collect();
                    println!("Workflow '{}' is valid. Execution order: {names:?}", workflow.name);
                }
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Register { path } => {
            let (workflow, dag) = load_workflow_file(&path, &config)?;
            validate_dag(&dag).context("refusing to register an invalid DAG")?;
            let pool = connect(&config).await?;
            register(&pool, &workflow, &dag).await?;
            println!("Registered DAG {} of workflow {}", dag.id, workflow.id);
        }
        Command::Run { dag_id, workflow_id, preview } => {
            let pool = connect(&config).await?;
            let dag_id = match (dag_id, workflow_id) {
                (Some(id), _) => id,
                (None, Some(workflow_id)) => dags::get_latest_dag_id(&pool, workflow_id)
                    .await
                    .with_context(|| format!("no DAG registered for workflow {workflow_id}"))?,
                (None, None) => bail!("either --dag-id or --workflow-id is required"),
            };
            run(&pool, &config, dag_id, preview).await?;
        }
        Command::Sync { dag_ids } => {
            let pool = connect(&config).await?;
            let reconciler =
                Reconciler::new(pool, Arc::new(AirflowConnector::new(config.airflow.clone())));
            let report = if dag_ids.is_empty() {
                reconciler.sync_all().await?
            } else {
                reconciler.sync_dags(&dag_ids).await
            };
            println!(
                "Imported {} run(s); {} DAG(s) failed to sync",
                report.imported_runs,
                report.failed_dags.len()
            );
            if !report.failed_dags.is_empty() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<DbPool> {
    create_pool(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to connect to {}", config.database.url))
}

/// Read a workflow file. The DAG is bound to the file's workflow, and one
/// without `storage_config` gets the configured default storage.
fn load_workflow_file(path: &Path, config: &Config) -> anyhow::Result<(Workflow, WorkflowDag)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let WorkflowFile { workflow, mut dag } =
        serde_json::from_str(&content).context("invalid workflow file")?;

    if let Some(fields) = dag.as_object_mut() {
        fields.insert("workflow_id".into(), serde_json::to_value(workflow.id)?);
        if let Some(storage) = &config.storage {
            if !fields.contains_key("storage_config") {
                fields.insert("storage_config".into(), serde_json::to_value(storage)?);
            }
        }
    }
    let dag: WorkflowDag = serde_json::from_value(dag).context("invalid DAG")?;
    Ok((workflow, dag))
}

async fn register(pool: &DbPool, workflow: &Workflow, dag: &WorkflowDag) -> anyhow::Result<()> {
    match workflows::get_workflow(pool, workflow.id).await {
        Ok(_) => info!(workflow_id = %workflow.id, "workflow exists, adding a DAG version"),
        Err(DbError::NotFound) => {
            workflows::create_workflow(
                pool,
                workflow.id,
                &workflow.name,
                &workflow.description,
                serde_json::to_value(&workflow.schedule)?,
                serde_json::to_value(workflow.retention_policy)?,
            )
            .await?;
        }
        Err(err) => return Err(err.into()),
    }
    dags::create_dag(pool, &dag.to_rows()?).await?;
    Ok(())
}

async fn run(pool: &DbPool, config: &Config, dag_id: Uuid, preview: bool) -> anyhow::Result<()> {
    let dag = WorkflowDag::from_rows(dags::get_dag(pool, dag_id).await?)?;
    if dag.airflow().is_some() {
        bail!("DAG {dag_id} runs on Airflow; use `sluice sync` to import its runs");
    }
    let workflow = Workflow::from_row(workflows::get_workflow(pool, dag.workflow_id).await?)?;

    let storage = storage::open(&dag.storage_config)?;
    let job_manager = Arc::new(ProcessJobManager::new(
        config.process.program.clone(),
        config.process.args.clone(),
    ));
    let env = if preview {
        let cache: Arc<dyn PreviewCacheManager> = Arc::new(StoragePreviewCache::new(storage.clone()));
        ExecutionEnv::preview(job_manager, storage, dag.storage_config.clone(), Some(cache))
    } else {
        ExecutionEnv::publish(job_manager, storage, dag.storage_config.clone(), pool.clone())
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, canceling the run");
            on_signal.cancel();
        }
    });

    let executor = WorkflowExecutor::new(env, config.executor.to_executor_config());
    let result = executor.run(&workflow, &dag, cancel).await?;

    println!("Run {} finished: {}", result.run_id, result.status);
    for op in &dag.operators {
        if let Some(state) = result.operator_states.get(&op.id) {
            println!("  {:<24} {}", op.name, state.status);
        }
    }
    Ok(())
}
