use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use osintflow::config::Config;
use osintflow::shutdown::ShutdownCoordinator;
use osintflow::storage::{
    ApiTarget, Case, DataPoint, ExecutionStatus, SqliteStorage, TargetEndpoint, WorkflowStep,
};
use osintflow::workflow::{Context, EventTriggerConfig, Schedule, TriggerType};
use osintflow::WorkflowEngine;

#[derive(Parser)]
#[command(name = "osintflow")]
#[command(about = "Scheduled and event-driven OSINT workflow engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until SIGINT/SIGTERM
    Server,
    /// Manage workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Manage investigation cases
    Cases {
        #[command(subcommand)]
        action: CaseActions,
    },
    /// Manage query targets
    Targets {
        #[command(subcommand)]
        action: TargetActions,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// List all workflows
    List,
    /// Show a workflow definition
    Show {
        /// Workflow ID
        id: String,
    },
    /// Create a workflow from a JSON or YAML file
    Create {
        /// Path to the workflow file
        file: String,
    },
    /// Run a workflow now and wait for it to finish
    Run {
        /// Workflow ID
        id: String,
        /// Initial context as a JSON object
        #[arg(short, long)]
        context: Option<String>,
    },
    /// Make a workflow eligible for triggers
    Enable {
        /// Workflow ID
        id: String,
    },
    /// Stop triggers from selecting a workflow
    Disable {
        /// Workflow ID
        id: String,
    },
    /// Delete a workflow and its history
    Delete {
        /// Workflow ID
        id: String,
    },
    /// Show recent executions of a workflow
    Executions {
        /// Workflow ID
        id: String,
        /// Number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show the step trace of an execution
    Trace {
        /// Execution ID
        execution_id: String,
    },
}

#[derive(Subcommand)]
enum CaseActions {
    /// Create a case
    Create {
        #[arg(short, long, default_value = "Untitled case")]
        name: String,
    },
    /// Attach a data point to a case
    AddData {
        case_id: String,
        /// Kind of data: name, email, phone, image, ...
        kind: String,
        value: String,
    },
    /// Show a case with its data points and query results
    Show { id: String },
}

#[derive(Subcommand)]
enum TargetActions {
    /// Import query targets from a JSON file
    Import { file: String },
    /// List query targets
    List,
}

/// Workflow file accepted by `workflows create`.
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    name: String,
    #[serde(default)]
    description: String,
    steps: Vec<Value>,
    #[serde(default)]
    schedule: Option<Schedule>,
    #[serde(default)]
    trigger_type: Option<TriggerType>,
    #[serde(default)]
    trigger_config: Option<EventTriggerConfig>,
}

/// One entry of a target import file.
#[derive(Debug, Deserialize)]
struct TargetFile {
    name: String,
    base_url: String,
    #[serde(default)]
    api_key_env: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    endpoints: BTreeMap<String, TargetEndpoint>,
    /// Directory categories the target is listed under
    #[serde(default)]
    directory: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "osintflow=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Commands::Server => cmd_server(&config).await?,
        Commands::Workflows { action } => {
            let engine = WorkflowEngine::from_config(&config, open_storage(&config)?)?;
            match action {
                WorkflowActions::List => cmd_workflows_list(&engine).await?,
                WorkflowActions::Show { id } => cmd_workflows_show(&engine, &id).await?,
                WorkflowActions::Create { file } => cmd_workflows_create(&engine, &file).await?,
                WorkflowActions::Run { id, context } => {
                    cmd_workflows_run(&engine, &id, context.as_deref()).await?
                }
                WorkflowActions::Enable { id } => cmd_workflows_set_active(&engine, &id, true).await?,
                WorkflowActions::Disable { id } => {
                    cmd_workflows_set_active(&engine, &id, false).await?
                }
                WorkflowActions::Delete { id } => cmd_workflows_delete(&engine, &id).await?,
                WorkflowActions::Executions { id, limit } => {
                    cmd_workflows_executions(&engine, &id, limit).await?
                }
                WorkflowActions::Trace { execution_id } => {
                    cmd_workflows_trace(&engine, &execution_id).await?
                }
            }
        }
        Commands::Cases { action } => {
            let storage = open_storage(&config)?;
            match action {
                CaseActions::Create { name } => cmd_cases_create(&storage, &name).await?,
                CaseActions::AddData {
                    case_id,
                    kind,
                    value,
                } => cmd_cases_add_data(&storage, &case_id, &kind, &value).await?,
                CaseActions::Show { id } => cmd_cases_show(&storage, &id).await?,
            }
        }
        Commands::Targets { action } => {
            let storage = open_storage(&config)?;
            match action {
                TargetActions::Import { file } => cmd_targets_import(&storage, &file).await?,
                TargetActions::List => cmd_targets_list(&storage).await?,
            }
        }
    }

    Ok(())
}

async fn cmd_server(config: &Config) -> anyhow::Result<()> {
    osintflow::metrics::init_metrics(config.metrics.listen.as_deref())?;

    let engine = WorkflowEngine::from_config(config, open_storage(config)?)?;
    let workflows = engine.list_workflows().await?;
    let active = workflows.iter().filter(|w| w.is_active).count();

    engine.start().await;

    println!("osintflow engine running");
    println!("  Database:   {}", config.database_path().display());
    println!("  Workflows:  {} active of {}", active, workflows.len());
    println!(
        "  Polling:    every {}s",
        config.engine.poll_interval().as_secs()
    );
    if let Some(listen) = &config.metrics.listen {
        println!("  Metrics:    http://{}/metrics", listen);
    }
    println!();
    println!("Press Ctrl+C to stop");

    let signals = ShutdownCoordinator::new();
    signals.start_signal_listener();
    signals.wait_for_shutdown().await;

    engine.stop().await;
    Ok(())
}

async fn cmd_workflows_list(engine: &WorkflowEngine) -> anyhow::Result<()> {
    let workflows = engine.list_workflows().await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        println!();
        println!("Create one with: osintflow workflows create <file.yaml>");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<10} {:<8} {:<20}",
        "ID", "NAME", "TRIGGER", "ACTIVE", "UPDATED"
    );
    println!("{}", "-".repeat(102));

    for wf in workflows {
        println!(
            "{:<38} {:<24} {:<10} {:<8} {:<20}",
            wf.id,
            truncate(&wf.name, 23),
            wf.trigger_type.to_string(),
            if wf.is_active { "yes" } else { "no" },
            wf.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn cmd_workflows_show(engine: &WorkflowEngine, id: &str) -> anyhow::Result<()> {
    let Some(workflow) = engine.get_workflow(id).await? else {
        anyhow::bail!("Workflow not found: {}", id);
    };
    println!("{}", serde_json::to_string_pretty(&workflow)?);
    Ok(())
}

async fn cmd_workflows_create(engine: &WorkflowEngine, file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let content = std::fs::read_to_string(path)?;
    let parsed: WorkflowFile = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };

    let workflow = engine
        .create_workflow(
            &parsed.name,
            &parsed.description,
            parsed.steps,
            parsed.schedule,
            parsed.trigger_type,
            parsed.trigger_config,
        )
        .await?;

    println!("✓ Workflow '{}' created", workflow.name);
    println!("  ID:      {}", workflow.id);
    println!("  Steps:   {}", workflow.steps.len());
    println!("  Trigger: {}", workflow.trigger_type);
    Ok(())
}

async fn cmd_workflows_run(
    engine: &WorkflowEngine,
    id: &str,
    context: Option<&str>,
) -> anyhow::Result<()> {
    let context = match context {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => anyhow::bail!("--context must be a JSON object"),
        },
        None => Context::new(),
    };

    let execution = engine.run_now(id, context).await?;
    let steps = engine.get_steps(&execution.id).await?;

    println!("Execution {} {}", execution.id, execution.status);
    print_steps(&steps);
    if let Some(error) = &execution.error {
        println!();
        println!("Error: {}", error);
    }
    println!();
    println!("Context:");
    println!("{}", serde_json::to_string_pretty(&execution.context)?);
    Ok(())
}

async fn cmd_workflows_set_active(
    engine: &WorkflowEngine,
    id: &str,
    active: bool,
) -> anyhow::Result<()> {
    let workflow = engine.set_active(id, active).await?;
    println!(
        "✓ Workflow '{}' {}",
        workflow.name,
        if active { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn cmd_workflows_delete(engine: &WorkflowEngine, id: &str) -> anyhow::Result<()> {
    if engine.delete_workflow(id).await? {
        println!("✓ Workflow {} deleted", id);
    } else {
        anyhow::bail!("Workflow not found: {}", id);
    }
    Ok(())
}

async fn cmd_workflows_executions(
    engine: &WorkflowEngine,
    id: &str,
    limit: usize,
) -> anyhow::Result<()> {
    let executions = engine.list_executions(id, limit).await?;
    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<9} {:<20} {:<10}",
        "EXECUTION", "STATUS", "TRIGGER", "STARTED", "DURATION"
    );
    println!("{}", "-".repeat(90));
    for execution in executions {
        let duration = execution
            .finished_at
            .map(|f| format!("{}ms", (f - execution.started_at).num_milliseconds()))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<38} {:<10} {:<9} {:<20} {:<10}",
            execution.id,
            execution.status.to_string(),
            execution.trigger_source.to_string(),
            execution.started_at.format("%Y-%m-%d %H:%M:%S"),
            duration
        );
    }
    Ok(())
}

async fn cmd_workflows_trace(engine: &WorkflowEngine, execution_id: &str) -> anyhow::Result<()> {
    let Some(trace) = engine.get_trace(execution_id).await? else {
        anyhow::bail!("Execution not found: {}", execution_id);
    };

    let execution = &trace.execution;
    println!("Execution: {}", execution.id);
    println!("Workflow:  {}", execution.workflow_id);
    println!("Status:    {}", execution.status);
    println!("Trigger:   {}", execution.trigger_source);
    println!();
    print_steps(&trace.steps);
    if let Some(error) = &execution.error {
        println!();
        println!("Error: {}", error);
    }
    Ok(())
}

fn print_steps(steps: &[WorkflowStep]) {
    for step in steps {
        let icon = match step.status {
            ExecutionStatus::Completed => "✓",
            ExecutionStatus::Failed => "✗",
            _ => "…",
        };
        println!(
            "  {} [{}] {:<14} {}",
            icon,
            step.step_number,
            step.step_type,
            step.error.as_deref().unwrap_or("")
        );
    }
}

async fn cmd_cases_create(storage: &SqliteStorage, name: &str) -> anyhow::Result<()> {
    let now = Utc::now();
    let case = Case {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        created_at: now,
        updated_at: now,
    };
    storage.create_case(&case).await?;
    println!("✓ Case '{}' created", case.name);
    println!("  ID: {}", case.id);
    Ok(())
}

async fn cmd_cases_add_data(
    storage: &SqliteStorage,
    case_id: &str,
    kind: &str,
    value: &str,
) -> anyhow::Result<()> {
    if storage.get_case(case_id).await?.is_none() {
        anyhow::bail!("Case not found: {}", case_id);
    }
    let point = DataPoint {
        id: uuid::Uuid::new_v4().to_string(),
        case_id: case_id.to_string(),
        data_type: kind.to_string(),
        value: value.to_string(),
        created_at: Utc::now(),
    };
    storage.create_data_point(&point).await?;
    println!("✓ Added {} to case {}", kind, case_id);
    println!("  ID: {}", point.id);
    Ok(())
}

async fn cmd_cases_show(storage: &SqliteStorage, id: &str) -> anyhow::Result<()> {
    let Some(case) = storage.get_case(id).await? else {
        anyhow::bail!("Case not found: {}", id);
    };

    println!("Case: {} ({})", case.name, case.id);
    println!("Created: {}", case.created_at.format("%Y-%m-%d %H:%M"));
    println!();

    let points = storage.list_data_points(id).await?;
    println!("Data points ({}):", points.len());
    for point in &points {
        println!("  {:<18} {}", point.data_type, truncate(&point.value, 60));
    }

    let results = storage.list_api_results(id).await?;
    if !results.is_empty() {
        println!();
        println!("Query results ({}):", results.len());
        for result in &results {
            println!(
                "  {:<24} {:<8} {}",
                result.api_name,
                result.status.to_string(),
                result.created_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}

async fn cmd_targets_import(storage: &SqliteStorage, file: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)?;
    let entries: Vec<TargetFile> = serde_json::from_str(&content)?;

    let mut imported = 0;
    for entry in entries {
        let now = Utc::now();
        let target = ApiTarget {
            id: uuid::Uuid::new_v4().to_string(),
            name: entry.name,
            base_url: entry.base_url,
            api_key_env: entry.api_key_env,
            description: entry.description,
            category: entry.category,
            endpoints: entry.endpoints,
            created_at: now,
            updated_at: now,
        };
        let id = storage.save_target(&target).await?;
        for category in &entry.directory {
            storage.add_to_directory(category, &id).await?;
        }
        imported += 1;
    }

    println!("✓ Imported {} target(s)", imported);
    Ok(())
}

async fn cmd_targets_list(storage: &SqliteStorage) -> anyhow::Result<()> {
    let targets = storage.list_targets().await?;
    if targets.is_empty() {
        println!("No query targets found.");
        println!();
        println!("Import some with: osintflow targets import <file.json>");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<16} {:<10}",
        "ID", "NAME", "CATEGORY", "ENDPOINTS"
    );
    println!("{}", "-".repeat(90));
    for target in targets {
        println!(
            "{:<38} {:<24} {:<16} {:<10}",
            target.id,
            truncate(&target.name, 23),
            target.category.as_deref().unwrap_or("-"),
            target.endpoints.len()
        );
    }
    Ok(())
}

fn open_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStorage::open(&db_path)?)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
