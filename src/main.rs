/// Mechaway Orchestrator: workflow execution orchestration
///
/// Main entry point. Wires the orchestration engine with the built-in local
/// adapter, then either runs a workflow definition once or keeps running it on
/// a cron schedule until Ctrl-C.
///
/// Usage: `mechaway-orchestrator [workflow.json] [--params <json>] [--cron <expr>] [--tz <timezone>]`

use anyhow::{anyhow, Context, Result};
use mechaway_orchestrator::{
    Config, EngineType, LocalAdapter, OrchestrationEngine, OrchestratorEvent, Priority, ScheduleConfig,
    WorkflowDefinition,
};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Args {
    workflow_path: Option<String>,
    params: Option<String>,
    cron: Option<String>,
    timezone: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--params" => args.params = Some(iter.next().ok_or_else(|| anyhow!("--params needs a value"))?),
            "--cron" => args.cron = Some(iter.next().ok_or_else(|| anyhow!("--cron needs a value"))?),
            "--tz" => args.timezone = Some(iter.next().ok_or_else(|| anyhow!("--tz needs a value"))?),
            flag if flag.starts_with("--") => return Err(anyhow!("unknown flag: {}", flag)),
            path => args.workflow_path = Some(path.to_string()),
        }
    }
    Ok(args)
}

/// Small local workflow used when no definition file is given
fn demo_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("demo", "Demo workflow", EngineType::Local)
        .with_node("start", "start", json!({}))
        .with_node("greet", "set", json!({"values": {"greeting": "hello from mechaway"}}))
        .with_node("note", "log", json!({"message": "demo workflow finished"}))
        .with_edge("start", "greet")
        .with_edge("greet", "note")
}

fn load_workflow(path: Option<&str>) -> Result<WorkflowDefinition> {
    let Some(path) = path else {
        return Ok(demo_workflow());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read workflow file {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse workflow file {}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let args = parse_args()?;
    let workflow = Arc::new(load_workflow(args.workflow_path.as_deref())?);
    let parameters: Value = match &args.params {
        Some(raw) => serde_json::from_str(raw).context("--params is not valid JSON")?,
        None => json!({}),
    };

    // Load configuration (env-var driven defaults)
    let config = Config::default();
    let engine = OrchestrationEngine::new(config);
    engine.register_adapter(EngineType::Local, Arc::new(LocalAdapter::new()));
    engine.start().await?;

    match &args.cron {
        None => {
            let result = engine
                .execute_workflow(workflow, parameters, Priority::Normal, "cli")
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Some(expression) => {
            let mut schedule = ScheduleConfig::new(expression.clone());
            if let Some(tz) = &args.timezone {
                schedule = schedule.with_timezone(tz.clone());
            }
            let scheduled = engine.schedule_workflow(workflow, schedule, parameters, "cli").await;
            if !scheduled.success {
                engine.stop().await?;
                return Err(anyhow!(
                    "Failed to schedule workflow: {}",
                    scheduled.error.unwrap_or_default()
                ));
            }
            tracing::info!(
                "⏰ Schedule {:?} armed, next fire at {:?}; press Ctrl-C to stop",
                scheduled.schedule_id,
                scheduled.next_execution
            );

            let mut events = engine.subscribe();
            loop {
                tokio::select! {
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("Failed to listen for Ctrl-C")?;
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event @ (OrchestratorEvent::ExecutionCompleted { .. } | OrchestratorEvent::ExecutionFailed { .. })) => {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("⚠️ Event stream lagged, skipped {} events", skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }

    tracing::info!("📊 Queue stats: {}", serde_json::to_string(&engine.get_queue_stats().await)?);
    engine.stop().await?;
    Ok(())
}
