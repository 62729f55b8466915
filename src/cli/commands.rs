//! CLI command definitions for research-orchestrator.
//!
//! Every command loads the same [`EngineConfig`] (YAML file from `--config`,
//! then environment overrides) so what `route` shows is what `run` executes.

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineResponse};
use crate::metrics::{export_metrics, init_metrics};
use crate::orchestrator::{AggregatedResult, OverallStatus};
use crate::plan::ExecutionPlan;
use crate::router::RouteAction;
use crate::storage::MultiSink;
use clap::Parser;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Research request orchestrator.
#[derive(Parser)]
#[command(name = "research-orchestrator")]
#[command(about = "Route research requests to capability plans and execute them")]
#[command(version)]
#[command(
    long_about = "research-orchestrator classifies a natural-language research request, builds a plan of capability calls and runs it with per-capability circuit breakers, caching and grounding checks.\n\nExample usage:\n  research-orchestrator run \"find 3 articles on topic X then summarize them\" --config engine.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Engine configuration file (YAML).
    #[arg(short, long, global = true, env = "ORCH_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Route a request and execute the resulting plan.
    Run(RunArgs),

    /// Show how a request would be routed without executing it.
    Route(RouteArgs),

    /// Check a plan file (YAML or JSON) against the configured capabilities.
    #[command(name = "validate-plan")]
    ValidatePlan(ValidatePlanArgs),

    /// List configured capabilities and their operations.
    #[command(alias = "caps")]
    Capabilities(CapabilitiesArgs),
}

/// Arguments for `research-orchestrator run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// The research request.
    pub request: String,

    /// Output JSON to stdout instead of a readable summary.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print Prometheus metrics to stderr after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `research-orchestrator route`.
#[derive(Parser, Debug)]
pub struct RouteArgs {
    /// The research request.
    pub request: String,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `research-orchestrator validate-plan`.
#[derive(Parser, Debug)]
pub struct ValidatePlanArgs {
    /// Plan file; `.yaml`/`.yml` is read as YAML, anything else as JSON.
    pub file: PathBuf,
}

/// Arguments for `research-orchestrator capabilities`.
#[derive(Parser, Debug)]
pub struct CapabilitiesArgs {
    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    match cli.command {
        Commands::Run(args) => run_request_command(&config, args).await,
        Commands::Route(args) => run_route_command(&config, args).await,
        Commands::ValidatePlan(args) => run_validate_plan_command(&config, args),
        Commands::Capabilities(args) => run_capabilities_command(&config, args),
    }
}

async fn build_engine(config: &EngineConfig) -> anyhow::Result<Engine> {
    let registry = Engine::build_registry(config);
    if registry.is_empty() {
        warn!("No capabilities configured; every request will fail");
    }
    let sink = Engine::build_sink(config).await?;
    Ok(Engine::from_config(config, registry, sink)?)
}

// ============================================================================
// run
// ============================================================================

async fn run_request_command(config: &EngineConfig, args: RunArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?;
    }
    let engine = build_engine(config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling in-flight tasks");
            on_signal.cancel();
        }
    });

    let response = engine.handle_with_cancel(&args.request, cancel).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }

    if args.metrics {
        eprintln!("{}", export_metrics());
    }

    match response.result().map(|r| r.status) {
        Some(OverallStatus::Failed) => Err(anyhow::anyhow!("Every task failed")),
        Some(OverallStatus::Cancelled) => Err(anyhow::anyhow!("Run cancelled")),
        _ => Ok(()),
    }
}

fn print_response(response: &EngineResponse) {
    match response {
        EngineResponse::Clarification {
            intent,
            confidence,
            message,
        } => {
            println!("? {}", message);
            println!("  (intent: {}, confidence: {:.2})", intent, confidence);
        }
        EngineResponse::Completed {
            intent,
            confidence,
            planning_fallback,
            result,
        } => {
            println!("Intent: {} (confidence {:.2})", intent, confidence);
            if let Some(reason) = planning_fallback {
                println!("Plan fell back to the default capability: {}", reason);
            }
            print_result(result);
        }
    }
}

fn print_result(result: &AggregatedResult) {
    println!("Plan {}: {:?}", result.plan_id, result.status);
    println!();

    for task in &result.tasks {
        let icon = match (&task.error, task.is_unavailable()) {
            (Some(_), _) => "✗",
            (None, true) => "~",
            (None, false) => "✓",
        };
        println!(
            "  {} {} [{}/{}] {}ms",
            icon,
            task.task_id,
            task.capability,
            task.operation,
            (task.completed_at - task.started_at).num_milliseconds()
        );
        if let Some(err) = &task.error {
            println!("      {}", err);
        }
        if let Some(fallback) = task.result.as_ref().and_then(|r| r.fallback()) {
            println!("      {}", fallback.message);
        }
    }

    for violation in &result.grounding_violations {
        println!();
        println!("⚠ {}", violation);
        let ids: Vec<&str> = violation
            .check
            .unverified_ids
            .iter()
            .map(String::as_str)
            .collect();
        println!("  unverified: {}", ids.join(", "));
    }

    if let Some(text) = result.output_text() {
        println!();
        println!("{}", text);
    } else if let Some(output) = &result.output {
        println!();
        println!(
            "{}",
            serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string())
        );
    }
}

// ============================================================================
// route
// ============================================================================

#[derive(Debug, Serialize)]
struct RouteOutput {
    intent: String,
    confidence: f64,
    action: RouteAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    planning_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<crate::plan::PlanSpec>,
}

async fn run_route_command(config: &EngineConfig, args: RouteArgs) -> anyhow::Result<()> {
    let registry = Engine::build_registry(config);
    let engine = Engine::from_config(config, registry, Arc::new(MultiSink::new()))?;
    let decision = engine.router().route(&args.request).await;

    let output = RouteOutput {
        intent: decision.intent.to_string(),
        confidence: decision.confidence,
        action: decision.action.clone(),
        planning_error: decision.planning_error.as_ref().map(ToString::to_string),
        plan: decision.plan.as_ref().map(ExecutionPlan::to_spec),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Intent:     {}", output.intent);
    println!("Confidence: {:.2}", output.confidence);
    match &output.action {
        RouteAction::Execute => println!("Action:     execute"),
        RouteAction::Clarify { message } => println!("Action:     clarify ({})", message),
    }
    if let Some(err) = &output.planning_error {
        println!("Fallback:   {}", err);
    }
    if let Some(plan) = &decision.plan {
        println!();
        for (depth, layer) in plan.layers().iter().enumerate() {
            for task_id in layer {
                if let Some(task) = plan.task(task_id) {
                    println!(
                        "  [{}] {} -> {}/{}",
                        depth,
                        task.id(),
                        task.capability(),
                        task.operation()
                    );
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// validate-plan
// ============================================================================

/// Parse a plan file, choosing YAML or JSON by extension.
pub fn load_plan_file(path: &Path) -> anyhow::Result<ExecutionPlan> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let plan = if is_yaml {
        ExecutionPlan::from_yaml(&raw)?
    } else {
        ExecutionPlan::from_json(&raw)?
    };
    Ok(plan)
}

fn run_validate_plan_command(config: &EngineConfig, args: ValidatePlanArgs) -> anyhow::Result<()> {
    let plan = load_plan_file(&args.file)?;
    let registry = Engine::build_registry(config);

    if registry.is_empty() {
        warn!("No capabilities configured; only the plan structure was checked");
    } else {
        plan.validate_against(&registry)?;
    }

    info!(path = %args.file.display(), tasks = plan.len(), "Plan is valid");
    println!("✓ {} tasks, {} layers", plan.len(), plan.layers().len());
    for (depth, layer) in plan.layers().iter().enumerate() {
        println!("  layer {}: {}", depth, layer.join(", "));
    }
    Ok(())
}

// ============================================================================
// capabilities
// ============================================================================

fn run_capabilities_command(config: &EngineConfig, args: CapabilitiesArgs) -> anyhow::Result<()> {
    let registry = Engine::build_registry(config);
    let descriptors = registry.descriptors();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    if descriptors.is_empty() {
        println!("No capabilities configured.");
        return Ok(());
    }
    for descriptor in descriptors {
        println!(
            "{} ({}){}",
            descriptor.name,
            descriptor.kind,
            if descriptor.cacheable { ", cached" } else { "" }
        );
        println!("    operations: {}", descriptor.operations.join(", "));
        if !descriptor.description.is_empty() {
            println!("    {}", descriptor.description);
        }
    }
    Ok(())
}
