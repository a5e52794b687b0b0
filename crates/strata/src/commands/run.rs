//! Run command - executes a workflow with the built-in tools.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use serde::Serialize;
use serde_json::Value;
use strata_resources::{OutcomeStats, ResourceMetrics};
use strata_types::{
    AvailableResources, ExecutionResult, ResourceConstraints, TierCommunication,
    TierExecutionRequest, TierMetrics,
};
use tracing::info;

use super::{Context, Workflow, WorkflowFormat};
use crate::runtime::Runtime;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow file (JSON)
    pub workflow: PathBuf,

    /// Format of the workflow file
    #[arg(short, long, value_enum, default_value = "bpmn")]
    pub format: WorkflowFormat,

    /// Input variable as KEY=VALUE (VALUE is parsed as JSON, else taken as a string)
    #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
    pub inputs: Vec<(String, Value)>,

    /// Additional BPMN routine that call activities may invoke
    #[arg(long = "routine", value_name = "FILE")]
    pub routines: Vec<PathBuf>,

    /// Additional native routine that call activities may invoke
    #[arg(long = "native-routine", value_name = "FILE")]
    pub native_routines: Vec<PathBuf>,

    /// Credits available to the run
    #[arg(long, default_value_t = 100.0)]
    pub credits: f64,

    /// Maximum credits a single step may reserve
    #[arg(long)]
    pub max_cost: Option<f64>,

    /// User the run is charged to
    #[arg(long)]
    pub user: Option<String>,
}

/// Run report for JSON output.
#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    routine: &'a str,
    result: &'a ExecutionResult,
    orchestrator: TierMetrics,
    executor: TierMetrics,
    resources: ResourceMetrics,
    recovery: HashMap<String, OutcomeStats>,
    events: usize,
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let workflow = Workflow::load(&args.workflow, args.format)?;
    let runtime = Runtime::build(&ctx.loaded.config);

    for path in &args.routines {
        register(&runtime, Workflow::load(path, WorkflowFormat::Bpmn)?).await;
    }
    for path in &args.native_routines {
        register(&runtime, Workflow::load(path, WorkflowFormat::Native)?).await;
    }

    let routine_id = workflow.id().to_string();
    let format = workflow.format();
    register(&runtime, workflow).await;

    let mut constraints = ResourceConstraints::default();
    if let Some(max_cost) = args.max_cost {
        constraints = constraints.with_max_cost(max_cost);
    }
    let mut request = TierExecutionRequest::routine(&routine_id, format)
        .with_inputs(args.inputs.into_iter().collect())
        .with_available(AvailableResources::with_credits(args.credits))
        .with_constraints(constraints);
    if let Some(user) = args.user {
        request = request.with_user(user);
    }

    info!(routine = %routine_id, execution_id = %request.execution_id, "Running workflow");
    let result = runtime.orchestrator.execute(request).await?;

    if ctx.json_output {
        let output = RunOutput {
            routine: &routine_id,
            result: &result,
            orchestrator: runtime.orchestrator.metrics(),
            executor: runtime.executor.metrics(),
            resources: runtime.resources.metrics(),
            recovery: runtime.recovery.all_outcome_stats(),
            events: runtime.events.count("*"),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(&runtime, &routine_id, &result, ctx.verbose);
    }

    if !result.is_success() {
        bail!(
            "Routine '{routine_id}' failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn register(runtime: &Runtime, workflow: Workflow) {
    match workflow {
        Workflow::Bpmn(model) => runtime.orchestrator.register_bpmn(model).await,
        Workflow::Native(routine) => runtime.orchestrator.register_native(routine).await,
    }
}

fn print_report(runtime: &Runtime, routine_id: &str, result: &ExecutionResult, verbose: bool) {
    let green = Style::new().green();
    let red = Style::new().red();
    let dim = Style::new().dim();

    println!();
    println!("{}", style(format!("Routine {routine_id}")).bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();

    if result.is_success() {
        println!("  {} {}", dim.apply_to("Status:"), green.apply_to("● completed"));
    } else {
        println!("  {} {}", dim.apply_to("Status:"), red.apply_to("● failed"));
        if let Some(ref error) = result.error {
            println!("  {} {}", dim.apply_to("Error:"), error);
        }
    }
    println!("  {} {}ms", dim.apply_to("Duration:"), result.duration_ms);
    if let Some(usage) = result.usage {
        println!(
            "  {} {:.2} credits, {} tokens, {} API calls",
            dim.apply_to("Usage:"),
            usage.cost,
            usage.tokens,
            usage.api_calls
        );
    }

    if let Some(Value::Object(vars)) = result.data.as_ref().and_then(|d| d.get("variables")) {
        println!();
        println!("{}", dim.apply_to("Variables:"));
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();
        for name in names {
            println!("  {:<16} {}", name, vars[name]);
        }
    }

    let resources = runtime.resources.metrics();
    let executor = runtime.executor.metrics();
    println!();
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();
    println!(
        "  {} {} run, {} failed",
        dim.apply_to("Steps:"),
        executor.total_executions,
        executor.failed_executions
    );
    println!(
        "  {} {} approved, {} rejected",
        dim.apply_to("Reservations:"),
        resources.reservations_approved,
        resources.reservations_rejected
    );
    println!(
        "  {} {:.2} used, {:.2} remaining",
        dim.apply_to("Credits:"),
        resources.total_credits_used,
        resources.global_credits_remaining
    );

    if verbose {
        println!();
        println!("{}", dim.apply_to("Events:"));
        for event in runtime.events.recent("*") {
            println!("  {} {}", dim.apply_to(event.published_at.format("%H:%M:%S%.3f")), event.topic);
        }
    }

    println!();
}

/// Parse a `KEY=VALUE` input.
fn parse_input(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
