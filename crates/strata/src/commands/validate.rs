//! Validate command - loads a workflow and checks its structure.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use serde::Serialize;

use super::{Context, Workflow, WorkflowFormat};

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Workflow file (JSON)
    pub workflow: PathBuf,

    /// Format of the workflow file
    #[arg(short, long, value_enum, default_value = "bpmn")]
    pub format: WorkflowFormat,
}

/// Validation summary for JSON output.
#[derive(Debug, Serialize)]
struct ValidateOutput {
    valid: bool,
    id: String,
    format: String,
    elements: usize,
    flows: usize,
    subprocesses: usize,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let workflow = Workflow::load(&args.workflow, args.format)?;

    let (elements, flows, subprocesses) = match &workflow {
        Workflow::Bpmn(model) => (
            model.elements().len(),
            model.flows().len(),
            model
                .elements()
                .iter()
                .filter(|e| e.kind.subprocess_kind().is_some())
                .count(),
        ),
        Workflow::Native(routine) => (routine.steps.len(), 0, 0),
    };

    if ctx.json_output {
        let output = ValidateOutput {
            valid: true,
            id: workflow.id().to_string(),
            format: workflow.format().to_string(),
            elements,
            flows,
            subprocesses,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let green = Style::new().green();
    let dim = Style::new().dim();
    println!(
        "{} {} is a valid {} workflow",
        green.apply_to("✓"),
        style(workflow.id()).bold(),
        workflow.format()
    );
    match workflow {
        Workflow::Bpmn(_) => println!(
            "  {}",
            dim.apply_to(format!(
                "{elements} elements, {flows} flows, {subprocesses} subprocesses"
            ))
        ),
        Workflow::Native(_) => println!("  {}", dim.apply_to(format!("{elements} steps"))),
    }
    Ok(())
}
