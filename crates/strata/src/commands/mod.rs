//! CLI command handlers.

pub mod config;
pub mod run;
pub mod validate;

use std::path::Path;

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use strata_config::LoadedConfig;
use strata_navigation::{BpmnModel, NativeRoutine};
use strata_types::RoutineFormat;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Resolved configuration and where it came from.
    pub loaded: LoadedConfig,
}

/// Workflow file formats the CLI can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkflowFormat {
    /// BPMN-style element/flow graph
    Bpmn,
    /// Ordered list of tool steps
    Native,
}

/// A workflow loaded from disk.
#[derive(Debug)]
pub enum Workflow {
    Bpmn(BpmnModel),
    Native(NativeRoutine),
}

impl Workflow {
    /// Load and validate a workflow file.
    pub fn load(path: &Path, format: WorkflowFormat) -> Result<Self> {
        let workflow = match format {
            WorkflowFormat::Bpmn => BpmnModel::from_file(path).map(Workflow::Bpmn),
            WorkflowFormat::Native => NativeRoutine::from_file(path).map(Workflow::Native),
        };
        workflow.with_context(|| format!("Invalid workflow {}", path.display()))
    }

    pub fn id(&self) -> &str {
        match self {
            Workflow::Bpmn(model) => model.id(),
            Workflow::Native(routine) => &routine.id,
        }
    }

    pub fn format(&self) -> RoutineFormat {
        match self {
            Workflow::Bpmn(_) => RoutineFormat::Bpmn,
            Workflow::Native(_) => RoutineFormat::Native,
        }
    }
}
