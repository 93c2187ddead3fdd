use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    domain::{ProjectId, RunId, RunState},
    traits::executor::{BuildError, RunError, RunResult},
};

/// Diagnostic codes produced by the runner itself. Compiler diagnostics keep
/// the compiler's own codes.
pub mod codes {
    pub const PATH_TRAVERSAL: &str = "PATH_TRAVERSAL";
    pub const IO_ERROR: &str = "IO_ERROR";
    pub const BUILD_ERROR: &str = "BUILD_ERROR";
    pub const RUNTIME_ERROR: &str = "RUNTIME_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const NO_ENTRY_POINT: &str = "NO_ENTRY_POINT";
    pub const INFRASTRUCTURE_ERROR: &str = "INFRASTRUCTURE_ERROR";
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
}

impl Diagnostic {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Diagnostic {
            code: code.into(),
            message: message.into(),
            start_line: None,
            end_line: None,
        }
    }

    pub fn with_lines(self, start_line: u32, end_line: u32) -> Self {
        Self {
            start_line: Some(start_line),
            end_line: Some(end_line),
            ..self
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub project_id: ProjectId,
    pub run_id: RunId,
    pub state: RunState,
    pub success: bool,
    /// Stdout and stderr merged in arrival order.
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub diagnostics: Vec<Diagnostic>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed(ExecutionResult),
    Conflict { project_id: ProjectId },
    InfrastructureError(ExecutionResult),
}

impl RunOutcome {
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            RunOutcome::Completed(result) | RunOutcome::InfrastructureError(result) => {
                Some(result)
            }
            RunOutcome::Conflict { .. } => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RunOutcome::Conflict { .. })
    }

    pub fn state(&self) -> Option<RunState> {
        self.result().map(|result| result.state)
    }
}

/// Builds the terminal result of one run from backend outcomes.
#[derive(Clone, Debug)]
pub struct ResultBuilder {
    project_id: ProjectId,
    run_id: RunId,
    started_at: DateTime<Utc>,
}

impl ResultBuilder {
    pub fn new(project_id: ProjectId, run_id: RunId, started_at: DateTime<Utc>) -> Self {
        ResultBuilder {
            project_id,
            run_id,
            started_at,
        }
    }

    pub fn succeeded(&self, result: RunResult) -> RunOutcome {
        RunOutcome::Completed(self.finish(RunState::Succeeded, true, result, vec![]))
    }

    /// Result of a build-only request whose build succeeded.
    pub fn built(&self, output: String) -> RunOutcome {
        RunOutcome::Completed(self.finish(RunState::Built, true, from_output(output), vec![]))
    }

    pub fn cancelled(&self, partial: Option<RunResult>) -> RunOutcome {
        RunOutcome::Completed(self.finish(
            RunState::Cancelled,
            false,
            partial.unwrap_or_default(),
            vec![],
        ))
    }

    pub fn build_failed(&self, error: BuildError, timeout: Duration) -> RunOutcome {
        match error {
            BuildError::Failed { output } => {
                let message = if output.trim().is_empty() {
                    "build failed without output".to_string()
                } else {
                    output.clone()
                };
                RunOutcome::Completed(self.finish(
                    RunState::BuildFailed,
                    false,
                    from_output(output),
                    vec![Diagnostic::new(codes::BUILD_ERROR, message)],
                ))
            }
            BuildError::Diagnostics {
                diagnostics,
                output,
            } => RunOutcome::Completed(self.finish(
                RunState::BuildFailed,
                false,
                from_output(output),
                diagnostics,
            )),
            BuildError::NoEntryPoint { msg } => RunOutcome::Completed(self.finish(
                RunState::BuildFailed,
                false,
                RunResult::default(),
                vec![Diagnostic::new(codes::NO_ENTRY_POINT, msg)],
            )),
            BuildError::TimedOut { output } => RunOutcome::Completed(self.finish(
                RunState::TimedOut,
                false,
                from_output(output),
                vec![timeout_diagnostic("Build", timeout)],
            )),
            BuildError::Cancelled => self.cancelled(None),
            BuildError::Internal { msg } => self.infrastructure(codes::INFRASTRUCTURE_ERROR, msg),
        }
    }

    pub fn run_failed(&self, error: RunError, timeout: Duration) -> RunOutcome {
        match error {
            RunError::Crash { result } => {
                let message = match result.stderr.trim() {
                    "" => format!("Process exited with status {}", result.status),
                    stderr => stderr.to_string(),
                };
                RunOutcome::Completed(self.finish(
                    RunState::RuntimeFailed,
                    false,
                    result,
                    vec![Diagnostic::new(codes::RUNTIME_ERROR, message)],
                ))
            }
            RunError::TimedOut { result } => RunOutcome::Completed(self.finish(
                RunState::TimedOut,
                false,
                result,
                vec![timeout_diagnostic("Execution", timeout)],
            )),
            RunError::Cancelled { result } => self.cancelled(Some(result)),
            RunError::Internal { msg } => self.infrastructure(codes::INFRASTRUCTURE_ERROR, msg),
        }
    }

    pub fn infrastructure(&self, code: &str, message: impl Into<String>) -> RunOutcome {
        RunOutcome::InfrastructureError(self.finish(
            RunState::Faulted,
            false,
            RunResult::default(),
            vec![Diagnostic::new(code, message)],
        ))
    }

    fn finish(
        &self,
        state: RunState,
        success: bool,
        result: RunResult,
        diagnostics: Vec<Diagnostic>,
    ) -> ExecutionResult {
        ExecutionResult {
            project_id: self.project_id,
            run_id: self.run_id,
            state,
            success,
            output: result.output,
            stdout: result.stdout,
            stderr: result.stderr,
            diagnostics,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn from_output(output: String) -> RunResult {
    RunResult {
        output,
        ..Default::default()
    }
}

fn timeout_diagnostic(phase: &str, timeout: Duration) -> Diagnostic {
    Diagnostic::new(
        codes::TIMEOUT,
        format!("{} timed out after {} ms", phase, timeout.as_millis()),
    )
}
