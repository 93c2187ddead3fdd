use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::{Artifact, EntryPoint, Workspace},
    result::Diagnostic,
};

#[mockall::automock]
#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    async fn build(
        &self,
        workspace: &Workspace,
        entry_point: &EntryPoint,
        ctx: &PhaseContext,
    ) -> Result<Artifact, BuildError>;

    async fn run(
        &self,
        workspace: &Workspace,
        artifact: &Artifact,
        ctx: &PhaseContext,
    ) -> Result<RunResult, RunError>;
}

/// Limits and controls applied to a single build or run phase.
#[derive(Clone, Debug)]
pub struct PhaseContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub process: ProcessSlot,
    pub environment: HashMap<String, String>,
}

impl PhaseContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        PhaseContext {
            timeout,
            cancel,
            process: ProcessSlot::default(),
            environment: HashMap::new(),
        }
    }
}

/// Shared slot publishing the pid or container name of the phase that is
/// currently executing.
#[derive(Clone, Debug, Default)]
pub struct ProcessSlot(Arc<Mutex<Option<String>>>);

impl ProcessSlot {
    pub fn set(&self, id: impl Into<String>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(id.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = None;
        }
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

#[derive(Clone, Debug)]
pub enum BuildError {
    /// Toolchain exited non-zero; the raw tool output is kept verbatim.
    Failed { output: String },
    /// Toolchain failed and its output could be parsed into diagnostics.
    Diagnostics {
        diagnostics: Vec<Diagnostic>,
        output: String,
    },
    NoEntryPoint { msg: String },
    TimedOut { output: String },
    Cancelled,
    Internal { msg: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunResult {
    pub status: i64,
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

#[derive(Clone, Debug)]
pub enum RunError {
    Crash { result: RunResult },
    TimedOut { result: RunResult },
    Cancelled { result: RunResult },
    Internal { msg: String },
}
