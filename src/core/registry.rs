use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{
    domain::{ProjectId, RunId, RunState},
    traits::executor::ProcessSlot,
};

/// One in-flight run of a project.
#[derive(Debug)]
pub struct RunHandle {
    pub project_id: ProjectId,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    process: ProcessSlot,
    state: watch::Sender<RunState>,
}

impl RunHandle {
    pub fn new(project_id: ProjectId) -> Self {
        let (state, _) = watch::channel(RunState::default());
        RunHandle {
            project_id,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            process: ProcessSlot::default(),
            state,
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn process(&self) -> ProcessSlot {
        self.process.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Moves the run to `next` if the state machine allows it.
    pub fn transition(&self, next: RunState) -> bool {
        let run_id = self.run_id;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                tracing::debug!(%run_id, from = ?state, to = ?next, "Run state changed");
                *state = next;
                true
            } else {
                tracing::debug!(%run_id, from = ?state, to = ?next, "Ignoring state change");
                false
            }
        })
    }

    pub fn uptime_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub project_id: ProjectId,
    pub is_running: bool,
    pub run_id: Option<RunId>,
    pub process_id: Option<String>,
    pub state: Option<RunState>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
}

impl ProcessStatus {
    fn idle(project_id: ProjectId) -> Self {
        ProcessStatus {
            project_id,
            is_running: false,
            run_id: None,
            process_id: None,
            state: None,
            started_at: None,
            uptime_ms: 0,
        }
    }
}

impl From<&RunHandle> for ProcessStatus {
    fn from(handle: &RunHandle) -> Self {
        ProcessStatus {
            project_id: handle.project_id,
            is_running: true,
            run_id: Some(handle.run_id),
            process_id: handle.process.get(),
            state: Some(handle.state()),
            started_at: Some(handle.started_at),
            uptime_ms: handle.uptime_ms(),
        }
    }
}

/// Table of active runs, at most one per project.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<ProjectId, Arc<RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` unless its project already has an active run.
    pub fn try_register(&self, handle: Arc<RunHandle>) -> bool {
        match self.runs.entry(handle.project_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handle);
                true
            }
        }
    }

    /// Removes the entry of `project_id` only if it still belongs to `run_id`.
    pub fn unregister(&self, project_id: ProjectId, run_id: RunId) -> bool {
        self.runs
            .remove_if(&project_id, |_, handle| handle.run_id == run_id)
            .is_some()
    }

    pub fn get(&self, project_id: ProjectId) -> Option<Arc<RunHandle>> {
        self.runs.get(&project_id).map(|entry| entry.value().clone())
    }

    /// Signals cancellation to the active run of `project_id` and removes it.
    pub fn stop(&self, project_id: ProjectId) -> bool {
        match self.runs.remove(&project_id) {
            Some((_, handle)) => {
                tracing::info!(%project_id, run_id = %handle.run_id, "Stopping run");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let projects: Vec<ProjectId> = self.runs.iter().map(|entry| *entry.key()).collect();
        projects
            .into_iter()
            .filter(|project_id| self.stop(*project_id))
            .count()
    }

    pub fn status(&self, project_id: ProjectId) -> ProcessStatus {
        self.get(project_id)
            .map(|handle| ProcessStatus::from(handle.as_ref()))
            .unwrap_or_else(|| ProcessStatus::idle(project_id))
    }

    pub fn running(&self) -> Vec<ProcessStatus> {
        self.runs
            .iter()
            .map(|entry| ProcessStatus::from(entry.value().as_ref()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
