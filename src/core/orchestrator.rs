use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinHandle;

use crate::{
    config::{Isolation, RunnerConfig},
    core::{
        domain::{EntryPoint, ProjectFileSet, ProjectId, RunId, RunMode, RunRequest, RunState, Workspace},
        registry::{ProcessStatus, RunHandle, RunRegistry},
        result::{ResultBuilder, RunOutcome, codes},
        selection::{BackendKind, resolve_entry_point, select_backend},
        traits::{
            executor::{Executor, PhaseContext},
            file_source::{FileSource, load_file_set},
        },
    },
    docker::executor::ContainerExecutor,
    native::{executor::NativeExecutor, single_file::SingleFileExecutor},
    workspace::{Materializer, WorkspaceError},
};

/// One executor per backend kind. The container backend is optional because
/// it needs a reachable daemon.
#[derive(Clone, Debug)]
pub struct Backends {
    pub process: Arc<dyn Executor>,
    pub container: Option<Arc<dyn Executor>>,
    pub single_file: Arc<dyn Executor>,
}

impl Backends {
    fn get(&self, kind: BackendKind) -> Option<Arc<dyn Executor>> {
        match kind {
            BackendKind::NativeProcess => Some(self.process.clone()),
            BackendKind::Container => self.container.clone(),
            BackendKind::SingleFile => Some(self.single_file.clone()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub default_timeout: Duration,
    pub isolation: Isolation,
    pub manifest_extensions: Vec<String>,
    pub source_extensions: Vec<String>,
}

impl From<&RunnerConfig> for Settings {
    fn from(config: &RunnerConfig) -> Self {
        Settings {
            default_timeout: config.default_timeout(),
            isolation: config.isolation,
            manifest_extensions: config.manifest_extensions.clone(),
            source_extensions: config.single_file.source_extensions.clone(),
        }
    }
}

/// Drives a request through registration, staging, build and run, and
/// guarantees the registry entry and the workspace are released afterwards.
#[derive(Debug)]
pub struct Orchestrator {
    registry: Arc<RunRegistry>,
    workspaces: Arc<Materializer>,
    backends: Backends,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<RunRegistry>,
        workspaces: Arc<Materializer>,
        backends: Backends,
        settings: Settings,
    ) -> Self {
        Orchestrator {
            registry,
            workspaces,
            backends,
            settings,
        }
    }

    /// Wires the configured backends. Connecting to Docker is only attempted
    /// when container isolation is selected.
    pub async fn from_config(config: &RunnerConfig) -> anyhow::Result<Self> {
        let container = match config.isolation {
            Isolation::Container => {
                let executor = ContainerExecutor::connect(config)
                    .await
                    .context("Failed to connect to Docker daemon")?;
                Some(Arc::new(executor) as Arc<dyn Executor>)
            }
            Isolation::Process => None,
        };

        Ok(Self::new(
            Arc::new(RunRegistry::new()),
            Arc::new(Materializer::from_config(config)),
            Backends {
                process: Arc::new(NativeExecutor::from_config(config)),
                container,
                single_file: Arc::new(SingleFileExecutor::from_config(config)),
            },
            Settings::from(config),
        ))
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    #[tracing::instrument(skip_all, fields(project_id = %request.project_id))]
    pub async fn execute(&self, request: RunRequest, files: ProjectFileSet) -> RunOutcome {
        let project_id = request.project_id;
        let handle = Arc::new(RunHandle::new(project_id));
        if !self.registry.try_register(handle.clone()) {
            tracing::info!("Project already has an active run");
            return RunOutcome::Conflict { project_id };
        }
        let _registration = Registration {
            registry: self.registry.clone(),
            project_id,
            run_id: handle.run_id,
        };

        let run_id = handle.run_id;
        let builder = ResultBuilder::new(project_id, run_id, handle.started_at);
        let timeout = request.timeout.unwrap_or(self.settings.default_timeout);
        tracing::info!(%run_id, files = files.len(), ?timeout, mode = ?request.mode, "Run started");

        let staged = match self.workspaces.stage(run_id, &files).await {
            Ok(staged) => staged,
            Err(e) => {
                let code = match &e {
                    WorkspaceError::PathTraversal { .. } => codes::PATH_TRAVERSAL,
                    WorkspaceError::Io { .. } => codes::IO_ERROR,
                };
                return self.fail(&handle, &builder, code, e.to_string());
            }
        };

        let outcome = match self.prepare(&request, &files) {
            Ok((entry_point, executor)) => {
                let mut task = AbortOnDrop(tokio::spawn(run_phases(
                    executor,
                    staged.workspace().clone(),
                    entry_point,
                    handle.clone(),
                    request,
                    timeout,
                    builder.clone(),
                )));

                match (&mut task.0).await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        let msg = panic_message(e.into_panic());
                        self.fail(&handle, &builder, codes::INFRASTRUCTURE_ERROR, format!("backend panicked: {}", msg))
                    }
                    Err(_) => builder.cancelled(None),
                }
            }
            Err((code, msg)) => self.fail(&handle, &builder, code, msg),
        };

        if let Some(state) = outcome.state() {
            handle.transition(state);
        }
        match &outcome {
            RunOutcome::InfrastructureError(result) => {
                tracing::error!(%run_id, diagnostics = ?result.diagnostics, "Run faulted");
            }
            RunOutcome::Completed(result) if result.state == RunState::Cancelled => {
                tracing::info!(%run_id, "Run cancelled");
            }
            RunOutcome::Completed(result) => {
                tracing::info!(%run_id, state = ?result.state, success = result.success, "Run finished");
            }
            RunOutcome::Conflict { .. } => {}
        }

        staged.dispose().await;
        outcome
    }

    /// Loads the project from storage, then runs it like [`Self::execute`].
    #[tracing::instrument(skip_all, fields(project_id = %request.project_id))]
    pub async fn execute_project(&self, request: RunRequest, source: &dyn FileSource) -> RunOutcome {
        let project_id = request.project_id;
        if self.registry.get(project_id).is_some() {
            return RunOutcome::Conflict { project_id };
        }

        match load_file_set(source, project_id).await {
            Ok(files) => self.execute(request, files).await,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load project files");
                ResultBuilder::new(project_id, RunId::new_v4(), chrono::Utc::now())
                    .infrastructure(codes::IO_ERROR, e.to_string())
            }
        }
    }

    pub fn stop(&self, project_id: ProjectId) -> bool {
        self.registry.stop(project_id)
    }

    pub fn status(&self, project_id: ProjectId) -> ProcessStatus {
        self.registry.status(project_id)
    }

    pub fn running(&self) -> Vec<ProcessStatus> {
        self.registry.running()
    }

    /// Cancels every active run and removes every workspace still on disk.
    pub async fn shutdown(&self) {
        let stopped = self.registry.stop_all();
        let removed = self.workspaces.dispose_all().await;
        tracing::info!(stopped, removed, "Runner shut down");
    }

    fn prepare(
        &self,
        request: &RunRequest,
        files: &ProjectFileSet,
    ) -> Result<(EntryPoint, Arc<dyn Executor>), (&'static str, String)> {
        let entry_point = resolve_entry_point(
            files,
            request.entry_point.as_deref(),
            &self.settings.manifest_extensions,
            &self.settings.source_extensions,
        )
        .ok_or_else(|| {
            let msg = match &request.entry_point {
                Some(path) => format!("entry point `{}` is not part of the project", path),
                None => "project has no manifest or source file to build".to_string(),
            };
            (codes::NO_ENTRY_POINT, msg)
        })?;

        let kind = select_backend(&entry_point, self.settings.isolation);
        tracing::debug!(entry = %entry_point.path, ?kind, "Backend selected");
        let executor = self.backends.get(kind).ok_or_else(|| {
            (
                codes::INFRASTRUCTURE_ERROR,
                format!("{:?} backend is not available", kind),
            )
        })?;

        Ok((entry_point, executor))
    }

    fn fail(&self, handle: &RunHandle, builder: &ResultBuilder, code: &str, msg: String) -> RunOutcome {
        handle.transition(RunState::Faulted);
        builder.infrastructure(code, msg)
    }
}

async fn run_phases(
    executor: Arc<dyn Executor>,
    workspace: Workspace,
    entry_point: EntryPoint,
    handle: Arc<RunHandle>,
    request: RunRequest,
    timeout: Duration,
    builder: ResultBuilder,
) -> RunOutcome {
    let mut ctx = PhaseContext {
        timeout,
        cancel: handle.cancellation(),
        process: handle.process(),
        environment: HashMap::new(),
    };

    handle.transition(RunState::Building);
    let artifact = match executor.build(&workspace, &entry_point, &ctx).await {
        Ok(artifact) => artifact,
        Err(e) => return builder.build_failed(e, timeout),
    };
    handle.transition(RunState::Built);

    if request.mode == RunMode::BuildOnly {
        return builder.built(artifact.build_output);
    }
    if handle.is_cancelled() {
        return builder.cancelled(None);
    }

    handle.transition(RunState::Running);
    ctx.environment = request.environment;
    match executor.run(&workspace, &artifact, &ctx).await {
        Ok(result) => builder.succeeded(result),
        Err(e) => builder.run_failed(e, timeout),
    }
}

/// Releases the registry entry even if `execute` is dropped part way.
struct Registration {
    registry: Arc<RunRegistry>,
    project_id: ProjectId,
    run_id: RunId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.project_id, self.run_id);
    }
}

/// Aborting the phase task drops its child processes, which are spawned
/// with `kill_on_drop`.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
