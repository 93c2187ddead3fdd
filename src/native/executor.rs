use std::{collections::HashMap, path::Path, time::Duration};

use tokio::fs;
use uuid::Uuid;

use crate::{
    config::{CommandTemplate, RunnerConfig, TemplateVars, Toolchain},
    core::{
        domain::{Artifact, EntryPoint, Workspace},
        traits::executor::{BuildError, Executor, PhaseContext, RunError, RunResult},
    },
    native::process::{Exit, ProcessSpec, Supervised, supervise},
};

/// Builds and runs manifest-based projects with the host toolchain, one
/// child process group per phase.
#[derive(Clone, Debug)]
pub struct NativeExecutor {
    toolchain: Toolchain,
    limit: usize,
    drain_grace: Duration,
}

impl NativeExecutor {
    pub fn new(toolchain: Toolchain, limit: usize, drain_grace: Duration) -> Self {
        NativeExecutor {
            toolchain,
            limit,
            drain_grace,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            config.project.clone(),
            config.max_output_bytes,
            config.drain_grace(),
        )
    }
}

#[async_trait::async_trait]
impl Executor for NativeExecutor {
    #[tracing::instrument(skip_all, fields(run_id = %workspace.run_id, entry = %entry_point.path))]
    async fn build(
        &self,
        workspace: &Workspace,
        entry_point: &EntryPoint,
        ctx: &PhaseContext,
    ) -> Result<Artifact, BuildError> {
        let vars = build_vars(workspace, entry_point, workspace.files.clone());
        let artifact = prepare_artifact(workspace, entry_point).await?;
        let spec = render(&self.toolchain.build, &vars, &workspace.root, &ctx.environment)
            .map_err(|msg| BuildError::Internal { msg })?;

        let supervised = supervise(&spec, ctx, self.limit, self.drain_grace)
            .await
            .map_err(|e| BuildError::Internal {
                msg: format!("failed to start `{}`: {}", spec.program, e),
            })?;

        build_outcome(supervised).map(|build_output| Artifact {
            build_output,
            ..artifact
        })
    }

    #[tracing::instrument(skip_all, fields(run_id = %workspace.run_id, artifact = %artifact.name))]
    async fn run(
        &self,
        workspace: &Workspace,
        artifact: &Artifact,
        ctx: &PhaseContext,
    ) -> Result<RunResult, RunError> {
        run_artifact(
            &self.toolchain.run,
            workspace,
            artifact,
            ctx,
            self.limit,
            self.drain_grace,
        )
        .await
    }
}

pub(crate) fn build_vars(
    workspace: &Workspace,
    entry_point: &EntryPoint,
    sources: Vec<String>,
) -> TemplateVars {
    TemplateVars {
        workspace: workspace.root.to_string_lossy().into_owned(),
        manifest: entry_point.path.clone(),
        entry: entry_point.path.clone(),
        name: entry_point.name(),
        out: workspace.artifact_dir().to_string_lossy().into_owned(),
        sources,
    }
}

/// Creates the output directory a build writes into.
pub(crate) async fn prepare_artifact(
    workspace: &Workspace,
    entry_point: &EntryPoint,
) -> Result<Artifact, BuildError> {
    let dir = workspace.artifact_dir();
    fs::create_dir_all(&dir)
        .await
        .map_err(|e| BuildError::Internal {
            msg: format!("failed to create `{}`: {}", dir.display(), e),
        })?;

    Ok(Artifact {
        id: Uuid::new_v4(),
        name: entry_point.name(),
        dir,
        build_output: String::new(),
    })
}

pub(crate) fn render(
    template: &CommandTemplate,
    vars: &TemplateVars,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<ProcessSpec, String> {
    let (program, args) = template
        .render(vars)
        .ok_or_else(|| "command template is empty".to_string())?;

    Ok(ProcessSpec {
        program,
        args,
        cwd: cwd.to_path_buf(),
        env: env.clone(),
    })
}

/// Yields the build transcript on success. A non-zero build exit keeps the
/// raw tool output verbatim.
pub(crate) fn build_outcome(supervised: Supervised) -> Result<String, BuildError> {
    let output = supervised.transcript.combined();
    match supervised.exit {
        Exit::Exited { status: 0 } => Ok(output),
        Exit::Exited { status } => {
            tracing::debug!(status, "Build failed");
            Err(BuildError::Failed { output })
        }
        Exit::TimedOut => Err(BuildError::TimedOut { output }),
        Exit::Cancelled => Err(BuildError::Cancelled),
    }
}

pub(crate) async fn run_artifact(
    template: &CommandTemplate,
    workspace: &Workspace,
    artifact: &Artifact,
    ctx: &PhaseContext,
    limit: usize,
    drain_grace: Duration,
) -> Result<RunResult, RunError> {
    let vars = TemplateVars {
        workspace: workspace.root.to_string_lossy().into_owned(),
        name: artifact.name.clone(),
        out: artifact.dir.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let spec = render(template, &vars, &workspace.root, &ctx.environment)
        .map_err(|msg| RunError::Internal { msg })?;

    supervise(&spec, ctx, limit, drain_grace)
        .await
        .map_err(|e| RunError::Internal {
            msg: format!("failed to start `{}`: {}", spec.program, e),
        })?
        .into_run_outcome()
}
