use std::time::Duration;

use uuid::Uuid;

use crate::core::{
    domain::{Artifact, EntryPoint, Workspace},
    traits::executor::{BuildError, Executor, PhaseContext, RunError, RunResult},
};

/// Executor returning canned outcomes after a delay. The delay honours the
/// phase's cancellation token and timeout like a real backend would.
#[derive(Debug, Clone)]
pub struct ExecutorStub {
    build: Result<(), BuildError>,
    run: Result<RunResult, RunError>,
    delay: Duration,
}

impl ExecutorStub {
    pub fn new(
        build: Result<(), BuildError>,
        run: Result<RunResult, RunError>,
        delay: Duration,
    ) -> Self {
        Self { build, run, delay }
    }

    pub fn succeeding(output: &str, delay: Duration) -> Self {
        Self::new(
            Ok(()),
            Ok(RunResult {
                status: 0,
                output: output.to_string(),
                stdout: output.to_string(),
                ..Default::default()
            }),
            delay,
        )
    }

    async fn wait(&self, ctx: &PhaseContext) -> Option<Outcome> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Some(Outcome::Cancelled),
            _ = tokio::time::sleep(ctx.timeout), if ctx.timeout < self.delay => Some(Outcome::TimedOut),
            _ = tokio::time::sleep(self.delay) => None,
        }
    }
}

enum Outcome {
    Cancelled,
    TimedOut,
}

#[async_trait::async_trait]
impl Executor for ExecutorStub {
    #[tracing::instrument(skip_all)]
    async fn build(
        &self,
        workspace: &Workspace,
        entry_point: &EntryPoint,
        ctx: &PhaseContext,
    ) -> Result<Artifact, BuildError> {
        tracing::debug!("Start build: entry={:?}", entry_point);
        ctx.process.set("stub-build");
        let interrupted = self.wait(ctx).await;
        ctx.process.clear();

        match interrupted {
            Some(Outcome::Cancelled) => Err(BuildError::Cancelled),
            Some(Outcome::TimedOut) => Err(BuildError::TimedOut {
                output: String::new(),
            }),
            None => {
                tracing::debug!("Build result: {:?}", self.build);
                self.build.clone().map(|()| Artifact {
                    id: Uuid::new_v4(),
                    name: entry_point.name(),
                    dir: workspace.artifact_dir(),
                    build_output: String::new(),
                })
            }
        }
    }

    #[tracing::instrument(skip_all)]
    async fn run(
        &self,
        _workspace: &Workspace,
        artifact: &Artifact,
        ctx: &PhaseContext,
    ) -> Result<RunResult, RunError> {
        tracing::debug!("Start execution: artifact={:?}", artifact);
        ctx.process.set("stub-run");
        let interrupted = self.wait(ctx).await;
        ctx.process.clear();

        match interrupted {
            Some(Outcome::Cancelled) => Err(RunError::Cancelled {
                result: RunResult::default(),
            }),
            Some(Outcome::TimedOut) => Err(RunError::TimedOut {
                result: RunResult::default(),
            }),
            None => {
                tracing::debug!("Execution result: {:?}", self.run);
                self.run.clone()
            }
        }
    }
}
