use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::HostConfig,
};
use futures::StreamExt;
use itertools::Itertools;
use nix::unistd::{getgid, getuid};
use uuid::Uuid;

use crate::{
    config::{ContainerSettings, RunnerConfig, TemplateVars, Toolchain},
    constants::{ARTIFACT_DIR, CONTAINER_WORKDIR, RUN_ID_LABEL},
    core::{
        domain::{Artifact, EntryPoint, RunId, Workspace},
        traits::executor::{BuildError, Executor, PhaseContext, RunError, RunResult},
        transcript::{Stream, Transcript},
    },
    native::{
        executor::{build_outcome, prepare_artifact},
        process::{Exit, Supervised},
    },
};

/// Variables every toolchain container starts with. The root filesystem is
/// read-only, so the SDK's home and package cache live on the tmpfs.
const BASE_ENV: [(&str, &str); 4] = [
    ("DOTNET_CLI_HOME", "/tmp"),
    ("NUGET_PACKAGES", "/tmp/nuget"),
    ("DOTNET_NOLOGO", "1"),
    ("DOTNET_CLI_TELEMETRY_OPTOUT", "1"),
];

const OOM_HINT: &str = "[Container killed: likely exceeded the memory limit]";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Build,
    Run,
}

impl Phase {
    /// The build writes its output into the workspace, the run only reads it.
    fn mount_mode(self) -> &'static str {
        match self {
            Phase::Build => "rw",
            Phase::Run => "ro",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Build => write!(f, "build"),
            Phase::Run => write!(f, "run"),
        }
    }
}

/// Builds and runs projects inside throwaway containers, one per phase.
#[derive(Clone)]
pub struct ContainerExecutor {
    docker: Docker,
    settings: ContainerSettings,
    toolchain: Toolchain,
    limit: usize,
    drain_grace: Duration,
}

impl fmt::Debug for ContainerExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerExecutor")
            .field("image", &self.settings.image)
            .finish_non_exhaustive()
    }
}

impl ContainerExecutor {
    pub fn new(docker: Docker, config: &RunnerConfig) -> Self {
        ContainerExecutor {
            docker,
            settings: config.container.clone(),
            toolchain: config.project.clone(),
            limit: config.max_output_bytes,
            drain_grace: config.drain_grace(),
        }
    }

    /// Connects to the local daemon, verifies it answers and warms the image
    /// cache so the first phase does not spend its time limit on a pull.
    pub async fn connect(config: &RunnerConfig) -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        let executor = Self::new(docker, config);
        executor.ensure_image().await?;
        Ok(executor)
    }

    /// Pulls the toolchain image unless it is already present.
    async fn ensure_image(&self) -> Result<(), DockerError> {
        let image = &self.settings.image;
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!(%image, "Image cache hit");
            return Ok(());
        }

        tracing::warn!(%image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }

        tracing::info!(%image, "Image pulled");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(run_id = %workspace.run_id, %phase))]
    async fn execute(
        &self,
        phase: Phase,
        cmd: Vec<String>,
        workspace: &Workspace,
        ctx: &PhaseContext,
    ) -> Result<Supervised, DockerError> {
        if ctx.cancel.is_cancelled() {
            return Ok(Supervised {
                exit: Exit::Cancelled,
                transcript: Transcript::with_limit(self.limit),
                elapsed: Duration::ZERO,
            });
        }

        // The limit covers the whole phase, an image pull included.
        let deadline = tokio::time::Instant::now() + ctx.timeout;
        let name = format!("coderunner-{}-{}", phase, Uuid::new_v4());
        let config = container_config(
            &self.settings,
            phase,
            cmd,
            &workspace.root,
            &ctx.environment,
            workspace.run_id,
        );
        let guard = ContainerGuard::new(self.docker.clone(), name.clone());

        let setup = async {
            self.ensure_image().await?;
            self.docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: name.clone(),
                        platform: None,
                    }),
                    config,
                )
                .await?;
            ctx.process.set(name.clone());
            self.docker
                .start_container(&name, None::<StartContainerOptions<String>>)
                .await
        };
        let interrupted = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Some(Exit::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Some(Exit::TimedOut),
            started = setup => {
                if let Err(e) = started {
                    ctx.process.clear();
                    return Err(e);
                }
                None
            }
        };
        if let Some(exit) = interrupted {
            tracing::info!(container = %name, ?exit, "Phase ended before the container started");
            ctx.process.clear();
            // The daemon may be the thing that is stuck, so removal runs in
            // the background.
            drop(guard);
            return Ok(Supervised {
                exit,
                transcript: Transcript::with_limit(self.limit),
                elapsed: Duration::ZERO,
            });
        }
        let started = Instant::now();
        tracing::debug!(container = %name, "Container started");

        let transcript = Arc::new(Mutex::new(Transcript::with_limit(self.limit)));
        let mut logs = tokio::spawn(collect_logs(
            self.docker.clone(),
            name.clone(),
            transcript.clone(),
        ));

        let wait = async {
            let options = Some(WaitContainerOptions {
                condition: "not-running",
            });
            let mut stream = self.docker.wait_container(&name, options);
            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // Non-zero exits are reported as errors by the wait endpoint.
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(e),
                None => Err(DockerError::DockerContainerWaitError {
                    error: "wait stream ended without a status".to_string(),
                    code: -1,
                }),
            }
        };

        let exit = tokio::select! {
            biased;
            status = wait => Exit::Exited { status: status? },
            _ = ctx.cancel.cancelled() => Exit::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Exit::TimedOut,
        };
        let elapsed = started.elapsed();

        if !matches!(exit, Exit::Exited { .. }) {
            tracing::info!(container = %name, ?exit, "Killing container");
            let options = Some(KillContainerOptions { signal: "SIGKILL" });
            if let Err(e) = self.docker.kill_container(&name, options).await {
                tracing::debug!(container = %name, error = %e, "Container already stopped");
            }
        }

        if tokio::time::timeout(self.drain_grace, &mut logs).await.is_err() {
            tracing::warn!(container = %name, "Log stream did not finish in time");
            logs.abort();
        }
        ctx.process.clear();
        guard.remove().await;

        let mut transcript = match transcript.lock() {
            Ok(transcript) => transcript.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        transcript.flush();
        if exit == (Exit::Exited { status: 137 }) {
            transcript.push_line(Stream::Stderr, OOM_HINT);
        }

        Ok(Supervised {
            exit,
            transcript,
            elapsed,
        })
    }

    fn vars(&self, entry_point: Option<&EntryPoint>, name: String) -> TemplateVars {
        let entry = entry_point
            .map(|entry| entry.path.replace('\\', "/"))
            .unwrap_or_default();
        TemplateVars {
            workspace: CONTAINER_WORKDIR.to_string(),
            manifest: entry.clone(),
            entry,
            name,
            out: format!("{}/{}", CONTAINER_WORKDIR, ARTIFACT_DIR),
            sources: vec![],
        }
    }
}

#[async_trait::async_trait]
impl Executor for ContainerExecutor {
    async fn build(
        &self,
        workspace: &Workspace,
        entry_point: &EntryPoint,
        ctx: &PhaseContext,
    ) -> Result<Artifact, BuildError> {
        let artifact = prepare_artifact(workspace, entry_point).await?;
        let mut vars = self.vars(Some(entry_point), artifact.name.clone());
        vars.sources = workspace.files.clone();
        let (program, args) = self
            .toolchain
            .build
            .render(&vars)
            .ok_or_else(|| BuildError::Internal {
                msg: "build command template is empty".to_string(),
            })?;

        let supervised = self
            .execute(Phase::Build, std::iter::once(program).chain(args).collect(), workspace, ctx)
            .await
            .map_err(|e| BuildError::Internal {
                msg: format!("container build failed: {}", e),
            })?;

        build_outcome(supervised).map(|build_output| Artifact {
            build_output,
            ..artifact
        })
    }

    async fn run(
        &self,
        workspace: &Workspace,
        artifact: &Artifact,
        ctx: &PhaseContext,
    ) -> Result<RunResult, RunError> {
        let vars = self.vars(None, artifact.name.clone());
        let (program, args) = self
            .toolchain
            .run
            .render(&vars)
            .ok_or_else(|| RunError::Internal {
                msg: "run command template is empty".to_string(),
            })?;

        self.execute(Phase::Run, std::iter::once(program).chain(args).collect(), workspace, ctx)
            .await
            .map_err(|e| RunError::Internal {
                msg: format!("container run failed: {}", e),
            })?
            .into_run_outcome()
    }
}

/// Container settings for one phase: no network, read-only root with a
/// tmpfs scratch area, memory without swap, a CPU fraction and a pid cap.
/// The process runs as the runner's own uid and gid so that it can write the
/// bind-mounted workspace and the runner can delete what it wrote.
pub fn container_config(
    settings: &ContainerSettings,
    phase: Phase,
    cmd: Vec<String>,
    host_dir: &Path,
    environment: &HashMap<String, String>,
    run_id: RunId,
) -> Config<String> {
    let memory = i64::from(settings.memory_limit_mb) * 1024 * 1024;
    let env = BASE_ENV
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .chain(
            environment
                .iter()
                .sorted()
                .map(|(key, value)| format!("{}={}", key, value)),
        )
        .collect();

    Config {
        image: Some(settings.image.clone()),
        cmd: Some(cmd),
        user: Some(host_user()),
        env: Some(env),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        labels: Some(HashMap::from([(RUN_ID_LABEL.to_string(), run_id.to_string())])),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!(
                "{}:{}:{}",
                host_dir.display(),
                CONTAINER_WORKDIR,
                phase.mount_mode()
            )]),
            memory: Some(memory),
            memory_swap: Some(memory),
            nano_cpus: Some((f64::from(settings.cpu_limit) * 1_000_000_000.0) as i64),
            pids_limit: Some(settings.pids_limit),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                format!("rw,exec,size={}m", settings.tmpfs_size_mb),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn host_user() -> String {
    format!("{}:{}", getuid(), getgid())
}

async fn collect_logs(docker: Docker, name: String, transcript: Arc<Mutex<Transcript>>) {
    let options = Some(LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        tail: "all".to_string(),
        ..Default::default()
    });
    let mut stream = docker.logs(&name, options);

    while let Some(output) = stream.next().await {
        let (stream_kind, message) = match output {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                (Stream::Stdout, message)
            }
            Ok(LogOutput::StdErr { message }) => (Stream::Stderr, message),
            Ok(LogOutput::StdIn { .. }) => continue,
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "Failed to read container logs");
                break;
            }
        };
        if let Ok(mut transcript) = transcript.lock() {
            transcript.push_chunk(stream_kind, &message);
        }
    }
}

/// Force-removes the container when the phase ends, including when the
/// phase future is dropped part way.
struct ContainerGuard {
    docker: Docker,
    name: String,
    removed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String) -> Self {
        ContainerGuard {
            docker,
            name,
            removed: false,
        }
    }

    async fn remove(mut self) {
        self.removed = true;
        remove_container(&self.docker, &self.name).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { remove_container(&docker, &name).await });
        } else {
            tracing::error!(container = %name, "No runtime to remove container");
        }
    }
}

async fn remove_container(docker: &Docker, name: &str) {
    let options = Some(RemoveContainerOptions {
        force: true,
        ..Default::default()
    });
    match docker.remove_container(name, options).await {
        Ok(()) => tracing::debug!(container = %name, "Container removed"),
        Err(DockerError::DockerResponseServerError {
            status_code: 404, ..
        }) => tracing::debug!(container = %name, "Container was never created"),
        Err(e) => tracing::error!(container = %name, error = %e, "Failed to remove container"),
    }
}
