//! Staging of project files into run-private scratch directories and their
//! guaranteed removal.

pub mod paths;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::DashSet;
use tokio::fs;

use crate::{
    config::RunnerConfig,
    core::domain::{ProjectFileSet, RunId, Workspace},
};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("rejected path `{path}`: {reason}")]
    PathTraversal { path: String, reason: String },
    #[error("failed to {action} `{}`: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Creates and disposes workspaces under a scratch root. Keeps track of
/// every directory it created that has not been removed yet.
#[derive(Debug)]
pub struct Materializer {
    root: PathBuf,
    retries: u32,
    backoff: Duration,
    live: DashSet<PathBuf>,
}

impl Materializer {
    pub fn new<T: AsRef<Path>>(root: T, retries: u32, backoff: Duration) -> Self {
        Materializer {
            root: root.as_ref().into(),
            retries: retries.max(1),
            backoff,
            live: DashSet::new(),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            &config.scratch_root,
            config.cleanup_retries,
            Duration::from_millis(config.cleanup_backoff_ms),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `files` into a fresh directory named after `run_id`.
    ///
    /// Every path is validated before anything touches the disk. If a write
    /// fails halfway, the partial directory is removed before returning.
    #[tracing::instrument(skip(self, files), fields(files = files.len()))]
    pub async fn stage(
        self: &Arc<Self>,
        run_id: RunId,
        files: &ProjectFileSet,
    ) -> Result<StagedWorkspace, WorkspaceError> {
        let resolved = files
            .iter()
            .map(|file| paths::sanitize(&file.path).map(|path| (path, &file.content)))
            .collect::<Result<Vec<_>, _>>()?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| WorkspaceError::io("create scratch root", &self.root, e))?;

        let dir = self.root.join(run_id.to_string());
        fs::create_dir(&dir)
            .await
            .map_err(|e| WorkspaceError::io("create workspace", &dir, e))?;
        self.live.insert(dir.clone());

        let workspace = Workspace {
            run_id,
            root: dir,
            files: resolved
                .iter()
                .map(|(path, _)| path.to_string_lossy().replace('\\', "/"))
                .collect(),
            created_at: chrono::Utc::now(),
        };

        for (relative, content) in &resolved {
            if let Err(e) = write_file(&workspace.root, relative, content).await {
                tracing::warn!(error = %e, "Staging failed, removing partial workspace");
                self.dispose(&workspace).await;
                return Err(e);
            }
        }

        tracing::debug!(root = %workspace.root.display(), "Workspace staged");
        Ok(StagedWorkspace {
            workspace,
            materializer: self.clone(),
            disposed: false,
        })
    }

    /// Removes the workspace directory, retrying on transient failures.
    /// Returns `false` if the directory could not be removed; the failure is
    /// logged and the directory stays tracked for `dispose_all`.
    pub async fn dispose(&self, workspace: &Workspace) -> bool {
        self.remove_dir(&workspace.root).await
    }

    /// Removes every directory this materializer still tracks.
    pub async fn dispose_all(&self) -> usize {
        let dirs: Vec<PathBuf> = self.live.iter().map(|dir| dir.clone()).collect();
        let mut removed = 0;
        for dir in dirs {
            if self.remove_dir(&dir).await {
                removed += 1;
            }
        }
        removed
    }

    pub fn live(&self) -> Vec<PathBuf> {
        self.live.iter().map(|dir| dir.clone()).collect()
    }

    async fn remove_dir(&self, dir: &Path) -> bool {
        for attempt in 1..=self.retries {
            match fs::remove_dir_all(dir).await {
                Ok(()) => {
                    self.live.remove(dir);
                    tracing::debug!(dir = %dir.display(), "Workspace removed");
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.live.remove(dir);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        attempt,
                        error = %e,
                        "Failed to remove workspace"
                    );
                    if attempt < self.retries {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }

        tracing::error!(dir = %dir.display(), "Leaking workspace after repeated removal failures");
        false
    }
}

async fn write_file(root: &Path, relative: &Path, content: &[u8]) -> Result<(), WorkspaceError> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| WorkspaceError::io("create directory", parent, e))?;
    }
    fs::write(&path, content)
        .await
        .map_err(|e| WorkspaceError::io("write file", &path, e))
}

/// A staged workspace owned by one run. Disposal is awaited through
/// [`StagedWorkspace::dispose`]; if the value is dropped first, removal is
/// scheduled on the runtime instead.
#[derive(Debug)]
pub struct StagedWorkspace {
    workspace: Workspace,
    materializer: Arc<Materializer>,
    disposed: bool,
}

impl StagedWorkspace {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn dispose(mut self) -> bool {
        self.disposed = true;
        self.materializer.dispose(&self.workspace).await
    }
}

impl Drop for StagedWorkspace {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }

        let materializer = self.materializer.clone();
        let workspace = self.workspace.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    materializer.dispose(&workspace).await;
                });
            }
            Err(_) => {
                if std::fs::remove_dir_all(&workspace.root).is_ok() {
                    materializer.live.remove(&workspace.root);
                }
            }
        }
    }
}
