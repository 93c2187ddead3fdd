use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ProjectId = Uuid;
pub type RunId = Uuid;

/// One file of a submitted project, addressed by its path relative to the
/// project root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        SourceFile {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.path).extension().and_then(|ext| ext.to_str())
    }
}

/// Ordered set of files making up one run request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectFileSet {
    files: Vec<SourceFile>,
}

impl ProjectFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.push(SourceFile::new(path, content));
        self
    }

    pub fn push(&mut self, file: SourceFile) {
        self.files.push(file);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceFile> {
        self.files.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|file| file.path.as_str())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths().any(|candidate| candidate == path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FromIterator<SourceFile> for ProjectFileSet {
    fn from_iter<I: IntoIterator<Item = SourceFile>>(iter: I) -> Self {
        ProjectFileSet {
            files: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    BuildOnly,
    #[default]
    BuildAndRun,
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub project_id: ProjectId,
    pub entry_point: Option<String>,
    pub timeout: Option<Duration>,
    pub mode: RunMode,
    pub environment: HashMap<String, String>,
}

impl RunRequest {
    pub fn new(project_id: ProjectId) -> Self {
        RunRequest {
            project_id,
            entry_point: None,
            timeout: None,
            mode: RunMode::default(),
            environment: HashMap::new(),
        }
    }

    pub fn with_entry_point(self, entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: Some(entry_point.into()),
            ..self
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_mode(self, mode: RunMode) -> Self {
        Self { mode, ..self }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Manifest,
    Source,
}

/// The file a build starts from: a project manifest or a bare source file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub path: String,
    pub kind: EntryKind,
}

impl EntryPoint {
    pub fn manifest(path: impl Into<String>) -> Self {
        EntryPoint {
            path: path.into(),
            kind: EntryKind::Manifest,
        }
    }

    pub fn source(path: impl Into<String>) -> Self {
        EntryPoint {
            path: path.into(),
            kind: EntryKind::Source,
        }
    }

    /// File stem of the entry point, used to name the produced binary.
    pub fn name(&self) -> String {
        Path::new(&self.path)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("program")
            .to_string()
    }
}

/// A staged, run-private copy of a project on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    pub run_id: RunId,
    pub root: PathBuf,
    pub files: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Workspace {
    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join(crate::constants::ARTIFACT_DIR)
    }
}

/// Output of a successful build, consumed by the run phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub id: Uuid,
    pub name: String,
    pub dir: PathBuf,
    /// Transcript of the build that produced the artifact, warnings included.
    pub build_output: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Building,
    BuildFailed,
    Built,
    Running,
    Succeeded,
    RuntimeFailed,
    TimedOut,
    Cancelled,
    Faulted,
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Pending
    }
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::BuildFailed
                | RunState::Succeeded
                | RunState::RuntimeFailed
                | RunState::TimedOut
                | RunState::Cancelled
                | RunState::Faulted
        )
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        match (self, next) {
            (Pending, Building) => true,
            (Building, BuildFailed | Built | TimedOut) => true,
            (Built, Running) => true,
            (Running, Succeeded | RuntimeFailed | TimedOut) => true,
            (Pending | Building | Built | Running, Cancelled | Faulted) => true,
            _ => false,
        }
    }
}
