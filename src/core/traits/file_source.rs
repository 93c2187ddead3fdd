use uuid::Uuid;

use crate::core::domain::{ProjectFileSet, ProjectId, SourceFile};

/// Metadata of a stored project file as exposed by the storage service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_id: Uuid,
    pub file_name: String,
    /// Path relative to the project root, including the file name.
    pub relative_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),
    #[error("file {0} not found")]
    FileNotFound(Uuid),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Read-only view of the project file storage.
#[mockall::automock]
#[async_trait::async_trait]
pub trait FileSource: std::fmt::Debug + Send + Sync {
    async fn list_files(&self, project_id: ProjectId) -> Result<Vec<FileMetadata>, SourceError>;

    async fn read(&self, file_id: Uuid) -> Result<Vec<u8>, SourceError>;
}

#[tracing::instrument(skip(source))]
pub async fn load_file_set(
    source: &dyn FileSource,
    project_id: ProjectId,
) -> Result<ProjectFileSet, SourceError> {
    let listing = source.list_files(project_id).await?;
    tracing::debug!(files = listing.len(), "Loading project files");

    let mut files = ProjectFileSet::new();
    for meta in listing {
        let content = source.read(meta.file_id).await?;
        files.push(SourceFile::new(meta.relative_path, content));
    }
    Ok(files)
}
