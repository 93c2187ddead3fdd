//! Local implementations of the project file storage boundary.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tokio::fs;
use uuid::Uuid;

use crate::core::{
    domain::{ProjectFileSet, ProjectId},
    traits::file_source::{FileMetadata, FileSource, SourceError},
};

/// Directories never shipped to the runner: build outputs and VCS metadata.
const SKIPPED_DIRS: [&str; 2] = ["bin", "obj"];

/// Serves projects straight from directories on disk.
#[derive(Debug, Default)]
pub struct DirectorySource {
    projects: DashMap<ProjectId, PathBuf>,
    files: DashMap<Uuid, PathBuf>,
    ids: DashMap<PathBuf, Uuid>,
}

impl DirectorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: AsRef<Path>>(&self, dir: T) -> ProjectId {
        let project_id = Uuid::new_v4();
        self.projects.insert(project_id, dir.as_ref().into());
        project_id
    }

    fn file_id(&self, path: &Path) -> Uuid {
        *self.ids.entry(path.to_path_buf()).or_insert_with(|| {
            let id = Uuid::new_v4();
            self.files.insert(id, path.to_path_buf());
            id
        })
    }
}

#[async_trait::async_trait]
impl FileSource for DirectorySource {
    async fn list_files(&self, project_id: ProjectId) -> Result<Vec<FileMetadata>, SourceError> {
        let root = self
            .projects
            .get(&project_id)
            .map(|entry| entry.value().clone())
            .ok_or(SourceError::ProjectNotFound(project_id))?;

        let mut found = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| SourceError::Storage(format!("{}: {}", dir.display(), e)))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SourceError::Storage(format!("{}: {}", dir.display(), e)))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| SourceError::Storage(e.to_string()))?;

                if file_type.is_dir() {
                    if !SKIPPED_DIRS.contains(&name.as_str()) {
                        pending.push(entry.path());
                    }
                } else if file_type.is_file() {
                    found.push(entry.path());
                }
            }
        }
        found.sort();

        Ok(found
            .into_iter()
            .filter_map(|path| {
                let relative = path.strip_prefix(&root).ok()?.to_string_lossy().replace('\\', "/");
                let file_name = path.file_name()?.to_string_lossy().into_owned();
                Some(FileMetadata {
                    file_id: self.file_id(&path),
                    file_name,
                    relative_path: relative,
                })
            })
            .collect())
    }

    async fn read(&self, file_id: Uuid) -> Result<Vec<u8>, SourceError> {
        let path = self
            .files
            .get(&file_id)
            .map(|entry| entry.value().clone())
            .ok_or(SourceError::FileNotFound(file_id))?;

        fs::read(&path)
            .await
            .map_err(|e| SourceError::Storage(format!("{}: {}", path.display(), e)))
    }
}

/// Keeps projects in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    projects: DashMap<ProjectId, Vec<FileMetadata>>,
    contents: DashMap<Uuid, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_id: ProjectId, files: &ProjectFileSet) {
        let listing = files
            .iter()
            .map(|file| {
                let file_id = Uuid::new_v4();
                self.contents.insert(file_id, file.content.clone());
                FileMetadata {
                    file_id,
                    file_name: file
                        .path
                        .rsplit(['/', '\\'])
                        .next()
                        .unwrap_or(&file.path)
                        .to_string(),
                    relative_path: file.path.clone(),
                }
            })
            .collect();

        if let Some(previous) = self.projects.insert(project_id, listing) {
            for meta in previous {
                self.contents.remove(&meta.file_id);
            }
        }
    }
}

#[async_trait::async_trait]
impl FileSource for MemorySource {
    async fn list_files(&self, project_id: ProjectId) -> Result<Vec<FileMetadata>, SourceError> {
        self.projects
            .get(&project_id)
            .map(|entry| entry.value().clone())
            .ok_or(SourceError::ProjectNotFound(project_id))
    }

    async fn read(&self, file_id: Uuid) -> Result<Vec<u8>, SourceError> {
        self.contents
            .get(&file_id)
            .map(|entry| entry.value().clone())
            .ok_or(SourceError::FileNotFound(file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::file_source::load_file_set;

    #[tokio::test]
    async fn test_directory_source_walks_project() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src/Models")).unwrap();
        std::fs::create_dir_all(root.join("bin/Debug")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("App.csproj"), "<Project/>").unwrap();
        std::fs::write(root.join("src/Models/User.cs"), "class User {}").unwrap();
        std::fs::write(root.join("bin/Debug/App.dll"), "binary").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();

        let source = DirectorySource::new();
        let project_id = source.register(root);
        let files = load_file_set(&source, project_id).await.unwrap();

        assert_eq!(
            files.paths().collect::<Vec<_>>(),
            vec!["App.csproj", "src/Models/User.cs"]
        );
    }

    #[tokio::test]
    async fn test_directory_source_ids_are_stable() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Program.cs"), "class P {}").unwrap();

        let source = DirectorySource::new();
        let project_id = source.register(tmp.path());
        let first = source.list_files(project_id).await.unwrap();
        let second = source.list_files(project_id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.read(first[0].file_id).await.unwrap(), b"class P {}");
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let source = DirectorySource::new();

        assert!(matches!(
            source.list_files(Uuid::new_v4()).await,
            Err(SourceError::ProjectNotFound(_))
        ));
        assert!(matches!(
            source.read(Uuid::new_v4()).await,
            Err(SourceError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_source_round_trip() {
        let source = MemorySource::new();
        let project_id = Uuid::new_v4();
        let files = ProjectFileSet::new()
            .with("Program.cs", "class P {}")
            .with("lib/Util.cs", "class U {}");
        source.insert(project_id, &files);

        let listing = source.list_files(project_id).await.unwrap();
        assert_eq!(listing[1].file_name, "Util.cs");
        assert_eq!(load_file_set(&source, project_id).await.unwrap(), files);
    }
}
