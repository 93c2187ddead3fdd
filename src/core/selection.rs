use std::path::Path;

use crate::{
    config::Isolation,
    core::domain::{EntryKind, EntryPoint, ProjectFileSet},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    NativeProcess,
    Container,
    SingleFile,
}

/// File stem that marks the conventional entry source.
const PROGRAM_STEM: &str = "Program";

fn has_extension(path: &str, extensions: &[String]) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|candidate| candidate.eq_ignore_ascii_case(ext)))
}

/// Picks the file a build starts from.
///
/// Precedence: the explicitly requested file, then the first project
/// manifest, then a source whose stem is `Program`, then the first source.
/// An explicit path must name a file of the set.
pub fn resolve_entry_point(
    files: &ProjectFileSet,
    explicit: Option<&str>,
    manifest_extensions: &[String],
    source_extensions: &[String],
) -> Option<EntryPoint> {
    if let Some(path) = explicit {
        if !files.contains(path) {
            return None;
        }
        return Some(if has_extension(path, manifest_extensions) {
            EntryPoint::manifest(path)
        } else {
            EntryPoint::source(path)
        });
    }

    if let Some(manifest) = files.paths().find(|path| has_extension(path, manifest_extensions)) {
        return Some(EntryPoint::manifest(manifest));
    }

    let sources: Vec<&str> = files
        .paths()
        .filter(|path| has_extension(path, source_extensions))
        .collect();
    let program = sources.iter().find(|path| {
        Path::new(path)
            .file_stem()
            .is_some_and(|stem| stem == PROGRAM_STEM)
    });
    program
        .or_else(|| sources.first())
        .map(|path| EntryPoint::source(*path))
}

/// Manifest entries go to the configured isolation, bare sources are
/// compiled by the single-file backend.
pub fn select_backend(entry_point: &EntryPoint, isolation: Isolation) -> BackendKind {
    match (entry_point.kind, isolation) {
        (EntryKind::Manifest, Isolation::Process) => BackendKind::NativeProcess,
        (EntryKind::Manifest, Isolation::Container) => BackendKind::Container,
        (EntryKind::Source, _) => BackendKind::SingleFile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn resolve(files: &ProjectFileSet, explicit: Option<&str>) -> Option<EntryPoint> {
        resolve_entry_point(files, explicit, &exts(&["csproj"]), &exts(&["cs"]))
    }

    #[test]
    fn test_manifest_wins_over_sources() {
        let files = ProjectFileSet::new()
            .with("Program.cs", "")
            .with("src/App.csproj", "")
            .with("Other.csproj", "");

        assert_eq!(resolve(&files, None), Some(EntryPoint::manifest("src/App.csproj")));
    }

    #[test]
    fn test_program_stem_wins_over_first_source() {
        let files = ProjectFileSet::new()
            .with("Helpers.cs", "")
            .with("src/Program.cs", "");

        assert_eq!(resolve(&files, None), Some(EntryPoint::source("src/Program.cs")));
    }

    #[test]
    fn test_first_source_is_the_fallback() {
        let files = ProjectFileSet::new()
            .with("notes.txt", "")
            .with("Main.cs", "")
            .with("Util.cs", "");

        assert_eq!(resolve(&files, None), Some(EntryPoint::source("Main.cs")));
    }

    #[test]
    fn test_explicit_entry_point() {
        let files = ProjectFileSet::new()
            .with("App.csproj", "")
            .with("Tool.cs", "");

        assert_eq!(resolve(&files, Some("Tool.cs")), Some(EntryPoint::source("Tool.cs")));
        assert_eq!(
            resolve(&files, Some("App.csproj")),
            Some(EntryPoint::manifest("App.csproj"))
        );
        assert_eq!(resolve(&files, Some("Missing.cs")), None);
    }

    #[test]
    fn test_no_candidates() {
        let files = ProjectFileSet::new().with("README.md", "");
        assert_eq!(resolve(&files, None), None);
    }

    #[test]
    fn test_backend_selection() {
        let manifest = EntryPoint::manifest("App.csproj");
        let source = EntryPoint::source("Program.cs");

        assert_eq!(select_backend(&manifest, Isolation::Process), BackendKind::NativeProcess);
        assert_eq!(select_backend(&manifest, Isolation::Container), BackendKind::Container);
        assert_eq!(select_backend(&source, Isolation::Container), BackendKind::SingleFile);
    }
}
