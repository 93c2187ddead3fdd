use std::path::{Component, Path, PathBuf};

use crate::workspace::WorkspaceError;

/// Turns a user-supplied relative path into a normalized relative `PathBuf`
/// that cannot leave the workspace root. Both `/` and `\` separate segments.
pub fn sanitize(relative: &str) -> Result<PathBuf, WorkspaceError> {
    let reject = |reason: &str| WorkspaceError::PathTraversal {
        path: relative.to_string(),
        reason: reason.to_string(),
    };

    if relative.trim().is_empty() {
        return Err(reject("path is empty"));
    }
    if relative.contains('\0') {
        return Err(reject("path contains a NUL byte"));
    }

    let normalized = relative.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(reject("path is absolute"));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(segment) => {
                if segment.to_string_lossy().contains(':') {
                    return Err(reject("path contains a drive or stream specifier"));
                }
                clean.push(segment);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(reject("path contains `..`")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(reject("path is absolute"));
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(reject("path does not name a file"));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_nested_relative_paths() {
        assert_eq!(sanitize("Program.cs").unwrap(), PathBuf::from("Program.cs"));
        assert_eq!(
            sanitize("./src/Models/User.cs").unwrap(),
            PathBuf::from("src/Models/User.cs")
        );
        assert_eq!(
            sanitize("src\\Models\\User.cs").unwrap(),
            PathBuf::from("src/Models/User.cs")
        );
    }

    #[test]
    fn test_rejects_traversal() {
        for path in [
            "../escape.cs",
            "src/../../escape.cs",
            "src/..",
            "..\\escape.cs",
            "a/b/../../../c",
        ] {
            assert!(
                matches!(sanitize(path), Err(WorkspaceError::PathTraversal { .. })),
                "{} should be rejected",
                path
            );
        }
    }

    #[test]
    fn test_rejects_absolute_and_malformed() {
        for path in ["/etc/passwd", "\\windows\\system32", "C:/x.cs", "", "  ", ".", "./", "a\0b"] {
            assert!(sanitize(path).is_err(), "{:?} should be rejected", path);
        }
    }
}
