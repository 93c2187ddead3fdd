use std::{path::Path, time::Duration};

use crate::{
    config::{RunnerConfig, SingleFileToolchain},
    core::{
        domain::{Artifact, EntryPoint, Workspace},
        traits::executor::{BuildError, Executor, PhaseContext, RunError, RunResult},
    },
    native::{
        diagnostics,
        executor::{build_outcome, build_vars, prepare_artifact, render, run_artifact},
        process::supervise,
    },
};

/// Compiles every source file of a manifest-less submission into one binary
/// and runs it in a child process.
///
/// Unlike project builds, compiler output is parsed into structured
/// diagnostics. A failure whose only errors are entry-point codes is
/// reported as [`BuildError::NoEntryPoint`].
#[derive(Clone, Debug)]
pub struct SingleFileExecutor {
    toolchain: SingleFileToolchain,
    limit: usize,
    drain_grace: Duration,
}

impl SingleFileExecutor {
    pub fn new(toolchain: SingleFileToolchain, limit: usize, drain_grace: Duration) -> Self {
        SingleFileExecutor {
            toolchain,
            limit,
            drain_grace,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(
            config.single_file.clone(),
            config.max_output_bytes,
            config.drain_grace(),
        )
    }

    fn sources(&self, workspace: &Workspace) -> Vec<String> {
        workspace
            .files
            .iter()
            .filter(|path| {
                Path::new(path)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| {
                        self.toolchain
                            .source_extensions
                            .iter()
                            .any(|candidate| candidate.eq_ignore_ascii_case(ext))
                    })
            })
            .cloned()
            .collect()
    }

    fn classify(&self, output: String) -> BuildError {
        let diagnostics = diagnostics::parse(&output);
        if diagnostics.is_empty() {
            return BuildError::Failed { output };
        }

        let missing_entry = diagnostics.iter().all(|diagnostic| {
            self.toolchain
                .entry_point_codes
                .iter()
                .any(|code| code == &diagnostic.code)
        });
        if missing_entry {
            let msg = diagnostics
                .iter()
                .map(|diagnostic| diagnostic.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return BuildError::NoEntryPoint { msg };
        }

        BuildError::Diagnostics {
            diagnostics,
            output,
        }
    }
}

#[async_trait::async_trait]
impl Executor for SingleFileExecutor {
    #[tracing::instrument(skip_all, fields(run_id = %workspace.run_id, entry = %entry_point.path))]
    async fn build(
        &self,
        workspace: &Workspace,
        entry_point: &EntryPoint,
        ctx: &PhaseContext,
    ) -> Result<Artifact, BuildError> {
        let sources = self.sources(workspace);
        if sources.is_empty() {
            return Err(BuildError::NoEntryPoint {
                msg: "no source files to compile".to_string(),
            });
        }

        let vars = build_vars(workspace, entry_point, sources);
        let artifact = prepare_artifact(workspace, entry_point).await?;
        let spec = render(&self.toolchain.build, &vars, &workspace.root, &ctx.environment)
            .map_err(|msg| BuildError::Internal { msg })?;

        let supervised = supervise(&spec, ctx, self.limit, self.drain_grace)
            .await
            .map_err(|e| BuildError::Internal {
                msg: format!("failed to start `{}`: {}", spec.program, e),
            })?;

        match build_outcome(supervised) {
            Ok(build_output) => Ok(Artifact {
                build_output,
                ..artifact
            }),
            Err(BuildError::Failed { output }) => Err(self.classify(output)),
            Err(e) => Err(e),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CommandTemplate,
        core::domain::{ProjectFileSet, RunId},
        workspace::{Materializer, StagedWorkspace},
    };
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    // Fake compiler: concatenates the sources into a shell script, or prints
    // a compiler-style diagnostic for sources containing a marker.
    const FAKE_CSC: &str = r#"
out="$1"; shift
for src in "$@"; do
    if grep -q MISSING_SEMICOLON "$src"; then
        echo "$src(3,5): error CS1002: ; expected"
        echo "$src(3,5): error CS1002: ; expected"
        echo "Compilation failed: 1 error(s), 0 warnings"
        exit 1
    fi
    if grep -q NO_MAIN "$src"; then
        echo "error CS5001: Program does not contain a static 'Main' method suitable for an entry point"
        exit 1
    fi
    if grep -q GARBAGE "$src"; then
        echo "internal compiler failure" >&2
        exit 2
    fi
done
cat "$@" > "$out"
"#;

    fn executor() -> SingleFileExecutor {
        SingleFileExecutor::new(
            SingleFileToolchain {
                build: CommandTemplate::new(["sh", "-c", FAKE_CSC, "csc", "{out}/{name}.sh", "{sources}"]),
                run: CommandTemplate::new(["sh", "{out}/{name}.sh"]),
                source_extensions: vec!["cs".to_string()],
                entry_point_codes: vec!["CS5001".to_string()],
            },
            1024 * 1024,
            Duration::from_secs(1),
        )
    }

    async fn stage(files: ProjectFileSet) -> (tempfile::TempDir, StagedWorkspace) {
        let tmp = tempfile::tempdir().unwrap();
        let materializer = Arc::new(Materializer::new(tmp.path(), 1, Duration::ZERO));
        let staged = materializer.stage(RunId::new_v4(), &files).await.unwrap();
        (tmp, staged)
    }

    fn ctx() -> PhaseContext {
        PhaseContext::new(Duration::from_secs(5), CancellationToken::new())
    }

    async fn build(files: ProjectFileSet) -> Result<Artifact, BuildError> {
        let (_tmp, staged) = stage(files).await;
        executor()
            .build(staged.workspace(), &EntryPoint::source("Program.cs"), &ctx())
            .await
    }

    #[tokio::test]
    async fn test_compiles_all_sources_together() {
        let (_tmp, staged) = stage(
            ProjectFileSet::new()
                .with("Program.cs", "echo from program\n")
                .with("lib/Util.cs", "echo from util\n")
                .with("README.md", "echo ignored\n"),
        )
        .await;
        let workspace = staged.workspace();
        let executor = executor();

        let artifact = executor
            .build(workspace, &EntryPoint::source("Program.cs"), &ctx())
            .await
            .unwrap();
        let result = executor.run(workspace, &artifact, &ctx()).await.unwrap();

        assert_eq!(result.output, "from program\nfrom util");
    }

    #[tokio::test]
    async fn test_compiler_errors_become_diagnostics() {
        let result = build(ProjectFileSet::new().with("Program.cs", "MISSING_SEMICOLON")).await;

        match result {
            Err(BuildError::Diagnostics {
                diagnostics,
                output,
            }) => {
                assert_eq!(diagnostics.len(), 1);
                assert_eq!(diagnostics[0].code, "CS1002");
                assert_eq!(diagnostics[0].start_line, Some(3));
                assert!(output.contains("Compilation failed"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let result = build(ProjectFileSet::new().with("Program.cs", "NO_MAIN")).await;

        match result {
            Err(BuildError::NoEntryPoint { msg }) => assert!(msg.contains("Main")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unparseable_failure_keeps_raw_output() {
        let result = build(ProjectFileSet::new().with("Program.cs", "GARBAGE")).await;

        match result {
            Err(BuildError::Failed { output }) => assert_eq!(output, "internal compiler failure"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_sources_is_no_entry_point() {
        let result = build(ProjectFileSet::new().with("notes.txt", "hello")).await;

        assert!(matches!(result, Err(BuildError::NoEntryPoint { .. })));
    }

    #[tokio::test]
    async fn test_runtime_crash_keeps_stderr() {
        let (_tmp, staged) = stage(ProjectFileSet::new().with(
            "Program.cs",
            "echo 'Unhandled exception. System.Exception: Test exception' >&2; exit 134",
        ))
        .await;
        let workspace = staged.workspace();
        let executor = executor();
        let artifact = executor
            .build(workspace, &EntryPoint::source("Program.cs"), &ctx())
            .await
            .unwrap();

        match executor.run(workspace, &artifact, &ctx()).await {
            Err(RunError::Crash { result }) => {
                assert_eq!(result.status, 134);
                assert!(result.stderr.contains("Test exception"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
