use std::{
    collections::HashMap,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;

use crate::core::{
    traits::executor::{PhaseContext, RunError, RunResult},
    transcript::{Stream, Transcript},
};

/// Pipe read size. Output is consumed in chunks of at most this many bytes so
/// a stream without newlines never grows past the transcript cap.
const READ_CHUNK: usize = 8 * 1024;

/// A fully rendered command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    Exited { status: i64 },
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct Supervised {
    pub exit: Exit,
    pub transcript: Transcript,
    pub elapsed: Duration,
}

impl Supervised {
    pub fn to_run_result(&self) -> RunResult {
        let status = match self.exit {
            Exit::Exited { status } => status,
            Exit::TimedOut | Exit::Cancelled => -1,
        };
        RunResult {
            status,
            output: self.transcript.combined(),
            stdout: self.transcript.stdout(),
            stderr: self.transcript.stderr(),
            execution_time_ms: self.elapsed.as_millis() as u64,
        }
    }

    /// Maps the exit of a run phase onto the executor outcome.
    pub fn into_run_outcome(self) -> Result<RunResult, RunError> {
        let result = self.to_run_result();
        match self.exit {
            Exit::Exited { status: 0 } => Ok(result),
            Exit::Exited { .. } => Err(RunError::Crash { result }),
            Exit::TimedOut => Err(RunError::TimedOut { result }),
            Exit::Cancelled => Err(RunError::Cancelled { result }),
        }
    }
}

/// Runs `spec` to completion, timeout or cancellation, whichever comes first.
///
/// The child leads its own process group; the whole group is SIGKILLed once
/// the outcome is decided so that no grandchild outlives the phase. Both pipes
/// are read in bounded chunks into a shared transcript; output past the cap is
/// read and discarded so the child never blocks on a full pipe. The reader
/// gets `drain_grace` after the kill to collect what is left.
#[tracing::instrument(skip_all, fields(program = %spec.program))]
pub async fn supervise(
    spec: &ProcessSpec,
    ctx: &PhaseContext,
    limit: usize,
    drain_grace: Duration,
) -> std::io::Result<Supervised> {
    if ctx.cancel.is_cancelled() {
        return Ok(Supervised {
            exit: Exit::Cancelled,
            transcript: Transcript::with_limit(limit),
            elapsed: Duration::ZERO,
        });
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();
    if let Some(pid) = pid {
        ctx.process.set(pid.to_string());
        tracing::debug!(pid, "Process started");
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

    let transcript = Arc::new(Mutex::new(Transcript::with_limit(limit)));
    let mut reader = tokio::spawn({
        let transcript = transcript.clone();
        async move {
            let out = ReaderStream::with_capacity(stdout, READ_CHUNK)
                .map(|chunk| (Stream::Stdout, chunk));
            let err = ReaderStream::with_capacity(stderr, READ_CHUNK)
                .map(|chunk| (Stream::Stderr, chunk));
            let mut chunks = out.merge(err);

            while let Some((stream, chunk)) = chunks.next().await {
                match chunk {
                    Ok(bytes) => {
                        if let Ok(mut transcript) = transcript.lock() {
                            transcript.push_chunk(stream, &bytes);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, ?stream, "Failed to read process output");
                    }
                }
            }
        }
    });

    let exit = tokio::select! {
        biased;
        status = child.wait() => Exit::Exited { status: exit_code(status?) },
        _ = ctx.cancel.cancelled() => Exit::Cancelled,
        _ = tokio::time::sleep(ctx.timeout) => Exit::TimedOut,
    };
    let elapsed = started.elapsed();

    if let Some(pid) = pid {
        kill_group(pid);
    }
    if !matches!(exit, Exit::Exited { .. }) {
        tracing::info!(?exit, pid, "Process terminated");
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "Process already gone");
        }
    }

    if tokio::time::timeout(drain_grace, &mut reader).await.is_err() {
        tracing::warn!("Output reader did not finish in time, dropping the rest");
        reader.abort();
    }
    ctx.process.clear();

    let mut transcript = match transcript.lock() {
        Ok(transcript) => transcript.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    transcript.flush();

    Ok(Supervised {
        exit,
        transcript,
        elapsed,
    })
}

fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as i64;
        }
    }
    -1
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
        }
    }

    fn ctx(timeout_ms: u64) -> PhaseContext {
        PhaseContext::new(Duration::from_millis(timeout_ms), CancellationToken::new())
    }

    async fn run(spec: &ProcessSpec, ctx: &PhaseContext) -> Supervised {
        supervise(spec, ctx, 1024 * 1024, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let out = run(&sh("echo Hello; echo oops >&2; echo World"), &ctx(5_000)).await;

        assert_eq!(out.exit, Exit::Exited { status: 0 });
        assert_eq!(out.transcript.stdout(), "Hello\nWorld");
        assert_eq!(out.transcript.stderr(), "oops");
        assert_eq!(out.transcript.combined().lines().count(), 3);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_crash() {
        let out = run(&sh("echo boom >&2; exit 3"), &ctx(5_000)).await;

        match out.into_run_outcome() {
            Err(RunError::Crash { result }) => {
                assert_eq!(result.status, 3);
                assert_eq!(result.stderr, "boom");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_the_process() {
        let started = Instant::now();
        let out = run(&sh("echo started; sleep 30"), &ctx(300)).await;

        assert_eq!(out.exit, Exit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.transcript.stdout(), "started");
    }

    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        // The background sleep keeps stdout open unless the group is killed.
        let started = Instant::now();
        let out = run(&sh("sleep 30 & sleep 30"), &ctx(300)).await;

        assert_eq!(out.exit, Exit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_wins_over_timeout() {
        let ctx = ctx(30_000);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let out = run(&sh("sleep 30"), &ctx).await;

        assert_eq!(out.exit, Exit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(ctx.process.get().is_none());
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_spawn() {
        let ctx = ctx(5_000);
        ctx.cancel.cancel();

        let out = run(&sh("echo should-not-run"), &ctx).await;

        assert_eq!(out.exit, Exit::Cancelled);
        assert!(out.transcript.combined().is_empty());
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let out = supervise(
            &sh("for i in 1 2 3 4 5 6 7 8 9; do echo line$i; done"),
            &ctx(5_000),
            20,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(out.transcript.is_truncated());
        assert!(out.transcript.stdout().ends_with(crate::constants::TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_output_without_newlines_is_capped() {
        let out = supervise(
            &sh("head -c 50000000 /dev/zero | tr '\\0' x; echo; echo done >&2"),
            &ctx(30_000),
            64 * 1024,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(out.exit, Exit::Exited { status: 0 });
        assert!(out.transcript.is_truncated());
        assert_eq!(out.transcript.buffered(), 0);
        assert_eq!(out.transcript.stdout(), crate::constants::TRUNCATION_MARKER);
        assert_eq!(out.transcript.stderr(), "done");
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_kept() {
        let out = run(&sh("printf 'no newline'"), &ctx(5_000)).await;
        assert_eq!(out.transcript.stdout(), "no newline");
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let mut spec = sh("echo $GREETING");
        spec.env.insert("GREETING".to_string(), "hi".to_string());

        let out = run(&spec, &ctx(5_000)).await;
        assert_eq!(out.transcript.stdout(), "hi");
    }

    #[tokio::test]
    async fn test_missing_program_is_an_io_error() {
        let spec = ProcessSpec {
            program: "definitely-not-a-real-binary-4711".to_string(),
            args: vec![],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
        };

        assert!(
            supervise(&spec, &ctx(1_000), 1024, Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
