/// Directory inside a workspace that receives build artifacts.
pub const ARTIFACT_DIR: &str = ".out";

/// Mount point of the workspace inside build and run containers.
pub const CONTAINER_WORKDIR: &str = "/app";

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_CLEANUP_RETRIES: u32 = 3;
pub const DEFAULT_CLEANUP_BACKOFF_MS: u64 = 100;
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 1_000;

pub const DEFAULT_CONFIG_PATH: &str = "config/runner.json";
pub const CONFIG_PATH_ENV: &str = "CODERUNNER_CONFIG";

pub const TRUNCATION_MARKER: &str = "[output truncated]";

/// Label attached to every container started by the runner.
pub const RUN_ID_LABEL: &str = "coderunner.run-id";
