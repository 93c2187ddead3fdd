// Runner configuration: scratch storage, limits and toolchain commands
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    CONFIG_PATH_ENV, DEFAULT_CLEANUP_BACKOFF_MS, DEFAULT_CLEANUP_RETRIES, DEFAULT_CONFIG_PATH,
    DEFAULT_DRAIN_GRACE_MS, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_MS,
};

/// How project builds (manifest-based) are isolated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Process,
    Container,
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Isolation::Process),
            "container" | "docker" => Ok(Isolation::Container),
            other => bail!("Unknown isolation mode: {}", other),
        }
    }
}

/// An argv template. Placeholders: `{workspace}`, `{manifest}`, `{entry}`,
/// `{name}`, `{out}`; an argument that is exactly `{sources}` expands to one
/// argument per source file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandTemplate(args.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.first().is_none_or(|program| program.trim().is_empty())
    }

    /// Expands the template into `(program, args)`.
    pub fn render(&self, vars: &TemplateVars) -> Option<(String, Vec<String>)> {
        let mut argv = Vec::with_capacity(self.0.len() + vars.sources.len());
        for arg in &self.0 {
            if arg == "{sources}" {
                argv.extend(vars.sources.iter().cloned());
            } else {
                argv.push(vars.substitute(arg));
            }
        }

        let mut argv = argv.into_iter();
        let program = argv.next()?;
        Some((program, argv.collect()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateVars {
    pub workspace: String,
    pub manifest: String,
    pub entry: String,
    pub name: String,
    pub out: String,
    pub sources: Vec<String>,
}

impl TemplateVars {
    fn substitute(&self, arg: &str) -> String {
        arg.replace("{workspace}", &self.workspace)
            .replace("{manifest}", &self.manifest)
            .replace("{entry}", &self.entry)
            .replace("{name}", &self.name)
            .replace("{out}", &self.out)
    }
}

/// Build and run commands for manifest-based projects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    pub build: CommandTemplate,
    pub run: CommandTemplate,
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain {
            build: CommandTemplate::new([
                "dotnet",
                "build",
                "{manifest}",
                "-o",
                "{out}",
                "-nologo",
                "-clp:NoSummary",
            ]),
            run: CommandTemplate::new(["dotnet", "{out}/{name}.dll"]),
        }
    }
}

/// Compiler and runner for submissions without a project manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleFileToolchain {
    pub build: CommandTemplate,
    pub run: CommandTemplate,
    pub source_extensions: Vec<String>,
    /// Compiler diagnostic codes that mean "no entry point found".
    pub entry_point_codes: Vec<String>,
}

impl Default for SingleFileToolchain {
    fn default() -> Self {
        SingleFileToolchain {
            build: CommandTemplate::new(["csc", "-nologo", "-out:{out}/{name}.exe", "{sources}"]),
            run: CommandTemplate::new(["mono", "{out}/{name}.exe"]),
            source_extensions: vec!["cs".to_string()],
            entry_point_codes: vec!["CS5001".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub pids_limit: i64,
    pub tmpfs_size_mb: u32,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        ContainerSettings {
            image: "mcr.microsoft.com/dotnet/sdk:8.0".to_string(),
            memory_limit_mb: 512,
            cpu_limit: 0.5,
            pids_limit: 256,
            tmpfs_size_mb: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub scratch_root: PathBuf,
    pub default_timeout_ms: u64,
    pub isolation: Isolation,
    pub cleanup_retries: u32,
    pub cleanup_backoff_ms: u64,
    pub max_output_bytes: usize,
    pub drain_grace_ms: u64,
    pub manifest_extensions: Vec<String>,
    pub project: Toolchain,
    pub single_file: SingleFileToolchain,
    pub container: ContainerSettings,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            scratch_root: std::env::temp_dir().join("coderunner"),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            isolation: Isolation::default(),
            cleanup_retries: DEFAULT_CLEANUP_RETRIES,
            cleanup_backoff_ms: DEFAULT_CLEANUP_BACKOFF_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            manifest_extensions: vec!["csproj".to_string()],
            project: Toolchain::default(),
            single_file: SingleFileToolchain::default(),
            container: ContainerSettings::default(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: RunnerConfig =
            serde_json::from_str(content).context("Failed to parse runner config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$CODERUNNER_CONFIG` or `config/runner.json`, falling back
    /// to defaults when no file exists, then apply environment overrides.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let config = if path.exists() {
            Self::load(&path)?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `CODERUNNER_*` overrides read through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(root) = lookup("CODERUNNER_SCRATCH_ROOT") {
            self.scratch_root = PathBuf::from(root);
        }
        if let Some(timeout) = lookup("CODERUNNER_TIMEOUT_MS") {
            self.default_timeout_ms = timeout
                .parse()
                .with_context(|| format!("Invalid CODERUNNER_TIMEOUT_MS: {}", timeout))?;
        }
        if let Some(isolation) = lookup("CODERUNNER_ISOLATION") {
            self.isolation = isolation.parse()?;
        }
        if let Some(image) = lookup("CODERUNNER_IMAGE") {
            self.container.image = image;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            bail!("default_timeout_ms must be greater than zero");
        }
        if self.max_output_bytes == 0 {
            bail!("max_output_bytes must be greater than zero");
        }
        for (name, template) in [
            ("project.build", &self.project.build),
            ("project.run", &self.project.run),
            ("single_file.build", &self.single_file.build),
            ("single_file.run", &self.single_file.run),
        ] {
            if template.is_empty() {
                bail!("Command template {} is empty", name);
            }
        }
        if self.container.cpu_limit <= 0.0 {
            bail!("container.cpu_limit must be positive");
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunnerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.container.memory_limit_mb, 512);
        assert_eq!(config.isolation, Isolation::Process);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RunnerConfig::parse(
            r#"{
                "default_timeout_ms": 5000,
                "isolation": "container",
                "container": { "image": "sdk:custom" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.isolation, Isolation::Container);
        assert_eq!(config.container.image, "sdk:custom");
        assert_eq!(config.container.memory_limit_mb, 512);
        assert_eq!(config.project, Toolchain::default());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(RunnerConfig::parse(r#"{"default_timeout_ms": 0}"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CODERUNNER_SCRATCH_ROOT", "/var/tmp/runs"),
            ("CODERUNNER_TIMEOUT_MS", "1500"),
            ("CODERUNNER_ISOLATION", "docker"),
        ]);

        let config = RunnerConfig::default()
            .with_overrides(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();

        assert_eq!(config.scratch_root, PathBuf::from("/var/tmp/runs"));
        assert_eq!(config.default_timeout_ms, 1500);
        assert_eq!(config.isolation, Isolation::Container);
    }

    #[test]
    fn test_invalid_override_is_an_error() {
        let result = RunnerConfig::default().with_overrides(|key| {
            (key == "CODERUNNER_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_render_expands_placeholders_and_sources() {
        let template = CommandTemplate::new(["csc", "-out:{out}/{name}.exe", "{sources}", "-v"]);
        let vars = TemplateVars {
            out: "/ws/.out".to_string(),
            name: "Program".to_string(),
            sources: vec!["Program.cs".to_string(), "lib/Util.cs".to_string()],
            ..Default::default()
        };

        let (program, args) = template.render(&vars).unwrap();

        assert_eq!(program, "csc");
        assert_eq!(
            args,
            vec!["-out:/ws/.out/Program.exe", "Program.cs", "lib/Util.cs", "-v"]
        );
    }

    #[test]
    fn test_render_empty_template() {
        assert!(CommandTemplate(vec![]).render(&TemplateVars::default()).is_none());
        assert!(CommandTemplate(vec![]).is_empty());
    }
}
