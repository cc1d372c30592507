//! Stage execution.
//!
//! A [`StageExecutor`] runs one action against the artifacts handed to it and
//! reports a [`StageResult`]. [`ShellExecutor`] runs build commands locally
//! through `sh -c`, one command at a time, stopping at the first failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use berth_core::pipeline::{Action, ActionKind, ArtifactName};
use berth_core::BuildSpec;
use tokio::process::Command;
use tracing::{debug, info};

/// Files carried between stages, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl Artifact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_string(), contents.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Artifacts available to an action, by name.
pub type ArtifactSet = BTreeMap<ArtifactName, Artifact>;

/// Result of a stage execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StageResult {
    pub fn succeeded(stage_name: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            success: true,
        }
    }

    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// What one action produced.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub result: StageResult,

    /// Output artifacts, keyed by the names the action declares.
    pub artifacts: ArtifactSet,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run `action` of `stage` with its declared inputs.
    ///
    /// A non-passing [`StageResult`] is a stage failure. `Err` means the
    /// action could not be run at all.
    async fn execute(&self, stage: &str, action: &Action, inputs: &ArtifactSet) -> anyhow::Result<ActionOutcome>;
}

/// Runs build commands in a local working directory.
///
/// The directory stands in for the fetched source: source actions accept it
/// as is, and deploy actions pass their input through to the publisher.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    workdir: PathBuf,
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: None,
        }
    }

    /// Per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run every command of `spec` in phase order.
    pub async fn run_spec(&self, stage_name: &str, spec: &BuildSpec) -> anyhow::Result<StageResult> {
        let start = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();

        for (phase, command) in spec.commands() {
            debug!(stage = %stage_name, phase = %phase, command = %command, "Running command");
            let result = self.run_command(stage_name, command).await?;
            stdout.push_str(&result.stdout);
            stderr.push_str(&result.stderr);
            if !result.passed() {
                return Ok(StageResult {
                    stage_name: stage_name.to_string(),
                    exit_code: result.exit_code,
                    stdout,
                    stderr,
                    duration_ms: start.elapsed().as_millis() as u64,
                    success: false,
                });
            }
        }

        Ok(StageResult {
            stage_name: stage_name.to_string(),
            exit_code: 0,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
            success: true,
        })
    }

    /// Execute one shell command and capture its output.
    pub async fn run_command(&self, stage_name: &str, command: &str) -> anyhow::Result<StageResult> {
        let start = Instant::now();

        if command.trim().is_empty() {
            anyhow::bail!("Stage {} has empty command", stage_name);
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn command for stage {}", stage_name))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    anyhow::anyhow!(
                        "Stage {} timed out after {} seconds",
                        stage_name,
                        limit.as_secs()
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(StageResult {
            stage_name: stage_name.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }

    fn collect(&self, base_directory: &str) -> anyhow::Result<Artifact> {
        let root = self.workdir.join(base_directory);
        let mut artifact = Artifact::new();
        collect_files(&root, &root, &mut artifact)
            .with_context(|| format!("Failed to collect build output from {}", root.display()))?;
        Ok(artifact)
    }
}

fn collect_files(root: &Path, dir: &Path, artifact: &mut Artifact) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, artifact)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| path.to_string_lossy().to_string());
            artifact.files.insert(relative, std::fs::read(&path)?);
        }
    }
    Ok(())
}

#[async_trait]
impl StageExecutor for ShellExecutor {
    async fn execute(&self, stage: &str, action: &Action, inputs: &ArtifactSet) -> anyhow::Result<ActionOutcome> {
        match action.kind() {
            ActionKind::Source(source) => {
                info!(stage = %stage, source = %source.display_name(), "Using local checkout as source");
                Ok(ActionOutcome {
                    result: StageResult::succeeded(stage),
                    artifacts: action
                        .outputs()
                        .iter()
                        .map(|name| (name.clone(), Artifact::new()))
                        .collect(),
                })
            }
            ActionKind::Build(project) => {
                let result = self.run_spec(stage, project.spec()).await?;
                let mut artifacts = ArtifactSet::new();
                if result.passed() {
                    if let (Some(output), Some(spec_artifacts)) =
                        (action.outputs().first(), project.spec().build_artifacts())
                    {
                        artifacts.insert(output.clone(), self.collect(&spec_artifacts.base_directory)?);
                    }
                }
                Ok(ActionOutcome { result, artifacts })
            }
            ActionKind::Deploy => {
                let missing: Vec<&str> = action
                    .inputs()
                    .iter()
                    .filter(|name| !inputs.contains_key(*name))
                    .map(ArtifactName::as_str)
                    .collect();
                if !missing.is_empty() {
                    anyhow::bail!("Deploy action {} is missing inputs {:?}", action.name(), missing);
                }
                Ok(ActionOutcome {
                    result: StageResult::succeeded(stage),
                    artifacts: ArtifactSet::new(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::BuildPhase;

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult {
            stage_name: "Build".to_string(),
            exit_code: 0,
            stdout: "".to_string(),
            stderr: "".to_string(),
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_stage_result_failed() {
        let result = StageResult {
            stage_name: "Build".to_string(),
            exit_code: 1,
            stdout: "".to_string(),
            stderr: "error".to_string(),
            duration_ms: 100,
            success: false,
        };
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(dir.path());
        let result = executor.run_command("echo_test", "echo hello").await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(dir.path());
        let result = executor.run_command("false_test", "false").await.unwrap();
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(dir.path());
        assert!(executor.run_command("empty", "  ").await.is_err());
    }

    #[tokio::test]
    async fn test_spec_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(dir.path());
        let spec = BuildSpec::new()
            .phase(BuildPhase::PreBuild, ["echo first"])
            .phase(BuildPhase::Build, ["exit 3", "echo never"]);
        let result = executor.run_spec("Build", &spec).await.unwrap();
        assert!(!result.passed());
        assert_eq!(result.exit_code, 3);
        assert!(result.stdout.contains("first"));
        assert!(!result.stdout.contains("never"));
    }

    #[tokio::test]
    async fn test_commands_run_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("build")).unwrap();
        let executor = ShellExecutor::new(dir.path()).with_timeout(Duration::from_secs(30));
        let spec = BuildSpec::new()
            .phase(BuildPhase::Build, ["echo '<html></html>' > build/index.html"])
            .artifacts("build", &["**/*"]);
        let result = executor.run_spec("Build", &spec).await.unwrap();
        assert!(result.passed(), "stderr: {}", result.stderr);

        let artifact = executor.collect("build").unwrap();
        assert_eq!(
            artifact.files.get("index.html").map(|b| String::from_utf8_lossy(b).trim().to_string()),
            Some("<html></html>".to_string())
        );
    }
}
