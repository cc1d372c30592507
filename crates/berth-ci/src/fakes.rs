//! Scripted executor and health check for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use berth_core::pipeline::Action;

use crate::executor::{ActionOutcome, Artifact, ArtifactSet, StageExecutor, StageResult};
use crate::rollout::{HealthCheck, HealthReport};

/// Passes every action unless told otherwise, and records what it ran.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    failures: HashMap<String, (i32, String)>,
    outputs: HashMap<String, Artifact>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `action` exit with `exit_code`.
    pub fn failing(mut self, action: &str, exit_code: i32, stderr: &str) -> Self {
        self.failures
            .insert(action.to_string(), (exit_code, stderr.to_string()));
        self
    }

    /// Contents for every output `action` declares.
    pub fn producing(mut self, action: &str, artifact: Artifact) -> Self {
        self.outputs.insert(action.to_string(), artifact);
        self
    }

    /// Names of the actions executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, stage: &str, action: &Action, _inputs: &ArtifactSet) -> anyhow::Result<ActionOutcome> {
        self.calls
            .lock()
            .map_err(|_| anyhow::anyhow!("call log poisoned"))?
            .push(action.name().to_string());

        if let Some((exit_code, stderr)) = self.failures.get(action.name()) {
            return Ok(ActionOutcome {
                result: StageResult {
                    stage_name: stage.to_string(),
                    exit_code: *exit_code,
                    stdout: String::new(),
                    stderr: stderr.clone(),
                    duration_ms: 0,
                    success: false,
                },
                artifacts: ArtifactSet::new(),
            });
        }

        let artifact = self.outputs.get(action.name()).cloned().unwrap_or_default();
        Ok(ActionOutcome {
            result: StageResult::succeeded(stage),
            artifacts: action
                .outputs()
                .iter()
                .map(|name| (name.clone(), artifact.clone()))
                .collect(),
        })
    }
}

/// Healthy except at the listed traffic percentages. Records every check.
#[derive(Debug, Default)]
pub struct ScriptedHealth {
    unhealthy_at: Vec<u8>,
    checks: Mutex<Vec<u8>>,
}

impl ScriptedHealth {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn failing_at(percent: u8) -> Self {
        Self {
            unhealthy_at: vec![percent],
            checks: Mutex::new(Vec::new()),
        }
    }

    /// Percentages checked so far, in order.
    pub fn checks(&self) -> Vec<u8> {
        self.checks
            .lock()
            .map(|checks| checks.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealth {
    async fn check(&self, _alias: &str, version: u32, percent: u8) -> anyhow::Result<HealthReport> {
        self.checks
            .lock()
            .map_err(|_| anyhow::anyhow!("check log poisoned"))?
            .push(percent);
        if self.unhealthy_at.contains(&percent) {
            Ok(HealthReport::unhealthy(format!(
                "error rate above threshold for version {} at {}%",
                version, percent
            )))
        } else {
            Ok(HealthReport::healthy())
        }
    }
}
