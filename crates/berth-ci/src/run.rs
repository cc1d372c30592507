//! Pipeline runs.
//!
//! Stages run in order. Within a stage every action runs before anything is
//! committed: outputs become visible to later stages and publish targets are
//! written only once the whole stage has passed. A failing stage halts the
//! run and leaves its state where the last passing stage put it.

use std::sync::Arc;
use std::time::Instant;

use berth_core::obs;
use berth_core::pipeline::{Action, ArtifactName, Pipeline, PipelineState, PublishTarget};
use futures::future::join_all;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::error::{Result, RunError};
use crate::executor::{ArtifactSet, StageExecutor, StageResult};
use crate::publish::Publisher;

/// Where a run currently stands.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: String,
    pipeline: String,
    state: PipelineState,
    artifacts: ArtifactSet,
    stages: Vec<StageResult>,
    published: Vec<String>,
    duration_ms: u64,
}

impl PipelineRun {
    pub fn new(pipeline: &Pipeline) -> Self {
        Self {
            run_id: format!("run-{}", Uuid::new_v4().simple()),
            pipeline: pipeline.name().to_string(),
            state: PipelineState::Created,
            artifacts: ArtifactSet::new(),
            stages: Vec::new(),
            published: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Artifacts committed by passed stages.
    pub fn artifacts(&self) -> &ArtifactSet {
        &self.artifacts
    }

    /// Results of every action executed, including a failing one.
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Image digests and bucket names published so far.
    pub fn published(&self) -> &[String] {
        &self.published
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }

    fn advance_to(&mut self, target: PipelineState) {
        for next in self.state.path_to(target) {
            obs::emit_state_changed(&self.run_id, &self.state.to_string(), &next.to_string());
            self.state = next;
        }
    }
}

/// Drives pipelines through an executor and a publisher.
#[derive(Clone)]
pub struct PipelineRunner {
    executor: Arc<dyn StageExecutor>,
    publisher: Arc<dyn Publisher>,
}

impl PipelineRunner {
    pub fn new(executor: Arc<dyn StageExecutor>, publisher: Arc<dyn Publisher>) -> Self {
        Self { executor, publisher }
    }

    /// Start a fresh run of `pipeline` and drive it to completion.
    pub async fn run(&self, pipeline: &Pipeline) -> (PipelineRun, Result<()>) {
        let mut run = PipelineRun::new(pipeline);
        let outcome = self.drive(pipeline, &mut run).await;
        (run, outcome)
    }

    /// Execute every stage of `pipeline` not yet reflected in `run`.
    pub async fn drive(&self, pipeline: &Pipeline, run: &mut PipelineRun) -> Result<()> {
        let span = obs::run_span(&run.run_id);
        self.drive_stages(pipeline, run).instrument(span).await
    }

    async fn drive_stages(&self, pipeline: &Pipeline, run: &mut PipelineRun) -> Result<()> {
        if run.pipeline != pipeline.name() {
            return Err(RunError::InvalidRun(format!(
                "run {} belongs to pipeline {}, not {}",
                run.run_id,
                run.pipeline,
                pipeline.name()
            )));
        }
        if run.state.is_terminal() {
            return Err(RunError::InvalidRun(format!(
                "run {} already reached {}",
                run.run_id, run.state
            )));
        }

        let run_id = run.run_id.clone();
        let start = Instant::now();
        info!(pipeline = %pipeline.name(), "Starting pipeline run");

        for stage in pipeline.stages() {
            if stage.reaches() <= run.state {
                continue;
            }

            obs::emit_stage_started(&run_id, pipeline.name(), stage.name());
            let stage_start = Instant::now();
            let mut produced = ArtifactSet::new();
            let mut publishes: Vec<(&PublishTarget, Option<ArtifactName>)> = Vec::new();

            for action in stage.actions() {
                let inputs = match gather_inputs(run, action) {
                    Ok(inputs) => inputs,
                    Err(e) => {
                        obs::emit_stage_finished(&run_id, stage.name(), elapsed_ms(stage_start), false);
                        run.duration_ms = elapsed_ms(start);
                        return Err(e);
                    }
                };
                let outcome = match self.executor.execute(stage.name(), action, &inputs).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        obs::emit_stage_finished(&run_id, stage.name(), elapsed_ms(stage_start), false);
                        run.duration_ms = elapsed_ms(start);
                        return Err(RunError::Executor(e));
                    }
                };
                let passed = outcome.result.passed();
                let reason = failure_reason(&outcome.result);
                run.stages.push(outcome.result);

                if !passed {
                    obs::emit_stage_finished(&run_id, stage.name(), elapsed_ms(stage_start), false);
                    warn!(
                        stage = %stage.name(),
                        action = %action.name(),
                        state = %run.state,
                        "Stage failed; halting run"
                    );
                    run.duration_ms = elapsed_ms(start);
                    return Err(RunError::StageFailure {
                        stage: stage.name().to_string(),
                        action: action.name().to_string(),
                        reason,
                    });
                }

                for name in action.outputs() {
                    let artifact = outcome.artifacts.get(name).cloned().unwrap_or_default();
                    produced.insert(name.clone(), artifact);
                }
                if let Some(target) = action.publishes() {
                    let carried = action
                        .outputs()
                        .first()
                        .or_else(|| action.inputs().first())
                        .cloned();
                    publishes.push((target, carried));
                }
            }

            for (target, carried) in publishes {
                let artifact = carried
                    .as_ref()
                    .and_then(|name| produced.get(name).or_else(|| run.artifacts.get(name)));
                let published = match self.publisher.publish(target, artifact).await {
                    Ok(id) => id,
                    Err(e) => {
                        obs::emit_stage_finished(&run_id, stage.name(), elapsed_ms(stage_start), false);
                        run.duration_ms = elapsed_ms(start);
                        return Err(RunError::Executor(e));
                    }
                };
                run.published.push(published);
            }

            run.artifacts.extend(produced);
            obs::emit_stage_finished(&run_id, stage.name(), elapsed_ms(stage_start), true);
            run.advance_to(stage.reaches());
        }

        run.duration_ms = elapsed_ms(start);
        info!(
            pipeline = %pipeline.name(),
            state = %run.state,
            duration_ms = run.duration_ms,
            "Pipeline run completed"
        );
        Ok(())
    }
}

/// Run independent pipelines at the same time. Each gets its own run; a
/// failure in one does not affect the others.
pub async fn run_concurrently(runner: &PipelineRunner, pipelines: &[&Pipeline]) -> Vec<(PipelineRun, Result<()>)> {
    join_all(pipelines.iter().map(|pipeline| runner.run(pipeline))).await
}

fn gather_inputs(run: &PipelineRun, action: &Action) -> Result<ArtifactSet> {
    action
        .inputs()
        .iter()
        .map(|name| {
            run.artifacts
                .get(name)
                .map(|artifact| (name.clone(), artifact.clone()))
                .ok_or_else(|| {
                    RunError::InvalidRun(format!(
                        "action {} needs artifact {} which no earlier stage committed",
                        action.name(),
                        name
                    ))
                })
        })
        .collect()
}

fn failure_reason(result: &StageResult) -> String {
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        format!("exited with code {}", result.exit_code)
    } else {
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        format!("exited with code {}: {}", result.exit_code, tail.join("\n"))
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedExecutor;
    use crate::publish::MemoryPublisher;
    use berth_core::{Environment, Scope, SourceReference, SourceToRegistryPipeline};
    use tracing_test::traced_test;

    fn result(exit_code: i32, stderr: &str) -> StageResult {
        StageResult {
            stage_name: "Build".to_string(),
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: 10,
            success: exit_code == 0,
        }
    }

    #[test]
    fn test_failure_reason_without_stderr() {
        assert_eq!(failure_reason(&result(2, "")), "exited with code 2");
    }

    #[test]
    fn test_failure_reason_keeps_stderr_tail() {
        let stderr = (1..=8).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let reason = failure_reason(&result(1, &stderr));
        assert!(reason.starts_with("exited with code 1: line 4"));
        assert!(reason.ends_with("line 8"));
        assert!(!reason.contains("line 3"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_missing_input_still_finishes_stage() {
        let mut root = Scope::root("SourceBuild").unwrap();
        let source = SourceReference::new("acme", "svc", "main", "token").unwrap();
        let env = Environment::new("123456789012", "us-east-1");
        let pipeline = SourceToRegistryPipeline::new(&mut root, &env, "Svc", source, 7).unwrap();
        let runner = PipelineRunner::new(
            Arc::new(ScriptedExecutor::new()),
            Arc::new(MemoryPublisher::new()),
        );

        // Resumed past the source stage without the artifact it committed.
        let mut run = PipelineRun::new(pipeline.pipeline());
        run.state = PipelineState::SourceFetched;
        let outcome = runner.drive(pipeline.pipeline(), &mut run).await;

        assert!(matches!(outcome, Err(RunError::InvalidRun(_))));
        assert_eq!(run.state(), PipelineState::SourceFetched);
        logs_assert(|lines: &[&str]| {
            let started = lines.iter().filter(|l| l.contains("stage.started")).count();
            let finished = lines.iter().filter(|l| l.contains("stage.finished")).count();
            match (started, finished) {
                (1, 1) => Ok(()),
                other => Err(format!("stage started/finished events: {:?}", other)),
            }
        });
    }
}
