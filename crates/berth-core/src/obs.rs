//! Structured lifecycle events for pipeline runs, rollouts and synthesis.
//!
//! Every helper logs at `info!` (warnings at `warn!`) with an `event` field so
//! the JSON output can be filtered by event name.

use tracing::{info, warn};

/// Span carrying `run_id` for everything logged within a run. Async code
/// attaches it with `tracing::Instrument`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("berth.run", run_id = %run_id)
}

/// RAII guard that enters a run-scoped span for the duration of a
/// synchronous run.
///
/// ```ignore
/// let _span = RunSpan::enter("run-12345");
/// // every event below carries run_id = "run-12345"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

pub fn emit_stage_started(run_id: &str, pipeline: &str, stage: &str) {
    info!(event = "stage.started", run_id = %run_id, pipeline = %pipeline, stage = %stage);
}

pub fn emit_stage_finished(run_id: &str, stage: &str, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Pipeline state transition, e.g. `source_fetched -> built`.
pub fn emit_state_changed(run_id: &str, from: &str, to: &str) {
    info!(event = "pipeline.state_changed", run_id = %run_id, from = %from, to = %to);
}

pub fn emit_rollout_step(alias: &str, to_version: u32, percent: u8) {
    info!(event = "rollout.step", alias = %alias, to_version = to_version, percent = percent);
}

/// Rollout reached a terminal state. Rollbacks log at warn level.
pub fn emit_rollout_concluded(alias: &str, version: u32, succeeded: bool) {
    if succeeded {
        info!(event = "rollout.concluded", alias = %alias, version = version, succeeded = true);
    } else {
        warn!(event = "rollout.concluded", alias = %alias, version = version, succeeded = false);
    }
}

pub fn emit_template_synthesized(topology: &str, resources: usize, digest: &str) {
    info!(
        event = "template.synthesized",
        topology = %topology,
        resources = resources,
        digest = %digest,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
        emit_stage_started("test-run-id", "p", "Build");
        emit_rollout_concluded("live", 1, false);
    }
}
