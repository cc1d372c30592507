//! Berth CI - pipeline runs and rollouts
//!
//! Runtime counterpart to `berth-core`:
//! - Executes pipeline stages through a pluggable executor (local shell by default)
//! - Commits artifacts and publishes only after a whole stage passes
//! - Drives traffic-shifting rollouts against a health check, with cancellation

pub mod error;
pub mod executor;
pub mod fakes;
pub mod publish;
pub mod rollout;
pub mod run;

// Re-export key types
pub use error::{Result, RunError};
pub use executor::{ActionOutcome, Artifact, ArtifactSet, ShellExecutor, StageExecutor, StageResult};
pub use publish::{MemoryPublisher, Publisher};
pub use rollout::{HealthCheck, HealthReport, RolloutDriver, RolloutReport};
pub use run::{run_concurrently, PipelineRun, PipelineRunner};
