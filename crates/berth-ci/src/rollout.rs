//! Driving traffic-shifting rollouts.
//!
//! The driver walks the policy schedule: shift, bake, check. A failed check
//! rolls back; a cancellation signal stops the rollout during any bake. The
//! alias moves only when the final step passes its health check.

use async_trait::async_trait;
use berth_core::obs;
use berth_core::{RolloutState, TrafficShiftingDeployment, TrafficStep};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use crate::error::Result;

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub detail: String,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            detail: "ok".to_string(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Check the new version while `percent` of traffic is on it.
    async fn check(&self, alias: &str, version: u32, percent: u8) -> anyhow::Result<HealthReport>;
}

/// What a finished rollout did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutReport {
    pub from_version: u32,
    pub to_version: u32,
    pub state: RolloutState,
    /// Percentages that passed their health check, in order.
    pub passed_steps: Vec<u8>,
    /// Where the alias points afterwards.
    pub alias_version: u32,
}

impl RolloutReport {
    pub fn succeeded(&self) -> bool {
        self.state == RolloutState::Succeeded
    }
}

pub struct RolloutDriver<P: HealthCheck> {
    checker: P,
    cancel: Option<watch::Receiver<bool>>,
}

impl<P: HealthCheck> RolloutDriver<P> {
    pub fn new(checker: P) -> Self {
        Self { checker, cancel: None }
    }

    /// Stop the rollout once `cancel` reads `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn checker(&self) -> &P {
        &self.checker
    }

    /// Roll `deployment`'s alias forward to `version`.
    ///
    /// A failed or erroring health check is reported in the returned state,
    /// not as an error. `Err` is reserved for rollouts that cannot start.
    pub async fn drive(&mut self, deployment: &mut TrafficShiftingDeployment, version: u32) -> Result<RolloutReport> {
        let alias = deployment.alias().name.clone();
        let span = tracing::info_span!("berth.rollout", alias = %alias, to_version = version);
        self.drive_steps(deployment, version).instrument(span).await
    }

    async fn drive_steps(&mut self, deployment: &mut TrafficShiftingDeployment, version: u32) -> Result<RolloutReport> {
        let alias = deployment.alias().name.clone();
        let mut rollout = deployment.group().start_rollout(version)?;
        info!(
            from = rollout.from_version(),
            to = version,
            policy = %deployment.group().policy(),
            steps = rollout.schedule().len(),
            "Starting rollout"
        );

        let mut step = rollout.begin()?;
        let mut passed_steps = Vec::new();
        loop {
            obs::emit_rollout_step(&alias, version, step.percent);

            if !self.bake(step).await {
                rollout.cancel("cancellation requested");
                break;
            }

            let report = match self.checker.check(&alias, version, step.percent).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(percent = step.percent, error = %e, "Health check errored");
                    HealthReport::unhealthy(format!("health check error: {}", e))
                }
            };
            rollout.record_health(report.healthy, &report.detail)?;
            if report.healthy {
                passed_steps.push(step.percent);
            }

            match rollout.current_step() {
                Some(next) => step = next,
                None => break,
            }
        }

        deployment.group_mut().conclude(&rollout)?;
        let alias_version = deployment.alias().version;
        let state = rollout.state().clone();
        obs::emit_rollout_concluded(&alias, alias_version, state == RolloutState::Succeeded);

        Ok(RolloutReport {
            from_version: rollout.from_version(),
            to_version: version,
            state,
            passed_steps,
            alias_version,
        })
    }

    /// Hold `step` for its bake time. Returns `false` if cancelled first.
    async fn bake(&mut self, step: TrafficStep) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if step.bake.is_zero() {
            return true;
        }
        debug!(percent = step.percent, bake_secs = step.bake.as_secs(), "Baking");
        match self.cancel.as_mut() {
            Some(cancel) => {
                tokio::select! {
                    _ = tokio::time::sleep(step.bake) => true,
                    _ = cancelled(cancel) => false,
                }
            }
            None => {
                tokio::time::sleep(step.bake).await;
                true
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false)
    }
}

/// Resolves once the flag reads `true`. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{Environment, RegistryRef, ResourceArn, RolloutPolicy, Scope};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysHealthy(AtomicUsize);

    #[async_trait]
    impl HealthCheck for AlwaysHealthy {
        async fn check(&self, _alias: &str, _version: u32, _percent: u8) -> anyhow::Result<HealthReport> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HealthReport::healthy())
        }
    }

    struct Broken;

    #[async_trait]
    impl HealthCheck for Broken {
        async fn check(&self, _alias: &str, _version: u32, _percent: u8) -> anyhow::Result<HealthReport> {
            anyhow::bail!("metrics endpoint unreachable")
        }
    }

    fn deployment(policy: RolloutPolicy) -> TrafficShiftingDeployment {
        let mut root = Scope::root("Serverless").unwrap();
        let env = Environment::new("123456789012", "us-east-1");
        let image = RegistryRef::from_arn(
            ResourceArn::parse("arn:aws:ecr:us-east-1:123456789012:repository/svc-repo").unwrap(),
        )
        .unwrap();
        TrafficShiftingDeployment::new(&mut root, &env, "Svc", &image, "SvcLambda", policy).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_at_once_single_check() {
        let mut deployment = deployment(RolloutPolicy::AllAtOnce);
        let version = deployment.function_mut().publish_version();
        let mut driver = RolloutDriver::new(AlwaysHealthy(AtomicUsize::new(0)));

        let report = driver.drive(&mut deployment, version).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.passed_steps, vec![100]);
        assert_eq!(deployment.alias().version, version);
        assert_eq!(driver.checker().0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_rolls_back() {
        let mut deployment = deployment(RolloutPolicy::AllAtOnce);
        let version = deployment.function_mut().publish_version();
        let mut driver = RolloutDriver::new(Broken);

        let report = driver.drive(&mut deployment, version).await.unwrap();
        assert!(matches!(report.state, RolloutState::RolledBack { .. }));
        assert_eq!(report.alias_version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_to_current_version_rejected() {
        let mut deployment = deployment(RolloutPolicy::AllAtOnce);
        let mut driver = RolloutDriver::new(AlwaysHealthy(AtomicUsize::new(0)));
        assert!(driver.drive(&mut deployment, 1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let mut deployment = deployment(RolloutPolicy::default());
        let version = deployment.function_mut().publish_version();
        let (_tx, rx) = watch::channel(true);
        let mut driver = RolloutDriver::new(AlwaysHealthy(AtomicUsize::new(0))).with_cancellation(rx);

        let report = driver.drive(&mut deployment, version).await.unwrap();
        assert!(matches!(report.state, RolloutState::RolledBack { .. }));
        assert!(report.passed_steps.is_empty());
        assert_eq!(driver.checker().0.load(Ordering::SeqCst), 0);
    }
}
