//! Integration tests for traffic-shifting rollouts under paused time.

use std::time::Duration;

use berth_ci::fakes::ScriptedHealth;
use berth_ci::RolloutDriver;
use berth_core::{
    Environment, RegistryRef, ResourceArn, RolloutPolicy, RolloutState, Scope,
    TrafficShiftingDeployment,
};
use tokio::sync::watch;
use tokio::time::Instant;

fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_secs(1),
        "elapsed {:?}, expected {:?}",
        elapsed,
        expected
    );
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

/// Test: a health failure at 30% rolls back and leaves the alias alone
#[tokio::test(start_paused = true)]
async fn test_failure_at_thirty_percent_rolls_back() {
    let mut deployment = deployment("Linear10PercentEvery1Minute".parse().unwrap());
    let previous = deployment.alias().version;
    let version = deployment.function_mut().publish_version();
    let mut driver = RolloutDriver::new(ScriptedHealth::failing_at(30));

    let start = Instant::now();
    let report = driver.drive(&mut deployment, version).await.unwrap();

    match &report.state {
        RolloutState::RolledBack { reason } => assert!(reason.contains("30%")),
        other => panic!("expected rollback, got {:?}", other),
    }
    assert_eq!(report.passed_steps, vec![10, 20]);
    assert_eq!(report.alias_version, previous);
    assert_eq!(deployment.alias().version, previous);
    assert_eq!(driver.checker().checks(), vec![10, 20, 30]);
    assert_elapsed(start, Duration::from_secs(180));
}

/// Test: a healthy linear rollout walks every step and repoints the alias
#[tokio::test(start_paused = true)]
async fn test_linear_rollout_succeeds() {
    let mut deployment = deployment(RolloutPolicy::default());
    let version = deployment.function_mut().publish_version();
    let mut driver = RolloutDriver::new(ScriptedHealth::healthy());

    let start = Instant::now();
    let report = driver.drive(&mut deployment, version).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(
        report.passed_steps,
        vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]
    );
    assert_eq!(deployment.alias().version, version);
    // Nine one-minute bakes; the final step is checked immediately.
    assert_elapsed(start, Duration::from_secs(9 * 60));
}

/// Test: canary holds the first slice for the whole interval
#[tokio::test(start_paused = true)]
async fn test_canary_rollout() {
    let mut deployment = deployment("Canary10Percent5Minutes".parse().unwrap());
    let version = deployment.function_mut().publish_version();
    let mut driver = RolloutDriver::new(ScriptedHealth::healthy());

    let start = Instant::now();
    let report = driver.drive(&mut deployment, version).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.passed_steps, vec![10, 100]);
    assert_elapsed(start, Duration::from_secs(5 * 60));
}

/// Test: cancelling mid-bake stops the rollout without moving the alias
#[tokio::test(start_paused = true)]
async fn test_cancellation_during_bake() {
    let mut deployment = deployment(RolloutPolicy::default());
    let version = deployment.function_mut().publish_version();
    let (tx, rx) = watch::channel(false);
    let mut driver = RolloutDriver::new(ScriptedHealth::healthy()).with_cancellation(rx);

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).ok();
    });

    let report = driver.drive(&mut deployment, version).await.unwrap();
    cancel.await.unwrap();

    match &report.state {
        RolloutState::RolledBack { reason } => assert!(reason.contains("cancel")),
        other => panic!("expected rollback, got {:?}", other),
    }
    assert_eq!(report.passed_steps, vec![10, 20]);
    assert_eq!(deployment.alias().version, 1);
}

/// Test: a rolled-back version can be retried once fixed
#[tokio::test(start_paused = true)]
async fn test_retry_after_rollback() {
    let mut deployment = deployment(RolloutPolicy::AllAtOnce);
    let version = deployment.function_mut().publish_version();

    let mut failing = RolloutDriver::new(ScriptedHealth::failing_at(100));
    assert!(!failing.drive(&mut deployment, version).await.unwrap().succeeded());
    assert_eq!(deployment.alias().version, 1);

    let fixed = deployment.function_mut().publish_version();
    let mut healthy = RolloutDriver::new(ScriptedHealth::healthy());
    let report = healthy.drive(&mut deployment, fixed).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(deployment.alias().version, 3);
}
