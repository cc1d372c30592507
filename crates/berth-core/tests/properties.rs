//! Property tests for the construction-time invariants.

use berth_core::network::{Peer, ServiceConfig};
use berth_core::{
    scope_to, BerthError, Environment, ImageStore, NetworkTopologyBuilder, PolicyScopeBuilder,
    RegistryRef, ResourceArn, RetentionRule, Scope, UNSCOPED_ACTIONS,
};
use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

fn image() -> RegistryRef {
    RegistryRef::from_arn(
        ResourceArn::parse("arn:aws:ecr:eu-west-1:210987654321:repository/svc-repo").unwrap(),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn back_group_only_admits_front_group(
        port in 1u16..=u16::MAX,
        name in "[A-Z][a-zA-Z0-9]{0,20}",
        zones in 2usize..=4,
    ) {
        let mut root = Scope::root("Service").unwrap();
        let env = Environment::new("210987654321", "eu-west-1");
        let config = ServiceConfig {
            container_port: port,
            availability_zones: zones,
            ..ServiceConfig::default()
        };
        let topology = NetworkTopologyBuilder::new(&name, config)
            .build(&mut root, &env, &image())
            .unwrap();

        let front = topology.front_security_group().logical_id().to_string();
        let back = topology.back_security_group().group();
        prop_assert_eq!(back.ingress().len(), 1);
        for rule in back.ingress() {
            prop_assert_eq!(&rule.peer, &Peer::SecurityGroup(front.clone()));
            prop_assert_eq!(rule.port, port);
        }
        prop_assert!(!back.allows_any_source());
        prop_assert_eq!(topology.listener().port(), port);
        prop_assert_eq!(topology.target_group().port(), port);
        prop_assert!(topology.verify().is_ok());
    }

    #[test]
    fn unscoped_mutating_actions_are_rejected(
        service in "[a-z][a-z0-9]{1,10}",
        operation in "(Put|Delete|Create|Update|Start)[A-Z][a-zA-Z]{0,12}",
    ) {
        let action = format!("{}:{}", service, operation);
        prop_assume!(!UNSCOPED_ACTIONS.contains(&action.as_str()));

        let result = scope_to([action.as_str()], None);
        match result {
            Err(BerthError::ScopeViolation { actions, .. }) => prop_assert_eq!(actions, vec![action]),
            other => prop_assert!(false, "expected ScopeViolation, got {:?}", other),
        }
    }

    #[test]
    fn scoped_actions_never_become_wildcards(
        operation in "[A-Z][a-zA-Z]{1,12}",
        repo in "[a-z][a-z0-9-]{1,20}",
    ) {
        let arn = ResourceArn::parse(&format!(
            "arn:aws:ecr:us-east-1:123456789012:repository/{}",
            repo
        ))
        .unwrap();
        let statement = PolicyScopeBuilder::allow()
            .scope_to([format!("ecr:{}", operation)], Some(&arn))
            .unwrap();
        prop_assert!(!statement.is_wildcard());
        let action = format!("ecr:{}", operation);
        prop_assert!(statement.allows(&action, &arn));
    }

    #[test]
    fn wildcard_identifiers_never_parse(
        segment in 1usize..6,
        head in "[a-z0-9/-]{0,8}",
        wildcard in prop::sample::select(vec!['*', '?']),
    ) {
        let mut parts = vec!["arn", "aws", "ecr", "us-east-1", "123456789012", "repository/svc-repo"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        parts[segment] = format!("{}{}", head, wildcard);
        let raw = parts.join(":");
        prop_assert!(
            matches!(ResourceArn::parse(&raw), Err(BerthError::InvalidIdentifier(_))),
            "{} parsed as a concrete identifier",
            raw
        );
    }

    #[test]
    fn retention_never_selects_tagged_images(
        max_age in 1u32..30,
        age_days in 0i64..3650,
        tag in "[a-z0-9.]{1,12}",
    ) {
        let rule = RetentionRule::untagged_older_than(max_age).unwrap();
        let pushed = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = pushed + Duration::days(age_days);

        let mut store = ImageStore::new();
        store.push("sha256:tagged", Some(&tag), pushed);
        store.push("sha256:untagged", None, pushed);

        let expired = store.apply_retention(&rule, now);
        prop_assert!(store.get("sha256:tagged").is_some());
        prop_assert!(!expired.contains(&"sha256:tagged".to_string()));
        let should_expire = Duration::days(age_days) > rule.max_age();
        prop_assert_eq!(store.get("sha256:untagged").is_none(), should_expire);
    }
}

#[test]
fn allow_listed_actions_may_be_unscoped() {
    for action in UNSCOPED_ACTIONS {
        let statement = scope_to([*action], None).unwrap();
        assert!(statement.is_wildcard());
    }
}

#[test]
fn deny_statements_may_use_wildcard() {
    let statement = PolicyScopeBuilder::deny()
        .scope_to(["s3:DeleteBucket"], None)
        .unwrap();
    assert!(statement.is_wildcard());
    assert!(!statement.allows("s3:DeleteBucket", image().arn()));
}

#[test]
fn wildcard_patterns_cannot_be_scoped_to() {
    for raw in ["arn:aws:ecr:*:*:repository/*", "arn:aws:s3:::*/*"] {
        assert!(ResourceArn::parse(raw).is_err(), "{} must not parse", raw);
    }
    let repo = image();
    assert!(repo.arn().join("*").is_err());
    let statement = scope_to(["ecr:PutImage"], Some(repo.arn())).unwrap();
    assert!(!statement.is_wildcard());
    assert!(!statement.allows(
        "ecr:PutImage",
        &ResourceArn::parse("arn:aws:ecr:eu-west-1:210987654321:repository/other-repo").unwrap()
    ));
}
