//! Least-privilege identity policies.
//!
//! [`PolicyScopeBuilder`] is the only way to obtain a [`PolicyStatement`].
//! Granting statements must name the resources they apply to; a statement
//! without resources is accepted only when every action is on
//! [`UNSCOPED_ACTIONS`], the provider operations that have no resource-level
//! identifiers at all. Everything else is a [`BerthError::ScopeViolation`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::arn::ResourceArn;
use crate::construct::Scope;
use crate::error::{BerthError, Result};
use crate::template::{get_att, Resource, Synthesize, Template};

/// Read-only bootstrap operations the provider cannot scope to a resource.
pub const UNSCOPED_ACTIONS: &[&str] = &[
    "ecr:GetAuthorizationToken",
    "ecr-public:GetAuthorizationToken",
    "sts:GetServiceBearerToken",
];

const POLICY_VERSION: &str = "2012-10-17";

/// Statement effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// Resources a statement applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceScope {
    /// `"*"`; only reachable for allow-listed actions or deny statements.
    Any,
    Specific(BTreeSet<ResourceArn>),
}

/// A single `{Effect, Action[], Resource[]}` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStatement {
    effect: Effect,
    actions: BTreeSet<String>,
    resources: ResourceScope,
}

impl PolicyStatement {
    pub fn effect(&self) -> Effect {
        self.effect
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(String::as_str)
    }

    pub fn resources(&self) -> &ResourceScope {
        &self.resources
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.resources, ResourceScope::Any)
    }

    /// Whether this statement allows `action` on `resource`.
    pub fn allows(&self, action: &str, resource: &ResourceArn) -> bool {
        if self.effect != Effect::Allow || !self.actions.iter().any(|a| action_matches(a, action)) {
            return false;
        }
        match &self.resources {
            ResourceScope::Any => true,
            ResourceScope::Specific(set) => set.iter().any(|r| resource_matches(r, resource)),
        }
    }

    pub fn to_document(&self) -> Value {
        let resources: Value = match &self.resources {
            ResourceScope::Any => json!(["*"]),
            ResourceScope::Specific(set) => {
                json!(set.iter().map(ResourceArn::as_str).collect::<Vec<_>>())
            }
        };
        json!({
            "Effect": self.effect,
            "Action": self.actions.iter().collect::<Vec<_>>(),
            "Resource": resources,
        })
    }
}

/// Builds statements and enforces the least-privilege rule.
#[derive(Debug, Clone, Copy)]
pub struct PolicyScopeBuilder {
    effect: Effect,
}

impl PolicyScopeBuilder {
    pub fn allow() -> Self {
        Self {
            effect: Effect::Allow,
        }
    }

    pub fn deny() -> Self {
        Self {
            effect: Effect::Deny,
        }
    }

    /// Scope `actions` to a single resource, or to none.
    ///
    /// With `resource == None` the actions must all come from
    /// [`UNSCOPED_ACTIONS`] (deny statements excepted).
    pub fn scope_to<I, S>(&self, actions: I, resource: Option<&ResourceArn>) -> Result<PolicyStatement>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let resources: Vec<ResourceArn> = resource.cloned().into_iter().collect();
        self.scope_to_all(actions, &resources)
    }

    /// Scope `actions` to several resources. An empty slice means "no resource".
    pub fn scope_to_all<I, S>(&self, actions: I, resources: &[ResourceArn]) -> Result<PolicyStatement>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let actions: BTreeSet<String> = actions
            .into_iter()
            .map(|a| a.as_ref().trim().to_string())
            .collect();

        if actions.is_empty() {
            return Err(BerthError::ScopeViolation {
                actions: Vec::new(),
                reason: "statement must name at least one action".to_string(),
            });
        }

        let malformed: Vec<String> = actions
            .iter()
            .filter(|a| !is_well_formed_action(a))
            .cloned()
            .collect();
        if !malformed.is_empty() {
            return Err(BerthError::ScopeViolation {
                actions: malformed,
                reason: "actions must be of the form service:Operation".to_string(),
            });
        }

        let scope = if resources.is_empty() {
            if self.effect == Effect::Allow {
                let unscopable: Vec<String> = actions
                    .iter()
                    .filter(|a| !UNSCOPED_ACTIONS.contains(&a.as_str()))
                    .cloned()
                    .collect();
                if !unscopable.is_empty() {
                    return Err(BerthError::ScopeViolation {
                        actions: unscopable,
                        reason: "granting these actions requires a specific resource".to_string(),
                    });
                }
            }
            ResourceScope::Any
        } else {
            ResourceScope::Specific(resources.iter().cloned().collect())
        };

        debug!(
            effect = ?self.effect,
            actions = actions.len(),
            wildcard = matches!(scope, ResourceScope::Any),
            "Scoped policy statement"
        );

        Ok(PolicyStatement {
            effect: self.effect,
            actions,
            resources: scope,
        })
    }
}

/// Shorthand for `PolicyScopeBuilder::allow().scope_to(..)`.
pub fn scope_to<I, S>(actions: I, resource: Option<&ResourceArn>) -> Result<PolicyStatement>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    PolicyScopeBuilder::allow().scope_to(actions, resource)
}

fn is_well_formed_action(action: &str) -> bool {
    match action.split_once(':') {
        Some((service, op)) => {
            !service.is_empty()
                && !op.is_empty()
                && service
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && op.chars().all(|c| c.is_ascii_alphanumeric() || c == '*')
        }
        None => false,
    }
}

fn action_matches(pattern: &str, action: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => action.starts_with(prefix),
        None => pattern == action,
    }
}

fn resource_matches(pattern: &ResourceArn, resource: &ResourceArn) -> bool {
    match pattern.as_str().strip_suffix('*') {
        Some(prefix) => resource.as_str().starts_with(prefix),
        None => pattern == resource,
    }
}

/// The service allowed to assume a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePrincipal(pub String);

impl ServicePrincipal {
    pub fn codebuild() -> Self {
        Self("codebuild.amazonaws.com".to_string())
    }

    pub fn codepipeline() -> Self {
        Self("codepipeline.amazonaws.com".to_string())
    }

    pub fn ecs_tasks() -> Self {
        Self("ecs-tasks.amazonaws.com".to_string())
    }

    pub fn lambda() -> Self {
        Self("lambda.amazonaws.com".to_string())
    }

    pub fn codedeploy() -> Self {
        Self("codedeploy.amazonaws.com".to_string())
    }
}

/// A role with a trust principal and one inline policy.
#[derive(Debug, Clone)]
pub struct IdentityRole {
    logical_id: String,
    role_name: String,
    arn: ResourceArn,
    trust: ServicePrincipal,
    policy_name: String,
    statements: Vec<PolicyStatement>,
}

impl IdentityRole {
    pub fn new(
        scope: &mut Scope,
        id: &str,
        account: &str,
        trust: ServicePrincipal,
        policy_name: &str,
    ) -> Result<Self> {
        let logical_id = scope.resource(id)?;
        let arn = ResourceArn::build("iam", "", account, &format!("role/{}", id))?;
        Ok(Self {
            logical_id,
            role_name: id.to_string(),
            arn,
            trust,
            policy_name: policy_name.to_string(),
            statements: Vec::new(),
        })
    }

    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn name(&self) -> &str {
        &self.role_name
    }

    pub fn arn(&self) -> &ResourceArn {
        &self.arn
    }

    pub fn trust(&self) -> &ServicePrincipal {
        &self.trust
    }

    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    /// Whether any statement allows `action` on `resource`.
    pub fn allows(&self, action: &str, resource: &ResourceArn) -> bool {
        self.statements.iter().any(|s| s.allows(action, resource))
    }

    pub fn policy_document(&self) -> Value {
        json!({
            "Version": POLICY_VERSION,
            "Statement": self.statements.iter().map(PolicyStatement::to_document).collect::<Vec<_>>(),
        })
    }

    pub fn trust_document(&self) -> Value {
        json!({
            "Version": POLICY_VERSION,
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": self.trust.0 },
                "Action": "sts:AssumeRole",
            }],
        })
    }

    /// `{"Fn::GetAtt": [role, "Arn"]}`
    pub fn arn_ref(&self) -> Value {
        get_att(&self.logical_id, "Arn")
    }
}

impl Synthesize for IdentityRole {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "RoleName": self.role_name,
                    "AssumeRolePolicyDocument": self.trust_document(),
                    "Policies": [{
                        "PolicyName": self.policy_name,
                        "PolicyDocument": self.policy_document(),
                    }],
                }),
            ),
        )
    }
}
