//! Traffic shifting for versioned serverless functions.
//!
//! A stable alias fronts the function. A rollout moves traffic from the
//! alias's current version to a new one following a [`RolloutPolicy`], and the
//! alias is repointed only once the rollout concludes as
//! [`RolloutState::Succeeded`]. A failed health signal at any step, or a
//! cancellation, rolls back and leaves the alias where it was.
//!
//! In the synthesized template the alias hands its updates to the deployment
//! group, which shifts traffic under its own service role. The version's
//! logical id carries a digest of the function definition, so a changed
//! definition publishes a new version for the alias to move to.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::arn::{Environment, ResourceArn};
use crate::construct::Scope;
use crate::error::{BerthError, Result};
use crate::network::IMAGE_PULL_ACTIONS;
use crate::policy::{scope_to, IdentityRole, PolicyScopeBuilder, ServicePrincipal};
use crate::registry::RegistryRef;
use crate::template::{get_att, reference, Resource, Synthesize, Template};

pub const LIVE_ALIAS: &str = "live";

/// What the deployment group needs to move the alias between versions.
const ALIAS_SHIFT_ACTIONS: &[&str] = &[
    "lambda:GetAlias",
    "lambda:UpdateAlias",
    "lambda:GetFunction",
    "lambda:GetProvisionedConcurrencyConfig",
];

/// How traffic moves from the old version to the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RolloutPolicy {
    AllAtOnce,
    /// `percent` for `interval`, then everything.
    Canary { percent: u8, interval: Duration },
    /// `percent` more every `interval` until everything has moved.
    Linear { percent: u8, interval: Duration },
}

const PRESETS: &[(&str, RolloutPolicy)] = &[
    ("AllAtOnce", RolloutPolicy::AllAtOnce),
    ("Linear10PercentEvery1Minute", RolloutPolicy::linear(10, 1)),
    ("Linear10PercentEvery2Minutes", RolloutPolicy::linear(10, 2)),
    ("Linear10PercentEvery3Minutes", RolloutPolicy::linear(10, 3)),
    ("Linear10PercentEvery10Minutes", RolloutPolicy::linear(10, 10)),
    ("Canary10Percent5Minutes", RolloutPolicy::canary(10, 5)),
    ("Canary10Percent10Minutes", RolloutPolicy::canary(10, 10)),
    ("Canary10Percent15Minutes", RolloutPolicy::canary(10, 15)),
    ("Canary10Percent30Minutes", RolloutPolicy::canary(10, 30)),
];

impl RolloutPolicy {
    const fn linear(percent: u8, minutes: u64) -> Self {
        RolloutPolicy::Linear {
            percent,
            interval: Duration::from_secs(minutes * 60),
        }
    }

    const fn canary(percent: u8, minutes: u64) -> Self {
        RolloutPolicy::Canary {
            percent,
            interval: Duration::from_secs(minutes * 60),
        }
    }

    /// Names accepted by [`FromStr`].
    pub fn preset_names() -> impl Iterator<Item = &'static str> {
        PRESETS.iter().map(|(name, _)| *name)
    }

    /// Provider deployment configuration name.
    pub fn deployment_config_name(&self) -> String {
        format!("CodeDeployDefault.Lambda{}", self)
    }

    /// Ordered traffic steps, always ending at 100%.
    pub fn schedule(&self) -> Vec<TrafficStep> {
        match *self {
            RolloutPolicy::AllAtOnce => vec![TrafficStep::final_step()],
            RolloutPolicy::Canary { percent, interval } => {
                if percent == 0 || percent >= 100 {
                    return vec![TrafficStep::final_step()];
                }
                vec![
                    TrafficStep {
                        percent,
                        bake: interval,
                    },
                    TrafficStep::final_step(),
                ]
            }
            RolloutPolicy::Linear { percent, interval } => {
                if percent == 0 {
                    return vec![TrafficStep::final_step()];
                }
                let mut steps = Vec::new();
                let mut current = percent;
                while current < 100 {
                    steps.push(TrafficStep {
                        percent: current,
                        bake: interval,
                    });
                    current = current.saturating_add(percent);
                }
                steps.push(TrafficStep::final_step());
                steps
            }
        }
    }
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        RolloutPolicy::linear(10, 1)
    }
}

impl fmt::Display for RolloutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn minutes(interval: &Duration) -> (u64, &'static str) {
            let m = interval.as_secs() / 60;
            (m, if m == 1 { "Minute" } else { "Minutes" })
        }
        match self {
            RolloutPolicy::AllAtOnce => f.write_str("AllAtOnce"),
            RolloutPolicy::Canary { percent, interval } => {
                let (m, _) = minutes(interval);
                write!(f, "Canary{}Percent{}Minutes", percent, m)
            }
            RolloutPolicy::Linear { percent, interval } => {
                let (m, unit) = minutes(interval);
                write!(f, "Linear{}PercentEvery{}{}", percent, m, unit)
            }
        }
    }
}

impl FromStr for RolloutPolicy {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        PRESETS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, policy)| *policy)
            .ok_or_else(|| {
                BerthError::InvalidConfig(format!(
                    "unknown rollout policy '{}'; expected one of: {}",
                    s,
                    Self::preset_names().collect::<Vec<_>>().join(", ")
                ))
            })
    }
}

impl TryFrom<String> for RolloutPolicy {
    type Error = BerthError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RolloutPolicy> for String {
    fn from(value: RolloutPolicy) -> Self {
        value.to_string()
    }
}

/// Share of traffic on the new version, held for `bake` before the next
/// health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficStep {
    pub percent: u8,
    pub bake: Duration,
}

impl TrafficStep {
    fn final_step() -> Self {
        Self {
            percent: 100,
            bake: Duration::ZERO,
        }
    }
}

/// A serverless function whose code is a registry image.
#[derive(Debug, Clone)]
pub struct VersionedFunction {
    logical_id: String,
    version_logical_id: String,
    name: String,
    arn: ResourceArn,
    image: String,
    role: IdentityRole,
    definition_digest: String,
    latest_version: u32,
}

impl VersionedFunction {
    pub fn new(scope: &mut Scope, env: &Environment, name: &str, image: &RegistryRef) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(BerthError::InvalidConfig(
                "serverless.function_name must not be empty".to_string(),
            ));
        }
        let logical_id = scope.resource(name)?;
        let arn = env.arn("lambda", &format!("function:{}", name))?;
        let role_id = format!("{}ServiceRole", name);
        let log_group = env
            .arn("logs", &format!("log-group:/aws/lambda/{}", name))?
            .everything_under(':');
        let role = IdentityRole::new(
            scope,
            &role_id,
            &env.account,
            ServicePrincipal::lambda(),
            "function",
        )?
        .with_statement(scope_to(
            ["logs:CreateLogStream", "logs:PutLogEvents"],
            Some(&log_group),
        )?)
        .with_statement(scope_to(IMAGE_PULL_ACTIONS, Some(image.arn()))?);

        let image = image.image("latest");
        let definition = function_properties(name, &image, &role);
        let definition_digest = hex::encode(Sha256::digest(serde_json::to_vec(&definition)?));
        let version_logical_id =
            scope.resource(&format!("{}CurrentVersion{}", name, &definition_digest[..8]))?;
        debug!(
            function = %name,
            version = %version_logical_id,
            "Derived function version from definition"
        );

        Ok(Self {
            logical_id,
            version_logical_id,
            name: name.to_string(),
            arn,
            image,
            role,
            definition_digest,
            latest_version: 1,
        })
    }

    /// Logical id of the published version; changes with the definition.
    pub fn version_logical_id(&self) -> &str {
        &self.version_logical_id
    }

    /// SHA-256 of the function definition the version was derived from.
    pub fn definition_digest(&self) -> &str {
        &self.definition_digest
    }

    pub fn arn(&self) -> &ResourceArn {
        &self.arn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn role(&self) -> &IdentityRole {
        &self.role
    }

    pub fn latest_version(&self) -> u32 {
        self.latest_version
    }

    /// Publish a new immutable version and return its number.
    pub fn publish_version(&mut self) -> u32 {
        self.latest_version += 1;
        info!(function = %self.name, version = self.latest_version, "Published function version");
        self.latest_version
    }
}

fn function_properties(name: &str, image: &str, role: &IdentityRole) -> Value {
    json!({
        "FunctionName": name,
        "PackageType": "Image",
        "Code": { "ImageUri": image },
        "Role": role.arn_ref(),
    })
}

/// A stable name pointing at one function version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutState {
    Idle,
    RollingOut { step: usize },
    Succeeded,
    RolledBack { reason: String },
}

impl RolloutState {
    pub fn is_concluded(&self) -> bool {
        matches!(self, RolloutState::Succeeded | RolloutState::RolledBack { .. })
    }
}

/// One attempt to move the alias from `from` to `to`.
#[derive(Debug, Clone)]
pub struct Rollout {
    from: u32,
    to: u32,
    schedule: Vec<TrafficStep>,
    state: RolloutState,
}

impl Rollout {
    pub fn new(from: u32, to: u32, policy: RolloutPolicy) -> Self {
        Self {
            from,
            to,
            schedule: policy.schedule(),
            state: RolloutState::Idle,
        }
    }

    pub fn from_version(&self) -> u32 {
        self.from
    }

    pub fn to_version(&self) -> u32 {
        self.to
    }

    pub fn state(&self) -> &RolloutState {
        &self.state
    }

    pub fn schedule(&self) -> &[TrafficStep] {
        &self.schedule
    }

    /// `Idle → RollingOut` at the first step.
    pub fn begin(&mut self) -> Result<TrafficStep> {
        if self.state != RolloutState::Idle {
            return Err(BerthError::Rollout(format!(
                "rollout {} -> {} already started",
                self.from, self.to
            )));
        }
        self.state = RolloutState::RollingOut { step: 0 };
        self.current_step().ok_or_else(|| {
            BerthError::Rollout("rollout schedule is empty".to_string())
        })
    }

    pub fn current_step(&self) -> Option<TrafficStep> {
        match self.state {
            RolloutState::RollingOut { step } => self.schedule.get(step).copied(),
            _ => None,
        }
    }

    /// Share of traffic currently on the new version.
    pub fn traffic_on_new_version(&self) -> u8 {
        match self.state {
            RolloutState::RollingOut { .. } => self.current_step().map(|s| s.percent).unwrap_or(0),
            RolloutState::Succeeded => 100,
            RolloutState::Idle | RolloutState::RolledBack { .. } => 0,
        }
    }

    /// Record the health check for the current step. A failure rolls back; a
    /// pass advances to the next step, or succeeds after the final one.
    pub fn record_health(&mut self, healthy: bool, detail: &str) -> Result<&RolloutState> {
        let step = match self.state {
            RolloutState::RollingOut { step } => step,
            ref other => {
                return Err(BerthError::Rollout(format!(
                    "health recorded while rollout is {:?}",
                    other
                )));
            }
        };
        let percent = self.schedule.get(step).map(|s| s.percent).unwrap_or(100);

        if !healthy {
            warn!(
                from = self.from,
                to = self.to,
                percent = percent,
                detail = %detail,
                "Health check failed; rolling back"
            );
            self.state = RolloutState::RolledBack {
                reason: format!("health check failed at {}%: {}", percent, detail),
            };
        } else if step + 1 >= self.schedule.len() {
            self.state = RolloutState::Succeeded;
        } else {
            self.state = RolloutState::RollingOut { step: step + 1 };
        }
        Ok(&self.state)
    }

    /// Stop advancing. Has no effect once concluded.
    pub fn cancel(&mut self, reason: &str) {
        if self.state.is_concluded() {
            return;
        }
        warn!(from = self.from, to = self.to, reason = %reason, "Rollout cancelled");
        self.state = RolloutState::RolledBack {
            reason: format!("cancelled: {}", reason),
        };
    }
}

/// Binds an alias to a rollout policy.
#[derive(Debug, Clone)]
pub struct DeploymentGroup {
    logical_id: String,
    alias: Alias,
    policy: RolloutPolicy,
}

impl DeploymentGroup {
    pub fn alias(&self) -> &Alias {
        &self.alias
    }

    pub fn policy(&self) -> RolloutPolicy {
        self.policy
    }

    /// Start moving the alias to `version`.
    pub fn start_rollout(&self, version: u32) -> Result<Rollout> {
        if version == self.alias.version {
            return Err(BerthError::Rollout(format!(
                "alias {} already points at version {}",
                self.alias.name, version
            )));
        }
        Ok(Rollout::new(self.alias.version, version, self.policy))
    }

    /// Apply a concluded rollout. Only a success repoints the alias.
    pub fn conclude(&mut self, rollout: &Rollout) -> Result<()> {
        if rollout.from != self.alias.version {
            return Err(BerthError::Rollout(format!(
                "rollout started from version {} but alias is on {}",
                rollout.from, self.alias.version
            )));
        }
        match &rollout.state {
            RolloutState::Succeeded => {
                self.alias.version = rollout.to;
                info!(alias = %self.alias.name, version = rollout.to, "Alias repointed");
                Ok(())
            }
            RolloutState::RolledBack { reason } => {
                info!(
                    alias = %self.alias.name,
                    version = self.alias.version,
                    reason = %reason,
                    "Alias left on last healthy version"
                );
                Ok(())
            }
            other => Err(BerthError::Rollout(format!(
                "rollout has not concluded ({:?})",
                other
            ))),
        }
    }
}

/// Function, live alias, rollout application and deployment group.
#[derive(Debug, Clone)]
pub struct TrafficShiftingDeployment {
    function: VersionedFunction,
    alias_logical_id: String,
    application_logical_id: String,
    deployment_role: IdentityRole,
    group: DeploymentGroup,
}

impl TrafficShiftingDeployment {
    pub fn new(
        parent: &mut Scope,
        env: &Environment,
        id: &str,
        image: &RegistryRef,
        function_name: &str,
        policy: RolloutPolicy,
    ) -> Result<Self> {
        let mut scope = parent.child(id)?;
        let function = VersionedFunction::new(&mut scope, env, function_name, image)?;
        let alias_logical_id = scope.resource(&format!("{}LiveAlias", id))?;
        let application_logical_id = scope.resource(&format!("{}Application", id))?;
        let alias_arn = ResourceArn::parse(&format!("{}:{}", function.arn(), LIVE_ALIAS))?;
        let deployment_role = IdentityRole::new(
            &mut scope,
            &format!("{}DeploymentRole", id),
            &env.account,
            ServicePrincipal::codedeploy(),
            "traffic-shift",
        )?
        .with_statement(
            PolicyScopeBuilder::allow()
                .scope_to_all(ALIAS_SHIFT_ACTIONS, &[function.arn().clone(), alias_arn])?,
        );
        let group = DeploymentGroup {
            logical_id: scope.resource(&format!("{}DeploymentGroup", id))?,
            alias: Alias {
                name: LIVE_ALIAS.to_string(),
                version: function.latest_version(),
            },
            policy,
        };

        info!(
            function = %function.name(),
            policy = %policy,
            "Defined traffic-shifting deployment"
        );

        Ok(Self {
            function,
            alias_logical_id,
            application_logical_id,
            deployment_role,
            group,
        })
    }

    /// Role the deployment group assumes to shift the alias.
    pub fn deployment_role(&self) -> &IdentityRole {
        &self.deployment_role
    }

    pub fn function(&self) -> &VersionedFunction {
        &self.function
    }

    pub fn function_mut(&mut self) -> &mut VersionedFunction {
        &mut self.function
    }

    pub fn group(&self) -> &DeploymentGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut DeploymentGroup {
        &mut self.group
    }

    pub fn alias(&self) -> &Alias {
        &self.group.alias
    }
}

impl Synthesize for TrafficShiftingDeployment {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        let function = &self.function;
        function.role.synthesize(template)?;
        self.deployment_role.synthesize(template)?;
        template.add_resource(
            &function.logical_id,
            Resource::new(
                "AWS::Lambda::Function",
                function_properties(&function.name, &function.image, &function.role),
            )
            .depends_on(function.role.logical_id()),
        )?;
        template.add_resource(
            &function.version_logical_id,
            Resource::new(
                "AWS::Lambda::Version",
                json!({
                    "FunctionName": reference(&function.logical_id),
                    "Description": format!("sha256:{}", function.definition_digest),
                }),
            ),
        )?;
        template.add_resource(
            &self.application_logical_id,
            Resource::new("AWS::CodeDeploy::Application", json!({ "ComputePlatform": "Lambda" })),
        )?;
        template.add_resource(
            &self.group.logical_id,
            Resource::new(
                "AWS::CodeDeploy::DeploymentGroup",
                json!({
                    "ApplicationName": reference(&self.application_logical_id),
                    "ServiceRoleArn": self.deployment_role.arn_ref(),
                    "DeploymentConfigName": self.group.policy.deployment_config_name(),
                    "DeploymentStyle": {
                        "DeploymentType": "BLUE_GREEN",
                        "DeploymentOption": "WITH_TRAFFIC_CONTROL",
                    },
                    "AutoRollbackConfiguration": {
                        "Enabled": true,
                        "Events": ["DEPLOYMENT_FAILURE", "DEPLOYMENT_STOP_ON_REQUEST"],
                    },
                }),
            )
            .depends_on(self.deployment_role.logical_id()),
        )?;
        // Alias updates go through the deployment group instead of being
        // applied directly.
        template.add_resource(
            &self.alias_logical_id,
            Resource::new(
                "AWS::Lambda::Alias",
                json!({
                    "Name": self.group.alias.name,
                    "FunctionName": reference(&function.logical_id),
                    "FunctionVersion": get_att(&function.version_logical_id, "Version"),
                }),
            )
            .with_update_policy(json!({
                "CodeDeployLambdaAliasUpdate": {
                    "ApplicationName": reference(&self.application_logical_id),
                    "DeploymentGroupName": reference(&self.group.logical_id),
                },
            })),
        )
    }
}
