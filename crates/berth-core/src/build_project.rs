//! Build projects and their command specs.
//!
//! A [`BuildSpec`] is the shell-level contract handed to the external build
//! runner: phases run in the order `install`, `pre_build`, `build`,
//! `post_build`. Commands must be safe to re-run, since the runner may be
//! re-triggered for the same revision.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::arn::{Environment, ResourceArn};
use crate::construct::Scope;
use crate::error::{BerthError, Result};
use crate::policy::IdentityRole;
use crate::template::{Resource, Synthesize, Template};

const BUILDSPEC_VERSION: &str = "0.2";

/// Build phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 4] = [
        BuildPhase::Install,
        BuildPhase::PreBuild,
        BuildPhase::Build,
        BuildPhase::PostBuild,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuildPhase::Install => "install",
            BuildPhase::PreBuild => "pre_build",
            BuildPhase::Build => "build",
            BuildPhase::PostBuild => "post_build",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Files a build hands to the next stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifacts {
    pub base_directory: String,
    pub files: Vec<String>,
}

/// Commands per phase plus optional runtime versions and artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    runtime_versions: BTreeMap<String, String>,
    phases: BTreeMap<BuildPhase, Vec<String>>,
    artifacts: Option<BuildArtifacts>,
}

impl BuildSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runtime(mut self, runtime: &str, version: &str) -> Self {
        self.runtime_versions
            .insert(runtime.to_string(), version.to_string());
        self
    }

    /// Append commands to a phase.
    pub fn phase<I, S>(mut self, phase: BuildPhase, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases
            .entry(phase)
            .or_default()
            .extend(commands.into_iter().map(Into::into));
        self
    }

    pub fn artifacts(mut self, base_directory: &str, files: &[&str]) -> Self {
        self.artifacts = Some(BuildArtifacts {
            base_directory: base_directory.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn commands_for(&self, phase: BuildPhase) -> &[String] {
        self.phases.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every command, in execution order.
    pub fn commands(&self) -> impl Iterator<Item = (BuildPhase, &str)> {
        BuildPhase::ALL.into_iter().flat_map(move |phase| {
            self.commands_for(phase)
                .iter()
                .map(move |c| (phase, c.as_str()))
        })
    }

    pub fn build_artifacts(&self) -> Option<&BuildArtifacts> {
        self.artifacts.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.values().all(Vec::is_empty)
    }

    /// The runner's document format.
    pub fn to_document(&self) -> Value {
        let mut phases = serde_json::Map::new();
        for phase in BuildPhase::ALL {
            let commands = self.commands_for(phase);
            let has_runtimes = phase == BuildPhase::Install && !self.runtime_versions.is_empty();
            if commands.is_empty() && !has_runtimes {
                continue;
            }
            let mut body = serde_json::Map::new();
            if has_runtimes {
                body.insert("runtime-versions".to_string(), json!(self.runtime_versions));
            }
            if !commands.is_empty() {
                body.insert("commands".to_string(), json!(commands));
            }
            phases.insert(phase.name().to_string(), Value::Object(body));
        }

        let mut doc = json!({
            "version": BUILDSPEC_VERSION,
            "phases": phases,
        });
        if let Some(artifacts) = &self.artifacts {
            doc["artifacts"] = json!({
                "base-directory": artifacts.base_directory,
                "files": artifacts.files,
            });
        }
        doc
    }
}

/// Container environment the build runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    pub image: String,
    pub compute_type: String,
    /// Required for builds that run a container daemon.
    pub privileged: bool,
}

impl BuildEnvironment {
    pub fn standard() -> Self {
        Self {
            image: "aws/codebuild/standard:7.0".to_string(),
            compute_type: "BUILD_GENERAL1_SMALL".to_string(),
            privileged: false,
        }
    }

    pub fn privileged() -> Self {
        Self {
            privileged: true,
            ..Self::standard()
        }
    }
}

/// A build project run by a pipeline build action.
#[derive(Debug, Clone)]
pub struct BuildProject {
    logical_id: String,
    name: String,
    arn: ResourceArn,
    description: String,
    environment: BuildEnvironment,
    spec: BuildSpec,
    role: IdentityRole,
}

impl BuildProject {
    pub fn new(
        scope: &mut Scope,
        env: &Environment,
        id: &str,
        description: &str,
        environment: BuildEnvironment,
        spec: BuildSpec,
        role: IdentityRole,
    ) -> Result<Self> {
        if spec.is_empty() {
            return Err(BerthError::InvalidConfig(format!(
                "build project {} has no commands",
                id
            )));
        }
        let logical_id = scope.resource(id)?;
        let name = format!("{}-{}", scope.id(), id);
        let arn = env.arn("codebuild", &format!("project/{}", name))?;
        Ok(Self {
            logical_id,
            name,
            arn,
            description: description.to_string(),
            environment,
            spec,
            role,
        })
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &ResourceArn {
        &self.arn
    }

    pub fn environment(&self) -> &BuildEnvironment {
        &self.environment
    }

    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    pub fn role(&self) -> &IdentityRole {
        &self.role
    }
}

impl Synthesize for BuildProject {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        self.role.synthesize(template)?;
        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::CodeBuild::Project",
                json!({
                    "Name": self.name,
                    "Description": self.description,
                    "ServiceRole": self.role.arn_ref(),
                    "Source": {
                        "Type": "CODEPIPELINE",
                        "BuildSpec": self.spec.to_document().to_string(),
                    },
                    "Artifacts": { "Type": "CODEPIPELINE" },
                    "Environment": {
                        "Type": "LINUX_CONTAINER",
                        "Image": self.environment.image,
                        "ComputeType": self.environment.compute_type,
                        "PrivilegedMode": self.environment.privileged,
                    },
                }),
            )
            .depends_on(self.role.logical_id()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_follow_phase_order() {
        let spec = BuildSpec::new()
            .phase(BuildPhase::PostBuild, ["push"])
            .phase(BuildPhase::PreBuild, ["login"])
            .phase(BuildPhase::Build, ["build", "tag"]);
        let ordered: Vec<&str> = spec.commands().map(|(_, c)| c).collect();
        assert_eq!(ordered, vec!["login", "build", "tag", "push"]);
    }

    #[test]
    fn test_document_shape() {
        let spec = BuildSpec::new()
            .runtime("nodejs", "18")
            .phase(BuildPhase::PreBuild, ["npm ci"])
            .phase(BuildPhase::Build, ["npm run build"])
            .artifacts("build", &["**/*"]);
        let doc = spec.to_document();
        assert_eq!(doc["version"], "0.2");
        assert_eq!(doc["phases"]["install"]["runtime-versions"]["nodejs"], "18");
        assert!(doc["phases"]["install"].get("commands").is_none());
        assert_eq!(doc["phases"]["pre_build"]["commands"], json!(["npm ci"]));
        assert_eq!(doc["artifacts"]["base-directory"], "build");
        assert!(doc["phases"].get("post_build").is_none());
    }

    #[test]
    fn test_empty_spec_rejected() {
        use crate::policy::ServicePrincipal;
        let env = Environment::new("1", "us-east-1");
        let mut scope = Scope::root("P").unwrap();
        let role =
            IdentityRole::new(&mut scope, "Role", "1", ServicePrincipal::codebuild(), "p").unwrap();
        let err = BuildProject::new(
            &mut scope,
            &env,
            "Build",
            "d",
            BuildEnvironment::standard(),
            BuildSpec::new(),
            role,
        )
        .unwrap_err();
        assert!(matches!(err, BerthError::InvalidConfig(_)));
    }

    #[test]
    fn test_privileged_environment() {
        assert!(BuildEnvironment::privileged().privileged);
        assert!(!BuildEnvironment::standard().privileged);
    }
}
