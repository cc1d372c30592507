//! Pipelines: ordered stages of actions with artifact hand-off by name.
//!
//! [`PipelineBuilder::build`] checks the whole artifact graph before a
//! [`Pipeline`] exists:
//!
//! - at least two stages, unique stage and action names, no empty stage
//! - source actions only in the first stage, and the first stage has one
//! - every artifact has exactly one producer
//! - every input is produced by a strictly earlier stage
//! - an artifact is consumed by at most one action
//! - each stage advances the pipeline state
//!
//! Any violation is a [`WiringError`]; nothing is synthesized.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::build_project::BuildProject;
use crate::construct::Scope;
use crate::error::{Result, WiringError};
use crate::policy::IdentityRole;
use crate::registry::RegistryRef;
use crate::source::SourceReference;
use crate::storage::Bucket;
use crate::template::{reference, Resource, Synthesize, Template};

/// Name of an artifact handed from one stage to a later one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    SourceFetched,
    /// Build output exists (`ImageBuilt` for container pipelines).
    Built,
    Published,
}

impl PipelineState {
    pub fn next(self) -> Option<PipelineState> {
        match self {
            PipelineState::Created => Some(PipelineState::SourceFetched),
            PipelineState::SourceFetched => Some(PipelineState::Built),
            PipelineState::Built => Some(PipelineState::Published),
            PipelineState::Published => None,
        }
    }

    /// States visited moving from `self` to `target`, excluding `self`.
    pub fn path_to(self, target: PipelineState) -> Vec<PipelineState> {
        let mut path = Vec::new();
        let mut current = self;
        while current < target {
            match current.next() {
                Some(next) => {
                    path.push(next);
                    current = next;
                }
                None => break,
            }
        }
        path
    }

    pub fn is_terminal(self) -> bool {
        self == PipelineState::Published
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Created => "created",
            PipelineState::SourceFetched => "source_fetched",
            PipelineState::Built => "built",
            PipelineState::Published => "published",
        };
        f.write_str(name)
    }
}

/// Where a successful action publishes its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// Image pushed to a registry under `tag`.
    Registry { registry: RegistryRef, tag: String },
    /// Build output extracted into a bucket, replacing what was there.
    ObjectStore { bucket: String },
}

/// What an action does.
#[derive(Debug, Clone)]
pub enum ActionKind {
    Source(SourceReference),
    Build(Box<BuildProject>),
    Deploy,
}

impl ActionKind {
    pub fn category(&self) -> &'static str {
        match self {
            ActionKind::Source(_) => "Source",
            ActionKind::Build(_) => "Build",
            ActionKind::Deploy => "Deploy",
        }
    }
}

/// One unit of work inside a stage.
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    kind: ActionKind,
    inputs: Vec<ArtifactName>,
    outputs: Vec<ArtifactName>,
    publishes: Option<PublishTarget>,
}

impl Action {
    pub fn source(name: &str, source: SourceReference, output: ArtifactName) -> Self {
        Self {
            name: name.to_string(),
            kind: ActionKind::Source(source),
            inputs: Vec::new(),
            outputs: vec![output],
            publishes: None,
        }
    }

    pub fn build(name: &str, project: BuildProject, input: ArtifactName) -> Self {
        Self {
            name: name.to_string(),
            kind: ActionKind::Build(Box::new(project)),
            inputs: vec![input],
            outputs: Vec::new(),
            publishes: None,
        }
    }

    /// Extract `input` into `bucket`, replacing prior contents.
    pub fn deploy_to_bucket(name: &str, bucket: &Bucket, input: ArtifactName) -> Self {
        Self {
            name: name.to_string(),
            kind: ActionKind::Deploy,
            inputs: vec![input],
            outputs: Vec::new(),
            publishes: Some(PublishTarget::ObjectStore {
                bucket: bucket.name().to_string(),
            }),
        }
    }

    pub fn with_output(mut self, output: ArtifactName) -> Self {
        self.outputs.push(output);
        self
    }

    /// Mark this action as publishing on success.
    pub fn publishing(mut self, target: PublishTarget) -> Self {
        self.publishes = Some(target);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[ArtifactName] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArtifactName] {
        &self.outputs
    }

    pub fn publishes(&self) -> Option<&PublishTarget> {
        self.publishes.as_ref()
    }

    pub fn build_project(&self) -> Option<&BuildProject> {
        match &self.kind {
            ActionKind::Build(project) => Some(&**project),
            _ => None,
        }
    }

    fn to_declaration(&self, deploy_bucket: Option<&Bucket>) -> Value {
        let (provider, owner, configuration) = match &self.kind {
            ActionKind::Source(src) => (
                "GitHub",
                "ThirdParty",
                json!({
                    "Owner": src.owner_alias(),
                    "Repo": src.repo_name(),
                    "Branch": src.branch(),
                    "OAuthToken": format!(
                        "{{{{resolve:secretsmanager:{}:SecretString}}}}",
                        src.auth_token_alias()
                    ),
                    "PollForSourceChanges": false,
                }),
            ),
            ActionKind::Build(project) => (
                "CodeBuild",
                "AWS",
                json!({ "ProjectName": reference(project.logical_id()) }),
            ),
            ActionKind::Deploy => (
                "S3",
                "AWS",
                json!({
                    "BucketName": deploy_bucket.map(|b| reference(b.logical_id())),
                    "Extract": true,
                }),
            ),
        };
        json!({
            "Name": self.name,
            "ActionTypeId": {
                "Category": self.kind.category(),
                "Owner": owner,
                "Provider": provider,
                "Version": "1",
            },
            "Configuration": configuration,
            "InputArtifacts": self.inputs.iter().map(|a| json!({ "Name": a.as_str() })).collect::<Vec<_>>(),
            "OutputArtifacts": self.outputs.iter().map(|a| json!({ "Name": a.as_str() })).collect::<Vec<_>>(),
            "RunOrder": 1,
        })
    }
}

/// Actions that run together, and the state the pipeline reaches when they
/// all succeed.
#[derive(Debug, Clone)]
pub struct Stage {
    name: String,
    actions: Vec<Action>,
    reaches: PipelineState,
}

impl Stage {
    pub fn new(name: &str, reaches: PipelineState) -> Self {
        Self {
            name: name.to_string(),
            actions: Vec::new(),
            reaches,
        }
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn reaches(&self) -> PipelineState {
        self.reaches
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ArtifactName> {
        self.actions.iter().flat_map(|a| a.outputs.iter())
    }
}

/// Collects stages and validates wiring on `build`.
#[derive(Debug)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validate the artifact graph and produce the pipeline.
    ///
    /// `artifact_store` holds hand-off artifacts; `deploy_bucket` is the
    /// destination of deploy actions, if any.
    pub fn build(
        self,
        scope: &mut Scope,
        role: IdentityRole,
        artifact_store: Bucket,
        deploy_bucket: Option<Bucket>,
    ) -> Result<Pipeline> {
        validate_wiring(&self.name, &self.stages)?;
        let logical_id = scope.resource(&self.name)?;

        info!(
            pipeline = %self.name,
            stages = self.stages.len(),
            "Assembled pipeline"
        );

        Ok(Pipeline {
            logical_id,
            name: self.name,
            stages: self.stages,
            role,
            artifact_store,
            deploy_bucket,
        })
    }
}

/// Check the artifact hand-off graph of `stages`.
pub fn validate_wiring(pipeline: &str, stages: &[Stage]) -> std::result::Result<(), WiringError> {
    if stages.len() < 2 {
        return Err(WiringError::TooFewStages {
            pipeline: pipeline.to_string(),
            found: stages.len(),
        });
    }

    let mut stage_names = HashSet::new();
    let mut action_names = HashSet::new();
    let mut previous_state = PipelineState::Created;
    // artifact -> (stage index, producing action)
    let mut producers: HashMap<&ArtifactName, (usize, &str)> = HashMap::new();

    for (index, stage) in stages.iter().enumerate() {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(WiringError::DuplicateStage {
                pipeline: pipeline.to_string(),
                stage: stage.name.clone(),
            });
        }
        if stage.actions.is_empty() {
            return Err(WiringError::EmptyStage {
                pipeline: pipeline.to_string(),
                stage: stage.name.clone(),
            });
        }
        if stage.reaches <= previous_state {
            return Err(WiringError::StateRegression {
                stage: stage.name.clone(),
                previous: previous_state.to_string(),
            });
        }
        previous_state = stage.reaches;

        let mut has_source = false;
        for action in &stage.actions {
            if !action_names.insert(action.name.as_str()) {
                return Err(WiringError::DuplicateAction {
                    pipeline: pipeline.to_string(),
                    action: action.name.clone(),
                });
            }
            if matches!(action.kind, ActionKind::Source(_)) {
                if index != 0 {
                    return Err(WiringError::SourceNotFirst {
                        action: action.name.clone(),
                        stage: stage.name.clone(),
                    });
                }
                has_source = true;
            }
            for output in &action.outputs {
                if let Some((_, first)) = producers.insert(output, (index, action.name.as_str())) {
                    return Err(WiringError::DuplicateProducer {
                        artifact: output.to_string(),
                        first: first.to_string(),
                        second: action.name.clone(),
                    });
                }
            }
        }
        if index == 0 && !has_source {
            return Err(WiringError::MissingSource {
                stage: stage.name.clone(),
            });
        }
    }

    let mut consumers: HashMap<&ArtifactName, &str> = HashMap::new();
    for (index, stage) in stages.iter().enumerate() {
        for action in &stage.actions {
            for input in &action.inputs {
                match producers.get(input) {
                    Some((produced_in, _)) if *produced_in < index => {}
                    Some((produced_in, _)) if *produced_in == index => {
                        return Err(WiringError::SameStageHandoff {
                            artifact: input.to_string(),
                            stage: stage.name.clone(),
                        });
                    }
                    _ => {
                        return Err(WiringError::DanglingInput {
                            action: action.name.clone(),
                            artifact: input.to_string(),
                        });
                    }
                }
                if let Some(first) = consumers.insert(input, action.name.as_str()) {
                    return Err(WiringError::MultipleConsumers {
                        artifact: input.to_string(),
                        first: first.to_string(),
                        second: action.name.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

/// A validated pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    logical_id: String,
    name: String,
    stages: Vec<Stage>,
    role: IdentityRole,
    artifact_store: Bucket,
    deploy_bucket: Option<Bucket>,
}

impl Pipeline {
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn role(&self) -> &IdentityRole {
        &self.role
    }

    pub fn artifact_store(&self) -> &Bucket {
        &self.artifact_store
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.stages.iter().flat_map(|s| s.actions.iter())
    }

    /// The state a fully successful run ends in.
    pub fn final_state(&self) -> PipelineState {
        self.stages
            .last()
            .map(Stage::reaches)
            .unwrap_or(PipelineState::Created)
    }
}

impl Synthesize for Pipeline {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        self.artifact_store.synthesize(template)?;
        self.role.synthesize(template)?;

        let mut resource_deps = vec![self.role.logical_id().to_string()];
        for action in self.actions() {
            if let Some(project) = action.build_project() {
                project.synthesize(template)?;
                resource_deps.push(project.logical_id().to_string());
            }
        }

        let stages: Vec<Value> = self
            .stages
            .iter()
            .map(|stage| {
                json!({
                    "Name": stage.name,
                    "Actions": stage
                        .actions
                        .iter()
                        .map(|a| a.to_declaration(self.deploy_bucket.as_ref()))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        let mut resource = Resource::new(
            "AWS::CodePipeline::Pipeline",
            json!({
                "Name": self.name,
                "RoleArn": self.role.arn_ref(),
                "ArtifactStore": {
                    "Type": "S3",
                    "Location": reference(self.artifact_store.logical_id()),
                },
                "Stages": stages,
            }),
        );
        for dep in resource_deps {
            resource = resource.depends_on(dep);
        }
        template.add_resource(&self.logical_id, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arn::Environment;
    use crate::build_project::{BuildEnvironment, BuildPhase, BuildSpec};
    use crate::policy::ServicePrincipal;

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1")
    }

    fn source() -> SourceReference {
        SourceReference::new("acme", "app", "main", "prod/github/token").unwrap()
    }

    fn project(scope: &mut Scope, id: &str) -> BuildProject {
        let role = IdentityRole::new(
            scope,
            &format!("{}Role", id),
            "123456789012",
            ServicePrincipal::codebuild(),
            "build",
        )
        .unwrap();
        BuildProject::new(
            scope,
            &env(),
            id,
            "test",
            BuildEnvironment::standard(),
            BuildSpec::new().phase(BuildPhase::Build, ["make"]),
            role,
        )
        .unwrap()
    }

    fn pipeline_role(scope: &mut Scope) -> IdentityRole {
        IdentityRole::new(
            scope,
            "PipelineRole",
            "123456789012",
            ServicePrincipal::codepipeline(),
            "pipeline",
        )
        .unwrap()
    }

    #[test]
    fn test_state_path() {
        assert_eq!(
            PipelineState::SourceFetched.path_to(PipelineState::Published),
            vec![PipelineState::Built, PipelineState::Published]
        );
        assert!(PipelineState::Published.path_to(PipelineState::Built).is_empty());
        assert!(PipelineState::Published.is_terminal());
    }

    #[test]
    fn test_valid_two_stage_pipeline() {
        let mut scope = Scope::root("P").unwrap();
        let build = project(&mut scope, "Build");
        let role = pipeline_role(&mut scope);
        let store = Bucket::new(&mut scope, &env(), "Artifacts").unwrap();

        let pipeline = PipelineBuilder::new("Pipe")
            .stage(Stage::new("Source", PipelineState::SourceFetched).action(Action::source(
                "Fetch",
                source(),
                ArtifactName::new("source"),
            )))
            .stage(
                Stage::new("Build", PipelineState::Published).action(Action::build(
                    "Compile",
                    build,
                    ArtifactName::new("source"),
                )),
            )
            .build(&mut scope, role, store, None)
            .unwrap();

        assert_eq!(pipeline.stages().len(), 2);
        assert_eq!(pipeline.final_state(), PipelineState::Published);

        let mut template = Template::new("t");
        pipeline.synthesize(&mut template).unwrap();
        let res = template.resource(pipeline.logical_id()).unwrap();
        assert_eq!(res.properties["Stages"][0]["Actions"][0]["OutputArtifacts"][0]["Name"], "source");
        assert_eq!(res.properties["Stages"][1]["Actions"][0]["InputArtifacts"][0]["Name"], "source");
        assert_eq!(template.resources_of_type("AWS::CodeBuild::Project").count(), 1);
    }

    #[test]
    fn test_single_stage_rejected() {
        let stages = vec![Stage::new("Source", PipelineState::SourceFetched)
            .action(Action::source("Fetch", source(), ArtifactName::new("source")))];
        assert!(matches!(
            validate_wiring("p", &stages),
            Err(WiringError::TooFewStages { found: 1, .. })
        ));
    }

    #[test]
    fn test_dangling_input_rejected() {
        let mut scope = Scope::root("P").unwrap();
        let stages = vec![
            Stage::new("Source", PipelineState::SourceFetched)
                .action(Action::source("Fetch", source(), ArtifactName::new("source"))),
            Stage::new("Build", PipelineState::Built).action(Action::build(
                "Compile",
                project(&mut scope, "Build"),
                ArtifactName::new("src"),
            )),
        ];
        match validate_wiring("p", &stages) {
            Err(WiringError::DanglingInput { artifact, .. }) => assert_eq!(artifact, "src"),
            other => panic!("expected DanglingInput, got {:?}", other),
        }
    }

    #[test]
    fn test_input_from_later_stage_is_dangling() {
        let mut scope = Scope::root("P").unwrap();
        let stages = vec![
            Stage::new("Source", PipelineState::SourceFetched)
                .action(Action::source("Fetch", source(), ArtifactName::new("source"))),
            Stage::new("Build", PipelineState::Built).action(Action::build(
                "Compile",
                project(&mut scope, "Build"),
                ArtifactName::new("late"),
            )),
            Stage::new("Package", PipelineState::Published).action(
                Action::build("Pack", project(&mut scope, "Pack"), ArtifactName::new("source"))
                    .with_output(ArtifactName::new("late")),
            ),
        ];
        assert!(matches!(
            validate_wiring("p", &stages),
            Err(WiringError::DanglingInput { .. })
        ));
    }

    #[test]
    fn test_same_stage_handoff_rejected() {
        let mut scope = Scope::root("P").unwrap();
        let stages = vec![
            Stage::new("Source", PipelineState::SourceFetched)
                .action(Action::source("Fetch", source(), ArtifactName::new("source"))),
            Stage::new("Build", PipelineState::Built)
                .action(
                    Action::build("Compile", project(&mut scope, "A"), ArtifactName::new("source"))
                        .with_output(ArtifactName::new("bin")),
                )
                .action(Action::build("Test", project(&mut scope, "B"), ArtifactName::new("bin"))),
        ];
        assert!(matches!(
            validate_wiring("p", &stages),
            Err(WiringError::SameStageHandoff { .. })
        ));
    }

    #[test]
    fn test_multiple_consumers_rejected() {
        let mut scope = Scope::root("P").unwrap();
        let stages = vec![
            Stage::new("Source", PipelineState::SourceFetched)
                .action(Action::source("Fetch", source(), ArtifactName::new("source"))),
            Stage::new("Build", PipelineState::Built)
                .action(Action::build("A", project(&mut scope, "A"), ArtifactName::new("source")))
                .action(Action::build("B", project(&mut scope, "B"), ArtifactName::new("source"))),
        ];
        assert!(matches!(
            validate_wiring("p", &stages),
            Err(WiringError::MultipleConsumers { .. })
        ));
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let stages = vec![
            Stage::new("Source", PipelineState::SourceFetched)
                .action(Action::source("Fetch", source(), ArtifactName::new("source")))
                .action(Action::source("Fetch2", source(), ArtifactName::new("source"))),
            Stage::new("Deploy", PipelineState::Published).action(Action {
                name: "Noop".to_string(),
                kind: ActionKind::Deploy,
                inputs: vec![ArtifactName::new("source")],
                outputs: Vec::new(),
                publishes: None,
            }),
        ];
        assert!(matches!(
            validate_wiring("p", &stages),
            Err(WiringError::DuplicateProducer { .. })
        ));
    }

    #[test]
    fn test_source_outside_first_stage_rejected() {
        let stages = vec![
            Stage::new("Source", PipelineState::SourceFetched)
                .action(Action::source("Fetch", source(), ArtifactName::new("a"))),
            Stage::new("Again", PipelineState::Built)
                .action(Action::source("Fetch2", source(), ArtifactName::new("b"))),
        ];
        assert!(matches!(
            validate_wiring("p", &stages),
            Err(WiringError::SourceNotFirst { .. })
        ));
    }

    #[test]
    fn test_state_regression_rejected() {
        let mut scope = Scope::root("P").unwrap();
        let stages = vec![
            Stage::new("Source", PipelineState::SourceFetched)
                .action(Action::source("Fetch", source(), ArtifactName::new("source"))),
            Stage::new("Build", PipelineState::SourceFetched).action(Action::build(
                "Compile",
                project(&mut scope, "Build"),
                ArtifactName::new("source"),
            )),
        ];
        assert!(matches!(
            validate_wiring("p", &stages),
            Err(WiringError::StateRegression { .. })
        ));
    }

    #[test]
    fn test_wiring_error_prevents_pipeline() {
        let mut scope = Scope::root("P").unwrap();
        let role = pipeline_role(&mut scope);
        let store = Bucket::new(&mut scope, &env(), "Artifacts").unwrap();
        let result = PipelineBuilder::new("Pipe")
            .stage(Stage::new("Source", PipelineState::SourceFetched).action(Action::source(
                "Fetch",
                source(),
                ArtifactName::new("source"),
            )))
            .build(&mut scope, role, store, None);
        assert!(result.is_err());
        // No pipeline id was claimed.
        assert!(!scope.children().any(|c| c == "Pipe"));
    }
}
