//! Source to registry: fetch from the version-control host, build a container
//! image in a privileged build environment, push it to a registry.
//!
//! The push is the last command of the build stage, so a successful build
//! stage takes the pipeline from `SourceFetched` straight through `Built` to
//! `Published`.

use tracing::info;

use crate::arn::Environment;
use crate::build_project::{BuildEnvironment, BuildPhase, BuildProject, BuildSpec};
use crate::construct::Scope;
use crate::error::Result;
use crate::pipeline::{
    Action, ArtifactName, Pipeline, PipelineBuilder, PipelineState, PublishTarget, Stage,
};
use crate::policy::{scope_to, IdentityRole, ServicePrincipal};
use crate::registry::{ArtifactRegistryManager, Registry};
use crate::source::SourceReference;
use crate::storage::Bucket;
use crate::template::{Synthesize, Template};

/// Artifact emitted by every source stage.
pub const SOURCE_ARTIFACT: &str = "source";

/// Tag pushed by the build stage.
pub const IMAGE_TAG: &str = "latest";

/// Registry actions the image builder needs on its own repository.
pub const BUILDER_REGISTRY_ACTIONS: &[&str] = &[
    "ecr:BatchGetImage",
    "ecr:BatchCheckLayerAvailability",
    "ecr:CompleteLayerUpload",
    "ecr:DescribeImages",
    "ecr:DescribeRepositories",
    "ecr:GetDownloadUrlForLayer",
    "ecr:InitiateLayerUpload",
    "ecr:ListImages",
    "ecr:PutImage",
    "ecr:UploadLayerPart",
];

pub(crate) const START_BUILD_ACTIONS: &[&str] = &["codebuild:StartBuild", "codebuild:BatchGetBuilds"];

/// Registry, image builder and two-stage pipeline for one service.
#[derive(Debug, Clone)]
pub struct SourceToRegistryPipeline {
    registry: Registry,
    pipeline: Pipeline,
}

impl SourceToRegistryPipeline {
    /// Define the registry and its pipeline under a child scope `id`.
    ///
    /// `retention_days` is the age after which untagged images expire.
    pub fn new(
        parent: &mut Scope,
        env: &Environment,
        id: &str,
        source: SourceReference,
        retention_days: u32,
    ) -> Result<Self> {
        source.validate()?;
        let mut scope = parent.child(id)?;

        let registry = ArtifactRegistryManager::new(env.clone()).create_registry(
            &mut scope,
            id,
            retention_days,
        )?;
        let artifact_store = Bucket::new(&mut scope, env, "ArtifactStore")?;

        let builder_role = IdentityRole::new(
            &mut scope,
            &format!("{}CodeBuilderECRRole", id),
            &env.account,
            ServicePrincipal::codebuild(),
            "ecr",
        )?
        .with_statement(scope_to(BUILDER_REGISTRY_ACTIONS, Some(registry.arn()))?)
        .with_statement(scope_to(["ecr:GetAuthorizationToken"], None)?)
        .with_statement(artifact_store.grant_read_write()?);

        let project = BuildProject::new(
            &mut scope,
            env,
            "BuildImage",
            "Builds and pushes the service container image",
            BuildEnvironment::privileged(),
            image_build_spec(registry.uri()),
            builder_role,
        )?;

        let pipeline_role = IdentityRole::new(
            &mut scope,
            &format!("{}PipelineRole", id),
            &env.account,
            ServicePrincipal::codepipeline(),
            "pipeline",
        )?
        .with_statement(scope_to(START_BUILD_ACTIONS, Some(project.arn()))?)
        .with_statement(artifact_store.grant_read_write()?);

        let source_artifact = ArtifactName::new(SOURCE_ARTIFACT);
        let pipeline = PipelineBuilder::new(&format!("{}DeploymentPipeline", id))
            .stage(
                Stage::new("Source", PipelineState::SourceFetched).action(Action::source(
                    "GithubSource",
                    source,
                    source_artifact.clone(),
                )),
            )
            .stage(
                Stage::new("Build", PipelineState::Published).action(
                    Action::build("BuildImage", project, source_artifact).publishing(
                        PublishTarget::Registry {
                            registry: registry.reference(),
                            tag: IMAGE_TAG.to_string(),
                        },
                    ),
                ),
            )
            .build(&mut scope, pipeline_role, artifact_store, None)?;

        info!(
            registry = %registry.name(),
            pipeline = %pipeline.name(),
            "Defined source-to-registry pipeline"
        );

        Ok(Self { registry, pipeline })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The image build project.
    pub fn build_project(&self) -> Option<&BuildProject> {
        self.pipeline.actions().find_map(Action::build_project)
    }
}

impl Synthesize for SourceToRegistryPipeline {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        self.registry.synthesize(template)?;
        self.pipeline.synthesize(template)
    }
}

/// Login, build and push commands for an image at `uri`.
pub fn image_build_spec(uri: &str) -> BuildSpec {
    BuildSpec::new()
        .phase(
            BuildPhase::PreBuild,
            [
                format!(
                    "echo Logging in to the registry, region: $AWS_DEFAULT_REGION for {} ...",
                    uri
                ),
                format!(
                    "aws ecr get-login-password --region $AWS_DEFAULT_REGION | docker login --username AWS --password-stdin {}",
                    uri
                ),
            ],
        )
        .phase(
            BuildPhase::Build,
            [
                "echo Build started on `date`".to_string(),
                "echo Building the Docker image...".to_string(),
                format!("docker build -t {}:{} .", uri, IMAGE_TAG),
            ],
        )
        .phase(
            BuildPhase::PostBuild,
            [
                "echo Build completed on `date`".to_string(),
                "echo Pushing the Docker image...".to_string(),
                format!("docker push {}:{}", uri, IMAGE_TAG),
            ],
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ResourceScope;

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1")
    }

    fn assemble() -> SourceToRegistryPipeline {
        let mut root = Scope::root("SourceBuild").unwrap();
        let source = SourceReference::new("acme", "bookstore", "main", "prod/github/token").unwrap();
        SourceToRegistryPipeline::new(&mut root, &env(), "Bookstore", source, 7).unwrap()
    }

    #[test]
    fn test_two_stages_with_source_handoff() {
        let p = assemble();
        let stages = p.pipeline().stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].actions()[0].outputs()[0].as_str(), "source");
        assert_eq!(stages[1].actions()[0].inputs()[0].as_str(), "source");
        assert_eq!(stages[1].reaches(), PipelineState::Published);
    }

    #[test]
    fn test_build_commands_in_order() {
        let p = assemble();
        let project = p.build_project().unwrap();
        assert!(project.environment().privileged);

        let uri = p.registry().uri();
        let commands: Vec<(BuildPhase, &str)> = project.spec().commands().collect();
        let login = commands.iter().position(|(_, c)| c.contains("docker login")).unwrap();
        let build = commands
            .iter()
            .position(|(_, c)| *c == format!("docker build -t {}:latest .", uri))
            .unwrap();
        let push = commands
            .iter()
            .position(|(_, c)| *c == format!("docker push {}:latest", uri))
            .unwrap();
        assert!(login < build && build < push);
        assert_eq!(commands[push].0, BuildPhase::PostBuild);
        assert!(commands[login].1.contains("$AWS_DEFAULT_REGION"));
    }

    #[test]
    fn test_builder_role_is_least_privilege() {
        let p = assemble();
        let role = p.build_project().unwrap().role();
        let repo = p.registry().arn();

        assert!(role.allows("ecr:PutImage", repo));
        let other = crate::arn::ResourceArn::parse(
            "arn:aws:ecr:us-east-1:123456789012:repository/other-repo",
        )
        .unwrap();
        assert!(!role.allows("ecr:PutImage", &other));

        for statement in role.statements() {
            if let ResourceScope::Any = statement.resources() {
                let actions: Vec<&str> = statement.actions().collect();
                assert_eq!(actions, vec!["ecr:GetAuthorizationToken"]);
            }
        }
    }

    #[test]
    fn test_pipeline_role_scoped_to_project() {
        let p = assemble();
        let project = p.build_project().unwrap();
        let role = p.pipeline().role();
        assert!(role.allows("codebuild:StartBuild", project.arn()));
        assert!(role.statements().iter().all(|s| !s.is_wildcard()));
    }

    #[test]
    fn test_synthesizes_registry_export() {
        let p = assemble();
        let mut template = Template::new("source build");
        p.synthesize(&mut template).unwrap();
        assert!(template.outputs.contains_key("BookstoreEcrRepoArn"));
        assert_eq!(template.resources_of_type("AWS::ECR::Repository").count(), 1);
        assert_eq!(template.resources_of_type("AWS::CodePipeline::Pipeline").count(), 1);
        assert_eq!(template.resources_of_type("AWS::IAM::Role").count(), 2);
    }

    #[test]
    fn test_empty_source_field_rejected() {
        let mut root = Scope::root("SourceBuild").unwrap();
        let source: SourceReference = serde_json::from_value(serde_json::json!({
            "owner_alias": "acme",
            "repo_name": "",
            "branch": "main",
            "auth_token_alias": "t",
        }))
        .unwrap();
        assert!(SourceToRegistryPipeline::new(&mut root, &env(), "Svc", source, 7).is_err());
    }
}
