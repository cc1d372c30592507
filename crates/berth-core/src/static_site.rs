//! Static site: fetch, build a web bundle, replace the contents of a public
//! website bucket with it.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::arn::Environment;
use crate::build_project::{BuildEnvironment, BuildPhase, BuildProject, BuildSpec};
use crate::construct::Scope;
use crate::error::{BerthError, Result};
use crate::pipeline::{Action, ArtifactName, Pipeline, PipelineBuilder, PipelineState, Stage};
use crate::policy::{scope_to, IdentityRole, ServicePrincipal};
use crate::source::SourceReference;
use crate::source_pipeline::{SOURCE_ARTIFACT, START_BUILD_ACTIONS};
use crate::storage::{Bucket, WebsiteConfig};
use crate::template::{Synthesize, Template};

/// Artifact carrying the built bundle from the build stage to the deploy stage.
pub const SITE_ARTIFACT: &str = "site";

fn default_install_command() -> String {
    "npm ci".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_output_dir() -> String {
    "build".to_string()
}

fn default_node_version() -> String {
    "18".to_string()
}

fn default_index_document() -> String {
    "index.html".to_string()
}

/// `[static_site]` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticSiteConfig {
    pub source: SourceReference,

    #[serde(default = "default_install_command")]
    pub install_command: String,

    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Directory the build writes the bundle to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_node_version")]
    pub node_version: String,

    /// Served for `/` and for every path that does not resolve.
    #[serde(default = "default_index_document")]
    pub index_document: String,
}

impl StaticSiteConfig {
    pub fn new(source: SourceReference) -> Self {
        Self {
            source,
            install_command: default_install_command(),
            build_command: default_build_command(),
            output_dir: default_output_dir(),
            node_version: default_node_version(),
            index_document: default_index_document(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        for (field, value) in [
            ("install_command", &self.install_command),
            ("build_command", &self.build_command),
            ("output_dir", &self.output_dir),
            ("node_version", &self.node_version),
            ("index_document", &self.index_document),
        ] {
            if value.trim().is_empty() {
                return Err(BerthError::InvalidConfig(format!(
                    "static_site.{} must not be empty",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn build_spec(&self) -> BuildSpec {
        BuildSpec::new()
            .runtime("nodejs", &self.node_version)
            .phase(BuildPhase::PreBuild, [self.install_command.as_str()])
            .phase(
                BuildPhase::Build,
                ["echo Build started on `date`", self.build_command.as_str()],
            )
            .artifacts(&self.output_dir, &["**/*"])
    }
}

/// Website bucket plus the three-stage pipeline that fills it.
#[derive(Debug, Clone)]
pub struct StaticSitePipeline {
    bucket: Bucket,
    pipeline: Pipeline,
}

impl StaticSitePipeline {
    pub fn new(parent: &mut Scope, env: &Environment, id: &str, config: &StaticSiteConfig) -> Result<Self> {
        config.validate()?;
        let mut scope = parent.child(id)?;

        let bucket = Bucket::new(&mut scope, env, &format!("{}DeploymentBucket", id))?
            .with_website(WebsiteConfig::single_page_app(&config.index_document))
            .with_auto_delete_objects();
        let artifact_store = Bucket::new(&mut scope, env, "ArtifactStore")?;

        let builder_role = IdentityRole::new(
            &mut scope,
            &format!("{}StaticSiteBuilder", id),
            &env.account,
            ServicePrincipal::codebuild(),
            "site",
        )?
        .with_statement(bucket.grant_put_write()?)
        .with_statement(artifact_store.grant_read_write()?);

        let project = BuildProject::new(
            &mut scope,
            env,
            "BuildSite",
            "Builds the static site bundle",
            BuildEnvironment::standard(),
            config.build_spec(),
            builder_role,
        )?;

        // The deploy action runs under the pipeline role.
        let pipeline_role = IdentityRole::new(
            &mut scope,
            &format!("{}SitePipelineRole", id),
            &env.account,
            ServicePrincipal::codepipeline(),
            "pipeline",
        )?
        .with_statement(scope_to(START_BUILD_ACTIONS, Some(project.arn()))?)
        .with_statement(artifact_store.grant_read_write()?)
        .with_statement(bucket.grant_put_write()?);

        let source_artifact = ArtifactName::new(SOURCE_ARTIFACT);
        let site_artifact = ArtifactName::new(SITE_ARTIFACT);
        let pipeline = PipelineBuilder::new(&format!("{}SiteDeploymentPipeline", id))
            .stage(
                Stage::new("Source", PipelineState::SourceFetched).action(Action::source(
                    "GithubSource",
                    config.source.clone(),
                    source_artifact.clone(),
                )),
            )
            .stage(
                Stage::new("Build", PipelineState::Built).action(
                    Action::build("BuildSite", project, source_artifact)
                        .with_output(site_artifact.clone()),
                ),
            )
            .stage(
                Stage::new("Deploy", PipelineState::Published).action(Action::deploy_to_bucket(
                    "DeploySite",
                    &bucket,
                    site_artifact,
                )),
            )
            .build(&mut scope, pipeline_role, artifact_store, Some(bucket.clone()))?;

        info!(
            bucket = %bucket.name(),
            pipeline = %pipeline.name(),
            "Defined static site pipeline"
        );

        Ok(Self { bucket, pipeline })
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl Synthesize for StaticSitePipeline {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        self.bucket.synthesize(template)?;
        self.pipeline.synthesize(template)
    }
}
