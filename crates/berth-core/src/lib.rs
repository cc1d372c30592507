//! Berth core library
//!
//! Construct composition, least-privilege policy scoping and pipeline
//! assembly for two deployment topologies: a source-to-registry (and
//! optional static-site) delivery pipeline, and a load-balanced compute
//! service with an optional traffic-shifted serverless variant.
//!
//! Everything here runs at construction time and produces static templates.
//! Runtime behaviour (running stages, driving rollouts) lives in `berth-ci`.

pub mod app;
pub mod arn;
pub mod build_project;
pub mod config;
pub mod construct;
pub mod error;
pub mod network;
pub mod obs;
pub mod outputs;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod source;
pub mod source_pipeline;
pub mod static_site;
pub mod storage;
pub mod telemetry;
pub mod template;
pub mod traffic;

pub use app::{Assembly, Topology};
pub use arn::{Environment, ResourceArn};
pub use build_project::{BuildEnvironment, BuildPhase, BuildProject, BuildSpec};
pub use config::{BerthConfig, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};
pub use construct::Scope;
pub use error::{BerthError, Result, WiringError};
pub use network::{
    BackSecurityGroup, FrontSecurityGroup, IsolatedNetwork, NatGateway, NetworkTopology,
    NetworkTopologyBuilder, Peer, RouteTable, RouteTarget, ServiceConfig,
};
pub use outputs::{ExportTable, NamedOutput};
pub use pipeline::{
    validate_wiring, Action, ActionKind, ArtifactName, Pipeline, PipelineBuilder, PipelineState,
    PublishTarget, Stage,
};
pub use policy::{
    scope_to, Effect, IdentityRole, PolicyScopeBuilder, PolicyStatement, ResourceScope,
    ServicePrincipal, UNSCOPED_ACTIONS,
};
pub use registry::{
    ArtifactRegistryManager, ImageStore, ImageVersion, Registry, RegistryRef, RetentionRule,
};
pub use source::SourceReference;
pub use source_pipeline::SourceToRegistryPipeline;
pub use static_site::{StaticSiteConfig, StaticSitePipeline};
pub use storage::{Bucket, ObjectStore, WebsiteConfig};
pub use template::{DeletionPolicy, Synthesize, Template};
pub use traffic::{
    Alias, DeploymentGroup, Rollout, RolloutPolicy, RolloutState, TrafficShiftingDeployment,
    TrafficStep,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
