//! Assembling every topology described by a [`BerthConfig`].
//!
//! Assembly is all-or-nothing: the first construction error is returned and
//! no template leaves this module. Topologies are independent construct trees
//! and share only the write-once [`ExportTable`].

use tracing::info;

use crate::config::BerthConfig;
use crate::construct::Scope;
use crate::error::Result;
use crate::network::{NetworkTopology, NetworkTopologyBuilder};
use crate::obs;
use crate::outputs::ExportTable;
use crate::registry::RegistryRef;
use crate::source_pipeline::SourceToRegistryPipeline;
use crate::static_site::StaticSitePipeline;
use crate::template::{Synthesize, Template};
use crate::traffic::TrafficShiftingDeployment;

/// One synthesized topology.
#[derive(Debug, Clone)]
pub struct Topology {
    pub name: String,
    pub template: Template,
}

impl Topology {
    fn synthesize(name: String, description: String, parts: &[&dyn Synthesize]) -> Result<Self> {
        let mut template = Template::new(description);
        for part in parts {
            part.synthesize(&mut template)?;
        }
        obs::emit_template_synthesized(&name, template.resources.len(), &template.digest()?);
        Ok(Self { name, template })
    }

    /// `<name>.template.json`
    pub fn file_name(&self) -> String {
        format!("{}.template.json", self.name)
    }
}

/// Everything built from one configuration.
#[derive(Debug)]
pub struct Assembly {
    source_build: SourceToRegistryPipeline,
    static_site: Option<StaticSitePipeline>,
    service: NetworkTopology,
    serverless: Option<TrafficShiftingDeployment>,
    exports: ExportTable,
    topologies: Vec<Topology>,
}

impl Assembly {
    pub fn from_config(config: &BerthConfig) -> Result<Self> {
        config.validate()?;
        let env = config.environment();
        let app = &config.app.name;
        let mut exports = ExportTable::new();
        let mut topologies = Vec::new();

        let mut root = Scope::root(&format!("{}SourceBuild", app))?;
        let source_build = SourceToRegistryPipeline::new(
            &mut root,
            &env,
            app,
            config.source.clone(),
            config.registry.untagged_retention_days,
        )?;
        exports.publish(source_build.registry().export_identifier())?;
        topologies.push(Topology::synthesize(
            root.id().to_string(),
            format!("Source, build and image registry for {}", app),
            &[&source_build],
        )?);

        let static_site = match &config.static_site {
            Some(site) => {
                let mut root = Scope::root(&format!("{}StaticSite", app))?;
                let pipeline = StaticSitePipeline::new(&mut root, &env, app, site)?;
                topologies.push(Topology::synthesize(
                    root.id().to_string(),
                    format!("Static site pipeline for {}", app),
                    &[&pipeline],
                )?);
                Some(pipeline)
            }
            None => None,
        };

        // Consumers only see the exported identifier, never the registry itself.
        let image = RegistryRef::from_export(&exports, &source_build.registry().export_name())?;

        let mut root = Scope::root(&format!("{}Service", app))?;
        let service = NetworkTopologyBuilder::new(&format!("{}Server", app), config.service.clone())
            .build(&mut root, &env, &image)?;
        topologies.push(Topology::synthesize(
            root.id().to_string(),
            format!("Load-balanced service for {}", app),
            &[&service],
        )?);

        let serverless = match (&config.serverless, config.function_name()) {
            (Some(settings), Some(function_name)) => {
                let mut root = Scope::root(&format!("{}Serverless", app))?;
                let deployment = TrafficShiftingDeployment::new(
                    &mut root,
                    &env,
                    app,
                    &image,
                    &function_name,
                    settings.rollout_policy,
                )?;
                topologies.push(Topology::synthesize(
                    root.id().to_string(),
                    format!("Traffic-shifted function for {}", app),
                    &[&deployment],
                )?);
                Some(deployment)
            }
            _ => None,
        };

        info!(
            app = %app,
            topologies = topologies.len(),
            exports = exports.len(),
            "Assembled topologies"
        );

        Ok(Self {
            source_build,
            static_site,
            service,
            serverless,
            exports,
            topologies,
        })
    }

    pub fn source_build(&self) -> &SourceToRegistryPipeline {
        &self.source_build
    }

    pub fn static_site(&self) -> Option<&StaticSitePipeline> {
        self.static_site.as_ref()
    }

    pub fn service(&self) -> &NetworkTopology {
        &self.service
    }

    pub fn serverless(&self) -> Option<&TrafficShiftingDeployment> {
        self.serverless.as_ref()
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    pub fn topologies(&self) -> &[Topology] {
        &self.topologies
    }

    pub fn into_serverless(self) -> Option<TrafficShiftingDeployment> {
        self.serverless
    }
}
