//! Versioned image registries and their retention rule.
//!
//! [`ArtifactRegistryManager`] defines registries; [`ImageStore`] models the
//! images a registry holds so retention can be evaluated against a clock.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::arn::{Environment, ResourceArn};
use crate::construct::Scope;
use crate::error::{BerthError, Result};
use crate::outputs::{ExportTable, NamedOutput};
use crate::template::{Resource, Synthesize, Template};

const PHYSICAL_NAME_SUFFIX: &str = "-repo";
const EXPORT_SUFFIX: &str = "EcrRepoArn";

/// Which images a retention rule may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Untagged,
}

/// Expire images matching `tag_status` once they are older than `max_age`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionRule {
    priority: u32,
    tag_status: TagStatus,
    max_age_days: u32,
}

impl RetentionRule {
    pub fn untagged_older_than(days: u32) -> Result<Self> {
        if days == 0 {
            return Err(BerthError::InvalidConfig(
                "retention max age must be at least one day".to_string(),
            ));
        }
        Ok(Self {
            priority: 1,
            tag_status: TagStatus::Untagged,
            max_age_days: days,
        })
    }

    pub fn max_age(&self) -> Duration {
        Duration::days(i64::from(self.max_age_days))
    }

    pub fn max_age_days(&self) -> u32 {
        self.max_age_days
    }

    pub fn description(&self) -> String {
        format!("Remove untagged images after {} days", self.max_age_days)
    }

    /// Whether this rule expires `image` at `now`. Tagged images never match.
    pub fn selects(&self, image: &ImageVersion, now: DateTime<Utc>) -> bool {
        match self.tag_status {
            TagStatus::Untagged => image.is_untagged() && now - image.pushed_at > self.max_age(),
        }
    }

    /// Registry lifecycle policy text.
    pub fn lifecycle_policy(&self) -> serde_json::Value {
        json!({
            "rules": [{
                "rulePriority": self.priority,
                "description": self.description(),
                "selection": {
                    "tagStatus": self.tag_status,
                    "countType": "sinceImagePushed",
                    "countUnit": "days",
                    "countNumber": self.max_age_days,
                },
                "action": { "type": "expire" },
            }]
        })
    }
}

/// A registry definition.
#[derive(Debug, Clone)]
pub struct Registry {
    logical_id: String,
    id: String,
    name: String,
    arn: ResourceArn,
    uri: String,
    retention: RetentionRule,
}

impl Registry {
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    /// Logical (construct) name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Physical repository name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &ResourceArn {
        &self.arn
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn retention(&self) -> &RetentionRule {
        &self.retention
    }

    /// Deterministic export name, `<id>EcrRepoArn`.
    pub fn export_name(&self) -> String {
        format!("{}{}", self.id, EXPORT_SUFFIX)
    }

    /// The registry ARN as a named, cross-topology output.
    pub fn export_identifier(&self) -> NamedOutput {
        NamedOutput::new(
            self.export_name(),
            self.arn.as_str(),
            format!("{}'s ECR repo ARN", self.id),
        )
    }

    /// Non-owning handle for other components.
    pub fn reference(&self) -> RegistryRef {
        RegistryRef {
            arn: self.arn.clone(),
            name: self.name.clone(),
            uri: self.uri.clone(),
        }
    }
}

impl Synthesize for Registry {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        template.add_resource(
            &self.logical_id,
            Resource::new(
                "AWS::ECR::Repository",
                json!({
                    "RepositoryName": self.name,
                    "LifecyclePolicy": {
                        "LifecyclePolicyText": self.retention.lifecycle_policy().to_string(),
                    },
                }),
            ),
        )?;
        self.export_identifier().write_to(template)
    }
}

/// Defines registries in one environment.
#[derive(Debug, Clone)]
pub struct ArtifactRegistryManager {
    env: Environment,
}

impl ArtifactRegistryManager {
    pub fn new(env: Environment) -> Self {
        Self { env }
    }

    /// Define a registry named after `id`, expiring untagged images older
    /// than `retention_days`.
    ///
    /// The physical name is `id` case-folded plus `-repo`. Ids that would need
    /// any other change to become a valid repository name are rejected.
    pub fn create_registry(&self, scope: &mut Scope, id: &str, retention_days: u32) -> Result<Registry> {
        let name = physical_name(id)?;
        let retention = RetentionRule::untagged_older_than(retention_days)?;
        let logical_id = scope.resource(&format!("{}Repository", id))?;
        let arn = self.env.arn("ecr", &format!("repository/{}", name))?;
        let uri = repository_uri(&self.env.account, &self.env.region, &name);

        info!(
            registry = %name,
            retention_days = retention_days,
            "Defined image registry"
        );

        Ok(Registry {
            logical_id,
            id: id.to_string(),
            name,
            arn,
            uri,
            retention,
        })
    }
}

fn physical_name(id: &str) -> Result<String> {
    let folded = id.to_lowercase();
    let valid_start = folded
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let valid_chars = folded
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
    if !valid_start || !valid_chars {
        return Err(BerthError::InvalidIdentifier(format!(
            "registry id '{}' cannot be case-folded into a repository name",
            id
        )));
    }
    Ok(format!("{}{}", folded, PHYSICAL_NAME_SUFFIX))
}

fn repository_uri(account: &str, region: &str, name: &str) -> String {
    format!("{}.dkr.ecr.{}.amazonaws.com/{}", account, region, name)
}

/// Non-owning reference to a registry, typically resolved from an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRef {
    arn: ResourceArn,
    name: String,
    uri: String,
}

impl RegistryRef {
    /// Rebuild a reference from a registry ARN.
    pub fn from_arn(arn: ResourceArn) -> Result<Self> {
        if arn.service() != "ecr" {
            return Err(BerthError::InvalidIdentifier(format!(
                "'{}' is not a registry identifier",
                arn
            )));
        }
        let name = arn
            .resource()
            .strip_prefix("repository/")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                BerthError::InvalidIdentifier(format!("'{}' does not name a repository", arn))
            })?
            .to_string();
        let uri = repository_uri(arn.account(), arn.region(), &name);
        Ok(Self { arn, name, uri })
    }

    /// Resolve a reference from a published export.
    pub fn from_export(exports: &ExportTable, export_name: &str) -> Result<Self> {
        let raw = exports.lookup(export_name)?;
        Self::from_arn(ResourceArn::parse(raw)?)
    }

    pub fn arn(&self) -> &ResourceArn {
        &self.arn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// `<uri>:<tag>`
    pub fn image(&self, tag: &str) -> String {
        format!("{}:{}", self.uri, tag)
    }
}

/// One pushed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVersion {
    pub digest: String,
    pub tags: BTreeSet<String>,
    pub pushed_at: DateTime<Utc>,
}

impl ImageVersion {
    pub fn is_untagged(&self) -> bool {
        self.tags.is_empty()
    }
}

/// In-memory contents of a registry.
///
/// Tags are unique across the store: pushing a tag that already points at
/// another image moves it, leaving the older image untagged.
#[derive(Debug, Clone, Default)]
pub struct ImageStore {
    images: BTreeMap<String, ImageVersion>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a push of `digest`, optionally under `tag`. Re-pushing a known
    /// digest refreshes its push time.
    pub fn push(&mut self, digest: &str, tag: Option<&str>, at: DateTime<Utc>) {
        if let Some(tag) = tag {
            for image in self.images.values_mut() {
                image.tags.remove(tag);
            }
        }
        let image = self
            .images
            .entry(digest.to_string())
            .or_insert_with(|| ImageVersion {
                digest: digest.to_string(),
                tags: BTreeSet::new(),
                pushed_at: at,
            });
        image.pushed_at = at;
        if let Some(tag) = tag {
            image.tags.insert(tag.to_string());
        }
        debug!(digest = %digest, tag = ?tag, "Recorded image push");
    }

    /// Expire every image `rule` selects at `now`. Returns removed digests.
    pub fn apply_retention(&mut self, rule: &RetentionRule, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .images
            .values()
            .filter(|image| rule.selects(image, now))
            .map(|image| image.digest.clone())
            .collect();
        for digest in &expired {
            self.images.remove(digest);
        }
        if !expired.is_empty() {
            info!(expired = expired.len(), "Applied registry retention");
        }
        expired
    }

    pub fn get(&self, digest: &str) -> Option<&ImageVersion> {
        self.images.get(digest)
    }

    /// The image currently carrying `tag`.
    pub fn tagged(&self, tag: &str) -> Option<&ImageVersion> {
        self.images.values().find(|image| image.tags.contains(tag))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageVersion> {
        self.images.values()
    }
}
