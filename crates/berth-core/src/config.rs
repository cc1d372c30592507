//! `berth.toml` loading and validation.
//!
//! Every table is closed: unknown keys fail the parse instead of being
//! ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::arn::Environment;
use crate::error::{BerthError, Result};
use crate::network::ServiceConfig;
use crate::source::SourceReference;
use crate::static_site::StaticSiteConfig;
use crate::traffic::RolloutPolicy;

/// Environment variable consulted when no config path is given.
pub const CONFIG_ENV_VAR: &str = "BERTH_CONFIG";

pub const DEFAULT_CONFIG_FILE: &str = "berth.toml";

/// `[app]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Base identifier for every topology; alphanumeric, starting with a letter.
    pub name: String,
    pub account: String,
    pub region: String,
}

fn default_retention_days() -> u32 {
    7
}

/// `[registry]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_retention_days")]
    pub untagged_retention_days: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            untagged_retention_days: default_retention_days(),
        }
    }
}

/// `[serverless]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerlessConfig {
    #[serde(default)]
    pub rollout_policy: RolloutPolicy,

    /// Defaults to `<app.name>Lambda`.
    #[serde(default)]
    pub function_name: Option<String>,
}

/// The whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BerthConfig {
    pub app: AppConfig,
    pub source: SourceReference,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub static_site: Option<StaticSiteConfig>,

    #[serde(default)]
    pub serverless: Option<ServerlessConfig>,
}

impl BerthConfig {
    /// Parse and validate.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: BerthConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn environment(&self) -> Environment {
        Environment::new(self.app.account.clone(), self.app.region.clone())
    }

    pub fn function_name(&self) -> Option<String> {
        self.serverless.as_ref().map(|s| {
            s.function_name
                .clone()
                .unwrap_or_else(|| format!("{}Lambda", self.app.name))
        })
    }

    pub fn validate(&self) -> Result<()> {
        let name = &self.app.name;
        let starts_with_letter = name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic())
            .unwrap_or(false);
        if !starts_with_letter || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BerthError::InvalidConfig(format!(
                "app.name '{}' must be alphanumeric and start with a letter",
                name
            )));
        }
        if self.app.account.is_empty() || !self.app.account.chars().all(|c| c.is_ascii_digit()) {
            return Err(BerthError::InvalidConfig(
                "app.account must be a numeric account id".to_string(),
            ));
        }
        if self.app.region.trim().is_empty() {
            return Err(BerthError::InvalidConfig(
                "app.region must not be empty".to_string(),
            ));
        }

        self.source.validate()?;

        if self.registry.untagged_retention_days == 0 {
            return Err(BerthError::InvalidConfig(
                "registry.untagged_retention_days must be at least 1".to_string(),
            ));
        }

        self.service.validate()?;

        if let Some(site) = &self.static_site {
            site.validate()?;
        }
        if let Some(function_name) = self
            .serverless
            .as_ref()
            .and_then(|s| s.function_name.as_deref())
        {
            if function_name.trim().is_empty() {
                return Err(BerthError::InvalidConfig(
                    "serverless.function_name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
