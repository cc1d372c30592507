//! Resource identifiers.
//!
//! A [`ResourceArn`] always names a concrete resource. Parsing rejects `*` and
//! `?` in every segment, so [`crate::policy`] can tell scoped statements from
//! unscoped ones by type instead of by string inspection. The one pattern
//! form is [`ResourceArn::everything_under`], which can only extend an
//! identifier that already parsed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

const PARTITION: &str = "aws";
const WILDCARDS: &[char] = &['*', '?'];

/// A concrete resource identifier (`arn:partition:service:region:account:resource`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceArn(String);

impl ResourceArn {
    /// Parse and validate an identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" {
            return Err(BerthError::InvalidIdentifier(format!(
                "'{}' is not of the form arn:partition:service:region:account:resource",
                raw
            )));
        }
        if parts[1].is_empty() || parts[2].is_empty() {
            return Err(BerthError::InvalidIdentifier(format!(
                "'{}' is missing a partition or service",
                raw
            )));
        }
        if parts[5].is_empty() {
            return Err(BerthError::InvalidIdentifier(format!(
                "'{}' does not name a specific resource",
                raw
            )));
        }
        if raw.contains(WILDCARDS) {
            return Err(BerthError::InvalidIdentifier(format!(
                "'{}' contains a wildcard and does not name a specific resource",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Build an identifier from its parts.
    pub fn build(service: &str, region: &str, account: &str, resource: &str) -> Result<Self> {
        Self::parse(&format!(
            "arn:{}:{}:{}:{}:{}",
            PARTITION, service, region, account, resource
        ))
    }

    /// The service segment (`ecr`, `s3`, ...).
    pub fn service(&self) -> &str {
        self.0.split(':').nth(2).unwrap_or_default()
    }

    /// The region segment (empty for global services).
    pub fn region(&self) -> &str {
        self.0.split(':').nth(3).unwrap_or_default()
    }

    /// The account segment (empty for global services).
    pub fn account(&self) -> &str {
        self.0.split(':').nth(4).unwrap_or_default()
    }

    /// The resource segment (everything after the fifth colon).
    pub fn resource(&self) -> &str {
        self.0.splitn(6, ':').nth(5).unwrap_or_default()
    }

    /// A concrete child of this resource, e.g. `bucket/index.html`.
    pub fn join(&self, suffix: &str) -> Result<Self> {
        Self::parse(&format!("{}/{}", self.0, suffix))
    }

    /// Pattern covering every child of this resource: `bucket/*` with `'/'`,
    /// `log-group:name:*` with `':'`.
    pub(crate) fn everything_under(&self, separator: char) -> Self {
        Self(format!("{}{}*", self.0, separator))
    }

    /// Whether this is a pattern from [`ResourceArn::everything_under`].
    pub fn is_pattern(&self) -> bool {
        self.0.ends_with('*')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceArn {
    type Error = BerthError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourceArn> for String {
    fn from(value: ResourceArn) -> Self {
        value.0
    }
}

/// Target account and region for a topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }

    /// Regional, account-scoped identifier.
    pub fn arn(&self, service: &str, resource: &str) -> Result<ResourceArn> {
        ResourceArn::build(service, &self.region, &self.account, resource)
    }

    /// Identifier for a global, account-less service such as S3.
    pub fn global_arn(&self, service: &str, resource: &str) -> Result<ResourceArn> {
        ResourceArn::build(service, "", "", resource)
    }

    /// Availability zone names, `<region>a`, `<region>b`, ...
    pub fn availability_zones(&self, count: usize) -> Vec<String> {
        (b'a'..=b'z')
            .take(count)
            .map(|suffix| format!("{}{}", self.region, suffix as char))
            .collect()
    }
}
