//! Version-controlled source locations.

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

/// Where a pipeline fetches source from, and which secret authenticates it.
///
/// Fields are private so a reference cannot change once validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceReference {
    owner_alias: String,
    repo_name: String,
    branch: String,
    auth_token_alias: String,
}

impl SourceReference {
    pub fn new(
        owner_alias: impl Into<String>,
        repo_name: impl Into<String>,
        branch: impl Into<String>,
        auth_token_alias: impl Into<String>,
    ) -> Result<Self> {
        let reference = Self {
            owner_alias: owner_alias.into(),
            repo_name: repo_name.into(),
            branch: branch.into(),
            auth_token_alias: auth_token_alias.into(),
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Re-check a reference that came in through deserialization.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("owner_alias", &self.owner_alias),
            ("repo_name", &self.repo_name),
            ("branch", &self.branch),
            ("auth_token_alias", &self.auth_token_alias),
        ] {
            if value.trim().is_empty() {
                return Err(BerthError::InvalidConfig(format!(
                    "source.{} must not be empty",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn owner_alias(&self) -> &str {
        &self.owner_alias
    }

    pub fn repo_name(&self) -> &str {
        &self.repo_name
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Name of the secret holding the host access token. Resolved by the
    /// provider at run time; the token itself never enters a template.
    pub fn auth_token_alias(&self) -> &str {
        &self.auth_token_alias
    }

    /// `owner/repo@branch`
    pub fn display_name(&self) -> String {
        format!("{}/{}@{}", self.owner_alias, self.repo_name, self.branch)
    }
}
