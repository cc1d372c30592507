//! Named, cross-topology outputs.
//!
//! An export is written once by the topology that owns the resource and read
//! by any number of other topologies. Readers only ever get the value string,
//! never the owning construct.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::info;

use crate::error::{BerthError, Result};
use crate::template::{ExportName, Template, TemplateOutput};

/// A value published under a deterministic export name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedOutput {
    pub name: String,
    pub value: String,
    pub description: String,
}

impl NamedOutput {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            description: description.into(),
        }
    }

    /// Write this output, exported under its own name, into `template`.
    pub fn write_to(&self, template: &mut Template) -> Result<()> {
        template.add_output(
            &self.name,
            TemplateOutput {
                value: json!(self.value),
                description: Some(self.description.clone()),
                export: Some(ExportName {
                    name: self.name.clone(),
                }),
            },
        )
    }
}

/// Write-once table of exports shared between topologies.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    entries: BTreeMap<String, NamedOutput>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an export. A name can only be published once.
    pub fn publish(&mut self, output: NamedOutput) -> Result<()> {
        if self.entries.contains_key(&output.name) {
            return Err(BerthError::DuplicateExport(output.name));
        }
        info!(export = %output.name, "Published export");
        self.entries.insert(output.name.clone(), output);
        Ok(())
    }

    /// Look up an export value by name.
    pub fn lookup(&self, name: &str) -> Result<&str> {
        self.entries
            .get(name)
            .map(|o| o.value.as_str())
            .ok_or_else(|| BerthError::UnknownExport(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedOutput> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_is_write_once() {
        let mut table = ExportTable::new();
        table
            .publish(NamedOutput::new("SvcEcrRepoArn", "arn:aws:ecr:r:a:repository/x", "d"))
            .unwrap();
        let err = table
            .publish(NamedOutput::new("SvcEcrRepoArn", "other", "d"))
            .unwrap_err();
        assert!(matches!(err, BerthError::DuplicateExport(_)));
        assert_eq!(table.lookup("SvcEcrRepoArn").unwrap(), "arn:aws:ecr:r:a:repository/x");
    }

    #[test]
    fn test_unknown_export() {
        let table = ExportTable::new();
        assert!(matches!(
            table.lookup("Missing"),
            Err(BerthError::UnknownExport(_))
        ));
    }

    #[test]
    fn test_write_to_template() {
        let mut template = Template::new("t");
        NamedOutput::new("SvcEcrRepoArn", "arn", "Svc's ECR repo ARN")
            .write_to(&mut template)
            .unwrap();
        let out = &template.outputs["SvcEcrRepoArn"];
        assert_eq!(out.export.as_ref().unwrap().name, "SvcEcrRepoArn");
        assert_eq!(out.value, json!("arn"));
    }
}
