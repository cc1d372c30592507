//! Synthesized provider templates.
//!
//! A [`Template`] is the JSON document handed to the external provisioning
//! engine: resources keyed by logical id plus named outputs. Components write
//! into it through [`Synthesize`]; duplicate logical ids and export names are
//! rejected so a topology can never shadow one of its own resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{BerthError, Result};

/// One resource entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,

    #[serde(rename = "Properties")]
    pub properties: Value,

    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// How the provisioning engine applies updates, e.g. handing an alias
    /// update to a deployment group.
    #[serde(rename = "UpdatePolicy", default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<Value>,

    #[serde(rename = "DeletionPolicy", default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

/// What happens to the physical resource when it leaves the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    Delete,
    Retain,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: Vec::new(),
            update_policy: None,
            deletion_policy: None,
        }
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }

    pub fn with_update_policy(mut self, policy: Value) -> Self {
        self.update_policy = Some(policy);
        self
    }

    pub fn with_deletion_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self
    }
}

/// A named output, optionally exported for other topologies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateOutput {
    #[serde(rename = "Value")]
    pub value: Value,

    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Export", skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportName {
    #[serde(rename = "Name")]
    pub name: String,
}

/// The synthesized document for one topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Resource>,

    #[serde(rename = "Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, TemplateOutput>,
}

impl Template {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Self::default()
        }
    }

    /// Add a resource. Fails if the logical id is already present.
    pub fn add_resource(&mut self, logical_id: &str, resource: Resource) -> Result<()> {
        if self.resources.contains_key(logical_id) {
            return Err(BerthError::DuplicateResource(logical_id.to_string()));
        }
        self.resources.insert(logical_id.to_string(), resource);
        Ok(())
    }

    /// Add an output. Fails if the output name is already present.
    pub fn add_output(&mut self, name: &str, output: TemplateOutput) -> Result<()> {
        if self.outputs.contains_key(name) {
            return Err(BerthError::DuplicateExport(name.to_string()));
        }
        self.outputs.insert(name.to_string(), output);
        Ok(())
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    /// Resources of one type, in logical-id order.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// SHA-256 over the compact serialization. Keys are ordered, so equal
    /// templates always share a digest.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Components that emit resources into a template.
pub trait Synthesize {
    fn synthesize(&self, template: &mut Template) -> Result<()>;
}

/// `{"Ref": id}`
pub fn reference(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

/// `{"Fn::GetAtt": [id, attribute]}`
pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut t = Template::new("test");
        t.add_resource("Bucket", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        let err = t
            .add_resource("Bucket", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap_err();
        assert!(matches!(err, BerthError::DuplicateResource(_)));
    }

    #[test]
    fn test_depends_on_skipped_when_empty() {
        let mut t = Template::new("test");
        t.add_resource("A", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        t.add_resource(
            "B",
            Resource::new("AWS::S3::Bucket", json!({})).depends_on("A"),
        )
        .unwrap();
        let v = serde_json::to_value(&t).unwrap();
        assert!(v["Resources"]["A"].get("DependsOn").is_none());
        assert_eq!(v["Resources"]["B"]["DependsOn"], json!(["A"]));
    }

    #[test]
    fn test_update_and_deletion_policies_serialize_when_set() {
        let mut t = Template::new("test");
        t.add_resource("Plain", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        t.add_resource(
            "Alias",
            Resource::new("AWS::Lambda::Alias", json!({}))
                .with_update_policy(json!({ "CodeDeployLambdaAliasUpdate": {} }))
                .with_deletion_policy(DeletionPolicy::Delete),
        )
        .unwrap();
        let v = serde_json::to_value(&t).unwrap();
        assert!(v["Resources"]["Plain"].get("UpdatePolicy").is_none());
        assert!(v["Resources"]["Plain"].get("DeletionPolicy").is_none());
        assert!(v["Resources"]["Alias"]["UpdatePolicy"]
            .get("CodeDeployLambdaAliasUpdate")
            .is_some());
        assert_eq!(v["Resources"]["Alias"]["DeletionPolicy"], "Delete");
    }

    #[test]
    fn test_digest_is_deterministic() {
        let build = || {
            let mut t = Template::new("d");
            t.add_resource("Z", Resource::new("T", json!({"b": 1, "a": 2})))
                .unwrap();
            t.add_resource("A", Resource::new("T", json!({})))
                .unwrap();
            t
        };
        assert_eq!(build().digest().unwrap(), build().digest().unwrap());
    }

    #[test]
    fn test_resources_of_type() {
        let mut t = Template::new("d");
        t.add_resource("A", Resource::new("AWS::EC2::SecurityGroup", json!({})))
            .unwrap();
        t.add_resource("B", Resource::new("AWS::S3::Bucket", json!({})))
            .unwrap();
        assert_eq!(t.resources_of_type("AWS::EC2::SecurityGroup").count(), 1);
    }
}
