//! Object-storage buckets.
//!
//! [`Bucket`] is the definition that ends up in a template; [`ObjectStore`]
//! models bucket contents so deploys and website routing can be exercised
//! without a provider.

use std::collections::BTreeMap;

use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::arn::{Environment, ResourceArn};
use crate::construct::Scope;
use crate::error::Result;
use crate::policy::{PolicyScopeBuilder, PolicyStatement};
use crate::template::{reference, DeletionPolicy, Resource, Synthesize, Template};

const MAX_BUCKET_NAME: usize = 63;

/// Static website routing for a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebsiteConfig {
    pub index_document: String,
    pub error_document: String,
}

impl WebsiteConfig {
    /// Single-page-app routing: unresolved paths serve the entry document.
    pub fn single_page_app(index_document: &str) -> Self {
        Self {
            index_document: index_document.to_string(),
            error_document: index_document.to_string(),
        }
    }
}

/// A bucket definition.
#[derive(Debug, Clone)]
pub struct Bucket {
    logical_id: String,
    name: String,
    arn: ResourceArn,
    region: String,
    website: Option<WebsiteConfig>,
    public_read: bool,
    auto_delete_objects: bool,
}

impl Bucket {
    /// Private, TLS-only bucket with a deterministic physical name.
    pub fn new(scope: &mut Scope, env: &Environment, id: &str) -> Result<Self> {
        let logical_id = scope.resource(id)?;
        let name = bucket_name(&format!("{}/{}", scope.path(), id), &env.account);
        let arn = env.global_arn("s3", &name)?;
        Ok(Self {
            logical_id,
            name,
            arn,
            region: env.region.clone(),
            website: None,
            public_read: false,
            auto_delete_objects: false,
        })
    }

    /// Serve the bucket as a public website.
    pub fn with_website(mut self, website: WebsiteConfig) -> Self {
        self.website = Some(website);
        self.public_read = true;
        self
    }

    /// Empty and delete the bucket when it leaves the template. Buckets
    /// without this are retained.
    pub fn with_auto_delete_objects(mut self) -> Self {
        self.auto_delete_objects = true;
        self
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> &ResourceArn {
        &self.arn
    }

    /// Identifier covering every object in the bucket.
    pub fn objects_arn(&self) -> ResourceArn {
        self.arn.everything_under('/')
    }

    pub fn website(&self) -> Option<&WebsiteConfig> {
        self.website.as_ref()
    }

    pub fn is_public_read(&self) -> bool {
        self.public_read
    }

    pub fn deletion_policy(&self) -> DeletionPolicy {
        if self.auto_delete_objects {
            DeletionPolicy::Delete
        } else {
            DeletionPolicy::Retain
        }
    }

    pub fn website_url(&self) -> Option<String> {
        self.website
            .as_ref()
            .map(|_| format!("http://{}.s3-website-{}.amazonaws.com", self.name, self.region))
    }

    /// Read and write access to this bucket and its objects.
    pub fn grant_read_write(&self) -> Result<PolicyStatement> {
        scope_to_all(READ_ACTIONS.iter().chain(WRITE_ACTIONS), &[self.arn.clone(), self.objects_arn()])
    }

    /// Put and write access without read, for deploy-only identities.
    pub fn grant_put_write(&self) -> Result<PolicyStatement> {
        scope_to_all(
            PUT_ACTIONS.iter().chain(WRITE_ACTIONS),
            &[self.arn.clone(), self.objects_arn()],
        )
    }
}

const READ_ACTIONS: &[&str] = &["s3:GetObject*", "s3:GetBucket*", "s3:List*"];
const WRITE_ACTIONS: &[&str] = &["s3:DeleteObject*", "s3:PutObject*", "s3:Abort*"];
const PUT_ACTIONS: &[&str] = &[
    "s3:PutObject",
    "s3:PutObjectLegalHold",
    "s3:PutObjectRetention",
    "s3:PutObjectTagging",
    "s3:PutObjectVersionTagging",
];

fn scope_to_all<'a, I>(actions: I, resources: &[ResourceArn]) -> Result<PolicyStatement>
where
    I: IntoIterator<Item = &'a &'a str>,
{
    PolicyScopeBuilder::allow().scope_to_all(actions.into_iter().copied(), resources)
}

impl Synthesize for Bucket {
    fn synthesize(&self, template: &mut Template) -> Result<()> {
        let mut properties = json!({
            "BucketName": self.name,
            "Tags": [{
                "Key": "berth:auto-delete-objects",
                "Value": self.auto_delete_objects.to_string(),
            }],
        });
        if let Some(website) = &self.website {
            properties["WebsiteConfiguration"] = json!({
                "IndexDocument": website.index_document,
                "ErrorDocument": website.error_document,
            });
        }
        if self.public_read {
            properties["PublicAccessBlockConfiguration"] = json!({
                "BlockPublicAcls": false,
                "BlockPublicPolicy": false,
                "IgnorePublicAcls": false,
                "RestrictPublicBuckets": false,
            });
        }
        template.add_resource(
            &self.logical_id,
            Resource::new("AWS::S3::Bucket", properties).with_deletion_policy(self.deletion_policy()),
        )?;

        let mut statements = vec![json!({
            "Effect": "Deny",
            "Principal": { "AWS": "*" },
            "Action": "s3:*",
            "Resource": [self.arn.as_str(), self.objects_arn().as_str()],
            "Condition": { "Bool": { "aws:SecureTransport": "false" } },
        })];
        if self.public_read {
            statements.push(json!({
                "Effect": "Allow",
                "Principal": { "AWS": "*" },
                "Action": "s3:GetObject",
                "Resource": [self.objects_arn().as_str()],
            }));
        }
        template.add_resource(
            &format!("{}Policy", self.logical_id),
            Resource::new(
                "AWS::S3::BucketPolicy",
                json!({
                    "Bucket": reference(&self.logical_id),
                    "PolicyDocument": {
                        "Version": "2012-10-17",
                        "Statement": statements,
                    },
                }),
            )
            .depends_on(self.logical_id.clone()),
        )
    }
}

/// Lowercase, dash-separated name from the construct path, trimmed to fit and
/// suffixed with a digest of the full path and account.
fn bucket_name(path: &str, account: &str) -> String {
    let mut readable = String::new();
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            readable.push(c.to_ascii_lowercase());
        } else if !readable.ends_with('-') && !readable.is_empty() {
            readable.push('-');
        }
    }
    let readable = readable.trim_end_matches('-');

    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(account.as_bytes());
    let suffix = &hex::encode(hasher.finalize())[..8];

    let budget = MAX_BUCKET_NAME - suffix.len() - 1;
    let head: String = readable.chars().take(budget).collect();
    format!("{}-{}", head.trim_end_matches('-'), suffix)
}

/// In-memory bucket contents.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    objects: BTreeMap<String, Vec<u8>>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire contents with `files`. Objects absent from `files`
    /// are removed, so repeating a deploy yields the same contents.
    pub fn replace_all(&mut self, files: BTreeMap<String, Vec<u8>>) {
        let previous = self.objects.len();
        self.objects = files;
        info!(previous = previous, current = self.objects.len(), "Replaced bucket contents");
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.objects.get(key).map(Vec::as_slice)
    }

    /// Resolve a request path through website routing: `/` and directory
    /// paths map to the index document; misses fall back to the error document.
    pub fn resolve<'a>(&'a self, website: &WebsiteConfig, path: &str) -> Option<&'a [u8]> {
        let key = path.trim_start_matches('/');
        let key = if key.is_empty() || key.ends_with('/') {
            format!("{}{}", key, website.index_document)
        } else {
            key.to_string()
        };
        self.get(&key).or_else(|| self.get(&website.error_document))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1")
    }

    #[test]
    fn test_bucket_name_shape() {
        let mut scope = Scope::root("WebApp").unwrap();
        let bucket = Bucket::new(&mut scope, &env(), "DeploymentBucket").unwrap();
        assert!(bucket.name().starts_with("webapp-deploymentbucket-"));
        assert!(bucket.name().len() <= MAX_BUCKET_NAME);
        assert!(bucket
            .name()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_eq!(bucket.arn().as_str(), format!("arn:aws:s3:::{}", bucket.name()));
    }

    #[test]
    fn test_long_paths_are_trimmed() {
        let long = "A".repeat(200);
        let name = bucket_name(&long, "1");
        assert_eq!(name.len(), MAX_BUCKET_NAME);
    }

    #[test]
    fn test_spa_website_config() {
        let site = WebsiteConfig::single_page_app("index.html");
        assert_eq!(site.index_document, site.error_document);
    }

    #[test]
    fn test_website_bucket_synthesizes_public_policy() {
        let mut scope = Scope::root("Site").unwrap();
        let bucket = Bucket::new(&mut scope, &env(), "Bucket")
            .unwrap()
            .with_website(WebsiteConfig::single_page_app("index.html"));
        let mut template = Template::new("t");
        bucket.synthesize(&mut template).unwrap();

        let res = template.resource(bucket.logical_id()).unwrap();
        assert_eq!(res.properties["WebsiteConfiguration"]["ErrorDocument"], "index.html");
        let policy = template
            .resource(&format!("{}Policy", bucket.logical_id()))
            .unwrap();
        let statements = policy.properties["PolicyDocument"]["Statement"]
            .as_array()
            .unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0]["Effect"], "Deny");
    }

    #[test]
    fn test_auto_delete_sets_deletion_policy() {
        let mut scope = Scope::root("Site").unwrap();
        let kept = Bucket::new(&mut scope, &env(), "Artifacts").unwrap();
        let removed = Bucket::new(&mut scope, &env(), "Website")
            .unwrap()
            .with_auto_delete_objects();
        let mut template = Template::new("t");
        kept.synthesize(&mut template).unwrap();
        removed.synthesize(&mut template).unwrap();

        let json = serde_json::to_value(&template).unwrap();
        assert_eq!(json["Resources"][kept.logical_id()]["DeletionPolicy"], "Retain");
        assert_eq!(json["Resources"][removed.logical_id()]["DeletionPolicy"], "Delete");
        assert!(json["Resources"][format!("{}Policy", removed.logical_id())]
            .get("DeletionPolicy")
            .is_none());
    }

    #[test]
    fn test_grants_cover_bucket_and_objects() {
        let mut scope = Scope::root("Site").unwrap();
        let bucket = Bucket::new(&mut scope, &env(), "Bucket").unwrap();
        let object = bucket.arn().join("index.html").unwrap();

        let deploy = bucket.grant_put_write().unwrap();
        assert!(deploy.allows("s3:PutObject", &object));
        assert!(deploy.allows("s3:DeleteObject", &object));
        assert!(!deploy.allows("s3:GetObject", &object));
        assert!(!deploy.is_wildcard());

        let rw = bucket.grant_read_write().unwrap();
        assert!(rw.allows("s3:GetObject", &object));
        assert!(rw.allows("s3:ListBucket", bucket.arn()));
    }

    #[test]
    fn test_replace_all_is_not_additive() {
        let mut store = ObjectStore::new();
        store.replace_all(BTreeMap::from([
            ("index.html".to_string(), b"v1".to_vec()),
            ("old.js".to_string(), b"x".to_vec()),
        ]));
        store.replace_all(BTreeMap::from([("index.html".to_string(), b"v2".to_vec())]));
        assert_eq!(store.len(), 1);
        assert!(store.get("old.js").is_none());
        assert_eq!(store.get("index.html"), Some(&b"v2"[..]));
    }

    #[test]
    fn test_spa_fallback_resolution() {
        let site = WebsiteConfig::single_page_app("index.html");
        let mut store = ObjectStore::new();
        store.replace_all(BTreeMap::from([
            ("index.html".to_string(), b"<app>".to_vec()),
            ("static/main.js".to_string(), b"js".to_vec()),
        ]));
        assert_eq!(store.resolve(&site, "/"), Some(&b"<app>"[..]));
        assert_eq!(store.resolve(&site, "/static/main.js"), Some(&b"js"[..]));
        assert_eq!(store.resolve(&site, "/books/42"), Some(&b"<app>"[..]));
    }
}
