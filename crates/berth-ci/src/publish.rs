//! Publishing stage results to their targets.

use std::collections::HashMap;

use async_trait::async_trait;
use berth_core::pipeline::PublishTarget;
use berth_core::{ImageStore, ObjectStore};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::executor::Artifact;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish to `target`. Returns an identifier for what was published:
    /// an image digest, or the bucket name.
    async fn publish(&self, target: &PublishTarget, artifact: Option<&Artifact>) -> anyhow::Result<String>;
}

/// Registries and buckets held in memory, keyed by name.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    registries: Mutex<HashMap<String, ImageStore>>,
    buckets: Mutex<HashMap<String, ObjectStore>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a registry's images.
    pub async fn registry(&self, name: &str) -> Option<ImageStore> {
        self.registries.lock().await.get(name).cloned()
    }

    /// Snapshot of a bucket's objects.
    pub async fn bucket(&self, name: &str) -> Option<ObjectStore> {
        self.buckets.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, target: &PublishTarget, artifact: Option<&Artifact>) -> anyhow::Result<String> {
        match target {
            PublishTarget::Registry { registry, tag } => {
                let digest = format!("sha256:{}", Uuid::new_v4().simple());
                self.registries
                    .lock()
                    .await
                    .entry(registry.name().to_string())
                    .or_default()
                    .push(&digest, Some(tag), Utc::now());
                info!(registry = %registry.name(), tag = %tag, digest = %digest, "Pushed image");
                Ok(digest)
            }
            PublishTarget::ObjectStore { bucket } => {
                let artifact = artifact.ok_or_else(|| {
                    anyhow::anyhow!("Nothing to publish to bucket {}", bucket)
                })?;
                self.buckets
                    .lock()
                    .await
                    .entry(bucket.clone())
                    .or_default()
                    .replace_all(artifact.files.clone());
                Ok(bucket.clone())
            }
        }
    }
}
