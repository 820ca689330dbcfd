use crate::services::broker::JobRequest;
use crate::services::storage::BlobStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// The transformation step of the processing worker. Returns the object key of
/// the produced artifact.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &JobRequest) -> Result<String>;
}

/// Streams the input object to a fresh `<prefix>/<uuid>.bin` key unchanged.
pub struct CopyProcessor {
    storage: Arc<dyn BlobStore>,
    output_prefix: String,
}

impl CopyProcessor {
    pub fn new(storage: Arc<dyn BlobStore>, output_prefix: impl Into<String>) -> Self {
        Self {
            storage,
            output_prefix: output_prefix.into(),
        }
    }

    pub fn output_key(&self) -> String {
        format!(
            "{}/{}.bin",
            self.output_prefix.trim_end_matches('/'),
            Uuid::new_v4()
        )
    }
}

#[async_trait]
impl JobProcessor for CopyProcessor {
    async fn process(&self, job: &JobRequest) -> Result<String> {
        let input = self
            .storage
            .get_stream(&job.object_key)
            .await
            .with_context(|| format!("fetching input {}", job.object_key))?;

        let output_key = self.output_key();
        let written = self
            .storage
            .put_stream(&output_key, input.reader, Some(input.size))
            .await
            .with_context(|| format!("writing output {}", output_key))?;

        tracing::info!(
            "⚙️  Job {} ({}): {} -> {} ({} bytes)",
            job.id,
            job.filename,
            job.object_key,
            output_key,
            written
        );
        Ok(output_key)
    }
}
