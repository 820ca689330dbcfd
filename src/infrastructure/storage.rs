use crate::config::{RetryPolicy, StorageBackend, StorageConfig};
use crate::services::storage::{BlobStore, MemoryBlobStore, S3BlobStore};
use crate::utils::retry::retry_connect;
use anyhow::Context;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(
    config: &StorageConfig,
    retry: RetryPolicy,
) -> anyhow::Result<Arc<dyn BlobStore>> {
    if config.backend == StorageBackend::Memory {
        info!("🧪 In-memory blob store (Bucket: {})", config.bucket);
        return Ok(Arc::new(MemoryBlobStore::new(config.bucket.clone())));
    }

    info!(
        "☁️  S3 Storage: {} (Bucket: {})",
        config.endpoint, config.bucket
    );

    let aws_config = aws_config::from_env()
        .endpoint_url(&config.endpoint)
        .region(Region::new(config.region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    // The object store may still be starting when we come up
    let client = &s3_client;
    retry_connect(retry, "Object store", move || async move {
        client
            .list_buckets()
            .send()
            .await
            .map(|_| ())
            .map_err(|e| DisplayErrorContext(e).to_string())
    })
    .await
    .map_err(anyhow::Error::msg)
    .context("object store unreachable")?;

    // Ensure bucket exists
    match s3_client.head_bucket().bucket(&config.bucket).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", config.bucket),
        Err(_) => {
            info!("🪣 Bucket '{}' not found, creating...", config.bucket);
            s3_client
                .create_bucket()
                .bucket(&config.bucket)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(e)))
                .with_context(|| format!("failed to create bucket '{}'", config.bucket))?;
            info!("✅ Bucket '{}' created successfully", config.bucket);
        }
    }

    Ok(Arc::new(S3BlobStore::new(
        s3_client,
        config.bucket.clone(),
        config.chunk_size,
    )))
}
