use crate::config::MIN_CHUNK_SIZE;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A fetched blob: a reader over its bytes and the size the store reports.
pub struct BlobObject {
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket every key of this store lives in
    fn bucket(&self) -> &str;

    /// Streams `reader` into `key` and returns the number of bytes stored.
    async fn put_stream<'a>(
        &self,
        key: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        size_hint: Option<u64>,
    ) -> Result<u64>;

    async fn get_stream(&self, key: &str) -> Result<BlobObject>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Fills `buffer` from `reader` until it is full or the reader is exhausted.
pub async fn read_full_chunk<R>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut n = 0;
    while n < buffer.len() {
        let read = reader.read(&mut buffer[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    Ok(n)
}

pub struct S3BlobStore {
    client: Client,
    bucket: String,
    chunk_size: usize,
}

impl S3BlobStore {
    /// `chunk_size` is raised to [`MIN_CHUNK_SIZE`] if smaller.
    pub fn new(client: Client, bucket: String, chunk_size: usize) -> Self {
        Self {
            client,
            bucket,
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn put_multipart(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send + '_),
        buffer: &mut [u8],
        first_len: usize,
    ) -> Result<u64> {
        let multipart_upload_res = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;

        let upload_id = multipart_upload_res
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("No upload ID"))?
            .to_string();

        let result = self
            .upload_parts(key, &upload_id, reader, buffer, first_len)
            .await;

        if result.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!("Failed to abort multipart upload for {}: {}", key, e);
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send + '_),
        buffer: &mut [u8],
        first_len: usize,
    ) -> Result<u64> {
        let mut part_number = 1;
        let mut completed_parts = Vec::new();
        let mut total_size = 0u64;
        let mut n = first_len;

        while n > 0 {
            total_size += n as u64;
            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(part_number)
                .send()
                .await?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );

            part_number += 1;
            n = read_full_chunk(reader, buffer).await?;
        }

        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await?;

        Ok(total_size)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_stream<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        size_hint: Option<u64>,
    ) -> Result<u64> {
        let mut buffer = vec![0u8; self.chunk_size];
        let n = read_full_chunk(&mut reader, &mut buffer).await?;

        // Whole payload fits in one chunk: a plain PUT, which also covers empty bodies.
        if n < self.chunk_size {
            if let Some(expected) = size_hint.filter(|s| *s != n as u64) {
                tracing::warn!(
                    "Declared size {} differs from received {} for {}",
                    expected,
                    n,
                    key
                );
            }
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_length(n as i64)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .send()
                .await
                .with_context(|| format!("put_object {}/{}", self.bucket, key))?;
            return Ok(n as u64);
        }

        let total = self
            .put_multipart(key, reader.as_mut(), &mut buffer, n)
            .await
            .with_context(|| format!("multipart upload {}/{}", self.bucket, key))?;
        tracing::debug!("Stored {} bytes at {}/{}", total, self.bucket, key);
        Ok(total)
    }

    async fn get_stream(&self, key: &str) -> Result<BlobObject> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("get_object {}/{}", self.bucket, key))?;

        let size = res.content_length.unwrap_or(0).max(0) as u64;
        Ok(BlobObject {
            reader: Box::new(res.body.into_async_read()),
            size,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }
}

/// Blob store held entirely in process memory, for local runs and tests
pub struct MemoryBlobStore {
    bucket: String,
    objects: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }

    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.objects.insert(key.to_string(), data.into());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_stream<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
        _size_hint: Option<u64>,
    ) -> Result<u64> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let size = data.len() as u64;
        self.objects.insert(key.to_string(), Bytes::from(data));
        Ok(size)
    }

    async fn get_stream(&self, key: &str) -> Result<BlobObject> {
        let data = self
            .objects
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| anyhow::anyhow!("Key not found: {}", key))?;
        Ok(BlobObject {
            size: data.len() as u64,
            reader: Box::new(std::io::Cursor::new(data)),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(store: &MemoryBlobStore, key: &str, payload: Vec<u8>) -> Vec<u8> {
        let stored = store
            .put_stream(key, Box::new(std::io::Cursor::new(payload.clone())), None)
            .await
            .unwrap();
        assert_eq!(stored, payload.len() as u64);

        let mut object = store.get_stream(key).await.unwrap();
        assert_eq!(object.size, payload.len() as u64);
        let mut out = Vec::new();
        object.reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_round_trip_empty_payload() {
        let store = MemoryBlobStore::new("bucket");
        let out = round_trip(&store, "empty", Vec::new()).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_multi_megabyte_payload() {
        let store = MemoryBlobStore::new("bucket");
        let payload: Vec<u8> = (0..5 * 1024 * 1024 + 17).map(|i| (i % 251) as u8).collect();
        let out = round_trip(&store, "big", payload.clone()).await;
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_missing_key_fails() {
        let store = MemoryBlobStore::new("bucket");
        assert!(store.get_stream("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_read_full_chunk_spans_short_reads() {
        let pieces = std::io::Cursor::new(vec![1u8; 3])
            .chain(std::io::Cursor::new(vec![2u8; 4]))
            .chain(std::io::Cursor::new(vec![3u8; 5]));
        let mut reader = Box::new(pieces);
        let mut buffer = [0u8; 8];

        let first = read_full_chunk(&mut reader, &mut buffer).await.unwrap();
        assert_eq!(first, 8);
        assert_eq!(&buffer[..], &[1, 1, 1, 2, 2, 2, 2, 3]);

        let second = read_full_chunk(&mut reader, &mut buffer).await.unwrap();
        assert_eq!(second, 4);

        let third = read_full_chunk(&mut reader, &mut buffer).await.unwrap();
        assert_eq!(third, 0);
    }
}
