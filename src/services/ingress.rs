use crate::services::broker::{BrokerError, CorrelationClient, JobRequest};
use crate::services::metadata::{MetadataError, MetadataStore, NewFileMetadata};
use crate::services::storage::BlobStore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Coarse classification used to pick the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    NotFound,
    Storage,
    Broker,
    Timeout,
    Integrity,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("no file received")]
    NoFileReceived,

    #[error("failed to store upload: {0}")]
    BlobWriteFailed(String),

    #[error("failed to record metadata: {0}")]
    MetadataWriteFailed(String),

    #[error("file with id {0} not found")]
    MetadataNotFound(i64),

    #[error("failed to read metadata: {0}")]
    MetadataReadFailed(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("no reply from processing within {0:?}")]
    ReplyTimeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid reply from processing: {0}")]
    InvalidReply(String),

    #[error("failed to read processed file: {0}")]
    BlobReadFailed(String),

    #[error("processed file {0} is empty")]
    EmptyObject(String),
}

impl IngressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngressError::NoFileReceived => ErrorKind::Input,
            IngressError::MetadataNotFound(_) => ErrorKind::NotFound,
            IngressError::BlobWriteFailed(_)
            | IngressError::MetadataWriteFailed(_)
            | IngressError::MetadataReadFailed(_)
            | IngressError::BlobReadFailed(_) => ErrorKind::Storage,
            IngressError::BrokerUnavailable(_) => ErrorKind::Broker,
            IngressError::ReplyTimeout(_) => ErrorKind::Timeout,
            IngressError::InvalidReply(_) | IngressError::EmptyObject(_) => ErrorKind::Integrity,
            IngressError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<BrokerError> for IngressError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Timeout(after) => IngressError::ReplyTimeout(after),
            BrokerError::Cancelled => IngressError::Cancelled,
            BrokerError::Payload(e) => IngressError::InvalidReply(e.to_string()),
            other => IngressError::BrokerUnavailable(other.to_string()),
        }
    }
}

/// One inbound upload. `object_key` is minted fresh per call and never reused.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub original_filename: String,
    pub content_length: Option<u64>,
    pub object_key: Uuid,
}

impl UploadRequest {
    pub fn new(original_filename: impl Into<String>, content_length: Option<u64>) -> Self {
        Self {
            original_filename: original_filename.into(),
            content_length,
            object_key: Uuid::new_v4(),
        }
    }
}

/// The processed artifact, ready to be streamed back.
pub struct ProcessedFile {
    pub file_id: i64,
    pub filename: String,
    pub object_key: String,
    pub size: u64,
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
}

impl std::fmt::Debug for ProcessedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedFile")
            .field("file_id", &self.file_id)
            .field("filename", &self.filename)
            .field("object_key", &self.object_key)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Drives one upload through blob store, metadata store and the processing
/// round trip.
pub struct IngressService {
    storage: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    broker: Arc<CorrelationClient>,
    reply_timeout: Duration,
}

impl IngressService {
    pub fn new(
        storage: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        broker: Arc<CorrelationClient>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            metadata,
            broker,
            reply_timeout,
        }
    }

    pub async fn handle_upload<'a>(
        &self,
        request: UploadRequest,
        body: Box<dyn AsyncRead + Unpin + Send + 'a>,
        cancel: CancellationToken,
    ) -> Result<ProcessedFile, IngressError> {
        let key = request.object_key.to_string();

        let size = self
            .storage
            .put_stream(&key, body, request.content_length)
            .await
            .map_err(|e| IngressError::BlobWriteFailed(format!("{:#}", e)))?;
        tracing::info!(
            "💾 Stored {} as {} ({} bytes)",
            request.original_filename,
            key,
            size
        );

        let file_id = match self
            .metadata
            .insert_metadata(NewFileMetadata {
                original_filename: request.original_filename.clone(),
                size: size as i64,
                bucket: self.storage.bucket().to_string(),
                object_key: request.object_key,
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&key).await {
                    tracing::warn!("Orphaned blob {} left behind: {:#}", key, cleanup);
                }
                return Err(IngressError::MetadataWriteFailed(e.to_string()));
            }
        };

        let record = self
            .metadata
            .lookup_metadata(file_id)
            .await
            .map_err(|e| match e {
                MetadataError::NotFound(id) => IngressError::MetadataNotFound(id),
                other => IngressError::MetadataReadFailed(other.to_string()),
            })?;

        // The wait runs detached so that dropping this future still lets it
        // observe the cancellation and tear its reply queue down.
        let job = JobRequest::from(&record);
        let broker = self.broker.clone();
        let timeout = self.reply_timeout;
        let waiter = cancel.clone();
        let reply = tokio::spawn(async move { broker.request_reply(&job, timeout, &waiter).await })
            .await
            .map_err(|e| IngressError::BrokerUnavailable(e.to_string()))??;
        tracing::info!("✅ File {} processed into {}", file_id, reply.object_key);

        let object = self
            .storage
            .get_stream(&reply.object_key)
            .await
            .map_err(|e| IngressError::BlobReadFailed(format!("{:#}", e)))?;

        if object.size == 0 {
            return Err(IngressError::EmptyObject(reply.object_key));
        }

        Ok(ProcessedFile {
            file_id,
            filename: record.original_filename,
            object_key: reply.object_key,
            size: object.size,
            reader: object.reader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::services::broker::memory::MemoryTransport;
    use crate::services::metadata::{FileMetadataRecord, SeaOrmMetadataStore};
    use crate::services::processor::CopyProcessor;
    use crate::services::storage::MemoryBlobStore;
    use crate::services::worker::ProcessingWorker;
    use async_trait::async_trait;
    use sea_orm::{ConnectOptions, Database, DbErr};
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    const EXCHANGE: &str = "pcd_files";
    const QUEUE: &str = "file_metadata_queue";

    struct Setup {
        service: IngressService,
        storage: Arc<MemoryBlobStore>,
        transport: Arc<MemoryTransport>,
        _shutdown: watch::Sender<bool>,
    }

    async fn sqlite_store() -> Arc<dyn MetadataStore> {
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1);
        let db = Database::connect(opt).await.unwrap();
        crate::infrastructure::database::run_migrations(&db)
            .await
            .unwrap();
        Arc::new(SeaOrmMetadataStore::new(db))
    }

    async fn setup(metadata: Arc<dyn MetadataStore>, with_worker: bool) -> Setup {
        let storage = Arc::new(MemoryBlobStore::new("defaultbucket"));
        let transport = Arc::new(MemoryTransport::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        if with_worker {
            let worker = ProcessingWorker::new(
                transport.clone(),
                Arc::new(CopyProcessor::new(storage.clone(), "processed")),
                EXCHANGE,
                QUEUE,
                AppConfig::default().worker,
                shutdown_rx,
            );
            tokio::spawn(worker.run());
            while !transport.has_consumer(QUEUE) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        let client = Arc::new(CorrelationClient::new(transport.clone(), EXCHANGE));
        Setup {
            service: IngressService::new(
                storage.clone(),
                metadata,
                client,
                Duration::from_millis(300),
            ),
            storage,
            transport,
            _shutdown: shutdown,
        }
    }

    fn body(data: &'static [u8]) -> Box<dyn AsyncRead + Unpin + Send> {
        Box::new(data)
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let s = setup(sqlite_store().await, true).await;
        let request = UploadRequest::new("a.txt", Some(10));
        let original_key = request.object_key.to_string();

        let mut processed = s
            .service
            .handle_upload(request, body(b"0123456789"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(processed.file_id, 1);
        assert_eq!(processed.filename, "a.txt");
        assert_eq!(processed.size, 10);
        assert!(processed.object_key.starts_with("processed/"));
        assert!(s.storage.contains(&original_key));

        let mut data = Vec::new();
        processed.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"0123456789");
        assert_eq!(s.transport.reply_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_upload_is_integrity_error() {
        let s = setup(sqlite_store().await, true).await;

        let err = s
            .service
            .handle_upload(UploadRequest::new("empty.bin", Some(0)), body(b""), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::EmptyObject(_)));
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn test_no_worker_times_out() {
        let s = setup(sqlite_store().await, false).await;

        let err = s
            .service
            .handle_upload(UploadRequest::new("a.txt", None), body(b"abc"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::ReplyTimeout(_)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(s.transport.reply_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_reply_queue() {
        let s = setup(sqlite_store().await, false).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = s
            .service
            .handle_upload(UploadRequest::new("a.txt", None), body(b"abc"), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::Cancelled));
        assert_eq!(s.transport.reply_queue_count(), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl MetadataStore for FailingStore {
        async fn insert_metadata(&self, _: NewFileMetadata) -> Result<i64, MetadataError> {
            Err(MetadataError::Database(DbErr::Custom("disk full".to_string())))
        }

        async fn lookup_metadata(&self, id: i64) -> Result<FileMetadataRecord, MetadataError> {
            Err(MetadataError::NotFound(id))
        }
    }

    #[tokio::test]
    async fn test_metadata_failure_removes_blob() {
        let s = setup(Arc::new(FailingStore), false).await;

        let err = s
            .service
            .handle_upload(UploadRequest::new("a.txt", None), body(b"abc"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::MetadataWriteFailed(_)));
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(s.storage.keys().is_empty());
    }

    #[test]
    fn test_broker_error_mapping() {
        let timeout: IngressError = BrokerError::Timeout(Duration::from_secs(1)).into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let cancelled: IngressError = BrokerError::Cancelled.into();
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);

        let down: IngressError = BrokerError::Connection("refused".to_string()).into();
        assert_eq!(down.kind(), ErrorKind::Broker);
    }
}
