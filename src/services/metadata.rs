use crate::entities::{files, prelude::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, Set};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// One row per stored upload. `id` is the handle handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct FileMetadataRecord {
    pub id: i64,
    pub original_filename: String,
    pub size: i64,
    pub bucket: String,
    pub object_key: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<files::Model> for FileMetadataRecord {
    fn from(model: files::Model) -> Self {
        Self {
            id: model.id,
            original_filename: model.original_filename,
            size: model.size,
            bucket: model.bucket,
            object_key: model.object_key,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewFileMetadata {
    pub original_filename: String,
    pub size: i64,
    pub bucket: String,
    pub object_key: Uuid,
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("file with id {0} not found")]
    NotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Inserts a record and returns the store-assigned id
    async fn insert_metadata(&self, record: NewFileMetadata) -> Result<i64, MetadataError>;

    async fn lookup_metadata(&self, id: i64) -> Result<FileMetadataRecord, MetadataError>;
}

pub struct SeaOrmMetadataStore {
    db: DatabaseConnection,
}

impl SeaOrmMetadataStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataStore for SeaOrmMetadataStore {
    async fn insert_metadata(&self, record: NewFileMetadata) -> Result<i64, MetadataError> {
        let row = files::ActiveModel {
            original_filename: Set(record.original_filename),
            size: Set(record.size),
            bucket: Set(record.bucket),
            object_key: Set(record.object_key),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        let inserted = row.insert(&self.db).await?;
        tracing::info!(
            "🗂️  Metadata saved: id={}, key={}",
            inserted.id,
            inserted.object_key
        );
        Ok(inserted.id)
    }

    async fn lookup_metadata(&self, id: i64) -> Result<FileMetadataRecord, MetadataError> {
        let model = Files::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(MetadataError::NotFound(id))?;

        tracing::debug!("Metadata loaded for id={}", id);
        Ok(model.into())
    }
}
