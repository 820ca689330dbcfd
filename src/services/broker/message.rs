use crate::services::metadata::FileMetadataRecord;
use serde::{Deserialize, Serialize};

/// Job handed to the processing worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub filename: String,
    #[serde(rename = "minio_key")]
    pub object_key: String,
}

/// Worker's answer; `object_key` names the processed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReply {
    pub id: String,
    pub filename: String,
    #[serde(rename = "minio_key")]
    pub object_key: String,
}

impl From<&FileMetadataRecord> for JobRequest {
    fn from(record: &FileMetadataRecord) -> Self {
        Self {
            id: record.id.to_string(),
            filename: record.original_filename.clone(),
            object_key: record.object_key.to_string(),
        }
    }
}

impl JobRequest {
    pub fn into_reply(self, output_key: String) -> JobReply {
        JobReply {
            id: self.id,
            filename: self.filename,
            object_key: output_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_wire_format_uses_minio_key() {
        let job = JobRequest {
            id: "7".to_string(),
            filename: "cloud.ply".to_string(),
            object_key: "abc".to_string(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"id": "7", "filename": "cloud.ply", "minio_key": "abc"})
        );
    }

    #[test]
    fn test_reply_parses_worker_payload() {
        let reply: JobReply = serde_json::from_str(
            r#"{"id":"7","filename":"cloud.ply","minio_key":"processed/x.bin"}"#,
        )
        .unwrap();
        assert_eq!(reply.object_key, "processed/x.bin");
    }

    #[test]
    fn test_request_from_record() {
        let key = Uuid::new_v4();
        let record = FileMetadataRecord {
            id: 42,
            original_filename: "a.txt".to_string(),
            size: 10,
            bucket: "defaultbucket".to_string(),
            object_key: key,
            created_at: Utc::now(),
        };
        let job = JobRequest::from(&record);
        assert_eq!(job.id, "42");
        assert_eq!(job.filename, "a.txt");
        assert_eq!(job.object_key, key.to_string());
    }
}
