//! Metadata store for processing records.
//!
//! One JSON record per source asset, keyed by source key, written with
//! last-writer-wins upsert semantics. Reprocessing a job therefore converges
//! on a single record instead of accumulating duplicates.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::config::MetadataConfig;
use crate::error::{
    MetadataError, RecordDeserializeSnafu, RecordReadSnafu, RecordSerializeSnafu,
    RecordWriteSnafu, TableStorageSnafu,
};
use crate::storage::StorageProvider;

/// Terminal status of a processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Succeeded,
    Failed,
}

/// Processing record for one source asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    /// Record identity: the source object key.
    pub id: String,
    pub status: ProcessingStatus,
    /// Output dimensions; absent for failed records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_height: Option<u32>,
    pub processed_at: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn succeeded(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            status: ProcessingStatus::Succeeded,
            output_width: Some(width),
            output_height: Some(height),
            processed_at: Utc::now(),
        }
    }

    pub fn failed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ProcessingStatus::Failed,
            output_width: None,
            output_height: None,
            processed_at: Utc::now(),
        }
    }
}

/// Key-value metadata table backed by object storage.
pub struct MetadataStore {
    storage: Arc<StorageProvider>,
}

impl MetadataStore {
    pub fn new(storage: Arc<StorageProvider>) -> Self {
        Self { storage }
    }

    pub async fn from_config(config: &MetadataConfig) -> Result<Self, MetadataError> {
        let storage =
            StorageProvider::for_url_with_options(&config.path, config.storage_options.clone())
                .await
                .context(TableStorageSnafu)?;
        Ok(Self::new(Arc::new(storage)))
    }

    /// Insert or overwrite the record for `record.id`.
    ///
    /// Records are whole-object writes, so repeated upserts with the same
    /// payload are indistinguishable from a single one.
    pub async fn upsert(&self, record: &MetadataRecord) -> Result<(), MetadataError> {
        let body = serde_json::to_vec(record).context(RecordSerializeSnafu {
            id: record.id.clone(),
        })?;
        self.storage
            .put(record_path(&record.id), Bytes::from(body))
            .await
            .context(RecordWriteSnafu {
                id: record.id.clone(),
            })?;
        debug!(id = %record.id, status = ?record.status, "Upserted metadata record");
        Ok(())
    }

    /// Fetch the record for a source key, if one exists.
    pub async fn get(&self, id: &str) -> Result<Option<MetadataRecord>, MetadataError> {
        let bytes = match self.storage.get(record_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e).context(RecordReadSnafu { id }),
        };
        let record =
            serde_json::from_slice(&bytes).context(RecordDeserializeSnafu { id })?;
        Ok(Some(record))
    }
}

/// Storage path for a record. Source keys contain slashes, which simply nest
/// the record under matching directories.
fn record_path(id: &str) -> String {
    format!("{id}.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn store(temp_dir: &TempDir) -> MetadataStore {
        let config = MetadataConfig {
            path: temp_dir.path().to_str().unwrap().to_string(),
            storage_options: HashMap::new(),
        };
        MetadataStore::from_config(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_get_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        let record = MetadataRecord::succeeded("uploads/a.jpg", 1024, 768);
        store.upsert(&record).await.unwrap();

        let fetched = store.get("uploads/a.jpg").await.unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_get_missing_record_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        assert!(store.get("uploads/missing.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_existing_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store
            .upsert(&MetadataRecord::failed("uploads/a.jpg"))
            .await
            .unwrap();
        store
            .upsert(&MetadataRecord::succeeded("uploads/a.jpg", 800, 600))
            .await
            .unwrap();

        let fetched = store.get("uploads/a.jpg").await.unwrap().unwrap();
        assert_eq!(fetched.status, ProcessingStatus::Succeeded);
        assert_eq!(fetched.output_width, Some(800));
    }

    #[test]
    fn test_record_wire_format() {
        let record = MetadataRecord::succeeded("uploads/a.jpg", 1024, 768);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"id\":\"uploads/a.jpg\""));
        assert!(json.contains("\"status\":\"succeeded\""));
        assert!(json.contains("\"outputWidth\":1024"));
        assert!(json.contains("\"processedAt\""));
    }

    #[test]
    fn test_failed_record_omits_dimensions() {
        let json = serde_json::to_string(&MetadataRecord::failed("uploads/a.jpg")).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(!json.contains("outputWidth"));
    }
}
