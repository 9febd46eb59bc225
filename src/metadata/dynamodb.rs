//! AWS DynamoDB metadata store backend.
//!
//! Two-table design:
//! - Files:  hash key `fileID` (S)
//! - Chunks: hash key `fileID` (S), range key `chunkNumber` (N)
//!
//! Timestamps are stored as RFC 3339 strings, sizes and counters as numbers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::store::{
    ChunkStatus, FileChunk, FileExists, FileMetadata, MetadataStore, MultipartPlan, UploadStatus,
    UploadType,
};
use crate::config::DynamoDbMetaConfig;

fn item_to_record(item: &HashMap<String, AttributeValue>) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for (key, value) in item {
        if let AttributeValue::S(s) = value {
            result.insert(key.clone(), s.clone());
        } else if let AttributeValue::N(n) = value {
            result.insert(key.clone(), n.clone());
        }
    }
    result
}

fn s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn n(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn parse_time(map: &HashMap<String, String>, attr: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    match map.get(attr).filter(|v| !v.is_empty()) {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("attribute {attr} is not RFC 3339: {raw}"))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}

fn parse_num<T: std::str::FromStr>(map: &HashMap<String, String>, attr: &str) -> anyhow::Result<T> {
    let raw = map
        .get(attr)
        .ok_or_else(|| anyhow::anyhow!("missing attribute {attr}"))?;
    raw.parse::<T>()
        .map_err(|_| anyhow::anyhow!("attribute {attr} is not a number: {raw}"))
}

pub(crate) fn file_to_item(record: &FileMetadata) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert("fileID".to_string(), s(&record.file_id));
    item.insert("filename".to_string(), s(&record.filename));
    item.insert("contentType".to_string(), s(&record.content_type));
    item.insert("totalSize".to_string(), n(record.total_size));
    item.insert("uploadType".to_string(), s(record.upload_type.as_str()));
    item.insert("status".to_string(), s(record.status.as_str()));
    item.insert("s3Key".to_string(), s(&record.storage_key));
    item.insert("userID".to_string(), s(&record.owner_id));
    item.insert("uploadedAt".to_string(), s(record.created_at.to_rfc3339()));
    if let Some(plan) = &record.multipart {
        item.insert("s3UploadId".to_string(), s(&plan.storage_upload_id));
        item.insert("chunkSize".to_string(), n(plan.chunk_size));
        item.insert("totalChunks".to_string(), n(plan.total_chunks));
    }
    if let Some(completed_at) = record.completed_at {
        item.insert("completedAt".to_string(), s(completed_at.to_rfc3339()));
    }
    item
}

pub(crate) fn item_to_file(item: &HashMap<String, AttributeValue>) -> anyhow::Result<FileMetadata> {
    let map = item_to_record(item);
    let field = |attr: &str| map.get(attr).cloned().unwrap_or_default();

    let upload_type = UploadType::parse(&field("uploadType"))
        .ok_or_else(|| anyhow::anyhow!("unknown uploadType {:?}", map.get("uploadType")))?;
    let status = UploadStatus::parse(&field("status"))
        .ok_or_else(|| anyhow::anyhow!("unknown status {:?}", map.get("status")))?;

    let multipart = match upload_type {
        UploadType::Multipart => Some(MultipartPlan {
            storage_upload_id: field("s3UploadId"),
            chunk_size: parse_num(&map, "chunkSize")?,
            total_chunks: parse_num(&map, "totalChunks")?,
        }),
        UploadType::Single => None,
    };

    Ok(FileMetadata {
        file_id: field("fileID"),
        filename: field("filename"),
        content_type: field("contentType"),
        total_size: parse_num(&map, "totalSize").unwrap_or(0),
        upload_type,
        status,
        storage_key: field("s3Key"),
        multipart,
        owner_id: field("userID"),
        created_at: parse_time(&map, "uploadedAt")?.unwrap_or_else(Utc::now),
        completed_at: parse_time(&map, "completedAt")?,
    })
}

fn chunk_to_item(chunk: &FileChunk) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert("fileID".to_string(), s(&chunk.file_id));
    item.insert("chunkNumber".to_string(), n(chunk.chunk_number));
    item.insert("s3PartNumber".to_string(), n(chunk.chunk_number));
    item.insert("size".to_string(), n(chunk.expected_size));
    item.insert("status".to_string(), s(chunk.status.as_str()));
    if let Some(checksum) = &chunk.checksum {
        item.insert("etag".to_string(), s(checksum));
    }
    if let Some(uploaded_at) = chunk.uploaded_at {
        item.insert("uploadedAt".to_string(), s(uploaded_at.to_rfc3339()));
    }
    item
}

fn item_to_chunk(item: &HashMap<String, AttributeValue>) -> anyhow::Result<FileChunk> {
    let map = item_to_record(item);
    let status = map
        .get("status")
        .and_then(|v| ChunkStatus::parse(v))
        .ok_or_else(|| anyhow::anyhow!("unknown chunk status {:?}", map.get("status")))?;

    Ok(FileChunk {
        file_id: map.get("fileID").cloned().unwrap_or_default(),
        chunk_number: parse_num(&map, "chunkNumber")?,
        expected_size: parse_num(&map, "size").unwrap_or(0),
        status,
        checksum: map.get("etag").filter(|v| !v.is_empty()).cloned(),
        uploaded_at: parse_time(&map, "uploadedAt")?,
    })
}

pub struct DynamoDbMetadataStore {
    client: Client,
    files_table: String,
    chunks_table: String,
}

impl DynamoDbMetadataStore {
    pub async fn new(config: &DynamoDbMetaConfig) -> anyhow::Result<Self> {
        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if !config.endpoint_url.is_empty() {
            builder = builder.endpoint_url(&config.endpoint_url);
        }

        let cfg = builder.load().await;
        let client = Client::new(&cfg);

        Ok(Self {
            client,
            files_table: config.files_table.clone(),
            chunks_table: config.chunks_table.clone(),
        })
    }
}

impl MetadataStore for DynamoDbMetadataStore {
    fn put_file_if_absent(
        &self,
        record: FileMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            debug!("DynamoDB put_file_if_absent: file_id={}", record.file_id);
            let result = self
                .client
                .put_item()
                .table_name(&self.files_table)
                .set_item(Some(file_to_item(&record)))
                .condition_expression("attribute_not_exists(fileID)")
                .send()
                .await;

            match result {
                Ok(_) => Ok(()),
                Err(err) => {
                    let duplicate = err
                        .as_service_error()
                        .map(|e| e.is_conditional_check_failed_exception())
                        .unwrap_or(false);
                    if duplicate {
                        Err(FileExists(record.file_id).into())
                    } else {
                        Err(anyhow::Error::new(err).context("DynamoDB PutItem (files) failed"))
                    }
                }
            }
        })
    }

    fn get_file(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileMetadata>>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let result = self
                .client
                .get_item()
                .table_name(&self.files_table)
                .key("fileID", s(&file_id))
                .send()
                .await
                .context("DynamoDB GetItem (files) failed")?;

            result.item().map(item_to_file).transpose()
        })
    }

    fn put_file(
        &self,
        record: FileMetadata,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            debug!(
                "DynamoDB put_file: file_id={} status={}",
                record.file_id,
                record.status.as_str()
            );
            self.client
                .put_item()
                .table_name(&self.files_table)
                .set_item(Some(file_to_item(&record)))
                .send()
                .await
                .context("DynamoDB PutItem (files) failed")?;
            Ok(())
        })
    }

    fn delete_file(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            self.client
                .delete_item()
                .table_name(&self.files_table)
                .key("fileID", s(&file_id))
                .send()
                .await
                .context("DynamoDB DeleteItem (files) failed")?;
            Ok(())
        })
    }

    fn list_files_by_owner(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileMetadata>>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let mut files = Vec::new();
            let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;

            loop {
                let mut query = self
                    .client
                    .scan()
                    .table_name(&self.files_table)
                    .filter_expression("userID = :uid")
                    .expression_attribute_values(":uid", s(&owner_id));

                if let Some(key) = &exclusive_start_key {
                    query = query.set_exclusive_start_key(Some(key.clone()));
                }

                let result = query.send().await.context("DynamoDB Scan (files) failed")?;

                for item in result.items() {
                    files.push(item_to_file(item)?);
                }

                if result.last_evaluated_key().is_none() {
                    break;
                }
                exclusive_start_key = result.last_evaluated_key().cloned();
            }

            Ok(files)
        })
    }

    fn put_chunk(
        &self,
        chunk: FileChunk,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.client
                .put_item()
                .table_name(&self.chunks_table)
                .set_item(Some(chunk_to_item(&chunk)))
                .send()
                .await
                .context("DynamoDB PutItem (chunks) failed")?;
            Ok(())
        })
    }

    fn get_chunk(
        &self,
        file_id: &str,
        chunk_number: u32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<FileChunk>>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let result = self
                .client
                .get_item()
                .table_name(&self.chunks_table)
                .key("fileID", s(&file_id))
                .key("chunkNumber", n(chunk_number))
                .send()
                .await
                .context("DynamoDB GetItem (chunks) failed")?;

            result.item().map(item_to_chunk).transpose()
        })
    }

    fn list_chunks(
        &self,
        file_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<FileChunk>>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let mut chunks = Vec::new();
            let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;

            loop {
                let mut query = self
                    .client
                    .query()
                    .table_name(&self.chunks_table)
                    .key_condition_expression("fileID = :fid")
                    .expression_attribute_values(":fid", s(&file_id));

                if let Some(key) = &exclusive_start_key {
                    query = query.set_exclusive_start_key(Some(key.clone()));
                }

                let result = query.send().await.context("DynamoDB Query (chunks) failed")?;

                for item in result.items() {
                    chunks.push(item_to_chunk(item)?);
                }

                if result.last_evaluated_key().is_none() {
                    break;
                }
                exclusive_start_key = result.last_evaluated_key().cloned();
            }

            chunks.sort_by_key(|c| c.chunk_number);
            Ok(chunks)
        })
    }

    fn update_chunk_status(
        &self,
        file_id: &str,
        chunk_number: u32,
        status: ChunkStatus,
        checksum: Option<String>,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let file_id = file_id.to_string();
        Box::pin(async move {
            let mut set = vec!["#status = :status"];
            let mut remove = Vec::new();
            let mut request = self
                .client
                .update_item()
                .table_name(&self.chunks_table)
                .key("fileID", s(&file_id))
                .key("chunkNumber", n(chunk_number))
                .condition_expression("attribute_exists(fileID)")
                .expression_attribute_names("#status", "status")
                .expression_attribute_values(":status", s(status.as_str()));

            match checksum {
                Some(checksum) => {
                    set.push("etag = :etag");
                    request = request.expression_attribute_values(":etag", s(checksum));
                }
                None => remove.push("etag"),
            }
            match uploaded_at {
                Some(at) => {
                    set.push("uploadedAt = :uploaded_at");
                    request =
                        request.expression_attribute_values(":uploaded_at", s(at.to_rfc3339()));
                }
                None => remove.push("uploadedAt"),
            }

            let mut expression = format!("SET {}", set.join(", "));
            if !remove.is_empty() {
                expression.push_str(&format!(" REMOVE {}", remove.join(", ")));
            }

            debug!(
                "DynamoDB update_chunk_status: file_id={} chunk={} status={}",
                file_id,
                chunk_number,
                status.as_str()
            );

            match request.update_expression(expression).send().await {
                Ok(_) => Ok(true),
                Err(err) => {
                    let missing = err
                        .as_service_error()
                        .map(|e| e.is_conditional_check_failed_exception())
                        .unwrap_or(false);
                    if missing {
                        Ok(false)
                    } else {
                        Err(anyhow::Error::new(err).context("DynamoDB UpdateItem (chunks) failed"))
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file() -> FileMetadata {
        FileMetadata {
            file_id: "f1".to_string(),
            filename: "note.txt".to_string(),
            content_type: "text/plain".to_string(),
            total_size: 100,
            upload_type: UploadType::Single,
            status: UploadStatus::Uploading,
            storage_key: "f1-note.txt".to_string(),
            multipart: None,
            owner_id: "alice".to_string(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_single_item_has_no_multipart_attributes() {
        let item = file_to_item(&single_file());
        assert!(!item.contains_key("s3UploadId"));
        assert!(!item.contains_key("totalChunks"));
        assert_eq!(item.get("s3Key"), Some(&s("f1-note.txt")));
        assert_eq!(item.get("totalSize"), Some(&n(100)));
    }

    #[test]
    fn test_multipart_item_requires_plan_attributes() {
        let mut item = file_to_item(&single_file());
        item.insert("uploadType".to_string(), s("multipart"));
        assert!(item_to_file(&item).is_err());

        item.insert("s3UploadId".to_string(), s("up-1"));
        item.insert("chunkSize".to_string(), n(5));
        item.insert("totalChunks".to_string(), n(3));
        let file = item_to_file(&item).unwrap();
        assert_eq!(file.total_chunks(), 3);
        assert_eq!(file.multipart.unwrap().storage_upload_id, "up-1");
    }

    #[test]
    fn test_chunk_item_omits_empty_checksum() {
        let item = chunk_to_item(&FileChunk::pending("f1", 2, 7));
        assert!(!item.contains_key("etag"));
        assert_eq!(item.get("s3PartNumber"), Some(&n(2)));

        let chunk = item_to_chunk(&item).unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert_eq!(chunk.expected_size, 7);
        assert!(chunk.checksum.is_none());
    }
}
