use anyhow::{Context, Error};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::Path;

/// Pulls structured data out of one uploaded file.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<Value, Error>;
}

/// Reports what the filesystem knows about a file: name, size and extension.
#[derive(Debug, Default, Clone)]
pub struct FileMetadataExtractor;

#[async_trait]
impl Extractor for FileMetadataExtractor {
    async fn extract(&self, path: &Path) -> Result<Value, Error> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }

        Ok(json!({
            "file_name": path.file_name().map(|n| n.to_string_lossy().into_owned()),
            "size_bytes": metadata.len(),
            "extension": path.extension().map(|e| e.to_string_lossy().to_lowercase()),
        }))
    }
}

/// Merge per-file results field by field; the first file to provide a
/// non-null value for a field wins. Non-object results only count as sources.
pub fn merge_extractions(results: &[Value]) -> Value {
    let mut merged = Map::new();
    for result in results {
        if let Value::Object(fields) = result {
            for (key, value) in fields {
                if value.is_null() {
                    continue;
                }
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    merged.insert("source_count".into(), json!(results.len()));
    Value::Object(merged)
}
