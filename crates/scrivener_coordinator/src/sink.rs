//! Filesystem output sink.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::collaborators::{OutputMetadata, OutputSink};
use crate::error::{CoordinatorError, Result};

const METADATA_FILE: &str = "metadata.json";

/// Writes each artifact to `<root>/<tenant>/<asset id>/<filename>` with a JSON
/// metadata sidecar.
pub struct FsOutputSink {
    root: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar<'a> {
    asset_id: &'a str,
    size_bytes: usize,
    created_at: String,
    #[serde(flatten)]
    metadata: &'a OutputMetadata,
}

impl FsOutputSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one asset.
    pub fn asset_dir(&self, tenant_id: &str, asset_id: &str) -> PathBuf {
        self.root.join(sanitize_segment(tenant_id)).join(asset_id)
    }
}

#[async_trait]
impl OutputSink for FsOutputSink {
    async fn store(&self, bytes: Vec<u8>, metadata: &OutputMetadata) -> Result<String> {
        let asset_id = Uuid::new_v4().to_string();
        let dir = self.asset_dir(&metadata.tenant_id, &asset_id);
        let filename = sanitize_segment(&metadata.filename);

        let io_err = |e: std::io::Error| {
            CoordinatorError::persistence(format!("Failed to write output to {}: {}", dir.display(), e))
        };

        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        tokio::fs::write(dir.join(&filename), &bytes)
            .await
            .map_err(io_err)?;

        let sidecar = Sidecar {
            asset_id: &asset_id,
            size_bytes: bytes.len(),
            created_at: chrono::Utc::now().to_rfc3339(),
            metadata,
        };
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| CoordinatorError::persistence(format!("Failed to encode metadata: {}", e)))?;
        tokio::fs::write(dir.join(METADATA_FILE), json)
            .await
            .map_err(io_err)?;

        info!(
            asset_id = %asset_id,
            tenant_id = %metadata.tenant_id,
            run_id = metadata.run_id.as_deref().unwrap_or("-"),
            filename = %filename,
            "Output stored"
        );
        Ok(asset_id)
    }
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::OUTPUT_SOURCE_TYPE;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_writes_artifact_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let sink = FsOutputSink::new(tmp.path());
        let metadata = OutputMetadata {
            tenant_id: "t-1".to_string(),
            filename: "summary.md".to_string(),
            mime_type: "text/markdown".to_string(),
            source_type: OUTPUT_SOURCE_TYPE.to_string(),
            run_id: Some("run-1".to_string()),
            uploaded_by: Some("user-9".to_string()),
        };

        let asset_id = sink.store(b"# Summary".to_vec(), &metadata).await.unwrap();
        let dir = sink.asset_dir("t-1", &asset_id);

        assert_eq!(std::fs::read_to_string(dir.join("summary.md")).unwrap(), "# Summary");
        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(sidecar["assetId"], asset_id.as_str());
        assert_eq!(sidecar["runId"], "run-1");
        assert_eq!(sidecar["sizeBytes"], 9);
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("../x"), ".._x");
        assert_eq!(sanitize_segment(".."), "_");
        assert_eq!(sanitize_segment("a/b"), "a_b");
    }
}
