//! Checkpoint sidecars for restorable tool calls.
//!
//! When a `replace` or `write_file` call reaches `awaiting_approval`, the
//! conversation and a filesystem snapshot reference are written to disk so a
//! restore command can rewind both.

use std::path::{
    Path,
    PathBuf,
};

use chrono::{
    DateTime,
    Utc,
};
use eyre::Result;
use futures::future::BoxFuture;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;
use tracing::info;

use crate::model::types::Message;

/// External collaborator that snapshots the filesystem state of a path,
/// returning an identifier (e.g. a commit hash) the restore command can
/// rewind to.
pub trait SnapshotService: Send + Sync {
    fn snapshot(&self, file_path: &Path) -> BoxFuture<'static, Result<String>>;
}

/// Source of the user-facing transcript items included in the sidecar.
pub trait UiHistorySource: Send + Sync {
    fn items(&self) -> serde_json::Value;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointToolCall {
    pub name: String,
    pub args: Map<String, serde_json::Value>,
}

/// The JSON sidecar written per restorable tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSidecar {
    /// User-facing transcript items.
    pub history: serde_json::Value,
    /// The conversation as sent to the model.
    pub client_history: Vec<Message>,
    pub tool_call: CheckpointToolCall,
    pub commit_hash: String,
    pub file_path: String,
}

/// `<timestamp>-<basename>-<tool>.json`, with characters that upset
/// filesystems replaced.
pub fn sidecar_file_name(timestamp: DateTime<Utc>, file_path: &str, tool_name: &str) -> String {
    let timestamp = timestamp
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    let basename = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}-{}.json", timestamp, basename, tool_name)
}

/// Writes the sidecar under `<temp_dir>/checkpoints/`, creating the
/// directory when needed. Returns the sidecar path.
pub async fn write_sidecar(
    temp_dir: &Path,
    timestamp: DateTime<Utc>,
    tool_name: &str,
    sidecar: &CheckpointSidecar,
) -> Result<PathBuf> {
    let dir = temp_dir.join("checkpoints");
    tokio::fs::create_dir_all(&dir).await?;

    let path = dir.join(sidecar_file_name(timestamp, &sidecar.file_path, tool_name));
    let json = serde_json::to_string_pretty(sidecar)?;
    tokio::fs::write(&path, json).await?;
    info!(path = %path.display(), "wrote checkpoint sidecar");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::types::Part;

    #[test]
    fn test_sidecar_file_name_convention() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let name = sidecar_file_name(ts, "/work/src/main.rs", "write_file");
        assert!(name.starts_with("2025-03-14T09-26-53"), "got: {name}");
        assert!(name.ends_with("-main.rs-write_file.json"), "got: {name}");
        assert!(!name.contains(':'));
    }

    #[tokio::test]
    async fn test_write_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = CheckpointSidecar {
            history: serde_json::json!([{"type": "user", "text": "hello"}]),
            client_history: vec![Message::user(vec![Part::Text("hello".into())])],
            tool_call: CheckpointToolCall {
                name: "write_file".into(),
                args: Map::new(),
            },
            commit_hash: "abc123".into(),
            file_path: "/work/notes.txt".into(),
        };

        let path = write_sidecar(dir.path(), Utc::now(), "write_file", &sidecar).await.unwrap();
        assert!(path.starts_with(dir.path().join("checkpoints")));

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let restored: CheckpointSidecar = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored.commit_hash, "abc123");
        assert_eq!(restored.client_history.len(), 1);
    }
}
