//! The modify-in-editor flow: the user reworks a pending tool call's
//! proposed content in their editor before approving it.

use std::path::{
    Path,
    PathBuf,
};
use std::sync::Arc;

use eyre::Result;
use serde_json::Map;
use tracing::warn;

use crate::tools::ModifyContext;
use crate::util::editor::launch_editor;

/// Result of one editor round trip, reported back to the scheduler loop.
#[derive(Debug)]
pub struct ModifyResult {
    pub call_id: String,
    pub result: Result<Map<String, serde_json::Value>, String>,
}

/// Runs the editor flow for one awaiting call: materializes the current and
/// proposed contents as temp files, opens the proposed file in the editor,
/// and rebuilds the call's arguments from whatever the user saved.
pub async fn run_modify_flow(
    args: Map<String, serde_json::Value>,
    modify: Arc<dyn ModifyContext>,
    editor_command: &str,
    temp_dir: &Path,
    call_id: &str,
) -> Result<Map<String, serde_json::Value>> {
    let current = modify
        .current_content(args.clone())
        .await
        .map_err(|e| eyre::eyre!(e.to_string()))?;
    let proposed = modify
        .proposed_content(args.clone())
        .await
        .map_err(|e| eyre::eyre!(e.to_string()))?;

    let (old_path, new_path) = temp_file_paths(temp_dir, call_id, &modify.file_path(&args));
    if let Some(parent) = old_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&old_path, &current).await?;
    tokio::fs::write(&new_path, &proposed).await?;

    let edit_result = launch_editor(editor_command, &new_path).await;

    // Read back regardless of editor exit status so a partial save is not
    // silently discarded on cleanup.
    let old_content = tokio::fs::read_to_string(&old_path).await.unwrap_or(current);
    let new_content = tokio::fs::read_to_string(&new_path).await.unwrap_or(proposed);

    if let Err(err) = tokio::fs::remove_file(&old_path).await {
        warn!(?err, "failed to remove modify temp file");
    }
    if let Err(err) = tokio::fs::remove_file(&new_path).await {
        warn!(?err, "failed to remove modify temp file");
    }

    edit_result?;
    Ok(modify.updated_params(&old_content, &new_content, &args))
}

fn temp_file_paths(temp_dir: &Path, call_id: &str, file_path: &str) -> (PathBuf, PathBuf) {
    let path = Path::new(file_path);
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = temp_dir.join("mods").join(call_id);
    (dir.join(format!("{}-old{}", stem, ext)), dir.join(format!("{}-new{}", stem, ext)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{
        ToolError,
        ToolFuture,
    };

    #[derive(Debug)]
    struct ReplaceModifyContext;

    impl ModifyContext for ReplaceModifyContext {
        fn file_path(&self, _args: &Map<String, serde_json::Value>) -> String {
            "/work/file.txt".to_string()
        }

        fn current_content(&self, _args: Map<String, serde_json::Value>) -> ToolFuture<Result<String, ToolError>> {
            Box::pin(async { Ok("foo and more".to_string()) })
        }

        fn proposed_content(&self, args: Map<String, serde_json::Value>) -> ToolFuture<Result<String, ToolError>> {
            Box::pin(async move {
                let new_string = args.get("new_string").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(format!("{} and more", new_string))
            })
        }

        fn updated_params(
            &self,
            _old_content: &str,
            new_content: &str,
            args: &Map<String, serde_json::Value>,
        ) -> Map<String, serde_json::Value> {
            let mut updated = args.clone();
            let new_string = new_content.strip_suffix(" and more").unwrap_or(new_content);
            updated.insert("new_string".to_string(), serde_json::Value::String(new_string.to_string()));
            updated
        }
    }

    #[tokio::test]
    async fn test_modify_flow_rebuilds_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Map::new();
        args.insert("old_string".to_string(), serde_json::Value::String("foo".into()));
        args.insert("new_string".to_string(), serde_json::Value::String("bar".into()));

        // "true" is an editor that changes nothing: the proposed content is
        // taken as saved.
        let updated = run_modify_flow(args, Arc::new(ReplaceModifyContext), "true", dir.path(), "c1")
            .await
            .unwrap();
        assert_eq!(updated["new_string"], "bar");
        assert_eq!(updated["old_string"], "foo");
    }

    #[tokio::test]
    async fn test_modify_flow_cleans_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = Map::new();
        args.insert("new_string".to_string(), serde_json::Value::String("bar".into()));

        run_modify_flow(args, Arc::new(ReplaceModifyContext), "true", dir.path(), "c2")
            .await
            .unwrap();
        let mods = dir.path().join("mods").join("c2");
        assert!(!mods.join("file-old.txt").exists());
        assert!(!mods.join("file-new.txt").exists());
    }

    #[tokio::test]
    async fn test_editor_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_modify_flow(Map::new(), Arc::new(ReplaceModifyContext), "false", dir.path(), "c3").await;
        assert!(result.is_err());
    }
}
