//! Launching the user's external editor for the modify-in-editor flow.

use std::path::Path;

use eyre::{
    bail,
    eyre,
    Result,
};

/// Launches the configured editor on `file_path` and waits for it to exit.
///
/// The command string is shell-split so editors that need arguments (e.g.
/// "emacsclient -nw") work.
pub async fn launch_editor(editor_command: &str, file_path: &Path) -> Result<()> {
    let mut parts = shlex::split(editor_command).ok_or_else(|| eyre!("failed to parse editor command"))?;
    if parts.is_empty() {
        bail!("editor command is empty");
    }
    let bin = parts.remove(0);

    let mut cmd = tokio::process::Command::new(bin);
    for arg in parts {
        cmd.arg(arg);
    }
    let status = cmd.arg(file_path).status().await?;
    if !status.success() {
        bail!("editor process did not exit with success");
    }
    Ok(())
}
