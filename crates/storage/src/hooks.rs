//! Pre-finish hook execution.

use crate::error::{StorageError, StorageResult};
use depot_core::config::PreFinishCommand;
use depot_core::info::UploadInfo;
use std::path::Path;
use tokio::process::Command;

/// Run the configured commands in order, between hash computation and
/// blob promotion. Each command sees the upload id and blob path in its
/// environment. Any non-zero exit aborts the finish, leaving the
/// incomplete blob in place.
pub async fn run_pre_finish(
    commands: &[PreFinishCommand],
    info: &UploadInfo,
    bin_path: &Path,
) -> StorageResult<()> {
    for hook in commands {
        let status = Command::new(&hook.command)
            .args(&hook.args)
            .envs(&hook.env)
            .env("DEPOT_UPLOAD_ID", &info.id)
            .env("DEPOT_UPLOAD_PATH", bin_path)
            .status()
            .await
            .map_err(|e| {
                StorageError::HookFailed(format!("{}: failed to spawn: {e}", hook.command))
            })?;

        if !status.success() {
            return Err(StorageError::HookFailed(format!(
                "{} exited with {status}",
                hook.command
            )));
        }

        tracing::debug!(id = %info.id, command = %hook.command, "pre-finish hook ok");
    }
    Ok(())
}
