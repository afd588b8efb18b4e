use anyhow::Result;
use std::path::{Path, PathBuf};

const LOG_FOLDER_NAME: &str = "pg-provision-logs";

/// Resolve deployment folder (absolute path)
pub fn resolve_deployment_folder() -> PathBuf {
    // Prefer the folder where the EXE is running from
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return dir.to_path_buf();
        }
    }

    // Fallback: current working directory
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Resolve log folder (absolute path), creating it if needed.
///
/// Order: explicit override, `<local data dir>/pg-provision-logs`, `<deployment>/pg-provision-logs`.
pub fn resolve_log_folder(explicit: Option<&Path>) -> Result<PathBuf> {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => dirs::data_local_dir()
            .map(|d| d.join(LOG_FOLDER_NAME))
            .unwrap_or_else(|| resolve_deployment_folder().join(LOG_FOLDER_NAME)),
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", dir, e))?;
    Ok(dir)
}
