// Filesystem helpers.
//
// - Directory creation is idempotent and reports whether anything was created.
// - Recursive deletion never relies on a tree-walk order: entries are collected first and
//   removed deepest-first, so a directory is always empty before its own removal.
// - The cluster-initialisation password lives in a `CredentialFile` that is removed on every
//   exit path.

use log::{debug, info};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::Secret;
use crate::error::{IoResultExt, ProvisionError, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Local timestamp used in backup names (`20260131_235959`).
pub fn backup_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Create `path` (and parents) if absent. Returns `true` when it was created.
pub async fn ensure_dir(path: &Path) -> Result<bool> {
    if tokio::fs::try_exists(path).await.with_path("stat", path)? {
        debug!(
            "[PHASE: files] [STEP: ensure_dir] Directory already exists: {:?}",
            path
        );
        return Ok(false);
    }
    tokio::fs::create_dir_all(path)
        .await
        .with_path("create_dir_all", path)?;
    info!("[PHASE: files] [STEP: ensure_dir] Created directory: {:?}", path);
    Ok(true)
}

/// Make `path` absolute against the current directory (no symlink resolution).
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| ProvisionError::io("current_dir failed", e))?;
    Ok(cwd.join(path))
}

pub async fn path_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path).await.with_path("stat", path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Recursively collect every entry under `root` (root included). Symlinks are not followed;
/// they are reported as files so that only the link itself is removed.
pub async fn collect_entries_recursive(root: &Path) -> Result<Vec<(PathBuf, EntryKind)>> {
    let started = Instant::now();
    debug!(
        "[PHASE: files] [STEP: collect] collect_entries_recursive entered (root={:?})",
        root
    );

    let mut out: Vec<(PathBuf, EntryKind)> = vec![(root.to_path_buf(), EntryKind::Dir)];
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir).await.with_path("read_dir", &dir)?;
        while let Some(ent) = rd.next_entry().await.with_path("read_dir", &dir)? {
            let p = ent.path();
            let meta = tokio::fs::symlink_metadata(&p)
                .await
                .with_path("symlink_metadata", &p)?;
            if meta.is_dir() {
                stack.push(p.clone());
                out.push((p, EntryKind::Dir));
            } else {
                out.push((p, EntryKind::File));
            }
        }
    }

    debug!(
        "[PHASE: files] [STEP: collect] collect_entries_recursive exit (entries={}, duration_ms={})",
        out.len(),
        started.elapsed().as_millis()
    );
    Ok(out)
}

/// Order entries so that every child precedes its parent: deepest paths first.
pub fn deletion_order(mut entries: Vec<(PathBuf, EntryKind)>) -> Vec<(PathBuf, EntryKind)> {
    entries.sort_by(|(a, _), (b, _)| {
        let da = a.components().count();
        let db = b.components().count();
        db.cmp(&da).then_with(|| b.cmp(a))
    });
    entries
}

/// Delete the directory tree at `root`, deepest entries first. A missing root is a no-op.
/// Returns the number of removed entries.
pub async fn delete_dir_recursive(root: &Path) -> Result<usize> {
    let started = Instant::now();
    if !path_exists(root).await? {
        info!(
            "[PHASE: files] [STEP: delete_tree] Directory does not exist: {:?}",
            root
        );
        return Ok(0);
    }

    let ordered = deletion_order(collect_entries_recursive(root).await?);
    let total = ordered.len();
    for (path, kind) in ordered {
        match kind {
            EntryKind::File => tokio::fs::remove_file(&path)
                .await
                .with_path("remove_file", &path)?,
            EntryKind::Dir => tokio::fs::remove_dir(&path)
                .await
                .with_path("remove_dir", &path)?,
        }
    }

    info!(
        "[PHASE: files] [STEP: delete_tree] Deleted directory tree {:?} (entries={}, duration_ms={})",
        root,
        total,
        started.elapsed().as_millis()
    );
    Ok(total)
}

/// Move (rename) a file or directory. Fails if the destination exists.
pub async fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if path_exists(dst).await? {
        return Err(ProvisionError::fs(
            "move",
            dst,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "destination exists"),
        ));
    }
    tokio::fs::rename(src, dst)
        .await
        .map_err(|e| ProvisionError::io(format!("move failed: {:?} -> {:?}", src, dst), e))
}

pub async fn read_to_string(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_path("read", path)
}

pub async fn write_string(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content).await.with_path("write", path)
}

/// Single-use file holding a password for a tool that reads it from disk (`initdb --pwfile`).
///
/// The file is deleted by [`CredentialFile::remove`] or, if that is never reached, on drop.
#[derive(Debug)]
pub struct CredentialFile {
    file: tempfile::NamedTempFile,
}

impl CredentialFile {
    pub fn create_in(dir: &Path, secret: &Secret) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("pwfile-")
            .tempfile_in(dir)
            .with_path("create credential file in", dir)?;
        file.write_all(secret.expose().as_bytes())
            .and_then(|_| file.flush())
            .with_path("write credential file", file.path().to_path_buf())?;
        debug!(
            "[PHASE: files] [STEP: credential_file] Credential file written: {:?}",
            file.path()
        );
        Ok(CredentialFile { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn remove(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        self.file.close().with_path("remove credential file", &path)?;
        debug!(
            "[PHASE: files] [STEP: credential_file] Credential file removed: {:?}",
            path
        );
        Ok(())
    }
}
