// Directory snapshots and the rollback transaction

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to snapshot {}: {source}", .path.display())]
    Copy { path: PathBuf, source: io::Error },

    #[error("Failed to create backup directory {}: {source}", .path.display())]
    BackupDir { path: PathBuf, source: io::Error },

    #[error("Failed to restore {} (backup kept at {}): {source}", .path.display(), .backup.as_deref().map_or("none".to_string(), |b| b.display().to_string()))]
    Restore {
        path: PathBuf,
        backup: Option<PathBuf>,
        source: io::Error,
    },
}

/// Recursively copy `src` into `dst` (created if missing)
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// One recorded (original, backup) pair
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub original: PathBuf,
    /// None when the original did not exist yet; rollback then just deletes it
    pub backup: Option<PathBuf>,
    pub taken_at: String,
}

/// Outcome of a rollback
#[derive(Debug, Default, Serialize)]
pub struct RollbackReport {
    pub restored: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Accumulates snapshots taken during a run so they can be undone together
#[derive(Debug)]
pub struct Transaction {
    backup_root: PathBuf,
    entries: Vec<SnapshotEntry>,
    seen: HashSet<PathBuf>,
    next_id: usize,
}

impl Transaction {
    /// Create a transaction whose backups live under `backup_root`
    pub fn new<P: AsRef<Path>>(backup_root: P) -> Self {
        Self {
            backup_root: backup_root.as_ref().to_path_buf(),
            entries: Vec::new(),
            seen: HashSet::new(),
            next_id: 0,
        }
    }

    /// Recorded snapshots, in the order they were taken
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Snapshot `original` before it gets mutated. Repeat calls for the same path are no-ops.
    pub fn snapshot(&mut self, original: &Path) -> Result<(), SnapshotError> {
        if self.seen.contains(original) {
            return Ok(());
        }

        let backup = if original.is_dir() {
            Some(self.back_up(original)?)
        } else {
            log::debug!("snapshot {} (did not exist)", original.display());
            None
        };

        self.entries.push(SnapshotEntry {
            original: original.to_path_buf(),
            backup,
            taken_at: Utc::now().to_rfc3339(),
        });
        self.seen.insert(original.to_path_buf());

        Ok(())
    }

    fn back_up(&mut self, original: &Path) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(&self.backup_root).map_err(|source| SnapshotError::BackupDir {
            path: self.backup_root.clone(),
            source,
        })?;

        let dir_name = original
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let backup = self.backup_root.join(format!("{}-{}", self.next_id, dir_name));
        self.next_id += 1;

        let copied = remove_if_exists(&backup).and_then(|_| copy_dir_recursive(original, &backup));
        if let Err(source) = copied {
            if let Err(e) = remove_if_exists(&backup) {
                log::warn!("failed to remove partial backup {}: {}", backup.display(), e);
            }
            return Err(SnapshotError::Copy {
                path: original.to_path_buf(),
                source,
            });
        }

        log::debug!("snapshot {} -> {}", original.display(), backup.display());
        Ok(backup)
    }

    /// Put `original` back the way it was before this run and stop tracking it.
    /// Unknown paths are a no-op. On failure the backup is left on disk.
    pub fn restore(&mut self, original: &Path) -> Result<(), SnapshotError> {
        let Some(index) = self.entries.iter().position(|e| e.original == original) else {
            return Ok(());
        };

        let entry = self.entries.remove(index);
        self.seen.remove(&entry.original);

        restore_entry(&entry).map_err(|source| SnapshotError::Restore {
            path: entry.original.clone(),
            backup: entry.backup.clone(),
            source,
        })?;

        log::info!("restored {}", entry.original.display());
        Ok(())
    }

    /// Restore every recorded snapshot, newest first. Best effort: failures are
    /// logged and reported, never raised.
    pub fn rollback(self) -> RollbackReport {
        let mut report = RollbackReport::default();

        for entry in self.entries.into_iter().rev() {
            match restore_entry(&entry) {
                Ok(()) => {
                    log::info!("restored {}", entry.original.display());
                    report.restored.push(entry.original);
                }
                Err(e) => {
                    log::error!("failed to restore {}: {}", entry.original.display(), e);
                    report.failed.push((entry.original, e.to_string()));
                }
            }
        }

        report
    }

    /// Keep the mutations and drop the backups
    pub fn commit(self) {
        for entry in &self.entries {
            if let Some(backup) = &entry.backup {
                if let Err(e) = remove_if_exists(backup) {
                    log::warn!("failed to remove backup {}: {}", backup.display(), e);
                }
            }
        }
    }
}

fn restore_entry(entry: &SnapshotEntry) -> io::Result<()> {
    remove_if_exists(&entry.original)?;

    if let Some(backup) = &entry.backup {
        copy_dir_recursive(backup, &entry.original)?;
        remove_if_exists(backup)?;
    }

    Ok(())
}
