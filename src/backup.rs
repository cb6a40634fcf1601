//! Best-effort local snapshots of the synchronized file.
//!
//! A backup is taken before any operation that may overwrite the local copy.
//! Failures are logged and swallowed: the snapshot is a safety net, never a
//! precondition for the operation that requested it.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use tracing::{info, warn};

const BACKUP_DIR: &str = "backups";

/// Why a backup was taken. Encoded into the backup file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupReason {
    PreImport,
    Manual,
}

impl BackupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupReason::PreImport => "pre_import",
            BackupReason::Manual => "manual",
        }
    }
}

/// A snapshot that was successfully written.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub reason: BackupReason,
    pub created_at: DateTime<Utc>,
}

/// Copies the synchronized file into a `backups` directory beside it.
#[derive(Debug, Clone)]
pub struct BackupManager {
    source: PathBuf,
}

impl BackupManager {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Snapshot the source file. Returns `None` when the source does not
    /// exist or the copy fails; backups are never deleted or rewritten.
    pub fn create(&self, reason: BackupReason) -> Option<BackupRecord> {
        if !self.source.exists() {
            return None;
        }

        let file_name = self.source.file_name()?.to_string_lossy();
        // Lexicographically sortable timestamp, second resolution.
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup_name = format!("backup_{}_{timestamp}_{file_name}", reason.as_str());

        let backup_dir = self.source.parent()?.join(BACKUP_DIR);
        if let Err(err) = fs::create_dir_all(&backup_dir) {
            warn!(error = %err, dir = %backup_dir.display(), "failed to create backup directory");
            return None;
        }

        let backup_path = backup_dir.join(backup_name);
        match fs::copy(&self.source, &backup_path) {
            Ok(_) => {
                info!(backup = %backup_path.display(), "backup created");
                Some(BackupRecord {
                    path: backup_path,
                    reason,
                    created_at: Utc::now(),
                })
            }
            Err(err) => {
                warn!(error = %err, backup = %backup_path.display(), "backup failed");
                None
            }
        }
    }
}
