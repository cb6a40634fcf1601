//! savesync library
//!
//! Process-lifecycle-triggered file synchronization: a fixed-interval poll
//! watches for the monitored application's start and stop edges, imports
//! the remote copy before the application reads its file, and uploads the
//! local file after the application exits, with OAuth2 tokens refreshed
//! silently behind a safety buffer and a backup snapshot taken before any
//! risky overwrite.

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod oauth;
pub mod process;
pub mod remote;

// Re-export the types a caller wires together at startup.
pub use backup::{BackupManager, BackupReason, BackupRecord};
pub use config::{ConfigStore, CredentialConfig, SyncConfig, DEFAULT_CONFIG_FILE};
pub use engine::{SyncEngine, FAULT_BACKOFF, POLL_INTERVAL, SETTLE_DELAY, UPLOAD_COOLDOWN};
pub use error::{AuthError, RemoteError, SyncError, SyncResult};
pub use oauth::{Credential, TokenManager, TokenState};
pub use process::{ProcessProbe, ProcessWatcher};
pub use remote::{DropboxStore, RemoteMetadata, RemoteStore};
