//! Configuration document handling.
//!
//! The configuration lives in a flat JSON key-value document written by the
//! external setup tooling. It is read once at startup; the only fields the
//! engine ever rewrites are the four token fields, and every other key is
//! preserved untouched across a rewrite.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::oauth::TokenState;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_REMOTE_FOLDER: &str = "/SyncedFiles";
pub const DEFAULT_REMOTE_FILE: &str = "save.dat";

const KEY_APP_NAME: &str = "app_name";
const KEY_SAVE_FILE: &str = "save_file_path";
const KEY_STATIC_TOKEN: &str = "dropbox_token";
const KEY_APP_KEY: &str = "app_key";
const KEY_APP_SECRET: &str = "app_secret";
const KEY_FOLDER: &str = "dropbox_folder";
const KEY_FILENAME: &str = "sync_filename";
const KEY_ACCESS_TOKEN: &str = "dropbox_access_token";
const KEY_REFRESH_TOKEN: &str = "dropbox_refresh_token";
const KEY_EXPIRES_IN: &str = "dropbox_token_expires_in";
const KEY_OBTAINED_AT: &str = "dropbox_token_obtained_at";

/// Credential material selected once at startup.
#[derive(Debug, Clone)]
pub enum CredentialConfig {
    /// OAuth app key/secret; tokens are managed by the `TokenManager`.
    OAuth { app_key: String, app_secret: String },
    /// Legacy long-lived bearer token.
    Static { token: String },
}

/// Immutable engine configuration, extracted from the config document.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub app_name: String,
    pub save_file_path: PathBuf,
    pub remote_folder: String,
    pub remote_file: String,
    pub credentials: CredentialConfig,
}

impl SyncConfig {
    /// Remote object path in `{folder}/{filename}` form.
    pub fn remote_path(&self) -> String {
        format!(
            "{}/{}",
            self.remote_folder.trim_end_matches('/'),
            self.remote_file
        )
    }
}

/// Flat key-value configuration document persisted as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    doc: Map<String, Value>,
}

impl ConfigStore {
    /// Load the document. A missing or unreadable file is fatal at startup.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            SyncError::config_with_source(
                format!("failed to read config file {}", path.display()),
                err,
            )
        })?;

        let doc: Map<String, Value> = serde_json::from_str(&content).map_err(|err| {
            SyncError::config_with_source(
                format!("invalid config file {}", path.display()),
                err,
            )
        })?;

        debug!(path = %path.display(), keys = doc.len(), "configuration loaded");
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    /// Extract and validate the engine configuration.
    ///
    /// OAuth credentials take precedence over a legacy static token when
    /// both are present.
    pub fn sync_config(&self) -> SyncResult<SyncConfig> {
        let app_name = self
            .get_str(KEY_APP_NAME)
            .ok_or_else(|| SyncError::config("app_name is required"))?;
        let save_file = self
            .get_str(KEY_SAVE_FILE)
            .ok_or_else(|| SyncError::config("save_file_path is required"))?;

        let credentials = match (self.get_str(KEY_APP_KEY), self.get_str(KEY_APP_SECRET)) {
            (Some(app_key), Some(app_secret)) => CredentialConfig::OAuth {
                app_key,
                app_secret,
            },
            _ => match self.get_str(KEY_STATIC_TOKEN) {
                Some(token) => CredentialConfig::Static { token },
                None => {
                    return Err(SyncError::config(
                        "no credentials configured: set app_key/app_secret or dropbox_token",
                    ))
                }
            },
        };

        Ok(SyncConfig {
            app_name,
            save_file_path: PathBuf::from(save_file),
            remote_folder: self
                .get_str(KEY_FOLDER)
                .unwrap_or_else(|| DEFAULT_REMOTE_FOLDER.to_string()),
            remote_file: self
                .get_str(KEY_FILENAME)
                .unwrap_or_else(|| DEFAULT_REMOTE_FILE.to_string()),
            credentials,
        })
    }

    /// Stored token state, if a complete set of token fields is present.
    pub fn token_state(&self) -> Option<TokenState> {
        let access_token = self.get_str(KEY_ACCESS_TOKEN)?;
        if access_token.is_empty() {
            return None;
        }

        let obtained_at = self
            .get_u64(KEY_OBTAINED_AT)
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .unwrap_or_else(Utc::now);

        Some(TokenState {
            access_token,
            refresh_token: self.get_str(KEY_REFRESH_TOKEN).unwrap_or_default(),
            expires_in: self.get_u64(KEY_EXPIRES_IN).unwrap_or(0),
            obtained_at,
        })
    }

    /// Rewrite the token fields in place and persist the whole document.
    /// Every non-token key keeps its current value.
    pub fn save_tokens(&mut self, state: &TokenState) -> SyncResult<()> {
        self.doc.insert(
            KEY_ACCESS_TOKEN.to_string(),
            Value::String(state.access_token.clone()),
        );
        self.doc.insert(
            KEY_REFRESH_TOKEN.to_string(),
            Value::String(state.refresh_token.clone()),
        );
        self.doc
            .insert(KEY_EXPIRES_IN.to_string(), Value::from(state.expires_in));
        self.doc.insert(
            KEY_OBTAINED_AT.to_string(),
            Value::from(state.obtained_at.timestamp()),
        );
        self.write()
    }

    /// Remove every token field from the document and persist it.
    pub fn clear_tokens(&mut self) -> SyncResult<()> {
        for key in [
            KEY_ACCESS_TOKEN,
            KEY_REFRESH_TOKEN,
            KEY_EXPIRES_IN,
            KEY_OBTAINED_AT,
        ] {
            self.doc.remove(key);
        }
        self.write()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self) -> SyncResult<()> {
        let content = serde_json::to_string_pretty(&Value::Object(self.doc.clone()))
            .map_err(|err| SyncError::config_with_source("failed to serialize config", err))?;
        fs::write(&self.path, content).map_err(|err| {
            SyncError::filesystem(
                "failed to write config file",
                self.path.display().to_string(),
                err,
            )
        })
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.doc
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.doc.get(key).and_then(Value::as_u64)
    }
}
