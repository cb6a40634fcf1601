//! Remote object store access with classified outcomes.
//!
//! Every call resolves to `Ok` or one of the four `RemoteError` classes;
//! the engine's retry policy acts on the class, never on the raw transport
//! error. The Dropbox adapter is the only production implementation; tests
//! substitute fakes through the `RemoteStore` trait.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::RemoteError;

const DROPBOX_API_BASE: &str = "https://api.dropboxapi.com/2";
const DROPBOX_CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

/// Metadata of the remote copy of the synchronized file.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMetadata {
    pub name: String,
    pub size: Option<u64>,
    pub server_modified: Option<String>,
    pub rev: Option<String>,
}

/// Capability set the engine needs from a remote store. The bearer token is
/// supplied per call so the store stays agnostic of the credential mode.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_metadata(&self, token: &str, path: &str) -> Result<RemoteMetadata, RemoteError>;

    async fn download(&self, token: &str, path: &str, dest: &Path) -> Result<(), RemoteError>;

    /// Upload with overwrite semantics: no conflict detection, last writer
    /// wins.
    async fn upload(&self, token: &str, path: &str, bytes: Vec<u8>) -> Result<(), RemoteError>;
}

/// Dropbox HTTP API adapter.
#[derive(Debug, Clone)]
pub struct DropboxStore {
    http: reqwest::Client,
    api_base: String,
    content_base: String,
}

impl Default for DropboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DropboxStore {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: DROPBOX_API_BASE.to_string(),
            content_base: DROPBOX_CONTENT_BASE.to_string(),
        }
    }

    /// Point both hosts somewhere else. Used by tests.
    pub fn with_bases(mut self, api_base: impl Into<String>, content_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.content_base = content_base.into();
        self
    }
}

#[async_trait]
impl RemoteStore for DropboxStore {
    async fn get_metadata(&self, token: &str, path: &str) -> Result<RemoteMetadata, RemoteError> {
        debug!(path, "fetching remote metadata");

        let response = self
            .http
            .post(format!("{}/files/get_metadata", self.api_base))
            .bearer_auth(token)
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        response
            .json::<RemoteMetadata>()
            .await
            .map_err(|err| RemoteError::Fatal(format!("malformed metadata response: {err}")))
    }

    async fn download(&self, token: &str, path: &str, dest: &Path) -> Result<(), RemoteError> {
        debug!(path, dest = %dest.display(), "downloading remote file");

        let arg = serde_json::json!({ "path": path }).to_string();
        let response = self
            .http
            .post(format!("{}/files/download", self.content_base))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", arg)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        let bytes = response.bytes().await.map_err(transport)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| RemoteError::Fatal(format!("cannot create destination: {err}")))?;
        }
        fs::write(dest, &bytes)
            .map_err(|err| RemoteError::Fatal(format!("cannot write downloaded file: {err}")))?;

        info!(bytes = bytes.len(), dest = %dest.display(), "download complete");
        Ok(())
    }

    async fn upload(&self, token: &str, path: &str, bytes: Vec<u8>) -> Result<(), RemoteError> {
        debug!(path, bytes = bytes.len(), "uploading file");

        let arg = serde_json::json!({
            "path": path,
            "mode": "overwrite",
            "mute": true
        })
        .to_string();

        let response = self
            .http
            .post(format!("{}/files/upload", self.content_base))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", arg)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        info!(path, "upload complete");
        Ok(())
    }
}

/// Classify a non-success HTTP response.
///
/// Dropbox reports a missing path as 409 with a `not_found` summary, which
/// is the benign nothing-uploaded-yet case on first run.
fn classify_failure(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::AuthExpired,
        StatusCode::CONFLICT if body.contains("not_found") => RemoteError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("rate limited: {}", truncate(body)))
        }
        status if status.is_server_error() => {
            RemoteError::Transient(format!("{status}: {}", truncate(body)))
        }
        status => RemoteError::Fatal(format!("{status}: {}", truncate(body))),
    }
}

/// Network-level failures may succeed on a later cycle.
fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(err.to_string())
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        return body.to_string();
    }
    // Cut on a char boundary; byte 200 may fall inside a multibyte char.
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
