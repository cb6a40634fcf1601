//! The import/export state machine behind the polling loop.
//!
//! The engine owns injected instances of the remote store, the credential,
//! the backup manager and the process probe, and advances on a fixed tick.
//! Edges of the monitored application's running state, never raw levels,
//! trigger work: a start edge imports the remote copy (behind a safety
//! backup), a stop edge uploads the local file after a settle delay,
//! subject to a cooldown. Remote and auth failures are logged and the loop
//! carries on; they are retried naturally on the next edge.

use std::fs;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::backup::{BackupManager, BackupReason};
use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::oauth::Credential;
use crate::process::ProcessProbe;
use crate::remote::{RemoteMetadata, RemoteStore};

/// Fixed cadence of the monitor loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Wait after a stop edge so the application finishes flushing its writes.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);
/// Minimum interval between uploads from the monitor loop.
pub const UPLOAD_COOLDOWN: Duration = Duration::from_secs(30);
/// Pause after an unexpected cycle failure before polling resumes.
pub const FAULT_BACKOFF: Duration = Duration::from_secs(10);

pub struct SyncEngine<R, P> {
    config: SyncConfig,
    remote: R,
    credential: Credential,
    backup: BackupManager,
    probe: P,
    app_was_running: bool,
    last_upload: Option<Instant>,
}

impl<R: RemoteStore, P: ProcessProbe> SyncEngine<R, P> {
    pub fn new(config: SyncConfig, remote: R, credential: Credential, probe: P) -> Self {
        let backup = BackupManager::new(&config.save_file_path);
        Self {
            config,
            remote,
            credential,
            backup,
            probe,
            app_was_running: false,
            last_upload: None,
        }
    }

    /// Run the monitor loop until the surrounding task is cancelled.
    ///
    /// Strictly sequential: a slow network call delays the next tick rather
    /// than running concurrently with it. A failed cycle is logged and
    /// followed by a backoff; it never terminates the loop.
    pub async fn run(&mut self) {
        info!(
            app = %self.config.app_name,
            file = %self.config.save_file_path.display(),
            "sync engine started"
        );

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                error!(error = %err, "sync cycle failed");
                tokio::time::sleep(FAULT_BACKOFF).await;
            }
        }
    }

    /// One poll of the state machine. Edge detection compares this tick's
    /// observation against the previous tick's; the running-state memory
    /// advances before any remote work so a failed import or export can
    /// never retrigger on the next tick.
    pub async fn tick(&mut self) -> SyncResult<()> {
        let is_running = self.probe.poll();
        let was_running = self.app_was_running;
        self.app_was_running = is_running;

        if is_running && !was_running {
            info!(app = %self.config.app_name, "application started");
            match self.import().await {
                Ok(true) => info!("pre-start import successful"),
                Ok(false) => info!("nothing to import"),
                Err(err @ SyncError::Filesystem { .. }) => return Err(err),
                Err(err) => warn!(error = %err, "import failed, continuing with local copy"),
            }
        } else if !is_running && was_running {
            info!(app = %self.config.app_name, "application closed");
            tokio::time::sleep(SETTLE_DELAY).await;
            match self.export(false).await {
                Ok(true) => info!("save uploaded"),
                Ok(false) => {}
                Err(err @ SyncError::Filesystem { .. }) => return Err(err),
                Err(err) => {
                    warn!(error = %err, "upload failed, will retry on the next stop edge")
                }
            }
        }

        Ok(())
    }

    /// One import cycle: safety backup, then metadata lookup and download.
    /// Returns `Ok(false)` when there is no remote copy yet.
    pub async fn import(&mut self) -> SyncResult<bool> {
        self.backup.create(BackupReason::PreImport);

        let remote_path = self.config.remote_path();
        let metadata = match self.metadata_with_retry(&remote_path).await {
            Ok(meta) => meta,
            Err(SyncError::Remote(RemoteError::NotFound)) => {
                info!("no remote copy found");
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        info!(name = %metadata.name, size = ?metadata.size, "remote copy found");

        let dest = self.config.save_file_path.clone();
        self.download_with_retry(&remote_path, &dest).await?;
        Ok(true)
    }

    /// One export cycle: read the whole local file and upload it with
    /// overwrite semantics. `ignore_cooldown` is set on the manual path;
    /// the monitor loop honors the cooldown window.
    pub async fn export(&mut self, ignore_cooldown: bool) -> SyncResult<bool> {
        if !ignore_cooldown {
            if let Some(last) = self.last_upload {
                let since = last.elapsed();
                if since < UPLOAD_COOLDOWN {
                    info!(elapsed = ?since, "skipping upload inside the cooldown window");
                    return Ok(false);
                }
            }
        }

        if !self.config.save_file_path.exists() {
            info!("local file does not exist, nothing to upload");
            return Ok(false);
        }

        let bytes = fs::read(&self.config.save_file_path).map_err(|err| {
            SyncError::filesystem(
                "failed to read local file for upload",
                self.config.save_file_path.display().to_string(),
                err,
            )
        })?;

        let remote_path = self.config.remote_path();
        self.upload_with_retry(&remote_path, bytes).await?;
        self.last_upload = Some(Instant::now());
        Ok(true)
    }

    /// Connectivity check for `--test`: the remote store must answer the
    /// metadata call; a missing remote copy is fine.
    pub async fn verify(&mut self) -> SyncResult<()> {
        let remote_path = self.config.remote_path();
        match self.metadata_with_retry(&remote_path).await {
            Ok(meta) => {
                info!(name = %meta.name, "remote copy present");
                Ok(())
            }
            Err(SyncError::Remote(RemoteError::NotFound)) => {
                info!("remote store reachable, nothing uploaded yet");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // A rejected bearer earns exactly one refresh followed by one retry of
    // the same call. A second rejection fails the cycle.

    async fn metadata_with_retry(&mut self, path: &str) -> SyncResult<RemoteMetadata> {
        let token = self.credential.bearer().await?;
        match self.remote.get_metadata(&token, path).await {
            Err(RemoteError::AuthExpired) => {
                info!("bearer rejected, refreshing credentials");
                self.credential.refresh().await?;
                let token = self.credential.bearer().await?;
                Ok(self.remote.get_metadata(&token, path).await?)
            }
            other => Ok(other?),
        }
    }

    async fn download_with_retry(&mut self, path: &str, dest: &std::path::Path) -> SyncResult<()> {
        let token = self.credential.bearer().await?;
        match self.remote.download(&token, path, dest).await {
            Err(RemoteError::AuthExpired) => {
                info!("bearer rejected, refreshing credentials");
                self.credential.refresh().await?;
                let token = self.credential.bearer().await?;
                Ok(self.remote.download(&token, path, dest).await?)
            }
            other => Ok(other?),
        }
    }

    async fn upload_with_retry(&mut self, path: &str, bytes: Vec<u8>) -> SyncResult<()> {
        let token = self.credential.bearer().await?;
        match self.remote.upload(&token, path, bytes.clone()).await {
            Err(RemoteError::AuthExpired) => {
                info!("bearer rejected, refreshing credentials");
                self.credential.refresh().await?;
                let token = self.credential.bearer().await?;
                Ok(self.remote.upload(&token, path, bytes).await?)
            }
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, CredentialConfig};
    use crate::oauth::{OAuthEndpoints, TokenManager};
    use crate::remote::RemoteMetadata;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedProbe {
        script: VecDeque<bool>,
        last: bool,
    }

    impl ScriptedProbe {
        fn new(observations: &[bool]) -> Self {
            Self {
                script: observations.iter().copied().collect(),
                last: false,
            }
        }
    }

    impl ProcessProbe for ScriptedProbe {
        fn poll(&mut self) -> bool {
            if let Some(next) = self.script.pop_front() {
                self.last = next;
            }
            self.last
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        remote_bytes: Mutex<Option<Vec<u8>>>,
        metadata_errors: Mutex<VecDeque<RemoteError>>,
        upload_errors: Mutex<VecDeque<RemoteError>>,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
        metadata_calls: AtomicUsize,
        download_calls: AtomicUsize,
        upload_calls: AtomicUsize,
    }

    impl FakeRemote {
        fn with_remote_bytes(bytes: &[u8]) -> Self {
            Self {
                remote_bytes: Mutex::new(Some(bytes.to_vec())),
                ..Self::default()
            }
        }

        fn push_upload_error(&self, err: RemoteError) {
            self.upload_errors.lock().unwrap().push_back(err);
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemote {
        async fn get_metadata(
            &self,
            _token: &str,
            _path: &str,
        ) -> Result<RemoteMetadata, RemoteError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.metadata_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            match self.remote_bytes.lock().unwrap().as_ref() {
                Some(bytes) => Ok(RemoteMetadata {
                    name: "save.dat".into(),
                    size: Some(bytes.len() as u64),
                    server_modified: None,
                    rev: None,
                }),
                None => Err(RemoteError::NotFound),
            }
        }

        async fn download(
            &self,
            _token: &str,
            _path: &str,
            dest: &Path,
        ) -> Result<(), RemoteError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            match self.remote_bytes.lock().unwrap().as_ref() {
                Some(bytes) => {
                    fs::write(dest, bytes).unwrap();
                    Ok(())
                }
                None => Err(RemoteError::NotFound),
            }
        }

        async fn upload(
            &self,
            _token: &str,
            path: &str,
            bytes: Vec<u8>,
        ) -> Result<(), RemoteError> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.upload_errors.lock().unwrap().pop_front() {
                return Err(err);
            }
            *self.remote_bytes.lock().unwrap() = Some(bytes.clone());
            self.uploads.lock().unwrap().push((path.to_string(), bytes));
            Ok(())
        }
    }

    fn test_config(dir: &TempDir) -> SyncConfig {
        SyncConfig {
            app_name: "maa redux".into(),
            save_file_path: dir.path().join("save.dat"),
            remote_folder: "/SyncedFiles".into(),
            remote_file: "save.dat".into(),
            credentials: CredentialConfig::Static {
                token: "tok".into(),
            },
        }
    }

    fn static_engine(
        dir: &TempDir,
        remote: FakeRemote,
        observations: &[bool],
    ) -> SyncEngine<FakeRemote, ScriptedProbe> {
        SyncEngine::new(
            test_config(dir),
            remote,
            Credential::Static("tok".into()),
            ScriptedProbe::new(observations),
        )
    }

    fn backup_names(dir: &TempDir) -> Vec<String> {
        let backups = dir.path().join("backups");
        if !backups.exists() {
            return Vec::new();
        }
        let mut names: Vec<String> = fs::read_dir(backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test(start_paused = true)]
    async fn one_import_per_start_edge_one_export_per_stop_edge() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"local").unwrap();

        let remote = FakeRemote::with_remote_bytes(b"remote");
        let mut engine =
            static_engine(&dir, remote, &[false, true, true, true, false, false, false]);

        for _ in 0..7 {
            engine.tick().await.unwrap();
        }

        assert_eq!(engine.remote.download_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup_names(&dir).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_a_import_overwrites_local_and_takes_one_backup() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"old local bytes").unwrap();

        let remote = FakeRemote::with_remote_bytes(b"new remote bytes");
        let mut engine = static_engine(&dir, remote, &[false, true]);

        engine.tick().await.unwrap();
        engine.tick().await.unwrap();

        assert_eq!(
            fs::read(dir.path().join("save.dat")).unwrap(),
            b"new remote bytes"
        );
        let names = backup_names(&dir);
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("backup_pre_import_"));
        // The backup holds the pre-import bytes.
        let backup = dir.path().join("backups").join(&names[0]);
        assert_eq!(fs::read(backup).unwrap(), b"old local bytes");
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_stop_edge_uploads_the_local_file_verbatim() {
        let dir = TempDir::new().unwrap();
        let payload = b"\x00final save state\xff".to_vec();
        fs::write(dir.path().join("save.dat"), &payload).unwrap();

        let mut engine = static_engine(&dir, FakeRemote::default(), &[true, false]);

        engine.tick().await.unwrap();
        engine.tick().await.unwrap();

        let uploads = engine.remote.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "/SyncedFiles/save.dat");
        assert_eq!(uploads[0].1, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_remote_copy_is_benign_on_import() {
        let dir = TempDir::new().unwrap();
        let mut engine = static_engine(&dir, FakeRemote::default(), &[false, true]);

        engine.tick().await.unwrap();
        engine.tick().await.unwrap();

        assert_eq!(engine.remote.download_calls.load(Ordering::SeqCst), 0);
        assert!(engine.app_was_running);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_rapid_reupload() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"data").unwrap();

        let mut engine = static_engine(
            &dir,
            FakeRemote::default(),
            &[true, false, true, false, true, false],
        );

        // First flap uploads.
        engine.tick().await.unwrap();
        engine.tick().await.unwrap();
        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 1);

        // Second flap lands well inside the 30s window (only the 5s settle
        // delay has elapsed) and is skipped.
        engine.tick().await.unwrap();
        engine.tick().await.unwrap();
        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 1);

        // Past the cooldown the next stop edge uploads again.
        tokio::time::advance(Duration::from_secs(31)).await;
        engine.tick().await.unwrap();
        engine.tick().await.unwrap();
        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn manual_export_ignores_the_cooldown() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"data").unwrap();

        let mut engine = static_engine(&dir, FakeRemote::default(), &[]);
        engine.last_upload = Some(Instant::now());

        assert!(engine.export(true).await.unwrap());
        assert!(!engine.export(false).await.unwrap());
    }

    #[tokio::test]
    async fn export_without_a_local_file_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut engine = static_engine(&dir, FakeRemote::default(), &[]);

        assert!(!engine.export(true).await.unwrap());
        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 0);
    }

    fn oauth_config_with_fresh_token(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            format!(
                r#"{{
                    "app_name": "maa redux",
                    "save_file_path": "/tmp/save.dat",
                    "app_key": "k",
                    "app_secret": "s",
                    "dropbox_access_token": "fresh-access",
                    "dropbox_refresh_token": "stored-refresh",
                    "dropbox_token_expires_in": 14400,
                    "dropbox_token_obtained_at": {}
                }}"#,
                Utc::now().timestamp()
            ),
        )
        .unwrap();
        path
    }

    fn oauth_credential(server: &MockServer, dir: &TempDir) -> Credential {
        let store = ConfigStore::load(oauth_config_with_fresh_token(dir)).unwrap();
        let manager = TokenManager::new("k".into(), "s".into(), store).with_endpoints(
            OAuthEndpoints {
                authorize_url: format!("{}/oauth2/authorize", server.uri()),
                token_url: format!("{}/oauth2/token", server.uri()),
            },
        );
        Credential::OAuth(Box::new(manager))
    }

    #[tokio::test]
    async fn auth_expired_triggers_exactly_one_refresh_and_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "refreshed-access",
                "expires_in": 14400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"data").unwrap();

        let remote = FakeRemote::default();
        remote.push_upload_error(RemoteError::AuthExpired);

        let credential = oauth_credential(&server, &dir);
        let mut engine = SyncEngine::new(
            test_config(&dir),
            remote,
            credential,
            ScriptedProbe::new(&[]),
        );

        assert!(engine.export(true).await.unwrap());
        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_second_auth_expired_fails_the_cycle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "refreshed-access",
                "expires_in": 14400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"data").unwrap();

        let remote = FakeRemote::default();
        remote.push_upload_error(RemoteError::AuthExpired);
        remote.push_upload_error(RemoteError::AuthExpired);

        let credential = oauth_credential(&server, &dir);
        let mut engine = SyncEngine::new(
            test_config(&dir),
            remote,
            credential,
            ScriptedProbe::new(&[]),
        );

        let err = engine.export(true).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Remote(RemoteError::AuthExpired)
        ));
        // No unbounded retry: two attempts, one refresh.
        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn static_credential_cannot_recover_from_auth_expired() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"data").unwrap();

        let remote = FakeRemote::default();
        remote.push_upload_error(RemoteError::AuthExpired);

        let mut engine = static_engine(&dir, remote, &[true, false]);

        engine.tick().await.unwrap();
        // The stop edge logs and swallows the failed upload.
        engine.tick().await.unwrap();

        assert_eq!(engine.remote.upload_calls.load(Ordering::SeqCst), 1);
        assert!(engine.remote.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_on_the_next_stop_edge() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("save.dat"), b"data").unwrap();

        let remote = FakeRemote::default();
        remote.push_upload_error(RemoteError::Transient("503".into()));

        let mut engine = static_engine(&dir, remote, &[true, false, true, false]);

        engine.tick().await.unwrap();
        engine.tick().await.unwrap();
        assert!(engine.remote.uploads.lock().unwrap().is_empty());

        // Failed upload did not start the cooldown; the next flap retries.
        engine.tick().await.unwrap();
        engine.tick().await.unwrap();
        assert_eq!(engine.remote.uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn verify_accepts_a_missing_remote_copy() {
        let dir = TempDir::new().unwrap();
        let mut engine = static_engine(&dir, FakeRemote::default(), &[]);
        engine.verify().await.unwrap();
    }

    #[tokio::test]
    async fn verify_fails_on_a_fatal_remote_error() {
        let dir = TempDir::new().unwrap();
        let remote = FakeRemote::default();
        remote
            .metadata_errors
            .lock()
            .unwrap()
            .push_back(RemoteError::Fatal("permission denied".into()));

        let mut engine = static_engine(&dir, remote, &[]);
        assert!(engine.verify().await.is_err());
    }
}
