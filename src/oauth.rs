//! OAuth2 credential lifecycle for the Dropbox API.
//!
//! `TokenManager` owns the stored token pair: it refreshes the access token
//! behind a safety buffer before real expiry, runs the interactive
//! authorization-code flow with a one-shot loopback listener, and persists
//! every successful outcome back into the config document. A failed refresh
//! never touches the stored refresh token.

use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConfigStore;
use crate::error::{AuthError, SyncResult};

pub const DROPBOX_AUTHORIZE_URL: &str = "https://www.dropbox.com/oauth2/authorize";
pub const DROPBOX_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

/// Margin subtracted from the expiry time so tokens are refreshed before
/// the remote store starts rejecting them.
pub const TOKEN_SAFETY_BUFFER_SECS: i64 = 300;

/// How long the interactive authorization flow waits for the browser
/// callback before giving up.
pub const AUTH_FLOW_TIMEOUT: Duration = Duration::from_secs(300);

const CALLBACK_PORT: u16 = 8080;
const REDIRECT_URI: &str = "http://localhost:8080/oauth/callback";

const SUCCESS_PAGE: &str = "<html><body>\
<h2>Authorization Successful!</h2>\
<p>You can now close this window and return to the application.</p>\
</body></html>";

const DENIED_PAGE: &str = "<html><body>\
<h2>Authorization Failed</h2>\
<p>Please close this window and try again.</p>\
</body></html>";

const INVALID_PAGE: &str = "<html><body><h2>Invalid Request</h2></body></html>";

/// Stored token pair with expiry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds as reported by the token endpoint; 0 means the
    /// endpoint gave no expiry and the token is treated as non-expiring.
    pub expires_in: u64,
    pub obtained_at: DateTime<Utc>,
}

impl TokenState {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expires_in == 0 {
            None
        } else {
            Some(self.obtained_at + TimeDelta::seconds(self.expires_in as i64))
        }
    }

    /// Usable only while `now < expires_at - safety buffer`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            None => true,
            Some(expires_at) => now < expires_at - TimeDelta::seconds(TOKEN_SAFETY_BUFFER_SECS),
        }
    }
}

/// OAuth endpoints, injectable for tests.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: DROPBOX_AUTHORIZE_URL.to_string(),
            token_url: DROPBOX_TOKEN_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Owns the OAuth token lifecycle and its persistence.
#[derive(Debug)]
pub struct TokenManager {
    app_key: String,
    app_secret: String,
    redirect_uri: String,
    endpoints: OAuthEndpoints,
    http: reqwest::Client,
    store: ConfigStore,
    state: Option<TokenState>,
}

impl TokenManager {
    pub fn new(app_key: String, app_secret: String, store: ConfigStore) -> Self {
        let state = store.token_state();
        Self {
            app_key,
            app_secret,
            redirect_uri: REDIRECT_URI.to_string(),
            endpoints: OAuthEndpoints::default(),
            http: reqwest::Client::new(),
            store,
            state,
        }
    }

    pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn is_authorized(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| !s.access_token.is_empty() && !s.refresh_token.is_empty())
            .unwrap_or(false)
    }

    pub fn token_state(&self) -> Option<&TokenState> {
        self.state.as_ref()
    }

    /// Returns the stored access token while it is fresh per the safety
    /// buffer, otherwise attempts exactly one refresh. `None` when nothing
    /// is stored or the refresh fails.
    pub async fn valid_access_token(&mut self) -> Option<String> {
        let state = self.state.as_ref()?;
        if state.access_token.is_empty() {
            warn!("no access token available");
            return None;
        }

        if state.is_usable_at(Utc::now()) {
            return Some(state.access_token.clone());
        }

        info!("access token expired, refreshing");
        match self.refresh().await {
            Ok(()) => self.state.as_ref().map(|s| s.access_token.clone()),
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                None
            }
        }
    }

    /// Exchange the stored refresh token for a new access token. The
    /// refresh token itself is retained: Dropbox does not rotate it. Any
    /// failure leaves the stored state untouched.
    pub async fn refresh(&mut self) -> Result<(), AuthError> {
        let current = self.state.as_ref().ok_or(AuthError::NoRefreshToken)?;
        if current.refresh_token.is_empty() {
            return Err(AuthError::NoRefreshToken);
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", current.refresh_token.as_str()),
            ("client_id", self.app_key.as_str()),
            ("client_secret", self.app_secret.as_str()),
        ];

        let payload = self.post_token_request(&params).await?;
        let access_token = payload.access_token.ok_or(AuthError::MalformedResponse)?;

        let refreshed = TokenState {
            access_token,
            refresh_token: current.refresh_token.clone(),
            expires_in: payload.expires_in.unwrap_or(current.expires_in),
            obtained_at: Utc::now(),
        };
        self.install(refreshed);
        info!("access token refreshed");
        Ok(())
    }

    /// Interactive authorization-code flow requesting offline access.
    ///
    /// Opens the system browser at the authorize URL and waits up to five
    /// minutes for the loopback callback to deliver a `code` or `error`
    /// parameter. The listener socket is released on every exit path.
    pub async fn authorize_new_user(&mut self) -> Result<(), AuthError> {
        let listener = bind_callback_listener(CALLBACK_PORT).await?;
        let url = self.authorize_url();

        info!(url = %url, "opening browser for authorization");
        if let Err(err) = webbrowser::open(&url) {
            warn!(error = %err, "could not open a browser; visit the URL manually");
        }

        self.complete_authorization(listener, AUTH_FLOW_TIMEOUT).await
    }

    /// Remove the stored tokens from memory and from the config document.
    pub fn revoke(&mut self) -> SyncResult<()> {
        self.store.clear_tokens()?;
        self.state = None;
        info!("authorization revoked");
        Ok(())
    }

    async fn complete_authorization(
        &mut self,
        listener: TcpListener,
        timeout: Duration,
    ) -> Result<(), AuthError> {
        let code = wait_for_callback(listener, timeout).await?;
        self.exchange_code(&code).await
    }

    async fn exchange_code(&mut self, code: &str) -> Result<(), AuthError> {
        let params = [
            ("code", code),
            ("grant_type", "authorization_code"),
            ("client_id", self.app_key.as_str()),
            ("client_secret", self.app_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let payload = self.post_token_request(&params).await?;
        let access_token = payload.access_token.ok_or(AuthError::MalformedResponse)?;
        // Offline access was requested; a missing refresh token means the
        // grant cannot survive expiry and is treated as malformed.
        let refresh_token = payload.refresh_token.ok_or(AuthError::MalformedResponse)?;

        let state = TokenState {
            access_token,
            refresh_token,
            expires_in: payload.expires_in.unwrap_or(0),
            obtained_at: Utc::now(),
        };
        self.install(state);
        info!("authorization successful, tokens saved");
        Ok(())
    }

    async fn post_token_request(
        &self,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthError> {
        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|_| AuthError::MalformedResponse)
    }

    fn install(&mut self, state: TokenState) {
        if let Err(err) = self.store.save_tokens(&state) {
            // In-memory state stays current; the next successful exchange
            // will retry persistence.
            warn!(error = %err, "failed to persist tokens");
        }
        self.state = Some(state);
    }

    fn authorize_url(&self) -> String {
        format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&token_access_type=offline",
            self.endpoints.authorize_url,
            urlencoding::encode(self.app_key.trim()),
            urlencoding::encode(&self.redirect_uri),
        )
    }
}

/// Bearer credential for remote calls, resolved once at startup.
#[derive(Debug)]
pub enum Credential {
    OAuth(Box<TokenManager>),
    Static(String),
}

impl Credential {
    /// Current bearer token. The OAuth variant silently refreshes behind
    /// the safety buffer.
    pub async fn bearer(&mut self) -> Result<String, AuthError> {
        match self {
            Credential::OAuth(manager) => manager
                .valid_access_token()
                .await
                .ok_or(AuthError::NotAuthorized),
            Credential::Static(token) => Ok(token.clone()),
        }
    }

    /// One refresh attempt after the remote store rejected the bearer. A
    /// static token has nothing to refresh.
    pub async fn refresh(&mut self) -> Result<(), AuthError> {
        match self {
            Credential::OAuth(manager) => manager.refresh().await,
            Credential::Static(_) => Err(AuthError::StaticToken),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CallbackOutcome {
    Code(String),
    Error(String),
}

/// Bind the loopback listener, preferring the `localhost` name and falling
/// back to the literal address when that bind fails.
async fn bind_callback_listener(port: u16) -> Result<TcpListener, AuthError> {
    for host in ["localhost", "127.0.0.1"] {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                info!(host, port, "callback listener bound");
                return Ok(listener);
            }
            Err(err) => {
                warn!(host, port, error = %err, "failed to bind callback listener")
            }
        }
    }
    Err(AuthError::ListenerBind { port })
}

/// Race the one-shot listener against the flow timeout. The accept task is
/// aborted on every path, which drops the bound socket.
async fn wait_for_callback(listener: TcpListener, timeout: Duration) -> Result<String, AuthError> {
    let (tx, rx) = oneshot::channel();
    let server = tokio::spawn(serve_single_callback(listener, tx));

    let outcome = tokio::time::timeout(timeout, rx).await;
    server.abort();

    match outcome {
        Err(_) => Err(AuthError::Timeout(timeout.as_secs())),
        Ok(Err(_)) => Err(AuthError::ListenerClosed),
        Ok(Ok(CallbackOutcome::Error(reason))) => Err(AuthError::Denied(reason)),
        Ok(Ok(CallbackOutcome::Code(code))) => Ok(code),
    }
}

/// Accept connections until one carries a `code` or `error` parameter,
/// answer it with a human-readable page, and report the outcome once.
async fn serve_single_callback(listener: TcpListener, tx: oneshot::Sender<CallbackOutcome>) {
    let mut tx = Some(tx);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "callback accept failed");
                return;
            }
        };
        debug!(%peer, "callback connection accepted");

        match handle_callback_connection(stream).await {
            Some(outcome) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(outcome);
                }
                return;
            }
            // Answered with the invalid-request page; keep listening for
            // the real callback.
            None => continue,
        }
    }
}

async fn handle_callback_connection(mut stream: TcpStream) -> Option<CallbackOutcome> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.ok()?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let outcome = parse_callback_request(request.lines().next().unwrap_or(""));

    let (status, page) = match &outcome {
        Some(CallbackOutcome::Code(_)) => ("200 OK", SUCCESS_PAGE),
        Some(CallbackOutcome::Error(_)) => ("400 Bad Request", DENIED_PAGE),
        None => ("400 Bad Request", INVALID_PAGE),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{page}",
        page.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    outcome
}

fn parse_callback_request(request_line: &str) -> Option<CallbackOutcome> {
    let target = request_line.split_whitespace().nth(1)?;
    let url = Url::parse(&format!("http://localhost{target}")).ok()?;

    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => return Some(CallbackOutcome::Code(value.into_owned())),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }
    error.map(CallbackOutcome::Error)
}
