//! Access-token acquisition and refresh against the web-player API.
//!
//! The session-token exchange only succeeds when the request carries a TOTP
//! code computed from the current generation of a rotating shared secret.
//! When the exchange fails, the stored secret is assumed stale: the secret
//! interceptor is asked for a fresh one and the exchange is retried, up to a
//! fixed budget. An `isAnonymous` response means the cookie itself is dead;
//! that is terminal and never retried.
//!
//! All durable state (cookie, tokens, secret) lives in the config store and
//! is flushed after every successful exchange or secret refresh.

use std::io::{self, BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::config::{self, Store};
use crate::interceptor::{InterceptError, Interceptor, SecretCandidate, PLAYER_URL};
use crate::totp;

pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";
pub const CLIENT_VERSION: &str = "1.2.70.61.g856ccd63";

const SESSION_TOKEN_URL: &str = "https://open.spotify.com/api/token";
const SERVER_TIME_URL: &str = "https://open.spotify.com/api/server-time";
const CLIENT_TOKEN_URL: &str = "https://clienttoken.spotify.com/v1/clienttoken";

/// Session-exchange attempts per `get_access_token()` call. The interceptor
/// runs between attempts, never before the first.
const MAX_ATTEMPTS: u32 = 3;

pub type Result<T> = std::result::Result<T, TokenError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TokenError {
    Config(config::ConfigError),
    Io(io::Error),
    Transport(reqwest::Error),
    /// Non-200 response on an exchange.
    Status(u16),
    /// Response body did not match the expected shape.
    Decode(String),
    /// The stored secret could not be turned into a code.
    Secret(totp::TotpError),
    /// Server reports an anonymous session: the cookie is invalid. Terminal.
    AuthRejected,
    /// Retry budget spent; carries the final attempt's error.
    Exhausted { attempts: u32, last: Box<TokenError> },
}

impl TokenError {
    /// Terminal errors must not be retried; everything else is fair game
    /// within the budget.
    fn is_terminal(&self) -> bool {
        matches!(self, TokenError::AuthRejected)
    }
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Config(e) => write!(f, "token config: {e}"),
            TokenError::Io(e) => write!(f, "token io: {e}"),
            TokenError::Transport(e) => write!(f, "token transport: {e}"),
            TokenError::Status(code) => write!(f, "token exchange: HTTP status {code}"),
            TokenError::Decode(msg) => write!(f, "token decode: {msg}"),
            TokenError::Secret(e) => write!(f, "token secret: {e}"),
            TokenError::AuthRejected => {
                write!(f, "invalid sp_dc cookie: server reports an anonymous session")
            }
            TokenError::Exhausted { attempts, last } => {
                write!(f, "token refresh failed after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenError::Config(e) => Some(e),
            TokenError::Io(e) => Some(e),
            TokenError::Transport(e) => Some(e),
            TokenError::Secret(e) => Some(e),
            TokenError::Exhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for TokenError {
    fn from(e: config::ConfigError) -> Self {
        TokenError::Config(e)
    }
}

impl From<io::Error> for TokenError {
    fn from(e: io::Error) -> Self {
        TokenError::Io(e)
    }
}

impl From<reqwest::Error> for TokenError {
    fn from(e: reqwest::Error) -> Self {
        TokenError::Transport(e)
    }
}

impl From<totp::TotpError> for TokenError {
    fn from(e: totp::TotpError) -> Self {
        TokenError::Secret(e)
    }
}

// ---------------------------------------------------------------------------
// Secret source seam
// ---------------------------------------------------------------------------

/// Narrow capability the refresh loop needs from the interceptor: one call,
/// fresh candidates. Keeps the browser machinery out of the state machine
/// and lets tests substitute canned candidates.
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    async fn capture(&self) -> std::result::Result<Vec<SecretCandidate>, InterceptError>;
}

#[async_trait::async_trait]
impl SecretSource for Interceptor {
    async fn capture(&self) -> std::result::Result<Vec<SecretCandidate>, InterceptError> {
        self.intercept(PLAYER_URL).await
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionTokenResponse {
    #[serde(rename = "clientId", default)]
    client_id: String,
    #[serde(rename = "accessToken", default)]
    access_token: String,
    #[serde(rename = "accessTokenExpirationTimestampMs", default)]
    expire_ms: i64,
    #[serde(rename = "isAnonymous", default)]
    is_anonymous: bool,
}

#[derive(Debug, Serialize)]
struct ClientTokenRequest {
    client_data: ClientData,
}

#[derive(Debug, Serialize)]
struct ClientData {
    client_version: String,
    client_id: String,
    js_sdk_data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct ClientTokenResponse {
    #[serde(default)]
    granted_token: GrantedToken,
}

#[derive(Debug, Default, Deserialize)]
struct GrantedToken {
    #[serde(default)]
    token: String,
    #[serde(default)]
    expires_after_seconds: u64,
    #[serde(default)]
    refresh_after_seconds: u64,
    #[serde(default)]
    domains: Vec<GrantedDomain>,
}

#[derive(Debug, Default, Deserialize)]
struct GrantedDomain {
    #[serde(default)]
    domain: String,
}

#[derive(Debug, Deserialize)]
struct ServerTimeResponse {
    #[serde(rename = "serverTime")]
    server_time: u64,
}

// ---------------------------------------------------------------------------
// Refresh state machine
// ---------------------------------------------------------------------------

/// States of one refresh pass. `Cached` is the fast path in
/// `get_access_token` and never enters this machine; success and terminal
/// failure leave it through `return`.
#[derive(Debug)]
enum RefreshState {
    Requesting { attempt: u32 },
    SecretStale { attempt: u32, error: TokenError },
}

/// Highest-version candidate strictly newer than `current_version`, if any.
fn select_candidate(
    candidates: &[SecretCandidate],
    current_version: u32,
) -> Option<&SecretCandidate> {
    candidates
        .iter()
        .filter(|c| c.version > current_version)
        .max_by_key(|c| c.version)
}

// ---------------------------------------------------------------------------
// Token manager
// ---------------------------------------------------------------------------

pub struct TokenManager {
    http: reqwest::Client,
    store: Store,
    secrets: Box<dyn SecretSource>,

    session_token_url: String,
    server_time_url: String,
    client_token_url: String,

    // In-memory mirror of the persisted credential, kept in sync with the
    // store so header construction doesn't re-read the file.
    sp_dc: String,
    access_token: String,
    client_token: String,
    client_id: String,
    access_token_expire: i64,
}

impl TokenManager {
    pub fn new(store: Store, secrets: Box<dyn SecretSource>) -> Self {
        tracing::debug!("[token] token manager created");
        let mut manager = TokenManager {
            http: reqwest::Client::new(),
            store,
            secrets,
            session_token_url: SESSION_TOKEN_URL.into(),
            server_time_url: SERVER_TIME_URL.into(),
            client_token_url: CLIENT_TOKEN_URL.into(),
            sp_dc: String::new(),
            access_token: String::new(),
            client_token: String::new(),
            client_id: String::new(),
            access_token_expire: -1,
        };
        manager.sync_from_store();
        manager
    }

    /// Point the exchanges at different endpoints. Used by tests; also handy
    /// behind a debugging proxy.
    pub fn with_endpoints(
        mut self,
        session_token_url: impl Into<String>,
        server_time_url: impl Into<String>,
        client_token_url: impl Into<String>,
    ) -> Self {
        self.session_token_url = session_token_url.into();
        self.server_time_url = server_time_url.into();
        self.client_token_url = client_token_url.into();
        self
    }

    /// Ensure a login cookie is available, checking persisted state, then any
    /// in-memory value, then an stdin prompt, and persist it.
    pub fn query_cookie(&mut self) -> Result<()> {
        let in_memory = std::mem::take(&mut self.sp_dc);
        if let Err(e) = self.store.reload() {
            tracing::warn!("[token] failed to read config: {e}");
        }
        self.sync_from_store();

        if !self.sp_dc.is_empty() {
            tracing::debug!("[token] sp_dc cookie found in config");
            return Ok(());
        }

        if in_memory.is_empty() {
            tracing::warn!("[token] sp_dc cookie not found, prompting for input");
            print!("sp_dc: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            self.sp_dc = line.trim().to_string();
        } else {
            self.sp_dc = in_memory;
        }

        let value = self.sp_dc.clone();
        self.store.update(|c| c.sp_dc = value)?;
        tracing::debug!("[token] sp_dc cookie saved to config");
        Ok(())
    }

    /// Return a valid `(access_token, expiry_ms)` pair, from cache when the
    /// stored credential is unexpired, otherwise via the refresh protocol.
    ///
    /// Errors are informational for the caller: this never exits the
    /// process, and a failed refresh leaves the stored (expired) credential
    /// untouched.
    pub async fn get_access_token(&mut self) -> Result<(String, i64)> {
        if let Err(e) = self.store.reload() {
            tracing::warn!("[token] config reload failed ({e}), using in-memory state");
        }
        self.sync_from_store();

        let now = now_ms();
        tracing::debug!(
            "[token] now: {now} ms, token expiry: {} ms",
            self.access_token_expire
        );
        if !self.access_token.is_empty() && now < self.access_token_expire {
            tracing::debug!("[token] using cached access token");
            return Ok((self.access_token.clone(), self.access_token_expire));
        }

        tracing::warn!("[token] access token missing or expired, requesting a new one");
        self.refresh().await
    }

    // -- Refresh protocol ---------------------------------------------------

    async fn refresh(&mut self) -> Result<(String, i64)> {
        let mut state = RefreshState::Requesting { attempt: 1 };
        loop {
            state = match state {
                RefreshState::Requesting { attempt } => {
                    tracing::debug!("[token] session exchange attempt {attempt}/{MAX_ATTEMPTS}");
                    match self.request_access_token().await {
                        Ok(credential) => {
                            tracing::debug!("[token] new access token obtained");
                            return Ok(credential);
                        }
                        Err(e) if e.is_terminal() => return Err(e),
                        Err(e) if attempt < MAX_ATTEMPTS => {
                            RefreshState::SecretStale { attempt, error: e }
                        }
                        Err(e) => {
                            tracing::error!(
                                "[token] giving up after {MAX_ATTEMPTS} attempts: {e}"
                            );
                            return Err(TokenError::Exhausted {
                                attempts: MAX_ATTEMPTS,
                                last: Box::new(e),
                            });
                        }
                    }
                }
                RefreshState::SecretStale { attempt, error } => {
                    tracing::warn!(
                        "[token] session exchange failed ({error}), refreshing TOTP secret \
                         (attempt {attempt}/{MAX_ATTEMPTS})"
                    );
                    self.refresh_secret().await;
                    RefreshState::Requesting { attempt: attempt + 1 }
                }
            };
        }
    }

    /// Ask the secret source for fresh candidates and persist the best one.
    /// Failures are logged and swallowed: the next attempt simply reuses the
    /// old secret. The stored version is never decreased.
    async fn refresh_secret(&mut self) {
        match self.secrets.capture().await {
            Ok(candidates) => {
                let current = self.store.get().totp.version;
                match select_candidate(&candidates, current) {
                    Some(best) => {
                        let secret_value = best.secret.clone();
                        let version = best.version;
                        match self.store.update(|c| {
                            c.totp.secret = secret_value;
                            c.totp.version = version;
                        }) {
                            Ok(()) => {
                                tracing::info!("[token] TOTP secret refreshed to version {version}")
                            }
                            Err(e) => {
                                tracing::error!("[token] failed to persist refreshed secret: {e}")
                            }
                        }
                    }
                    None => tracing::debug!(
                        "[token] no candidate newer than stored version {current}"
                    ),
                }
            }
            Err(e) => tracing::warn!("[token] secret interception failed: {e}"),
        }
    }

    // -- Exchanges ----------------------------------------------------------

    async fn request_access_token(&mut self) -> Result<(String, i64)> {
        let totp_state = self.store.get().totp.clone();

        let server_time = self.server_time_seconds().await;
        let totp_server = totp::generate(&totp_state.secret, server_time)?;
        let totp_now = totp::generate(&totp_state.secret, unix_now_seconds())?;
        let totp_version = totp_state.version.to_string();

        tracing::debug!("[token] GET {}", self.session_token_url);
        let response = self
            .apply_headers(self.http.get(&self.session_token_url))
            .query(&[
                ("reason", "transport"),
                ("productType", "web-player"),
                ("totp", totp_now.as_str()),
                ("totpServer", totp_server.as_str()),
                ("totpVer", totp_version.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("[token] session exchange status: {status}");
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!("[token] session exchange body: {body}");
            return Err(TokenError::Status(status.as_u16()));
        }

        let data: SessionTokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Decode(e.to_string()))?;

        if data.is_anonymous {
            tracing::warn!(
                "[token] server reports an anonymous session, clearing cookie and credential"
            );
            self.invalidate_identity();
            return Err(TokenError::AuthRejected);
        }

        let client_token = self.request_client_token(&data.client_id).await?;
        tracing::debug!("[token] new client token obtained");

        // Token, expiry, and client pair are replaced together.
        self.access_token = data.access_token.clone();
        self.access_token_expire = data.expire_ms;
        self.client_id = data.client_id.clone();
        self.client_token = client_token.clone();

        let expire_ms = data.expire_ms;
        if let Err(e) = self.store.update(move |c| {
            c.access_token = data.access_token;
            c.access_token_expire = expire_ms;
            c.client_id = data.client_id;
            c.client_token = client_token;
        }) {
            tracing::error!("[token] failed to persist credential: {e}");
        }

        Ok((self.access_token.clone(), self.access_token_expire))
    }

    async fn request_client_token(&self, client_id: &str) -> Result<String> {
        let body = ClientTokenRequest {
            client_data: ClientData {
                client_version: CLIENT_VERSION.into(),
                client_id: client_id.into(),
                js_sdk_data: serde_json::json!({}),
            },
        };

        tracing::debug!("[token] POST {}", self.client_token_url);
        let response = self
            .apply_headers(self.http.post(&self.client_token_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("[token] client-token exchange status: {status}");
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!("[token] client-token exchange body: {body}");
            return Err(TokenError::Status(status.as_u16()));
        }

        let data: ClientTokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Decode(e.to_string()))?;

        if data.granted_token.token.is_empty() {
            return Err(TokenError::Decode("missing granted token".into()));
        }
        tracing::debug!(
            "[token] client token valid for {}s (refresh after {}s, {} domain(s))",
            data.granted_token.expires_after_seconds,
            data.granted_token.refresh_after_seconds,
            data.granted_token.domains.len()
        );
        Ok(data.granted_token.token)
    }

    /// Server clock for the `totpServer` parameter. Falls back to the local
    /// clock; the probe is best-effort.
    async fn server_time_seconds(&self) -> u64 {
        match self.fetch_server_time().await {
            Ok(seconds) => seconds,
            Err(e) => {
                tracing::debug!("[token] server time probe failed ({e}), using local clock");
                unix_now_seconds()
            }
        }
    }

    async fn fetch_server_time(&self) -> Result<u64> {
        let response = self
            .http
            .get(&self.server_time_url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json")
            .header("Origin", "https://open.spotify.com/")
            .header("Referer", "https://open.spotify.com/")
            .header("app-platform", "WebPlayer")
            .header("spotify-app-version", CLIENT_VERSION)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(TokenError::Status(response.status().as_u16()));
        }
        let data: ServerTimeResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Decode(e.to_string()))?;
        Ok(data.server_time)
    }

    // -- Helpers ------------------------------------------------------------

    fn apply_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("Origin", "https://open.spotify.com/")
            .header("app-platform", "WebPlayer")
            .header("sec-ch-ua-platform", "macOS")
            .header("spotify-app-version", CLIENT_VERSION);
        if self.client_token_usable(now_ms()) {
            builder = builder.header("client-token", &self.client_token);
        }
        if !self.sp_dc.is_empty() {
            builder = builder.header("Cookie", format!("sp_dc={}", self.sp_dc));
        }
        builder
    }

    /// The client token came from the same exchange as the access token, so
    /// once the access token is expired the client token is not trusted
    /// either.
    fn client_token_usable(&self, now_ms: i64) -> bool {
        !self.client_token.is_empty() && now_ms < self.access_token_expire
    }

    /// Anonymous response: cookie and credential are dead. Preferences and
    /// the TOTP secret survive.
    fn invalidate_identity(&mut self) {
        self.sp_dc.clear();
        self.access_token.clear();
        self.client_token.clear();
        self.client_id.clear();
        self.access_token_expire = 0;

        if let Err(e) = self.store.update(|c| {
            c.sp_dc.clear();
            c.access_token.clear();
            c.client_id.clear();
            c.client_token.clear();
            c.access_token_expire = 0;
        }) {
            tracing::error!("[token] failed to persist cleared identity: {e}");
        }
    }

    fn sync_from_store(&mut self) {
        let config = self.store.get();
        self.sp_dc = config.sp_dc.clone();
        self.access_token = config.access_token.clone();
        self.client_token = config.client_token.clone();
        self.client_id = config.client_id.clone();
        self.access_token_expire = config.access_token_expire;
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn unix_now_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
