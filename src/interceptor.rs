//! Recovers the rotating TOTP secret from the web player itself.
//!
//! The secret never travels over the network in a scrapeable form; it only
//! exists inside the player's obfuscated bundles. So we start a disposable
//! headless Chrome session, hook `Array.prototype.map` before any page script
//! runs, and wait for the player's own code to compute its secret table. The
//! first map result shaped like `[{secret, version}, ...]` is captured,
//! published on a well-known status object, and the hook uninstalls itself.
//!
//! The browser session is scoped to one `intercept()` call: whatever happens
//! (success, timeout, shutdown, CDP error), the process and its listeners are
//! torn down before the call returns.

use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
    RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::secret;

/// Page whose bundles carry the secret.
pub const PLAYER_URL: &str = "https://open.spotify.com/";

/// Content-hashed player bundles that are allowed to load when script
/// filtering is on. Everything else (telemetry, ads, unrelated chunks) only
/// slows the page down.
const ALLOWED_BUNDLES: &str =
    r"(?:vendor~web-player|encore~web-player|web-player)\.[0-9a-f]{4,}\.(?:js|mjs)";

const SCRIPT_URL: &str = r"\.m?js(\?.*)?$";

pub type Result<T> = std::result::Result<T, InterceptError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum InterceptError {
    /// Browser launch or CDP command failure.
    Browser(String),
    /// Navigation to the target page failed.
    Navigation(String),
    /// The in-page hook reported a terminal failure.
    Instrumentation(String),
    /// The status object never became ready within the overall timeout.
    Timeout,
    /// Shutdown signal received while waiting.
    Cancelled,
}

impl std::fmt::Display for InterceptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterceptError::Browser(msg) => write!(f, "intercept browser: {msg}"),
            InterceptError::Navigation(msg) => write!(f, "intercept navigation: {msg}"),
            InterceptError::Instrumentation(msg) => {
                write!(f, "intercept instrumentation: {msg}")
            }
            InterceptError::Timeout => write!(f, "intercept: timed out"),
            InterceptError::Cancelled => write!(f, "intercept: cancelled"),
        }
    }
}

impl std::error::Error for InterceptError {}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One `{secret, version}` pair scraped from the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretCandidate {
    pub secret: String,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub struct InterceptOptions {
    pub headless: bool,
    /// Overall budget for one session, navigation included.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Re-encode captured secrets into the at-rest form (see `secret.rs`)
    /// before returning them.
    pub encode_secrets: bool,
    /// Reject script requests that are not known player bundles.
    pub filter_scripts: bool,
}

impl Default for InterceptOptions {
    fn default() -> Self {
        InterceptOptions {
            headless: true,
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            encode_secrets: true,
            filter_scripts: true,
        }
    }
}

/// Shape of `window.__secretHookStatus`. All fields default so a half-built
/// object read mid-assignment never kills the poll loop.
#[derive(Debug, Default, Deserialize)]
struct HookStatus {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<SecretCandidate>,
    #[serde(default)]
    message: String,
    #[serde(default, rename = "callCount")]
    call_count: u64,
}

// ---------------------------------------------------------------------------
// Injected instrumentation
// ---------------------------------------------------------------------------
// Registered to evaluate on every new document, so it runs before any of the
// page's own scripts. `ready` stays false until there is a terminal outcome:
// either the secret table was captured (success) or the hook itself broke.

const HOOK_SCRIPT: &str = r#"
(function() {
    'use strict';

    window.__secretHookStatus = {
        ready: false,
        success: false,
        data: [],
        message: 'installing',
        callCount: 0
    };

    try {
        let captured = false;

        function bytesToString(bytes) {
            if (!bytes || typeof bytes !== 'object') return '';
            return Object.values(bytes).map(function(c) {
                return String.fromCharCode(c);
            }).join('');
        }

        var nativeMap = Array.prototype.map;
        Array.prototype.map = function(callback, thisArg) {
            window.__secretHookStatus.callCount++;
            var result = nativeMap.call(this, callback, thisArg);

            if (captured) return result;

            if (Array.isArray(result) && result.length > 0) {
                var first = result[0];
                if (first && typeof first === 'object' &&
                    Object.prototype.hasOwnProperty.call(first, 'secret') &&
                    Object.prototype.hasOwnProperty.call(first, 'version')) {
                    captured = true;
                    try {
                        var data = nativeMap.call(result, function(item) {
                            return {
                                secret: item.secret && item.secret.bytes
                                    ? bytesToString(item.secret.bytes)
                                    : (item.secret || ''),
                                version: item.version
                            };
                        });
                        window.__secretHookStatus = {
                            ready: true,
                            success: true,
                            data: data,
                            message: 'captured',
                            callCount: window.__secretHookStatus.callCount
                        };
                    } catch (err) {
                        window.__secretHookStatus = {
                            ready: true,
                            success: false,
                            data: [],
                            message: 'capture failed: ' + err.message,
                            callCount: window.__secretHookStatus.callCount
                        };
                    }
                    Array.prototype.map = nativeMap;
                }
            }

            return result;
        };

        window.__secretHookStatus.message = 'hook installed';
    } catch (err) {
        window.__secretHookStatus = {
            ready: true,
            success: false,
            data: [],
            message: 'install failed: ' + err.message,
            callCount: 0
        };
    }
})();
"#;

const STATUS_EXPR: &str = "window.__secretHookStatus || { ready: false }";

// ---------------------------------------------------------------------------
// Request filtering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterDecision {
    Allow,
    Reject,
}

/// Scripts must match the player-bundle allow-list; everything else loads
/// untouched.
fn decide_request(url: &str, script_re: &Regex, allowed_re: &Regex) -> FilterDecision {
    if script_re.is_match(url) && !allowed_re.is_match(url) {
        FilterDecision::Reject
    } else {
        FilterDecision::Allow
    }
}

// ---------------------------------------------------------------------------
// Interceptor
// ---------------------------------------------------------------------------

pub struct Interceptor {
    opts: InterceptOptions,
    shutdown: watch::Receiver<bool>,
}

impl Interceptor {
    pub fn new(opts: InterceptOptions, shutdown: watch::Receiver<bool>) -> Self {
        Interceptor { opts, shutdown }
    }

    /// Run one browser session against `target_url` and return the captured
    /// secret candidates, oldest bundle order preserved.
    pub async fn intercept(&self, target_url: &str) -> Result<Vec<SecretCandidate>> {
        let config = self.browser_config()?;

        tracing::debug!("[intercept] launching browser (headless: {})", self.opts.headless);
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| InterceptError::Browser(e.to_string()))?;

        // The handler future must be polled for the whole session or every
        // CDP call deadlocks.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let result = self.drive(&browser, target_url).await;

        // Teardown runs on every path, including errors above in drive().
        let _ = browser.close().await;
        let _ = browser.wait().await;
        handler_task.abort();
        tracing::debug!("[intercept] browser session closed");

        result
    }

    fn browser_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-web-security")
            .arg("--enable-low-end-device-mode")
            .arg("--blink-settings=imagesEnabled=false");
        if !self.opts.headless {
            builder = builder.with_head();
        }
        builder.build().map_err(InterceptError::Browser)
    }

    /// Everything between launch and teardown. Separated out so the caller
    /// can run teardown regardless of which step failed.
    async fn drive(&self, browser: &Browser, target_url: &str) -> Result<Vec<SecretCandidate>> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| InterceptError::Browser(e.to_string()))?;

        let filter_task = if self.opts.filter_scripts {
            Some(install_request_filter(&page).await?)
        } else {
            None
        };

        let outcome = self.navigate_and_poll(&page, target_url).await;

        if let Some(task) = filter_task {
            task.abort();
        }
        outcome
    }

    async fn navigate_and_poll(
        &self,
        page: &Page,
        target_url: &str,
    ) -> Result<Vec<SecretCandidate>> {
        // Register before navigating so the hook beats the page's own code.
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(HOOK_SCRIPT))
            .await
            .map_err(|e| InterceptError::Browser(e.to_string()))?;

        tracing::debug!("[intercept] navigating to {target_url}");
        page.goto(target_url)
            .await
            .map_err(|e| InterceptError::Navigation(e.to_string()))?;

        let mut shutdown = self.shutdown.clone();
        let mut shutdown_alive = true;
        let deadline = time::Instant::now() + self.opts.timeout;
        let mut ticker = time::interval(self.opts.poll_interval);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed(), if shutdown_alive => {
                    match changed {
                        Ok(()) => {
                            if *shutdown.borrow() {
                                return Err(InterceptError::Cancelled);
                            }
                        }
                        // Sender gone; cancellation can no longer fire.
                        Err(_) => shutdown_alive = false,
                    }
                }

                _ = time::sleep_until(deadline) => {
                    return Err(InterceptError::Timeout);
                }

                _ = ticker.tick() => {
                    let status = match poll_status(page).await {
                        Ok(status) => status,
                        Err(e) => {
                            // Transient CDP hiccup; the deadline bounds us.
                            tracing::debug!("[intercept] status poll failed: {e}");
                            continue;
                        }
                    };

                    if !status.ready {
                        continue;
                    }
                    if !status.success {
                        return Err(InterceptError::Instrumentation(status.message));
                    }

                    tracing::debug!(
                        "[intercept] captured {} candidate(s) after {} map calls",
                        status.data.len(),
                        status.call_count
                    );
                    let mut candidates = status.data;
                    if self.opts.encode_secrets {
                        for candidate in &mut candidates {
                            candidate.secret = secret::encode(candidate.secret.as_bytes());
                        }
                    }
                    return Ok(candidates);
                }
            }
        }
    }
}

async fn poll_status(page: &Page) -> std::result::Result<HookStatus, String> {
    let evaluation = page
        .evaluate(STATUS_EXPR)
        .await
        .map_err(|e| e.to_string())?;
    evaluation
        .into_value::<HookStatus>()
        .map_err(|e| e.to_string())
}

/// Pause every request at the Request stage and answer each one explicitly.
/// A paused request that never gets a decision stalls navigation, so the
/// fallthrough is always `ContinueRequest`.
async fn install_request_filter(page: &Page) -> Result<JoinHandle<()>> {
    let pattern = RequestPattern::builder()
        .url_pattern("*")
        .request_stage(RequestStage::Request)
        .build();
    page.execute(EnableParams::builder().patterns(vec![pattern]).build())
        .await
        .map_err(|e| InterceptError::Browser(e.to_string()))?;

    let mut paused_events = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| InterceptError::Browser(e.to_string()))?;

    let script_re = Regex::new(SCRIPT_URL).map_err(|e| InterceptError::Browser(e.to_string()))?;
    let allowed_re =
        Regex::new(ALLOWED_BUNDLES).map_err(|e| InterceptError::Browser(e.to_string()))?;

    let page = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = paused_events.next().await {
            let request_id = event.request_id.clone();
            let url = event.request.url.as_str();

            let result = match decide_request(url, &script_re, &allowed_re) {
                FilterDecision::Allow => page
                    .execute(ContinueRequestParams::new(request_id))
                    .await
                    .map(|_| ()),
                FilterDecision::Reject => {
                    tracing::debug!("[intercept] blocking script {url}");
                    page.execute(FailRequestParams::new(
                        request_id,
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
                }
            };
            if let Err(e) = result {
                tracing::debug!("[intercept] request decision failed: {e}");
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn decide(url: &str) -> FilterDecision {
        let script_re = Regex::new(SCRIPT_URL).unwrap();
        let allowed_re = Regex::new(ALLOWED_BUNDLES).unwrap();
        decide_request(url, &script_re, &allowed_re)
    }

    #[test]
    fn test_player_bundles_allowed() {
        for url in [
            "https://open.spotifycdn.com/cdn/build/web-player/web-player.11daf1e4.js",
            "https://open.spotifycdn.com/cdn/build/web-player/vendor~web-player.a1b2c3d4.mjs",
            "https://open.spotifycdn.com/cdn/build/web-player/encore~web-player.deadbeef.js",
        ] {
            assert_eq!(decide(url), FilterDecision::Allow, "{url}");
        }
    }

    #[test]
    fn test_other_scripts_rejected() {
        for url in [
            "https://www.google-analytics.com/analytics.js",
            "https://open.spotifycdn.com/cdn/build/web-player/telemetry.11daf1e4.js",
            "https://example.com/some/bundle.mjs?v=2",
        ] {
            assert_eq!(decide(url), FilterDecision::Reject, "{url}");
        }
    }

    #[test]
    fn test_non_scripts_always_allowed() {
        for url in [
            "https://open.spotify.com/",
            "https://open.spotifycdn.com/fonts/circular.woff2",
            "https://api.spotify.com/v1/me",
            "https://example.com/style.css",
        ] {
            assert_eq!(decide(url), FilterDecision::Allow, "{url}");
        }
    }

    #[test]
    fn test_status_deserialization() {
        let json = r#"{
            "ready": true,
            "success": true,
            "data": [{"secret": "abc", "version": 19}],
            "message": "captured",
            "callCount": 421
        }"#;
        let status: HookStatus = serde_json::from_str(json).unwrap();
        assert!(status.ready && status.success);
        assert_eq!(status.call_count, 421);
        assert_eq!(
            status.data,
            vec![SecretCandidate {
                secret: "abc".into(),
                version: 19
            }]
        );
    }

    #[test]
    fn test_status_defaults_on_empty_object() {
        let status: HookStatus = serde_json::from_str("{}").unwrap();
        assert!(!status.ready);
        assert!(!status.success);
        assert!(status.data.is_empty());
    }

    #[test]
    fn test_hook_script_shape() {
        // The contract pieces the poll loop depends on.
        assert!(HOOK_SCRIPT.contains("window.__secretHookStatus"));
        assert!(HOOK_SCRIPT.contains("Array.prototype.map"));
        assert!(HOOK_SCRIPT.contains("ready: false"));
        assert!(STATUS_EXPR.contains("__secretHookStatus"));
    }

    #[test]
    fn test_default_options() {
        let opts = InterceptOptions::default();
        assert!(opts.headless);
        assert!(opts.filter_scripts);
        assert!(opts.encode_secrets);
        assert_eq!(opts.timeout, Duration::from_secs(120));
        assert_eq!(opts.poll_interval, Duration::from_millis(500));
    }
}
