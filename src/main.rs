//! sptoken: maintain a Spotify web-player session from an sp_dc cookie.
//!
//! Acquires an access token + client token the same way the web player does:
//! a TOTP-authenticated session exchange, with the rotating TOTP secret
//! recovered from the player's own bundles via a headless browser when the
//! stored generation goes stale. The resulting credential is cached in the
//! config file and printed as JSON for downstream tooling.
//!
//! Flags:
//!   --config <path>   use a specific config file
//!   --intercept       run one secret interception and print the candidates
//!   --headful         show the browser window (debugging)

mod config;
mod interceptor;
mod secret;
mod token;
mod totp;

use std::path::PathBuf;

use tokio::sync::watch;

use crate::config::Store;
use crate::interceptor::{InterceptOptions, Interceptor, PLAYER_URL};
use crate::token::TokenManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let headful = args.iter().any(|a| a == "--headful");
    let intercept_only = args.iter().any(|a| a == "--intercept");
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    // Ctrl-C flips the shutdown signal; the interceptor's poll loop watches
    // it so a half-finished browser session still gets torn down.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[main] shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let path = match config_path {
        Some(path) => path,
        None => Store::default_path()?,
    };
    tracing::debug!("[main] config file: {}", path.display());
    let store = Store::open(&path)?;

    let opts = InterceptOptions {
        headless: !headful,
        ..InterceptOptions::default()
    };
    let interceptor = Interceptor::new(opts, shutdown_rx);

    if intercept_only {
        let candidates = interceptor.intercept(PLAYER_URL).await?;
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }

    let mut manager = TokenManager::new(store, Box::new(interceptor));
    manager.query_cookie()?;

    match manager.get_access_token().await {
        Ok((access_token, expire_ms)) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "accessToken": access_token,
                    "accessTokenExpire": expire_ms,
                }))?
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("[main] could not obtain an access token: {e}");
            std::process::exit(1);
        }
    }
}
