//! OAuth2 access tokens for the Gmail and Pub/Sub APIs
//!
//! [`GmailAuth`] keeps a token file in the config directory, refreshes it with
//! the stored refresh token, and falls back to the installed-app
//! authorization-code flow over a loopback redirect when nothing usable is
//! stored. Uses synchronous HTTP (ureq) to stay executor-agnostic.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::PathBuf;

use crate::error::WatchError;

/// Supplies bearer tokens for API calls
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Result<String>;
}

/// A fixed, pre-issued token
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Token state persisted between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    refresh_token: Option<String>,
    /// Unix timestamp (seconds)
    expires_at: Option<i64>,
}

impl StoredToken {
    /// Valid for at least another five minutes
    fn is_fresh(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at > Utc::now().timestamp() + 300)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// OAuth2 token provider for an installed application
pub struct GmailAuth {
    client_id: String,
    client_secret: String,
    token_path: PathBuf,
    interactive: bool,
    cached: Mutex<Option<StoredToken>>,
}

impl GmailAuth {
    const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    /// Read-only mailbox access plus Pub/Sub pull/acknowledge
    const SCOPES: &'static str =
        "https://www.googleapis.com/auth/gmail.readonly https://www.googleapis.com/auth/pubsub";

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 8080..=8090;

    /// Create a provider storing tokens at `~/.config/mailwatch/tokens.json`
    pub fn new(client_id: String, client_secret: String) -> Result<Self> {
        let token_path =
            config::config_path("tokens.json").context("Could not determine config directory")?;
        Ok(Self::with_token_path(client_id, client_secret, token_path))
    }

    pub fn with_token_path(client_id: String, client_secret: String, token_path: PathBuf) -> Self {
        Self {
            client_id,
            client_secret,
            token_path,
            interactive: true,
            cached: Mutex::new(None),
        }
    }

    /// Fail instead of opening a browser when no usable token is stored
    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    /// Forget stored tokens
    pub fn logout(&self) -> Result<()> {
        *self.cached.lock() = None;
        if self.token_path.exists() {
            std::fs::remove_file(&self.token_path)
                .with_context(|| format!("Failed to remove {}", self.token_path.display()))?;
        }
        Ok(())
    }

    fn obtain_token(&self) -> Result<StoredToken> {
        let stored: Option<StoredToken> = config::load_json_file(&self.token_path).ok();

        if let Some(token) = &stored {
            if token.is_fresh() {
                return Ok(token.clone());
            }
            if let Some(refresh_token) = &token.refresh_token {
                match self.refresh(refresh_token) {
                    Ok(refreshed) => return self.store(refreshed, Some(refresh_token)),
                    Err(e) => warn!("Token refresh failed, re-authorizing: {:#}", e),
                }
            }
        }

        if !self.interactive {
            return Err(anyhow::Error::new(WatchError::Unauthorized {
                service: "oauth",
                status: 401,
            })
            .context("No valid stored token and interactive authorization is disabled"));
        }

        let response = self.authorize()?;
        self.store(response, None)
    }

    fn store(&self, response: TokenResponse, previous_refresh: Option<&str>) -> Result<StoredToken> {
        let token = StoredToken {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at: response.expires_in.map(|s| Utc::now().timestamp() + s),
        };
        config::save_json_file(&self.token_path, &token)?;
        Ok(token)
    }

    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut response = ureq::post(Self::TOKEN_URL)
            .send_form([
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .context("Failed to refresh access token")?;

        response
            .body_mut()
            .read_json()
            .context("Failed to parse refresh token response")
    }

    /// Authorization-code flow with a loopback redirect
    fn authorize(&self) -> Result<TokenResponse> {
        let (listener, port) = Self::bind_loopback()?;
        let redirect_uri = format!("http://localhost:{port}");

        let auth_url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
            Self::AUTH_URL,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&redirect_uri),
            urlencoding::encode(Self::SCOPES),
        );

        info!("Authorization required, opening browser");
        info!("If the browser doesn't open, visit: {}", auth_url);
        if let Err(e) = open::that(&auth_url) {
            warn!("Failed to open browser: {}", e);
        }

        let code = Self::await_code(listener, port)?;

        let mut response = ureq::post(Self::TOKEN_URL)
            .send_form([
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .context("Failed to exchange authorization code")?;

        let token = response
            .body_mut()
            .read_json()
            .context("Failed to parse token response")?;
        info!("Authorization complete");
        Ok(token)
    }

    fn bind_loopback() -> Result<(TcpListener, u16)> {
        Self::PORT_RANGE
            .clone()
            .find_map(|port| {
                TcpListener::bind(("127.0.0.1", port))
                    .ok()
                    .map(|l| (l, port))
            })
            .with_context(|| {
                format!(
                    "Could not bind to any port in range {}-{}",
                    Self::PORT_RANGE.start(),
                    Self::PORT_RANGE.end()
                )
            })
    }

    /// Wait for the redirect and pull `code` (or `error`) from its query
    fn await_code(listener: TcpListener, port: u16) -> Result<String> {
        let (mut stream, _) = listener.accept().context("Failed to accept connection")?;

        let mut request_line = String::new();
        BufReader::new(&stream)
            .read_line(&mut request_line)
            .context("Failed to read request")?;

        // GET /?code=...&scope=... HTTP/1.1
        let target = request_line.split_whitespace().nth(1).unwrap_or("/");
        let callback = url::Url::parse(&format!("http://localhost:{port}{target}"))
            .context("Malformed OAuth callback")?;
        let param = |name: &str| {
            callback
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let code = param("code");

        let (status, body) = if code.is_some() {
            ("200 OK", "Authorization complete. You can close this window.")
        } else {
            ("400 Bad Request", "Authorization failed. Please try again.")
        };
        let reply = format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body><h1>{body}</h1></body></html>"
        );
        stream.write_all(reply.as_bytes()).ok();

        if let Some(err) = param("error") {
            bail!("OAuth error: {}", err);
        }
        code.context("No authorization code received")
    }
}

impl TokenProvider for GmailAuth {
    fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock();
        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }

        let token = self.obtain_token()?;
        let access = token.access_token.clone();
        *cached = Some(token);
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_fatal;

    #[test]
    fn test_fresh_stored_token_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let stored = StoredToken {
            access_token: "ya29.cached".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now().timestamp() + 3600),
        };
        config::save_json_file(&path, &stored).unwrap();

        let auth = GmailAuth::with_token_path("id".into(), "secret".into(), path).non_interactive();
        assert_eq!(auth.access_token().unwrap(), "ya29.cached");
    }

    #[test]
    fn test_missing_token_non_interactive_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let auth = GmailAuth::with_token_path(
            "id".into(),
            "secret".into(),
            dir.path().join("tokens.json"),
        )
        .non_interactive();

        let err = auth.access_token().unwrap_err();
        assert!(is_fatal(&err));
    }

    #[test]
    fn test_static_token() {
        assert_eq!(StaticToken("abc".into()).access_token().unwrap(), "abc");
    }
}
