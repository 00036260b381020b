//! Configuration for mailwatch runs
//!
//! OAuth client credentials load from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables (fallback)
//!
//! Subscription settings load from `mailwatch.json` in the config directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::WatchError;
use crate::models::MessageFilter;
use crate::watch::WatchSettings;

/// Credentials filename in the mailwatch config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Subscription settings filename in the mailwatch config directory
pub const SUBSCRIBE_CONFIG_FILE: &str = "mailwatch.json";

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format (installed app)
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials from the first available source
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Credentials embedded at build time through
    /// `GOOGLE_CLIENT_ID` / `GOOGLE_CLIENT_SECRET`
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Desktop ("installed") and "web" client types share the fields we need
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// `~/.config/mailwatch/google-credentials.json`
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// How change notifications reach the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Timer-driven history polling; no watch or subscription needed
    #[default]
    Poll,
    /// Pull from a Pub/Sub subscription
    Pull,
    /// Receive Pub/Sub push requests on a local endpoint
    Push,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poll => write!(f, "poll"),
            Self::Pull => write!(f, "pull"),
            Self::Push => write!(f, "push"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poll" => Ok(Self::Poll),
            "pull" => Ok(Self::Pull),
            "push" => Ok(Self::Push),
            other => Err(WatchError::InvalidConfig(format!("unknown mode '{other}'"))),
        }
    }
}

/// Settings for one subscription run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeConfig {
    pub mode: SyncMode,
    /// `projects/<project>/topics/<topic>` the watch publishes to
    pub topic: Option<String>,
    /// `projects/<project>/subscriptions/<subscription>`; required for pull
    pub subscription: Option<String>,
    /// Listen address for push mode, e.g. `0.0.0.0:8080`
    pub push_bind: Option<String>,
    /// Expected `?token=` on push requests
    pub push_verification_token: Option<String>,
    /// Keys the persisted watch registration
    pub application_name: String,
    /// Labels the watch is restricted to
    pub label_ids: Vec<String>,
    /// Create and renew the watch registration for the run
    pub auto_setup_watch: bool,
    /// Tear down an adopted registration on shutdown
    pub enforce_ownership: bool,
    pub poll_interval_secs: u64,
    /// Stop the run after this many seconds
    pub duration_secs: Option<u64>,
    /// Stop renewing the watch after this time
    pub end_time: Option<DateTime<Utc>>,
    pub max_pull_messages: usize,
    pub filter: MessageFilter,
    pub safety_margin_secs: u64,
    pub renewal_threshold_secs: u64,
    pub retry_backoff_secs: u64,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Poll,
            topic: None,
            subscription: None,
            push_bind: None,
            push_verification_token: None,
            application_name: "mailwatch".to_string(),
            label_ids: Vec::new(),
            auto_setup_watch: false,
            enforce_ownership: false,
            poll_interval_secs: 30,
            duration_secs: None,
            end_time: None,
            max_pull_messages: 10,
            filter: MessageFilter::default(),
            safety_margin_secs: 15 * 60,
            renewal_threshold_secs: 20 * 60,
            retry_backoff_secs: 5 * 60,
        }
    }
}

impl SubscribeConfig {
    /// Load `mailwatch.json` from the config directory, or defaults if absent
    pub fn load() -> Result<Self> {
        if config::config_exists(SUBSCRIBE_CONFIG_FILE) {
            return config::load_json(SUBSCRIBE_CONFIG_FILE);
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    /// Reject settings that could never work
    ///
    /// Runs before any background activity starts.
    pub fn validate(&self) -> Result<(), WatchError> {
        let invalid = |msg: String| Err(WatchError::InvalidConfig(msg));

        if self.application_name.trim().is_empty() {
            return invalid("application_name must not be empty".into());
        }
        if let Some(topic) = &self.topic
            && !is_resource_path(topic, "topics")
        {
            return invalid(format!(
                "topic '{topic}' must look like projects/<project>/topics/<topic>"
            ));
        }
        if let Some(subscription) = &self.subscription
            && !is_resource_path(subscription, "subscriptions")
        {
            return invalid(format!(
                "subscription '{subscription}' must look like projects/<project>/subscriptions/<subscription>"
            ));
        }
        if self.auto_setup_watch && self.topic.is_none() {
            return invalid("auto_setup_watch requires a topic".into());
        }

        match self.mode {
            SyncMode::Poll => {
                if self.poll_interval_secs == 0 {
                    return invalid("poll_interval_secs must be positive".into());
                }
            }
            SyncMode::Pull => {
                if self.subscription.is_none() {
                    return invalid("pull mode requires a subscription".into());
                }
                if self.max_pull_messages == 0 {
                    return invalid("max_pull_messages must be positive".into());
                }
            }
            SyncMode::Push => {
                self.push_addr()?;
            }
        }

        if self.safety_margin_secs >= self.renewal_threshold_secs {
            return invalid(format!(
                "safety_margin_secs ({}) must be less than renewal_threshold_secs ({})",
                self.safety_margin_secs, self.renewal_threshold_secs
            ));
        }
        if self.retry_backoff_secs == 0 {
            return invalid("retry_backoff_secs must be positive".into());
        }
        Ok(())
    }

    /// Parsed push listen address
    pub fn push_addr(&self) -> Result<SocketAddr, WatchError> {
        let bind = self
            .push_bind
            .as_deref()
            .ok_or_else(|| WatchError::InvalidConfig("push mode requires push_bind".into()))?;
        bind.parse().map_err(|e| {
            WatchError::InvalidConfig(format!("push_bind '{bind}' is not a socket address: {e}"))
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Run deadline measured from now
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            application_name: self.application_name.clone(),
            safety_margin: ChronoDuration::seconds(self.safety_margin_secs as i64),
            renewal_threshold: ChronoDuration::seconds(self.renewal_threshold_secs as i64),
            retry_backoff: ChronoDuration::seconds(self.retry_backoff_secs as i64),
            enforce_ownership: self.enforce_ownership,
            ..WatchSettings::default()
        }
    }
}

/// `projects/<p>/<kind>/<name>` with non-empty segments
fn is_resource_path(path: &str, kind: &str) -> bool {
    let parts: Vec<&str> = path.split('/').collect();
    matches!(
        parts.as_slice(),
        ["projects", project, k, name] if *k == kind && !project.is_empty() && !name.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_config() -> SubscribeConfig {
        SubscribeConfig {
            mode: SyncMode::Pull,
            topic: Some("projects/acme/topics/mail".into()),
            subscription: Some("projects/acme/subscriptions/mail-sub".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;

        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "test-client-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "test-secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_invalid_credentials_json() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SubscribeConfig::default();
        assert_eq!(config.mode, SyncMode::Poll);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        config.validate().unwrap();
        pull_config().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_json() {
        let config: SubscribeConfig = serde_json::from_str(
            r#"{
                "mode": "push",
                "push_bind": "127.0.0.1:8085",
                "filter": { "from": "alerts@", "unread_only": true }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, SyncMode::Push);
        assert_eq!(config.application_name, "mailwatch");
        assert!(config.filter.unread_only);
        assert_eq!(config.push_addr().unwrap().port(), 8085);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_malformed_topic() {
        let mut config = pull_config();
        config.topic = Some("mail-topic".into());
        assert!(matches!(config.validate(), Err(WatchError::InvalidConfig(_))));

        config.topic = Some("projects//topics/mail".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pull_requires_subscription() {
        let mut config = pull_config();
        config.subscription = None;
        assert!(config.validate().is_err());

        config.subscription = Some("projects/acme/topics/mail".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_push_requires_bind_address() {
        let mut config = SubscribeConfig {
            mode: SyncMode::Push,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.push_bind = Some("not an address".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_setup_requires_topic() {
        let mut config = pull_config();
        config.auto_setup_watch = true;
        config.validate().unwrap();
        config.topic = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timing_constraints() {
        let mut config = pull_config();
        config.safety_margin_secs = 1200;
        config.renewal_threshold_secs = 1200;
        assert!(config.validate().is_err());

        config.safety_margin_secs = 60;
        let settings = config.watch_settings();
        assert_eq!(settings.safety_margin, ChronoDuration::minutes(1));
        assert_eq!(settings.renewal_threshold, ChronoDuration::minutes(20));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("PULL".parse::<SyncMode>().unwrap(), SyncMode::Pull);
        assert!("stream".parse::<SyncMode>().is_err());
    }
}
