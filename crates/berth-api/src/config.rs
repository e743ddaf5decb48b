//! Server configuration.

use serde::{Deserialize, Serialize};

use berth_core::{Error, Result};
use berth_provision::reconciler::ReconcilerConfig;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_PANEL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STUCK_AFTER_SECS: u64 = 600;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Remote panel connection settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PanelConfig {
    /// Panel application API base URL, e.g. `https://panel.example.com`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Application API key (bearer).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_panel_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_panel_timeout_secs() -> u64 {
    DEFAULT_PANEL_TIMEOUT_SECS
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: DEFAULT_PANEL_TIMEOUT_SECS,
        }
    }
}

impl std::fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Billing webhook verification settings.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Shared HMAC-SHA256 secret for webhook signatures.
    ///
    /// When unset, signature verification is skipped with a warning; only
    /// acceptable for local development.
    #[serde(default)]
    pub signing_secret: Option<String>,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Admin route authentication settings.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminConfig {
    /// Static bearer token required on `/admin` and power routes.
    ///
    /// When unset, admin routes are only reachable in debug mode.
    #[serde(default)]
    pub token: Option<String>,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Built-in reconciler ticker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Run the reconcile loop inside this process.
    ///
    /// Disable when a standalone `berth_reconciler` deployment owns the
    /// sweeps; running both would double every probe.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Age after which a `PAID` or `PROVISIONING` order counts as stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
    /// Interval between reconcile ticks.
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_stuck_after_secs() -> u64 {
    DEFAULT_STUCK_AFTER_SECS
}

fn default_reconcile_interval_secs() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stuck_after_secs: DEFAULT_STUCK_AFTER_SECS,
            interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
        }
    }
}

impl ReconcileConfig {
    /// Translates into the provisioning crate's reconciler config.
    #[must_use]
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            stuck_after: std::time::Duration::from_secs(self.stuck_after_secs),
            interval: std::time::Duration::from_secs(self.interval_secs),
        }
    }
}

/// Configuration for the Berth API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Enable debug mode.
    ///
    /// When enabled:
    /// - a missing webhook secret or admin token is tolerated
    /// - a missing panel URL falls back to the in-memory fake panel
    ///
    /// When disabled, `validate` requires all three.
    pub debug: bool,

    /// Optional path to a JSON plan catalog; builtin seed when unset.
    #[serde(default)]
    pub plans_path: Option<String>,

    /// Remote panel connection.
    #[serde(default)]
    pub panel: PanelConfig,

    /// Billing webhook verification.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Admin route authentication.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Built-in reconciler ticker.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            debug: false,
            plans_path: None,
            panel: PanelConfig::default(),
            webhook: WebhookConfig::default(),
            admin: AdminConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, starting from
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot
    /// be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("PORT")? {
            config.port = port;
        }
        if let Some(port) = env_u16("BERTH_API_PORT")? {
            config.port = port;
        }
        if let Some(debug) = env_bool("BERTH_DEBUG")? {
            config.debug = debug;
        }
        config.plans_path = env_string("BERTH_PLANS_PATH");

        config.panel.base_url = env_string("BERTH_PANEL_URL");
        config.panel.api_key = env_string("BERTH_PANEL_API_KEY");
        if let Some(timeout) = env_u64("BERTH_PANEL_TIMEOUT_SECS")? {
            if timeout == 0 {
                return Err(Error::InvalidInput(
                    "BERTH_PANEL_TIMEOUT_SECS must be positive".to_string(),
                ));
            }
            config.panel.timeout_secs = timeout;
        }

        config.webhook.signing_secret = env_string("BERTH_WEBHOOK_SECRET");
        config.admin.token = env_string("BERTH_ADMIN_TOKEN");

        if let Some(enabled) = env_bool("BERTH_RECONCILE_LOOP")? {
            config.reconcile.enabled = enabled;
        }
        if let Some(secs) = env_u64("BERTH_STUCK_AFTER_SECS")? {
            if secs == 0 {
                return Err(Error::InvalidInput(
                    "BERTH_STUCK_AFTER_SECS must be positive".to_string(),
                ));
            }
            config.reconcile.stuck_after_secs = secs;
        }
        if let Some(secs) = env_u64("BERTH_RECONCILE_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(Error::InvalidInput(
                    "BERTH_RECONCILE_INTERVAL_SECS must be positive".to_string(),
                ));
            }
            config.reconcile.interval_secs = secs;
        }

        Ok(config)
    }

    /// Checks that the configuration is complete enough to serve.
    ///
    /// # Errors
    ///
    /// Returns an error when a production (non-debug) configuration is
    /// missing the panel connection, webhook secret, or admin token.
    pub fn validate(&self) -> Result<()> {
        if self.debug {
            return Ok(());
        }

        if self
            .panel
            .base_url
            .as_deref()
            .is_none_or(|url| url.trim().is_empty())
        {
            return Err(Error::InvalidInput(
                "BERTH_PANEL_URL is required when debug=false".to_string(),
            ));
        }
        if self
            .panel
            .api_key
            .as_deref()
            .is_none_or(|key| key.trim().is_empty())
        {
            return Err(Error::InvalidInput(
                "BERTH_PANEL_API_KEY is required when debug=false".to_string(),
            ));
        }
        if self
            .webhook
            .signing_secret
            .as_deref()
            .is_none_or(|secret| secret.trim().is_empty())
        {
            return Err(Error::InvalidInput(
                "BERTH_WEBHOOK_SECRET is required when debug=false".to_string(),
            ));
        }
        if self
            .admin
            .token
            .as_deref()
            .is_none_or(|token| token.trim().is_empty())
        {
            return Err(Error::InvalidInput(
                "BERTH_ADMIN_TOKEN is required when debug=false".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_the_reconcile_loop() {
        let config = Config::default();
        assert!(config.reconcile.enabled);
        assert_eq!(config.reconcile.stuck_after_secs, 600);
        assert_eq!(config.reconcile.interval_secs, 60);
        assert_eq!(config.port, 8080);
        assert!(!config.debug);
    }

    #[test]
    fn reconciler_config_translates_seconds() {
        let reconcile = ReconcileConfig {
            enabled: true,
            stuck_after_secs: 120,
            interval_secs: 15,
        };
        let translated = reconcile.reconciler_config();
        assert_eq!(translated.stuck_after, std::time::Duration::from_secs(120));
        assert_eq!(translated.interval, std::time::Duration::from_secs(15));
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let config = Config {
            panel: PanelConfig {
                base_url: Some("https://panel.example.com".to_string()),
                api_key: Some("ptla_supersecret".to_string()),
                timeout_secs: 10,
            },
            webhook: WebhookConfig {
                signing_secret: Some("whsec_supersecret".to_string()),
            },
            admin: AdminConfig {
                token: Some("admin_supersecret".to_string()),
            },
            ..Config::default()
        };

        let rendered = format!("{config:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("supersecret"));
        assert!(rendered.contains("https://panel.example.com"));
    }

    #[test]
    fn validate_requires_secrets_outside_debug() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.debug = true;
        assert!(config.validate().is_ok());

        config.debug = false;
        config.panel.base_url = Some("https://panel.example.com".to_string());
        config.panel.api_key = Some("key".to_string());
        config.webhook.signing_secret = Some("secret".to_string());
        config.admin.token = Some("token".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["true", "1", "yes", "y", "TRUE"] {
            assert!(parse_bool("TEST", value).unwrap());
        }
        for value in ["false", "0", "no", "n", "False"] {
            assert!(!parse_bool("TEST", value).unwrap());
        }
        assert!(parse_bool("TEST", "maybe").is_err());
    }
}
