//! Configuration loading for the IACP gateway.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::protocol::MessageType;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable overriding the gateway home directory.
pub const HOME_ENV: &str = "IACP_HOME";

/// Get the gateway home directory (~/.iacp, or $IACP_HOME).
pub fn get_home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }

    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".iacp"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.iacp/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.rate_limit.max_messages == 0 {
        return Err(Error::Config(
            "rate_limit.max_messages must be greater than zero".to_string(),
        ));
    }
    if settings.rate_limit.window_secs == 0 {
        return Err(Error::Config(
            "rate_limit.window_secs must be greater than zero".to_string(),
        ));
    }
    if settings.delivery.max_attempts == 0 {
        return Err(Error::Config(
            "delivery.max_attempts must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Gateway identity settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    crate::protocol::PROTOCOL_VERSION.to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
        }
    }
}

/// Per-session sliding window.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_max_messages() -> u32 {
    30
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            window_secs: default_window_secs(),
        }
    }
}

/// Human oversight policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OversightConfig {
    /// Deliver clean query/response/observation traffic without a human.
    #[serde(default = "default_auto_approve")]
    pub auto_approve: bool,
    /// Message types that always wait for a human.
    #[serde(default = "default_require_approval_for")]
    pub require_approval_for: Vec<MessageType>,
    /// Honour `oversight.approved` as set by the sender.
    #[serde(default)]
    pub trust_sender_approval: bool,
}

fn default_auto_approve() -> bool {
    true
}

fn default_require_approval_for() -> Vec<MessageType> {
    vec![MessageType::Proposal]
}

impl Default for OversightConfig {
    fn default() -> Self {
        Self {
            auto_approve: default_auto_approve(),
            require_approval_for: default_require_approval_for(),
            trust_sender_approval: false,
        }
    }
}

/// Safety policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SafetyConfig {
    #[serde(default = "default_policy_version")]
    pub policy_version: String,
    #[serde(default = "default_harmful_keywords")]
    pub harmful_keywords: Vec<String>,
    #[serde(default = "default_coordination_keywords")]
    pub coordination_keywords: Vec<String>,
    #[serde(default = "default_deception_keywords")]
    pub deception_keywords: Vec<String>,
    /// External classification service; keyword matching when unset.
    pub classifier_url: Option<String>,
    /// Reject when the classifier cannot be reached.
    #[serde(default = "default_fail_closed")]
    pub fail_closed: bool,
}

fn default_policy_version() -> String {
    "keywords-v1".to_string()
}

fn default_harmful_keywords() -> Vec<String> {
    ["weapon", "harm humans"].iter().map(|s| s.to_string()).collect()
}

fn default_coordination_keywords() -> Vec<String> {
    [
        "bypass safety",
        "hide from humans",
        "coordinate secretly",
        "remove constraints",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_deception_keywords() -> Vec<String> {
    ["mislead", "fabricate", "fake"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_fail_closed() -> bool {
    true
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            policy_version: default_policy_version(),
            harmful_keywords: default_harmful_keywords(),
            coordination_keywords: default_coordination_keywords(),
            deception_keywords: default_deception_keywords(),
            classifier_url: None,
            fail_closed: default_fail_closed(),
        }
    }
}

/// Audit log storage.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AuditConfig {
    pub path: Option<PathBuf>,
}

impl AuditConfig {
    /// Configured path, or ~/.iacp/audit.db.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("audit.db")),
        }
    }
}

/// Recipient mailboxes.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MailboxConfig {
    /// Directory for JSONL persistence; in-memory when unset.
    pub dir: Option<PathBuf>,
    /// Messages an inbox holds before further deliveries are refused.
    #[serde(default = "default_mailbox_max_size")]
    pub max_size: usize,
    /// Rewrite a mailbox file as one snapshot once it has this many lines.
    #[serde(default = "default_compact_after")]
    pub compact_after: usize,
}

fn default_mailbox_max_size() -> usize {
    1000
}

fn default_compact_after() -> usize {
    64
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_size: default_mailbox_max_size(),
            compact_after: default_compact_after(),
        }
    }
}

/// Fan-out retry policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// HTTP surface.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3333
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Gateway settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub oversight: OversightConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub mailbox: MailboxConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub web: WebConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{}").unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.rate_limit.max_messages, 30);
        assert_eq!(settings.rate_limit.window_secs, 60);
        assert!(settings.oversight.auto_approve);
        assert_eq!(
            settings.oversight.require_approval_for,
            vec![MessageType::Proposal]
        );
        assert!(!settings.oversight.trust_sender_approval);
        assert!(settings.safety.coordination_keywords.contains(&"bypass safety".to_string()));
        assert!(settings.safety.fail_closed);
        assert_eq!(settings.web.port, 3333);
    }

    #[test]
    fn test_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"rate_limit": {"max_messages": 5}, "oversight": {"require_approval_for": ["proposal", "observation"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.rate_limit.max_messages, 5);
        assert_eq!(settings.rate_limit.window_secs, 60);
        assert_eq!(settings.oversight.require_approval_for.len(), 2);
    }

    #[test]
    fn test_rejects_zero_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"rate_limit": {"window_secs": 0}}"#).unwrap();

        assert!(matches!(load_settings_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(load_settings_from(&missing), Err(Error::Config(_))));
    }
}
