use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Security policy for the relay. Lives at `~/.tabpilot/security.json`;
/// when the file is absent the defaults below are written back so the user
/// has something concrete to edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret the bridge must present when connecting to the gateway.
    /// Empty string disables token checking (loopback-only deployments).
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub domains: DomainsConfig,
    #[serde(default)]
    pub sensitive_actions: SensitiveActionsConfig,
    #[serde(default)]
    pub audit_log: AuditLogConfig,
    #[serde(default)]
    pub emergency_stop: bool,
}

fn default_port() -> u16 {
    9333
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_per_second")]
    pub max_per_second: u32,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
}

fn default_rate_enabled() -> bool {
    true
}

fn default_max_per_second() -> u32 {
    5
}

fn default_max_per_minute() -> u32 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_enabled(),
            max_per_second: default_max_per_second(),
            max_per_minute: default_max_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainsConfig {
    /// Empty allowlist means every domain passes, subject to the blocklist.
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default = "default_blocklist")]
    pub blocklist: Vec<String>,
}

fn default_blocklist() -> Vec<String> {
    vec!["chrome://".to_string(), "chrome-extension://".to_string()]
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            blocklist: default_blocklist(),
        }
    }
}

/// Actions the extension should confirm with the user before executing.
/// The relay persists and reports this section; enforcement happens in the
/// extension UI, outside this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveActionsConfig {
    #[serde(default = "default_confirm_enabled")]
    pub require_confirmation: bool,
    #[serde(default = "default_sensitive_ops")]
    pub actions: Vec<String>,
}

fn default_confirm_enabled() -> bool {
    true
}

fn default_sensitive_ops() -> Vec<String> {
    vec![
        "submit_form".to_string(),
        "download".to_string(),
        "clear_cookies".to_string(),
    ]
}

impl Default for SensitiveActionsConfig {
    fn default() -> Self {
        Self {
            require_confirmation: default_confirm_enabled(),
            actions: default_sensitive_ops(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_audit_enabled() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            auth_token: String::new(),
            rate_limit: RateLimitConfig::default(),
            domains: DomainsConfig::default(),
            sensitive_actions: SensitiveActionsConfig::default(),
            audit_log: AuditLogConfig::default(),
            emergency_stop: false,
        }
    }
}

/// A partial update merged into [`SecurityConfig`] field by field. Nested
/// sections merge per field as well; a section is never replaced wholesale,
/// so an update touching `rateLimit.maxPerMinute` leaves `maxPerSecond`
/// alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityUpdate {
    pub port: Option<u16>,
    pub auth_token: Option<String>,
    #[serde(default)]
    pub rate_limit: RateLimitUpdate,
    #[serde(default)]
    pub domains: DomainsUpdate,
    #[serde(default)]
    pub sensitive_actions: SensitiveActionsUpdate,
    #[serde(default)]
    pub audit_log: AuditLogUpdate,
    pub emergency_stop: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitUpdate {
    pub enabled: Option<bool>,
    pub max_per_second: Option<u32>,
    pub max_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainsUpdate {
    pub allowlist: Option<Vec<String>>,
    pub blocklist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitiveActionsUpdate {
    pub require_confirmation: Option<bool>,
    pub actions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogUpdate {
    pub enabled: Option<bool>,
    pub retention_days: Option<u32>,
}

impl SecurityConfig {
    /// Load the config from `path`, writing defaults back when the file does
    /// not exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let config: SecurityConfig = serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            Ok(config)
        } else {
            let config = SecurityConfig::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "Wrote default security config");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Merge a partial update into this config, field by field.
    pub fn apply(&mut self, update: SecurityUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(token) = update.auth_token {
            self.auth_token = token;
        }
        if let Some(enabled) = update.rate_limit.enabled {
            self.rate_limit.enabled = enabled;
        }
        if let Some(v) = update.rate_limit.max_per_second {
            self.rate_limit.max_per_second = v;
        }
        if let Some(v) = update.rate_limit.max_per_minute {
            self.rate_limit.max_per_minute = v;
        }
        if let Some(v) = update.domains.allowlist {
            self.domains.allowlist = v;
        }
        if let Some(v) = update.domains.blocklist {
            self.domains.blocklist = v;
        }
        if let Some(v) = update.sensitive_actions.require_confirmation {
            self.sensitive_actions.require_confirmation = v;
        }
        if let Some(v) = update.sensitive_actions.actions {
            self.sensitive_actions.actions = v;
        }
        if let Some(v) = update.audit_log.enabled {
            self.audit_log.enabled = v;
        }
        if let Some(v) = update.audit_log.retention_days {
            self.audit_log.retention_days = v;
        }
        if let Some(v) = update.emergency_stop {
            self.emergency_stop = v;
        }
    }
}
