//! The security gate every relayed action passes through.
//!
//! Checks run in a fixed order and short-circuit on the first refusal:
//! emergency stop, then rate limiting, then the domain policy for
//! URL-carrying operations. Transport-level auth (token + origin) guards the
//! WebSocket handshake separately, before any message is processed. Every
//! evaluated invocation produces exactly one audit entry.

pub mod audit;
pub mod domains;
pub mod rate_limit;

use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use tabpilot_core::{BlockReason, Error, Result, SecurityConfig, SecurityUpdate};

pub use audit::{AuditLogEntry, AuditLogger, AuditResult};
pub use domains::{evaluate_url, DomainVerdict};
pub use rate_limit::ActionRateLimiter;

/// Read-only introspection operations. They stay answerable while the
/// emergency stop is active (that is how an operator diagnoses the stop) and
/// they never consume rate-limit slots.
const INTROSPECTION_OPS: &[&str] = &["security_status", "audit_tail"];

/// Liveness probe: exempt from rate limiting and domain checks so monitors
/// cannot exhaust the windows, but still halted by the emergency stop since
/// it crosses into the extension.
const LIVENESS_OP: &str = "ping";

pub struct SecurityGate {
    config: RwLock<SecurityConfig>,
    config_path: PathBuf,
    limiter: Mutex<ActionRateLimiter>,
    audit: AuditLogger,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig, config_path: PathBuf, audit_dir: PathBuf) -> Self {
        let limiter = Mutex::new(ActionRateLimiter::new(&config.rate_limit));
        let audit = AuditLogger::new(audit_dir, &config.audit_log);
        Self {
            config: RwLock::new(config),
            config_path,
            limiter,
            audit,
        }
    }

    pub fn snapshot(&self) -> SecurityConfig {
        self.config.read().expect("security config lock poisoned").clone()
    }

    pub fn audit_log(&self) -> &AuditLogger {
        &self.audit
    }

    /// Steps (a)–(c) of the gate, in order, short-circuiting on the first
    /// refusal. Does not write the audit entry; the orchestrator does that
    /// once per invocation, with the final outcome and duration.
    pub fn authorize(&self, op: &str, payload: Option<&Value>) -> Result<()> {
        let config = self.config.read().expect("security config lock poisoned");

        let introspection = INTROSPECTION_OPS.contains(&op);
        if config.emergency_stop && !introspection {
            return Err(Error::Blocked(BlockReason::EmergencyStop));
        }
        if introspection || op == LIVENESS_OP {
            return Ok(());
        }

        if config.rate_limit.enabled {
            let mut limiter = self.limiter.lock().expect("rate limiter lock poisoned");
            if !limiter.try_acquire() {
                return Err(Error::Blocked(BlockReason::RateLimited));
            }
        }

        if let Some(url) = payload
            .and_then(|p| p.get("url"))
            .and_then(|u| u.as_str())
        {
            if let DomainVerdict::Blocked(reason) = evaluate_url(url, &config.domains) {
                return Err(Error::Blocked(reason));
            }
        }

        Ok(())
    }

    /// Step (d): transport-level auth for an incoming socket connection.
    /// Failing either check closes the connection before any message is
    /// processed.
    pub fn check_transport_auth(&self, token: Option<&str>, origin: Option<&str>) -> Result<()> {
        let config = self.config.read().expect("security config lock poisoned");

        if !config.auth_token.is_empty() {
            match token {
                Some(presented) if secure_eq(presented, &config.auth_token) => {}
                Some(_) => return Err(Error::AuthRejected("invalid auth token".to_string())),
                None => return Err(Error::AuthRejected("missing auth token".to_string())),
            }
        }

        if let Some(origin) = origin {
            if !origin_is_acceptable(origin) {
                return Err(Error::AuthRejected(format!("origin '{origin}' not allowed")));
            }
        }
        Ok(())
    }

    /// Write the single audit entry for one evaluated invocation.
    pub fn record_invocation(
        &self,
        op: &str,
        args: Option<&Value>,
        outcome: &Result<Value>,
        duration: Duration,
    ) {
        let duration_ms = duration.as_millis() as u64;
        let entry = match outcome {
            Ok(_) => AuditLogEntry::now(op, AuditResult::Success),
            Err(Error::Blocked(reason)) => {
                AuditLogEntry::now(op, AuditResult::Blocked).with_error(reason.as_str())
            }
            Err(e) => AuditLogEntry::now(op, AuditResult::Error).with_error(e.to_string()),
        };
        self.audit
            .append(&entry.with_args(args.cloned()).with_duration_ms(duration_ms));
    }

    pub fn record_auth_rejection(&self, reason: &str) {
        self.audit.append(
            &AuditLogEntry::now("connection_auth", AuditResult::Blocked).with_error(reason),
        );
    }

    /// Merge a partial update, persist it, and rebuild the rate windows when
    /// the limits changed.
    pub fn update(&self, update: SecurityUpdate) -> Result<SecurityConfig> {
        let mut config = self.config.write().expect("security config lock poisoned");
        let old_limits = config.rate_limit.clone();
        config.apply(update);
        config.save(&self.config_path)?;
        if config.rate_limit != old_limits {
            *self.limiter.lock().expect("rate limiter lock poisoned") =
                ActionRateLimiter::new(&config.rate_limit);
        }
        Ok(config.clone())
    }

    pub fn set_emergency_stop(&self, active: bool) -> Result<()> {
        let update = SecurityUpdate {
            emergency_stop: Some(active),
            ..Default::default()
        };
        self.update(update)?;
        if active {
            warn!("Emergency stop ENGAGED: all actions will be refused");
        } else {
            warn!("Emergency stop released");
        }
        Ok(())
    }

    pub fn emergency_stop_active(&self) -> bool {
        self.config
            .read()
            .expect("security config lock poisoned")
            .emergency_stop
    }
}

/// Constant-time string comparison for the shared token.
fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Origins allowed to open a gateway connection: a browser extension, a
/// localhost page, or no origin at all (native processes send none).
fn origin_is_acceptable(origin: &str) -> bool {
    let origin = origin.to_ascii_lowercase();
    if origin.starts_with("chrome-extension://") || origin.starts_with("moz-extension://") {
        return true;
    }
    match url::Url::parse(&origin) {
        Ok(url) => matches!(url.host_str(), Some("localhost") | Some("127.0.0.1")),
        Err(_) => false,
    }
}
