use anyhow::bail;
use tabpilot_core::{Paths, SecurityConfig, SecurityUpdate};

pub fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = SecurityConfig::load_or_init(&paths.security_config_file())?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub fn set(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = SecurityConfig::load_or_init(&paths.security_config_file())?;
    config.apply(update_for_key(key, value)?);
    config.save(&paths.security_config_file())?;
    println!("{key} = {value}");
    Ok(())
}

pub fn set_emergency_stop(active: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = SecurityConfig::load_or_init(&paths.security_config_file())?;
    config.apply(SecurityUpdate {
        emergency_stop: Some(active),
        ..Default::default()
    });
    config.save(&paths.security_config_file())?;
    if active {
        println!("Emergency stop ENGAGED. All browser actions will be refused.");
        println!("Run `tabpilot security resume` to release it.");
    } else {
        println!("Emergency stop released.");
    }
    Ok(())
}

pub fn rotate_token() -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = SecurityConfig::load_or_init(&paths.security_config_file())?;
    let token = format!("tok_{}", uuid::Uuid::new_v4().simple());
    config.apply(SecurityUpdate {
        auth_token: Some(token.clone()),
        ..Default::default()
    });
    config.save(&paths.security_config_file())?;
    println!("New auth token: {token}");
    println!("Restart the gateway and the browser extension to pick it up.");
    Ok(())
}

/// The update schema is fixed: each supported key maps onto one field.
/// Unknown keys are an error rather than a silent no-op.
fn update_for_key(key: &str, raw: &str) -> anyhow::Result<SecurityUpdate> {
    let mut update = SecurityUpdate::default();
    match key {
        "port" => update.port = Some(raw.parse()?),
        "authToken" => update.auth_token = Some(raw.to_string()),
        "rateLimit.enabled" => update.rate_limit.enabled = Some(raw.parse()?),
        "rateLimit.maxPerSecond" => update.rate_limit.max_per_second = Some(raw.parse()?),
        "rateLimit.maxPerMinute" => update.rate_limit.max_per_minute = Some(raw.parse()?),
        "domains.allowlist" => update.domains.allowlist = Some(parse_list(raw)),
        "domains.blocklist" => update.domains.blocklist = Some(parse_list(raw)),
        "sensitiveActions.requireConfirmation" => {
            update.sensitive_actions.require_confirmation = Some(raw.parse()?)
        }
        "sensitiveActions.actions" => update.sensitive_actions.actions = Some(parse_list(raw)),
        "auditLog.enabled" => update.audit_log.enabled = Some(raw.parse()?),
        "auditLog.retentionDays" => update.audit_log.retention_days = Some(raw.parse()?),
        "emergencyStop" => update.emergency_stop = Some(raw.parse()?),
        other => bail!("unknown security key '{other}'"),
    }
    Ok(update)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
