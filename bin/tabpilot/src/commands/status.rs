use tabpilot_core::{Paths, SecurityConfig};

pub fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config_path = paths.security_config_file();
    println!("tabpilot status");
    println!("  base dir:      {}", paths.base.display());
    println!(
        "  config file:   {} ({})",
        config_path.display(),
        if config_path.exists() { "present" } else { "missing, defaults apply" }
    );

    let config = SecurityConfig::load_or_init(&config_path)?;
    println!("  gateway port:  {}", config.port);
    println!(
        "  auth token:    {}",
        if config.auth_token.is_empty() { "not set (loopback only)" } else { "configured" }
    );
    println!(
        "  rate limit:    {}",
        if config.rate_limit.enabled {
            format!(
                "{}/s, {}/min",
                config.rate_limit.max_per_second, config.rate_limit.max_per_minute
            )
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  domains:       {} allowlisted, {} blocklisted",
        config.domains.allowlist.len(),
        config.domains.blocklist.len()
    );
    println!(
        "  audit log:     {} (retention {} days) at {}",
        if config.audit_log.enabled { "enabled" } else { "disabled" },
        config.audit_log.retention_days,
        paths.audit_dir().display()
    );
    println!(
        "  emergency stop: {}",
        if config.emergency_stop { "ENGAGED" } else { "off" }
    );
    Ok(())
}
