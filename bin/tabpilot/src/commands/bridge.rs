use tabpilot_core::{Paths, SecurityConfig};
use tabpilot_relay::bridge::{Bridge, BridgeConfig};
use tracing::info;

pub async fn run(port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = SecurityConfig::load_or_init(&paths.security_config_file())?;
    let port = port.unwrap_or(config.port);

    let bridge = Bridge::new(BridgeConfig::new(port, &config.auth_token)?);
    info!(port, "Bridge starting");

    tokio::select! {
        result = bridge.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, closing channels");
        }
    }
    Ok(())
}
