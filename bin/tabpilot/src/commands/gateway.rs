use std::sync::Arc;

use tabpilot_core::{Paths, SecurityConfig};
use tabpilot_relay::{RelayGateway, SecurityGate};
use tracing::info;

pub async fn run(port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = SecurityConfig::load_or_init(&paths.security_config_file())?;
    let port = port.unwrap_or(config.port);

    let gate = Arc::new(SecurityGate::new(
        config,
        paths.security_config_file(),
        paths.audit_dir(),
    ));
    gate.audit_log().prune();

    let gateway = Arc::new(RelayGateway::new(gate));
    let server = gateway.clone().bind("127.0.0.1", port).await?;
    info!(addr = %server.local_addr()?, "Gateway listening for bridge connections");

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }
    gateway.shutdown().await;
    Ok(())
}
