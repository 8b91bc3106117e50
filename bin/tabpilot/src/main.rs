mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabpilot")]
#[command(about = "Browser-session relay for AI agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway relay (long-running daemon)
    Gateway {
        /// Port to listen on (overrides the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the native-messaging bridge (spawned by the browser)
    Bridge {
        /// Gateway port to connect to (overrides the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect and change the security policy
    Security {
        #[command(subcommand)]
        command: SecurityCommands,
    },

    /// Show configuration status
    Status,
}

#[derive(Subcommand)]
enum SecurityCommands {
    /// Print the current security config
    Show,
    /// Set one config value by dot-separated key (e.g. rateLimit.maxPerMinute)
    Set {
        /// Config key (e.g. "domains.allowlist", "auditLog.retentionDays")
        key: String,
        /// Value to set (lists are comma-separated)
        value: String,
    },
    /// Engage the emergency stop: refuse every action until resumed
    Stop,
    /// Release the emergency stop
    Resume,
    /// Generate and persist a fresh auth token
    RotateToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // All logging goes to stderr: the bridge's stdout carries framed
    // protocol bytes and must stay clean.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Gateway { port } => {
            commands::gateway::run(port).await?;
        }
        Commands::Bridge { port } => {
            commands::bridge::run(port).await?;
        }
        Commands::Security { command } => match command {
            SecurityCommands::Show => {
                commands::security_cmd::show()?;
            }
            SecurityCommands::Set { key, value } => {
                commands::security_cmd::set(&key, &value)?;
            }
            SecurityCommands::Stop => {
                commands::security_cmd::set_emergency_stop(true)?;
            }
            SecurityCommands::Resume => {
                commands::security_cmd::set_emergency_stop(false)?;
            }
            SecurityCommands::RotateToken => {
                commands::security_cmd::rotate_token()?;
            }
        },
        Commands::Status => {
            commands::status::run()?;
        }
    }

    Ok(())
}
