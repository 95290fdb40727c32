//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "paykit-server",
    about = "PayKit webhook server",
    version,
    long_about = "Receives Stripe and PayPal webhooks, verifies their signatures, \
                  deduplicates redeliveries and dispatches events to handlers."
)]
pub struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "CONFIG_PATH",
        default_value = "config/default.toml"
    )]
    pub config: PathBuf,

    /// HTTP server port, overrides `server.port`
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Environment (dev, staging, prod)
    #[arg(
        short,
        long,
        env = "ENVIRONMENT",
        default_value = "dev",
        value_parser = ["dev", "staging", "prod"]
    )]
    pub env: String,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == Some(0) {
            anyhow::bail!("--port must be greater than 0");
        }
        Ok(())
    }

    pub fn config_path(&self) -> String {
        self.config.to_string_lossy().into_owned()
    }
}
