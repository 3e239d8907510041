//! Command-line argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ocms-webhookd",
    about = "oCMS webhook delivery daemon",
    version,
    long_about = "Delivers signed oCMS webhook events to subscribers with retries, \
                  dead-lettering and debouncing. Also signs and verifies payloads \
                  the way subscribers see them."
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

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: Option<String>,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Defaults to `run`
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the dispatcher until Ctrl-C or SIGTERM
    Run {
        /// Dispatch a `test` event once the dispatcher is up
        #[arg(long)]
        send_test: bool,
    },

    /// Print the signature header value for a payload
    Sign {
        /// Shared webhook secret
        #[arg(short, long, env = "WEBHOOK_SECRET")]
        secret: String,

        /// Payload file (reads stdin when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Check a received payload against its signature header
    Verify {
        /// Shared webhook secret
        #[arg(short, long, env = "WEBHOOK_SECRET")]
        secret: String,

        /// Value of the X-Webhook-Signature header
        #[arg(long)]
        signature: String,

        /// Payload file (reads stdin when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Generate a new webhook secret
    GenSecret,
}
