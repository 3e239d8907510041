mod app;
mod cli;
mod telemetry;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::Path;
use tracing::{error, info};

use ocms_core::AppConfig;
use ocms_webhook::{generate_webhook_secret, sign, WebhookVerifier};

use crate::app::App;
use crate::cli::{Args, Command};
use crate::telemetry::{get_log_level, init_telemetry, TelemetryOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let args = Args::parse();

    match args.command.clone().unwrap_or(Command::Run { send_test: false }) {
        Command::Run { send_test } => run_daemon(&args, send_test).await,
        Command::Sign { secret, file } => {
            let payload = read_payload(file.as_deref())?;
            println!("{}", sign(&payload, &secret));
            Ok(())
        }
        Command::Verify {
            secret,
            signature,
            file,
        } => {
            let payload = read_payload(file.as_deref())?;
            WebhookVerifier::new(&secret).verify(&payload, &signature)?;
            println!("valid");
            Ok(())
        }
        Command::GenSecret => {
            println!("{}", generate_webhook_secret());
            Ok(())
        }
    }
}

async fn run_daemon(args: &Args, send_test: bool) -> Result<()> {
    let config = AppConfig::load(Some(args.config.as_path()))
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    let options = TelemetryOptions {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        json: args.json_logs || config.logging.json,
    };
    init_telemetry(&options)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        log_level = %get_log_level(&options.level),
        "Starting oCMS webhook daemon"
    );

    let result = async {
        let app = App::build(&config).await?;
        app.run(send_test).await
    }
    .await;

    if let Err(ref e) = result {
        error!("Application error: {:#}", e);
    }

    info!("Webhook daemon shutdown complete");

    result
}

fn read_payload(file: Option<&Path>) -> Result<Vec<u8>> {
    let payload = match file {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read payload from {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read payload from stdin")?;
            buf
        }
    };

    if payload.is_empty() {
        bail!("Payload is empty");
    }

    Ok(payload)
}
