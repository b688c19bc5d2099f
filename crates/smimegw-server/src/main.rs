//! smimegw - S/MIME decrypting mail gateway entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use smimegw_common::{Config, EmailAddress};
use smimegw_core::{Gateway, StageRegistry, Task, TaskResult};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "smimegw", version, about = "SMTP MTA for decrypting S/MIME messages")]
struct Cli {
    /// Configuration file (default: ./smimegw.toml, ./config.toml, /etc/smimegw/config.toml)
    #[arg(short, long, global = true, env = "SMIMEGW_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Validate the configuration and build the chain
    CheckConfig,
    /// Run one message file through the save chain
    Process {
        /// RFC 5322 message file
        path: PathBuf,
        /// Envelope sender
        #[arg(long)]
        from: Option<String>,
        /// Envelope recipient (repeatable)
        #[arg(long = "rcpt", required = true)]
        rcpt: Vec<String>,
        /// Write the processed message here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the task result and stage metadata as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Version = cli.command {
        println!("smimegw {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // No subscriber exists until the configuration is read, so load errors
    // only reach stderr through main.
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config);

    let result = match cli.command {
        Commands::Version => Ok(()),
        Commands::CheckConfig => check_config(&config),
        Commands::Process {
            path,
            from,
            rcpt,
            output,
            json,
        } => process(&config, &path, from.as_deref(), &rcpt, output.as_deref(), json).await,
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},smimegw_core=debug", config.logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .init();
    }
}

fn check_config(config: &Config) -> Result<()> {
    let registry = StageRegistry::with_builtins()?;
    let initialized = registry.initialize(config)?;
    let chain = initialized.build_configured()?;

    info!(chain = %chain.names().join("|"), "Configuration is valid");
    println!("OK: {}", chain.names().join("|"));
    Ok(())
}

async fn process(
    config: &Config,
    path: &Path,
    from: Option<&str>,
    rcpts: &[String],
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let gateway = Gateway::start(config, StageRegistry::with_builtins()?)?;
    let mut envelope = gateway.new_envelope();
    envelope.set_from(from.map(parse_address).transpose()?);
    envelope.set_remote_ip("127.0.0.1");
    envelope.set_helo("localhost");

    for rcpt in rcpts {
        envelope.add_recipient(parse_address(rcpt)?);
        let result = gateway.run_task(&mut envelope, Task::ValidateRecipient).await;
        if !result.is_accepted() {
            gateway.shutdown().await;
            bail!("Recipient {} refused: {}", rcpt, result.reply());
        }
    }

    envelope.set_data(&data);
    let result = gateway.run_task(&mut envelope, Task::SaveMail).await;
    gateway.run_task(&mut envelope, Task::Close).await;
    gateway.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary(&result, &envelope))?);
    }

    if !result.is_accepted() {
        bail!("Message rejected: {}", result.reply());
    }

    let message = envelope.to_bytes();
    match output {
        Some(output) => tokio::fs::write(output, &message)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?,
        None if !json => std::io::stdout().lock().write_all(&message)?,
        None => {}
    }

    info!(envelope_id = envelope.id(), reply = %result.reply(), "Message processed");
    Ok(())
}

fn parse_address(s: &str) -> Result<EmailAddress> {
    Ok(s.parse::<EmailAddress>()?)
}

fn summary(result: &TaskResult, envelope: &smimegw_core::Envelope) -> serde_json::Value {
    let metadata: serde_json::Map<String, serde_json::Value> = ["HeadersParser", "Hasher", "Decrypt", "SmimeExtract"]
        .iter()
        .filter_map(|stage| envelope.metadata(stage).map(|m| (stage.to_string(), m.clone())))
        .collect();

    serde_json::json!({
        "envelope_id": envelope.id(),
        "accepted": result.is_accepted(),
        "failure": result.failure,
        "reply": result.reply(),
        "metadata": metadata,
    })
}
