use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rabbit_fixtures::config::{self, RabbitConfig, CONFIG_FILE_NAME};
use rabbit_fixtures::{RabbitFixture, Settings};

#[derive(Parser, Debug)]
#[command(name = "rabbit-fixtures", about = "Provision and poke RabbitMQ test topology")]
struct Cli {
    /// Configuration file (defaults to RABBIT_FIXTURES_CONFIG, then discovery)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create vhosts and declare every configured exchange/queue/binding
    Provision,
    /// Publish one message to an exchange
    Publish {
        connection: String,
        exchange: String,
        content: String,
        #[arg(long)]
        routing_key: Option<String>,
    },
    /// Fetch (and acknowledge) at most one message from a queue
    Fetch { connection: String, queue: String },
    /// Remove all messages from a queue
    Purge { connection: String, queue: String },
    /// Load and validate the configuration without touching any broker
    Check,
    /// Write a sample configuration file
    Init { path: Option<PathBuf> },
}

fn load(cli_path: Option<PathBuf>, settings: &Settings) -> Result<RabbitConfig> {
    match cli_path.or_else(|| settings.config_path.clone()) {
        Some(path) => config::load_config_from(&path),
        None => config::load_config(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    if let Command::Init { path } = &cli.command {
        let path = path.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        return config::create_default_config_file(&path);
    }

    let rabbit_config = load(cli.config, &settings)?;

    if let Command::Check = cli.command {
        info!(connections = rabbit_config.connections.len(), "Configuration is valid");
        return Ok(());
    }

    // Provisioning purges every configured queue; the other commands only attach.
    let fixture = match cli.command {
        Command::Provision => RabbitFixture::connect(&rabbit_config, &settings)
            .await
            .context("Failed to provision RabbitMQ fixtures")?,
        _ => RabbitFixture::attach(&rabbit_config, &settings)
            .await
            .context("Failed to connect to RabbitMQ")?,
    };

    match cli.command {
        Command::Publish { connection, exchange, content, routing_key } => {
            fixture
                .publish(&exchange, &content, &connection, routing_key.as_deref())
                .await?;
        }
        Command::Fetch { connection, queue } => match fixture.fetch_one(&queue, &connection).await? {
            Some(body) => println!("{}", body),
            None => info!(queue = %queue, "Queue is empty"),
        },
        Command::Purge { connection, queue } => fixture.purge(&queue, &connection).await?,
        Command::Provision | Command::Check | Command::Init { .. } => {}
    }

    fixture.close().await?;
    Ok(())
}
