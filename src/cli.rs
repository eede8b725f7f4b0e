use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::{load_config, ChannelConfig, Config};
use crate::pipeline::{ingest, publish};
use crate::store::PostStore;
use crate::telegram::{HttpBotTransport, TelegramClient};
use crate::vk::VkClient;

/// CLI for wallflow: mirror VK group walls into Telegram channels.
#[derive(Parser)]
#[clap(
    name = "wallflow",
    version,
    about = "Mirror VK group wall posts into Telegram channels"
)]
pub struct Cli {
    /// Path to the YAML config file
    #[clap(long, default_value = "wallflow.yaml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch new wall posts into the store without publishing anything
    Fetch {
        /// Channel name, or 'all'
        channel: Option<String>,
    },
    /// Publish the stored backlog without fetching anything new
    Publish {
        /// Channel name, or 'all'
        channel: Option<String>,
        /// Publish at most this many posts per channel
        #[clap(long, short)]
        limit: Option<usize>,
    },
    /// Fetch and publish every channel in a loop
    Run {
        /// Channel name, or 'all'
        channel: Option<String>,
    },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Fetch { channel } => {
            let channels = config.resolve_channels(channel.as_deref())?;
            let store = PostStore::open(&config.database)?;
            let vk = VkClient::new(&config.vk_token)?;
            for channel in channels {
                ingest(&vk, &store, channel).await?;
            }
            Ok(())
        }
        Commands::Publish { channel, limit } => {
            let channels = config.resolve_channels(channel.as_deref())?;
            let store = PostStore::open(&config.database)?;
            let client = TelegramClient::new(HttpBotTransport::new(&config.tg_token)?);
            for channel in channels {
                publish(&client, &store, channel, limit, config.post_interval()).await?;
            }
            Ok(())
        }
        Commands::Run { channel } => run_loop(&config, channel.as_deref()).await,
    }
}

/// The long-running mode: every tick fetches and publishes each selected
/// channel. A failure in one channel is logged and does not stop the
/// others, nor the loop.
async fn run_loop(config: &Config, selector: Option<&str>) -> Result<()> {
    let channels = config.resolve_channels(selector)?;
    let vk = VkClient::new(&config.vk_token)?;
    let client = TelegramClient::new(HttpBotTransport::new(&config.tg_token)?);
    info!(
        channels = channels.len(),
        interval_secs = config.fetch_interval_secs,
        "entering mirror loop"
    );

    loop {
        for channel in &channels {
            if let Err(cause) =
                mirror_channel(config, &vk, &client, channel, config.post_interval()).await
            {
                error!(channel = %channel.name, %cause, "channel run failed");
            }
        }
        sleep(config.fetch_interval()).await;
    }
}

async fn mirror_channel(
    config: &Config,
    vk: &VkClient,
    client: &TelegramClient<HttpBotTransport>,
    channel: &ChannelConfig,
    post_interval: Duration,
) -> Result<()> {
    let store = PostStore::open(&config.database)?;
    ingest(vk, &store, channel).await?;
    publish(client, &store, channel, None, post_interval).await?;
    Ok(())
}
