//! Configuration: a YAML file for the channel topology, environment
//! variables for the secrets.
//!
//! Secrets never live in the file. `VK_SERVICE_TOKEN` and `TG_BOT_TOKEN`
//! are read from the environment, which a local `.env` file may populate.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

const VK_TOKEN_VAR: &str = "VK_SERVICE_TOKEN";
const TG_TOKEN_VAR: &str = "TG_BOT_TOKEN";

const DEFAULT_POST_INTERVAL_SECS: u64 = 5;
const DEFAULT_FETCH_INTERVAL_SECS: u64 = 60;

/// One source-group to destination-channel mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub vk_group_id: i64,
    pub tg_chat_id: i64,
    #[serde(default)]
    pub format_text: bool,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    database: PathBuf,
    #[serde(default = "default_post_interval")]
    post_interval_secs: u64,
    #[serde(default = "default_fetch_interval")]
    fetch_interval_secs: u64,
    channels: Vec<ChannelConfig>,
}

fn default_post_interval() -> u64 {
    DEFAULT_POST_INTERVAL_SECS
}

fn default_fetch_interval() -> u64 {
    DEFAULT_FETCH_INTERVAL_SECS
}

#[derive(Debug)]
pub struct Config {
    pub database: PathBuf,
    pub post_interval_secs: u64,
    pub fetch_interval_secs: u64,
    pub channels: Vec<ChannelConfig>,
    pub vk_token: String,
    pub tg_token: String,
}

impl Config {
    pub fn post_interval(&self) -> Duration {
        Duration::from_secs(self.post_interval_secs)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    /// Resolves a channel argument to the channels to operate on. `all`
    /// selects every configured channel, and so does omitting the argument
    /// when only one channel is configured.
    pub fn resolve_channels(&self, selector: Option<&str>) -> Result<Vec<&ChannelConfig>> {
        match selector {
            Some("all") => Ok(self.channels.iter().collect()),
            Some(name) => {
                let Some(channel) = self.channels.iter().find(|c| c.name == name) else {
                    bail!("channel {name} is not configured");
                };
                Ok(vec![channel])
            }
            None if self.channels.len() == 1 => Ok(self.channels.iter().collect()),
            None => bail!("several channels are configured, name one or pass 'all'"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    info!(path = %path.display(), "loading configuration");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading configuration file {}", path.display()))?;
    let file: FileConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing configuration file {}", path.display()))?;
    if file.channels.is_empty() {
        bail!("configuration lists no channels");
    }

    let vk_token = std::env::var(VK_TOKEN_VAR)
        .with_context(|| format!("environment variable {VK_TOKEN_VAR} is not set"))?;
    let tg_token = std::env::var(TG_TOKEN_VAR)
        .with_context(|| format!("environment variable {TG_TOKEN_VAR} is not set"))?;

    info!(
        channels = file.channels.len(),
        database = %file.database.display(),
        "configuration loaded"
    );
    Ok(Config {
        database: file.database,
        post_interval_secs: file.post_interval_secs,
        fetch_interval_secs: file.fetch_interval_secs,
        channels: file.channels,
        vk_token,
        tg_token,
    })
}
