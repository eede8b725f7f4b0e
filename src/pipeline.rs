//! Ingestion and publish pipelines.
//!
//! `ingest` pulls the latest wall page and persists the posts not seen
//! before; `publish` drains the unpublished backlog oldest first. Both are
//! generic over the network seams so they can run against mocks.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::contract::{BotTransport, Message, VkApi};
use crate::format::format_text;
use crate::store::{Post, PostStore};
use crate::telegram::{TelegramClient, TelegramError};
use crate::vk::parse_wall;

/// Fetches the channel's wall and stores every post not already known.
/// Returns the number of newly stored posts.
pub async fn ingest<V>(vk: &V, store: &PostStore, channel: &ChannelConfig) -> Result<usize>
where
    V: VkApi + ?Sized,
{
    let items = vk
        .wall_get(channel.vk_group_id)
        .await
        .with_context(|| format!("fetching wall for channel {}", channel.name))?;
    let posts = parse_wall(&channel.name, items);

    let ids: Vec<i64> = posts.iter().map(|post| post.vk_post_id).collect();
    let known = store.existing_post_ids(&ids)?;

    let mut added = 0;
    for post in posts {
        if known.contains(&post.vk_post_id) {
            continue;
        }
        store.add_post(&post)?;
        added += 1;
    }
    info!(channel = %channel.name, added, "ingested wall page");
    Ok(added)
}

/// Publishes the channel's unpublished backlog, oldest post first. A post
/// the platform rejects outright is marked published without message ids so
/// it never blocks the queue; any other send error aborts the run and leaves
/// the remainder unpublished.
pub async fn publish<T>(
    client: &TelegramClient<T>,
    store: &PostStore,
    channel: &ChannelConfig,
    limit: Option<usize>,
    post_interval: Duration,
) -> Result<usize>
where
    T: BotTransport,
{
    let backlog = store.unpublished_posts(&channel.name, limit)?;
    let total = backlog.len();

    for (index, post) in backlog.into_iter().enumerate() {
        if index > 0 {
            sleep(post_interval).await;
        }
        match send_post(client, channel, &post).await {
            Ok(messages) => {
                store.mark_published(post.vk_post_id, channel.tg_chat_id, &messages)?;
                info!(
                    channel = %channel.name,
                    post = post.vk_post_id,
                    messages = messages.len(),
                    "published post"
                );
            }
            Err(TelegramError::BadRequest(description)) => {
                // The post itself is unsendable; park it so it never
                // blocks the rest of the backlog.
                warn!(
                    channel = %channel.name,
                    post = post.vk_post_id,
                    %description,
                    "post rejected, marking published without messages"
                );
                store.mark_published(post.vk_post_id, channel.tg_chat_id, &[])?;
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!(
                        "publishing post {} for channel {}",
                        post.vk_post_id, channel.name
                    )
                });
            }
        }
    }
    Ok(total)
}

async fn send_post<T>(
    client: &TelegramClient<T>,
    channel: &ChannelConfig,
    post: &Post,
) -> Result<Vec<Message>, TelegramError>
where
    T: BotTransport,
{
    let content = post.content.as_deref().map(|text| {
        if channel.format_text {
            format_text(text)
        } else {
            text.to_owned()
        }
    });
    let caption = content.as_deref();

    match post.photos.len() {
        0 => client.send_message(channel.tg_chat_id, caption.unwrap_or_default()).await,
        1 => {
            client
                .send_photo(channel.tg_chat_id, &post.photos[0], caption)
                .await
        }
        _ => {
            client
                .send_media_group(channel.tg_chat_id, &post.photos, caption)
                .await
        }
    }
}
