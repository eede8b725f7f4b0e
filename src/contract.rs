//! Trait seams between the pipelines and the outside world.
//!
//! `VkApi` and `BotTransport` are the two network boundaries. Both are
//! annotated for `mockall` so the pipelines and the retry layer can be
//! exercised deterministically in tests; the generated mocks are exported
//! under the `test-export-mocks` feature for integration tests.
//!
//! `BotTransport` is deliberately a single-attempt interface: chunking,
//! flood-control retries and partial-failure handling live in
//! [`crate::telegram::TelegramClient`], which wraps any transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::telegram::TelegramError;
use crate::vk::{VkError, WallItem};

/// A message created on the destination platform, as much of it as the
/// pipelines need to stamp the store.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: i64,
    pub chat_id: i64,
    pub date: DateTime<Utc>,
}

/// A parsed wall post that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub channel_name: String,
    pub vk_post_id: i64,
    pub vk_group_id: i64,
    pub content: Option<String>,
    pub photos: Vec<String>,
    pub vk_post_date: DateTime<Utc>,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait VkApi: Send + Sync {
    /// Lists the most recent wall items for the given owner id. The page
    /// size is a platform limit, not a parameter.
    async fn wall_get(&self, owner_id: i64) -> Result<Vec<WallItem>, VkError>;
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait BotTransport: Send + Sync {
    /// One sendMessage attempt.
    async fn send_message(
        &self,
        chat_id: i64,
        text: String,
        parse_mode: String,
    ) -> Result<Message, TelegramError>;

    /// One sendPhoto attempt, optionally captioned.
    async fn send_photo(
        &self,
        chat_id: i64,
        photo_url: String,
        caption: Option<String>,
        parse_mode: String,
    ) -> Result<Message, TelegramError>;

    /// One sendMediaGroup attempt bundling all photos into a single post.
    async fn send_media_group(
        &self,
        chat_id: i64,
        photo_urls: Vec<String>,
        disable_notification: bool,
    ) -> Result<Vec<Message>, TelegramError>;
}
