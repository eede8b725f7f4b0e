//! Telegram destination client.
//!
//! [`TelegramClient`] wraps a [`BotTransport`] with the outbound protocol:
//! whitespace-aware chunking of long texts, caption overflow handling,
//! media-group assembly and the uniform retry policy. [`HttpBotTransport`]
//! is the real Bot API transport over reqwest.
//!
//! Retry policy, applied to every outbound call:
//! - flood control (`retry_after`) sleeps for the server-mandated wait plus
//!   a small margin, then retries exactly once;
//! - a timeout is never retried, since the message may still have been
//!   delivered, and yields no message id;
//! - the spurious "Group send failed" rejection of media groups is swallowed;
//! - everything else propagates to the caller.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::contract::{BotTransport, Message};

/// Hard platform limit on the length of one message.
pub const MAX_MESSAGE_LENGTH: usize = 4096;
/// Hard platform limit on the length of a photo caption.
pub const MAX_CAPTION_LENGTH: usize = 1024;

const PARSE_MODE: &str = "HTML";
const API_BASE_URL: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_AFTER_MARGIN: Duration = Duration::from_secs(2);
/// Pause after a successful gallery send; galleries trip flood control fast.
const MEDIA_GROUP_PAUSE: Duration = Duration::from_secs(10);
const TIMED_OUT_PAUSE: Duration = Duration::from_secs(1);
const GROUP_SEND_FAILED: &str = "Group send failed";

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("flood control, retry after {0}s")]
    RetryAfter(u64),
    #[error("request timed out")]
    TimedOut,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("telegram api error: {0}")]
    Api(String),
    #[error("telegram transport error: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct TelegramClient<T> {
    transport: T,
}

impl<T: BotTransport> TelegramClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Sends `text` as one or more messages, splitting at whitespace so no
    /// chunk exceeds the platform limit. Returns the created messages in
    /// send order; chunks lost to timeouts yield no message.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
    ) -> Result<Vec<Message>, TelegramError> {
        let mut messages = Vec::new();
        for chunk in split_text(text, MAX_MESSAGE_LENGTH) {
            let sent = self
                .with_retry("sendMessage", || {
                    self.transport
                        .send_message(chat_id, chunk.clone(), PARSE_MODE.to_owned())
                })
                .await?;
            if let Some(message) = sent {
                debug!(message_id = message.message_id, "sent text chunk");
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Sends one photo. A caption that fits the caption limit rides along;
    /// a longer one goes out first as a regular message, followed by the
    /// bare photo.
    pub async fn send_photo(
        &self,
        chat_id: i64,
        photo_url: &str,
        caption: Option<&str>,
    ) -> Result<Vec<Message>, TelegramError> {
        let caption = caption.unwrap_or_default();
        let mut messages = Vec::new();

        if !caption.is_empty() && caption.chars().count() <= MAX_CAPTION_LENGTH {
            let sent = self
                .with_retry("sendPhoto", || {
                    self.transport.send_photo(
                        chat_id,
                        photo_url.to_owned(),
                        Some(caption.to_owned()),
                        PARSE_MODE.to_owned(),
                    )
                })
                .await?;
            if let Some(message) = sent {
                info!(message_id = message.message_id, "sent photo with caption");
                messages.push(message);
            }
            return Ok(messages);
        }

        if !caption.is_empty() {
            messages.extend(self.send_message(chat_id, caption).await?);
        }
        let sent = self
            .with_retry("sendPhoto", || {
                self.transport.send_photo(
                    chat_id,
                    photo_url.to_owned(),
                    None,
                    PARSE_MODE.to_owned(),
                )
            })
            .await?;
        if let Some(message) = sent {
            info!(message_id = message.message_id, "sent photo");
            messages.push(message);
        }
        Ok(messages)
    }

    /// Sends a photo gallery. The caption, if any, goes out first as a
    /// regular message; the gallery itself is sent with notifications
    /// disabled to avoid notifying twice.
    pub async fn send_media_group(
        &self,
        chat_id: i64,
        photo_urls: &[String],
        caption: Option<&str>,
    ) -> Result<Vec<Message>, TelegramError> {
        let mut messages = Vec::new();
        if let Some(text) = caption.filter(|text| !text.is_empty()) {
            messages.extend(self.send_message(chat_id, text).await?);
        }

        let group = self
            .with_retry("sendMediaGroup", || {
                self.transport
                    .send_media_group(chat_id, photo_urls.to_vec(), true)
            })
            .await;
        match group {
            Ok(Some(sent)) => {
                info!(photos = photo_urls.len(), "sent photo gallery");
                messages.extend(sent);
                sleep(MEDIA_GROUP_PAUSE).await;
            }
            Ok(None) => {
                sleep(TIMED_OUT_PAUSE).await;
            }
            Err(TelegramError::BadRequest(body)) if body == GROUP_SEND_FAILED => {
                warn!("gallery rejected with the spurious batch failure, ignoring");
            }
            Err(error) => return Err(error),
        }
        Ok(messages)
    }

    /// Runs one transport call under the uniform retry policy. `Ok(None)`
    /// means the call timed out and its result must be treated as unknown.
    async fn with_retry<'a, R, F>(
        &self,
        call: &str,
        mut attempt: F,
    ) -> Result<Option<R>, TelegramError>
    where
        F: FnMut() -> BoxFuture<'a, Result<R, TelegramError>>,
    {
        match attempt().await {
            Ok(result) => Ok(Some(result)),
            Err(TelegramError::RetryAfter(seconds)) => {
                let wait = Duration::from_secs(seconds) + RETRY_AFTER_MARGIN;
                warn!(call, seconds, "flood control, sleeping before the retry");
                sleep(wait).await;
                Ok(Some(attempt().await?))
            }
            Err(TelegramError::TimedOut) => {
                warn!(call, "request timed out, the message may still arrive");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

/// Splits `text` into chunks of at most `max_len` characters, preferring
/// newline boundaries, then spaces. A single run longer than `max_len`
/// is split mid-run as a last resort.
fn split_text(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if rest.chars().count() <= max_len {
            chunks.push(rest.to_string());
            break;
        }
        // Byte offset right after the first `max_len` characters.
        let cut = rest
            .char_indices()
            .nth(max_len)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        let window = &rest[..cut];
        let boundary = if rest[cut..].starts_with(['\n', ' ']) {
            Some(cut)
        } else {
            window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .filter(|&index| index > 0)
        };
        match boundary {
            Some(index) => {
                let chunk = rest[..index].trim_end();
                if !chunk.is_empty() {
                    chunks.push(chunk.to_string());
                }
                rest = rest[index + 1..].trim_start();
            }
            None => {
                chunks.push(window.to_string());
                rest = &rest[cut..];
            }
        }
    }
    chunks
}

/// Bot API transport over HTTP.
pub struct HttpBotTransport {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiResponse<R> {
    ok: bool,
    result: Option<R>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Deserialize)]
struct RawMessage {
    message_id: i64,
    date: i64,
    chat: RawChat,
}

#[derive(Deserialize)]
struct RawChat {
    id: i64,
}

#[derive(Serialize)]
struct InputMediaPhoto<'a> {
    r#type: &'static str,
    media: &'a str,
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        Message {
            message_id: raw.message_id,
            chat_id: raw.chat.id,
            date: Utc
                .timestamp_opt(raw.date, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

impl HttpBotTransport {
    pub fn new(token: &str) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: format!("{API_BASE_URL}/bot{token}"),
        })
    }

    async fn call<R>(&self, method: &str, payload: serde_json::Value) -> Result<R, TelegramError>
    where
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let body: ApiResponse<R> = response.json().await.map_err(map_reqwest_error)?;

        if body.ok {
            return body
                .result
                .ok_or_else(|| TelegramError::Api("response marked ok without a result".into()));
        }
        if let Some(seconds) = body.parameters.and_then(|p| p.retry_after) {
            return Err(TelegramError::RetryAfter(seconds));
        }
        let description = body
            .description
            .unwrap_or_else(|| "unknown error".to_string());
        match body.error_code {
            Some(400) => Err(TelegramError::BadRequest(description)),
            _ => Err(TelegramError::Api(description)),
        }
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TelegramError {
    if error.is_timeout() {
        TelegramError::TimedOut
    } else {
        TelegramError::Http(error)
    }
}

#[async_trait::async_trait]
impl BotTransport for HttpBotTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: String,
        parse_mode: String,
    ) -> Result<Message, TelegramError> {
        let raw: RawMessage = self
            .call(
                "sendMessage",
                json!({ "chat_id": chat_id, "text": text, "parse_mode": parse_mode }),
            )
            .await?;
        Ok(raw.into())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo_url: String,
        caption: Option<String>,
        parse_mode: String,
    ) -> Result<Message, TelegramError> {
        let mut payload = json!({ "chat_id": chat_id, "photo": photo_url, "parse_mode": parse_mode });
        if let Some(caption) = caption {
            payload["caption"] = json!(caption);
        }
        let raw: RawMessage = self.call("sendPhoto", payload).await?;
        Ok(raw.into())
    }

    async fn send_media_group(
        &self,
        chat_id: i64,
        photo_urls: Vec<String>,
        disable_notification: bool,
    ) -> Result<Vec<Message>, TelegramError> {
        let media: Vec<InputMediaPhoto<'_>> = photo_urls
            .iter()
            .map(|url| InputMediaPhoto {
                r#type: "photo",
                media: url,
            })
            .collect();
        let raw: Vec<RawMessage> = self
            .call(
                "sendMediaGroup",
                json!({
                    "chat_id": chat_id,
                    "media": media,
                    "disable_notification": disable_notification,
                }),
            )
            .await?;
        Ok(raw.into_iter().map(Message::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockBotTransport;
    use tokio::time::Instant;

    fn message(message_id: i64) -> Message {
        Message {
            message_id,
            chat_id: 1,
            date: Utc::now(),
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_text("hello world", 4096), vec!["hello world"]);
    }

    #[test]
    fn unbroken_text_is_hard_split_at_the_limit() {
        let text = "t".repeat(4097);
        let chunks = split_text(&text, MAX_MESSAGE_LENGTH);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks[1].chars().count(), 1);
    }

    #[test]
    fn chunks_break_at_whitespace() {
        let chunks = split_text("word1 word2 word3", 11);
        assert_eq!(chunks, vec!["word1 word2", "word3"]);
    }

    #[test]
    fn newline_is_preferred_over_space() {
        let chunks = split_text("one two\nthree four", 12);
        assert_eq!(chunks, vec!["one two", "three four"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_control_is_retried_once_after_the_wait() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_message()
            .times(1)
            .returning(|_, _, _| Err(TelegramError::RetryAfter(3)));
        transport
            .expect_send_message()
            .times(1)
            .returning(|_, _, _| Ok(message(10)));

        let client = TelegramClient::new(transport);
        let start = Instant::now();
        let messages = client.send_message(1, "hello").await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, 10);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_message()
            .times(1)
            .returning(|_, _, _| Err(TelegramError::TimedOut));

        let client = TelegramClient::new(transport);
        let messages = client.send_message(1, "hello").await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn every_chunk_uses_the_same_parse_mode() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_message()
            .times(2)
            .withf(|_, _, parse_mode| parse_mode == PARSE_MODE)
            .returning(|_, _, _| Ok(message(1)));

        let client = TelegramClient::new(transport);
        let text = "t".repeat(MAX_MESSAGE_LENGTH + 1);
        let messages = client.send_message(7, &text).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn fitting_caption_rides_along_with_the_photo() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_photo()
            .times(1)
            .withf(|_, url, caption, _| url == "u" && caption.as_deref() == Some("short"))
            .returning(|_, _, _, _| Ok(message(3)));

        let client = TelegramClient::new(transport);
        let messages = client.send_photo(1, "u", Some("short")).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn oversized_caption_is_sent_as_a_message_first() {
        let caption = "c".repeat(MAX_CAPTION_LENGTH + 1);
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_message()
            .times(1)
            .returning(|_, _, _| Ok(message(1)));
        transport
            .expect_send_photo()
            .times(1)
            .withf(|_, _, caption, _| caption.is_none())
            .returning(|_, _, _, _| Ok(message(2)));

        let client = TelegramClient::new(transport);
        let messages = client.send_photo(1, "u", Some(&caption)).await.unwrap();
        assert_eq!(
            messages.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gallery_caption_goes_first_and_ids_concatenate() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_message()
            .times(1)
            .returning(|_, _, _| Ok(message(1)));
        transport
            .expect_send_media_group()
            .times(1)
            .withf(|_, urls, disable_notification| urls.len() == 2 && *disable_notification)
            .returning(|_, _, _| Ok(vec![message(2), message(3)]));

        let client = TelegramClient::new(transport);
        let urls = vec!["a".to_string(), "b".to_string()];
        let messages = client
            .send_media_group(1, &urls, Some("caption"))
            .await
            .unwrap();
        assert_eq!(
            messages.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spurious_batch_failure_is_swallowed() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_media_group()
            .times(1)
            .returning(|_, _, _| Err(TelegramError::BadRequest(GROUP_SEND_FAILED.into())));

        let client = TelegramClient::new(transport);
        let urls = vec!["a".to_string(), "b".to_string()];
        let messages = client.send_media_group(1, &urls, None).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_gallery_rejections_propagate() {
        let mut transport = MockBotTransport::new();
        transport
            .expect_send_media_group()
            .times(1)
            .returning(|_, _, _| Err(TelegramError::BadRequest("chat not found".into())));

        let client = TelegramClient::new(transport);
        let urls = vec!["a".to_string(), "b".to_string()];
        let result = client.send_media_group(1, &urls, None).await;
        assert!(matches!(result, Err(TelegramError::BadRequest(_))));
    }
}
