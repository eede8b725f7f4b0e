//! VK wall client and post parser.
//!
//! `VkClient` talks to the `wall.get` endpoint and returns raw wall items;
//! `parse_wall` turns a raw page into [`NewPost`] values, dropping ads and
//! posts with nothing worth mirroring. Malformed attachments are skipped at
//! this boundary rather than propagated inward.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::contract::{NewPost, VkApi};

const API_BASE_URL: &str = "https://api.vk.com/method";
const API_VERSION: &str = "5.131";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum VkError {
    #[error("vk api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("vk transport error: {0}")]
    Http(#[from] reqwest::Error),
}

/// One raw wall post as returned by `wall.get`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WallItem {
    pub id: i64,
    pub owner_id: i64,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub marked_as_ads: u8,
    #[serde(default)]
    pub attachments: Vec<WallAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WallAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub photo: Option<WallPhoto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WallPhoto {
    #[serde(default)]
    pub sizes: Vec<PhotoSize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub width: u32,
    pub height: u32,
    pub url: String,
}

#[derive(Deserialize)]
struct Envelope {
    response: Option<WallPage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct WallPage {
    #[serde(default)]
    items: Vec<WallItem>,
}

#[derive(Deserialize)]
struct ApiError {
    error_code: i64,
    error_msg: String,
}

pub struct VkClient {
    http: reqwest::Client,
    token: String,
}

impl VkClient {
    pub fn new(token: &str) -> Result<Self, VkError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("wallflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            token: token.to_owned(),
        })
    }
}

#[async_trait]
impl VkApi for VkClient {
    async fn wall_get(&self, owner_id: i64) -> Result<Vec<WallItem>, VkError> {
        let url = format!("{API_BASE_URL}/wall.get");
        let envelope: Envelope = self
            .http
            .get(&url)
            .query(&[
                ("owner_id", owner_id.to_string()),
                ("access_token", self.token.clone()),
                ("v", API_VERSION.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = envelope.error {
            return Err(VkError::Api {
                code: error.error_code,
                message: error.error_msg,
            });
        }
        let items = envelope.response.map(|page| page.items).unwrap_or_default();
        info!(owner_id, items = items.len(), "got wall page");
        Ok(items)
    }
}

/// Converts a raw wall page into posts worth storing for `channel_name`.
///
/// Drops ads, posts whose only attachment is of an unsupported kind, and
/// posts that end up with neither text nor photos. For each photo attachment
/// only the largest variant by pixel area is kept, in attachment order.
pub fn parse_wall(channel_name: &str, items: Vec<WallItem>) -> Vec<NewPost> {
    let mut posts = Vec::new();
    for item in items {
        if item.marked_as_ads != 0 {
            debug!(group = item.owner_id, post = item.id, "skipping ad post");
            continue;
        }

        let mut photos = Vec::new();
        let mut non_photo_attachment = false;
        for attachment in &item.attachments {
            if attachment.kind != "photo" {
                non_photo_attachment = true;
                debug!(
                    kind = %attachment.kind,
                    group = item.owner_id,
                    post = item.id,
                    "skipping attachment of unsupported kind"
                );
                continue;
            }
            let Some(photo) = &attachment.photo else {
                continue;
            };
            if let Some(best) = largest_size(&photo.sizes) {
                photos.push(best.url.clone());
            }
        }

        let content = (!item.text.is_empty()).then(|| item.text.clone());
        if non_photo_attachment && photos.is_empty() {
            continue;
        }
        if content.is_none() && photos.is_empty() {
            continue;
        }

        posts.push(NewPost {
            channel_name: channel_name.to_owned(),
            vk_post_id: item.id,
            vk_group_id: item.owner_id,
            content,
            photos,
            vk_post_date: timestamp(item.date),
        });
    }
    posts
}

/// Largest variant by pixel area; on a tie the first encountered wins.
fn largest_size(sizes: &[PhotoSize]) -> Option<&PhotoSize> {
    let mut best: Option<&PhotoSize> = None;
    let mut best_area = 0u64;
    for size in sizes {
        let area = u64::from(size.width) * u64::from(size.height);
        if best.is_none() || area > best_area {
            best = Some(size);
            best_area = area;
        }
    }
    best
}

fn timestamp(unix_seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(unix_seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo_attachment(sizes: &[(u32, u32, &str)]) -> WallAttachment {
        WallAttachment {
            kind: "photo".into(),
            photo: Some(WallPhoto {
                sizes: sizes
                    .iter()
                    .map(|&(width, height, url)| PhotoSize {
                        width,
                        height,
                        url: url.into(),
                    })
                    .collect(),
            }),
        }
    }

    fn video_attachment() -> WallAttachment {
        WallAttachment {
            kind: "video".into(),
            photo: None,
        }
    }

    #[test]
    fn ad_posts_are_dropped() {
        let items = vec![WallItem {
            id: 1,
            text: "buy now".into(),
            marked_as_ads: 1,
            ..WallItem::default()
        }];
        assert!(parse_wall("main", items).is_empty());
    }

    #[test]
    fn empty_posts_are_dropped() {
        let items = vec![WallItem {
            id: 2,
            ..WallItem::default()
        }];
        assert!(parse_wall("main", items).is_empty());
    }

    #[test]
    fn video_only_posts_are_dropped() {
        let items = vec![WallItem {
            id: 3,
            text: "watch this".into(),
            attachments: vec![video_attachment()],
            ..WallItem::default()
        }];
        assert!(parse_wall("main", items).is_empty());
    }

    #[test]
    fn video_next_to_a_photo_is_ignored() {
        let items = vec![WallItem {
            id: 4,
            attachments: vec![video_attachment(), photo_attachment(&[(1, 1, "p")])],
            ..WallItem::default()
        }];
        let posts = parse_wall("main", items);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].photos, vec!["p".to_string()]);
    }

    #[test]
    fn largest_photo_variant_is_chosen() {
        let items = vec![WallItem {
            id: 5,
            attachments: vec![photo_attachment(&[(10, 20, "a"), (40, 30, "b")])],
            ..WallItem::default()
        }];
        let posts = parse_wall("main", items);
        assert_eq!(posts[0].photos, vec!["b".to_string()]);
    }

    #[test]
    fn equal_area_variants_keep_the_first() {
        let items = vec![WallItem {
            id: 6,
            attachments: vec![photo_attachment(&[(10, 20, "a"), (20, 10, "b")])],
            ..WallItem::default()
        }];
        let posts = parse_wall("main", items);
        assert_eq!(posts[0].photos, vec!["a".to_string()]);
    }

    #[test]
    fn photo_order_follows_attachment_order() {
        let items = vec![WallItem {
            id: 7,
            attachments: vec![
                photo_attachment(&[(1, 1, "first")]),
                photo_attachment(&[(1, 1, "second")]),
            ],
            ..WallItem::default()
        }];
        let posts = parse_wall("main", items);
        assert_eq!(
            posts[0].photos,
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn text_only_posts_are_kept() {
        let items = vec![WallItem {
            id: 8,
            owner_id: -42,
            date: 1_700_000_000,
            text: "plain words".into(),
            ..WallItem::default()
        }];
        let posts = parse_wall("main", items);
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.channel_name, "main");
        assert_eq!(post.vk_post_id, 8);
        assert_eq!(post.vk_group_id, -42);
        assert_eq!(post.content.as_deref(), Some("plain words"));
        assert_eq!(post.vk_post_date.timestamp(), 1_700_000_000);
        assert!(post.photos.is_empty());
    }
}
