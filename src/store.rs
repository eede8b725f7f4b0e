//! Durable record of every post ever ingested.
//!
//! One SQLite table; photo and destination-id lists are stored as JSON
//! arrays. Rows are append-mostly: the only mutation is the one-way
//! `is_published` transition stamped by the publish pipeline. The schema is
//! applied on open, so a fresh database file is usable immediately.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row};

use crate::contract::{Message, NewPost};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS post (
        vk_post_id INTEGER PRIMARY KEY,
        vk_group_id INTEGER NOT NULL,
        channel_name TEXT NOT NULL,
        content TEXT,
        photos TEXT NOT NULL,
        vk_post_date INTEGER NOT NULL,
        date_added TEXT NOT NULL,
        is_published INTEGER NOT NULL DEFAULT 0,
        tg_post_ids TEXT,
        tg_chat_id INTEGER,
        tg_post_date TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_post_unpublished
        ON post(channel_name, is_published, vk_post_date);
"#;

/// One stored post row.
#[derive(Debug, Clone)]
pub struct Post {
    pub channel_name: String,
    pub vk_post_id: i64,
    pub vk_group_id: i64,
    pub content: Option<String>,
    pub photos: Vec<String>,
    pub vk_post_date: DateTime<Utc>,
    pub date_added: DateTime<Utc>,
    pub is_published: bool,
    pub tg_post_ids: Option<Vec<i64>>,
    pub tg_chat_id: Option<i64>,
    pub tg_post_date: Option<DateTime<Utc>>,
}

pub struct PostStore {
    conn: Connection,
}

impl PostStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening post store at {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("initialising post store schema")?;
        Ok(Self { conn })
    }

    /// Which of `vk_post_ids` are already stored, as one batched query.
    pub fn existing_post_ids(&self, vk_post_ids: &[i64]) -> Result<HashSet<i64>> {
        if vk_post_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; vk_post_ids.len()].join(",");
        let sql = format!("SELECT vk_post_id FROM post WHERE vk_post_id IN ({placeholders})");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(vk_post_ids.iter()), |row| {
            row.get::<_, i64>(0)
        })?;
        let mut known = HashSet::new();
        for row in rows {
            known.insert(row?);
        }
        Ok(known)
    }

    /// Inserts a freshly parsed post, unpublished, stamped with now.
    pub fn add_post(&self, post: &NewPost) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO post (
                vk_post_id, vk_group_id, channel_name, content,
                photos, vk_post_date, date_added, is_published
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
            "#,
            params![
                post.vk_post_id,
                post.vk_group_id,
                post.channel_name,
                post.content,
                serde_json::to_string(&post.photos)?,
                post.vk_post_date.timestamp(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Unpublished posts for a channel, oldest first, so the destination
    /// channel mirrors the source chronology.
    pub fn unpublished_posts(&self, channel_name: &str, limit: Option<usize>) -> Result<Vec<Post>> {
        let mut sql = String::from(
            r#"
            SELECT vk_post_id, vk_group_id, channel_name, content,
                   photos, vk_post_date, date_added, is_published,
                   tg_post_ids, tg_chat_id, tg_post_date
            FROM post
            WHERE channel_name = ?1 AND is_published = 0
            ORDER BY vk_post_date ASC
            "#,
        );
        if limit.is_some() {
            sql.push_str(" LIMIT ?2");
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let mut posts = Vec::new();
        match limit {
            Some(limit) => {
                let rows = stmt.query_map(params![channel_name, limit], row_to_post)?;
                for row in rows {
                    posts.push(row?);
                }
            }
            None => {
                let rows = stmt.query_map(params![channel_name], row_to_post)?;
                for row in rows {
                    posts.push(row?);
                }
            }
        }
        Ok(posts)
    }

    /// Flips the publish watermark and stamps the destination message ids.
    /// Called only after the send attempt has fully resolved.
    pub fn mark_published(
        &self,
        vk_post_id: i64,
        chat_id: i64,
        messages: &[Message],
    ) -> Result<()> {
        let message_ids: Vec<i64> = messages.iter().map(|m| m.message_id).collect();
        let published_at = messages.last().map(|m| m.date).unwrap_or_else(Utc::now);
        self.conn.execute(
            r#"
            UPDATE post
            SET is_published = 1,
                tg_post_ids = ?1,
                tg_chat_id = ?2,
                tg_post_date = ?3
            WHERE vk_post_id = ?4
            "#,
            params![
                serde_json::to_string(&message_ids)?,
                chat_id,
                published_at.to_rfc3339(),
                vk_post_id,
            ],
        )?;
        Ok(())
    }
}

fn row_to_post(row: &Row<'_>) -> rusqlite::Result<Post> {
    let photos_json: String = row.get(4)?;
    let photos = serde_json::from_str(&photos_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let tg_post_ids = row
        .get::<_, Option<String>>(8)?
        .map(|json| {
            serde_json::from_str::<Vec<i64>>(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e))
            })
        })
        .transpose()?;
    Ok(Post {
        vk_post_id: row.get(0)?,
        vk_group_id: row.get(1)?,
        channel_name: row.get(2)?,
        content: row.get(3)?,
        photos,
        vk_post_date: parse_unix(row, 5)?,
        date_added: parse_rfc3339(row, 6, row.get(6)?)?,
        is_published: row.get::<_, i64>(7)? != 0,
        tg_post_ids,
        tg_chat_id: row.get(9)?,
        tg_post_date: row
            .get::<_, Option<String>>(10)?
            .map(|text| parse_rfc3339(row, 10, text))
            .transpose()?,
    })
}

fn parse_unix(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let seconds: i64 = row.get(index)?;
    Ok(Utc
        .timestamp_opt(seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
}

fn parse_rfc3339(_row: &Row<'_>, index: usize, text: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}
