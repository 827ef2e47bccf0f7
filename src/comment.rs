//! Comment store port
//!
//! Comments belong to the host application. The pipeline reads one comment
//! (plus the text of the comment it answers) and writes back only its status
//! and deleted flag.

use crate::db;
use crate::error::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    Pending,
    Approved,
    Blocked,
}

impl CommentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentStatus::Pending => "pending",
            CommentStatus::Approved => "approved",
            CommentStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommentStatus::Pending),
            "approved" => Some(CommentStatus::Approved),
            "blocked" => Some(CommentStatus::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for CommentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    /// Markup as submitted by the author
    pub content: String,
    pub author_id: String,
    /// What the thread hangs off, e.g. `galgame`
    pub source: String,
    pub source_id: String,
    pub parent_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub status: CommentStatus,
    pub is_deleted: bool,
}

impl Comment {
    pub fn new(id: &str, author_id: &str, source: &str, source_id: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            content: content.to_string(),
            author_id: author_id.to_string(),
            source: source.to_string(),
            source_id: source_id.to_string(),
            parent_id: None,
            reply_to_id: None,
            status: CommentStatus::Pending,
            is_deleted: false,
        }
    }
}

/// A comment with the markup of the comment it answers: the reply-to target
/// if set, otherwise the thread parent.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread {
    pub comment: Comment,
    pub ancestor_content: Option<String>,
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Comment>>;
    async fn get_with_ancestor(&self, id: &str) -> Result<Option<CommentThread>>;
    async fn update_visibility(&self, id: &str, status: CommentStatus, is_deleted: bool)
        -> Result<()>;
}

/// Comment store over the host application's `comments` table.
pub struct SqliteCommentStore {
    conn: Mutex<Connection>,
}

const COMMENT_COLUMNS: &str =
    "c.id, c.content, c.author_id, c.source, c.source_id, c.parent_id, c.reply_to_id, c.status, c.is_deleted";

impl SqliteCommentStore {
    pub fn open(path: &str) -> Result<Self> {
        Self::from_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(db::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS comments (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                author_id TEXT NOT NULL,
                source TEXT NOT NULL,
                source_id TEXT NOT NULL,
                parent_id TEXT,
                reply_to_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                is_deleted INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a comment. The host application normally owns writes;
    /// this exists for seeding and tooling.
    pub fn insert(&self, comment: &Comment) -> Result<()> {
        let conn = db::lock(&self.conn);
        conn.execute(
            "INSERT OR REPLACE INTO comments
             (id, content, author_id, source, source_id, parent_id, reply_to_id, status, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                comment.id,
                comment.content,
                comment.author_id,
                comment.source,
                comment.source_id,
                comment.parent_id,
                comment.reply_to_id,
                comment.status.as_str(),
                comment.is_deleted,
            ],
        )?;
        Ok(())
    }

    fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
        let id: String = row.get(0)?;
        let raw_status: String = row.get(7)?;
        let status = CommentStatus::parse(&raw_status).unwrap_or_else(|| {
            log::warn!("Comment {id} has unknown status '{raw_status}', treating it as pending");
            CommentStatus::Pending
        });
        Ok(Comment {
            id,
            content: row.get(1)?,
            author_id: row.get(2)?,
            source: row.get(3)?,
            source_id: row.get(4)?,
            parent_id: row.get(5)?,
            reply_to_id: row.get(6)?,
            status,
            is_deleted: row.get(8)?,
        })
    }
}

#[async_trait]
impl CommentStore for SqliteCommentStore {
    async fn get(&self, id: &str) -> Result<Option<Comment>> {
        let conn = db::lock(&self.conn);
        let comment = conn
            .query_row(
                &format!("SELECT {COMMENT_COLUMNS} FROM comments c WHERE c.id = ?1"),
                params![id],
                Self::comment_from_row,
            )
            .optional()?;
        Ok(comment)
    }

    async fn get_with_ancestor(&self, id: &str) -> Result<Option<CommentThread>> {
        let conn = db::lock(&self.conn);
        let thread = conn
            .query_row(
                &format!(
                    "SELECT {COMMENT_COLUMNS}, COALESCE(r.content, p.content)
                     FROM comments c
                     LEFT JOIN comments r ON r.id = c.reply_to_id
                     LEFT JOIN comments p ON p.id = c.parent_id
                     WHERE c.id = ?1"
                ),
                params![id],
                |row| {
                    Ok(CommentThread {
                        comment: Self::comment_from_row(row)?,
                        ancestor_content: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(thread)
    }

    async fn update_visibility(
        &self,
        id: &str,
        status: CommentStatus,
        is_deleted: bool,
    ) -> Result<()> {
        let conn = db::lock(&self.conn);
        let updated = conn.execute(
            "UPDATE comments SET status = ?1, is_deleted = ?2 WHERE id = ?3",
            params![status.as_str(), is_deleted, id],
        )?;
        if updated == 0 {
            log::warn!("Comment {id} vanished before its visibility could be updated");
        }
        Ok(())
    }
}
