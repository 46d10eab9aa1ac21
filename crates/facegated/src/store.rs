//! SQLite-backed user store and gallery export.

use facegate_core::{Embedding, Gallery, GalleryError, GalleryRecord};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    email      TEXT NOT NULL,
    embedding  TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("stored embedding for user {id} is corrupt: {source}")]
    CorruptEmbedding {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("embedding serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("gallery export failed: {0}")]
    Gallery(#[from] GalleryError),
    #[error("gallery export task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One enrolled user as stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub embedding: Embedding,
    pub created_at: String,
}

/// Handle to the user database; cheap to clone.
#[derive(Clone)]
pub struct UserStore {
    conn: Connection,
}

impl UserStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Insert a user and return its new id.
    pub async fn create_user(&self, email: &str, embedding: &Embedding) -> Result<i64, StoreError> {
        let email = email.to_string();
        let embedding_json = serde_json::to_string(embedding)?;
        let created_at = chrono::Utc::now().to_rfc3339();

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (email, embedding, created_at) VALUES (?1, ?2, ?3)",
                    params![email, embedding_json, created_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        tracing::info!(user_id = id, "user created");
        Ok(id)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, email, embedding, created_at FROM users WHERE id = ?1",
                        params![id],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(|(id, email, embedding, created_at)| {
            Ok(User {
                id,
                email,
                embedding: decode_embedding(id, &embedding)?,
                created_at,
            })
        })
        .transpose()
    }

    /// All users as gallery records, in id order.
    pub async fn gallery_records(&self) -> Result<Vec<GalleryRecord>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, email, embedding FROM users ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, email, embedding)| {
                Ok(GalleryRecord::new(id, decode_embedding(id, &embedding)?).with_email(email))
            })
            .collect()
    }

    /// Write every enrolled user to the gallery snapshot file.
    pub async fn export_gallery(&self, path: &Path) -> Result<usize, StoreError> {
        let gallery = Gallery::from_records(self.gallery_records().await?)?;
        let count = gallery.len();
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| GalleryError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            gallery.save(&path)
        })
        .await??;

        tracing::info!(records = count, "gallery exported");
        Ok(count)
    }
}

fn decode_embedding(id: i64, json: &str) -> Result<Embedding, StoreError> {
    serde_json::from_str(json).map_err(|source| StoreError::CorruptEmbedding { id, source })
}
