//! Stored results of successful image descriptions.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::common::{PageQuery, Paginated};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ImageDescription {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub description: String,
    pub confidence: Option<f64>,
    /// Which describer produced the text: `ideogram` or `fallback`
    pub source: String,
    pub file_size: i64,
    pub mime_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewImageDescription<'a> {
    pub user_id: &'a str,
    pub filename: &'a str,
    pub description: &'a str,
    pub confidence: Option<f64>,
    pub source: &'a str,
    pub file_size: i64,
    pub mime_type: &'a str,
}

pub async fn insert_description(
    conn: &mut SqliteConnection,
    new: &NewImageDescription<'_>,
) -> Result<ImageDescription, sqlx::Error> {
    let record = ImageDescription {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: new.user_id.to_string(),
        filename: new.filename.to_string(),
        description: new.description.to_string(),
        confidence: new.confidence,
        source: new.source.to_string(),
        file_size: new.file_size,
        mime_type: new.mime_type.to_string(),
        created_at: crate::db::now(),
    };

    sqlx::query(
        "INSERT INTO image_descriptions
            (id, user_id, filename, description, confidence, source, file_size, mime_type, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(&record.filename)
    .bind(&record.description)
    .bind(record.confidence)
    .bind(&record.source)
    .bind(record.file_size)
    .bind(&record.mime_type)
    .bind(&record.created_at)
    .execute(conn)
    .await?;

    Ok(record)
}

pub async fn list_user_descriptions(
    db: &SqlitePool,
    user_id: &str,
    page: &PageQuery,
) -> Result<Paginated<ImageDescription>, sqlx::Error> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM image_descriptions WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(db)
        .await?;

    let items = sqlx::query_as::<_, ImageDescription>(
        "SELECT * FROM image_descriptions WHERE user_id = ?
         ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(page.per_page())
    .bind(page.offset())
    .fetch_all(db)
    .await?;

    Ok(Paginated::new(items, total, page))
}

/// Lookup scoped to the owner so users cannot read each other's records
pub async fn find_user_description(
    db: &SqlitePool,
    user_id: &str,
    id: &str,
) -> Result<Option<ImageDescription>, sqlx::Error> {
    sqlx::query_as::<_, ImageDescription>(
        "SELECT * FROM image_descriptions WHERE id = ? AND user_id = ?",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(db)
    .await
}
