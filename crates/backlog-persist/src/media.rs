//! Media domain data access used by background tasks
//!
//! Every method goes through [`Database::client`], so it joins the caller's
//! transaction when there is one.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::error::StorageError;
use crate::scope::Database;

/// A tracked title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: i64,
    pub media_type: String,
    pub external_id: String,
    pub title: String,
    pub locked: bool,
    pub release_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewMedia {
    pub media_type: String,
    pub external_id: String,
    pub title: String,
    pub release_date: Option<NaiveDate>,
}

/// One tier of an achievement ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Achievement {
    pub name: String,
    pub tier: u32,
    pub threshold: u32,
    pub description: String,
}

/// A row of a user's list, as imported from a file
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedEntry {
    pub external_id: String,
    pub title: String,
    pub status: String,
    pub rating: Option<f64>,
}

/// What deleting a user removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedUser {
    pub list_entries: u64,
    pub account: bool,
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    db: Database,
}

fn date_from_row(value: Option<String>) -> Result<Option<NaiveDate>, StorageError> {
    value
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| StorageError::Serialization(format!("bad release date {}: {}", s, e)))
        })
        .transpose()
}

impl MediaStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert_user(&self, id: &str, username: &str) -> Result<(), StorageError> {
        self.db
            .client()
            .execute(
                sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, ?)")
                    .bind(id)
                    .bind(username)
                    .bind(Utc::now().timestamp_millis()),
            )
            .await?;
        Ok(())
    }

    pub async fn user_exists(&self, id: &str) -> Result<bool, StorageError> {
        let row = self
            .db
            .client()
            .fetch_optional(sqlx::query("SELECT 1 FROM users WHERE id = ?").bind(id))
            .await?;
        Ok(row.is_some())
    }

    /// Insert a title, or return the id of the existing one with the same external id
    pub async fn upsert_media(&self, media: &NewMedia) -> Result<i64, StorageError> {
        let row = self
            .db
            .client()
            .fetch_one(
                sqlx::query(
                    r#"
                    INSERT INTO media (media_type, external_id, title, release_date, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT (media_type, external_id) DO UPDATE SET title = media.title
                    RETURNING id
                    "#,
                )
                .bind(&media.media_type)
                .bind(&media.external_id)
                .bind(&media.title)
                .bind(media.release_date.map(|d| d.format("%Y-%m-%d").to_string()))
                .bind(Utc::now().timestamp_millis()),
            )
            .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn get_media(&self, id: i64) -> Result<Option<MediaRecord>, StorageError> {
        let row = self
            .db
            .client()
            .fetch_optional(
                sqlx::query(
                    "SELECT id, media_type, external_id, title, locked, release_date FROM media WHERE id = ?",
                )
                .bind(id),
            )
            .await?;

        row.map(|row| {
            Ok(MediaRecord {
                id: row.try_get("id")?,
                media_type: row.try_get("media_type")?,
                external_id: row.try_get("external_id")?,
                title: row.try_get("title")?,
                locked: row.try_get("locked")?,
                release_date: date_from_row(row.try_get("release_date")?)?,
            })
        })
        .transpose()
    }

    /// Lock unlocked movies released before `cutoff`; returns how many were locked
    pub async fn lock_movies_released_before(&self, cutoff: NaiveDate) -> Result<u64, StorageError> {
        let result = self
            .db
            .client()
            .execute(
                sqlx::query(
                    "UPDATE media SET locked = 1 \
                     WHERE media_type = 'movie' AND locked = 0 \
                     AND release_date IS NOT NULL AND release_date < ?",
                )
                .bind(cutoff.format("%Y-%m-%d").to_string()),
            )
            .await?;
        Ok(result.rows_affected())
    }

    /// Insert or refresh each tier; running it again changes nothing
    pub async fn upsert_achievements(&self, tiers: &[Achievement]) -> Result<u64, StorageError> {
        let client = self.db.client();
        let mut written = 0;
        for tier in tiers {
            let result = client
                .execute(
                    sqlx::query(
                        r#"
                        INSERT INTO achievements (name, tier, threshold, description)
                        VALUES (?, ?, ?, ?)
                        ON CONFLICT (name, tier) DO UPDATE SET
                            threshold = excluded.threshold,
                            description = excluded.description
                        "#,
                    )
                    .bind(&tier.name)
                    .bind(i64::from(tier.tier))
                    .bind(i64::from(tier.threshold))
                    .bind(&tier.description),
                )
                .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    pub async fn count_achievements(&self) -> Result<i64, StorageError> {
        let row = self
            .db
            .client()
            .fetch_one(sqlx::query("SELECT COUNT(*) AS n FROM achievements"))
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Unlocked titles of one type due for a refresh, least recently refreshed first
    pub async fn media_for_refresh(
        &self,
        media_type: &str,
        external_ids: Option<&[String]>,
        limit: u32,
    ) -> Result<Vec<MediaRecord>, StorageError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, media_type, external_id, title, locked, release_date \
             FROM media WHERE locked = 0 AND media_type = ",
        );
        query.push_bind(media_type);

        if let Some(ids) = external_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            query.push(" AND external_id IN (");
            let mut list = query.separated(", ");
            for id in ids {
                list.push_bind(id.as_str());
            }
            list.push_unseparated(")");
        }

        query.push(" ORDER BY COALESCE(refreshed_at, 0) ASC, id ASC LIMIT ");
        query.push_bind(i64::from(limit));

        let rows = self.db.client().fetch_all(query.build()).await?;
        rows.iter()
            .map(|row| -> Result<MediaRecord, StorageError> {
                Ok(MediaRecord {
                    id: row.try_get("id")?,
                    media_type: row.try_get("media_type")?,
                    external_id: row.try_get("external_id")?,
                    title: row.try_get("title")?,
                    locked: row.try_get("locked")?,
                    release_date: date_from_row(row.try_get("release_date")?)?,
                })
            })
            .collect()
    }

    /// Store a fetched payload; locked titles are left alone
    pub async fn apply_refresh(
        &self,
        id: i64,
        title: Option<&str>,
        release_date: Option<NaiveDate>,
        payload: &serde_json::Value,
    ) -> Result<bool, StorageError> {
        let result = self
            .db
            .client()
            .execute(
                sqlx::query(
                    r#"
                    UPDATE media SET
                        title = COALESCE(?, title),
                        release_date = COALESCE(?, release_date),
                        payload = ?,
                        refreshed_at = ?
                    WHERE id = ? AND locked = 0
                    "#,
                )
                .bind(title)
                .bind(release_date.map(|d| d.format("%Y-%m-%d").to_string()))
                .bind(serde_json::to_string(payload)?)
                .bind(Utc::now().timestamp_millis())
                .bind(id),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a user's list and then the account
    pub async fn delete_user(&self, user_id: &str) -> Result<DeletedUser, StorageError> {
        let client = self.db.client();
        let entries = client
            .execute(sqlx::query("DELETE FROM list_entries WHERE user_id = ?").bind(user_id))
            .await?;
        let account = client
            .execute(sqlx::query("DELETE FROM users WHERE id = ?").bind(user_id))
            .await?;
        Ok(DeletedUser {
            list_entries: entries.rows_affected(),
            account: account.rows_affected() > 0,
        })
    }

    /// Add imported rows to a user's list; re-importing updates status and rating
    pub async fn import_entries(
        &self,
        user_id: &str,
        media_type: &str,
        entries: &[ImportedEntry],
    ) -> Result<u64, StorageError> {
        let client = self.db.client();
        let mut imported = 0;
        for entry in entries {
            let media_id = self
                .upsert_media(&NewMedia {
                    media_type: media_type.to_string(),
                    external_id: entry.external_id.clone(),
                    title: entry.title.clone(),
                    release_date: None,
                })
                .await?;

            client
                .execute(
                    sqlx::query(
                        r#"
                        INSERT INTO list_entries (user_id, media_id, status, rating, added_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT (user_id, media_id) DO UPDATE SET
                            status = excluded.status,
                            rating = excluded.rating
                        "#,
                    )
                    .bind(user_id)
                    .bind(media_id)
                    .bind(&entry.status)
                    .bind(entry.rating)
                    .bind(Utc::now().timestamp_millis()),
                )
                .await?;
            imported += 1;
        }
        Ok(imported)
    }

    pub async fn count_list_entries(&self, user_id: &str) -> Result<i64, StorageError> {
        let row = self
            .db
            .client()
            .fetch_one(
                sqlx::query("SELECT COUNT(*) AS n FROM list_entries WHERE user_id = ?").bind(user_id),
            )
            .await?;
        Ok(row.try_get("n")?)
    }
}
