// =============================================================================
// State Store — TTL-indexed persistent QR → commerce-state mapping
// =============================================================================
//
// Backed by a pooled SQLite connection (concurrent readers, one writer is
// plenty at POS rate). Every operation is one transaction: the whole batch
// commits or none of it does. On open, a legacy `tag_id` column is migrated
// to the canonical `qr_code` schema — the migration is idempotent, so
// opening an already-migrated file is a no-op.
// =============================================================================

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::types::TagState;

const SCHEMA_TAG_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS tag_state (
    qr_code       TEXT PRIMARY KEY,
    state         TEXT NOT NULL,
    order_id      TEXT,
    pos_id        TEXT,
    store_id      TEXT,
    updated_at    INTEGER NOT NULL,
    expires_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tag_state_expires_at ON tag_state(expires_at);
CREATE INDEX IF NOT EXISTS idx_tag_state_state ON tag_state(state);
CREATE INDEX IF NOT EXISTS idx_tag_state_order_id ON tag_state(order_id);
"#;

/// A single row of the `tag_state` table.
#[derive(Debug, Clone, Serialize)]
pub struct TagRow {
    pub qr_code: String,
    pub state: TagState,
    pub order_id: Option<String>,
    pub pos_id: Option<String>,
    pub store_id: Option<String>,
    pub updated_at: i64,
    pub expires_at: i64,
}

fn row_to_tag(row: SqliteRow) -> Result<TagRow, sqlx::Error> {
    let state_str: String = row.try_get("state")?;
    let state = state_str.parse::<TagState>().map_err(|e| {
        sqlx::Error::Decode(Box::<dyn std::error::Error + Send + Sync>::from(e))
    })?;
    Ok(TagRow {
        qr_code: row.try_get("qr_code")?,
        state,
        order_id: row.try_get("order_id")?,
        pos_id: row.try_get("pos_id")?,
        store_id: row.try_get("store_id")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

/// Counts of non-expired rows by state.
#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct TagCounts {
    pub in_cart_count: i64,
    pub paid_count: i64,
}

pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (creating if needed) the SQLite file at `path`, running schema
    /// migration before establishing the canonical tables.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    sqlx::Error::Io(std::io::Error::new(e.kind(), e.to_string()))
                })?;
            }
        }

        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        migrate_tag_state(&pool).await?;
        sqlx::query(SCHEMA_TAG_STATE).execute(&pool).await?;

        info!(path = %path.display(), "state store opened");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect("sqlite::memory:")
            .await?;
        migrate_tag_state(&pool).await?;
        sqlx::query(SCHEMA_TAG_STATE).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Return the row for `qr` iff it exists and has not expired by `now`.
    pub async fn get(&self, qr: &str, now: i64) -> Result<Option<TagRow>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM tag_state WHERE qr_code = ? AND expires_at >= ?")
            .bind(qr)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_tag).transpose()
    }

    /// Conditionally write IN_CART rows: a row already PAID and unexpired is
    /// left untouched and counted as `ignored_paid`; everything else is
    /// written (or refreshed) as IN_CART.
    pub async fn upsert_in_cart(
        &self,
        qrs: &[String],
        order_id: &str,
        pos_id: &str,
        store_id: &str,
        ttl_seconds: i64,
    ) -> Result<(i64, i64), sqlx::Error> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_seconds;
        let mut tx = self.pool.begin().await?;
        let mut upserted = 0i64;
        let mut ignored_paid = 0i64;

        for qr in qrs {
            let existing = sqlx::query("SELECT state FROM tag_state WHERE qr_code = ? AND expires_at >= ?")
                .bind(qr)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;

            if let Some(row) = &existing {
                let state: String = row.try_get("state")?;
                if state == "PAID" {
                    ignored_paid += 1;
                    continue;
                }
            }

            sqlx::query(
                "INSERT INTO tag_state (qr_code, state, order_id, pos_id, store_id, updated_at, expires_at) \
                 VALUES (?, 'IN_CART', ?, ?, ?, ?, ?) \
                 ON CONFLICT(qr_code) DO UPDATE SET \
                   state = excluded.state, order_id = excluded.order_id, pos_id = excluded.pos_id, \
                   store_id = excluded.store_id, updated_at = excluded.updated_at, expires_at = excluded.expires_at \
                 WHERE tag_state.state != 'PAID'",
            )
            .bind(qr)
            .bind(order_id)
            .bind(pos_id)
            .bind(store_id)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
            upserted += 1;
        }

        tx.commit().await?;
        Ok((upserted, ignored_paid))
    }

    /// Unconditionally write PAID rows, superseding any prior state.
    pub async fn upsert_paid(
        &self,
        qrs: &[String],
        order_id: &str,
        pos_id: &str,
        store_id: &str,
        ttl_seconds: i64,
    ) -> Result<i64, sqlx::Error> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_seconds;
        let mut tx = self.pool.begin().await?;

        for qr in qrs {
            sqlx::query(
                "INSERT INTO tag_state (qr_code, state, order_id, pos_id, store_id, updated_at, expires_at) \
                 VALUES (?, 'PAID', ?, ?, ?, ?, ?) \
                 ON CONFLICT(qr_code) DO UPDATE SET \
                   state = excluded.state, order_id = excluded.order_id, pos_id = excluded.pos_id, \
                   store_id = excluded.store_id, updated_at = excluded.updated_at, expires_at = excluded.expires_at",
            )
            .bind(qr)
            .bind(order_id)
            .bind(pos_id)
            .bind(store_id)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(qrs.len() as i64)
    }

    /// Delete rows matching `qrs`, optionally scoped further by `order_id`.
    pub async fn remove(&self, qrs: &[String], order_id: Option<&str>) -> Result<i64, sqlx::Error> {
        if qrs.is_empty() {
            return Ok(0);
        }
        let placeholders = qrs.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = match order_id {
            Some(_) => format!(
                "DELETE FROM tag_state WHERE qr_code IN ({placeholders}) AND order_id = ?"
            ),
            None => format!("DELETE FROM tag_state WHERE qr_code IN ({placeholders})"),
        };

        let mut query = sqlx::query(&sql);
        for qr in qrs {
            query = query.bind(qr);
        }
        if let Some(oid) = order_id {
            query = query.bind(oid);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() as i64)
    }

    /// Delete all rows that have expired as of `now`.
    pub async fn cleanup(&self, now: i64) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tag_state WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() as i64;
        if deleted > 0 {
            info!(deleted, "expired tag_state rows cleaned up");
        }
        Ok(deleted)
    }

    /// Counts of non-expired rows grouped by state.
    pub async fn counts(&self, now: i64) -> Result<TagCounts, sqlx::Error> {
        let rows = sqlx::query("SELECT state, COUNT(*) as n FROM tag_state WHERE expires_at >= ? GROUP BY state")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        let mut counts = TagCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match state.as_str() {
                "IN_CART" => counts.in_cart_count = n,
                "PAID" => counts.paid_count = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

/// Rename-recreate-copy migration from the legacy `tag_id` column to the
/// canonical `qr_code` schema. Idempotent: a no-op if the table is already
/// canonical or does not yet exist.
async fn migrate_tag_state(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let exists: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name='tag_state'")
            .fetch_optional(pool)
            .await?;
    if exists.is_none() {
        return Ok(());
    }

    let columns = sqlx::query("PRAGMA table_info(tag_state)")
        .fetch_all(pool)
        .await?;
    let names: Vec<String> = columns
        .iter()
        .map(|r| r.try_get::<String, _>("name"))
        .collect::<Result<_, _>>()?;

    let has_tag_id = names.iter().any(|n| n == "tag_id");
    let has_qr_code = names.iter().any(|n| n == "qr_code");

    if has_tag_id && !has_qr_code {
        warn!("migrating legacy tag_state schema (tag_id -> qr_code)");
        let mut tx = pool.begin().await?;
        sqlx::query("ALTER TABLE tag_state RENAME TO tag_state_old")
            .execute(&mut *tx)
            .await?;
        sqlx::query(SCHEMA_TAG_STATE).execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO tag_state (qr_code, state, order_id, pos_id, store_id, updated_at, expires_at) \
             SELECT tag_id, state, order_id, pos_id, store_id, updated_at, expires_at FROM tag_state_old",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DROP TABLE tag_state_old")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("legacy tag_state migration complete");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qrs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn in_cart_then_lookup_roundtrips() {
        let store = StateStore::open_in_memory().await.unwrap();
        let now = Utc::now().timestamp();
        let (upserted, ignored) = store
            .upsert_in_cart(&qrs(&["ABC1234"]), "O1", "POS1", "S1", 3600)
            .await
            .unwrap();
        assert_eq!(upserted, 1);
        assert_eq!(ignored, 0);

        let row = store.get("ABC1234", now).await.unwrap().unwrap();
        assert_eq!(row.state, TagState::InCart);
        assert_eq!(row.order_id.as_deref(), Some("O1"));
    }

    #[tokio::test]
    async fn paid_supersedes_in_cart_and_blocks_further_in_cart_writes() {
        let store = StateStore::open_in_memory().await.unwrap();
        store
            .upsert_in_cart(&qrs(&["X"]), "O1", "POS1", "S1", 3600)
            .await
            .unwrap();
        store
            .upsert_paid(&qrs(&["X"]), "O1", "POS1", "S1", 86400)
            .await
            .unwrap();

        let now = Utc::now().timestamp();
        let row = store.get("X", now).await.unwrap().unwrap();
        assert_eq!(row.state, TagState::Paid);

        let (upserted, ignored) = store
            .upsert_in_cart(&qrs(&["X"]), "O2", "POS1", "S1", 3600)
            .await
            .unwrap();
        assert_eq!(upserted, 0);
        assert_eq!(ignored, 1);

        let row = store.get("X", now).await.unwrap().unwrap();
        assert_eq!(row.state, TagState::Paid);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_rows() {
        let store = StateStore::open_in_memory().await.unwrap();
        store
            .upsert_in_cart(&qrs(&["EXPIRED"]), "O1", "POS1", "S1", -10)
            .await
            .unwrap();
        store
            .upsert_in_cart(&qrs(&["FRESH"]), "O1", "POS1", "S1", 3600)
            .await
            .unwrap();

        let now = Utc::now().timestamp();
        let deleted = store.cleanup(now).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("EXPIRED", now).await.unwrap().is_none());
        assert!(store.get("FRESH", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_deletes_matching_rows_scoped_by_order() {
        let store = StateStore::open_in_memory().await.unwrap();
        store
            .upsert_in_cart(&qrs(&["A", "B"]), "O1", "POS1", "S1", 3600)
            .await
            .unwrap();

        let deleted = store.remove(&qrs(&["A", "B"]), Some("O2")).await.unwrap();
        assert_eq!(deleted, 0);

        let deleted = store.remove(&qrs(&["A"]), Some("O1")).await.unwrap();
        assert_eq!(deleted, 1);

        let now = Utc::now().timestamp();
        assert!(store.get("A", now).await.unwrap().is_none());
        assert!(store.get("B", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn counts_reflect_non_expired_state() {
        let store = StateStore::open_in_memory().await.unwrap();
        store
            .upsert_in_cart(&qrs(&["A", "B"]), "O1", "POS1", "S1", 3600)
            .await
            .unwrap();
        store
            .upsert_paid(&qrs(&["C"]), "O1", "POS1", "S1", 86400)
            .await
            .unwrap();

        let now = Utc::now().timestamp();
        let counts = store.counts(now).await.unwrap();
        assert_eq!(counts.in_cart_count, 2);
        assert_eq!(counts.paid_count, 1);
    }
}
