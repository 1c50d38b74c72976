use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{DocumentId, ProcessingState, UserId};

/// Client-side persistent state: who is signed in, the bearer credential,
/// the last-selected document and a minimal document manifest. Binary
/// document content is never written here.
#[derive(Clone)]
pub struct SessionStorage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub user_id: UserId,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub document_id: DocumentId,
    pub name: String,
    pub uploaded_at: DateTime<Utc>,
    pub page_count: Option<u32>,
    pub status: ProcessingState,
}

impl SessionStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity (
                slot         INTEGER PRIMARY KEY CHECK (slot = 0),
                user_id      INTEGER NOT NULL,
                email        TEXT NOT NULL,
                display_name TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure identity table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credential (
                slot       INTEGER PRIMARY KEY CHECK (slot = 0),
                token      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure credential table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reading_state (
                slot                 INTEGER PRIMARY KEY CHECK (slot = 0),
                selected_document_id INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure reading_state table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_manifest (
                document_id INTEGER PRIMARY KEY,
                name        TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                page_count  INTEGER,
                status      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure document_manifest table exists")?;

        Ok(())
    }

    pub async fn save_identity(&self, identity: &StoredIdentity) -> Result<()> {
        sqlx::query(
            "INSERT INTO identity (slot, user_id, email, display_name) VALUES (0, ?, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET
                 user_id=excluded.user_id,
                 email=excluded.email,
                 display_name=excluded.display_name",
        )
        .bind(identity.user_id.0)
        .bind(&identity.email)
        .bind(&identity.display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_identity(&self) -> Result<Option<StoredIdentity>> {
        let row = sqlx::query("SELECT user_id, email, display_name FROM identity WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredIdentity {
            user_id: UserId(r.get::<i64, _>(0)),
            email: r.get::<String, _>(1),
            display_name: r.get::<Option<String>, _>(2),
        }))
    }

    pub async fn clear_identity(&self) -> Result<()> {
        sqlx::query("DELETE FROM identity WHERE slot = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_credential(&self, token: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO credential (slot, token, updated_at) VALUES (0, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(slot) DO UPDATE SET token=excluded.token, updated_at=CURRENT_TIMESTAMP",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_credential(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT token FROM credential WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn clear_credential(&self) -> Result<()> {
        sqlx::query("DELETE FROM credential WHERE slot = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_selected(&self, document_id: Option<DocumentId>) -> Result<()> {
        sqlx::query(
            "INSERT INTO reading_state (slot, selected_document_id) VALUES (0, ?)
             ON CONFLICT(slot) DO UPDATE SET selected_document_id=excluded.selected_document_id",
        )
        .bind(document_id.map(|id| id.0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_selected(&self) -> Result<Option<DocumentId>> {
        let row = sqlx::query("SELECT selected_document_id FROM reading_state WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<i64>, _>(0))
            .map(DocumentId))
    }

    pub async fn upsert_manifest_entry(&self, entry: &ManifestEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO document_manifest (document_id, name, uploaded_at, page_count, status)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(document_id) DO UPDATE SET
                 name=excluded.name,
                 uploaded_at=excluded.uploaded_at,
                 page_count=excluded.page_count,
                 status=excluded.status",
        )
        .bind(entry.document_id.0)
        .bind(&entry.name)
        .bind(entry.uploaded_at.to_rfc3339())
        .bind(entry.page_count.map(|n| n as i64))
        .bind(status_to_str(entry.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_manifest_entry(&self, document_id: DocumentId) -> Result<()> {
        sqlx::query("DELETE FROM document_manifest WHERE document_id = ?")
            .bind(document_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_manifest(&self) -> Result<Vec<ManifestEntry>> {
        let rows = sqlx::query(
            "SELECT document_id, name, uploaded_at, page_count, status
             FROM document_manifest
             ORDER BY uploaded_at ASC, document_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let uploaded_at: String = row.get(2);
            let uploaded_at = DateTime::parse_from_rfc3339(&uploaded_at)
                .with_context(|| format!("invalid manifest timestamp '{uploaded_at}'"))?
                .with_timezone(&Utc);
            entries.push(ManifestEntry {
                document_id: DocumentId(row.get::<i64, _>(0)),
                name: row.get::<String, _>(1),
                uploaded_at,
                page_count: row.get::<Option<i64>, _>(3).map(|n| n as u32),
                status: status_from_str(&row.get::<String, _>(4)),
            });
        }
        Ok(entries)
    }
}

fn status_to_str(status: ProcessingState) -> &'static str {
    match status {
        ProcessingState::Pending => "pending",
        ProcessingState::Completed => "completed",
        ProcessingState::Error => "error",
    }
}

fn status_from_str(status: &str) -> ProcessingState {
    match status {
        "completed" => ProcessingState::Completed,
        "error" => ProcessingState::Error,
        _ => ProcessingState::Pending,
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create storage dir {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
