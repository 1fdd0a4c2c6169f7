//! SQLite pool setup and schema creation.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create documents table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            category TEXT NOT NULL,
            uploader_role TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tenant, category, uploader and timestamp are denormalized onto each
    // chunk so query-time filtering never joins back to documents.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            tenant_id TEXT NOT NULL,
            category TEXT NOT NULL,
            uploader_role TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            text TEXT NOT NULL,
            span_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per (chunk, embedding provider). Vectors from different
    // providers are never compared against each other.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            PRIMARY KEY (chunk_id, provider_id),
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_records (
            id TEXT PRIMARY KEY,
            query_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            persona_id TEXT NOT NULL,
            decision TEXT NOT NULL,
            provider_used TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            record_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Escalations are idempotent per (query_id, minute bucket); retried
    // submissions land on the primary key and are ignored.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS escalations (
            query_id TEXT NOT NULL,
            bucket INTEGER NOT NULL,
            tenant_id TEXT NOT NULL,
            persona_id TEXT NOT NULL,
            reason TEXT NOT NULL,
            query_text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (query_id, bucket)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_tenant_category ON chunks(tenant_id, category)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_tenant_ts ON audit_records(tenant_id, timestamp DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
