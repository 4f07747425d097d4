use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create projects table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            repo_url TEXT NOT NULL,
            default_branch TEXT NOT NULL,
            selected_branch TEXT,
            last_revision TEXT,
            last_kb_scan_id TEXT,
            exclusion_rules_version TEXT,
            total_files INTEGER NOT NULL DEFAULT 0,
            total_lines INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            current_stage TEXT,
            stage_percent INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            stack_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            scanned_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create scans table (append-only history)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scans (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            trigger TEXT NOT NULL,
            is_incremental INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            current_stage TEXT,
            stage_percent INTEGER NOT NULL DEFAULT 0,
            from_revision TEXT,
            to_revision TEXT,
            scanner_version TEXT NOT NULL,
            exclusion_rules_version TEXT NOT NULL,
            files_scanned INTEGER NOT NULL DEFAULT 0,
            files_excluded INTEGER NOT NULL DEFAULT 0,
            chunks_produced INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER,
            stage_timings_json TEXT NOT NULL DEFAULT '{}',
            kb_scan_id TEXT,
            kb_valid INTEGER,
            warnings_json TEXT NOT NULL DEFAULT '[]',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            payload_json TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create files table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            path TEXT NOT NULL,
            extension TEXT NOT NULL,
            language TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            line_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            is_binary INTEGER NOT NULL,
            is_excluded INTEGER NOT NULL,
            exclusion_reason TEXT,
            framework_hints_json TEXT NOT NULL DEFAULT '[]',
            symbols_declared_json TEXT NOT NULL DEFAULT '[]',
            imports_json TEXT NOT NULL DEFAULT '[]',
            modified_at INTEGER NOT NULL,
            rules_version TEXT NOT NULL,
            UNIQUE(project_id, path),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            project_id TEXT NOT NULL,
            id TEXT NOT NULL,
            file_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            is_complete_file INTEGER NOT NULL,
            byte_count INTEGER NOT NULL,
            line_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            content TEXT NOT NULL,
            symbols_declared_json TEXT NOT NULL DEFAULT '[]',
            symbols_used_json TEXT NOT NULL DEFAULT '[]',
            imports_json TEXT NOT NULL DEFAULT '[]',
            refs_json TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (project_id, id),
            UNIQUE(file_id, chunk_index),
            FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create webhook dedup table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trigger_dedup (
            project_id TEXT NOT NULL,
            trigger TEXT NOT NULL,
            last_fired_at INTEGER NOT NULL,
            PRIMARY KEY (project_id, trigger)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one running scan per project
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_scans_one_running ON scans(project_id) WHERE status = 'running'",
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scans_project ON scans(project_id, id DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_order ON chunks(project_id, path, start_line)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
