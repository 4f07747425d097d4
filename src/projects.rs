//! Project registry and scan state transitions.
//!
//! All transitions are single SQL statements or short transactions, so
//! several `kb` processes sharing one database agree on which of them owns
//! a project's running scan:
//!
//! ```text
//! project:  pending|ready|failed --try_start_scan--> scanning
//!           scanning --complete_scan--> ready
//!           scanning --fail_scan--> failed
//! scan:     running --> completed | failed
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db::{self, to_json_list};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Project, ProjectStatus, Scan, ScanStatus, Trigger};

static SLUG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("valid slug regex"));

/// Registration input.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: String,
    pub repo_url: String,
    pub default_branch: String,
    pub selected_branch: Option<String>,
}

pub fn validate_slug(id: &str) -> PipelineResult<()> {
    if SLUG.is_match(id) {
        Ok(())
    } else {
        Err(PipelineError::InvalidProject(format!(
            "`{}` is not a valid project id (lowercase letters, digits, `-`, `_`)",
            id
        )))
    }
}

/// Reject branch names git would refuse or could read as an option.
pub fn validate_branch(branch: &str) -> PipelineResult<()> {
    let bad = branch.is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("@{")
        || branch
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if bad {
        Err(PipelineError::InvalidProject(format!(
            "`{}` is not a valid branch name",
            branch
        )))
    } else {
        Ok(())
    }
}

fn validate_repo_url(url: &str) -> PipelineResult<()> {
    if url.trim().is_empty() || url.starts_with('-') || url.chars().any(char::is_whitespace) {
        return Err(PipelineError::InvalidProject(format!(
            "`{}` is not a usable repository URL",
            url
        )));
    }
    Ok(())
}

pub async fn add_project(pool: &SqlitePool, new: NewProject) -> PipelineResult<Project> {
    validate_slug(&new.id)?;
    validate_repo_url(&new.repo_url)?;
    validate_branch(&new.default_branch)?;
    if let Some(branch) = &new.selected_branch {
        validate_branch(branch)?;
    }

    let now = db::unix_now();
    let inserted = sqlx::query(
        r#"
        INSERT INTO projects (id, repo_url, default_branch, selected_branch, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&new.id)
    .bind(&new.repo_url)
    .bind(&new.default_branch)
    .bind(&new.selected_branch)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    if inserted.rows_affected() == 0 {
        return Err(PipelineError::InvalidProject(format!(
            "project `{}` already exists",
            new.id
        )));
    }
    tracing::info!(project = %new.id, "project registered");
    get_project(pool, &new.id).await
}

/// Delete a project with its scans, files and chunks.
///
/// Refused with [`PipelineError::ProjectBusy`] while a scan holds the
/// project; the status check and the delete are one statement. Storage on
/// disk is left to [`crate::repo_sync::RepoSync::remove_workspace`].
pub async fn remove_project(pool: &SqlitePool, id: &str) -> PipelineResult<()> {
    let mut tx = pool.begin().await?;
    let deleted = sqlx::query("DELETE FROM projects WHERE id = ? AND status != 'scanning'")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if deleted.rows_affected() == 0 {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        return Err(match exists {
            Some(_) => PipelineError::ProjectBusy(id.to_string()),
            None => PipelineError::ProjectNotFound(id.to_string()),
        });
    }
    sqlx::query("DELETE FROM trigger_dedup WHERE project_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    tracing::info!(project = id, "project removed");
    Ok(())
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> PipelineResult<Project> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(project_from_row(&row)),
        None => Err(PipelineError::ProjectNotFound(id.to_string())),
    }
}

pub async fn list_projects(pool: &SqlitePool) -> PipelineResult<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(project_from_row).collect())
}

fn project_from_row(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        repo_url: row.get("repo_url"),
        default_branch: row.get("default_branch"),
        selected_branch: row.get("selected_branch"),
        last_revision: row.get("last_revision"),
        last_kb_scan_id: row.get("last_kb_scan_id"),
        exclusion_rules_version: row.get("exclusion_rules_version"),
        total_files: row.get("total_files"),
        total_lines: row.get("total_lines"),
        total_bytes: row.get("total_bytes"),
        status: ProjectStatus::parse(&row.get::<String, _>("status")).unwrap_or(ProjectStatus::Pending),
        current_stage: row.get("current_stage"),
        stage_percent: row.get("stage_percent"),
        last_error: row.get("last_error"),
        stack_json: row.get("stack_json"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        scanned_at: row.get("scanned_at"),
    }
}

fn scan_from_row(row: &SqliteRow) -> Scan {
    Scan {
        id: row.get("id"),
        project_id: row.get("project_id"),
        trigger: Trigger::parse(&row.get::<String, _>("trigger")).unwrap_or(Trigger::Manual),
        is_incremental: row.get("is_incremental"),
        status: ScanStatus::parse(&row.get::<String, _>("status")).unwrap_or(ScanStatus::Failed),
        current_stage: row.get("current_stage"),
        stage_percent: row.get("stage_percent"),
        from_revision: row.get("from_revision"),
        to_revision: row.get("to_revision"),
        scanner_version: row.get("scanner_version"),
        exclusion_rules_version: row.get("exclusion_rules_version"),
        files_scanned: row.get("files_scanned"),
        files_excluded: row.get("files_excluded"),
        chunks_produced: row.get("chunks_produced"),
        duration_ms: row.get("duration_ms"),
        stage_timings_json: row.get("stage_timings_json"),
        kb_scan_id: row.get("kb_scan_id"),
        kb_valid: row.get("kb_valid"),
        warnings_json: row.get("warnings_json"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    }
}

pub async fn get_scan(pool: &SqlitePool, scan_id: i64) -> PipelineResult<Option<Scan>> {
    let row = sqlx::query("SELECT * FROM scans WHERE id = ?")
        .bind(scan_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(scan_from_row))
}

/// Most recent scans first.
pub async fn recent_scans(pool: &SqlitePool, project_id: &str, limit: i64) -> PipelineResult<Vec<Scan>> {
    let rows = sqlx::query("SELECT * FROM scans WHERE project_id = ? ORDER BY id DESC LIMIT ?")
        .bind(project_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(scan_from_row).collect())
}

pub async fn running_scans(pool: &SqlitePool, project_id: &str) -> PipelineResult<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM scans WHERE project_id = ? AND status = 'running'")
            .bind(project_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Record a trigger firing unless one fired within `window_ms`.
///
/// Returns `true` when this caller owns the firing. The check and the
/// timestamp update are one statement.
pub async fn claim_trigger(
    pool: &SqlitePool,
    project_id: &str,
    trigger: Trigger,
    window_ms: i64,
) -> PipelineResult<bool> {
    let now = db::unix_now_ms();
    let result = sqlx::query(
        r#"
        INSERT INTO trigger_dedup (project_id, trigger, last_fired_at)
        VALUES (?, ?, ?)
        ON CONFLICT(project_id, trigger) DO UPDATE SET last_fired_at = excluded.last_fired_at
        WHERE excluded.last_fired_at - trigger_dedup.last_fired_at >= ?
        "#,
    )
    .bind(project_id)
    .bind(trigger.as_str())
    .bind(now)
    .bind(window_ms)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Fail `running` scans older than `stale_secs`, left behind by a crashed
/// process. A project whose only running scan was abandoned is released.
pub async fn fail_stale_scans(pool: &SqlitePool, project_id: &str, stale_secs: u64) -> PipelineResult<u64> {
    let now = db::unix_now();
    let cutoff = now - stale_secs as i64;
    let mut tx = pool.begin().await?;
    let failed = sqlx::query(
        r#"
        UPDATE scans
        SET status = 'failed', last_error = 'abandoned: no progress before the stale deadline', finished_at = ?
        WHERE project_id = ? AND status = 'running' AND started_at < ?
        "#,
    )
    .bind(now)
    .bind(project_id)
    .bind(cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if failed > 0 {
        sqlx::query(
            r#"
            UPDATE projects
            SET status = 'failed', last_error = 'previous scan abandoned', updated_at = ?
            WHERE id = ? AND status = 'scanning'
              AND NOT EXISTS (SELECT 1 FROM scans WHERE project_id = ? AND status = 'running')
            "#,
        )
        .bind(now)
        .bind(project_id)
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
        tracing::warn!(project = project_id, failed, "failed abandoned scans");
    }
    tx.commit().await?;
    Ok(failed)
}

/// Parameters recorded when a scan starts.
#[derive(Debug, Clone)]
pub struct ScanStart<'a> {
    pub trigger: Trigger,
    pub scanner_version: &'a str,
    pub rules_version: &'a str,
    pub payload_json: Option<String>,
}

/// Atomically move the project to `scanning` and create its running scan.
///
/// Returns `None` when another scan already owns the project.
pub async fn try_start_scan(
    pool: &SqlitePool,
    project_id: &str,
    start: &ScanStart<'_>,
) -> PipelineResult<Option<i64>> {
    let now = db::unix_now();
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        UPDATE projects
        SET status = 'scanning', current_stage = 'workspace', stage_percent = 0,
            last_error = NULL, updated_at = ?
        WHERE id = ? AND status != 'scanning'
        "#,
    )
    .bind(now)
    .bind(project_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 0 {
        tx.rollback().await?;
        // Distinguish a busy project from a missing one.
        get_project(pool, project_id).await?;
        return Ok(None);
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO scans (project_id, trigger, status, current_stage, scanner_version,
                           exclusion_rules_version, payload_json, started_at)
        VALUES (?, ?, 'running', 'workspace', ?, ?, ?, ?)
        "#,
    )
    .bind(project_id)
    .bind(start.trigger.as_str())
    .bind(start.scanner_version)
    .bind(start.rules_version)
    .bind(&start.payload_json)
    .bind(now)
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(result) => {
            let scan_id = result.last_insert_rowid();
            tx.commit().await?;
            Ok(Some(scan_id))
        }
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            tx.rollback().await?;
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn set_scan_revisions(
    pool: &SqlitePool,
    scan_id: i64,
    from: Option<&str>,
    to: &str,
    is_incremental: bool,
) -> PipelineResult<()> {
    sqlx::query("UPDATE scans SET from_revision = ?, to_revision = ?, is_incremental = ? WHERE id = ?")
        .bind(from)
        .bind(to)
        .bind(is_incremental)
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Forget the project's last revision before the stored manifest is
/// rewritten. Until a scan completes again the next webhook cannot diff
/// against a manifest that no longer matches that revision, so it scans in
/// full.
pub async fn invalidate_revision(pool: &SqlitePool, project_id: &str) -> PipelineResult<()> {
    sqlx::query("UPDATE projects SET last_revision = NULL, updated_at = ? WHERE id = ?")
        .bind(db::unix_now())
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bundle ids recorded by completed scans, newest scan first.
pub async fn completed_bundle_ids(pool: &SqlitePool, project_id: &str) -> PipelineResult<Vec<String>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT kb_scan_id FROM scans
        WHERE project_id = ? AND status = 'completed' AND kb_scan_id IS NOT NULL
        ORDER BY id DESC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Everything recorded when a scan completes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanCompletion {
    pub revision: String,
    pub rules_version: String,
    pub files_scanned: i64,
    pub files_excluded: i64,
    pub chunks_produced: i64,
    pub total_lines: i64,
    pub total_bytes: i64,
    pub duration_ms: i64,
    pub stage_timings_json: String,
    /// `None` when no new bundle was produced.
    pub kb_scan_id: Option<String>,
    pub kb_valid: Option<bool>,
    pub stack_json: Option<String>,
    pub warnings: Vec<String>,
    pub attempts: i64,
}

pub async fn complete_scan(
    pool: &SqlitePool,
    project_id: &str,
    scan_id: i64,
    done: &ScanCompletion,
) -> PipelineResult<()> {
    let now = db::unix_now();
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE scans
        SET status = 'completed', current_stage = 'finalize', stage_percent = 100,
            to_revision = ?, files_scanned = ?, files_excluded = ?, chunks_produced = ?,
            duration_ms = ?, stage_timings_json = ?, kb_scan_id = ?, kb_valid = ?,
            warnings_json = ?, attempts = ?, finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&done.revision)
    .bind(done.files_scanned)
    .bind(done.files_excluded)
    .bind(done.chunks_produced)
    .bind(done.duration_ms)
    .bind(&done.stage_timings_json)
    .bind(&done.kb_scan_id)
    .bind(done.kb_valid)
    .bind(to_json_list(&done.warnings))
    .bind(done.attempts)
    .bind(now)
    .bind(scan_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE projects
        SET status = 'ready', current_stage = 'finalize', stage_percent = 100, last_error = NULL,
            last_revision = ?, exclusion_rules_version = ?,
            last_kb_scan_id = COALESCE(?, last_kb_scan_id),
            stack_json = COALESCE(?, stack_json),
            total_files = ?, total_lines = ?, total_bytes = ?,
            scanned_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&done.revision)
    .bind(&done.rules_version)
    .bind(&done.kb_scan_id)
    .bind(&done.stack_json)
    .bind(done.files_scanned)
    .bind(done.total_lines)
    .bind(done.total_bytes)
    .bind(now)
    .bind(now)
    .bind(project_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Mark scan and project failed with a user-visible message.
pub async fn fail_scan(
    pool: &SqlitePool,
    project_id: &str,
    scan_id: i64,
    message: &str,
    attempts: i64,
    warnings: &[String],
    stage_timings_json: &str,
) -> PipelineResult<()> {
    let now = db::unix_now();
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE scans
        SET status = 'failed', last_error = ?, attempts = ?, warnings_json = ?,
            stage_timings_json = ?, duration_ms = (? - started_at) * 1000, finished_at = ?
        WHERE id = ?
        "#,
    )
    .bind(message)
    .bind(attempts)
    .bind(to_json_list(warnings))
    .bind(stage_timings_json)
    .bind(now)
    .bind(now)
    .bind(scan_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE projects SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(message)
    .bind(now)
    .bind(project_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}
