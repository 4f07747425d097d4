//! Project status overview for `kb status`.
//!
//! Without a project id, prints one line per project. With one, prints the
//! project's current state, detected stack, and recent scan history.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::models::{Project, Scan};
use crate::projects;
use crate::stack::StackInfo;

/// Run the status command.
pub async fn run_status(config: &Config, project_id: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    match project_id {
        Some(id) => print_project(&pool, id).await?,
        None => print_overview(config, &pool).await?,
    }
    pool.close().await;
    Ok(())
}

async fn print_overview(config: &Config, pool: &SqlitePool) -> Result<()> {
    let all = projects::list_projects(pool).await?;
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("repo-kb status");
    println!("==============");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Storage:     {}", config.storage.root.display());
    println!("  Projects:    {}", all.len());

    if all.is_empty() {
        println!();
        println!("  No projects registered. Add one with `kb project add`.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  {:<20} {:<9} {:>8} {:>10}   {}",
        "PROJECT", "STATUS", "FILES", "SIZE", "LAST SCAN"
    );
    println!("  {}", "-".repeat(72));
    for p in &all {
        println!(
            "  {:<20} {:<9} {:>8} {:>10}   {}",
            p.id,
            status_label(p),
            p.total_files,
            format_bytes(p.total_bytes.max(0) as u64),
            p.scanned_at
                .map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string())
        );
    }
    println!();
    Ok(())
}

fn status_label(p: &Project) -> String {
    match (&p.current_stage, p.status.as_str()) {
        (Some(stage), "scanning") => format!("{}:{}", stage, p.stage_percent),
        (_, status) => status.to_string(),
    }
}

async fn print_project(pool: &SqlitePool, id: &str) -> Result<()> {
    let p = projects::get_project(pool, id).await?;
    let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE project_id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    println!("Project {}", p.id);
    println!("{}", "=".repeat(8 + p.id.len()));
    println!();
    println!("  Repository:  {}", crate::repo_sync::redact(&p.repo_url, None));
    println!("  Branch:      {}", p.branch());
    println!("  Status:      {}", p.status.as_str());
    if let Some(stage) = &p.current_stage {
        println!("  Stage:       {} ({}%)", stage, p.stage_percent);
    }
    println!(
        "  Revision:    {}",
        p.last_revision.as_deref().unwrap_or("-")
    );
    println!(
        "  Bundle:      {}",
        p.last_kb_scan_id.as_deref().unwrap_or("-")
    );
    println!(
        "  Rules:       {}",
        p.exclusion_rules_version.as_deref().unwrap_or("-")
    );
    println!(
        "  Files:       {} ({} lines, {})",
        p.total_files,
        p.total_lines,
        format_bytes(p.total_bytes.max(0) as u64)
    );
    println!("  Chunks:      {}", chunk_count);
    println!(
        "  Scanned:     {}",
        p.scanned_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    if let Some(err) = &p.last_error {
        println!("  Last error:  {}", err);
    }

    if let Some(stack) = p
        .stack_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<StackInfo>(raw).ok())
    {
        println!();
        println!("  Stack:");
        let langs: Vec<String> = stack
            .languages
            .iter()
            .take(5)
            .map(|l| format!("{} ({})", l.language, l.files))
            .collect();
        println!("    languages:   {}", join_or_dash(&langs));
        println!("    managers:    {}", join_or_dash(&stack.package_managers));
        let frameworks: Vec<String> = stack.frameworks.iter().map(|f| f.name.clone()).collect();
        println!("    frameworks:  {}", join_or_dash(&frameworks));
    }

    let scans = projects::recent_scans(pool, id, 10).await?;
    if !scans.is_empty() {
        println!();
        println!("  Recent scans:");
        println!(
            "  {:>6} {:<8} {:<10} {:<4} {:>7} {:>8} {:>9}   {}",
            "ID", "TRIGGER", "STATUS", "MODE", "FILES", "CHUNKS", "DURATION", "STARTED"
        );
        println!("  {}", "-".repeat(76));
        for s in &scans {
            print_scan_line(s);
        }
    }
    println!();
    Ok(())
}

fn print_scan_line(s: &Scan) {
    let duration = s
        .duration_ms
        .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {:>6} {:<8} {:<10} {:<4} {:>7} {:>8} {:>9}   {}",
        s.id,
        s.trigger.as_str(),
        s.status.as_str(),
        if s.is_incremental { "inc" } else { "full" },
        s.files_scanned,
        s.chunks_produced,
        duration,
        format_ts_relative(s.started_at)
    );
    if let Some(err) = &s.last_error {
        println!("         error: {}", err);
    }
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
