//! Command handlers behind the `kb` binary.
//!
//! Each `run_*` function opens its own pool, does one thing, and prints a
//! human-readable result to stdout. Diagnostics go through `tracing`.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::credentials::EnvTokenProvider;
use crate::db;
use crate::knowledge_base::{self, ValidationSummary};
use crate::models::Trigger;
use crate::orchestrator::{Orchestrator, ScanOutcome};
use crate::progress::ProgressMode;
use crate::projects::{self, NewProject};
use crate::repo_sync::{self, RepoSync, Workspace};
use crate::stats::format_ts_relative;

pub async fn run_project_add(
    config: &Config,
    id: &str,
    repo_url: &str,
    branch: &str,
    selected_branch: Option<String>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let project = projects::add_project(
        &pool,
        NewProject {
            id: id.to_string(),
            repo_url: repo_url.to_string(),
            default_branch: branch.to_string(),
            selected_branch,
        },
    )
    .await?;
    pool.close().await;

    println!(
        "Added project {} ({} @ {})",
        project.id,
        repo_sync::redact(&project.repo_url, None),
        project.branch()
    );
    Ok(())
}

/// Remove a project's rows and, unless `keep_storage`, its storage
/// directory. Refused while a scan is running.
pub async fn run_project_remove(config: &Config, id: &str, keep_storage: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    projects::remove_project(&pool, id).await?;
    pool.close().await;

    if keep_storage {
        println!("Removed project {}", id);
        return Ok(());
    }
    let sync = RepoSync::new(
        config.storage.root.clone(),
        std::time::Duration::from_secs(config.pipeline.git_timeout_secs),
    );
    let ws = sync.workspace(id);
    if sync.remove_workspace(id).await? {
        println!("Removed project {} and deleted {}", id, ws.root.display());
    } else {
        println!("Removed project {}", id);
    }
    Ok(())
}

pub async fn run_project_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let all = projects::list_projects(&pool).await?;
    pool.close().await;

    if all.is_empty() {
        println!("No projects registered.");
        return Ok(());
    }

    println!(
        "{:<20} {:<9} {:<16} {:<10} {}",
        "PROJECT", "STATUS", "BRANCH", "REVISION", "LAST SCAN"
    );
    for p in &all {
        let revision = p
            .last_revision
            .as_deref()
            .map(|r| r.chars().take(8).collect::<String>())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<9} {:<16} {:<10} {}",
            p.id,
            p.status.as_str(),
            p.branch(),
            revision,
            p.scanned_at
                .map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string())
        );
    }
    Ok(())
}

/// Options for one `kb scan` invocation.
pub struct ScanArgs<'a> {
    pub project_id: &'a str,
    pub webhook: bool,
    pub payload: Option<&'a Path>,
    pub progress: ProgressMode,
    pub json: bool,
}

/// Run a scan and print its outcome. A failed scan is an error so the
/// process exits non-zero; a skipped one is not.
pub async fn run_scan(config: &Config, args: ScanArgs<'_>) -> Result<()> {
    let payload = match args.payload {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read payload {}", path.display()))?;
            Some(
                serde_json::from_str::<serde_json::Value>(&raw)
                    .with_context(|| format!("Payload {} is not valid JSON", path.display()))?,
            )
        }
        None => None,
    };
    let trigger = if args.webhook || payload.is_some() {
        Trigger::Webhook
    } else {
        Trigger::Manual
    };

    let pool = db::connect(config).await?;
    let credentials = Arc::new(EnvTokenProvider::new(
        config.credentials.token_env.clone(),
        config.credentials.required,
    ));
    let orchestrator = Orchestrator::new(pool.clone(), config.clone(), credentials)?
        .with_reporter(args.progress.reporter());

    let outcome = orchestrator
        .run_scan(args.project_id, trigger, payload.as_ref())
        .await?;
    pool.close().await;

    match outcome {
        ScanOutcome::Completed(report) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!(
                "Scan {} of {} completed ({})",
                report.scan_id,
                args.project_id,
                if report.is_incremental { "incremental" } else { "full" }
            );
            println!("  revision:  {}", report.revision);
            match &report.kb_scan_id {
                Some(kb) => println!("  bundle:    {}", kb),
                None => println!("  bundle:    unchanged, none written"),
            }
            println!(
                "  files:     {} scanned, {} excluded",
                report.files_scanned, report.files_excluded
            );
            println!("  chunks:    {}", report.chunks_total);
            if let Some(v) = &report.validation {
                print_validation_line(v);
            }
            println!("  duration:  {:.1}s", report.duration_ms as f64 / 1000.0);
            for w in &report.warnings {
                println!("  warning:   {}", w);
            }
            Ok(())
        }
        ScanOutcome::Skipped(reason) => {
            println!("Scan of {} skipped: {}", args.project_id, reason);
            Ok(())
        }
        ScanOutcome::Failed(message) => {
            bail!("scan of {} failed: {}", args.project_id, message)
        }
    }
}

/// Print the paths changed between two revisions of a project's working copy.
pub async fn run_diff(config: &Config, id: &str, from: &str, to: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let project = projects::get_project(&pool, id).await?;
    pool.close().await;

    let sync = RepoSync::new(
        config.storage.root.clone(),
        std::time::Duration::from_secs(config.pipeline.git_timeout_secs),
    );
    let changes = sync.diff(&project, from, to).await?;
    for path in &changes.added {
        println!("A\t{}", path);
    }
    for path in &changes.modified {
        println!("M\t{}", path);
    }
    for path in &changes.deleted {
        println!("D\t{}", path);
    }
    tracing::debug!(project = id, changed = changes.len(), "diff listed");
    Ok(())
}

/// Re-validate a bundle on disk. Defaults to the bundle recorded by the
/// project's last completed scan.
pub async fn run_verify(config: &Config, id: &str, scan_id: Option<&str>, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let project = projects::get_project(&pool, id).await?;
    pool.close().await;

    let ws = Workspace::for_project(&config.storage.root, id);
    let name = scan_id
        .or(project.last_kb_scan_id.as_deref())
        .with_context(|| format!("project `{}` has no knowledge base bundle", id))?;
    if name.contains('/') || name.contains('\\') || name.starts_with('.') {
        bail!("`{}` is not a bundle id", name);
    }
    let dir = ws.kb.join(name);
    if !dir.is_dir() {
        bail!("bundle {} not found", dir.display());
    }
    let dir = repo_sync::ensure_contained(&config.storage.root, &dir)?;

    let summary = knowledge_base::verify_bundle(&dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Bundle {}", summary.scan_id);
        println!("  path:      {}", summary.output_path);
        println!("  files:     {}", summary.files_index_entries);
        println!("  chunks:    {}", summary.chunks_count);
        print_validation_line(&summary);
        for chunk in &summary.samples.missing_in_chunks {
            println!("  missing:   {}", chunk);
        }
        for chunk in &summary.samples.orphaned_chunks {
            println!("  orphaned:  {}", chunk);
        }
        for chunk in &summary.samples.duplicated {
            println!("  duplicate: {}", chunk);
        }
        for path in &summary.samples.uncovered_files {
            println!("  uncovered: {}", path);
        }
    }

    if !summary.is_valid {
        bail!("bundle {} failed validation", summary.scan_id);
    }
    Ok(())
}

fn print_validation_line(v: &ValidationSummary) {
    if v.is_valid {
        println!("  valid:     yes ({:.1}% coverage)", v.coverage_percent);
    } else {
        println!(
            "  valid:     NO ({} missing, {} orphaned, {} duplicate, {} uncovered files)",
            v.missing_in_chunks,
            v.orphaned_chunks,
            v.duplicate_references + v.duplicate_chunks,
            v.uncovered_files
        );
    }
}
