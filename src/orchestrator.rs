//! Scan pipeline orchestration.
//!
//! [`Orchestrator::run_scan`] is the single entry point for manual and
//! webhook triggers. It claims the project through the store, runs the six
//! stages with per-stage retry and timeouts, and records the outcome on the
//! scan and project rows.
//!
//! # Stages
//!
//! | Stage | Work |
//! |-------|------|
//! | `workspace` | create the project's directories |
//! | `sync` | clone or update the working copy, resolve the revision |
//! | `manifest` | full scan, or incremental update from a diff |
//! | `detect-stack` | package managers, frameworks, languages |
//! | `chunk` | chunk new and changed files |
//! | `finalize` | write, validate and prune knowledge base bundles |
//!
//! A webhook run scans in full when there is no previous revision, the diff
//! is larger than `pipeline.incremental_threshold`, a dependency manifest
//! changed, or the exclusion rules changed since the last scan. A webhook
//! for an unchanged revision completes without writing a bundle.
//!
//! The project's last revision is cleared before the stored manifest is
//! rewritten, so a scan that fails part way leaves the next run to scan in
//! full. Bundle directories that no completed scan recorded are swept while
//! the project is still claimed; retention runs after completion.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::error::{PipelineError, PipelineResult, SyncError};
use crate::knowledge_base::{self, BuildContext, ValidationSummary};
use crate::models::{ChangeSet, FileRecord, Project, Stage, Trigger};
use crate::progress::{self, EventSink, NoProgress, ProgressReporter};
use crate::projects::{self, ScanCompletion, ScanStart};
use crate::repo_sync::{RepoSync, Workspace};
use crate::retry::RetryPolicy;
use crate::scanner::{self, FileScanner, SCANNER_VERSION};
use crate::{chunker, db, stack};

/// How a `run_scan` call ended.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// Nothing was run; the reason is user-visible.
    Skipped(String),
    /// The scan ran and failed terminally.
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan_id: i64,
    pub revision: String,
    pub is_incremental: bool,
    /// `None` when the revision was unchanged and no bundle was written.
    pub kb_scan_id: Option<String>,
    pub validation: Option<ValidationSummary>,
    pub files_scanned: i64,
    pub files_excluded: i64,
    pub chunks_total: i64,
    pub duration_ms: i64,
    pub warnings: Vec<String>,
}

/// The parts of a push webhook body the pipeline looks at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub after: Option<String>,
}

impl WebhookPayload {
    /// Whether the push targets `branch`. A payload without a ref matches.
    pub fn targets_branch(&self, branch: &str) -> bool {
        match self.git_ref.as_deref() {
            None => true,
            Some(r) => r == branch || r.strip_prefix("refs/heads/") == Some(branch),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Full,
    Incremental,
    Unchanged,
}

#[derive(Debug, Default)]
struct RunState {
    attempts: u32,
    timings: BTreeMap<&'static str, u64>,
}

impl RunState {
    fn timings_json(&self) -> String {
        serde_json::to_string(&self.timings).unwrap_or_else(|_| "{}".to_string())
    }
}

struct PipelineDone {
    revision: String,
    is_incremental: bool,
    validation: Option<ValidationSummary>,
    stack_json: Option<String>,
    rules_version: String,
    files_scanned: i64,
    files_excluded: i64,
    total_lines: i64,
    total_bytes: i64,
    chunks_total: i64,
}

pub struct Orchestrator {
    pool: SqlitePool,
    config: Config,
    sync: RepoSync,
    scanner: FileScanner,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
    reporter: Arc<dyn ProgressReporter>,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let scanner = FileScanner::new(&config)?;
        let sync = RepoSync::new(
            config.storage.root.clone(),
            Duration::from_secs(config.pipeline.git_timeout_secs),
        );
        let retry = RetryPolicy::from_config(&config.pipeline);
        Ok(Self {
            pool,
            config,
            sync,
            scanner,
            credentials,
            retry,
            reporter: Arc::new(NoProgress),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn repo_sync(&self) -> &RepoSync {
        &self.sync
    }

    /// Run one scan of `project_id`.
    ///
    /// Errors are returned only for problems outside a scan (unknown
    /// project, store unavailable); pipeline failures are recorded and
    /// reported as [`ScanOutcome::Failed`].
    pub async fn run_scan(
        &self,
        project_id: &str,
        trigger: Trigger,
        payload: Option<&serde_json::Value>,
    ) -> PipelineResult<ScanOutcome> {
        let project = projects::get_project(&self.pool, project_id).await?;

        if trigger == Trigger::Webhook {
            let parsed: WebhookPayload = payload
                .and_then(|p| serde_json::from_value(p.clone()).ok())
                .unwrap_or_default();
            if !parsed.targets_branch(project.branch()) {
                let reason = format!(
                    "push to `{}` does not touch tracked branch `{}`",
                    parsed.git_ref.as_deref().unwrap_or_default(),
                    project.branch()
                );
                tracing::info!(project = project_id, "{}", reason);
                return Ok(ScanOutcome::Skipped(reason));
            }

            let window_ms = (self.config.pipeline.webhook_dedup_secs * 1000) as i64;
            if !projects::claim_trigger(&self.pool, project_id, trigger, window_ms).await? {
                tracing::info!(project = project_id, "duplicate webhook suppressed");
                return Ok(ScanOutcome::Skipped(
                    "webhook already handled within the dedup window".to_string(),
                ));
            }
        }

        projects::fail_stale_scans(&self.pool, project_id, self.config.pipeline.stale_scan_secs)
            .await?;

        let payload_json = payload.map(|p| p.to_string());
        let start = ScanStart {
            trigger,
            scanner_version: SCANNER_VERSION,
            rules_version: self.scanner.rules_version(),
            payload_json,
        };
        let Some(scan_id) = projects::try_start_scan(&self.pool, project_id, &start).await? else {
            tracing::info!(project = project_id, "scan already running, skipped");
            return Ok(ScanOutcome::Skipped("a scan is already running".to_string()));
        };

        tracing::info!(project = project_id, scan = scan_id, trigger = trigger.as_str(), "scan started");
        let started = Instant::now();
        let started_at_ms = db::unix_now_ms();

        let (events, consumer) = progress::spawn_consumer(
            self.pool.clone(),
            project_id.to_string(),
            scan_id,
            Arc::clone(&self.reporter),
        );

        let mut state = RunState::default();
        let scan_budget = Duration::from_secs(self.config.pipeline.scan_timeout_secs);
        let result = tokio::time::timeout(
            scan_budget,
            self.pipeline(&project, scan_id, trigger, started_at_ms, &events, &mut state),
        )
        .await
        .unwrap_or_else(|_| {
            Err(PipelineError::Timeout {
                stage: "scan".to_string(),
                secs: scan_budget.as_secs(),
            })
        });

        drop(events);
        let warnings = match tokio::time::timeout(Duration::from_secs(5), consumer).await {
            Ok(Ok(warnings)) => warnings,
            _ => Vec::new(),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(done) => {
                let new_bundle = done.validation.as_ref().map(|v| v.scan_id.clone());
                if let Err(e) = self.sweep_bundles(project_id, new_bundle.as_deref()).await {
                    tracing::warn!(project = project_id, error = %e, "bundle sweep failed");
                }
                let completion = ScanCompletion {
                    revision: done.revision.clone(),
                    rules_version: done.rules_version.clone(),
                    files_scanned: done.files_scanned,
                    files_excluded: done.files_excluded,
                    chunks_produced: done.chunks_total,
                    total_lines: done.total_lines,
                    total_bytes: done.total_bytes,
                    duration_ms,
                    stage_timings_json: state.timings_json(),
                    kb_scan_id: new_bundle.clone(),
                    kb_valid: done.validation.as_ref().map(|v| v.is_valid),
                    stack_json: done.stack_json.clone(),
                    warnings: warnings.clone(),
                    attempts: state.attempts as i64,
                };
                if let Err(e) =
                    projects::complete_scan(&self.pool, project_id, scan_id, &completion).await
                {
                    if let Some(bundle) = &new_bundle {
                        self.discard_bundle(project_id, bundle);
                    }
                    return Err(e);
                }
                match self.apply_retention(project_id).await {
                    Ok(removed) if !removed.is_empty() => {
                        tracing::debug!(project = project_id, removed = ?removed, "pruned old bundles")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(project = project_id, error = %e, "retention failed"),
                }
                tracing::info!(
                    project = project_id,
                    scan = scan_id,
                    revision = %done.revision,
                    incremental = done.is_incremental,
                    duration_ms,
                    "scan completed"
                );
                Ok(ScanOutcome::Completed(ScanReport {
                    scan_id,
                    revision: done.revision,
                    is_incremental: done.is_incremental,
                    kb_scan_id: completion.kb_scan_id,
                    validation: done.validation,
                    files_scanned: done.files_scanned,
                    files_excluded: done.files_excluded,
                    chunks_total: done.chunks_total,
                    duration_ms,
                    warnings,
                }))
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(e) = self.sweep_bundles(project_id, None).await {
                    tracing::warn!(project = project_id, error = %e, "bundle sweep failed");
                }
                projects::fail_scan(
                    &self.pool,
                    project_id,
                    scan_id,
                    &message,
                    state.attempts.max(1) as i64,
                    &warnings,
                    &state.timings_json(),
                )
                .await?;
                tracing::error!(project = project_id, scan = scan_id, error = %message, "scan failed");
                Ok(ScanOutcome::Failed(message))
            }
        }
    }

    /// Delete bundle directories no completed scan recorded, keeping
    /// `current`. Must run while this scan still holds the project.
    async fn sweep_bundles(&self, project_id: &str, current: Option<&str>) -> PipelineResult<()> {
        let mut recorded: HashSet<String> = projects::completed_bundle_ids(&self.pool, project_id)
            .await?
            .into_iter()
            .collect();
        recorded.extend(current.map(str::to_string));
        let removed = knowledge_base::sweep_unrecorded(&self.sync.workspace(project_id).kb, &recorded)?;
        if !removed.is_empty() {
            tracing::info!(project = project_id, removed = ?removed, "removed bundles of unfinished scans");
        }
        Ok(())
    }

    fn discard_bundle(&self, project_id: &str, bundle: &str) {
        let dir = self.sync.workspace(project_id).kb.join(bundle);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(project = project_id, path = %dir.display(), error = %e, "failed to discard bundle");
        }
    }

    async fn apply_retention(&self, project_id: &str) -> PipelineResult<Vec<String>> {
        let recorded: HashSet<String> = projects::completed_bundle_ids(&self.pool, project_id)
            .await?
            .into_iter()
            .collect();
        knowledge_base::prune_bundles(
            &self.sync.workspace(project_id).kb,
            self.config.knowledge_base.retention,
            &recorded,
        )
    }

    /// Run `op` as `stage` with retries, publishing start and completion.
    async fn stage<T, F, Fut>(
        &self,
        stage: Stage,
        events: &EventSink,
        state: &mut RunState,
        op: F,
    ) -> PipelineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        events.started(stage);
        let started = Instant::now();
        let (result, attempts) = self.retry.run(stage, op).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        state.attempts = state.attempts.max(attempts);
        state.timings.insert(stage.name(), elapsed_ms);
        if result.is_ok() {
            events.completed(stage, elapsed_ms);
        }
        result
    }

    async fn pipeline(
        &self,
        project: &Project,
        scan_id: i64,
        trigger: Trigger,
        started_at_ms: i64,
        events: &EventSink,
        state: &mut RunState,
    ) -> PipelineResult<PipelineDone> {
        let rules_version = self.scanner.rules_version().to_string();

        let ws: Workspace = self
            .stage(Stage::Workspace, events, state, |_| async move {
                self.sync.ensure_workspace(project).await
            })
            .await?;

        let revision: String = self
            .stage(Stage::Sync, events, state, |_| async move {
                let token = self.credentials.access_token(project).await?;
                self.sync.sync_to_latest(project, token).await
            })
            .await?;

        let (strategy, changes) = self
            .choose_strategy(project, trigger, &revision, &rules_version, events)
            .await?;
        let is_incremental = strategy == Strategy::Incremental;
        projects::set_scan_revisions(
            &self.pool,
            scan_id,
            project.last_revision.as_deref(),
            &revision,
            is_incremental,
        )
        .await?;

        if strategy == Strategy::Unchanged {
            tracing::info!(project = %project.id, revision = %revision, "revision unchanged, no new bundle");
            let chunks_total = count_chunks(&self.pool, &project.id).await?;
            return Ok(PipelineDone {
                revision,
                is_incremental: false,
                validation: None,
                stack_json: None,
                rules_version,
                files_scanned: project.total_files,
                files_excluded: previous_files_excluded(&self.pool, &project.id).await?,
                total_lines: project.total_lines,
                total_bytes: project.total_bytes,
                chunks_total,
            });
        }

        // Manifest
        projects::invalidate_revision(&self.pool, &project.id).await?;
        let (to_chunk, files_excluded): (Vec<FileRecord>, i64) = if is_incremental {
            let changes = &changes;
            let ws = &ws;
            let updated = self
                .stage(Stage::Manifest, events, state, |_| async move {
                    scanner::update_changed_files(
                        &self.pool,
                        &self.scanner,
                        &project.id,
                        &ws.repo,
                        changes,
                        events,
                    )
                    .await
                })
                .await?;
            (updated, previous_files_excluded(&self.pool, &project.id).await?)
        } else {
            let ws = &ws;
            let rules = rules_version.as_str();
            let out = self
                .stage(Stage::Manifest, events, state, |_| async move {
                    let out = self.scanner.scan(&ws.repo, events).await?;
                    scanner::persist_manifest(&self.pool, &project.id, &out.files).await?;
                    scanner::write_exclusion_log(&ws.knowledge, rules, &out.excluded)?;
                    Ok(out)
                })
                .await?;
            let excluded = out.stats.files_excluded as i64;
            (out.files, excluded)
        };

        // Detect stack over the whole stored manifest.
        let manifest = scanner::load_manifest(&self.pool, &project.id).await?;
        let stack_json = {
            let ws = &ws;
            let manifest = &manifest;
            self.stage(Stage::DetectStack, events, state, |_| async move {
                let stack = stack::detect(&ws.repo, manifest);
                stack::write_stack_json(&ws.knowledge, &stack)?;
                Ok(serde_json::to_string(&stack)?)
            })
            .await?
        };

        // Chunk
        {
            let ws = &ws;
            let to_chunk = &to_chunk;
            let stats = self
                .stage(Stage::Chunk, events, state, |_| async move {
                    chunker::chunk_stage(
                        &self.pool,
                        &project.id,
                        &ws.repo,
                        to_chunk,
                        &self.config.chunking,
                        self.scanner.workers(),
                        events,
                    )
                    .await
                })
                .await?;
            tracing::debug!(
                project = %project.id,
                chunked = stats.files_chunked,
                skipped = stats.files_skipped,
                "chunk stage stats"
            );
        }

        // Finalize
        let previous_scan_id = project.last_kb_scan_id.clone();
        let ctx = BuildContext {
            workspace: ws.clone(),
            is_incremental,
            previous_scan_id,
            rules_version: rules_version.clone(),
            files_excluded: files_excluded.max(0) as u64,
            started_at_ms,
            ndjson_threshold: self.config.knowledge_base.ndjson_threshold,
        };
        let validation = {
            let ctx = &ctx;
            self.stage(Stage::Finalize, events, state, |_| async move {
                knowledge_base::build(&self.pool, project, ctx).await
            })
            .await?
        };
        if !validation.is_valid {
            events.warn(
                Stage::Finalize,
                format!(
                    "bundle {} failed validation: {} missing, {} orphaned, {} files not fully chunked",
                    validation.scan_id,
                    validation.missing_in_chunks,
                    validation.orphaned_chunks,
                    validation.uncovered_files
                ),
            );
        }

        Ok(PipelineDone {
            revision,
            is_incremental,
            chunks_total: validation.chunks_count as i64,
            validation: Some(validation),
            stack_json: Some(stack_json),
            rules_version,
            files_scanned: manifest.len() as i64,
            files_excluded,
            total_lines: manifest.iter().map(|f| f.line_count as i64).sum(),
            total_bytes: manifest.iter().map(|f| f.size_bytes as i64).sum(),
        })
    }

    /// Decide between a full scan, an incremental update and no work.
    async fn choose_strategy(
        &self,
        project: &Project,
        trigger: Trigger,
        revision: &str,
        rules_version: &str,
        events: &EventSink,
    ) -> PipelineResult<(Strategy, ChangeSet)> {
        let full = (Strategy::Full, ChangeSet::default());
        if trigger == Trigger::Manual {
            return Ok(full);
        }
        let Some(previous) = project.last_revision.as_deref() else {
            tracing::info!(project = %project.id, "no previous revision, full scan");
            return Ok(full);
        };
        if project.exclusion_rules_version.as_deref() != Some(rules_version) {
            tracing::info!(project = %project.id, "exclusion rules changed, full scan");
            return Ok(full);
        }
        if project.last_kb_scan_id.is_none() {
            return Ok(full);
        }
        if previous == revision {
            return Ok((Strategy::Unchanged, ChangeSet::default()));
        }

        let (diff, _) = self
            .retry
            .run(Stage::Sync, |_| async move { self.sync.diff(project, previous, revision).await })
            .await;
        let changes = match diff {
            Ok(changes) => changes,
            Err(PipelineError::Sync(SyncError::MissingRevision(rev))) => {
                events.warn(
                    Stage::Sync,
                    format!("previous revision {} unavailable, falling back to full scan", rev),
                );
                return Ok(full);
            }
            Err(e) => return Err(e),
        };

        if changes.len() > self.config.pipeline.incremental_threshold {
            tracing::info!(project = %project.id, changes = changes.len(), "large change set, full scan");
            return Ok(full);
        }
        if changes.all_paths().iter().any(|p| stack::is_stack_file(p)) {
            tracing::info!(project = %project.id, "dependency manifest changed, full scan");
            return Ok(full);
        }
        if changes.is_empty() {
            return Ok((Strategy::Unchanged, changes));
        }
        Ok((Strategy::Incremental, changes))
    }
}

async fn count_chunks(pool: &SqlitePool, project_id: &str) -> PipelineResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Path-excluded count of the last completed scan. Incremental updates do
/// not re-walk the tree, so the figure is carried forward.
async fn previous_files_excluded(pool: &SqlitePool, project_id: &str) -> PipelineResult<i64> {
    let count: Option<i64> = sqlx::query_scalar(
        "SELECT files_excluded FROM scans WHERE project_id = ? AND status = 'completed' ORDER BY id DESC LIMIT 1",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(count.unwrap_or(0))
}
