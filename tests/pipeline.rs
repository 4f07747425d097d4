//! End-to-end pipeline runs against throwaway local git repositories.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use repo_kb::config::Config;
use repo_kb::credentials::{AccessToken, StaticTokenProvider};
use repo_kb::knowledge_base::{self, BuildContext, ChunkRecord, FileIndexEntry, ScanMeta};
use repo_kb::models::{ProjectStatus, ScanStatus, Trigger};
use repo_kb::orchestrator::{Orchestrator, ScanOutcome, ScanReport};
use repo_kb::projects::{self, NewProject, ScanStart};
use repo_kb::repo_sync::Workspace;
use repo_kb::retry::RetryPolicy;
use repo_kb::scanner::SCANNER_VERSION;
use repo_kb::{db, migrate};
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=Test",
            "-c",
            "user.email=test@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git is installed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn commit_all(repo: &Path, message: &str) -> String {
    git(repo, &["add", "-A"]);
    git(repo, &["commit", "-q", "-m", message]);
    git(repo, &["rev-parse", "HEAD"])
}

/// A small Laravel-flavoured repository on branch `main`.
fn upstream_repo(root: &Path) -> PathBuf {
    let repo = root.join("upstream");
    fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    write(
        &repo,
        "composer.json",
        br#"{"require": {"php": "^8.2", "laravel/framework": "^11.0"}}"#,
    );
    write(
        &repo,
        "app/Models/User.php",
        b"<?php\n\nnamespace App\\Models;\n\nuse Illuminate\\Database\\Eloquent\\Model;\n\nclass User extends Model\n{\n    public function posts()\n    {\n        return $this->hasMany(Post::class);\n    }\n}\n",
    );
    write(
        &repo,
        "app/Http/Controllers/HomeController.php",
        b"<?php\n\nnamespace App\\Http\\Controllers;\n\nclass HomeController extends Controller\n{\n    public function index()\n    {\n        return view('home');\n    }\n}\n",
    );
    write(
        &repo,
        "resources/views/home.blade.php",
        b"@extends('layouts.app')\n\n@section('content')\n<h1>Home</h1>\n@endsection\n",
    );
    write(&repo, "README.md", b"# Shop\n\nA demo application.\n");
    write(&repo, "vendor/acme/lib.php", b"<?php\n// vendored\n");
    write(&repo, "public/logo.png", &[0x89, b'P', b'N', b'G', 0, 0, 1, 2, 3]);
    commit_all(&repo, "initial");
    repo
}

struct Harness {
    _tmp: TempDir,
    upstream: PathBuf,
    config: Config,
    pool: SqlitePool,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let upstream = upstream_repo(tmp.path());
        let mut config = Config::minimal_in(&tmp.path().join("data"));
        config.pipeline.webhook_dedup_secs = 0;
        config.scanner.workers = 2;
        tweak(&mut config);

        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        Self {
            _tmp: tmp,
            upstream,
            config,
            pool,
        }
    }

    async fn add_project(&self, id: &str, repo_url: &str) {
        projects::add_project(
            &self.pool,
            NewProject {
                id: id.to_string(),
                repo_url: repo_url.to_string(),
                default_branch: "main".to_string(),
                selected_branch: None,
            },
        )
        .await
        .unwrap();
    }

    async fn add_upstream(&self, id: &str) {
        let url = format!("file://{}", self.upstream.display());
        self.add_project(id, &url).await;
    }

    fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(StaticTokenProvider::anonymous())
    }

    fn orchestrator_with(&self, credentials: StaticTokenProvider) -> Orchestrator {
        self.orchestrator_for(self.config.clone(), credentials)
    }

    fn orchestrator_for(&self, config: Config, credentials: StaticTokenProvider) -> Orchestrator {
        Orchestrator::new(self.pool.clone(), config, Arc::new(credentials))
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 2,
                max_delay: Duration::from_millis(5),
                attempt_timeout: Duration::from_secs(60),
            })
    }

    fn kb_dir(&self, id: &str) -> PathBuf {
        self.config.storage.root.join(id).join("kb")
    }
}

fn completed(outcome: ScanOutcome) -> ScanReport {
    match outcome {
        ScanOutcome::Completed(report) => report,
        other => panic!("expected a completed scan, got {:?}", other),
    }
}

fn push_payload(branch: &str) -> serde_json::Value {
    json!({ "ref": format!("refs/heads/{}", branch), "after": "0000000" })
}

fn bundle_dir(report: &ScanReport) -> PathBuf {
    PathBuf::from(&report.validation.as_ref().expect("bundle written").output_path)
}

fn chunk_records(bundle: &Path) -> Vec<ChunkRecord> {
    fs::read_to_string(bundle.join("chunks.ndjson"))
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn chunk_ids(bundle: &Path) -> BTreeSet<String> {
    chunk_records(bundle).into_iter().map(|c| c.chunk_id).collect()
}

fn index_entries(bundle: &Path) -> Vec<FileIndexEntry> {
    let raw = fs::read_to_string(bundle.join("files_index.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn full_scan_writes_a_valid_bundle() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let head = git(&h.upstream, &["rev-parse", "HEAD"]);

    let report = completed(
        h.orchestrator()
            .run_scan("shop", Trigger::Manual, None)
            .await
            .unwrap(),
    );
    assert_eq!(report.revision, head);
    assert!(!report.is_incremental);
    let validation = report.validation.clone().unwrap();
    assert!(validation.is_valid, "{:?}", validation);
    assert_eq!(validation.coverage_percent, 100.0);

    let bundle = bundle_dir(&report);
    for name in [
        "scan_meta.json",
        "files_index.json",
        "chunks.ndjson",
        "directory_stats.json",
    ] {
        assert!(bundle.join(name).is_file(), "missing {}", name);
    }

    let meta: ScanMeta =
        serde_json::from_str(&fs::read_to_string(bundle.join("scan_meta.json")).unwrap()).unwrap();
    assert_eq!(meta.head_revision, head);
    assert_eq!(meta.scanner_version, SCANNER_VERSION);
    assert!(meta.validation.is_valid);

    let entries = index_entries(&bundle);
    let paths: Vec<&str> = entries.iter().map(|e| e.file_path.as_str()).collect();
    assert!(paths.contains(&"app/Models/User.php"));
    assert!(paths.contains(&"public/logo.png"));
    assert!(!paths.iter().any(|p| p.starts_with("vendor/")));

    let logo = entries.iter().find(|e| e.file_path == "public/logo.png").unwrap();
    assert!(logo.is_binary);
    assert!(logo.chunk_ids.is_empty());

    let user = entries
        .iter()
        .find(|e| e.file_path == "app/Models/User.php")
        .unwrap();
    assert_eq!(user.language, "php");
    assert!(!user.chunk_ids.is_empty());

    // Stored chunk content reproduces the file.
    let content = fs::read_to_string(h.upstream.join("app/Models/User.php")).unwrap();
    let rebuilt: String = chunk_records(&bundle)
        .into_iter()
        .filter(|c| c.file_path == "app/Models/User.php")
        .map(|c| c.content)
        .collect();
    assert_eq!(rebuilt, content);

    let knowledge = h.config.storage.root.join("shop").join("knowledge");
    assert!(knowledge.join("stack.json").is_file());
    assert!(knowledge.join("exclusion_log.json").is_file());

    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    assert_eq!(project.status, ProjectStatus::Ready);
    assert_eq!(project.last_revision.as_deref(), Some(head.as_str()));
    assert_eq!(project.last_kb_scan_id.as_deref(), Some(validation.scan_id.as_str()));
    assert!(project.stack_json.unwrap().contains("composer"));

    let scan = projects::get_scan(&h.pool, report.scan_id).await.unwrap().unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.kb_valid, Some(true));
    assert_eq!(scan.attempts, 1);

    let verified = knowledge_base::verify_bundle(&bundle).unwrap();
    assert!(verified.is_valid);
    assert_eq!(verified.chunks_count, validation.chunks_count);
}

#[tokio::test]
async fn unchanged_revision_keeps_previous_bundle() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();

    let first = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());
    let first_bundle = first.kb_scan_id.clone().unwrap();

    let payload = push_payload("main");
    let second = completed(
        orchestrator
            .run_scan("shop", Trigger::Webhook, Some(&payload))
            .await
            .unwrap(),
    );
    assert_eq!(second.revision, first.revision);
    assert!(second.kb_scan_id.is_none());
    assert_eq!(second.chunks_total, first.chunks_total);

    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    assert_eq!(project.last_kb_scan_id.as_deref(), Some(first_bundle.as_str()));
    assert_eq!(knowledge_base::list_bundles(&h.kb_dir("shop")).unwrap().len(), 1);
}

#[tokio::test]
async fn webhook_for_another_branch_is_skipped() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;

    let payload = push_payload("feature/x");
    let outcome = h
        .orchestrator()
        .run_scan("shop", Trigger::Webhook, Some(&payload))
        .await
        .unwrap();
    assert!(matches!(outcome, ScanOutcome::Skipped(_)));
    assert!(projects::recent_scans(&h.pool, "shop", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn incremental_update_matches_a_full_rescan() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();

    let first = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());
    let untouched_before: BTreeSet<String> = chunk_records(&bundle_dir(&first))
        .into_iter()
        .filter(|c| c.file_path == "app/Http/Controllers/HomeController.php")
        .map(|c| c.chunk_id)
        .collect();

    write(
        &h.upstream,
        "app/Models/User.php",
        b"<?php\n\nnamespace App\\Models;\n\nclass User\n{\n    public function name()\n    {\n        return 'x';\n    }\n}\n",
    );
    write(
        &h.upstream,
        "app/Models/Post.php",
        b"<?php\n\nnamespace App\\Models;\n\nclass Post\n{\n}\n",
    );
    fs::remove_file(h.upstream.join("README.md")).unwrap();
    let head = commit_all(&h.upstream, "edit models");

    let payload = push_payload("main");
    let incremental = completed(
        orchestrator
            .run_scan("shop", Trigger::Webhook, Some(&payload))
            .await
            .unwrap(),
    );
    assert!(incremental.is_incremental);
    assert_eq!(incremental.revision, head);
    assert!(incremental.validation.as_ref().unwrap().is_valid);

    let inc_bundle = bundle_dir(&incremental);
    let inc_paths: BTreeSet<String> = index_entries(&inc_bundle)
        .into_iter()
        .map(|e| e.file_path)
        .collect();
    assert!(inc_paths.contains("app/Models/Post.php"));
    assert!(!inc_paths.contains("README.md"));

    let untouched_after: BTreeSet<String> = chunk_records(&inc_bundle)
        .into_iter()
        .filter(|c| c.file_path == "app/Http/Controllers/HomeController.php")
        .map(|c| c.chunk_id)
        .collect();
    assert_eq!(untouched_before, untouched_after);

    let full = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());
    assert!(!full.is_incremental);
    let full_bundle = bundle_dir(&full);
    let full_paths: BTreeSet<String> = index_entries(&full_bundle)
        .into_iter()
        .map(|e| e.file_path)
        .collect();
    assert_eq!(inc_paths, full_paths);
    assert_eq!(chunk_ids(&inc_bundle), chunk_ids(&full_bundle));

    let meta: ScanMeta =
        serde_json::from_str(&fs::read_to_string(inc_bundle.join("scan_meta.json")).unwrap())
            .unwrap();
    assert!(meta.is_incremental);
    assert_eq!(meta.previous_scan_id, first.kb_scan_id);
}

#[tokio::test]
async fn dependency_manifest_change_forces_full_scan() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();
    completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());

    write(
        &h.upstream,
        "composer.json",
        br#"{"require": {"php": "^8.3", "laravel/framework": "^11.0", "inertiajs/inertia-laravel": "^1.0"}}"#,
    );
    commit_all(&h.upstream, "add inertia");

    let payload = push_payload("main");
    let report = completed(
        orchestrator
            .run_scan("shop", Trigger::Webhook, Some(&payload))
            .await
            .unwrap(),
    );
    assert!(!report.is_incremental);
    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    assert!(project.stack_json.unwrap().contains("inertia"));
}

#[tokio::test]
async fn duplicate_webhooks_are_suppressed() {
    let h = Harness::with_config(|c| c.pipeline.webhook_dedup_secs = 60).await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();
    let payload = push_payload("main");

    completed(
        orchestrator
            .run_scan("shop", Trigger::Webhook, Some(&payload))
            .await
            .unwrap(),
    );
    let second = orchestrator
        .run_scan("shop", Trigger::Webhook, Some(&payload))
        .await
        .unwrap();
    assert!(matches!(second, ScanOutcome::Skipped(_)));

    // Manual triggers are deduplicated separately.
    completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());
    assert_eq!(projects::recent_scans(&h.pool, "shop", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn a_running_scan_blocks_another() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;

    let start = ScanStart {
        trigger: Trigger::Manual,
        scanner_version: SCANNER_VERSION,
        rules_version: "test",
        payload_json: None,
    };
    let held = projects::try_start_scan(&h.pool, "shop", &start)
        .await
        .unwrap()
        .unwrap();

    let outcome = h
        .orchestrator()
        .run_scan("shop", Trigger::Manual, None)
        .await
        .unwrap();
    assert!(matches!(outcome, ScanOutcome::Skipped(_)));

    projects::fail_scan(&h.pool, "shop", held, "released", 1, &[], "{}")
        .await
        .unwrap();
    completed(
        h.orchestrator()
            .run_scan("shop", Trigger::Manual, None)
            .await
            .unwrap(),
    );
}

#[tokio::test]
async fn concurrent_triggers_run_one_scan() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let a = h.orchestrator();
    let b = h.orchestrator();

    let (first, second) = tokio::join!(
        a.run_scan("shop", Trigger::Manual, None),
        b.run_scan("shop", Trigger::Manual, None)
    );
    let outcomes = [first.unwrap(), second.unwrap()];
    let done = outcomes
        .iter()
        .filter(|o| matches!(o, ScanOutcome::Completed(_)))
        .count();
    assert!(done >= 1);
    assert_eq!(projects::running_scans(&h.pool, "shop").await.unwrap(), 0);
    assert!(knowledge_base::list_bundles(&h.kb_dir("shop")).unwrap().len() <= 2);
}

#[tokio::test]
async fn sync_failure_exhausts_retries_and_releases_project() {
    let h = Harness::new().await;
    let missing = h._tmp.path().join("no-such-repo");
    h.add_project("ghost", &format!("file://{}", missing.display()))
        .await;

    let orchestrator = h.orchestrator();
    let outcome = orchestrator
        .run_scan("ghost", Trigger::Manual, None)
        .await
        .unwrap();
    let ScanOutcome::Failed(message) = outcome else {
        panic!("expected failure");
    };
    assert!(!message.is_empty());

    let project = projects::get_project(&h.pool, "ghost").await.unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert!(project.last_error.is_some());

    let scans = projects::recent_scans(&h.pool, "ghost", 10).await.unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].status, ScanStatus::Failed);
    assert_eq!(scans[0].attempts, 3);

    // The project is not left claimed.
    let again = orchestrator
        .run_scan("ghost", Trigger::Manual, None)
        .await
        .unwrap();
    assert!(matches!(again, ScanOutcome::Failed(_)));
}

#[tokio::test]
async fn tokens_never_reach_recorded_errors() {
    let h = Harness::with_config(|c| c.pipeline.git_timeout_secs = 20).await;
    h.add_project("private", "https://127.0.0.1:1/acme/private.git")
        .await;

    let secret = "ghp_supersecretvalue123";
    let orchestrator =
        h.orchestrator_with(StaticTokenProvider::new(Some(AccessToken::new(secret))));
    let outcome = orchestrator
        .run_scan("private", Trigger::Manual, None)
        .await
        .unwrap();
    let ScanOutcome::Failed(message) = outcome else {
        panic!("expected failure");
    };
    assert!(!message.contains(secret), "{}", message);

    let project = projects::get_project(&h.pool, "private").await.unwrap();
    assert!(!project.last_error.unwrap_or_default().contains(secret));

    let git_config = h
        .config
        .storage
        .root
        .join("private")
        .join("repo")
        .join(".git")
        .join("config");
    if git_config.exists() {
        assert!(!fs::read_to_string(git_config).unwrap().contains(secret));
    }
}

#[tokio::test]
async fn diff_lists_changes_between_revisions() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();
    let first = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());

    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    let same = orchestrator
        .repo_sync()
        .diff(&project, &first.revision, &first.revision)
        .await
        .unwrap();
    assert!(same.is_empty());

    write(&h.upstream, "routes/web.php", b"<?php\nRoute::get('/', fn () => view('home'));\n");
    fs::remove_file(h.upstream.join("README.md")).unwrap();
    commit_all(&h.upstream, "routes");
    let second = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());

    let changes = orchestrator
        .repo_sync()
        .diff(&project, &first.revision, &second.revision)
        .await
        .unwrap();
    assert_eq!(changes.added, vec!["routes/web.php".to_string()]);
    assert_eq!(changes.deleted, vec!["README.md".to_string()]);
    assert!(changes.modified.is_empty());
}

#[tokio::test]
async fn corrupted_bundle_fails_verification() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let report = completed(
        h.orchestrator()
            .run_scan("shop", Trigger::Manual, None)
            .await
            .unwrap(),
    );
    let bundle = bundle_dir(&report);

    let chunks = bundle.join("chunks.ndjson");
    let mut raw = fs::read_to_string(&chunks).unwrap();
    let mut stray = chunk_records(&bundle).remove(0);
    stray.chunk_id = "ffffffffffffffffffffffff".to_string();
    raw.push_str(&serde_json::to_string(&stray).unwrap());
    raw.push('\n');
    fs::write(&chunks, raw).unwrap();

    let summary = knowledge_base::verify_bundle(&bundle).unwrap();
    assert!(!summary.is_valid);
    assert_eq!(summary.orphaned_chunks, 1);
    assert_eq!(summary.missing_in_chunks, 0);
    assert_eq!(
        summary.samples.orphaned_chunks,
        vec!["ffffffffffffffffffffffff".to_string()]
    );
}

#[tokio::test]
async fn retention_keeps_newest_bundles() {
    let h = Harness::with_config(|c| c.knowledge_base.retention = 2).await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();

    let mut kept = Vec::new();
    for _ in 0..3 {
        let report = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());
        kept.push(report.kb_scan_id.unwrap());
    }

    let bundles = knowledge_base::list_bundles(&h.kb_dir("shop")).unwrap();
    assert_eq!(bundles.len(), 2);
    let names: Vec<String> = bundles
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert!(names.contains(&kept[2]));
    assert!(names.contains(&kept[1]));
    assert!(!names.contains(&kept[0]));
}

#[tokio::test]
async fn failed_full_scan_forces_next_webhook_to_rescan_in_full() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();
    let first = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());

    // The manifest commits, then writing the exclusion log fails.
    let log = h.config.storage.root.join("shop/knowledge/exclusion_log.json");
    fs::remove_file(&log).unwrap();
    fs::create_dir_all(log.join("blocker")).unwrap();
    let outcome = orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Failed(_)));
    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    assert!(project.last_revision.is_none());
    assert_eq!(project.last_kb_scan_id, first.kb_scan_id);

    fs::remove_dir_all(&log).unwrap();
    write(&h.upstream, "README.md", b"# Shop\n\nUpdated.\n");
    commit_all(&h.upstream, "docs");

    let payload = push_payload("main");
    let report = completed(
        orchestrator
            .run_scan("shop", Trigger::Webhook, Some(&payload))
            .await
            .unwrap(),
    );
    assert!(!report.is_incremental);
    let validation = report.validation.clone().unwrap();
    assert!(validation.is_valid, "{:?}", validation);
    assert_eq!(report.chunks_total, first.chunks_total);
    assert_eq!(
        chunk_records(&bundle_dir(&report))
            .iter()
            .filter(|c| c.file_path == "app/Models/User.php")
            .count(),
        chunk_records(&bundle_dir(&first))
            .iter()
            .filter(|c| c.file_path == "app/Models/User.php")
            .count()
    );
}

#[tokio::test]
async fn files_without_chunks_invalidate_the_bundle() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    completed(
        h.orchestrator()
            .run_scan("shop", Trigger::Manual, None)
            .await
            .unwrap(),
    );

    sqlx::query("DELETE FROM chunks WHERE project_id = ? AND path = ?")
        .bind("shop")
        .bind("app/Models/User.php")
        .execute(&h.pool)
        .await
        .unwrap();

    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    let ctx = BuildContext {
        workspace: Workspace::for_project(&h.config.storage.root, "shop"),
        is_incremental: false,
        previous_scan_id: project.last_kb_scan_id.clone(),
        rules_version: "test".to_string(),
        files_excluded: 0,
        started_at_ms: db::unix_now_ms(),
        ndjson_threshold: h.config.knowledge_base.ndjson_threshold,
    };
    let summary = knowledge_base::build(&h.pool, &project, &ctx).await.unwrap();
    assert!(!summary.is_valid);
    assert_eq!(summary.missing_in_chunks, 0);
    assert_eq!(summary.orphaned_chunks, 0);
    assert_eq!(summary.uncovered_files, 1);
    assert_eq!(
        summary.samples.uncovered_files,
        vec!["app/Models/User.php".to_string()]
    );

    let verified = knowledge_base::verify_bundle(Path::new(&summary.output_path)).unwrap();
    assert!(!verified.is_valid);
    assert_eq!(verified.uncovered_files, 1);
}

#[tokio::test]
async fn toggle_change_forces_full_scan() {
    let h = Harness::new().await;
    h.add_upstream("shop").await;
    let first = completed(
        h.orchestrator()
            .run_scan("shop", Trigger::Manual, None)
            .await
            .unwrap(),
    );
    assert!(!index_entries(&bundle_dir(&first))
        .iter()
        .any(|e| e.file_path == "vendor/acme/lib.php"));

    let mut vendored = h.config.clone();
    vendored.exclusions.toggles.include_vendor = true;
    let orchestrator = h.orchestrator_for(vendored, StaticTokenProvider::anonymous());

    write(&h.upstream, "README.md", b"# Shop\n\nVendored build.\n");
    commit_all(&h.upstream, "docs");
    let payload = push_payload("main");
    let report = completed(
        orchestrator
            .run_scan("shop", Trigger::Webhook, Some(&payload))
            .await
            .unwrap(),
    );
    assert!(!report.is_incremental);
    assert!(index_entries(&bundle_dir(&report))
        .iter()
        .any(|e| e.file_path == "vendor/acme/lib.php"));

    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    let recorded = project.exclusion_rules_version.unwrap();
    assert!(recorded.starts_with("2.0.0+"));
    let meta: ScanMeta = serde_json::from_str(
        &fs::read_to_string(bundle_dir(&first).join("scan_meta.json")).unwrap(),
    )
    .unwrap();
    assert_ne!(meta.exclusion_rules_version, recorded);
}

#[tokio::test]
async fn bundles_of_unfinished_scans_are_swept() {
    let h = Harness::with_config(|c| c.knowledge_base.retention = 2).await;
    h.add_upstream("shop").await;
    let orchestrator = h.orchestrator();
    let first = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());

    // Sorts after every real bundle, as one left by a scan that timed out
    // after renaming its bundle would.
    let leftover = h.kb_dir("shop").join("scan_shop_29991231T000000000_deadbeef");
    fs::create_dir_all(&leftover).unwrap();

    let second = completed(orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap());
    assert!(!leftover.exists());
    let names: BTreeSet<String> = knowledge_base::list_bundles(&h.kb_dir("shop"))
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        names,
        BTreeSet::from([first.kb_scan_id.clone().unwrap(), second.kb_scan_id.clone().unwrap()])
    );

    // A failing scan sweeps too and leaves recorded bundles alone.
    fs::create_dir_all(&leftover).unwrap();
    let log = h.config.storage.root.join("shop/knowledge/exclusion_log.json");
    fs::remove_file(&log).unwrap();
    fs::create_dir_all(log.join("blocker")).unwrap();
    let outcome = orchestrator.run_scan("shop", Trigger::Manual, None).await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Failed(_)));
    assert!(!leftover.exists());
    assert_eq!(knowledge_base::list_bundles(&h.kb_dir("shop")).unwrap().len(), 2);

    let project = projects::get_project(&h.pool, "shop").await.unwrap();
    assert_eq!(project.last_kb_scan_id, second.kb_scan_id);
}
