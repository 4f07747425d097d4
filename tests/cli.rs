use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kb");
    path
}

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
    assert!(output.status.success(), "git {:?} failed", args);
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn setup_test_env() -> (TempDir, PathBuf, String) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let repo = root.join("upstream");
    fs::create_dir_all(repo.join("src")).unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    fs::write(
        repo.join("package.json"),
        r#"{"dependencies": {"vue": "^3.4.0"}}"#,
    )
    .unwrap();
    fs::write(
        repo.join("src/app.js"),
        "import { createApp } from 'vue';\n\nexport function boot() {\n  return createApp({});\n}\n",
    )
    .unwrap();
    fs::write(repo.join("README.md"), "# Demo\n").unwrap();
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-q", "-m", "initial"]);
    let head = git(&repo, &["rev-parse", "HEAD"]);

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[db]
path = "{root}/data/kb.sqlite"

[storage]
root = "{root}/data/projects"

[pipeline]
max_attempts = 2
backoff_base_ms = 1
backoff_max_ms = 5
"#,
        root = root.display()
    );
    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, head)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("KB_GIT_TOKEN")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn repo_url(config_path: &Path) -> String {
    let root = config_path.parent().unwrap().parent().unwrap();
    format!("file://{}", root.join("upstream").display())
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path, _) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path, _) = setup_test_env();

    let (_, _, success1) = run_kb(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_kb(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_kb(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_project_add_list_remove() {
    let (_tmp, config_path, _) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let url = repo_url(&config_path);

    let (stdout, stderr, success) =
        run_kb(&config_path, &["project", "add", "demo", &url, "--branch", "main"]);
    assert!(success, "add failed: {}", stderr);
    assert!(stdout.contains("Added project demo"));

    let (_, _, dup) = run_kb(&config_path, &["project", "add", "demo", &url]);
    assert!(!dup, "duplicate id should be rejected");

    let (_, stderr, bad) = run_kb(&config_path, &["project", "add", "Bad Slug", &url]);
    assert!(!bad);
    assert!(stderr.contains("not a valid project id"));

    let (stdout, _, success) = run_kb(&config_path, &["project", "list"]);
    assert!(success);
    assert!(stdout.contains("demo"));
    assert!(stdout.contains("pending"));

    let (stdout, _, success) = run_kb(&config_path, &["project", "remove", "demo"]);
    assert!(success);
    assert!(stdout.contains("Removed project demo"));

    let (stdout, _, _) = run_kb(&config_path, &["project", "list"]);
    assert!(stdout.contains("No projects registered"));
}

#[test]
fn test_scan_status_verify() {
    let (_tmp, config_path, head) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let url = repo_url(&config_path);
    run_kb(&config_path, &["project", "add", "demo", &url]);

    let (stdout, stderr, success) =
        run_kb(&config_path, &["scan", "demo", "--progress", "off"]);
    assert!(success, "scan failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("completed (full)"));
    assert!(stdout.contains(&head));
    assert!(stdout.contains("valid:     yes"));

    let (stdout, _, success) = run_kb(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("demo"));
    assert!(stdout.contains("ready"));

    let (stdout, _, success) = run_kb(&config_path, &["status", "demo"]);
    assert!(success);
    assert!(stdout.contains("Recent scans"));
    assert!(stdout.contains("vue"));

    let (stdout, stderr, success) = run_kb(&config_path, &["verify", "demo"]);
    assert!(success, "verify failed: {}", stderr);
    assert!(stdout.contains("valid:     yes"));

    let (stdout, _, success) = run_kb(&config_path, &["diff", "demo", &head, &head]);
    assert!(success);
    assert!(stdout.trim().is_empty());
}

#[test]
fn test_scan_json_report() {
    let (_tmp, config_path, head) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let url = repo_url(&config_path);
    run_kb(&config_path, &["project", "add", "demo", &url]);

    let (stdout, stderr, success) = run_kb(
        &config_path,
        &["scan", "demo", "--progress", "json", "--json"],
    );
    assert!(success, "scan failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["revision"], head.as_str());
    assert_eq!(report["validation"]["is_valid"], true);
    assert!(stderr.contains("\"stage\""));
}

#[test]
fn test_webhook_payload_for_other_branch_is_skipped() {
    let (tmp, config_path, _) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let url = repo_url(&config_path);
    run_kb(&config_path, &["project", "add", "demo", &url]);

    let payload = tmp.path().join("push.json");
    fs::write(&payload, r#"{"ref": "refs/heads/develop", "after": "abc"}"#).unwrap();
    let (stdout, stderr, success) = run_kb(
        &config_path,
        &["scan", "demo", "--payload", payload.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "{}", stderr);
    assert!(stdout.contains("skipped"));
}

#[test]
fn test_failed_scan_exits_nonzero() {
    let (tmp, config_path, _) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let missing = format!("file://{}", tmp.path().join("missing").display());
    run_kb(&config_path, &["project", "add", "ghost", &missing]);

    let (_, stderr, success) = run_kb(&config_path, &["scan", "ghost", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("failed"));

    let (stdout, _, _) = run_kb(&config_path, &["status"]);
    assert!(stdout.contains("failed"));
}

#[test]
fn test_verify_without_bundle_fails() {
    let (_tmp, config_path, _) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let url = repo_url(&config_path);
    run_kb(&config_path, &["project", "add", "demo", &url]);

    let (_, stderr, success) = run_kb(&config_path, &["verify", "demo"]);
    assert!(!success);
    assert!(stderr.contains("no knowledge base bundle"));

    let (_, _, success) = run_kb(&config_path, &["verify", "nobody"]);
    assert!(!success);
}

#[test]
fn test_remove_deletes_storage_unless_kept() {
    let (tmp, config_path, _) = setup_test_env();
    run_kb(&config_path, &["init"]);
    let url = repo_url(&config_path);
    run_kb(&config_path, &["project", "add", "demo", &url]);
    run_kb(&config_path, &["project", "add", "kept", &url]);
    for id in ["demo", "kept"] {
        let (_, stderr, success) = run_kb(&config_path, &["scan", id, "--progress", "off"]);
        assert!(success, "{}", stderr);
    }

    let storage = tmp.path().join("data/projects/demo");
    assert!(storage.join("repo").is_dir());
    let (stdout, stderr, success) = run_kb(&config_path, &["project", "remove", "demo"]);
    assert!(success, "{}", stderr);
    assert!(stdout.contains("deleted"));
    assert!(!storage.exists());

    let kept = tmp.path().join("data/projects/kept");
    let (_, stderr, success) =
        run_kb(&config_path, &["project", "remove", "kept", "--keep-storage"]);
    assert!(success, "{}", stderr);
    assert!(kept.join("repo").is_dir());

    let (stdout, _, _) = run_kb(&config_path, &["project", "list"]);
    assert!(stdout.contains("No projects registered"));
}
