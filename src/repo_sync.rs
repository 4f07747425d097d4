//! Working-copy synchronization.
//!
//! Every project owns a directory under the storage root:
//!
//! ```text
//! <storage.root>/<project>/
//!   repo/         working copy (shallow, single branch)
//!   knowledge/    stack.json, exclusion_log.json
//!   kb/<scan_id>/ knowledge base bundles
//! ```
//!
//! Git runs as a child process with an explicit timeout; the child is killed
//! when the future is dropped. Credentials are embedded in the remote URL
//! only for the duration of one [`RepoSync::sync_to_latest`] call and every
//! message that leaves this module is passed through [`redact`] first.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::credentials::AccessToken;
use crate::error::{PipelineError, PipelineResult, SyncError};
use crate::models::{ChangeSet, Project};

/// Replacement text for secrets.
pub const REDACTED: &str = "[REDACTED]";

static URL_USERINFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-zA-Z][a-zA-Z0-9+.-]*://)[^/@\s]+@").expect("static url pattern"));

/// Directory layout of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub repo: PathBuf,
    pub knowledge: PathBuf,
    pub kb: PathBuf,
}

impl Workspace {
    pub fn for_project(storage_root: &Path, project_id: &str) -> Self {
        let root = storage_root.join(project_id);
        Self {
            repo: root.join("repo"),
            knowledge: root.join("knowledge"),
            kb: root.join("kb"),
            root,
        }
    }
}

/// Git operations for one storage root.
#[derive(Debug, Clone)]
pub struct RepoSync {
    storage_root: PathBuf,
    git_timeout: Duration,
}

impl RepoSync {
    pub fn new(storage_root: impl Into<PathBuf>, git_timeout: Duration) -> Self {
        Self {
            storage_root: storage_root.into(),
            git_timeout,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn workspace(&self, project_id: &str) -> Workspace {
        Workspace::for_project(&self.storage_root, project_id)
    }

    /// Create the project's directories. Safe to call repeatedly and
    /// concurrently.
    pub async fn ensure_workspace(&self, project: &Project) -> PipelineResult<Workspace> {
        let ws = self.workspace(&project.id);
        for dir in [&self.storage_root, &ws.root, &ws.knowledge, &ws.kb] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PipelineError::io(dir, e))?;
        }
        ensure_contained(&self.storage_root, &ws.root)?;
        if ws.repo.exists() {
            ensure_contained(&self.storage_root, &ws.repo)?;
        }
        Ok(ws)
    }

    /// Delete the project's working copy, knowledge files and bundles.
    /// Returns whether anything was on disk.
    pub async fn remove_workspace(&self, project_id: &str) -> PipelineResult<bool> {
        let ws = self.workspace(project_id);
        if !ws.root.exists() {
            return Ok(false);
        }
        let target = ensure_contained(&self.storage_root, &ws.root)?;
        if Some(target.as_path()) == self.storage_root.canonicalize().ok().as_deref() {
            return Err(PipelineError::Integrity(format!(
                "refusing to delete storage root `{}`",
                target.display()
            )));
        }
        tokio::fs::remove_dir_all(&target)
            .await
            .map_err(|e| PipelineError::io(&target, e))?;
        tracing::info!(project = project_id, path = %target.display(), "workspace removed");
        Ok(true)
    }

    /// Bring the working copy to the tip of the project's branch and return
    /// the resulting 40-character revision.
    ///
    /// The token is consumed; once this returns the remote URL on disk no
    /// longer carries it.
    pub async fn sync_to_latest(
        &self,
        project: &Project,
        token: Option<AccessToken>,
    ) -> PipelineResult<String> {
        let ws = self.ensure_workspace(project).await?;
        let secret = token.as_ref().map(|t| t.expose().to_string());
        let remote = authenticated_url(&project.repo_url, token.as_ref());
        drop(token);

        let result = self.sync_inner(&ws, project, &remote, secret.as_deref()).await;

        if secret.is_some() && ws.repo.join(".git").exists() {
            if let Err(e) = self
                .git(
                    Some(&ws.repo),
                    &["remote", "set-url", "origin", &project.repo_url],
                    None,
                )
                .await
            {
                tracing::warn!(project = %project.id, error = %e, "failed to reset remote url");
            }
        }

        let revision = result?;
        ensure_contained(&self.storage_root, &ws.repo)?;
        Ok(revision)
    }

    async fn sync_inner(
        &self,
        ws: &Workspace,
        project: &Project,
        remote: &str,
        secret: Option<&str>,
    ) -> PipelineResult<String> {
        let branch = project.branch();

        if ws.repo.join(".git").exists() {
            tracing::debug!(project = %project.id, branch, "updating working copy");
            self.git(Some(&ws.repo), &["remote", "set-url", "origin", remote], secret)
                .await
                .map_err(|e| with_ref(e, branch))?;
            self.git(Some(&ws.repo), &["fetch", "origin", branch], secret)
                .await
                .map_err(|e| with_ref(e, branch))?;
            self.git(Some(&ws.repo), &["reset", "--hard", "FETCH_HEAD"], secret)
                .await?;
            self.git(Some(&ws.repo), &["clean", "-fdx"], secret).await?;
        } else {
            if ws.repo.exists() {
                // Leftover from an interrupted clone.
                tokio::fs::remove_dir_all(&ws.repo)
                    .await
                    .map_err(|e| PipelineError::io(&ws.repo, e))?;
            }
            tracing::debug!(project = %project.id, branch, "cloning working copy");
            let dest = ws.repo.to_string_lossy().to_string();
            self.git(
                None,
                &[
                    "clone",
                    "--depth=1",
                    "--branch",
                    branch,
                    "--single-branch",
                    remote,
                    &dest,
                ],
                secret,
            )
            .await
            .map_err(|e| with_ref(e, branch))?;
        }

        self.head_revision(&ws.repo).await
    }

    /// Full hash of HEAD in `repo`.
    pub async fn head_revision(&self, repo: &Path) -> PipelineResult<String> {
        let out = self.git(Some(repo), &["rev-parse", "HEAD"], None).await?;
        let rev = String::from_utf8_lossy(&out).trim().to_string();
        if !is_full_revision(&rev) {
            return Err(PipelineError::Integrity(format!(
                "HEAD resolved to `{}`, expected a 40-character revision",
                rev
            )));
        }
        Ok(rev)
    }

    /// Paths changed between two revisions of the project's working copy.
    ///
    /// A rename is reported as a modification of the new path plus a
    /// deletion of the old one. When `from` is missing from a shallow copy
    /// it is fetched once before giving up.
    pub async fn diff(&self, project: &Project, from: &str, to: &str) -> PipelineResult<ChangeSet> {
        let repo = self.workspace(&project.id).repo;
        for rev in [from, to] {
            if !self.has_commit(&repo, rev).await {
                tracing::debug!(project = %project.id, rev, "fetching missing revision");
                let fetched = self
                    .git(Some(&repo), &["fetch", "--depth=1", "origin", rev], None)
                    .await;
                if fetched.is_err() || !self.has_commit(&repo, rev).await {
                    return Err(SyncError::MissingRevision(rev.to_string()).into());
                }
            }
        }

        let out = self
            .git(
                Some(&repo),
                &["diff", "--name-status", "-z", "--find-renames", from, to],
                None,
            )
            .await?;
        Ok(parse_name_status(&out))
    }

    async fn has_commit(&self, repo: &Path, rev: &str) -> bool {
        let spec = format!("{}^{{commit}}", rev);
        self.git(Some(repo), &["cat-file", "-e", &spec], None)
            .await
            .is_ok()
    }

    /// Run git and return stdout. Failures are classified and redacted.
    async fn git(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        secret: Option<&str>,
    ) -> Result<Vec<u8>, SyncError> {
        let command = args.first().copied().unwrap_or("git").to_string();
        let mut cmd = Command::new("git");
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.git_timeout, cmd.output()).await {
            Ok(result) => result.map_err(SyncError::Spawn)?,
            Err(_) => {
                return Err(SyncError::Network(format!(
                    "git {} timed out after {}s",
                    command,
                    self.git_timeout.as_secs()
                )))
            }
        };

        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = redact(String::from_utf8_lossy(&output.stderr).trim(), secret);
        Err(classify_failure(&command, stderr))
    }
}

/// Attach the branch name to a missing-ref failure.
fn with_ref(err: SyncError, branch: &str) -> SyncError {
    match err {
        SyncError::MissingRef { message, .. } => SyncError::MissingRef {
            reference: branch.to_string(),
            message,
        },
        other => other,
    }
}

/// Map git's stderr onto the sync error taxonomy. `message` is already
/// redacted.
pub fn classify_failure(command: &str, message: String) -> SyncError {
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&[
        "authentication failed",
        "could not read username",
        "could not read password",
        "terminal prompts disabled",
        "access denied",
        "permission denied",
        "invalid username or password",
        "the requested url returned error: 401",
        "the requested url returned error: 403",
    ]) {
        SyncError::Auth(message)
    } else if any(&[
        "couldn't find remote ref",
        "remote branch",
        "not found in upstream",
        "invalid refspec",
    ]) {
        SyncError::MissingRef {
            reference: String::new(),
            message,
        }
    } else if any(&[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "connection reset",
        "failed to connect",
        "unable to access",
        "network is unreachable",
        "early eof",
        "the remote end hung up",
        "operation timed out",
    ]) {
        SyncError::Network(message)
    } else {
        SyncError::Git {
            command: command.to_string(),
            message,
        }
    }
}

/// Remove `secret` and any URL user-info from `text`.
pub fn redact(text: &str, secret: Option<&str>) -> String {
    let mut out = match secret {
        Some(s) if !s.is_empty() => text.replace(s, REDACTED),
        _ => text.to_string(),
    };
    out = URL_USERINFO
        .replace_all(&out, format!("${{1}}{}@", REDACTED).as_str())
        .into_owned();
    out
}

/// Remote URL carrying `token` for HTTP(S) remotes. Other schemes and local
/// paths are returned unchanged.
pub fn authenticated_url(url: &str, token: Option<&AccessToken>) -> String {
    let Some(token) = token else {
        return url.to_string();
    };
    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            let host_and_path = match rest.find('/') {
                Some(slash) => {
                    let (authority, path) = rest.split_at(slash);
                    let host = authority.rsplit('@').next().unwrap_or(authority);
                    format!("{}{}", host, path)
                }
                None => rest.rsplit('@').next().unwrap_or(rest).to_string(),
            };
            return format!(
                "{}x-access-token:{}@{}",
                scheme,
                token.expose(),
                host_and_path
            );
        }
    }
    url.to_string()
}

/// Reject `path` if, once resolved, it lies outside `root`.
///
/// Missing trailing components are resolved through their nearest existing
/// ancestor so the check also covers paths about to be created.
pub fn ensure_contained(root: &Path, path: &Path) -> PipelineResult<PathBuf> {
    let root = root
        .canonicalize()
        .map_err(|e| PipelineError::io(root, e))?;
    let resolved = resolve_existing_prefix(path)?;
    if !resolved.starts_with(&root) {
        return Err(PipelineError::Integrity(format!(
            "path `{}` escapes storage root `{}`",
            path.display(),
            root.display()
        )));
    }
    Ok(resolved)
}

fn resolve_existing_prefix(path: &Path) -> PipelineResult<PathBuf> {
    let mut tail = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        match current.canonicalize() {
            Ok(base) => {
                let mut out = base;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(e) => {
                let Some(name) = current.file_name().map(|n| n.to_os_string()) else {
                    return Err(PipelineError::io(path, e));
                };
                if name == ".." {
                    return Err(PipelineError::Integrity(format!(
                        "unresolvable path `{}`",
                        path.display()
                    )));
                }
                tail.push(name);
                if !current.pop() {
                    return Err(PipelineError::io(path, e));
                }
            }
        }
    }
}

pub fn is_full_revision(rev: &str) -> bool {
    rev.len() == 40 && rev.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse `git diff --name-status -z` output.
pub fn parse_name_status(raw: &[u8]) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut fields = raw
        .split(|b| *b == 0)
        .map(|f| String::from_utf8_lossy(f).to_string());

    while let Some(status) = fields.next() {
        let Some(kind) = status.chars().next() else {
            continue;
        };
        let Some(path) = fields.next() else {
            break;
        };
        match kind {
            'A' => changes.added.push(path),
            'M' | 'T' | 'U' => changes.modified.push(path),
            'D' => changes.deleted.push(path),
            'R' => {
                if let Some(new_path) = fields.next() {
                    changes.deleted.push(path);
                    changes.modified.push(new_path);
                }
            }
            'C' => {
                if let Some(new_path) = fields.next() {
                    changes.added.push(new_path);
                }
            }
            _ => changes.modified.push(path),
        }
    }

    for list in [&mut changes.added, &mut changes.modified, &mut changes.deleted] {
        list.sort();
        list.dedup();
    }
    changes
}
