//! Working-copy scanner and manifest persistence.
//!
//! [`FileScanner::scan`] walks the working copy, drops excluded paths, and
//! hands every remaining file to the bounded worker pool. Each worker hashes
//! the file (streaming for large and binary files), counts lines, classifies
//! it, and extracts file-level symbols. Results are collected in path order.
//!
//! Failures on individual files are warnings: the file is left out of the
//! manifest and the scan goes on.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::Config;
use crate::db::{from_json_list, to_json_list};
use crate::error::{PipelineError, PipelineResult};
use crate::exclusion::{extension_of, ExclusionMatcher, ExclusionReason};
use crate::models::{ChangeSet, ContentExclusion, FileRecord, Stage};
use crate::progress::EventSink;
use crate::symbols;
use crate::workers;

/// Version of the scanning logic, recorded on every scan.
pub const SCANNER_VERSION: &str = "2.1.0";

const READ_BUF: usize = 64 * 1024;

/// Aggregates over one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub total_files: u64,
    pub files_excluded: u64,
    pub total_lines: u64,
    pub total_bytes: u64,
    pub binary_files: u64,
    pub content_skipped: u64,
}

impl ScanStats {
    pub fn from_records(files: &[FileRecord], files_excluded: u64) -> Self {
        let mut stats = ScanStats {
            total_files: files.len() as u64,
            files_excluded,
            ..Default::default()
        };
        for f in files {
            stats.total_lines += f.line_count;
            stats.total_bytes += f.size_bytes;
            if f.is_binary {
                stats.binary_files += 1;
            }
            if f.is_excluded {
                stats.content_skipped += 1;
            }
        }
        stats
    }
}

/// A path left out of the manifest by an exclusion rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedPath {
    pub path: String,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    /// Sorted by path.
    pub files: Vec<FileRecord>,
    pub stats: ScanStats,
    pub excluded: Vec<ExcludedPath>,
    pub warnings: Vec<String>,
}

/// Outcome of re-examining a single path.
#[derive(Debug)]
enum PathState {
    Record(FileRecord),
    Excluded(ExcludedPath),
    Gone,
    Failed(String),
}

#[derive(Clone)]
pub struct FileScanner {
    matcher: Arc<ExclusionMatcher>,
    max_file_size: u64,
    workers: usize,
    progress_every: usize,
    follow_symlinks: bool,
}

impl FileScanner {
    pub fn new(config: &Config) -> Result<Self> {
        let matcher = ExclusionMatcher::new(
            &config.exclusions,
            &config.languages,
            &config.framework_hints,
            config.scanner.sniff_bytes,
        )?;
        Ok(Self {
            matcher: Arc::new(matcher),
            max_file_size: config.scanner.max_file_size,
            workers: config.scanner.worker_count(),
            progress_every: config.scanner.progress_every.max(1),
            follow_symlinks: config.scanner.follow_symlinks,
        })
    }

    pub fn matcher(&self) -> &ExclusionMatcher {
        &self.matcher
    }

    pub fn rules_version(&self) -> &str {
        self.matcher.rules_version()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Scan the whole working copy at `root`.
    pub async fn scan(&self, root: &Path, events: &EventSink) -> PipelineResult<ScanOutput> {
        let walker = self.clone();
        let walk_root = root.to_path_buf();
        let (candidates, excluded, mut warnings) =
            tokio::task::spawn_blocking(move || walker.enumerate(&walk_root))
                .await
                .map_err(|e| {
                    PipelineError::failure(Stage::Manifest.name(), format!("walk failed: {}", e))
                })??;

        for w in &warnings {
            events.warn(Stage::Manifest, w.clone());
        }

        let total = candidates.len() as u64;
        let every = self.progress_every;
        events.progress(Stage::Manifest, 0, total);

        let worker = self.clone();
        let scan_root = root.to_path_buf();
        let results = workers::map_bounded(
            candidates,
            self.workers,
            move |rel: String| worker.scan_file(&scan_root, &rel).map_err(|e| (rel, e)),
            |done| {
                if done % every == 0 || done as u64 == total {
                    events.progress(Stage::Manifest, done as u64, total);
                }
            },
        )
        .await
        .map_err(|e| PipelineError::failure(Stage::Manifest.name(), format!("worker failed: {}", e)))?;

        let mut files = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(record) => files.push(record),
                Err((rel, reason)) => {
                    let message = format!("{}: {}", rel, reason);
                    events.warn(Stage::Manifest, message.clone());
                    warnings.push(message);
                }
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let stats = ScanStats::from_records(&files, excluded.len() as u64);
        Ok(ScanOutput {
            files,
            stats,
            excluded,
            warnings,
        })
    }

    /// Walk `root`, splitting files into scan candidates and excluded paths.
    fn enumerate(
        &self,
        root: &Path,
    ) -> PipelineResult<(Vec<String>, Vec<ExcludedPath>, Vec<String>)> {
        let canonical_root = root
            .canonicalize()
            .map_err(|e| PipelineError::io(root, e))?;
        let mut candidates = Vec::new();
        let mut excluded = Vec::new();
        let mut warnings = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                if entry.file_name() == ".git" {
                    return false;
                }
                match relative_path(root, entry.path()) {
                    Some(rel) => !self.matcher.is_excluded_dir(&rel),
                    None => true,
                }
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.loop_ancestor().is_some() {
                        warnings.push(format!("symlink loop skipped: {}", display_walk_path(&e)));
                    } else {
                        warnings.push(format!("walk error: {}", e));
                    }
                    continue;
                }
            };

            if entry.path_is_symlink() {
                if !self.follow_symlinks {
                    tracing::debug!(path = %entry.path().display(), "symlink not followed");
                    continue;
                }
                match entry.path().canonicalize() {
                    Ok(target) if target.starts_with(&canonical_root) => {}
                    _ => {
                        warnings.push(format!(
                            "symlink escapes working copy, skipped: {}",
                            entry.path().display()
                        ));
                        continue;
                    }
                }
            }

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_path(root, entry.path()) else {
                continue;
            };

            match self.matcher.exclusion_reason(&rel) {
                Some(reason) => excluded.push(ExcludedPath { path: rel, reason }),
                None => candidates.push(rel),
            }
        }

        candidates.sort();
        excluded.sort_by(|a, b| a.path.cmp(&b.path));
        Ok((candidates, excluded, warnings))
    }

    /// Build the record for one non-excluded file.
    pub fn scan_file(&self, root: &Path, rel: &str) -> Result<FileRecord, String> {
        let abs = root.join(rel);
        let meta = std::fs::metadata(&abs).map_err(|e| format!("stat failed: {}", e))?;
        let size = meta.len();
        let modified_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut record = FileRecord {
            path: rel.to_string(),
            extension: extension_of(rel),
            language: self.matcher.language_for(rel),
            size_bytes: size,
            line_count: 0,
            content_hash: String::new(),
            is_binary: false,
            is_excluded: false,
            exclusion_reason: None,
            framework_hints: Vec::new(),
            symbols_declared: Vec::new(),
            imports: Vec::new(),
            modified_at,
            rules_version: self.matcher.rules_version().to_string(),
        };

        if self.matcher.has_binary_extension(rel) || size > self.max_file_size {
            let streamed = stream_file(&abs, self.matcher.sniff_bytes())
                .map_err(|e| format!("read failed: {}", e))?;
            record.content_hash = streamed.hash;
            record.size_bytes = streamed.bytes;
            record.is_binary = self.matcher.has_binary_extension(rel) || streamed.header_has_null;
            record.line_count = if record.is_binary { 0 } else { streamed.lines };
            record.is_excluded = true;
            record.exclusion_reason = Some(if record.is_binary {
                ContentExclusion::Binary
            } else {
                ContentExclusion::TooLarge
            });
            record.framework_hints = self.matcher.framework_hints(rel, None);
            return Ok(record);
        }

        let bytes = std::fs::read(&abs).map_err(|e| format!("read failed: {}", e))?;
        record.size_bytes = bytes.len() as u64;
        record.content_hash = hex_digest(&bytes);

        let class = self.matcher.classify(rel, &bytes);
        if class.is_binary {
            record.is_binary = true;
            record.is_excluded = true;
            record.exclusion_reason = Some(ContentExclusion::Binary);
            record.framework_hints = self.matcher.framework_hints(rel, None);
            return Ok(record);
        }

        if bytes.is_empty() {
            record.is_excluded = true;
            record.exclusion_reason = Some(ContentExclusion::Empty);
            record.framework_hints = self.matcher.framework_hints(rel, None);
            return Ok(record);
        }

        record.line_count = count_lines(&bytes);
        match std::str::from_utf8(&bytes) {
            Ok(text) => {
                record.framework_hints = self.matcher.framework_hints(rel, Some(text));
                let found = symbols::extract(&record.language, text);
                record.symbols_declared = found.declared;
                record.imports = found.imports;
            }
            Err(_) => {
                record.is_excluded = true;
                record.exclusion_reason = Some(ContentExclusion::NotUtf8);
                record.framework_hints = self.matcher.framework_hints(rel, None);
            }
        }
        Ok(record)
    }

    fn rescan_path(&self, root: &Path, rel: &str) -> PathState {
        if !is_safe_relative(rel) {
            return PathState::Failed(format!("{}: unsafe path rejected", rel));
        }
        if let Some(reason) = self.matcher.exclusion_reason(rel) {
            return PathState::Excluded(ExcludedPath {
                path: rel.to_string(),
                reason,
            });
        }
        match std::fs::symlink_metadata(root.join(rel)) {
            Ok(meta) if meta.file_type().is_file() => {}
            Ok(meta) if meta.file_type().is_symlink() && self.follow_symlinks => {
                let contained = root
                    .canonicalize()
                    .ok()
                    .zip(root.join(rel).canonicalize().ok())
                    .map(|(r, t)| t.starts_with(r) && t.is_file())
                    .unwrap_or(false);
                if !contained {
                    return PathState::Gone;
                }
            }
            _ => return PathState::Gone,
        }
        match self.scan_file(root, rel) {
            Ok(record) => PathState::Record(record),
            Err(reason) => PathState::Failed(format!("{}: {}", rel, reason)),
        }
    }
}

struct Streamed {
    hash: String,
    bytes: u64,
    lines: u64,
    header_has_null: bool,
}

fn stream_file(path: &Path, sniff_bytes: usize) -> std::io::Result<Streamed> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    let mut bytes = 0u64;
    let mut newlines = 0u64;
    let mut last = None;
    let mut header_has_null = false;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        if (bytes as usize) < sniff_bytes {
            let window = (sniff_bytes - bytes as usize).min(n);
            header_has_null |= chunk[..window].contains(&0);
        }
        hasher.update(chunk);
        newlines += chunk.iter().filter(|b| **b == b'\n').count() as u64;
        last = chunk.last().copied();
        bytes += n as u64;
    }

    let lines = match last {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    };
    Ok(Streamed {
        hash: format!("{:x}", hasher.finalize()),
        bytes,
        lines,
        header_has_null,
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Lines as the chunker counts them: `\n`-terminated, plus a trailing
/// unterminated line.
pub fn count_lines(bytes: &[u8]) -> u64 {
    let newlines = bytes.iter().filter(|b| **b == b'\n').count() as u64;
    match bytes.last() {
        None | Some(b'\n') => newlines,
        Some(_) => newlines + 1,
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn display_walk_path(err: &walkdir::Error) -> String {
    err.path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

fn is_safe_relative(rel: &str) -> bool {
    !rel.is_empty()
        && Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[derive(Serialize)]
struct ExclusionLog<'a> {
    generated_at: String,
    rules_version: &'a str,
    total: usize,
    entries: &'a [ExcludedPath],
}

/// Write the paths dropped by exclusion rules to `exclusion_log.json`.
pub fn write_exclusion_log(
    knowledge_dir: &Path,
    rules_version: &str,
    excluded: &[ExcludedPath],
) -> PipelineResult<()> {
    let path = knowledge_dir.join("exclusion_log.json");
    let log = ExclusionLog {
        generated_at: chrono::Utc::now().to_rfc3339(),
        rules_version,
        total: excluded.len(),
        entries: excluded,
    };
    let json = serde_json::to_string_pretty(&log)?;
    std::fs::write(&path, json).map_err(|e| PipelineError::io(&path, e))
}

// ---------------------------------------------------------------------------
// Manifest persistence
// ---------------------------------------------------------------------------

/// Replace the project's manifest with `files` in one transaction.
///
/// Chunks are dropped with the old records; the chunk stage rebuilds them.
pub async fn persist_manifest(
    pool: &SqlitePool,
    project_id: &str,
    files: &[FileRecord],
) -> PipelineResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunks WHERE project_id = ?")
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM files WHERE project_id = ?")
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
    for file in files {
        upsert_file(&mut tx, project_id, file).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Apply a change set to the stored manifest.
///
/// Deleted paths, and changed paths that are now excluded, missing or
/// unreadable, are removed along with their chunks. Added and modified paths
/// are re-scanned and upserted by path, which keeps each file's surrogate
/// id. Returns the upserted records.
pub async fn update_changed_files(
    pool: &SqlitePool,
    scanner: &FileScanner,
    project_id: &str,
    root: &Path,
    changes: &ChangeSet,
    events: &EventSink,
) -> PipelineResult<Vec<FileRecord>> {
    let targets: Vec<String> = changes.upserted().cloned().collect();
    let total = targets.len() as u64;
    events.progress(Stage::Manifest, 0, total);

    let worker = scanner.clone();
    let scan_root: PathBuf = root.to_path_buf();
    let states = workers::map_bounded(
        targets.clone(),
        scanner.workers(),
        move |rel: String| worker.rescan_path(&scan_root, &rel),
        |_| {},
    )
    .await
    .map_err(|e| PipelineError::failure(Stage::Manifest.name(), format!("worker failed: {}", e)))?;

    let mut removals: Vec<String> = changes.deleted.clone();
    let mut records = Vec::new();
    for (rel, state) in targets.into_iter().zip(states) {
        match state {
            PathState::Record(record) => records.push(record),
            PathState::Excluded(_) | PathState::Gone => removals.push(rel),
            PathState::Failed(message) => {
                events.warn(Stage::Manifest, message);
                removals.push(rel);
            }
        }
    }
    removals.sort();
    removals.dedup();
    records.sort_by(|a, b| a.path.cmp(&b.path));

    let mut tx = pool.begin().await?;
    for rel in &removals {
        sqlx::query("DELETE FROM files WHERE project_id = ? AND path = ?")
            .bind(project_id)
            .bind(rel)
            .execute(&mut *tx)
            .await?;
    }
    for record in &records {
        upsert_file(&mut tx, project_id, record).await?;
        sqlx::query("DELETE FROM chunks WHERE project_id = ? AND path = ?")
            .bind(project_id)
            .bind(&record.path)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    events.progress(Stage::Manifest, total, total);
    tracing::debug!(
        project = project_id,
        upserted = records.len(),
        removed = removals.len(),
        "manifest updated incrementally"
    );
    Ok(records)
}

async fn upsert_file(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    project_id: &str,
    file: &FileRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO files (
            project_id, path, extension, language, size_bytes, line_count,
            content_hash, is_binary, is_excluded, exclusion_reason,
            framework_hints_json, symbols_declared_json, imports_json,
            modified_at, rules_version
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, path) DO UPDATE SET
            extension = excluded.extension,
            language = excluded.language,
            size_bytes = excluded.size_bytes,
            line_count = excluded.line_count,
            content_hash = excluded.content_hash,
            is_binary = excluded.is_binary,
            is_excluded = excluded.is_excluded,
            exclusion_reason = excluded.exclusion_reason,
            framework_hints_json = excluded.framework_hints_json,
            symbols_declared_json = excluded.symbols_declared_json,
            imports_json = excluded.imports_json,
            modified_at = excluded.modified_at,
            rules_version = excluded.rules_version
        "#,
    )
    .bind(project_id)
    .bind(&file.path)
    .bind(&file.extension)
    .bind(&file.language)
    .bind(file.size_bytes as i64)
    .bind(file.line_count as i64)
    .bind(&file.content_hash)
    .bind(file.is_binary)
    .bind(file.is_excluded)
    .bind(file.exclusion_reason.map(|r| r.as_str()))
    .bind(to_json_list(&file.framework_hints))
    .bind(to_json_list(&file.symbols_declared))
    .bind(to_json_list(&file.imports))
    .bind(file.modified_at)
    .bind(&file.rules_version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// The stored manifest, sorted by path.
pub async fn load_manifest(pool: &SqlitePool, project_id: &str) -> PipelineResult<Vec<FileRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT path, extension, language, size_bytes, line_count, content_hash,
               is_binary, is_excluded, exclusion_reason, framework_hints_json,
               symbols_declared_json, imports_json, modified_at, rules_version
        FROM files
        WHERE project_id = ?
        ORDER BY path
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| FileRecord {
            path: row.get("path"),
            extension: row.get("extension"),
            language: row.get("language"),
            size_bytes: row.get::<i64, _>("size_bytes") as u64,
            line_count: row.get::<i64, _>("line_count") as u64,
            content_hash: row.get("content_hash"),
            is_binary: row.get("is_binary"),
            is_excluded: row.get("is_excluded"),
            exclusion_reason: row
                .get::<Option<String>, _>("exclusion_reason")
                .as_deref()
                .and_then(ContentExclusion::parse),
            framework_hints: from_json_list(&row.get::<String, _>("framework_hints_json")),
            symbols_declared: from_json_list(&row.get::<String, _>("symbols_declared_json")),
            imports: from_json_list(&row.get::<String, _>("imports_json")),
            modified_at: row.get("modified_at"),
            rules_version: row.get("rules_version"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn scanner(f: impl FnOnce(&mut Config)) -> FileScanner {
        let mut config = Config::minimal();
        config.scanner.workers = 2;
        f(&mut config);
        FileScanner::new(&config).unwrap()
    }

    #[test]
    fn counts_lines_like_the_chunker() {
        assert_eq!(count_lines(b""), 0);
        assert_eq!(count_lines(b"a"), 1);
        assert_eq!(count_lines(b"a\n"), 1);
        assert_eq!(count_lines(b"a\nb"), 2);
        assert_eq!(count_lines(b"\n\n"), 2);
    }

    #[test]
    fn scan_file_text_record() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "app/User.php", b"<?php\nclass User {}\n");
        let s = scanner(|_| {});
        let rec = s.scan_file(tmp.path(), "app/User.php").unwrap();
        assert_eq!(rec.language, "php");
        assert_eq!(rec.extension, "php");
        assert_eq!(rec.line_count, 2);
        assert_eq!(rec.size_bytes, 20);
        assert_eq!(rec.content_hash, hex_digest(b"<?php\nclass User {}\n"));
        assert!(!rec.is_excluded);
        assert_eq!(rec.symbols_declared, vec!["User"]);
        assert_eq!(rec.rules_version, s.rules_version());
        assert!(rec.rules_version.starts_with("2.0.0+"));
    }

    #[test]
    fn scan_file_flags_binary_large_empty_and_non_utf8() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "logo.png", b"\x89PNG\r\n");
        write(tmp.path(), "blob.dat", b"ab\0cd");
        write(tmp.path(), "empty.txt", b"");
        write(tmp.path(), "latin1.txt", b"caf\xe9\n");
        write(tmp.path(), "big.txt", &b"line\n".repeat(100));
        let s = scanner(|c| c.scanner.max_file_size = 100);

        let png = s.scan_file(tmp.path(), "logo.png").unwrap();
        assert!(png.is_binary);
        assert_eq!(png.exclusion_reason, Some(ContentExclusion::Binary));

        let dat = s.scan_file(tmp.path(), "blob.dat").unwrap();
        assert!(dat.is_binary);

        let empty = s.scan_file(tmp.path(), "empty.txt").unwrap();
        assert_eq!(empty.exclusion_reason, Some(ContentExclusion::Empty));
        assert!(!empty.is_chunkable());

        let latin = s.scan_file(tmp.path(), "latin1.txt").unwrap();
        assert_eq!(latin.exclusion_reason, Some(ContentExclusion::NotUtf8));
        assert_eq!(latin.line_count, 1);

        let big = s.scan_file(tmp.path(), "big.txt").unwrap();
        assert_eq!(big.exclusion_reason, Some(ContentExclusion::TooLarge));
        assert_eq!(big.line_count, 100);
        assert_eq!(big.content_hash, hex_digest(&b"line\n".repeat(100)));
    }

    #[tokio::test]
    async fn scan_applies_exclusions_and_sorts() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.php", b"<?php\n");
        write(tmp.path(), "a/z.js", b"let a = 1;\n");
        write(tmp.path(), "vendor/lib.php", b"<?php\n");
        write(tmp.path(), "composer.lock", b"{}\n");
        write(tmp.path(), ".git/HEAD", b"ref: refs/heads/main\n");

        let out = scanner(|_| {})
            .scan(tmp.path(), &EventSink::disabled())
            .await
            .unwrap();
        let paths: Vec<&str> = out.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a/z.js", "b.php"]);
        assert_eq!(out.stats.total_files, 2);
        // vendor/ is pruned as a directory, so only the lock file is logged.
        assert_eq!(out.excluded.len(), 1);
        assert_eq!(out.excluded[0].path, "composer.lock");
        assert_eq!(out.stats.files_excluded, 1);
    }

    #[tokio::test]
    async fn toggling_vendor_adds_exactly_vendor_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "app/a.php", b"<?php\n");
        write(tmp.path(), "vendor/lib.php", b"<?php\n");
        write(tmp.path(), "vendor/pkg/src/x.php", b"<?php\n");

        let base = scanner(|_| {})
            .scan(tmp.path(), &EventSink::disabled())
            .await
            .unwrap();
        assert!(base.files.iter().all(|f| !f.path.starts_with("vendor/")));

        let with_vendor = scanner(|c| c.exclusions.toggles.include_vendor = true)
            .scan(tmp.path(), &EventSink::disabled())
            .await
            .unwrap();
        assert_eq!(with_vendor.stats.total_files, base.stats.total_files + 2);
        let added: Vec<&str> = with_vendor
            .files
            .iter()
            .map(|f| f.path.as_str())
            .filter(|p| p.starts_with("vendor/"))
            .collect();
        assert_eq!(added, vec!["vendor/lib.php", "vendor/pkg/src/x.php"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed_by_default() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        write(outside.path(), "secret.txt", b"nope\n");
        write(tmp.path(), "real.txt", b"yes\n");
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), tmp.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(tmp.path(), tmp.path().join("loop")).unwrap();

        let out = scanner(|_| {})
            .scan(tmp.path(), &EventSink::disabled())
            .await
            .unwrap();
        let paths: Vec<&str> = out.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["real.txt"]);

        let followed = scanner(|c| c.scanner.follow_symlinks = true)
            .scan(tmp.path(), &EventSink::disabled())
            .await
            .unwrap();
        assert!(followed.files.iter().all(|f| f.path != "link.txt"));
        assert!(followed.warnings.iter().any(|w| w.contains("link.txt")));
    }

    #[test]
    fn rejects_traversal_in_changed_paths() {
        let tmp = TempDir::new().unwrap();
        let s = scanner(|_| {});
        assert!(matches!(
            s.rescan_path(tmp.path(), "../etc/passwd"),
            PathState::Failed(_)
        ));
        assert!(matches!(s.rescan_path(tmp.path(), "missing.php"), PathState::Gone));
    }
}
