//! Knowledge base bundle assembly.
//!
//! A bundle is one directory per successful scan under the project's `kb/`
//! directory:
//!
//! ```text
//! kb/
//!   scan_<project>_<YYYYMMDDTHHMMSSmmm>_<rev8>/
//!     scan_meta.json
//!     files_index.json        (files_index.ndjson above the threshold)
//!     chunks.ndjson
//!     directory_stats.json
//! ```
//!
//! Artifacts are written into `.<scan_id>.partial/` and renamed into place
//! once complete, so a bundle directory without the dot prefix is always
//! whole. The file index recomputes every chunk id from the manifest's file
//! hash while the chunk store emits the stored ids; comparing the two sides
//! detects chunks that were not rebuilt after their file changed. Every
//! chunkable file must also have chunks tiling lines `1..=total_lines`
//! without gaps or overlaps.
//!
//! A bundle counts once a completed scan records its id. [`sweep_unrecorded`]
//! removes directories left by scans that never completed, and
//! [`prune_bundles`] applies retention to recorded bundles only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::chunk_id::ChunkId;
use crate::db::from_json_list;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{FileRecord, Project};
use crate::repo_sync::{is_full_revision, redact, Workspace};
use crate::scanner::{self, SCANNER_VERSION};

pub const SCAN_META_FILE: &str = "scan_meta.json";
pub const FILES_INDEX_JSON: &str = "files_index.json";
pub const FILES_INDEX_NDJSON: &str = "files_index.ndjson";
pub const CHUNKS_FILE: &str = "chunks.ndjson";
pub const DIRECTORY_STATS_FILE: &str = "directory_stats.json";

/// Upper bound on mismatch samples kept in a summary.
pub const MAX_SAMPLES: usize = 10;

const CHUNK_PAGE: i64 = 500;

/// Inputs to one bundle build that do not live on the project row.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub workspace: Workspace,
    pub is_incremental: bool,
    pub previous_scan_id: Option<String>,
    pub rules_version: String,
    /// Paths dropped by exclusion rules during the scan.
    pub files_excluded: u64,
    /// Scan start, Unix milliseconds.
    pub started_at_ms: i64,
    pub ndjson_threshold: usize,
}

/// Result of checking that file index and chunk store reference the same
/// chunk ids exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub is_valid: bool,
    pub scan_id: String,
    pub output_path: String,
    pub files_index_entries: u64,
    pub chunks_count: u64,
    pub chunk_ids_in_index: u64,
    pub chunk_ids_in_chunks: u64,
    pub missing_in_chunks: u64,
    pub orphaned_chunks: u64,
    /// Index references beyond the first to the same chunk id.
    pub duplicate_references: u64,
    /// Chunk store records repeating an earlier id.
    pub duplicate_chunks: u64,
    /// Chunkable files whose chunks do not cover every line exactly once.
    #[serde(default)]
    pub uncovered_files: u64,
    pub coverage_percent: f64,
    #[serde(default)]
    pub samples: MismatchSamples,
}

impl ValidationSummary {
    fn record_uncovered(&mut self, paths: &[String]) {
        self.uncovered_files = paths.len() as u64;
        for path in paths {
            push_sample(&mut self.samples.uncovered_files, path);
        }
        if !paths.is_empty() {
            self.is_valid = false;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchSamples {
    pub missing_in_chunks: Vec<String>,
    pub orphaned_chunks: Vec<String>,
    pub duplicated: Vec<String>,
    #[serde(default)]
    pub uncovered_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanMeta {
    pub scan_id: String,
    pub project_id: String,
    pub repo_url: String,
    pub default_branch: String,
    pub selected_branch: String,
    pub head_revision: String,
    pub scanned_at_iso: String,
    pub scanner_version: String,
    pub exclusion_rules_version: String,
    pub is_incremental: bool,
    pub previous_scan_id: Option<String>,
    pub stats: MetaStats,
    pub validation: ValidationSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaStats {
    pub total_files_scanned: u64,
    pub total_files_excluded: u64,
    pub content_skipped: u64,
    pub total_chunks: u64,
    pub total_lines: u64,
    pub total_bytes: u64,
    pub scan_duration_ms: u64,
}

/// One `files_index` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIndexEntry {
    pub file_path: String,
    pub extension: String,
    pub language: String,
    pub size_bytes: u64,
    pub total_lines: u64,
    pub file_hash: String,
    pub is_binary: bool,
    pub is_excluded: bool,
    pub exclusion_reason: Option<String>,
    pub framework_hints: Vec<String>,
    pub chunk_ids: Vec<String>,
    pub chunk_count: usize,
    pub symbols_declared: Vec<String>,
    pub imports: Vec<String>,
}

/// One `chunks.ndjson` line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub file_path: String,
    pub file_hash: String,
    pub start_line: u64,
    pub end_line: u64,
    pub chunk_index: u32,
    pub is_complete_file: bool,
    pub chunk_bytes: u64,
    pub chunk_lines: u64,
    pub chunk_hash: String,
    pub content: String,
    pub symbols_declared: Vec<String>,
    pub symbols_used: Vec<String>,
    pub imports: Vec<String>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStat {
    pub directory: String,
    pub file_count: u64,
    pub total_lines: u64,
    pub total_bytes: u64,
    pub depth: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStat {
    pub files: u64,
    pub lines: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryStats {
    pub generated_at: String,
    pub by_directory: Vec<DirectoryStat>,
    pub by_extension: BTreeMap<String, ExtensionStat>,
}

/// Sortable, collision-resistant bundle name.
pub fn generate_scan_id(project_id: &str, revision: &str, at: DateTime<Utc>) -> String {
    let short: String = revision.chars().take(8).collect();
    format!(
        "scan_{}_{}_{}",
        project_id,
        at.format("%Y%m%dT%H%M%S%3f"),
        short
    )
}

/// Resolve HEAD of the working copy by reading `.git` directly.
///
/// Follows a symbolic `ref:` through the loose ref file, then
/// `packed-refs`. The result must be a full 40-character revision.
pub fn read_head_revision(repo: &Path) -> PipelineResult<String> {
    let git_dir = repo.join(".git");
    let head = std::fs::read_to_string(git_dir.join("HEAD"))
        .map_err(|e| PipelineError::Integrity(format!("cannot read HEAD: {}", e)))?;
    let head = head.trim();

    let revision = match head.strip_prefix("ref:") {
        Some(reference) => {
            let reference = reference.trim();
            if !reference.starts_with("refs/") || reference.split('/').any(|s| s == "..") {
                return Err(PipelineError::Integrity(format!(
                    "suspicious HEAD ref `{}`",
                    reference
                )));
            }
            match std::fs::read_to_string(git_dir.join(reference)) {
                Ok(loose) => loose.trim().to_string(),
                Err(_) => packed_ref(&git_dir, reference).ok_or_else(|| {
                    PipelineError::Integrity(format!("cannot resolve ref `{}`", reference))
                })?,
            }
        }
        None => head.to_string(),
    };

    if !is_full_revision(&revision) {
        return Err(PipelineError::Integrity(format!(
            "HEAD does not resolve to a full revision: `{}`",
            revision
        )));
    }
    Ok(revision)
}

fn packed_ref(git_dir: &Path, reference: &str) -> Option<String> {
    let packed = std::fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('^'))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            let sha = parts.next()?;
            (parts.next()? == reference).then(|| sha.to_string())
        })
}

/// Build and validate the bundle for the project's current manifest and
/// chunk store.
pub async fn build(
    pool: &SqlitePool,
    project: &Project,
    ctx: &BuildContext,
) -> PipelineResult<ValidationSummary> {
    let head = read_head_revision(&ctx.workspace.repo)?;
    let kb_dir = &ctx.workspace.kb;
    std::fs::create_dir_all(kb_dir).map_err(|e| PipelineError::io(kb_dir, e))?;

    let now = Utc::now();
    let mut scan_id = generate_scan_id(&project.id, &head, now);
    let mut bump = 1;
    while kb_dir.join(&scan_id).exists() {
        scan_id = generate_scan_id(
            &project.id,
            &head,
            now + chrono::Duration::milliseconds(bump),
        );
        bump += 1;
    }

    let partial = kb_dir.join(format!(".{}.partial", scan_id));
    if partial.exists() {
        std::fs::remove_dir_all(&partial).map_err(|e| PipelineError::io(&partial, e))?;
    }
    std::fs::create_dir_all(&partial).map_err(|e| PipelineError::io(&partial, e))?;

    let files = scanner::load_manifest(pool, &project.id).await?;

    let (index_ids, uncovered) =
        write_files_index(pool, &project.id, &partial, &files, ctx.ndjson_threshold).await?;
    let chunk_ids = write_chunks(pool, &project.id, &partial).await?;
    write_directory_stats(&partial, &files)?;

    let final_dir = kb_dir.join(&scan_id);
    let mut summary = compare_ids(&index_ids, &chunk_ids, files.len() as u64);
    summary.record_uncovered(&uncovered);
    summary.scan_id = scan_id.clone();
    summary.output_path = final_dir.display().to_string();
    log_mismatches(&project.id, &summary);

    let meta = ScanMeta {
        scan_id: scan_id.clone(),
        project_id: project.id.clone(),
        repo_url: redact(&project.repo_url, None),
        default_branch: project.default_branch.clone(),
        selected_branch: project.branch().to_string(),
        head_revision: head,
        scanned_at_iso: now.to_rfc3339(),
        scanner_version: SCANNER_VERSION.to_string(),
        exclusion_rules_version: ctx.rules_version.clone(),
        is_incremental: ctx.is_incremental,
        previous_scan_id: ctx.previous_scan_id.clone(),
        stats: MetaStats {
            total_files_scanned: files.len() as u64,
            total_files_excluded: ctx.files_excluded,
            content_skipped: files.iter().filter(|f| f.is_excluded).count() as u64,
            total_chunks: chunk_ids.len() as u64,
            total_lines: files.iter().map(|f| f.line_count).sum(),
            total_bytes: files.iter().map(|f| f.size_bytes).sum(),
            scan_duration_ms: (crate::db::unix_now_ms() - ctx.started_at_ms).max(0) as u64,
        },
        validation: summary.clone(),
    };
    write_json(&partial.join(SCAN_META_FILE), &meta)?;

    std::fs::rename(&partial, &final_dir).map_err(|e| PipelineError::io(&final_dir, e))?;

    tracing::info!(
        project = %project.id,
        scan = %scan_id,
        files = summary.files_index_entries,
        chunks = summary.chunks_count,
        valid = summary.is_valid,
        "knowledge base bundle written"
    );
    Ok(summary)
}

/// Chunk ids per file path, joined through the surrogate file id.
async fn stored_chunk_ids(
    pool: &SqlitePool,
    project_id: &str,
) -> PipelineResult<HashMap<String, Vec<(u64, u64)>>> {
    let rows = sqlx::query(
        r#"
        SELECT f.path AS path, c.start_line AS start_line, c.end_line AS end_line
        FROM chunks c
        JOIN files f ON f.id = c.file_id
        WHERE c.project_id = ?
        ORDER BY f.path, c.start_line
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let mut ranges: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
    for row in rows {
        ranges
            .entry(row.get("path"))
            .or_default()
            .push((row.get::<i64, _>("start_line") as u64, row.get::<i64, _>("end_line") as u64));
    }
    Ok(ranges)
}

/// Write the file index. Returns every referenced chunk id and the paths of
/// chunkable files whose stored ranges leave lines uncovered.
async fn write_files_index(
    pool: &SqlitePool,
    project_id: &str,
    dir: &Path,
    files: &[FileRecord],
    ndjson_threshold: usize,
) -> PipelineResult<(Vec<String>, Vec<String>)> {
    let ranges = stored_chunk_ids(pool, project_id).await?;
    let use_ndjson = files.len() > ndjson_threshold;
    let path = dir.join(if use_ndjson { FILES_INDEX_NDJSON } else { FILES_INDEX_JSON });

    let mut all_ids = Vec::new();
    let mut uncovered = Vec::new();
    let mut entries = Vec::new();
    let mut ndjson = if use_ndjson {
        Some(BufWriter::new(File::create(&path).map_err(|e| PipelineError::io(&path, e))?))
    } else {
        None
    };

    for file in files {
        let file_ranges = ranges.get(&file.path).map(Vec::as_slice).unwrap_or_default();
        if file.is_chunkable() && !tiles_lines(file_ranges, file.line_count) {
            uncovered.push(file.path.clone());
        }
        let chunk_ids: Vec<String> = file_ranges
            .iter()
            .map(|(start, end)| {
                ChunkId::generate(&file.path, &file.content_hash, *start, *end).to_string()
            })
            .collect();
        all_ids.extend(chunk_ids.iter().cloned());

        let entry = FileIndexEntry {
            file_path: file.path.clone(),
            extension: file.extension.clone(),
            language: file.language.clone(),
            size_bytes: file.size_bytes,
            total_lines: file.line_count,
            file_hash: file.content_hash.clone(),
            is_binary: file.is_binary,
            is_excluded: file.is_excluded,
            exclusion_reason: file.exclusion_reason.map(|r| r.as_str().to_string()),
            framework_hints: file.framework_hints.clone(),
            chunk_count: chunk_ids.len(),
            chunk_ids,
            symbols_declared: file.symbols_declared.clone(),
            imports: file.imports.clone(),
        };

        match ndjson.as_mut() {
            Some(out) => {
                serde_json::to_writer(&mut *out, &entry)?;
                out.write_all(b"\n").map_err(|e| PipelineError::io(&path, e))?;
            }
            None => entries.push(entry),
        }
    }

    match ndjson {
        Some(mut out) => out.flush().map_err(|e| PipelineError::io(&path, e))?,
        None => write_json(&path, &entries)?,
    }
    Ok((all_ids, uncovered))
}

/// Whether `ranges`, sorted by start line, cover `1..=total_lines` with no
/// gap or overlap.
fn tiles_lines(ranges: &[(u64, u64)], total_lines: u64) -> bool {
    let mut next = 1;
    for (start, end) in ranges {
        if *start != next || end < start {
            return false;
        }
        next = end + 1;
    }
    next == total_lines + 1 && total_lines > 0
}

/// Stream the chunk store to `chunks.ndjson` one page at a time, ordered by
/// `(path, start_line)`.
async fn write_chunks(pool: &SqlitePool, project_id: &str, dir: &Path) -> PipelineResult<Vec<String>> {
    let path = dir.join(CHUNKS_FILE);
    let mut out = BufWriter::new(File::create(&path).map_err(|e| PipelineError::io(&path, e))?);
    let mut ids = Vec::new();
    let mut cursor: Option<(String, i64)> = None;

    loop {
        let (after_path, after_line) = cursor.clone().unwrap_or_else(|| (String::new(), -1));
        let rows = sqlx::query(
            r#"
            SELECT id, path, file_hash, start_line, end_line, chunk_index, is_complete_file,
                   byte_count, line_count, content_hash, content, symbols_declared_json,
                   symbols_used_json, imports_json, refs_json
            FROM chunks
            WHERE project_id = ? AND (path > ? OR (path = ? AND start_line > ?))
            ORDER BY path, start_line
            LIMIT ?
            "#,
        )
        .bind(project_id)
        .bind(&after_path)
        .bind(&after_path)
        .bind(after_line)
        .bind(CHUNK_PAGE)
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            break;
        }

        for row in &rows {
            let record = ChunkRecord {
                chunk_id: row.get("id"),
                file_path: row.get("path"),
                file_hash: row.get("file_hash"),
                start_line: row.get::<i64, _>("start_line") as u64,
                end_line: row.get::<i64, _>("end_line") as u64,
                chunk_index: row.get::<i64, _>("chunk_index") as u32,
                is_complete_file: row.get("is_complete_file"),
                chunk_bytes: row.get::<i64, _>("byte_count") as u64,
                chunk_lines: row.get::<i64, _>("line_count") as u64,
                chunk_hash: row.get("content_hash"),
                content: row.get("content"),
                symbols_declared: from_json_list(&row.get::<String, _>("symbols_declared_json")),
                symbols_used: from_json_list(&row.get::<String, _>("symbols_used_json")),
                imports: from_json_list(&row.get::<String, _>("imports_json")),
                references: from_json_list(&row.get::<String, _>("refs_json")),
            };
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n").map_err(|e| PipelineError::io(&path, e))?;
            ids.push(record.chunk_id);
            cursor = Some((record.file_path, record.start_line as i64));
        }

        if (rows.len() as i64) < CHUNK_PAGE {
            break;
        }
    }

    out.flush().map_err(|e| PipelineError::io(&path, e))?;
    Ok(ids)
}

fn write_directory_stats(dir: &Path, files: &[FileRecord]) -> PipelineResult<()> {
    let mut by_directory: BTreeMap<String, DirectoryStat> = BTreeMap::new();
    let mut by_extension: BTreeMap<String, ExtensionStat> = BTreeMap::new();

    for file in files {
        let directory = match file.path.rfind('/') {
            Some(idx) => file.path[..idx].to_string(),
            None => "(root)".to_string(),
        };
        let depth = if directory == "(root)" {
            0
        } else {
            directory.matches('/').count() + 1
        };
        let stat = by_directory
            .entry(directory.clone())
            .or_insert_with(|| DirectoryStat {
                directory,
                depth,
                ..Default::default()
            });
        stat.file_count += 1;
        stat.total_lines += file.line_count;
        stat.total_bytes += file.size_bytes;

        let ext = if file.extension.is_empty() {
            "no_extension".to_string()
        } else {
            file.extension.clone()
        };
        let stat = by_extension.entry(ext).or_default();
        stat.files += 1;
        stat.lines += file.line_count;
        stat.bytes += file.size_bytes;
    }

    let stats = DirectoryStats {
        generated_at: Utc::now().to_rfc3339(),
        by_directory: by_directory.into_values().collect(),
        by_extension,
    };
    write_json(&dir.join(DIRECTORY_STATS_FILE), &stats)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> PipelineResult<()> {
    let file = File::create(path).map_err(|e| PipelineError::io(path, e))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, value)?;
    out.flush().map_err(|e| PipelineError::io(path, e))
}

/// Compare the chunk ids referenced by the file index with those present
/// in the chunk store.
pub fn compare_ids(index_ids: &[String], chunk_ids: &[String], files_index_entries: u64) -> ValidationSummary {
    let mut index_counts: HashMap<&str, u64> = HashMap::new();
    for id in index_ids {
        *index_counts.entry(id.as_str()).or_default() += 1;
    }
    let mut chunk_set: HashSet<&str> = HashSet::new();
    let mut samples = MismatchSamples::default();
    let mut duplicate_chunks = 0u64;
    for id in chunk_ids {
        if !chunk_set.insert(id.as_str()) {
            duplicate_chunks += 1;
            push_sample(&mut samples.duplicated, id);
        }
    }

    let mut missing: Vec<&str> = index_counts
        .keys()
        .copied()
        .filter(|id| !chunk_set.contains(id))
        .collect();
    let mut orphaned: Vec<&str> = chunk_set
        .iter()
        .copied()
        .filter(|id| !index_counts.contains_key(id))
        .collect();
    missing.sort_unstable();
    orphaned.sort_unstable();

    let mut duplicate_references = 0u64;
    let mut duplicated: Vec<&str> = Vec::new();
    for (id, count) in &index_counts {
        if *count > 1 {
            duplicate_references += count - 1;
            duplicated.push(id);
        }
    }
    duplicated.sort_unstable();
    for id in duplicated {
        push_sample(&mut samples.duplicated, id);
    }
    for id in &missing {
        push_sample(&mut samples.missing_in_chunks, id);
    }
    for id in &orphaned {
        push_sample(&mut samples.orphaned_chunks, id);
    }

    let referenced = chunk_set.len() - orphaned.len();
    let coverage_percent = if chunk_set.is_empty() {
        100.0
    } else {
        ((referenced as f64 / chunk_set.len() as f64) * 10_000.0).round() / 100.0
    };

    ValidationSummary {
        is_valid: missing.is_empty()
            && orphaned.is_empty()
            && duplicate_references == 0
            && duplicate_chunks == 0,
        scan_id: String::new(),
        output_path: String::new(),
        files_index_entries,
        chunks_count: chunk_ids.len() as u64,
        chunk_ids_in_index: index_ids.len() as u64,
        chunk_ids_in_chunks: chunk_ids.len() as u64,
        missing_in_chunks: missing.len() as u64,
        orphaned_chunks: orphaned.len() as u64,
        duplicate_references,
        duplicate_chunks,
        uncovered_files: 0,
        coverage_percent,
        samples,
    }
}

fn push_sample(samples: &mut Vec<String>, id: &str) {
    if samples.len() < MAX_SAMPLES {
        samples.push(id.to_string());
    }
}

fn log_mismatches(project_id: &str, summary: &ValidationSummary) {
    if summary.is_valid {
        return;
    }
    tracing::warn!(
        project = project_id,
        scan = %summary.scan_id,
        missing = summary.missing_in_chunks,
        orphaned = summary.orphaned_chunks,
        duplicate_references = summary.duplicate_references,
        duplicate_chunks = summary.duplicate_chunks,
        uncovered_files = summary.uncovered_files,
        missing_sample = ?summary.samples.missing_in_chunks,
        orphaned_sample = ?summary.samples.orphaned_chunks,
        "knowledge base validation failed"
    );
}

/// Re-read a bundle from disk and re-check the chunk id bijection and
/// per-file line coverage.
pub fn verify_bundle(dir: &Path) -> PipelineResult<ValidationSummary> {
    let mut index_ids = Vec::new();
    let mut entries = 0u64;
    let mut chunkable: Vec<(String, u64)> = Vec::new();
    let mut take = |entry: FileIndexEntry| {
        entries += 1;
        if !entry.is_excluded && !entry.is_binary && entry.size_bytes > 0 {
            chunkable.push((entry.file_path, entry.total_lines));
        }
        index_ids.extend(entry.chunk_ids);
    };

    let json_index = dir.join(FILES_INDEX_JSON);
    let ndjson_index = dir.join(FILES_INDEX_NDJSON);
    if json_index.is_file() {
        let file = File::open(&json_index).map_err(|e| PipelineError::io(&json_index, e))?;
        let parsed: Vec<FileIndexEntry> = serde_json::from_reader(BufReader::new(file))?;
        parsed.into_iter().for_each(&mut take);
    } else if ndjson_index.is_file() {
        for_each_line(&ndjson_index, |line| {
            take(serde_json::from_str(line)?);
            Ok(())
        })?;
    } else {
        return Err(PipelineError::Integrity(format!(
            "no file index in {}",
            dir.display()
        )));
    }

    let mut chunk_ids = Vec::new();
    let mut ranges: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
    let chunks = dir.join(CHUNKS_FILE);
    for_each_line(&chunks, |line| {
        let record: ChunkRecord = serde_json::from_str(line)?;
        ranges
            .entry(record.file_path)
            .or_default()
            .push((record.start_line, record.end_line));
        chunk_ids.push(record.chunk_id);
        Ok(())
    })?;

    let uncovered: Vec<String> = chunkable
        .into_iter()
        .filter(|(path, total_lines)| {
            let mut file_ranges = ranges.get(path).cloned().unwrap_or_default();
            file_ranges.sort_unstable();
            !tiles_lines(&file_ranges, *total_lines)
        })
        .map(|(path, _)| path)
        .collect();

    let mut summary = compare_ids(&index_ids, &chunk_ids, entries);
    summary.record_uncovered(&uncovered);
    summary.scan_id = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    summary.output_path = dir.display().to_string();
    Ok(summary)
}

fn for_each_line(
    path: &Path,
    mut f: impl FnMut(&str) -> PipelineResult<()>,
) -> PipelineResult<()> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| PipelineError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        f(&line)?;
    }
    Ok(())
}

/// Bundle directories under `kb_dir`, newest first.
pub fn list_bundles(kb_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    if !kb_dir.exists() {
        return Ok(Vec::new());
    }
    let mut bundles: Vec<PathBuf> = std::fs::read_dir(kb_dir)
        .map_err(|e| PipelineError::io(kb_dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| e.file_name().to_string_lossy().starts_with("scan_"))
        .map(|e| e.path())
        .collect();
    bundles.sort();
    bundles.reverse();
    Ok(bundles)
}

/// Keep the newest `keep` of the `recorded` bundles and delete the older
/// recorded ones. Unrecorded directories are left to [`sweep_unrecorded`].
/// Returns the names of removed directories.
pub fn prune_bundles(
    kb_dir: &Path,
    keep: usize,
    recorded: &HashSet<String>,
) -> PipelineResult<Vec<String>> {
    let mut removed = Vec::new();
    let stale = list_bundles(kb_dir)?
        .into_iter()
        .filter(|p| recorded.contains(&dir_name(p)))
        .skip(keep.max(1));
    for dir in stale {
        std::fs::remove_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        removed.push(dir_name(&dir));
    }
    Ok(removed)
}

/// Delete bundle directories whose id is not in `recorded`, plus leftover
/// `.partial` directories. Only safe while the caller holds the project's
/// scan claim. Returns the names of removed directories.
pub fn sweep_unrecorded(kb_dir: &Path, recorded: &HashSet<String>) -> PipelineResult<Vec<String>> {
    let mut removed = Vec::new();
    for dir in list_bundles(kb_dir)? {
        let name = dir_name(&dir);
        if !recorded.contains(&name) {
            std::fs::remove_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
            removed.push(name);
        }
    }

    if kb_dir.exists() {
        let partials: Vec<PathBuf> = std::fs::read_dir(kb_dir)
            .map_err(|e| PipelineError::io(kb_dir, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let name = dir_name(p);
                p.is_dir() && name.starts_with('.') && name.ends_with(".partial")
            })
            .collect();
        for partial in partials {
            std::fs::remove_dir_all(&partial).map_err(|e| PipelineError::io(&partial, e))?;
            removed.push(dir_name(&partial));
        }
    }
    Ok(removed)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
