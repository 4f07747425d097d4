//! Line-range chunker with weighted break points.
//!
//! A file within both ceilings (`max_lines`, `max_bytes`) becomes a single
//! chunk flagged `is_complete_file`. Larger files are cut into segments of at
//! most `max_lines` lines and `max_bytes` bytes. For every cut that falls
//! short of end-of-file the chunker searches backward from the hard boundary
//! to (but not including) the segment midpoint and moves the cut to the best
//! scoring break point:
//!
//! | Break point | Scored on | Default weight |
//! |-------------|-----------|----------------|
//! | empty line | line before the cut | 10 |
//! | class / interface / trait start | line after the cut | 9 |
//! | function / method start | line after the cut | 8 |
//! | closing-block line (`}`) | line before the cut | 7 |
//! | comment block start (`/**`) | line after the cut | 5 |
//!
//! The highest score wins; ties go to the cut nearest the hard boundary.
//! With no scoring point the hard boundary is kept.
//!
//! Lines are `\n`-terminated slices, so concatenating a file's chunks in
//! order reproduces the file byte for byte.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk_id::ChunkId;
use crate::config::{BreakWeights, ChunkingConfig};
use crate::db::to_json_list;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chunk, FileRecord, Stage};
use crate::progress::EventSink;
use crate::symbols;
use crate::workers;

/// Files handed to the worker pool per write transaction.
const CHUNK_BATCH: usize = 256;

static CLASS_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:(?:abstract|final|readonly|public|private|protected|sealed|static|pub(?:\([^)]*\))?)\s+)*(?:class|interface|trait|enum|struct|impl|module|object)\b",
    )
    .expect("static class pattern")
});

static FUNCTION_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:(?:public|private|protected|static|async|abstract|final|override|unsafe|const|pub(?:\([^)]*\))?)\s+)*(?:function|def|fn|func)\b|^\s*(?:export\s+)?(?:const|let|var)\s+[A-Za-z_$][\w$]*\s*=\s*(?:async\s*)?\([^)]*\)\s*=>",
    )
    .expect("static function pattern")
});

static COMMENT_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:/\*|///|//!|"""|<!--|\{\{--)"#).expect("static comment pattern")
});

static BLOCK_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[}\]]\s*[;,)]*\s*$|end\b|@end\w*|</\w[\w.-]*>\s*$)")
        .expect("static block-end pattern")
});

pub struct Chunker {
    max_lines: usize,
    max_bytes: usize,
    weights: BreakWeights,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            max_lines: config.max_lines.max(1),
            max_bytes: config.max_bytes.max(1),
            weights: config.break_weights.clone(),
        }
    }

    /// Split `content` (the full text of `file`) into chunks.
    ///
    /// Ids are derived from `file.path` and `file.content_hash`; the caller
    /// guarantees the hash belongs to `content`.
    pub fn chunk_file(&self, file: &FileRecord, content: &str) -> Vec<Chunk> {
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        if lines.is_empty() {
            return Vec::new();
        }

        if lines.len() <= self.max_lines && content.len() <= self.max_bytes {
            return vec![build_chunk(file, &lines, 0, lines.len(), 0, true)];
        }

        self.segment(&lines)
            .into_iter()
            .enumerate()
            .map(|(ordinal, (start, end))| build_chunk(file, &lines, start, end, ordinal, false))
            .collect()
    }

    /// Half-open `[start, end)` line-index ranges covering `lines`.
    fn segment(&self, lines: &[&str]) -> Vec<(usize, usize)> {
        let n = lines.len();
        let mut ranges = Vec::new();
        let mut start = 0;

        while start < n {
            let hard_end = (start + self.max_lines).min(n);
            let capped = self.byte_cap(lines, start, hard_end);
            let end = if capped >= n {
                n
            } else {
                self.best_break(lines, start, capped)
            };
            ranges.push((start, end));
            start = end;
        }
        ranges
    }

    /// Largest end ≤ `hard_end` keeping the segment within `max_bytes`;
    /// always at least one line.
    fn byte_cap(&self, lines: &[&str], start: usize, hard_end: usize) -> usize {
        let mut bytes = 0usize;
        let mut end = start;
        while end < hard_end {
            bytes += lines[end].len();
            if bytes > self.max_bytes && end > start {
                break;
            }
            end += 1;
        }
        end
    }

    /// Best cut in `(midpoint, candidate]`, scanning from the candidate down.
    fn best_break(&self, lines: &[&str], start: usize, candidate: usize) -> usize {
        let midpoint = start + (candidate - start) / 2;
        let mut best = candidate;
        let mut best_score = 0;

        for cut in ((midpoint + 1)..=candidate).rev() {
            let score = self.score(lines, cut);
            if score > best_score {
                best_score = score;
                best = cut;
            }
        }
        best
    }

    /// Score of cutting between `lines[cut - 1]` and `lines[cut]`.
    fn score(&self, lines: &[&str], cut: usize) -> u32 {
        let w = &self.weights;
        let before = lines[cut - 1];
        let mut score = 0;

        if before.trim().is_empty() {
            score = score.max(w.empty_line);
        }
        if BLOCK_END.is_match(before) {
            score = score.max(w.block_end);
        }

        if let Some(after) = lines.get(cut) {
            if CLASS_START.is_match(after) {
                score = score.max(w.class_boundary);
            }
            if FUNCTION_START.is_match(after) {
                score = score.max(w.function_boundary);
            }
            if COMMENT_START.is_match(after) {
                score = score.max(w.comment_block);
            }
        }
        score
    }
}

fn build_chunk(
    file: &FileRecord,
    lines: &[&str],
    start: usize,
    end: usize,
    ordinal: usize,
    is_complete_file: bool,
) -> Chunk {
    let content: String = lines[start..end].concat();
    let start_line = start as u64 + 1;
    let end_line = end as u64;
    let symbols = symbols::extract(&file.language, &content);

    Chunk {
        id: ChunkId::generate(&file.path, &file.content_hash, start_line, end_line),
        file_path: file.path.clone(),
        file_hash: file.content_hash.clone(),
        start_line,
        end_line,
        chunk_index: ordinal as u32,
        is_complete_file,
        byte_count: content.len() as u64,
        line_count: (end - start) as u64,
        content_hash: sha256_hex(content.as_bytes()),
        content,
        symbols_declared: symbols.declared,
        symbols_used: symbols.used,
        imports: symbols.imports,
        references: symbols.references,
    }
}

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Chunk stage
// ---------------------------------------------------------------------------

/// Counters reported by [`chunk_stage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStageStats {
    pub files_chunked: u64,
    pub files_skipped: u64,
    pub chunks_written: u64,
}

enum FileChunks {
    Ready { path: String, chunks: Vec<Chunk> },
    Skipped { path: String, reason: String },
}

/// Chunk every chunkable file in `files` and replace their rows in the
/// chunk store.
///
/// Reading, hash verification and chunking run on the worker pool; a single
/// writer stores results in path order, one transaction per batch. Files
/// whose content changed since the manifest was built, or that are not
/// valid UTF-8, are skipped with a warning.
pub async fn chunk_stage(
    pool: &SqlitePool,
    project_id: &str,
    root: &Path,
    files: &[FileRecord],
    chunking: &ChunkingConfig,
    workers: usize,
    events: &EventSink,
) -> PipelineResult<ChunkStageStats> {
    let file_ids = load_file_ids(pool, project_id).await?;
    let chunker = Arc::new(Chunker::new(chunking));

    let mut targets: Vec<&FileRecord> = files.iter().filter(|f| f.is_chunkable()).collect();
    targets.sort_by(|a, b| a.path.cmp(&b.path));
    let total = targets.len() as u64;

    let mut stats = ChunkStageStats::default();
    let mut processed = 0u64;
    events.progress(Stage::Chunk, 0, total);

    for batch in targets.chunks(CHUNK_BATCH) {
        let jobs: Vec<(PathBuf, FileRecord)> = batch
            .iter()
            .map(|f| (root.join(&f.path), (*f).clone()))
            .collect();
        let chunker = Arc::clone(&chunker);

        let results = workers::map_bounded(
            jobs,
            workers,
            move |(abs, record)| read_and_chunk(&chunker, &abs, record),
            |_| {},
        )
        .await
        .map_err(|e| PipelineError::failure(Stage::Chunk.name(), format!("worker failed: {}", e)))?;

        let mut tx = pool.begin().await?;
        for result in results {
            match result {
                FileChunks::Ready { path, chunks } => {
                    let Some(file_id) = file_ids.get(&path) else {
                        events.warn(Stage::Chunk, format!("{}: not in manifest, skipped", path));
                        stats.files_skipped += 1;
                        continue;
                    };
                    let file_id = *file_id;
                    sqlx::query("DELETE FROM chunks WHERE file_id = ?")
                        .bind(file_id)
                        .execute(&mut *tx)
                        .await?;
                    for chunk in &chunks {
                        insert_chunk(&mut tx, project_id, file_id, chunk).await?;
                    }
                    stats.files_chunked += 1;
                    stats.chunks_written += chunks.len() as u64;
                }
                FileChunks::Skipped { path, reason } => {
                    events.warn(Stage::Chunk, format!("{}: {}", path, reason));
                    stats.files_skipped += 1;
                }
            }
        }
        tx.commit().await?;

        processed += batch.len() as u64;
        events.progress(Stage::Chunk, processed, total);
    }

    tracing::debug!(
        project = project_id,
        files = stats.files_chunked,
        chunks = stats.chunks_written,
        skipped = stats.files_skipped,
        "chunk stage finished"
    );
    Ok(stats)
}

fn read_and_chunk(chunker: &Chunker, abs: &Path, record: FileRecord) -> FileChunks {
    let bytes = match std::fs::read(abs) {
        Ok(b) => b,
        Err(e) => {
            return FileChunks::Skipped {
                path: record.path,
                reason: format!("unreadable: {}", e),
            }
        }
    };
    if sha256_hex(&bytes) != record.content_hash {
        return FileChunks::Skipped {
            path: record.path,
            reason: "content changed since manifest was built".to_string(),
        };
    }
    let text = match String::from_utf8(bytes) {
        Ok(t) => t,
        Err(_) => {
            return FileChunks::Skipped {
                path: record.path,
                reason: "not valid UTF-8".to_string(),
            }
        }
    };
    let chunks = chunker.chunk_file(&record, &text);
    FileChunks::Ready {
        path: record.path,
        chunks,
    }
}

async fn load_file_ids(pool: &SqlitePool, project_id: &str) -> PipelineResult<HashMap<String, i64>> {
    let rows = sqlx::query("SELECT id, path FROM files WHERE project_id = ?")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("path"), r.get::<i64, _>("id")))
        .collect())
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    project_id: &str,
    file_id: i64,
    chunk: &Chunk,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO chunks (
            project_id, id, file_id, path, file_hash, start_line, end_line,
            chunk_index, is_complete_file, byte_count, line_count, content_hash,
            content, symbols_declared_json, symbols_used_json, imports_json, refs_json
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(project_id)
    .bind(chunk.id.to_string())
    .bind(file_id)
    .bind(&chunk.file_path)
    .bind(&chunk.file_hash)
    .bind(chunk.start_line as i64)
    .bind(chunk.end_line as i64)
    .bind(chunk.chunk_index as i64)
    .bind(chunk.is_complete_file)
    .bind(chunk.byte_count as i64)
    .bind(chunk.line_count as i64)
    .bind(&chunk.content_hash)
    .bind(&chunk.content)
    .bind(to_json_list(&chunk.symbols_declared))
    .bind(to_json_list(&chunk.symbols_used))
    .bind(to_json_list(&chunk.imports))
    .bind(to_json_list(&chunk.references))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;

    fn record(path: &str, content: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            extension: "php".to_string(),
            language: "php".to_string(),
            size_bytes: content.len() as u64,
            line_count: content.lines().count() as u64,
            content_hash: sha256_hex(content.as_bytes()),
            is_binary: false,
            is_excluded: false,
            exclusion_reason: None,
            framework_hints: vec![],
            symbols_declared: vec![],
            imports: vec![],
            modified_at: 0,
            rules_version: "2.0.0".to_string(),
        }
    }

    fn chunker(max_lines: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            max_lines,
            ..ChunkingConfig::default()
        })
    }

    fn ranges(chunks: &[Chunk]) -> Vec<(u64, u64)> {
        chunks.iter().map(|c| (c.start_line, c.end_line)).collect()
    }

    fn assert_covers(chunks: &[Chunk], content: &str) {
        let total = content.split_inclusive('\n').count() as u64;
        let mut next = 1;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.start_line, next, "gap or overlap before chunk {}", i);
            assert!(c.end_line >= c.start_line);
            assert_eq!(c.chunk_index as usize, i);
            next = c.end_line + 1;
        }
        assert_eq!(next - 1, total);
        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(joined, content);
    }

    fn statements(n: usize) -> String {
        (1..=n).map(|i| format!("$x{} = {};\n", i, i)).collect()
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let c = chunker(500);
        assert!(c.chunk_file(&record("a.php", ""), "").is_empty());
    }

    #[test]
    fn small_file_is_one_complete_chunk() {
        let content = statements(20);
        let chunks = chunker(500).chunk_file(&record("a.php", &content), &content);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_complete_file);
        assert_eq!(ranges(&chunks), vec![(1, 20)]);
        assert_eq!(chunks[0].content, content);
    }

    #[test]
    fn trailing_content_without_newline_is_last_line() {
        let content = "<?php\necho 1;\necho 2;";
        let chunks = chunker(2).chunk_file(&record("a.php", content), content);
        assert_covers(&chunks, content);
        assert_eq!(chunks.last().unwrap().content, "echo 2;");
    }

    #[test]
    fn twelve_hundred_lines_split_on_empty_lines() {
        let mut lines: Vec<String> = (1..=1200).map(|i| format!("$v{} = {};", i, i)).collect();
        lines[499] = String::new();
        lines[500] = String::new();
        let content = lines.join("\n") + "\n";

        let chunks = chunker(500).chunk_file(&record("big.php", &content), &content);
        assert_eq!(ranges(&chunks), vec![(1, 500), (501, 1000), (1001, 1200)]);
        assert!(chunks.iter().all(|c| !c.is_complete_file));
        assert_covers(&chunks, &content);
    }

    #[test]
    fn prefers_function_boundary_over_hard_cut() {
        let mut content = statements(7);
        content.push_str("function next() {\n");
        content.push_str(&statements(5));
        let chunks = chunker(10).chunk_file(&record("f.php", &content), &content);
        // Cut lands just before `function next()` on line 8.
        assert_eq!(chunks[0].end_line, 7);
        assert_covers(&chunks, &content);
    }

    #[test]
    fn break_search_stops_at_midpoint() {
        // Only break candidate is an empty line at line 2, before the midpoint.
        let mut lines: Vec<String> = (1..=30).map(|i| format!("$a{};", i)).collect();
        lines[1] = String::new();
        let content = lines.join("\n") + "\n";
        let chunks = chunker(10).chunk_file(&record("m.php", &content), &content);
        assert_eq!(chunks[0].end_line, 10);
        assert_covers(&chunks, &content);
    }

    #[test]
    fn ties_resolve_toward_hard_boundary() {
        let mut lines: Vec<String> = (1..=20).map(|i| format!("$b{};", i)).collect();
        lines[6] = String::new();
        lines[8] = String::new();
        let content = lines.join("\n") + "\n";
        let chunks = chunker(10).chunk_file(&record("t.php", &content), &content);
        assert_eq!(chunks[0].end_line, 9);
    }

    #[test]
    fn byte_ceiling_splits_long_lines() {
        let line = "x".repeat(99) + "\n";
        let content = line.repeat(10);
        let c = Chunker::new(&ChunkingConfig {
            max_lines: 500,
            max_bytes: 250,
            ..ChunkingConfig::default()
        });
        let chunks = c.chunk_file(&record("wide.txt", &content), &content);
        assert!(chunks.iter().all(|ch| ch.byte_count <= 250));
        assert_covers(&chunks, &content);
    }

    #[test]
    fn single_line_larger_than_ceiling_still_progresses() {
        let content = "y".repeat(1000) + "\n" + "z\n";
        let c = Chunker::new(&ChunkingConfig {
            max_lines: 500,
            max_bytes: 100,
            ..ChunkingConfig::default()
        });
        let chunks = c.chunk_file(&record("huge.txt", &content), &content);
        assert_eq!(ranges(&chunks), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn rechunking_is_deterministic_and_keeps_sibling_hashes() {
        let mut lines: Vec<String> = (1..=30).map(|i| format!("$c{};", i)).collect();
        let content = lines.join("\n") + "\n";
        let c = chunker(10);
        let first = c.chunk_file(&record("s.php", &content), &content);
        let again = c.chunk_file(&record("s.php", &content), &content);
        assert_eq!(first, again);

        lines[14] = "$changed;".to_string();
        let edited = lines.join("\n") + "\n";
        let second = c.chunk_file(&record("s.php", &edited), &edited);
        assert_eq!(ranges(&first), ranges(&second));
        assert_ne!(first[1].content_hash, second[1].content_hash);
        assert_eq!(first[0].content_hash, second[0].content_hash);
        assert_eq!(first[2].content_hash, second[2].content_hash);
        // Ids carry the whole-file hash, so every id moves with the edit.
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn chunk_symbols_are_extracted() {
        let content = "<?php\nclass Invoice {\n    public function total() {}\n}\n";
        let chunks = chunker(500).chunk_file(&record("Invoice.php", content), content);
        assert_eq!(chunks[0].symbols_declared, vec!["Invoice", "total"]);
    }
}
