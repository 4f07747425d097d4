//! Core data models shared by the pipeline stages.
//!
//! Projects and scans live in SQLite and are mutated only by the
//! orchestrator; file records and chunks are regenerated by every scan and
//! flow from the scanner through the chunker into the knowledge base bundle.

use serde::{Deserialize, Serialize};

use crate::chunk_id::ChunkId;

/// Lifecycle status of a tracked project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Scanning,
    Ready,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Scanning => "scanning",
            ProjectStatus::Ready => "ready",
            ProjectStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProjectStatus::Pending),
            "scanning" => Some(ProjectStatus::Scanning),
            "ready" => Some(ProjectStatus::Ready),
            "failed" => Some(ProjectStatus::Failed),
            _ => None,
        }
    }
}

/// Terminal or in-flight status of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ScanStatus::Running),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            _ => None,
        }
    }
}

/// What started a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Webhook,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Trigger::Manual),
            "webhook" => Some(Trigger::Webhook),
            _ => None,
        }
    }
}

/// Named pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Workspace,
    Sync,
    Manifest,
    DetectStack,
    Chunk,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Workspace,
        Stage::Sync,
        Stage::Manifest,
        Stage::DetectStack,
        Stage::Chunk,
        Stage::Finalize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Workspace => "workspace",
            Stage::Sync => "sync",
            Stage::Manifest => "manifest",
            Stage::DetectStack => "detect-stack",
            Stage::Chunk => "chunk",
            Stage::Finalize => "finalize",
        }
    }

    /// Share of overall scan progress attributed to this stage (sums to 100).
    pub fn weight(&self) -> u32 {
        match self {
            Stage::Workspace => 5,
            Stage::Sync => 15,
            Stage::Manifest => 30,
            Stage::DetectStack => 10,
            Stage::Chunk => 35,
            Stage::Finalize => 5,
        }
    }

    /// Overall percent reached when this stage starts.
    pub fn base_percent(&self) -> u32 {
        Stage::ALL
            .iter()
            .take_while(|s| *s != self)
            .map(|s| s.weight())
            .sum()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A tracked repository.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub repo_url: String,
    pub default_branch: String,
    pub selected_branch: Option<String>,
    pub last_revision: Option<String>,
    pub last_kb_scan_id: Option<String>,
    pub exclusion_rules_version: Option<String>,
    pub total_files: i64,
    pub total_lines: i64,
    pub total_bytes: i64,
    pub status: ProjectStatus,
    pub current_stage: Option<String>,
    pub stage_percent: i64,
    pub last_error: Option<String>,
    pub stack_json: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub scanned_at: Option<i64>,
}

impl Project {
    /// Branch the pipeline tracks.
    pub fn branch(&self) -> &str {
        self.selected_branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.default_branch)
    }
}

/// One pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct Scan {
    pub id: i64,
    pub project_id: String,
    pub trigger: Trigger,
    pub is_incremental: bool,
    pub status: ScanStatus,
    pub current_stage: Option<String>,
    pub stage_percent: i64,
    pub from_revision: Option<String>,
    pub to_revision: Option<String>,
    pub scanner_version: String,
    pub exclusion_rules_version: String,
    pub files_scanned: i64,
    pub files_excluded: i64,
    pub chunks_produced: i64,
    pub duration_ms: Option<i64>,
    pub stage_timings_json: String,
    pub kb_scan_id: Option<String>,
    pub kb_valid: Option<bool>,
    pub warnings_json: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Why a manifest entry's content is not chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentExclusion {
    Binary,
    TooLarge,
    Empty,
    NotUtf8,
}

impl ContentExclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentExclusion::Binary => "binary",
            ContentExclusion::TooLarge => "too_large",
            ContentExclusion::Empty => "empty",
            ContentExclusion::NotUtf8 => "not_utf8",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "binary" => Some(ContentExclusion::Binary),
            "too_large" => Some(ContentExclusion::TooLarge),
            "empty" => Some(ContentExclusion::Empty),
            "not_utf8" => Some(ContentExclusion::NotUtf8),
            _ => None,
        }
    }
}

/// One scanned file of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the working copy, `/`-separated.
    pub path: String,
    pub extension: String,
    pub language: String,
    pub size_bytes: u64,
    pub line_count: u64,
    /// SHA-256 of the full file content, lowercase hex.
    pub content_hash: String,
    pub is_binary: bool,
    pub is_excluded: bool,
    pub exclusion_reason: Option<ContentExclusion>,
    pub framework_hints: Vec<String>,
    pub symbols_declared: Vec<String>,
    pub imports: Vec<String>,
    /// Unix seconds.
    pub modified_at: i64,
    pub rules_version: String,
}

impl FileRecord {
    /// Whether the chunk stage should read this file.
    pub fn is_chunkable(&self) -> bool {
        !self.is_excluded && !self.is_binary && self.size_bytes > 0
    }
}

/// A contiguous line range of one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub file_path: String,
    pub file_hash: String,
    /// 1-based, inclusive.
    pub start_line: u64,
    /// 1-based, inclusive.
    pub end_line: u64,
    pub chunk_index: u32,
    pub is_complete_file: bool,
    pub byte_count: u64,
    pub line_count: u64,
    pub content_hash: String,
    pub content: String,
    pub symbols_declared: Vec<String>,
    pub symbols_used: Vec<String>,
    pub imports: Vec<String>,
    pub references: Vec<String>,
}

/// Paths that differ between two revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Every path touched, in sorted order.
    pub fn all_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .map(String::as_str)
            .collect();
        paths.sort_unstable();
        paths.dedup();
        paths
    }

    /// Added and modified paths, which need re-scanning.
    pub fn upserted(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(&self.modified)
    }
}
