//! Path exclusion and file classification.
//!
//! [`ExclusionMatcher`] is built once per scan from [`ExclusionConfig`],
//! [`LanguageConfig`] and [`FrameworkHintConfig`] and then queried per path.
//! It is pure: decisions depend only on the relative path, the compiled rule
//! set and (for binary sniffing) the file's header bytes.
//!
//! A path is excluded when any of these hold:
//!
//! 1. a directory segment run matches an excluded directory
//!    (`vendor`, `bootstrap/cache`),
//! 2. the path matches an excluded glob (`**/storage/logs/**`),
//! 3. the file name is excluded exactly (`.DS_Store`),
//! 4. any dotted suffix of the file name is an excluded extension
//!    (`lock`, `min.js`).

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::config::{ExclusionConfig, ExclusionToggles, FrameworkHintConfig, LanguageConfig};

/// Language reported when no extension matches.
pub const FALLBACK_LANGUAGE: &str = "plaintext";

/// The rule that excluded a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum ExclusionReason {
    Directory(String),
    Pattern(String),
    File(String),
    Extension(String),
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::Directory(d) => write!(f, "directory:{}", d),
            ExclusionReason::Pattern(p) => write!(f, "pattern:{}", p),
            ExclusionReason::File(n) => write!(f, "file:{}", n),
            ExclusionReason::Extension(e) => write!(f, "extension:{}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub language: String,
    pub is_binary: bool,
}

pub struct ExclusionMatcher {
    version: String,
    directories: Vec<Vec<String>>,
    pattern_set: GlobSet,
    patterns: Vec<String>,
    files: HashSet<String>,
    extensions: HashSet<String>,
    binary_extensions: HashSet<String>,
    languages: BTreeMap<String, String>,
    hint_paths: Vec<(String, GlobSet)>,
    hint_markers: BTreeMap<String, Vec<String>>,
    sniff_bytes: usize,
}

impl ExclusionMatcher {
    pub fn new(
        exclusions: &ExclusionConfig,
        languages: &LanguageConfig,
        hints: &FrameworkHintConfig,
        sniff_bytes: usize,
    ) -> Result<Self> {
        let toggled = toggled_off(&exclusions.toggles);
        let keep = |item: &str| !toggled.contains(item);

        let directories: Vec<Vec<String>> = exclusions
            .directories
            .iter()
            .filter(|d| keep(d.as_str()))
            .map(|d| {
                d.trim_matches('/')
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|segments| !segments.is_empty())
            .collect();

        let patterns: Vec<String> = exclusions
            .patterns
            .iter()
            .filter(|p| keep(p.as_str()))
            .cloned()
            .collect();
        let pattern_set = build_globset(&patterns)?;

        let extensions: HashSet<String> = exclusions
            .extensions
            .iter()
            .filter(|e| keep(e.as_str()))
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        let binary_extensions: HashSet<String> = exclusions
            .binary_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        let languages = languages
            .extension_map
            .iter()
            .map(|(ext, lang)| (ext.trim_start_matches('.').to_lowercase(), lang.clone()))
            .collect();

        let mut hint_paths = Vec::new();
        for (name, globs) in &hints.path_patterns {
            hint_paths.push((name.clone(), build_globset(globs)?));
        }

        let files: HashSet<String> = exclusions.files.iter().cloned().collect();
        let digest = rules_digest(&[
            directories.iter().map(|d| d.join("/")).collect::<BTreeSet<_>>(),
            patterns.iter().cloned().collect::<BTreeSet<_>>(),
            files.iter().cloned().collect::<BTreeSet<_>>(),
            extensions.iter().cloned().collect::<BTreeSet<_>>(),
            binary_extensions.iter().cloned().collect::<BTreeSet<_>>(),
        ]);

        Ok(Self {
            version: format!("{}+{}", exclusions.schema_version, digest),
            directories,
            pattern_set,
            patterns,
            files,
            extensions,
            binary_extensions,
            languages,
            hint_paths,
            hint_markers: hints.content_markers.clone(),
            sniff_bytes,
        })
    }

    /// Version of the effective rule set, stored on every file record and
    /// scan: `<schema_version>+<8 hex digest>`. Toggles and rule list edits
    /// change the digest even when the schema version stays the same.
    pub fn rules_version(&self) -> &str {
        &self.version
    }

    pub fn sniff_bytes(&self) -> usize {
        self.sniff_bytes
    }

    pub fn should_exclude(&self, path: &str) -> bool {
        self.exclusion_reason(path).is_some()
    }

    /// First rule that excludes `path`, or `None` if the file is scanned.
    pub fn exclusion_reason(&self, path: &str) -> Option<ExclusionReason> {
        let path = normalize(path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (name, dirs) = segments.split_last()?;

        if let Some(dir) = self.match_directory(dirs) {
            return Some(ExclusionReason::Directory(dir));
        }

        if let Some(idx) = self.pattern_set.matches(&path).first() {
            return Some(ExclusionReason::Pattern(self.patterns[*idx].clone()));
        }

        if self.files.contains(*name) {
            return Some(ExclusionReason::File(name.to_string()));
        }

        let lower = name.to_lowercase();
        let found = dotted_suffixes(&lower)
            .find(|ext| self.extensions.contains(*ext))
            .map(|ext| ExclusionReason::Extension(ext.to_string()));
        found
    }

    /// Whether a directory can be pruned from the walk without visiting it.
    pub fn is_excluded_dir(&self, dir: &str) -> bool {
        let dir = normalize(dir);
        let segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
        self.match_directory(&segments).is_some()
    }

    fn match_directory(&self, segments: &[&str]) -> Option<String> {
        self.directories
            .iter()
            .find(|rule| {
                segments
                    .windows(rule.len())
                    .any(|w| w.iter().zip(rule.iter()).all(|(a, b)| *a == b.as_str()))
            })
            .map(|rule| rule.join("/"))
    }

    /// Language and binary status for a file.
    ///
    /// `header` is the start of the file; only the first `sniff_bytes` bytes
    /// are inspected. An empty header is never binary.
    pub fn classify(&self, path: &str, header: &[u8]) -> Classification {
        let name = file_name(path).to_lowercase();
        let binary_ext = dotted_suffixes(&name).any(|ext| self.binary_extensions.contains(ext));
        let sniff = &header[..header.len().min(self.sniff_bytes)];
        Classification {
            language: self.language_for(path),
            is_binary: binary_ext || sniff.contains(&0u8),
        }
    }

    /// Whether the extension alone marks the file as binary.
    pub fn has_binary_extension(&self, path: &str) -> bool {
        let name = file_name(path).to_lowercase();
        let found = dotted_suffixes(&name).any(|ext| self.binary_extensions.contains(ext));
        found
    }

    /// Longest dotted suffix present in the extension map, else `plaintext`.
    pub fn language_for(&self, path: &str) -> String {
        let name = file_name(path).to_lowercase();
        let found = dotted_suffixes(&name)
            .find_map(|ext| self.languages.get(ext))
            .cloned()
            .unwrap_or_else(|| FALLBACK_LANGUAGE.to_string());
        found
    }

    /// Framework hints from path patterns and, when content is available,
    /// content markers. Sorted and deduplicated.
    pub fn framework_hints(&self, path: &str, content: Option<&str>) -> Vec<String> {
        let path = normalize(path);
        let mut hints: Vec<String> = self
            .hint_paths
            .iter()
            .filter(|(_, set)| set.is_match(&path))
            .map(|(name, _)| name.clone())
            .collect();

        if let Some(text) = content {
            for (name, markers) in &self.hint_markers {
                if markers.iter().any(|m| text.contains(m.as_str())) {
                    hints.push(name.clone());
                }
            }
        }

        hints.sort();
        hints.dedup();
        hints
    }
}

/// Last dotted segment of the file name, lowercased. Dotfiles such as
/// `.env` report the part after the leading dot.
pub fn extension_of(path: &str) -> String {
    let name = file_name(path).to_lowercase();
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => name[idx + 1..].to_string(),
        _ => String::new(),
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

/// Every suffix following a `.` in `name`, longest first:
/// `app.blade.php` → `blade.php`, `php`.
fn dotted_suffixes(name: &str) -> impl Iterator<Item = &str> {
    name.char_indices()
        .filter(|(_, c)| *c == '.')
        .map(move |(i, _)| &name[i + 1..])
        .filter(|s| !s.is_empty())
}

/// Default rules re-included by each toggle.
fn toggled_off(toggles: &ExclusionToggles) -> HashSet<&'static str> {
    let mut off = HashSet::new();
    if toggles.include_vendor {
        off.extend(["vendor", "**/vendor/**"]);
    }
    if toggles.include_node_modules {
        off.extend(["node_modules", "bower_components", "**/node_modules/**"]);
    }
    if toggles.include_storage {
        off.extend(["storage", "**/storage/logs/**", "**/storage/framework/**"]);
    }
    if toggles.include_build_output {
        off.extend([
            "dist",
            "build",
            "target",
            "public/build",
            "public/hot",
            ".output",
            ".next",
            ".nuxt",
            "bootstrap/cache",
            "**/bootstrap/cache/**",
        ]);
    }
    if toggles.include_lock_files {
        off.insert("lock");
    }
    if toggles.include_source_maps {
        off.insert("map");
    }
    if toggles.include_minified {
        off.extend(["min.js", "min.css", "bundle.js", "chunk.js"]);
    }
    off
}

/// Order-independent digest of the effective rule lists.
fn rules_digest(groups: &[BTreeSet<String>]) -> String {
    let mut hasher = Sha256::new();
    for group in groups {
        for item in group {
            hasher.update(item.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"\x1e");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?,
        );
    }
    Ok(builder.build()?)
}
