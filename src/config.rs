//! TOML configuration.
//!
//! Every section has defaults, so a config file only needs to name what it
//! changes. [`load_config`] parses and validates; [`Config::minimal`] builds
//! an in-memory config for tests and embedding.
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//!
//! [storage]
//! root = "./data/projects"
//!
//! [exclusions]
//! schema_version = "2.0.0"
//! directories = ["vendor", "node_modules"]
//!
//! [exclusions.toggles]
//! include_vendor = false
//!
//! [chunking]
//! max_lines = 500
//!
//! [pipeline]
//! max_attempts = 3
//! webhook_dedup_secs = 60
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub exclusions: ExclusionConfig,
    #[serde(default)]
    pub languages: LanguageConfig,
    #[serde(default)]
    pub framework_hints: FrameworkHintConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root under which every project gets its own directory.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/projects")
}

// ---------------------------------------------------------------------------
// Exclusions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct ExclusionConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_excluded_directories")]
    pub directories: Vec<String>,
    #[serde(default = "default_excluded_patterns")]
    pub patterns: Vec<String>,
    #[serde(default = "default_excluded_files")]
    pub files: Vec<String>,
    #[serde(default = "default_excluded_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_binary_extensions")]
    pub binary_extensions: Vec<String>,
    #[serde(default)]
    pub toggles: ExclusionToggles,
}

/// Switches that re-include whole families of default exclusions.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExclusionToggles {
    #[serde(default)]
    pub include_vendor: bool,
    #[serde(default)]
    pub include_node_modules: bool,
    #[serde(default)]
    pub include_storage: bool,
    #[serde(default)]
    pub include_build_output: bool,
    #[serde(default)]
    pub include_lock_files: bool,
    #[serde(default)]
    pub include_source_maps: bool,
    #[serde(default)]
    pub include_minified: bool,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            directories: default_excluded_directories(),
            patterns: default_excluded_patterns(),
            files: default_excluded_files(),
            extensions: default_excluded_extensions(),
            binary_extensions: default_binary_extensions(),
            toggles: ExclusionToggles::default(),
        }
    }
}

fn default_schema_version() -> String {
    "2.0.0".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_excluded_directories() -> Vec<String> {
    strings(&[
        ".git",
        ".svn",
        ".hg",
        "vendor",
        "node_modules",
        "bower_components",
        "storage",
        "bootstrap/cache",
        "public/build",
        "public/hot",
        "dist",
        "build",
        "target",
        ".output",
        ".next",
        ".nuxt",
        ".idea",
        ".vscode",
        ".fleet",
        "cache",
        ".cache",
        "__pycache__",
        ".pytest_cache",
        ".mypy_cache",
        ".phpunit.cache",
        "coverage",
        ".nyc_output",
    ])
}

fn default_excluded_patterns() -> Vec<String> {
    strings(&[
        "**/node_modules/**",
        "**/vendor/**",
        "**/.git/**",
        "**/storage/logs/**",
        "**/storage/framework/**",
        "**/bootstrap/cache/**",
    ])
}

fn default_excluded_files() -> Vec<String> {
    strings(&[
        ".DS_Store",
        "Thumbs.db",
        ".gitkeep",
        ".gitignore",
        ".editorconfig",
    ])
}

fn default_excluded_extensions() -> Vec<String> {
    strings(&[
        "lock", "log", "map", "min.js", "min.css", "bundle.js", "chunk.js",
    ])
}

fn default_binary_extensions() -> Vec<String> {
    strings(&[
        "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "svg", "avif", "tiff", "mp3", "mp4",
        "wav", "avi", "mov", "mkv", "webm", "ogg", "flac", "pdf", "doc", "docx", "xls", "xlsx",
        "ppt", "pptx", "zip", "tar", "gz", "rar", "7z", "bz2", "xz", "exe", "dll", "so",
        "dylib", "bin", "app", "ttf", "otf", "woff", "woff2", "eot", "sqlite", "db", "mysql",
        "sqlite3", "mdb", "phar", "jar", "war",
    ])
}

// ---------------------------------------------------------------------------
// Languages and framework hints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct LanguageConfig {
    /// Extension (possibly multi-part, e.g. `blade.php`) → language name.
    #[serde(default = "default_extension_map")]
    pub extension_map: BTreeMap<String, String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            extension_map: default_extension_map(),
        }
    }
}

fn default_extension_map() -> BTreeMap<String, String> {
    [
        ("php", "php"),
        ("blade.php", "blade"),
        ("js", "javascript"),
        ("mjs", "javascript"),
        ("cjs", "javascript"),
        ("ts", "typescript"),
        ("mts", "typescript"),
        ("tsx", "typescriptreact"),
        ("jsx", "javascriptreact"),
        ("vue", "vue"),
        ("svelte", "svelte"),
        ("css", "css"),
        ("scss", "scss"),
        ("sass", "sass"),
        ("less", "less"),
        ("json", "json"),
        ("yml", "yaml"),
        ("yaml", "yaml"),
        ("toml", "toml"),
        ("md", "markdown"),
        ("mdx", "mdx"),
        ("sql", "sql"),
        ("sh", "shell"),
        ("bash", "shell"),
        ("zsh", "shell"),
        ("xml", "xml"),
        ("html", "html"),
        ("twig", "twig"),
        ("env", "dotenv"),
        ("env.example", "dotenv"),
        ("py", "python"),
        ("rs", "rust"),
        ("go", "go"),
        ("rb", "ruby"),
        ("java", "java"),
        ("kt", "kotlin"),
        ("c", "c"),
        ("h", "c"),
        ("cpp", "cpp"),
        ("hpp", "cpp"),
        ("cs", "csharp"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrameworkHintConfig {
    /// Hint name → glob patterns matched against the relative path.
    #[serde(default = "default_hint_paths")]
    pub path_patterns: BTreeMap<String, Vec<String>>,
    /// Hint name → substrings searched in file content.
    #[serde(default = "default_hint_markers")]
    pub content_markers: BTreeMap<String, Vec<String>>,
}

impl Default for FrameworkHintConfig {
    fn default() -> Self {
        Self {
            path_patterns: default_hint_paths(),
            content_markers: default_hint_markers(),
        }
    }
}

fn default_hint_paths() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert(
        "livewire".to_string(),
        strings(&[
            "app/Livewire/**",
            "app/Http/Livewire/**",
            "resources/views/livewire/**",
        ]),
    );
    map.insert(
        "inertia".to_string(),
        strings(&[
            "resources/js/Pages/**",
            "resources/js/pages/**",
            "resources/ts/Pages/**",
            "resources/ts/pages/**",
        ]),
    );
    map.insert(
        "blade".to_string(),
        strings(&["resources/views/**/*.blade.php"]),
    );
    map.insert(
        "vue".to_string(),
        strings(&["resources/js/**/*.vue", "resources/ts/**/*.vue"]),
    );
    map.insert(
        "react".to_string(),
        strings(&[
            "resources/js/**/*.jsx",
            "resources/js/**/*.tsx",
            "resources/ts/**/*.tsx",
        ]),
    );
    map
}

fn default_hint_markers() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert(
        "livewire".to_string(),
        strings(&[
            "extends Livewire\\Component",
            "use Livewire\\",
            "@livewire(",
            "<livewire:",
        ]),
    );
    map.insert(
        "inertia".to_string(),
        strings(&["Inertia::render", "@inertia", "createInertiaApp", "usePage("]),
    );
    map.insert(
        "vue".to_string(),
        strings(&["defineComponent", "createApp(", "Vue.component"]),
    );
    map.insert(
        "react".to_string(),
        strings(&["React.", "useState", "useEffect", "createRoot"]),
    );
    map
}

// ---------------------------------------------------------------------------
// Scanner, chunking, knowledge base
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    /// Files above this size are recorded with metadata only.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Bytes read for binary sniffing.
    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,
    /// Concurrent file-processing tasks. `0` means available parallelism.
    #[serde(default)]
    pub workers: usize,
    /// Emit a progress event every N processed files.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            sniff_bytes: default_sniff_bytes(),
            workers: 0,
            progress_every: default_progress_every(),
            follow_symlinks: false,
        }
    }
}

impl ScannerConfig {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

fn default_max_file_size() -> u64 {
    1024 * 1024
}
fn default_sniff_bytes() -> usize {
    8192
}
fn default_progress_every() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_chunk_max_lines")]
    pub max_lines: usize,
    #[serde(default)]
    pub break_weights: BreakWeights,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_chunk_max_bytes(),
            max_lines: default_chunk_max_lines(),
            break_weights: BreakWeights::default(),
        }
    }
}

fn default_chunk_max_bytes() -> usize {
    200 * 1024
}
fn default_chunk_max_lines() -> usize {
    500
}

/// Preference for each kind of break point; higher wins, `0` disables.
#[derive(Debug, Deserialize, Clone)]
pub struct BreakWeights {
    #[serde(default = "default_weight_empty_line")]
    pub empty_line: u32,
    #[serde(default = "default_weight_class_boundary")]
    pub class_boundary: u32,
    #[serde(default = "default_weight_function_boundary")]
    pub function_boundary: u32,
    #[serde(default = "default_weight_block_end")]
    pub block_end: u32,
    #[serde(default = "default_weight_comment_block")]
    pub comment_block: u32,
}

impl Default for BreakWeights {
    fn default() -> Self {
        Self {
            empty_line: default_weight_empty_line(),
            class_boundary: default_weight_class_boundary(),
            function_boundary: default_weight_function_boundary(),
            block_end: default_weight_block_end(),
            comment_block: default_weight_comment_block(),
        }
    }
}

fn default_weight_empty_line() -> u32 {
    10
}
fn default_weight_class_boundary() -> u32 {
    9
}
fn default_weight_function_boundary() -> u32 {
    8
}
fn default_weight_block_end() -> u32 {
    7
}
fn default_weight_comment_block() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    /// Above this many files the file index is written as NDJSON.
    #[serde(default = "default_ndjson_threshold")]
    pub ndjson_threshold: usize,
    /// Completed bundles kept per project.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            ndjson_threshold: default_ndjson_threshold(),
            retention: default_retention(),
        }
    }
}

fn default_ndjson_threshold() -> usize {
    10_000
}
fn default_retention() -> usize {
    3
}

// ---------------------------------------------------------------------------
// Pipeline and credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Per git invocation.
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    #[serde(default = "default_webhook_dedup_secs")]
    pub webhook_dedup_secs: u64,
    /// A `running` scan older than this is considered abandoned.
    #[serde(default = "default_stale_scan_secs")]
    pub stale_scan_secs: u64,
    /// Webhook change sets larger than this trigger a full scan.
    #[serde(default = "default_incremental_threshold")]
    pub incremental_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            git_timeout_secs: default_git_timeout_secs(),
            webhook_dedup_secs: default_webhook_dedup_secs(),
            stale_scan_secs: default_stale_scan_secs(),
            incremental_threshold: default_incremental_threshold(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> u32 {
    2
}
fn default_backoff_max_ms() -> u64 {
    300_000
}
fn default_stage_timeout_secs() -> u64 {
    300
}
fn default_scan_timeout_secs() -> u64 {
    600
}
fn default_git_timeout_secs() -> u64 {
    120
}
fn default_webhook_dedup_secs() -> u64 {
    60
}
fn default_stale_scan_secs() -> u64 {
    3600
}
fn default_incremental_threshold() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// Environment variable holding the repository access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Fail with `NoValidToken` when the variable is unset.
    #[serde(default)]
    pub required: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            required: false,
        }
    }
}

fn default_token_env() -> String {
    "KB_GIT_TOKEN".to_string()
}

impl Config {
    /// Config with every section at its default, rooted at `dir`.
    pub fn minimal_in(dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: dir.join("kb.sqlite"),
            },
            storage: StorageConfig {
                root: dir.join("projects"),
            },
            exclusions: ExclusionConfig::default(),
            languages: LanguageConfig::default(),
            framework_hints: FrameworkHintConfig::default(),
            scanner: ScannerConfig::default(),
            chunking: ChunkingConfig::default(),
            knowledge_base: KnowledgeBaseConfig::default(),
            pipeline: PipelineConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }

    /// Config rooted at `./data`.
    pub fn minimal() -> Self {
        Self::minimal_in(Path::new("./data"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_lines == 0 {
        anyhow::bail!("chunking.max_lines must be > 0");
    }
    if config.chunking.max_bytes == 0 {
        anyhow::bail!("chunking.max_bytes must be > 0");
    }
    if config.scanner.progress_every == 0 {
        anyhow::bail!("scanner.progress_every must be > 0");
    }
    if config.scanner.sniff_bytes == 0 {
        anyhow::bail!("scanner.sniff_bytes must be > 0");
    }
    if config.knowledge_base.retention == 0 {
        anyhow::bail!("knowledge_base.retention must be >= 1");
    }
    if config.pipeline.max_attempts == 0 {
        anyhow::bail!("pipeline.max_attempts must be >= 1");
    }
    if config.pipeline.backoff_multiplier == 0 {
        anyhow::bail!("pipeline.backoff_multiplier must be >= 1");
    }
    if config.pipeline.stage_timeout_secs == 0 || config.pipeline.scan_timeout_secs == 0 {
        anyhow::bail!("pipeline timeouts must be > 0");
    }
    if config.exclusions.schema_version.trim().is_empty() {
        anyhow::bail!("exclusions.schema_version must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"/tmp/kb.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_lines, 500);
        assert_eq!(config.chunking.max_bytes, 200 * 1024);
        assert_eq!(config.chunking.break_weights.empty_line, 10);
        assert_eq!(config.knowledge_base.ndjson_threshold, 10_000);
        assert_eq!(config.knowledge_base.retention, 3);
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.exclusions.schema_version, "2.0.0");
        assert!(config.exclusions.directories.contains(&"vendor".to_string()));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn overrides_are_applied() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "kb.sqlite"

            [chunking]
            max_lines = 40

            [chunking.break_weights]
            empty_line = 1

            [exclusions.toggles]
            include_vendor = true
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.max_lines, 40);
        assert_eq!(config.chunking.break_weights.empty_line, 1);
        assert_eq!(config.chunking.break_weights.class_boundary, 9);
        assert!(config.exclusions.toggles.include_vendor);
    }

    #[test]
    fn zero_max_lines_rejected() {
        let mut config = Config::minimal();
        config.chunking.max_lines = 0;
        assert!(validate(&config).is_err());
    }
}
