//! Technology stack detection for the `detect-stack` stage.
//!
//! Reads dependency manifests at the root of the working copy and combines
//! them with the per-file language and framework-hint data already in the
//! manifest. Malformed manifests are logged and skipped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{PipelineError, PipelineResult};
use crate::models::FileRecord;

/// File names whose change forces stack re-detection and therefore a full
/// scan. Matched on the base name at any depth.
pub const STACK_FILES: &[&str] = &[
    "composer.json",
    "composer.lock",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "vite.config.js",
    "vite.config.ts",
    "webpack.mix.js",
    "tailwind.config.js",
    "tailwind.config.ts",
    "Cargo.toml",
    "Cargo.lock",
    "go.mod",
    "go.sum",
    "requirements.txt",
    "pyproject.toml",
    "poetry.lock",
    "Gemfile",
    "Gemfile.lock",
];

/// Whether `path` names a build or dependency manifest.
pub fn is_stack_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    STACK_FILES.contains(&name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackInfo {
    /// Languages by descending file count.
    pub languages: Vec<LanguageShare>,
    pub package_managers: Vec<String>,
    pub frameworks: Vec<Framework>,
    /// Manifest files found at the root.
    pub manifests: Vec<String>,
    /// Union of per-file framework hints.
    pub framework_hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageShare {
    pub language: String,
    pub files: u64,
    pub lines: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Framework {
    pub name: String,
    pub version: Option<String>,
    /// Manifest the framework was read from.
    pub source: String,
}

/// (dependency name, framework name) pairs for composer.json.
const COMPOSER_FRAMEWORKS: &[(&str, &str)] = &[
    ("laravel/framework", "laravel"),
    ("livewire/livewire", "livewire"),
    ("inertiajs/inertia-laravel", "inertia"),
    ("filament/filament", "filament"),
    ("symfony/framework-bundle", "symfony"),
    ("slim/slim", "slim"),
];

const NPM_FRAMEWORKS: &[(&str, &str)] = &[
    ("react", "react"),
    ("vue", "vue"),
    ("svelte", "svelte"),
    ("next", "next"),
    ("nuxt", "nuxt"),
    ("express", "express"),
    ("alpinejs", "alpine"),
    ("tailwindcss", "tailwind"),
    ("vite", "vite"),
    ("laravel-mix", "laravel-mix"),
];

const CARGO_FRAMEWORKS: &[(&str, &str)] = &[
    ("tokio", "tokio"),
    ("axum", "axum"),
    ("actix-web", "actix-web"),
    ("rocket", "rocket"),
    ("warp", "warp"),
];

const GO_FRAMEWORKS: &[(&str, &str)] = &[
    ("github.com/gin-gonic/gin", "gin"),
    ("github.com/labstack/echo", "echo"),
    ("github.com/gofiber/fiber", "fiber"),
];

const PYTHON_FRAMEWORKS: &[(&str, &str)] = &[
    ("django", "django"),
    ("flask", "flask"),
    ("fastapi", "fastapi"),
];

/// (lock or manifest file, package manager).
const PACKAGE_MANAGERS: &[(&str, &str)] = &[
    ("composer.json", "composer"),
    ("package-lock.json", "npm"),
    ("yarn.lock", "yarn"),
    ("pnpm-lock.yaml", "pnpm"),
    ("Cargo.toml", "cargo"),
    ("go.mod", "go"),
    ("requirements.txt", "pip"),
    ("poetry.lock", "poetry"),
    ("Gemfile", "bundler"),
];

/// Detect the stack of the working copy at `root`.
pub fn detect(root: &Path, files: &[FileRecord]) -> StackInfo {
    let manifests: Vec<String> = STACK_FILES
        .iter()
        .filter(|name| root.join(name).is_file())
        .map(|name| name.to_string())
        .collect();

    let mut managers: BTreeSet<String> = PACKAGE_MANAGERS
        .iter()
        .filter(|(file, _)| manifests.iter().any(|m| m == file))
        .map(|(_, manager)| manager.to_string())
        .collect();
    // A bare package.json without a lockfile still implies npm.
    if manifests.iter().any(|m| m == "package.json")
        && !managers.iter().any(|m| m == "yarn" || m == "pnpm")
    {
        managers.insert("npm".to_string());
    }
    if manifests.iter().any(|m| m == "pyproject.toml") && !managers.contains("poetry") {
        managers.insert("pip".to_string());
    }

    let mut frameworks = BTreeSet::new();
    if let Some(json) = read_json(root, "composer.json") {
        for section in ["require", "require-dev"] {
            frameworks.extend(match_json_deps(&json, section, COMPOSER_FRAMEWORKS, "composer.json"));
        }
    }
    if let Some(json) = read_json(root, "package.json") {
        for section in ["dependencies", "devDependencies"] {
            frameworks.extend(match_json_deps(&json, section, NPM_FRAMEWORKS, "package.json"));
        }
    }
    frameworks.extend(cargo_frameworks(root));
    frameworks.extend(line_frameworks(root, "go.mod", GO_FRAMEWORKS));
    frameworks.extend(line_frameworks(root, "requirements.txt", PYTHON_FRAMEWORKS));
    frameworks.extend(line_frameworks(root, "pyproject.toml", PYTHON_FRAMEWORKS));

    // Keep one entry per framework name; the first source wins.
    let mut seen = BTreeSet::new();
    let frameworks: Vec<Framework> = frameworks
        .into_iter()
        .filter(|f: &Framework| seen.insert(f.name.clone()))
        .collect();

    StackInfo {
        languages: language_shares(files),
        package_managers: managers.into_iter().collect(),
        frameworks,
        manifests,
        framework_hints: files
            .iter()
            .flat_map(|f| f.framework_hints.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    }
}

fn language_shares(files: &[FileRecord]) -> Vec<LanguageShare> {
    let mut by_language: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for f in files.iter().filter(|f| !f.is_binary) {
        let entry = by_language.entry(f.language.as_str()).or_default();
        entry.0 += 1;
        entry.1 += f.line_count;
    }
    let mut shares: Vec<LanguageShare> = by_language
        .into_iter()
        .map(|(language, (files, lines))| LanguageShare {
            language: language.to_string(),
            files,
            lines,
        })
        .collect();
    shares.sort_by(|a, b| b.files.cmp(&a.files).then_with(|| a.language.cmp(&b.language)));
    shares
}

fn read_json(root: &Path, name: &str) -> Option<serde_json::Value> {
    let content = std::fs::read_to_string(root.join(name)).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(manifest = name, error = %e, "unparseable manifest skipped");
            None
        }
    }
}

fn match_json_deps(
    json: &serde_json::Value,
    section: &str,
    table: &[(&str, &str)],
    source: &str,
) -> Vec<Framework> {
    let Some(deps) = json.get(section).and_then(|d| d.as_object()) else {
        return Vec::new();
    };
    table
        .iter()
        .filter_map(|(dep, name)| {
            deps.get(*dep).map(|version| Framework {
                name: name.to_string(),
                version: version.as_str().map(str::to_string),
                source: source.to_string(),
            })
        })
        .collect()
}

fn cargo_frameworks(root: &Path) -> Vec<Framework> {
    let Ok(content) = std::fs::read_to_string(root.join("Cargo.toml")) else {
        return Vec::new();
    };
    let manifest: toml::Value = match toml::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(manifest = "Cargo.toml", error = %e, "unparseable manifest skipped");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    let tables = ["dependencies", "dev-dependencies"]
        .into_iter()
        .filter_map(|section| manifest.get(section).and_then(|t| t.as_table()))
        .chain(
            manifest
                .get("workspace")
                .and_then(|w| w.get("dependencies"))
                .and_then(|t| t.as_table()),
        );
    for deps in tables {
        for (dep, name) in CARGO_FRAMEWORKS {
            if let Some(spec) = deps.get(*dep) {
                let version = match spec {
                    toml::Value::String(v) => Some(v.clone()),
                    toml::Value::Table(t) => {
                        t.get("version").and_then(|v| v.as_str()).map(str::to_string)
                    }
                    _ => None,
                };
                found.push(Framework {
                    name: name.to_string(),
                    version,
                    source: "Cargo.toml".to_string(),
                });
            }
        }
    }
    found
}

/// Frameworks named at the start of a line, e.g. `django==4.2` or
/// `github.com/gin-gonic/gin v1.9.1`.
fn line_frameworks(root: &Path, file: &str, table: &[(&str, &str)]) -> Vec<Framework> {
    let Ok(content) = std::fs::read_to_string(root.join(file)) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for line in content.lines() {
        let line = line
            .trim()
            .trim_start_matches("require ")
            .trim_start_matches('"')
            .trim();
        for (dep, name) in table {
            let Some(rest) = strip_prefix_ci(line, dep) else {
                continue;
            };
            // The dependency name must end here.
            if rest
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                continue;
            }
            let version = rest
                .trim_start_matches(|c: char| c == '=' || c == '>' || c == '<' || c == '~' || c.is_whitespace())
                .split(|c: char| c.is_whitespace() || c == '"' || c == ',')
                .next()
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            found.push(Framework {
                name: name.to_string(),
                version,
                source: file.to_string(),
            });
        }
    }
    found
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len()
        && line.is_char_boundary(prefix.len())
        && line[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

/// Write `stack.json` into the knowledge directory.
pub fn write_stack_json(knowledge_dir: &Path, stack: &StackInfo) -> PipelineResult<()> {
    let path = knowledge_dir.join("stack.json");
    let json = serde_json::to_string_pretty(stack)?;
    std::fs::write(&path, json).map_err(|e| PipelineError::io(&path, e))
}
