//! Lightweight symbol and import extraction.
//!
//! Pattern matching only, no parsing. Results are advisory metadata attached
//! to file records and chunks; a missed or spurious symbol never affects
//! chunk boundaries or ids.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Symbols found in a span of source text. Every list is sorted and unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolSet {
    pub declared: Vec<String>,
    pub used: Vec<String>,
    pub imports: Vec<String>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Php,
    Script,
    Python,
    Rust,
    Go,
    Generic,
}

fn family(language: &str) -> Family {
    match language {
        "php" | "blade" => Family::Php,
        "javascript" | "typescript" | "javascriptreact" | "typescriptreact" | "vue" | "svelte" => {
            Family::Script
        }
        "python" => Family::Python,
        "rust" => Family::Rust,
        "go" => Family::Go,
        _ => Family::Generic,
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static symbol pattern")
}

// PHP / Blade
static PHP_TYPE: Lazy<Regex> = Lazy::new(|| {
    re(r"(?m)^\s*(?:(?:abstract|final|readonly)\s+)*(?:class|interface|trait|enum)\s+([A-Za-z_]\w*)")
});
static PHP_FUNCTION: Lazy<Regex> = Lazy::new(|| re(r"\bfunction\s+&?([A-Za-z_]\w*)\s*\("));
static PHP_USE: Lazy<Regex> = Lazy::new(|| re(r"(?m)^\s*use\s+(?:function\s+|const\s+)?\\?([A-Za-z_][\w\\]*)"));
static PHP_REQUIRE: Lazy<Regex> = Lazy::new(|| {
    re(r#"\b(?:require|include)(?:_once)?\s*\(?\s*['"]([^'"]+)['"]"#)
});
static PHP_USED: Lazy<Regex> = Lazy::new(|| {
    re(r"(?:\bnew\s+\\?|\bextends\s+\\?|\binstanceof\s+\\?)([A-Z][\w\\]*)|\b([A-Z]\w*)::")
});
static PHP_IMPLEMENTS: Lazy<Regex> = Lazy::new(|| re(r"\bimplements\s+([\w\\,\s]+?)\s*\{"));
static BLADE_REF: Lazy<Regex> = Lazy::new(|| {
    re(r#"@(?:include|extends|component|livewire|each)\(\s*['"]([^'"]+)['"]|\bview\(\s*['"]([^'"]+)['"]|<(?:x-|livewire:)([\w.:-]+)"#)
});

// JavaScript / TypeScript / Vue
static JS_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    re(r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)")
});
static JS_CLASS: Lazy<Regex> = Lazy::new(|| {
    re(r"(?m)^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?(?:class|interface|type|enum)\s+([A-Za-z_$][\w$]*)")
});
static JS_ARROW: Lazy<Regex> = Lazy::new(|| {
    re(r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s*)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>")
});
static JS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    re(r#"\bimport\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"]|\brequire\(\s*['"]([^'"]+)['"]\s*\)|\bimport\(\s*['"]([^'"]+)['"]\s*\)"#)
});
static JS_USED: Lazy<Regex> = Lazy::new(|| re(r"\bnew\s+([A-Z][\w$]*)|<([A-Z][\w$]*)[\s/>]|\bextends\s+([A-Z][\w$.]*)"));

// Python
static PY_DECL: Lazy<Regex> = Lazy::new(|| re(r"(?m)^\s*(?:async\s+)?(?:def|class)\s+([A-Za-z_]\w*)"));
static PY_IMPORT: Lazy<Regex> = Lazy::new(|| re(r"(?m)^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))"));

// Rust
static RS_DECL: Lazy<Regex> = Lazy::new(|| {
    re(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+|const\s+|unsafe\s+)*(?:fn|struct|enum|trait|mod|type|union)\s+([A-Za-z_]\w*)")
});
static RS_USE: Lazy<Regex> = Lazy::new(|| re(r"(?m)^\s*(?:pub\s+)?use\s+([\w:]+)"));

// Go
static GO_DECL: Lazy<Regex> = Lazy::new(|| re(r"(?m)^\s*(?:func\s+(?:\([^)]*\)\s*)?|type\s+)([A-Za-z_]\w*)"));
static GO_IMPORT_LINE: Lazy<Regex> = Lazy::new(|| re(r#"(?m)^\s*import\s+(?:\w+\s+)?"([^"]+)""#));
static GO_IMPORT_BLOCK: Lazy<Regex> = Lazy::new(|| re(r"(?s)\bimport\s*\((.*?)\)"));
static GO_QUOTED: Lazy<Regex> = Lazy::new(|| re(r#""([^"]+)""#));

// Everything else
static GENERIC_DECL: Lazy<Regex> = Lazy::new(|| {
    re(r"(?m)^\s*(?:class|function|def|fn|func|interface|struct)\s+([A-Za-z_]\w*)")
});

/// Extract symbols from `text` using the patterns for `language`.
pub fn extract(language: &str, text: &str) -> SymbolSet {
    let mut declared = BTreeSet::new();
    let mut used = BTreeSet::new();
    let mut imports = BTreeSet::new();
    let mut references = BTreeSet::new();

    match family(language) {
        Family::Php => {
            collect(&PHP_TYPE, text, &mut declared);
            collect(&PHP_FUNCTION, text, &mut declared);
            collect(&PHP_USE, text, &mut imports);
            collect(&PHP_REQUIRE, text, &mut imports);
            collect(&PHP_USED, text, &mut used);
            for cap in PHP_IMPLEMENTS.captures_iter(text) {
                for name in cap[1].split(',') {
                    let name = name.trim().trim_start_matches('\\');
                    if !name.is_empty() {
                        used.insert(name.to_string());
                    }
                }
            }
            collect(&BLADE_REF, text, &mut references);
        }
        Family::Script => {
            collect(&JS_FUNCTION, text, &mut declared);
            collect(&JS_CLASS, text, &mut declared);
            collect(&JS_ARROW, text, &mut declared);
            collect(&JS_IMPORT, text, &mut imports);
            collect(&JS_USED, text, &mut used);
        }
        Family::Python => {
            collect(&PY_DECL, text, &mut declared);
            collect(&PY_IMPORT, text, &mut imports);
        }
        Family::Rust => {
            collect(&RS_DECL, text, &mut declared);
            collect(&RS_USE, text, &mut imports);
        }
        Family::Go => {
            collect(&GO_DECL, text, &mut declared);
            collect(&GO_IMPORT_LINE, text, &mut imports);
            for block in GO_IMPORT_BLOCK.captures_iter(text) {
                collect(&GO_QUOTED, &block[1], &mut imports);
            }
        }
        Family::Generic => {
            collect(&GENERIC_DECL, text, &mut declared);
        }
    }

    // A symbol declared here is not "used" from elsewhere.
    for name in &declared {
        used.remove(name);
    }

    SymbolSet {
        declared: declared.into_iter().collect(),
        used: used.into_iter().collect(),
        imports: imports.into_iter().collect(),
        references: references.into_iter().collect(),
    }
}

/// Insert the first participating capture group of every match.
fn collect(pattern: &Regex, text: &str, out: &mut BTreeSet<String>) {
    for cap in pattern.captures_iter(text) {
        if let Some(m) = cap.iter().skip(1).flatten().next() {
            out.insert(m.as_str().to_string());
        }
    }
}
