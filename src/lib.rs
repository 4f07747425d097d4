//! # repo-kb
//!
//! Turns a git repository into a versioned, content-addressed knowledge base
//! bundle: a file manifest, deterministically identified line-range chunks,
//! and derived statistics for downstream retrieval.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ RepoSync │──▶│ Scanner  │──▶│  Stack   │──▶│ Chunker  │──▶│    KB    │
//! │ git CLI  │   │ manifest │   │ detector │   │ chunk ids│   │  bundle  │
//! └──────────┘   └────┬─────┘   └──────────┘   └────┬─────┘   └────┬─────┘
//!                     └──────────────┬──────────────┘              │
//!                                    ▼                             ▼
//!                               ┌──────────┐               kb/<scan_id>/
//!                               │  SQLite  │
//!                               └──────────┘
//! ```
//!
//! Every scan is driven by [`orchestrator::Orchestrator::run_scan`], either
//! from the CLI or a webhook relay.
//!
//! ## Quick Start
//!
//! ```bash
//! kb init
//! kb project add acme https://github.com/acme/app.git --branch main
//! kb scan acme
//! kb status acme
//! kb verify acme
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline and sync error types |
//! | [`exclusion`] | Exclusion rules and file classification |
//! | [`repo_sync`] | Working copies, diffs, credential redaction |
//! | [`scanner`] | Manifest scanning and persistence |
//! | [`chunker`] | Line-range chunking |
//! | [`chunk_id`] | Versioned chunk identifiers |
//! | [`symbols`] | Lightweight symbol and import extraction |
//! | [`stack`] | Technology stack detection |
//! | [`knowledge_base`] | Bundle assembly, validation, retention |
//! | [`orchestrator`] | Stage sequencing and scan strategy |
//! | [`projects`] | Project registry and scan state transitions |
//! | [`retry`] | Retry policy |
//! | [`progress`] | Progress events and reporters |
//! | [`workers`] | Bounded worker pool |
//! | [`credentials`] | Access token providers |
//! | [`stats`] | Status report |
//! | [`commands`] | CLI command handlers |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk_id;
pub mod chunker;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod exclusion;
pub mod knowledge_base;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod projects;
pub mod repo_sync;
pub mod retry;
pub mod scanner;
pub mod stack;
pub mod stats;
pub mod symbols;
pub mod workers;
