//! # repo-kb CLI (`kb`)
//!
//! Registers git repositories as projects and turns each into versioned
//! knowledge base bundles.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb project add <id> <url>` | Register a repository |
//! | `kb project remove <id>` | Unregister a project, optionally deleting its storage |
//! | `kb project list` | List registered projects |
//! | `kb scan <id>` | Run the pipeline (manual, or webhook with `--webhook`) |
//! | `kb diff <id> <from> <to>` | List paths changed between two revisions |
//! | `kb status [id]` | Overview, or one project's state and scan history |
//! | `kb verify <id>` | Re-validate a knowledge base bundle on disk |
//!
//! ## Examples
//!
//! ```bash
//! kb init
//! kb project add shop https://github.com/acme/shop.git --branch main
//! kb scan shop --progress human
//! kb scan shop --webhook --payload push.json
//! kb verify shop
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use repo_kb::commands::{self, ScanArgs};
use repo_kb::progress::ProgressMode;
use repo_kb::{config, migrate, stats};

/// repo-kb: repository ingestion into versioned knowledge base bundles.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "repo-kb: turn git repositories into versioned, content-addressed knowledge bases",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Debug-level logging on stderr. `RUST_LOG` takes precedence.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage registered projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Scan a project and write a knowledge base bundle.
    Scan {
        /// Project id.
        project: String,

        /// Treat the run as a webhook trigger (branch filter, dedup,
        /// incremental strategy).
        #[arg(long)]
        webhook: bool,

        /// Push payload (JSON) for a webhook run. Implies `--webhook`.
        #[arg(long)]
        payload: Option<PathBuf>,

        /// Progress output on stderr. Defaults to human on a TTY.
        #[arg(long, value_enum, default_value_t = ProgressArg::Auto)]
        progress: ProgressArg,

        /// Print the scan report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List paths changed between two revisions of a project.
    Diff {
        project: String,
        from: String,
        to: String,
    },

    /// Show all projects, or one project in detail.
    Status {
        project: Option<String>,
    },

    /// Re-validate a knowledge base bundle.
    Verify {
        project: String,

        /// Bundle id (`scan_...`). Defaults to the latest bundle.
        #[arg(long)]
        scan: Option<String>,

        /// Print the validation summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Register a repository.
    Add {
        /// Slug: lowercase letters, digits, `-` and `_`.
        id: String,
        /// Clone URL. Credentials are supplied at sync time, not here.
        repo_url: String,
        /// Default branch.
        #[arg(long, default_value = "main")]
        branch: String,
        /// Track this branch instead of the default.
        #[arg(long)]
        track: Option<String>,
    },
    /// Unregister a project and delete its working copy and bundles.
    Remove {
        id: String,
        /// Leave the project's storage directory on disk.
        #[arg(long)]
        keep_storage: bool,
    },
    /// List registered projects.
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Auto,
    Human,
    Json,
    Off,
}

impl ProgressArg {
    fn mode(self) -> ProgressMode {
        match self {
            ProgressArg::Auto => ProgressMode::default_for_tty(),
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "repo_kb=debug,kb=debug" } else { "repo_kb=info,kb=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => match action {
            ProjectAction::Add {
                id,
                repo_url,
                branch,
                track,
            } => {
                commands::run_project_add(&cfg, &id, &repo_url, &branch, track).await?;
            }
            ProjectAction::Remove { id, keep_storage } => {
                commands::run_project_remove(&cfg, &id, keep_storage).await?;
            }
            ProjectAction::List => {
                commands::run_project_list(&cfg).await?;
            }
        },
        Commands::Scan {
            project,
            webhook,
            payload,
            progress,
            json,
        } => {
            commands::run_scan(
                &cfg,
                ScanArgs {
                    project_id: &project,
                    webhook,
                    payload: payload.as_deref(),
                    progress: progress.mode(),
                    json,
                },
            )
            .await?;
        }
        Commands::Diff { project, from, to } => {
            commands::run_diff(&cfg, &project, &from, &to).await?;
        }
        Commands::Status { project } => {
            stats::run_status(&cfg, project.as_deref()).await?;
        }
        Commands::Verify {
            project,
            scan,
            json,
        } => {
            commands::run_verify(&cfg, &project, scan.as_deref(), json).await?;
        }
    }

    Ok(())
}
