//! # codescope CLI
//!
//! The `codescope` binary ingests a repository into a snapshot, indexes
//! it for semantic retrieval, runs the analysis team over it, and answers
//! questions about it.
//!
//! ## Usage
//!
//! ```bash
//! codescope --config ./config/codescope.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `codescope init` | Create the SQLite database and run schema migrations |
//! | `codescope ingest <source>` | Snapshot a directory, `.zip` archive, or git URL |
//! | `codescope status [snapshot]` | List snapshots, or show one with its skipped files |
//! | `codescope reindex <snapshot>` | Re-embed a snapshot and swap the new index in |
//! | `codescope search <snapshot> "<query>"` | Retrieve the closest code chunks |
//! | `codescope analyze <snapshot>` | Run the analysis roles and store the report |
//! | `codescope analyze <snapshot> --resume <run>` | Re-run the unfinished roles of a stored run |
//! | `codescope report <snapshot>` | Print the latest (or a given) report |
//! | `codescope ask <snapshot> "<question>"` | Ask a question in a chat session |
//! | `codescope clear-session <snapshot>` | Forget a chat session |
//! | `codescope remove <snapshot>` | Delete a snapshot and everything it owns |
//!
//! Wherever a snapshot id is expected, `latest` names the most recent
//! indexed snapshot.
//!
//! ## Examples
//!
//! ```bash
//! codescope init
//! codescope ingest ./my-service
//! codescope ingest https://github.com/org/repo.git --branch develop
//! codescope analyze latest --template full_analysis
//! codescope ask latest "Where are HTTP routes registered?"
//! ```

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use codescope::chat::ChatService;
use codescope::config::{self, AnalysisOverrides};
use codescope::ingest;
use codescope::migrate;
use codescope::orchestrator;
use codescope::progress::ProgressMode;
use codescope::report;
use codescope::search;
use codescope::services::Services;
use codescope::source::SourceRef;
use codescope::status;
use codescope_core::models::Language;
use codescope_core::retrieve::RetrievalFilters;

/// codescope: semantic code analysis and question answering over
/// repository snapshots.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/codescope.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "codescope",
    about = "codescope: index a repository, analyze it with a team of agents, and ask questions about it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/codescope.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables. Idempotent.
    Init,

    /// Ingest a repository into a new snapshot and index it.
    ///
    /// The source is a local directory, a `.zip` archive, or a git URL.
    Ingest {
        /// Directory path, `.zip` path, or git URL.
        source: String,

        /// Branch to clone for git sources (default: main, then master).
        #[arg(long)]
        branch: Option<String>,

        /// Progress output on stderr (default: human when stderr is a TTY).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// List snapshots, or show one snapshot in detail.
    Status {
        /// Snapshot id or `latest`.
        snapshot: Option<String>,
    },

    /// Rebuild a snapshot's embedding index.
    ///
    /// Search and chat keep using the current index until the new one is
    /// complete.
    Reindex {
        snapshot: String,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Retrieve the code chunks closest to a query.
    Search {
        snapshot: String,

        query: String,

        /// Number of results (default: `[retrieval] k`).
        #[arg(long)]
        k: Option<usize>,

        /// Only return chunks under this path prefix.
        #[arg(long)]
        path_prefix: Option<String>,

        /// Only return chunks of this language (e.g. `rust`, `python`).
        #[arg(long)]
        language: Option<Language>,
    },

    /// Run the analysis roles over a snapshot and store the report.
    Analyze {
        snapshot: String,

        /// `quick`, `standard`, or `deep`.
        #[arg(long)]
        depth: Option<String>,

        /// `low`, `medium`, or `high`.
        #[arg(long)]
        verbosity: Option<String>,

        /// Comma-separated roles, e.g. `sde,pm`. Dependencies are added.
        #[arg(long)]
        roles: Option<String>,

        /// Named preset: quick_scan, full_analysis, sde_focused, pm_focused.
        #[arg(long, conflicts_with_all = ["depth", "verbosity", "roles"])]
        template: Option<String>,

        /// Re-run only the roles that failed or were cancelled in this
        /// run, keeping its settings. Writes a new report.
        #[arg(long, value_name = "RUN", conflicts_with_all = ["depth", "verbosity", "roles", "template"])]
        resume: Option<String>,

        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print an analysis report.
    Report {
        snapshot: String,

        /// Report (run) id; defaults to the latest report.
        #[arg(long)]
        run: Option<String>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Ask a question about a snapshot.
    Ask {
        snapshot: String,

        question: String,

        /// Chat session name.
        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Forget every turn of a chat session.
    ClearSession {
        snapshot: String,

        #[arg(long, default_value = "default")]
        session: String,
    },

    /// Delete a snapshot with its chunks, embeddings, reports and sessions.
    Remove { snapshot: String },

    /// Print shell completions.
    Completions { shell: Shell },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("codescope={},codescope_core={}", level, level))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "codescope", &mut io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let services = Services::open(cfg).await?;

    match cli.command {
        Commands::Init | Commands::Completions { .. } => {}
        Commands::Ingest {
            source,
            branch,
            progress,
        } => {
            let source = SourceRef::parse(&source, branch)?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let snapshot = ingest::ingest(&services, source, reporter.as_ref()).await?;
            println!("{}", snapshot.id);
            print!("{}", status::render_detail(&snapshot, &[]));
        }
        Commands::Status { snapshot } => {
            status::run_status(&services, snapshot.as_deref()).await?;
        }
        Commands::Reindex { snapshot, progress } => {
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let snapshot = ingest::reindex(&services, &snapshot, reporter.as_ref()).await?;
            print!("{}", status::render_detail(&snapshot, &[]));
        }
        Commands::Search {
            snapshot,
            query,
            k,
            path_prefix,
            language,
        } => {
            let filters = RetrievalFilters {
                path_prefix,
                language,
            };
            search::run_search(&services, &snapshot, &query, k, filters).await?;
        }
        Commands::Analyze {
            snapshot,
            depth,
            verbosity,
            roles,
            template,
            resume,
            progress,
        } => {
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let report = match resume {
                Some(run_id) => {
                    orchestrator::resume_analysis(
                        &services,
                        &snapshot,
                        &run_id,
                        cancel_on_ctrl_c(),
                        reporter.as_ref(),
                    )
                    .await?
                }
                None => {
                    let settings = services.config.analysis_settings_with(&AnalysisOverrides {
                        template,
                        depth,
                        verbosity,
                        roles,
                    })?;
                    orchestrator::analyze(
                        &services,
                        &snapshot,
                        &settings,
                        cancel_on_ctrl_c(),
                        reporter.as_ref(),
                    )
                    .await?
                }
            };
            print!("{}", report.to_markdown());
            let failed = report.failed_roles();
            if !failed.is_empty() {
                eprintln!(
                    "{} of {} roles failed; the report is partial. Resume with: codescope analyze {} --resume {}",
                    failed.len(),
                    report.entries.len(),
                    report.snapshot_id,
                    report.id
                );
            }
        }
        Commands::Report {
            snapshot,
            run,
            json,
        } => {
            report::run_report(&services, &snapshot, run.as_deref(), json).await?;
        }
        Commands::Ask {
            snapshot,
            question,
            session,
        } => {
            let snapshot = services.indexed_snapshot(&snapshot).await?;
            let chat = ChatService::from_services(&services);
            let turn = chat.ask(&snapshot.id, &session, &question).await?;
            println!("{}", turn.answer);
            eprintln!("context: {}", turn.context_summary);
        }
        Commands::ClearSession { snapshot, session } => {
            let snapshot = services.resolve_snapshot(&snapshot).await?;
            let chat = ChatService::from_services(&services);
            let removed = chat.clear(&snapshot.id, &session).await?;
            println!("Cleared {} turns from session '{}'.", removed, session);
        }
        Commands::Remove { snapshot } => {
            let snapshot = services.resolve_snapshot(&snapshot).await?;
            services.store.delete_snapshot(&snapshot.id).await?;
            services.registry.remove(&snapshot.id);
            println!("Removed snapshot {}.", snapshot.id);
        }
    }

    Ok(())
}
