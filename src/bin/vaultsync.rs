//! # vaultsync CLI
//!
//! Pull, push and repair a local vault against a LiveSync CouchDB database.
//!
//! ## Usage
//! ```bash
//! # Bring remote changes into the vault
//! vaultsync pull
//!
//! # Preview what a push of one folder would upload
//! vaultsync --dry-run --path Notes/inbox push
//!
//! # Check that remote documents use canonical chunk ids
//! vaultsync push --verify --sample-limit 50
//!
//! # Remove local files deleted on other devices
//! vaultsync pull --delete-orphans
//! ```
//!
//! Credentials come from `COUCHDB_URI`, `COUCHDB_USER`, `COUCHDB_PASSWORD`
//! and `COUCHDB_DB`, in the environment or a `.env` file. The exit code is 1
//! whenever a run leaves conflicts, errors or verification mismatches.

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vaultsync::verification::DEFAULT_SAMPLE_LIMIT;
use vaultsync::{
    format_bytes, DocumentStatus, LocalStatus, Result, SyncDirection, SyncOptions, SyncSummary, VaultSync,
    VaultSyncBuilder,
};

/// Chunked sync of a note vault with a LiveSync CouchDB database
#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(version)]
#[command(about = "Sync a local vault with a LiveSync-compatible CouchDB database")]
#[command(long_about = None)]
struct Cli {
    /// Vault directory (defaults to VAULT_ROOT, then the current directory)
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Environment file with COUCHDB_* settings (defaults to ./.env)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Only paths starting with this prefix
    #[arg(short, long, global = true)]
    path: Option<String>,

    /// Plan and read, change nothing
    #[arg(long, global = true)]
    dry_run: bool,

    /// Concurrent chunk requests
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write remote changes into the vault
    Pull {
        /// Only pull paths whose timestamps show a change
        #[arg(long)]
        changed_only: bool,

        /// Delete local files that have no remote document
        #[arg(long)]
        delete_orphans: bool,
    },

    /// Upload local changes
    Push {
        /// Consider every path, not only those with newer timestamps
        #[arg(long)]
        force: bool,

        /// Audit remote chunk ids instead of pushing
        #[arg(long)]
        verify: bool,

        /// Documents to audit with --verify (0 = all)
        #[arg(long, default_value_t = DEFAULT_SAMPLE_LIMIT)]
        sample_limit: usize,
    },

    /// Regenerate documents whose chunk ids are not canonical
    Repair,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e.user_message());
            std::process::exit(1);
        }
    }
}

/// Run the selected command, returning whether it fully succeeded
fn run(cli: Cli) -> Result<bool> {
    let mut builder = VaultSyncBuilder::from_env(cli.vault, cli.env_file.as_deref())?;
    if let Some(workers) = cli.workers {
        builder = builder.max_workers(workers);
    }
    let sync = builder.build()?;
    let prefix = cli.path;
    let dry_run = cli.dry_run;

    match cli.command {
        Commands::Pull {
            changed_only,
            delete_orphans,
        } => cmd_sync(
            &sync,
            SyncDirection::Pull,
            SyncOptions {
                path_prefix: prefix,
                changed_only,
                dry_run,
                delete_orphans,
                ..Default::default()
            },
        ),
        Commands::Push {
            verify: true,
            sample_limit,
            ..
        } => cmd_verify(&sync, prefix.as_deref(), sample_limit),
        Commands::Push { force, .. } => cmd_sync(
            &sync,
            SyncDirection::Push,
            SyncOptions {
                path_prefix: prefix,
                force,
                dry_run,
                ..Default::default()
            },
        ),
        Commands::Repair => cmd_repair(&sync, prefix.as_deref(), dry_run),
    }
}

/// Spinner on stderr while a run is in progress
fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Pull or push, then print the summary
fn cmd_sync(sync: &VaultSync, direction: SyncDirection, options: SyncOptions) -> Result<bool> {
    let verb = match direction {
        SyncDirection::Pull => "Pulling",
        SyncDirection::Push => "Pushing",
    };
    println!(
        "{} {} {}{}",
        verb.blue().bold(),
        sync.vault_root().display().to_string().cyan(),
        options
            .path_prefix
            .as_deref()
            .map(|p| format!("(prefix {}) ", p))
            .unwrap_or_default(),
        if options.dry_run { "[dry-run]".yellow().to_string() } else { String::new() }
    );

    let start = Instant::now();
    let pb = spinner(&format!("{} documents...", verb));
    let result = match direction {
        SyncDirection::Pull => sync.pull(&options),
        SyncDirection::Push => sync.push(&options),
    };
    pb.finish_and_clear();
    let summary = result?;

    print_summary(&summary, start.elapsed());
    Ok(summary.is_success())
}

fn print_summary(summary: &SyncSummary, elapsed: Duration) {
    let mark = if summary.is_success() { "✓".green().bold() } else { "✗".red().bold() };
    let dry = if summary.dry_run { " (dry run, nothing changed)" } else { "" };
    println!("{} {} finished{}", mark, summary.direction, dry);
    println!("  Paths: {}", summary.total.to_string().cyan());
    println!("  Created: {}", summary.created.to_string().green());
    println!("  Updated: {}", summary.updated.to_string().green());
    println!("  Skipped: {}", summary.skipped.to_string().dimmed());
    println!(
        "  Chunks: {} ({})",
        summary.chunks_transferred.to_string().cyan(),
        format_bytes(summary.bytes_transferred).cyan()
    );
    if !summary.orphans.is_empty() {
        let label = if summary.dry_run { "Orphans to delete" } else { "Orphans deleted" };
        println!("  {}: {}", label, summary.orphans.len().to_string().yellow());
        for path in &summary.orphans {
            println!("    {} {}", "-".red(), path);
        }
    }
    if !summary.conflicted.is_empty() {
        println!("  {}: {}", "Conflicts".red().bold(), summary.conflicted.len());
        for path in &summary.conflicted {
            println!("    {} {}", "!".red(), path);
        }
    }
    if !summary.errored.is_empty() {
        println!("  {}: {}", "Errors".red().bold(), summary.errored.len());
        for error in &summary.errored {
            println!("    {} {}: {}", "✗".red(), error.path, error.message.dimmed());
        }
    }
    println!("  Time: {}", format_duration(round_ms(elapsed)).to_string().cyan());
}

/// Audit remote chunk ids
fn cmd_verify(sync: &VaultSync, prefix: Option<&str>, sample_limit: usize) -> Result<bool> {
    println!("{}", "Verifying chunk ids...".blue().bold());
    let pb = spinner("Fetching chunks...");
    let result = sync.verify(prefix, sample_limit);
    pb.finish_and_clear();
    let report = result?;

    for doc in &report.documents {
        let status = match &doc.status {
            DocumentStatus::Match => "ok".green(),
            DocumentStatus::ChunkIdMismatch { mismatched } => format!("{} chunk ids wrong", mismatched).red(),
            DocumentStatus::SchemeMismatch {
                expected,
                recorded,
                first_difference,
            } => format!(
                "split differs ({} canonical vs {} recorded, first at {})",
                expected, recorded, first_difference
            )
            .red(),
            DocumentStatus::Corrupt { missing } => format!("{} chunks missing", missing.len()).red().bold(),
        };
        let local = match &doc.local {
            LocalStatus::Differs { local, remote } => format!(" local copy differs ({} vs {} chunks)", local, remote)
                .yellow()
                .to_string(),
            LocalStatus::Unreadable(e) => format!(" local copy unreadable: {}", e).yellow().to_string(),
            LocalStatus::Match | LocalStatus::Absent => String::new(),
        };
        println!("  {} {}{}", doc.path, status, local);
    }

    let mark = if report.is_valid() { "✓".green().bold() } else { "✗".red().bold() };
    println!("{} {} of {} candidates", mark, report.summary(), report.candidates);
    println!("  Time: {}", format_duration(round_ms(report.duration)).to_string().cyan());
    if !report.is_valid() {
        println!("  Run {} to regenerate mismatched documents", "vaultsync repair".yellow());
    }
    Ok(report.is_valid())
}

/// Regenerate non-canonical documents
fn cmd_repair(sync: &VaultSync, prefix: Option<&str>, dry_run: bool) -> Result<bool> {
    println!(
        "{} {}",
        "Repairing chunk ids".blue().bold(),
        if dry_run { "[dry-run]".yellow().to_string() } else { String::new() }
    );
    let start = Instant::now();
    let pb = spinner("Checking documents...");
    let result = sync.repair(prefix, dry_run);
    pb.finish_and_clear();
    let report = result?;

    for action in &report.repaired {
        println!(
            "  {} {} ({} -> {} chunks, {} uploaded)",
            "↻".yellow(),
            action.path,
            action.old_chunks,
            action.new_chunks,
            action.chunks_uploaded
        );
    }
    for path in &report.corrupt {
        println!("  {} {} has missing chunks", "✗".red(), path);
    }
    for error in &report.errors {
        println!("  {} {}: {}", "✗".red(), error.path, error.message.dimmed());
    }

    let mark = if report.is_success() { "✓".green().bold() } else { "✗".red().bold() };
    println!(
        "{} {} examined, {} {}repaired",
        mark,
        report.examined,
        report.repaired.len(),
        if dry_run { "to be " } else { "" }
    );
    println!(
        "  Legacy chunks: {} removed, {} still referenced",
        report.legacy_chunks_deleted, report.legacy_chunks_retained
    );
    println!("  Time: {}", format_duration(round_ms(start.elapsed())).to_string().cyan());
    Ok(report.is_success())
}

/// Drop sub-millisecond noise from displayed durations
fn round_ms(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}
