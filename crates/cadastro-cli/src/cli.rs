//! CLI argument definitions for cadastro.
//!
//! The binary is the administrative surface over the work queue: it submits registry
//! keys, drives processing, and inspects or repairs the persisted work items.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `enqueue` | Queue registry keys given as arguments or read from a file |
//! | `run` | Reload pending work from the store and process it |
//! | `status` | Counts per status, recent items and provider state |
//! | `batch` | Latest status of a set of keys |
//! | `show` | Status and stored result of one key |
//! | `restart` | Requeue interrupted and due work and report how many keys were loaded |
//! | `reset` | Put every item with a status back to queued |
//! | `cleanup-duplicates` | Keep only the newest work item per key |
//! | `fix-status` | Mark failed items completed when a result already exists |
//! | `providers` | Configured providers and their limiter state |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--db` | `$CADASTRO_DB_PATH` or `~/.cadastro/cadastro.duckdb` | Store database file |
//! | `--offline` | `false` | Serve deterministic fixtures instead of calling providers |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! # Queue two keys and process them before exiting
//! cadastro enqueue 11.222.333/0001-81 11444777000161 --wait
//!
//! # Queue every key in a spreadsheet export
//! cadastro enqueue --file empresas.csv
//!
//! # Process whatever is pending, then exit
//! cadastro run --until-idle
//!
//! # Retry everything that ran out of provider quota
//! cadastro reset rate_limited --wait
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Company registry lookups over rate-limited public providers.
///
/// Keys are persisted before they are processed, so work survives restarts: anything
/// left queued is picked up by the next `run`.
#[derive(Debug, Parser)]
#[command(
    name = "cadastro",
    author,
    version,
    about = "Company registry lookups over rate-limited public providers",
    long_about = "cadastro resolves 14-digit company registry keys against ReceitaWS, CNPJ.ws \
and CNPJa, pacing requests under each provider's quota and failing over between them.\n\
\n\
Provider settings and queue limits are read from CADASTRO_* environment variables.\n\
Logs are written to stderr (filter with RUST_LOG); results are JSON on stdout.\n\
\n\
Use 'cadastro <command> --help' for command-specific help."
)]
pub struct Cli {
    /// Store database file.
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Use offline fixtures instead of calling the providers.
    #[arg(long, global = true, default_value_t = false)]
    pub offline: bool,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Queue registry keys for resolution.
    Enqueue(EnqueueArgs),
    /// Process pending work from the store.
    Run(RunArgs),
    /// Show counts per status, recent items and provider state.
    Status,
    /// Show the latest status of a set of keys.
    Batch(BatchArgs),
    /// Show the status and stored result of one key.
    Show(ShowArgs),
    /// Requeue interrupted and due work from the store.
    Restart(WaitArgs),
    /// Put every work item with the given status back to queued.
    Reset(ResetArgs),
    /// Remove all but the most recently updated work item of each key.
    CleanupDuplicates,
    /// Mark error and rate_limited items completed when their key has a result.
    FixStatus(FixStatusArgs),
    /// List configured providers and their limiter state.
    Providers,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Registry keys, formatted or plain digits.
    #[arg(value_name = "KEY")]
    pub keys: Vec<String>,

    /// Read keys from a CSV or plain-text file.
    ///
    /// The column whose header mentions "cnpj" is used, otherwise the first column.
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    #[command(flatten)]
    pub wait: WaitArgs,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Exit once nothing is pending instead of waiting for Ctrl-C.
    #[arg(long, default_value_t = false)]
    pub until_idle: bool,
}

#[derive(Debug, Args)]
pub struct WaitArgs {
    /// Keep processing until the queue is idle before exiting.
    #[arg(long, default_value_t = false)]
    pub wait: bool,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 3600, value_name = "SECS")]
    pub wait_timeout: u64,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    #[arg(value_name = "KEY", required = true)]
    pub keys: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(value_name = "KEY")]
    pub key: String,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// One of processing, error, rate_limited.
    #[arg(value_name = "STATUS")]
    pub status: String,

    #[command(flatten)]
    pub wait: WaitArgs,
}

#[derive(Debug, Args)]
pub struct FixStatusArgs {
    /// Report what would change without writing.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}
