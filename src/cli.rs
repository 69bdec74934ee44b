//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use mirror_core::StorageMode;

/// Ingest, proxy and reconcile remote files into a managed library.
///
/// Mirror imports files over file://, ftp://, sftp:// and http(s):// into a
/// local library, serves referenced files through a local cache and keeps
/// source groups in sync with their remote collections.
#[derive(Parser, Debug)]
#[command(name = "mirror")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Data directory (database, library, cache); falls back to `MIRROR_DATA_DIR`
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file path (defaults to the XDG config location)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Execution ceiling per import batch in seconds (0 disables)
    #[arg(long, global = true)]
    pub max_execution_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import a file or directory URL
    Import(ImportArgs),

    /// Reconcile a source group with its remote collection
    Sync {
        /// Source group id
        group_id: i64,
    },

    /// Manage source groups
    #[command(subcommand)]
    Groups(GroupsCommand),

    /// Write a resource's bytes through the proxy cache
    Resolve {
        /// Display name as used in the byte-serving address
        name: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Probe every referenced resource and record its availability
    CheckAvailability,

    /// Finish batches handed off by the execution budget
    ResumeDeferred {
        /// Stop after this many batches
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=1000))]
        limit: u32,
    },

    /// Remove every cached copy
    PurgeCache,

    /// Delete a resource, its library file and its cache entry
    Delete {
        /// Resource id
        id: i64,
    },

    /// Move a resource between embedded and referenced storage
    Hosting {
        /// Resource id
        id: i64,

        /// Target storage mode
        #[arg(value_enum)]
        mode: HostingMode,
    },
}

#[derive(ClapArgs, Debug)]
pub struct ImportArgs {
    /// URL of a file or directory
    pub url: String,

    /// Login for authenticated sources
    #[arg(long, requires = "password")]
    pub login: Option<String>,

    /// Secret for authenticated sources
    #[arg(long, requires = "login")]
    pub password: Option<String>,

    /// Follow listing continuations until exhausted
    #[arg(long)]
    pub all_pages: bool,

    /// Report existing URLs as skipped instead of refreshing them
    #[arg(long)]
    pub skip_existing: bool,
}

#[derive(Subcommand, Debug)]
pub enum GroupsCommand {
    /// Register a source group
    Add {
        /// Group name
        name: String,

        /// Collection URL
        url: String,

        /// Delete records no longer present upstream after each pass
        #[arg(long)]
        delete_unused: bool,

        /// Scheduling interval in seconds
        #[arg(long, default_value_t = 86_400)]
        interval_secs: i64,

        /// Login for authenticated sources
        #[arg(long, requires = "password")]
        login: Option<String>,

        /// Secret for authenticated sources
        #[arg(long, requires = "login")]
        password: Option<String>,
    },

    /// List source groups
    List {
        /// Only groups whose interval has elapsed
        #[arg(long)]
        due: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostingMode {
    Embedded,
    Referenced,
}

impl From<HostingMode> for StorageMode {
    fn from(mode: HostingMode) -> Self {
        match mode {
            HostingMode::Embedded => Self::Embedded,
            HostingMode::Referenced => Self::Referenced,
        }
    }
}
