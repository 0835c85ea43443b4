use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "reshelve")]
#[command(about = "Deterministic, reversible file organization", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Args)]
pub struct RootArgs {
    /// Organize root; defaults to the first configured root path
    #[arg(long)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub root: RootArgs,
    /// JSON file of advisory decisions: [{path, category, confidence, rename_to?}]
    #[arg(long)]
    pub decisions: Option<PathBuf>,
    /// Send duplicates to the graveyard instead of the duplicates folder
    #[arg(long)]
    pub delete_duplicates: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan and print the chunked plan without changing anything
    Plan {
        #[command(flatten)]
        args: PlanArgs,
        /// Print the full plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Scan, plan and apply every chunk that needs no approval
    Run {
        #[command(flatten)]
        args: PlanArgs,
        /// Report what would happen without touching files or the journal
        #[arg(long)]
        dry_run: bool,
        /// Approval token (`<chunk id>:<digest>`) for a gated chunk
        #[arg(long = "approve", value_name = "TOKEN")]
        approvals: Vec<String>,
    },
    /// Apply only the gated chunks named by the given tokens
    Approve {
        #[command(flatten)]
        args: PlanArgs,
        #[arg(required = true, value_name = "TOKEN")]
        tokens: Vec<String>,
    },
    /// Revert journal entries in reverse order (defaults to the last run)
    Undo {
        #[command(flatten)]
        root: RootArgs,
        /// Revert everything a specific run committed
        #[arg(long, conflicts_with_all = ["from", "to"])]
        run: Option<String>,
        /// First journal sequence number to revert
        #[arg(long, requires = "to")]
        from: Option<u64>,
        /// Last journal sequence number to revert
        #[arg(long, requires = "from")]
        to: Option<u64>,
    },
    /// Print a stored run report (defaults to the latest run)
    Report {
        #[command(flatten)]
        root: RootArgs,
        run_id: Option<String>,
        /// List recorded runs instead
        #[arg(long)]
        list: bool,
    },
    /// Resolve journal intents left by an interrupted run
    Recover {
        #[command(flatten)]
        root: RootArgs,
    },
    /// Extract tar / tar.gz archives into the root with provenance
    Extract {
        #[command(flatten)]
        root: RootArgs,
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },
    /// Drop journal history below a sequence number and empty the graveyard for it
    Purge {
        #[command(flatten)]
        root: RootArgs,
        #[arg(long)]
        before: u64,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Print configuration values
    PrintConfig,
}
