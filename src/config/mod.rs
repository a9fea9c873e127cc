pub mod cli;
pub mod toml_config;

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "refnet")]
#[command(about = "Referral graph and role progression engine")]
pub struct CliConfig {
    /// Path to the TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    pub config: Option<String>,

    /// JSON snapshot holding the store between runs
    #[arg(long, default_value = "refnet-store.json")]
    pub store: String,

    /// Member id used for admin jobs
    #[arg(long, default_value = "admin")]
    pub actor: String,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create the admin root and its code
    Bootstrap,
    /// Register a member, optionally under a referral code
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        device: Option<String>,
    },
    /// Confirm a membership payment and bind the member
    Pay {
        #[arg(long)]
        id: String,
    },
    /// Bind a member, directly under `code` when given
    Bind {
        #[arg(long)]
        id: String,
        #[arg(long)]
        code: Option<String>,
    },
    /// Issue a referral code if the member has none
    EnsureCode {
        #[arg(long)]
        id: String,
    },
    Promote {
        #[arg(long)]
        id: String,
    },
    Stats {
        #[arg(long)]
        id: String,
        #[arg(long)]
        force: bool,
    },
    Progress {
        #[arg(long)]
        id: String,
    },
    /// Print the stored member document
    Show {
        #[arg(long)]
        id: String,
    },
    MigrateOrphans,
    RecomputeStats,
    MigrateLegacy,
    VerifyChains,
    /// Deliver pending notifications and analytics events
    DrainOutbox,
}
