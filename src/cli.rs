//! CLI struct definitions for the `delegation-engine` operator binary.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use crate::core::store::DEFAULT_STORE_DIR;
use crate::engine::model::{DelegationMode, TargetKind};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "delegation-engine",
    version = env!("CARGO_PKG_VERSION"),
    about = "Resolve who casts effective voting power: delegation chains, direct-vote override, cycle rejection and concentration monitoring."
)]
pub struct Cli {
    /// Store directory holding delegation.db and delegation.toml.
    #[clap(long, global = true, default_value = DEFAULT_STORE_DIR)]
    pub root: PathBuf,
    /// Emit logs as JSON lines on stderr.
    #[clap(long, global = true)]
    pub log_json: bool,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the store directory and database.
    Init,

    /// Manage delegation targets (users, values, ideas, institutions, fields).
    Target(TargetCli),

    /// Create and revoke delegation edges.
    Edge(EdgeCli),

    /// Cast direct votes.
    Vote(VoteCli),

    /// Announce edges whose end date has passed since the last sweep.
    Sweep,

    /// Resolve a delegator's chain, globally or for one poll.
    Resolve {
        delegator: String,
        #[clap(long)]
        poll: Option<String>,
        /// Mask identities behind anonymous edges.
        #[clap(long)]
        public: bool,
    },

    /// Resolve many delegators against one poll in a single batch.
    Tally {
        #[clap(long)]
        poll: String,
        #[clap(required = true)]
        delegators: Vec<String>,
    },

    /// Concentration shares and active edge count.
    Stats {
        #[clap(long)]
        poll: Option<String>,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Latency percentiles and breaches for this process.
    Slo,
}

#[derive(clap::Args, Debug)]
pub struct TargetCli {
    #[clap(subcommand)]
    pub command: TargetCommand,
}

#[derive(Subcommand, Debug)]
pub enum TargetCommand {
    /// Register (or re-activate) a target.
    Add {
        #[clap(value_enum)]
        kind: TargetKind,
        id: String,
        /// Display name; defaults to the id.
        #[clap(long)]
        name: Option<String>,
    },
    /// Flag a target inactive; chains ending there resolve as dangling.
    Deactivate {
        #[clap(value_enum)]
        kind: TargetKind,
        id: String,
    },
    /// Show a target's stored metadata.
    Show {
        #[clap(value_enum)]
        kind: TargetKind,
        id: String,
    },
}

#[derive(clap::Args, Debug)]
pub struct EdgeCli {
    #[clap(subcommand)]
    pub command: EdgeCommand,
}

#[derive(Subcommand, Debug)]
pub enum EdgeCommand {
    /// Delegate from a user to a target.
    Add {
        delegator: String,
        target: String,
        #[clap(long, value_enum, default_value = "user")]
        kind: TargetKind,
        /// Restrict the delegation to one poll; global when omitted.
        #[clap(long)]
        poll: Option<String>,
        #[clap(long, value_enum, default_value = "flexible-domain")]
        mode: DelegationMode,
        #[clap(long)]
        anonymous: bool,
        /// RFC 3339 start; defaults to now.
        #[clap(long)]
        start: Option<DateTime<Utc>>,
        /// RFC 3339 end; open-ended when omitted.
        #[clap(long)]
        end: Option<DateTime<Utc>>,
    },
    /// Revoke an edge by id.
    Revoke { edge_id: String },
    /// Active edges a delegator holds that apply to a poll (global only when omitted).
    List {
        delegator: String,
        #[clap(long)]
        poll: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub struct VoteCli {
    #[clap(subcommand)]
    pub command: VoteCommand,
}

#[derive(Subcommand, Debug)]
pub enum VoteCommand {
    /// Record a direct vote; it overrides every delegation of that user for the poll.
    Cast { user: String, poll: String },
}
