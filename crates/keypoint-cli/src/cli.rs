//! CLI argument definitions for the `keypoint` tool.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// keypoint -- manage keypoint credentials and test authorization rules.
#[derive(Parser)]
#[command(
    name = "keypoint",
    version,
    about = "keypoint -- credential store and authorization policy tool",
    long_about = "Administer a file-backed keypoint store and evaluate synthetic requests \
                  against an authorization config."
)]
pub struct Cli {
    /// Authorization config (TOML, or JSON by extension).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Keypoint store file; overrides `[store] path` from the config.
    #[arg(long, short, global = true)]
    pub store: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List stored keypoints (secrets are never printed).
    List(ListArgs),

    /// Show one keypoint as JSON.
    Show {
        key_id: String,

        /// Include the secret in the output.
        #[arg(long)]
        reveal_secret: bool,
    },

    /// Create or replace a keypoint.
    Add(AddArgs),

    /// Delete a keypoint.
    Remove { key_id: String },

    /// Delete every expired keypoint.
    Cleanup,

    /// Show the scope hierarchy.
    Scopes {
        /// Print the full inherited closure of these scopes instead.
        #[arg(long)]
        expand: Vec<String>,
    },

    /// Evaluate a synthetic request and print the decision.
    Check(CheckArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Only keypoints holding this scope (directly or by pattern).
    #[arg(long)]
    pub scope: Option<String>,

    /// Only keypoints usable over this protocol.
    #[arg(long)]
    pub protocol: Option<String>,

    /// Only keypoints with this name.
    #[arg(long)]
    pub name: Option<String>,

    /// Only expired keypoints.
    #[arg(long, conflicts_with = "active")]
    pub expired: bool,

    /// Only keypoints that have not expired.
    #[arg(long)]
    pub active: bool,

    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct AddArgs {
    pub key_id: String,

    /// Shared secret; a random one is generated and printed when omitted.
    #[arg(long)]
    pub secret: Option<String>,

    #[arg(long)]
    pub name: Option<String>,

    /// Granted scope (repeatable).
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    /// Allowed protocol (repeatable).
    #[arg(long = "protocol")]
    pub protocols: Vec<String>,

    /// Allowed origin (repeatable).
    #[arg(long = "origin")]
    pub origins: Vec<String>,

    /// Allowed IP, CIDR block or `start-end` range (repeatable).
    #[arg(long = "ip")]
    pub ips: Vec<String>,

    /// Advisory request budget per window.
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Advisory window length in seconds.
    #[arg(long, default_value_t = 60)]
    pub rate_window: u64,

    /// Expire after this many days.
    #[arg(long)]
    pub expires_in_days: Option<i64>,

    /// Named policy to apply to this keypoint.
    #[arg(long)]
    pub policy: Option<String>,

    /// Accept scopes the registry does not define.
    #[arg(long)]
    pub allow_unknown_scopes: bool,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Request method.
    #[arg(long, short = 'X', default_value = "GET")]
    pub method: String,

    /// Request path, optionally with a query string.
    #[arg(long, default_value = "/")]
    pub url: String,

    /// Header as `name: value` or `name=value` (repeatable).
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Remote address.
    #[arg(long, default_value = "127.0.0.1")]
    pub ip: String,

    #[arg(long, default_value = "http")]
    pub protocol: String,

    /// Shorthand for the key id header.
    #[arg(long)]
    pub key_id: Option<String>,

    /// Shorthand for the secret header.
    #[arg(long)]
    pub secret: Option<String>,
}
