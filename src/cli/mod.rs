//! Command-line interface definitions for the `replica-controller` binary.
//!
//! The build script includes this module to render the manual page, so it
//! must only depend on clap.

use clap::Parser;

/// Top-level CLI for the `replica-controller` binary.
#[derive(Debug, Parser)]
#[command(
    name = "replica-controller",
    about = "Reconcile replica volume attachments against a cluster snapshot",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Reconcile every attachment in a snapshot and print the result.
    #[command(
        name = "replay",
        about = "Reconcile attachments in a snapshot and print the resulting state"
    )]
    Replay(ReplayCommand),
    /// Load and validate configuration, then print the effective values.
    #[command(name = "check-config", about = "Validate configuration and print it")]
    CheckConfig,
}

/// Arguments for the `replica-controller replay` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ReplayCommand {
    /// JSON snapshot holding volumes, nodes, pods, attachments, and capacity.
    #[arg(value_name = "SNAPSHOT")]
    pub(crate) snapshot: String,
    /// Reconcile only these attachments (`namespace/name` or `name`).
    ///
    /// Bare names resolve to the `azure-disk-csi` namespace. Every
    /// attachment in the snapshot is reconciled when omitted.
    #[arg(long = "key", value_name = "KEY")]
    pub(crate) keys: Vec<String>,
    /// Reconcile attempts per attachment before giving up.
    #[arg(long, value_name = "COUNT", default_value_t = 5)]
    pub(crate) max_attempts: u32,
    /// Seconds to wait after reconciling so pending cleanup can fire.
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub(crate) settle_secs: u64,
    /// Write the resulting snapshot here instead of standard output.
    #[arg(long, value_name = "PATH")]
    pub(crate) output: Option<String>,
}
