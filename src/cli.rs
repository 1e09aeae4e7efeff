// src/cli.rs
//! Command-line interface definitions for the `flowgate` control binary

use clap::{Parser, Subcommand, ValueEnum};
use flowgate::{CommandOutcome, FlowId, PendingFlow};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Control surface for intercepted HTTP exchanges.
///
/// Talks to a running capture proxy through the shared flow store.
#[derive(Parser, Debug)]
#[command(name = "flowgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the configuration file (default: ./flowgate.toml)
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Flow store to use instead of the configured one
    #[arg(long = "store", value_name = "PATH", global = true)]
    pub store: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show or change intercept mode
    Intercept {
        /// New mode; omit to print the current one
        #[arg(value_enum)]
        state: Option<Toggle>,
    },

    /// List exchanges waiting for a decision, oldest first
    Pending {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Let a pending exchange continue to its origin
    Forward {
        flow_id: String,

        /// Replace the request with the contents of FILE ("-" reads stdin)
        #[arg(long, value_name = "FILE")]
        edited: Option<PathBuf>,
    },

    /// Answer a pending exchange with a synthesized failure
    Drop { flow_id: String },

    /// Print the full record of a flow as JSON
    Show { flow_id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        self == Toggle::On
    }
}

/// Table of pending flows
pub fn render_pending(pending: &[PendingFlow]) -> String {
    if pending.is_empty() {
        return "No pending flows\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<26}  {:<12}  {:<7}  {:<24}  PATH", "FLOW", "CAPTURED", "METHOD", "HOST");
    for flow in pending {
        let _ = write!(
            out,
            "{:<26}  {:<12}  {:<7}  {:<24}  {}",
            flow.flow_id,
            flow.captured_at.format("%H:%M:%S%.3f"),
            flow.method,
            flow.host,
            flow.path
        );
        if let Some(note) = &flow.note {
            let _ = write!(out, "  ({})", note);
        }
        out.push('\n');
    }
    out
}

pub fn describe_outcome(verb: &str, flow_id: &FlowId, outcome: CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Queued => format!("Queued {} for {}", verb, flow_id),
        CommandOutcome::AlreadyQueued => {
            format!("A decision is already queued for {}; nothing changed", flow_id)
        }
        CommandOutcome::AlreadyTerminal => {
            format!("Flow {} was already decided; nothing changed", flow_id)
        }
    }
}
