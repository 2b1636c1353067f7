//! CLI surface (§1 out of scope: human-facing presentation; this module is
//! the thin clap wiring a real binary needs, not the presentation layer
//! itself). Grounded on the teacher's `Cli`/`Command` shape — a global
//! `--config`/`--verbose` pair plus a subcommand enum.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "devloop", about = "Autonomous development-workflow orchestrator", version)]
pub struct Cli {
    /// Path to a config file, overriding the `.devloop.yml` discovery chain.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug-level logging (equivalent to `DEBUG=true`).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the iteration loop against a single task store until complete,
    /// blocked, or stalled.
    Run {
        /// Project root the agent and test runner operate in.
        #[arg(long, default_value = ".")]
        working_dir: PathBuf,

        /// Restrict task selection to one PRD set.
        #[arg(long)]
        prd_set: Option<String>,
    },

    /// Run a PRD set end-to-end through the dependency-ordered orchestrator.
    RunSet {
        /// Directory containing the set's PRD markdown documents.
        prd_dir: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::parse_from(["devloop", "run"]);
        assert!(matches!(cli.command, Command::Run { prd_set: None, .. }));
    }

    #[test]
    fn parses_run_with_prd_set_filter() {
        let cli = Cli::parse_from(["devloop", "run", "--prd-set", "checkout"]);
        match cli.command {
            Command::Run { prd_set, .. } => assert_eq!(prd_set.as_deref(), Some("checkout")),
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn parses_run_set() {
        let cli = Cli::parse_from(["devloop", "run-set", "prds/checkout"]);
        match cli.command {
            Command::RunSet { prd_dir } => assert_eq!(prd_dir, PathBuf::from("prds/checkout")),
            other => panic!("expected RunSet, got {other:?}"),
        }
    }

    #[test]
    fn global_config_flag_is_accepted_before_the_subcommand() {
        let cli = Cli::parse_from(["devloop", "-c", "custom.yml", "run"]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.yml")));
    }
}
