//! Argument surface for the `cleave` runner.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cleave_core::{CleaveError, Result, RunMode, ServicesConfig};

/// Usage reminder printed after fatal configuration errors.
pub(crate) const USAGE: &str = "\
Usage:
  cleave [--config <path>] [--debug] run service <name>...
  cleave [--config <path>] [--debug] run [<entry-point>]";

#[derive(Parser, Debug)]
#[command(name = "cleave")]
#[command(about = "Run an application's services together or cleaved apart")]
pub struct Cli {
    /// Path to the services configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start services or an application entry point
    Run {
        #[command(subcommand)]
        target: Option<RunTarget>,
    },
}

#[derive(Subcommand, Debug)]
pub enum RunTarget {
    /// Host the named services in this process
    Service {
        /// Configured service names to activate
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// A registered entry point name
    #[command(external_subcommand)]
    Entry(Vec<String>),
}

/// What a parsed command line asks the runner to do.
#[derive(Debug)]
pub(crate) struct LaunchPlan {
    /// Partitioning mode the controller is built with.
    pub mode: RunMode,
    pub target: PlanTarget,
}

#[derive(Debug, PartialEq)]
pub(crate) enum PlanTarget {
    /// Launch the active services and serve until stopped.
    Services,
    /// Drive the named entry callback as the application task.
    Entry(String),
}

/// Decide what to launch from the parsed target, the configuration's
/// declared default, and the ambient selector list.
pub(crate) fn resolve_target(
    target: Option<RunTarget>,
    config: &ServicesConfig,
    ambient: RunMode,
) -> Result<LaunchPlan> {
    match target {
        Some(RunTarget::Service { names }) => Ok(LaunchPlan {
            mode: RunMode::Distributed { active: names },
            target: PlanTarget::Services,
        }),
        Some(RunTarget::Entry(words)) => match words.split_first() {
            Some((name, [])) => Ok(LaunchPlan {
                mode: ambient,
                target: PlanTarget::Entry(name.clone()),
            }),
            Some((name, extra)) => Err(CleaveError::config(format!(
                "unexpected arguments after entry point {name:?}: {extra:?}"
            ))),
            None => Err(CleaveError::config("missing entry point name")),
        },
        None => {
            if let RunMode::Distributed { active } = &ambient {
                if !active.is_empty() {
                    return Ok(LaunchPlan {
                        mode: ambient,
                        target: PlanTarget::Services,
                    });
                }
            }
            match &config.entry_point {
                Some(name) => Ok(LaunchPlan {
                    mode: ambient,
                    target: PlanTarget::Entry(name.clone()),
                }),
                None => Err(CleaveError::config(
                    "nothing to run: name a target or declare entry_point in the configuration",
                )),
            }
        }
    }
}
