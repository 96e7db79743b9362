mod config;
mod dispatch;
mod nodes;
mod pipeline;
mod results;
mod scripts;
mod workspace;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod results_test;

use crate::{
    config::{ConfigErrors, FepConfig},
    nodes::{NodeError, NodePool},
    pipeline::{Pipeline, PipelineError},
};
use clap::{crate_name, crate_version, Parser, Subcommand, ValueEnum};
use std::{path::PathBuf, process::exit};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct CLI {
    /// Path to the run configuration (block INI)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
enum Commands {
    /// Lay out the run workspace: parameters, lambda directories, patched keys
    Setup,
    /// Run every dynamic phase over the lambda ladder
    Dynamic {
        /// Both modes honor existing per-repetition logs; delete a log to
        /// force a rerun
        #[arg(value_enum)]
        mode: DynamicMode,
        /// Maximum nodes to occupy, or -1 to match the number of lambda points
        #[arg(allow_negative_numbers = true)]
        max_nodes: i64,
    },
    /// Pair adjacent lambda directories, run both BAR stages and aggregate
    Bar {
        /// Maximum nodes to occupy, or -1 to match the number of pairs
        #[arg(allow_negative_numbers = true)]
        max_nodes: i64,
    },
    /// Setup, dynamic and bar in sequence
    Auto {
        /// Maximum nodes to occupy, or -1 to auto-size per stage
        #[arg(allow_negative_numbers = true)]
        max_nodes: i64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DynamicMode {
    New,
    All,
}

#[derive(Error, Debug)]
enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Nodes(#[from] NodeError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("max nodes must be a positive integer or -1, got {0}")]
    BadMaxNodes(i64),
}

fn setup_global_subscriber() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .with(
            fmt::layer()
                // task threads are per-node, so thread ids tell them apart
                .with_thread_ids(true)
                .with_thread_names(false)
                .compact(),
        )
        .init();
}

fn main() {
    let args = CLI::parse();
    setup_global_subscriber();

    info!("{} {}", crate_name!(), crate_version!());
    debug!("Args: {args:?}");

    if let Err(error) = run(args) {
        error!(error = ?error, "fatal: {error}");
        exit(1);
    }
}

fn run(args: CLI) -> Result<(), FatalError> {
    let cfg = FepConfig::load(&args.config)?;
    debug!("Config: {cfg:?}");

    let pool = NodePool::load(&cfg.general.node_file, cfg.general.node_preference)?;
    let mut pipeline = Pipeline::new(&cfg, pool);

    match args.command {
        Commands::Setup => pipeline.setup()?,
        Commands::Dynamic { mode, max_nodes } => {
            debug!(?mode, "dynamic modes share the log-based skip predicate");
            pipeline.dynamic(resolve_max_nodes(max_nodes)?)?;
        }
        Commands::Bar { max_nodes } => pipeline.bar(resolve_max_nodes(max_nodes)?)?,
        Commands::Auto { max_nodes } => pipeline.auto(resolve_max_nodes(max_nodes)?)?,
    }

    info!("finished");
    Ok(())
}

/// `-1` asks each stage to size its batch to its own task count.
fn resolve_max_nodes(raw: i64) -> Result<Option<usize>, FatalError> {
    match raw {
        -1 => Ok(None),
        n if n >= 1 => Ok(Some(n as usize)),
        n => Err(FatalError::BadMaxNodes(n)),
    }
}
