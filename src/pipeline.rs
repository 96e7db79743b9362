mod bar;
mod dynamic;

use crate::{
    config::FepConfig,
    dispatch::DispatchError,
    nodes::NodePool,
    results::{self, ResultsError},
    workspace::{Workspace, WorkspaceError},
};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Results(#[from] ResultsError),
}

/// Drives the phase state machine over one run workspace. Phases are strictly
/// sequential; each stage dispatches its whole batch and joins it before the
/// next stage starts.
pub struct Pipeline<'a> {
    cfg: &'a FepConfig,
    workspace: Workspace,
    pool: NodePool,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a FepConfig, pool: NodePool) -> Self {
        Self {
            cfg,
            workspace: Workspace::new(&cfg.general.target_dir),
            pool,
        }
    }

    pub fn setup(&self) -> Result<(), PipelineError> {
        info!(target = %self.workspace.root().display(), "beginning setup");
        self.workspace.setup(self.cfg)?;
        Ok(())
    }

    /// All dynamic phases in `order`, each repetition filtered by the
    /// per-log resume predicate. `max_nodes` of `None` sizes the batch to
    /// the number of ladder points.
    pub fn dynamic(&mut self, max_nodes: Option<usize>) -> Result<(), PipelineError> {
        let width = max_nodes.unwrap_or(self.cfg.ladder.len());
        dynamic::run(self, width)
    }

    /// BAR setup, both BAR stages, then aggregation. `max_nodes` of `None`
    /// sizes the batch to the number of adjacent pairs.
    pub fn bar(&mut self, max_nodes: Option<usize>) -> Result<(), PipelineError> {
        let width = max_nodes.unwrap_or(self.cfg.ladder.len().saturating_sub(1));
        bar::run(self, width)?;
        results::aggregate(&self.workspace)?;
        Ok(())
    }

    pub fn auto(&mut self, max_nodes: Option<usize>) -> Result<(), PipelineError> {
        self.setup()?;
        self.dynamic(max_nodes)?;
        self.bar(max_nodes)
    }
}
