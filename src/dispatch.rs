use crate::{
    config::{BarConfig, DynamicPhase, GeneralConfig},
    nodes::{Node, NodePool, ProbeScript},
    scripts::{self, ScriptError},
    workspace,
};
use std::{
    path::{Path, PathBuf},
    process::Command,
    thread,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no free nodes are available")]
    NoFreeNodes,
    #[error(transparent)]
    Node(#[from] crate::nodes::NodeError),
}

/// One unit of remote work, pinned to a node at dispatch time.
#[derive(Debug)]
pub enum Task<'a> {
    Dynamic {
        dir: PathBuf,
        xyz: PathBuf,
        key: PathBuf,
        phase: &'a DynamicPhase,
        rep: u32,
    },
    Bar1 {
        dir: PathBuf,
        arc1: PathBuf,
        arc2: PathBuf,
        bar: &'a BarConfig,
    },
    Bar2 {
        dir: PathBuf,
        bar_file: PathBuf,
        frames: u64,
        bar: &'a BarConfig,
    },
}

impl Task<'_> {
    fn dir(&self) -> &Path {
        match self {
            Self::Dynamic { dir, .. } | Self::Bar1 { dir, .. } | Self::Bar2 { dir, .. } => dir,
        }
    }

    /// Basename stem of this task's artifacts (`<stem>.sh/.log/.err`).
    fn stem(&self) -> String {
        match self {
            Self::Dynamic { phase, rep, .. } => format!("{}_{}", phase.name, rep),
            Self::Bar1 { .. } => "bar1".into(),
            Self::Bar2 { .. } => "bar2".into(),
        }
    }

    fn err_path(&self) -> PathBuf {
        self.dir().join(format!("{}.err", self.stem()))
    }

    fn label(&self) -> String {
        format!("{} in {}", self.stem(), self.dir().display())
    }

    fn write_script(&self, node: &Node, general: &GeneralConfig) -> Result<PathBuf, ScriptError> {
        match self {
            Self::Dynamic {
                dir,
                xyz,
                key,
                phase,
                rep,
            } => scripts::write_dynamic(dir, xyz, key, phase, *rep, node, general),
            Self::Bar1 {
                dir, arc1, arc2, bar,
            } => scripts::write_bar1(dir, arc1, arc2, bar, node, general),
            Self::Bar2 {
                dir,
                bar_file,
                frames,
                bar,
            } => scripts::write_bar2(dir, bar_file, *frames, bar, node, general),
        }
    }
}

/// Map task index -> index into the free-node list. The effective width is
/// `min(free, max_nodes)`, so preference order decides which nodes work.
pub fn assignment_plan(num_tasks: usize, num_free: usize, max_nodes: usize) -> Vec<usize> {
    let width = num_free.min(max_nodes).max(1);
    (0..num_tasks).map(|index| index % width).collect()
}

/// Probe the pool, pin each task to a free node and run them all to
/// completion. Individual task failures land in `.err` files and do not
/// abort the batch; returning at all means every task has finished.
pub fn dispatch(
    pool: &mut NodePool,
    general: &GeneralConfig,
    temp_dir: &Path,
    tasks: Vec<Task<'_>>,
    max_nodes: usize,
) -> Result<(), DispatchError> {
    if tasks.is_empty() {
        return Ok(());
    }

    info!(nodes = pool.nodes.len(), wanted = max_nodes, "probing node availability");
    let probe = ProbeScript::write(temp_dir)?;
    pool.refresh(&probe);

    let free = pool.free_indices();
    if free.is_empty() {
        return Err(DispatchError::NoFreeNodes);
    }
    info!(free = free.len(), tasks = tasks.len(), "dispatching batch");

    let plan = assignment_plan(tasks.len(), free.len(), max_nodes);

    thread::scope(|scope| {
        for (task, slot) in tasks.iter().zip(&plan) {
            let node = &pool.nodes[free[*slot]];
            scope.spawn(move || run_task(task, node, general));
        }
    });

    Ok(())
}

fn run_task(task: &Task<'_>, node: &Node, general: &GeneralConfig) {
    let script = match task.write_script(node, general) {
        Ok(script) => script,
        Err(error) => {
            record_failure(task, node, &error.to_string());
            return;
        }
    };

    info!(task = %task.label(), node = %node.name, "task started");

    match Command::new("sh").arg(&script).output() {
        Ok(output) if output.status.success() => {
            info!(task = %task.label(), node = %node.name, "task finished");
        }
        Ok(output) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            record_failure(task, node, &combined);
        }
        Err(error) => {
            record_failure(
                task,
                node,
                &format!("failed to run {}: {error}", script.display()),
            );
        }
    }
}

fn record_failure(task: &Task<'_>, node: &Node, details: &str) {
    let err_path = task.err_path();
    warn!(
        task = %task.label(),
        node = %node.name,
        err = %err_path.display(),
        "task failed, continuing with the rest of the batch"
    );

    if let Err(error) = workspace::write_broad(&err_path, details) {
        warn!(path = %err_path.display(), %error, "could not persist task failure output");
    }
}
