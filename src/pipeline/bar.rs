use super::{Pipeline, PipelineError};
use crate::{
    dispatch::{self, Task},
    workspace::{self, Workspace, WorkspaceError},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
enum BarTaskError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("could not read the frame count from {path:?}")]
    FrameCount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("first line of {path:?} does not start with an integer frame count")]
    BadFrameCount { path: PathBuf },
}

/// BAR setup plus both BAR stages. Stage one fully joins (and its artifacts
/// are collected) before stage two is planned.
pub(super) fn run(p: &mut Pipeline<'_>, width: usize) -> Result<(), PipelineError> {
    info!("verifying dynamic output and laying out bar pair directories");
    let pairs = p.workspace.bar_setup()?;
    let cfg = p.cfg;

    // stage one: one task per pair, consuming the two adjacent trajectories
    let stage_started = Instant::now();
    let mut tasks = Vec::with_capacity(pairs.len());
    let mut harvests = Vec::with_capacity(pairs.len());
    for pair in &pairs {
        match bar1_inputs(&p.workspace, pair) {
            Ok((arc1, arc2)) => {
                // the binary drops its output next to the first trajectory
                let produced = arc1.with_extension("bar");
                harvests.push((produced, pair.clone()));
                tasks.push(Task::Bar1 {
                    dir: pair.clone(),
                    arc1,
                    arc2,
                    bar: &cfg.bar,
                });
            }
            Err(error) => record_pair_failure(pair, "bar1", &error.to_string()),
        }
    }
    dispatch::dispatch(&mut p.pool, &cfg.general, &p.workspace.temp_dir(), tasks, width)?;
    collect_bar_files(&harvests);
    info!(elapsed = ?stage_started.elapsed(), "bar stage one joined");

    // stage two: one task per pair, consuming the harvested .bar
    let stage_started = Instant::now();
    let mut tasks = Vec::with_capacity(pairs.len());
    for pair in &pairs {
        match bar2_input(pair) {
            Ok((bar_file, frames)) => tasks.push(Task::Bar2 {
                dir: pair.clone(),
                bar_file,
                frames,
                bar: &cfg.bar,
            }),
            Err(error) => record_pair_failure(pair, "bar2", &error.to_string()),
        }
    }
    dispatch::dispatch(&mut p.pool, &cfg.general, &p.workspace.temp_dir(), tasks, width)?;
    info!(elapsed = ?stage_started.elapsed(), "bar stage two joined");

    Ok(())
}

/// The two `.arc` trajectories behind a pair directory, resolved from the
/// lambda directory names the pair is named after.
fn bar1_inputs(
    workspace: &Workspace,
    pair: &Path,
) -> Result<(PathBuf, PathBuf), WorkspaceError> {
    let name = pair
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (first, second) = name.split_once('_').unwrap_or((name.as_str(), ""));

    let dynamic_dir = workspace.dynamic_dir();
    let arc1 = workspace::unique_file_with_extension(&dynamic_dir.join(first), "arc")?;
    let arc2 = workspace::unique_file_with_extension(&dynamic_dir.join(second), "arc")?;

    Ok((arc1, arc2))
}

/// Move each produced `.bar` into its pair directory, but only when stage
/// one actually produced it; a missing artifact leaves the task's `.err` as
/// the record.
fn collect_bar_files(harvests: &[(PathBuf, PathBuf)]) {
    for (produced, pair) in harvests {
        if !produced.exists() {
            warn!(
                expected = %produced.display(),
                pair = %pair.display(),
                "bar stage one left no output to collect"
            );
            continue;
        }

        let dest = pair.join(produced.file_name().unwrap_or_default());
        if let Err(error) = fs::rename(produced, &dest) {
            warn!(
                from = %produced.display(),
                to = %dest.display(),
                %error,
                "failed to move bar output into its pair directory"
            );
        }
    }
}

fn bar2_input(pair: &Path) -> Result<(PathBuf, u64), BarTaskError> {
    let bar_file = workspace::unique_file_with_extension(pair, "bar")?;

    let text = fs::read_to_string(&bar_file).map_err(|source| BarTaskError::FrameCount {
        path: bar_file.clone(),
        source,
    })?;
    let frames = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| BarTaskError::BadFrameCount {
            path: bar_file.clone(),
        })?;

    Ok((bar_file, frames))
}

fn record_pair_failure(pair: &Path, stage: &str, details: &str) {
    let err_path = pair.join(format!("{stage}.err"));
    warn!(pair = %pair.display(), stage, details, "pair cannot run, skipping it");
    if let Err(error) = workspace::write_broad(&err_path, details) {
        warn!(path = %err_path.display(), %error, "could not persist error");
    }
}
