use super::{Pipeline, PipelineError};
use crate::{
    dispatch::{self, Task},
    workspace::{self, WorkspaceError},
};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{info, warn};

/// Run every dynamic phase in `order`, one dispatched batch per repetition.
pub(super) fn run(p: &mut Pipeline<'_>, width: usize) -> Result<(), PipelineError> {
    let started = Instant::now();
    let cfg = p.cfg;

    for phase in &cfg.phases {
        info!(
            phase = %phase.name,
            repetitions = phase.repetitions,
            "preparing dynamic phase"
        );

        for rep in 0..phase.repetitions {
            let pending = p.workspace.pending_lambda_dirs(&phase.name, rep)?;
            if pending.is_empty() {
                info!(phase = %phase.name, rep, "repetition already complete everywhere, skipping");
                continue;
            }

            let rep_started = Instant::now();
            let mut tasks = Vec::with_capacity(pending.len());
            for dir in pending {
                match dynamic_inputs(&dir) {
                    Ok((xyz, key)) => tasks.push(Task::Dynamic {
                        dir,
                        xyz,
                        key,
                        phase,
                        rep,
                    }),
                    Err(error) => {
                        // a directory the user disturbed; skip it, keep the batch
                        let err_path = dir.join(format!("{}_{}.err", phase.name, rep));
                        warn!(dir = %dir.display(), %error, "lambda directory unusable");
                        if let Err(error) = workspace::write_broad(&err_path, &error.to_string()) {
                            warn!(path = %err_path.display(), %error, "could not persist error");
                        }
                    }
                }
            }

            dispatch::dispatch(&mut p.pool, &cfg.general, &p.workspace.temp_dir(), tasks, width)?;
            info!(
                phase = %phase.name,
                rep,
                elapsed = ?rep_started.elapsed(),
                "repetition joined"
            );
        }
    }

    info!(elapsed = ?started.elapsed(), "all dynamic phases finished");
    Ok(())
}

/// Resolve the one geometry and one key file of a lambda directory, and
/// re-broaden permissions on any trajectory output already present.
fn dynamic_inputs(dir: &Path) -> Result<(PathBuf, PathBuf), WorkspaceError> {
    for ext in ["arc", "dyn"] {
        for artifact in workspace::files_with_extension(dir, ext)? {
            if let Err(error) = workspace::broaden_mode(&artifact) {
                warn!(path = %artifact.display(), %error, "could not broaden artifact permissions");
            }
        }
    }

    let xyz = workspace::unique_file_with_extension(dir, "xyz")?;
    let key = workspace::unique_file_with_extension(dir, "key")?;

    Ok((xyz, key))
}
