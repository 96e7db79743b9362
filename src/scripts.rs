use crate::{
    config::{BarConfig, DynamicPhase, GeneralConfig, Toolchain},
    nodes::Node,
    workspace,
};
use cowstr::CowStr;
use std::{
    fmt::Write as _,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const DYNAMIC_BIN: &str = "dynamic_omm.x";
pub const BAR_BIN: &str = "bar_omm.x";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error(
        "node {node} has unrecognized GPU generation {generation:?}; \
         add a matching `toolchain` line to the general block"
    )]
    UnknownGeneration { node: CowStr, generation: CowStr },
    #[error("failed to write task script {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Shell header plus the remote here-document: everything after it runs on
/// the node, with the toolchain sourced and the task pinned to its card.
fn remote_preamble(script: &mut String, node: &Node, toolchain: &Toolchain) {
    script.push_str("#!/bin/bash\n");
    let _ = writeln!(
        script,
        "ssh -o \"StrictHostKeyChecking no\" {} << END",
        node.name
    );
    let _ = writeln!(script, "\tsource {}", toolchain.env_script.display());
    let _ = writeln!(script, "\texport CUDA_VISIBLE_DEVICES={}", node.card_number);
}

fn toolchain_for<'a>(
    general: &'a GeneralConfig,
    node: &Node,
) -> Result<&'a Toolchain, ScriptError> {
    general
        .toolchains
        .get(&node.card_generation)
        .ok_or_else(|| ScriptError::UnknownGeneration {
            node: node.name.clone(),
            generation: node.card_generation.clone(),
        })
}

fn emit(script_path: &Path, script: String) -> Result<(), ScriptError> {
    workspace::write_broad(script_path, &script).map_err(|source| ScriptError::Io {
        path: script_path.to_path_buf(),
        source,
    })
}

/// Script running one dynamics repetition in a lambda directory.
pub fn write_dynamic(
    dir: &Path,
    xyz: &Path,
    key: &Path,
    phase: &DynamicPhase,
    rep: u32,
    node: &Node,
    general: &GeneralConfig,
) -> Result<PathBuf, ScriptError> {
    let toolchain = toolchain_for(general, node)?;
    let script_path = dir.join(format!("{}_{}.sh", phase.name, rep));
    let log_path = dir.join(workspace::dynamic_log_name(&phase.name, rep));

    let mut script = String::new();
    remote_preamble(&mut script, node, toolchain);

    let mut command = format!(
        "{} {} -k {} {} {} {} {}",
        toolchain.home.join(DYNAMIC_BIN).display(),
        xyz.display(),
        key.display(),
        phase.num_steps(),
        phase.step_interval,
        phase.save_interval,
        phase.ensemble.code(),
    );
    let extra = phase.ensemble.extra_args();
    if !extra.is_empty() {
        command.push(' ');
        command.push_str(&extra);
    }
    let _ = writeln!(script, "\t{command} N > {}", log_path.display());
    script.push_str("END\n");

    emit(&script_path, script)?;
    Ok(script_path)
}

/// Script running BAR stage one over the two trajectories of a pair.
pub fn write_bar1(
    pair_dir: &Path,
    arc1: &Path,
    arc2: &Path,
    bar: &BarConfig,
    node: &Node,
    general: &GeneralConfig,
) -> Result<PathBuf, ScriptError> {
    let toolchain = toolchain_for(general, node)?;
    let script_path = pair_dir.join("bar1.sh");
    let log_path = pair_dir.join("bar1.log");

    let mut script = String::new();
    remote_preamble(&mut script, node, toolchain);
    let _ = writeln!(
        script,
        "\t{} 1 {} {} {} {} > {}",
        toolchain.home.join(BAR_BIN).display(),
        arc1.display(),
        bar.temp,
        arc2.display(),
        bar.temp,
        log_path.display()
    );
    script.push_str("END\n");

    emit(&script_path, script)?;
    Ok(script_path)
}

/// Script running BAR stage two over the `.bar` file collected in a pair
/// directory; `frames` comes from the file's first line.
pub fn write_bar2(
    pair_dir: &Path,
    bar_file: &Path,
    frames: u64,
    bar: &BarConfig,
    node: &Node,
    general: &GeneralConfig,
) -> Result<PathBuf, ScriptError> {
    let toolchain = toolchain_for(general, node)?;
    let script_path = pair_dir.join("bar2.sh");
    let log_path = pair_dir.join("bar2.log");

    let mut script = String::new();
    remote_preamble(&mut script, node, toolchain);
    let _ = writeln!(
        script,
        "\t{} 2 {} 1 {frames} {} 1 {frames} {} > {}",
        toolchain.home.join(BAR_BIN).display(),
        bar_file.display(),
        bar.frame_interval,
        bar.frame_interval,
        log_path.display()
    );
    script.push_str("END\n");

    emit(&script_path, script)?;
    Ok(script_path)
}
