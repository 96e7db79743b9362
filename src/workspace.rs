use crate::config::{FepConfig, LambdaLadder};
use itertools::Itertools;
use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

pub const RESULTS_FILE: &str = "results.txt";

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("io failure on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("lambda points {0} and {1} round to the same directory label; adjust the ladder")]
    LabelCollision(usize, usize),
    #[error("dynamic directory {0:?} has no .arc output yet; finish dynamic before running bar")]
    MissingArc(PathBuf),
    #[error("expected exactly one .{ext} file in {dir:?}, found {count}")]
    WantOneFile {
        dir: PathBuf,
        ext: &'static str,
        count: usize,
    },
}

/// The run directory tree. Directory and log-file presence is the pipeline's
/// only persisted state; every query below re-reads the disk.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dynamic_dir(&self) -> PathBuf {
        self.root.join("dynamic")
    }

    pub fn bar_dir(&self) -> PathBuf {
        self.root.join("bar")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn parameters_dir(&self) -> PathBuf {
        self.root.join("parameters")
    }

    pub fn results_path(&self) -> PathBuf {
        self.root.join(RESULTS_FILE)
    }

    /// Lay out the tree for a fresh (or partially set up) run: copy the
    /// force-field file, then give every ladder point a directory with the
    /// geometry and a key patched to its coupling coefficients.
    pub fn setup(&self, cfg: &FepConfig) -> Result<(), WorkspaceError> {
        let labels = lambda_labels(&cfg.ladder)?;

        let parameters_dir = self.parameters_dir();
        ensure_dir(&parameters_dir)?;
        let prm_name = base_name(&cfg.general.prm);
        copy_broad(&cfg.general.prm, &parameters_dir.join(&prm_name))
            .map_err(|source| io_error(&cfg.general.prm, source))?;
        info!(prm = %prm_name, "parameters folder ready");

        let xyz_name = base_name(&cfg.general.xyz);
        let key_name = base_name(&cfg.general.key);
        let key_text = fs::read_to_string(&cfg.general.key)
            .map_err(|source| io_error(&cfg.general.key, source))?;

        for (index, label) in labels.iter().enumerate() {
            let dir = self.dynamic_dir().join(label);
            ensure_dir(&dir)?;

            let xyz_dest = dir.join(&xyz_name);
            copy_broad(&cfg.general.xyz, &xyz_dest).map_err(|source| io_error(&xyz_dest, source))?;

            let patched = patch_key(
                &key_text,
                cfg.ladder.vdw[index],
                cfg.ladder.ele[index],
                cfg.ladder.restraint(index),
                &prm_name,
            );
            let key_dest = dir.join(&key_name);
            write_broad(&key_dest, &patched).map_err(|source| io_error(&key_dest, source))?;

            debug!(dir = %dir.display(), "lambda directory populated");
        }

        info!(points = labels.len(), "workspace setup finished");
        Ok(())
    }

    /// Every lambda directory, lexicographically sorted.
    pub fn lambda_dirs(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        sorted_subdirs(&self.dynamic_dir())
    }

    /// Lambda directories still lacking the log of (`phase`, `rep`). A
    /// present log means the work was already attempted, so reruns skip it.
    pub fn pending_lambda_dirs(&self, phase: &str, rep: u32) -> Result<Vec<PathBuf>, WorkspaceError> {
        let log_name = dynamic_log_name(phase, rep);
        Ok(self
            .lambda_dirs()?
            .into_iter()
            .filter(|dir| !dir.join(&log_name).exists())
            .collect())
    }

    /// Validate dynamic output and lay out one pair directory per adjacent
    /// lambda pair. Any lambda directory without an `.arc` aborts before
    /// `bar/` is touched; pre-existing `bar/` contents are dropped.
    pub fn bar_setup(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        let dirs = self.lambda_dirs()?;
        for dir in &dirs {
            if files_with_extension(dir, "arc")?.is_empty() {
                return Err(WorkspaceError::MissingArc(dir.clone()));
            }
        }

        let bar_dir = self.bar_dir();
        if bar_dir.exists() {
            fs::remove_dir_all(&bar_dir).map_err(|source| io_error(&bar_dir, source))?;
        }

        let mut pairs = Vec::with_capacity(dirs.len().saturating_sub(1));
        for pair in dirs.windows(2) {
            let name = format!("{}_{}", base_name(&pair[0]), base_name(&pair[1]));
            let dir = bar_dir.join(name);
            ensure_dir(&dir)?;
            pairs.push(dir);
        }

        info!(pairs = pairs.len(), "bar pair directories ready");
        Ok(pairs)
    }

    /// Every bar pair directory, lexicographically sorted.
    pub fn bar_pair_dirs(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        sorted_subdirs(&self.bar_dir())
    }
}

/// Directory label of one ladder point: percent coefficients, zero padded.
pub fn lambda_label(vdw: f64, ele: f64) -> String {
    format!(
        "vdw{:03}ele{:03}",
        (100.0 * vdw).round() as i64,
        (100.0 * ele).round() as i64
    )
}

/// Labels for the whole ladder. Two points rounding to one label would share
/// a directory and silently merge, so collisions are rejected.
fn lambda_labels(ladder: &LambdaLadder) -> Result<Vec<String>, WorkspaceError> {
    let labels = (0..ladder.len())
        .map(|index| lambda_label(ladder.vdw[index], ladder.ele[index]))
        .collect_vec();

    for (a, b) in (0..labels.len()).tuple_combinations::<(_, _)>() {
        if labels[a] == labels[b] {
            return Err(WorkspaceError::LabelCollision(a, b));
        }
    }

    Ok(labels)
}

pub fn dynamic_log_name(phase: &str, rep: u32) -> String {
    format!("{phase}_{rep}.log")
}

/// Rewrite a key file for one ladder point. Targeted key lines are replaced,
/// everything else is copied verbatim with a normalized trailing newline.
pub fn patch_key(source: &str, vdw: f64, ele: f64, rst: Option<&str>, prm_name: &str) -> String {
    let mut out = String::with_capacity(source.len());

    for line in source.lines() {
        if line.contains("vdw-lambda") {
            out.push_str(&format!("vdw-lambda {vdw}\n"));
        } else if line.contains("ele-lambda") {
            out.push_str(&format!("ele-lambda {ele}\n"));
        } else if line.contains("restrain-groups") {
            let mut tokens = line.split_whitespace().collect_vec();
            match rst {
                Some(rst) if tokens.len() > 3 => {
                    tokens[3] = rst;
                    out.push_str(&tokens.join(" "));
                    out.push('\n');
                }
                _ => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        } else if line.contains("parameters") {
            // the copied force-field file sits two levels up
            out.push_str(&format!("parameters ../../{prm_name}\n"));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}

/// `.ext` files in `dir`, sorted by name.
pub(crate) fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, WorkspaceError> {
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == ext) {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}

/// The single `.ext` file in `dir`; zero or several is a layout violation.
pub(crate) fn unique_file_with_extension(
    dir: &Path,
    ext: &'static str,
) -> Result<PathBuf, WorkspaceError> {
    let mut files = files_with_extension(dir, ext)?;
    if files.len() != 1 {
        return Err(WorkspaceError::WantOneFile {
            dir: dir.to_path_buf(),
            ext,
            count: files.len(),
        });
    }

    Ok(files.remove(0))
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();

    Ok(dirs)
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn io_error(path: &Path, source: io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_dir(path: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(path).map_err(|source| io_error(path, source))?;
    broaden_mode(path).map_err(|source| io_error(path, source))
}

/// Cluster users share the tree, so everything the pipeline creates is left
/// world-writable.
pub(crate) fn broaden_mode(path: &Path) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
}

pub(crate) fn copy_broad(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest)?;
    broaden_mode(dest)
}

pub(crate) fn write_broad(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    broaden_mode(path)
}
