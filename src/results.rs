use crate::workspace::{self, Workspace, WorkspaceError};
use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

pub const BAR2_LOG: &str = "bar2.log";

const FORWARD_MARKER: &str = "Free Energy via Forward FEP";
const BACKWARD_MARKER: &str = "Free Energy via Backward FEP";

#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{dir:?} has no bar2.log; run bar to completion first")]
    MissingLog { dir: PathBuf },
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// One direction's free-energy estimate for one pair, in kcal/mol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub energy: f64,
    pub margin: f64,
}

impl Estimate {
    fn nan() -> Self {
        Self {
            energy: f64::NAN,
            margin: f64::NAN,
        }
    }
}

#[derive(Debug)]
pub struct PairResult {
    pub from: String,
    pub to: String,
    pub forward: Estimate,
    pub backward: Estimate,
}

/// Collect every pair's BAR2 estimates and write `results.txt`: per-pair
/// rows plus quadrature-combined totals, forward then backward.
pub fn aggregate(workspace: &Workspace) -> Result<PathBuf, ResultsError> {
    let pairs = workspace.bar_pair_dirs()?;

    let mut results = Vec::with_capacity(pairs.len());
    for dir in &pairs {
        let log = dir.join(BAR2_LOG);
        if !log.exists() {
            return Err(ResultsError::MissingLog { dir: dir.clone() });
        }
        let (forward, backward) = parse_bar2_log(&log)?;

        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (from, to) = name.split_once('_').unwrap_or((name.as_str(), ""));
        results.push(PairResult {
            from: from.to_owned(),
            to: to.to_owned(),
            forward,
            backward,
        });
    }

    let path = workspace.results_path();
    workspace::write_broad(&path, &render(&results)).map_err(|source| ResultsError::Io {
        path: path.clone(),
        source,
    })?;
    info!(path = %path.display(), pairs = results.len(), "wrote aggregated free energies");

    Ok(path)
}

pub(crate) fn parse_bar2_log(path: &Path) -> Result<(Estimate, Estimate), ResultsError> {
    let text = fs::read_to_string(path).map_err(|source| ResultsError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut forward = None;
    let mut backward = None;
    for line in text.lines() {
        if line.contains(FORWARD_MARKER) {
            forward = Some(parse_estimate(line, path, "forward"));
        } else if line.contains(BACKWARD_MARKER) {
            backward = Some(parse_estimate(line, path, "backward"));
        }
    }

    let missing = |direction: &str| {
        warn!(
            path = %path.display(),
            direction,
            "no free-energy line found, recording NaN"
        );
        Estimate::nan()
    };

    Ok((
        forward.unwrap_or_else(|| missing("forward")),
        backward.unwrap_or_else(|| missing("backward")),
    ))
}

/// Energy at token 5, margin at token 7. Unparseable values become NaN.
fn parse_estimate(line: &str, path: &Path, direction: &str) -> Estimate {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    let float_at = |index: usize, what: &str| -> f64 {
        match tokens.get(index).and_then(|token| token.parse().ok()) {
            Some(value) => value,
            None => {
                warn!(
                    path = %path.display(),
                    direction,
                    what,
                    "failed to parse value, recording NaN"
                );
                f64::NAN
            }
        }
    };

    Estimate {
        energy: float_at(5, "energy"),
        margin: float_at(7, "margin"),
    }
}

pub(crate) fn render(results: &[PairResult]) -> String {
    let mut out = String::new();

    out.push_str("Forward FEP Results\n");
    render_block(&mut out, results, |result| result.forward);
    out.push('\n');
    out.push_str("Backward FEP Results\n");
    render_block(&mut out, results, |result| result.backward);

    out
}

fn render_block(out: &mut String, results: &[PairResult], pick: fn(&PairResult) -> Estimate) {
    let mut total_energy = 0.0;
    let mut total_square = 0.0;

    for result in results {
        let estimate = pick(result);
        let _ = writeln!(
            out,
            "{} to {}\t{} +/- {} kcal/mol",
            result.from,
            result.to,
            sci(estimate.energy),
            sci(estimate.margin)
        );
        total_energy += estimate.energy;
        total_square += estimate.margin * estimate.margin;
    }

    let _ = writeln!(
        out,
        "Total: {} +/- {} kcal/mol",
        sci(total_energy),
        sci(total_square.sqrt())
    );
}

/// C-style `%e`: six fractional digits, signed two-digit exponent.
pub(crate) fn sci(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }

    let formatted = format!("{value:.6e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            format!(
                "{mantissa}e{}{:02}",
                if exponent < 0 { '-' } else { '+' },
                exponent.abs()
            )
        }
        None => formatted,
    }
}
