use crate::{
    results::{aggregate, parse_bar2_log, render, sci, Estimate, PairResult, ResultsError},
    workspace::Workspace,
};
use std::fs;
use tempfile::TempDir;

#[test]
pub fn sci_matches_c_style_scientific_notation() {
    assert_eq!(sci(1.5), "1.500000e+00");
    assert_eq!(sci(-1.4), "-1.400000e+00");
    assert_eq!(sci(0.1), "1.000000e-01");
    assert_eq!(sci(0.0), "0.000000e+00");
    assert_eq!(sci(12345.678), "1.234568e+04");
    assert_eq!(sci(f64::NAN), "NaN");
}

const BAR2_LOG_TEXT: &str = "\
 Rate Matrix entries and eigenvalues\n\
 Free Energy via Forward FEP          1.5 +/- 0.1 kcal/mol\n\
 Free Energy via Backward FEP         -1.4 +/- 0.2 kcal/mol\n\
 Enthalpy and entropy estimates follow\n";

#[test]
pub fn bar2_log_yields_both_estimates() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("bar2.log");
    fs::write(&log, BAR2_LOG_TEXT).unwrap();

    let (forward, backward) = parse_bar2_log(&log).unwrap();

    assert_eq!(forward, Estimate { energy: 1.5, margin: 0.1 });
    assert_eq!(
        backward,
        Estimate {
            energy: -1.4,
            margin: 0.2
        }
    );
}

#[test]
pub fn garbled_values_become_nan() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("bar2.log");
    fs::write(
        &log,
        " Free Energy via Forward FEP          oops +/- 0.1 kcal/mol\n",
    )
    .unwrap();

    let (forward, backward) = parse_bar2_log(&log).unwrap();

    assert!(forward.energy.is_nan());
    assert_eq!(forward.margin, 0.1);
    // no backward line at all
    assert!(backward.energy.is_nan());
    assert!(backward.margin.is_nan());
}

fn pair(from: &str, to: &str, forward: Estimate, backward: Estimate) -> PairResult {
    PairResult {
        from: from.to_owned(),
        to: to.to_owned(),
        forward,
        backward,
    }
}

#[test]
pub fn totals_combine_energies_linearly_and_margins_in_quadrature() {
    let results = [
        pair(
            "vdw000ele000",
            "vdw050ele000",
            Estimate { energy: 1.5, margin: 0.3 },
            Estimate { energy: -1.0, margin: 0.3 },
        ),
        pair(
            "vdw050ele000",
            "vdw100ele000",
            Estimate { energy: 2.5, margin: 0.4 },
            Estimate { energy: -2.0, margin: 0.4 },
        ),
    ];

    let text = render(&results);

    // sqrt(0.3^2 + 0.4^2) = 0.5
    assert!(text.contains("Total: 4.000000e+00 +/- 5.000000e-01 kcal/mol"));
    assert!(text.contains("Total: -3.000000e+00 +/- 5.000000e-01 kcal/mol"));
    assert!(text.contains("vdw000ele000 to vdw050ele000\t1.500000e+00 +/- 3.000000e-01 kcal/mol"));
}

#[test]
pub fn report_lists_forward_block_then_backward_block() {
    let results = [pair(
        "vdw000ele000",
        "vdw100ele000",
        Estimate { energy: 1.5, margin: 0.1 },
        Estimate {
            energy: -1.4,
            margin: 0.2,
        },
    )];

    let text = render(&results);

    let expected = "\
Forward FEP Results\n\
vdw000ele000 to vdw100ele000\t1.500000e+00 +/- 1.000000e-01 kcal/mol\n\
Total: 1.500000e+00 +/- 1.000000e-01 kcal/mol\n\
\n\
Backward FEP Results\n\
vdw000ele000 to vdw100ele000\t-1.400000e+00 +/- 2.000000e-01 kcal/mol\n\
Total: -1.400000e+00 +/- 2.000000e-01 kcal/mol\n";
    assert_eq!(text, expected);
}

#[test]
pub fn aggregate_writes_results_for_every_pair() {
    let root = TempDir::new().unwrap();
    let workspace = Workspace::new(root.path());

    for name in ["vdw000ele000_vdw050ele000", "vdw050ele000_vdw100ele000"] {
        let pair_dir = workspace.bar_dir().join(name);
        fs::create_dir_all(&pair_dir).unwrap();
        fs::write(pair_dir.join("bar2.log"), BAR2_LOG_TEXT).unwrap();
    }

    let path = aggregate(&workspace).unwrap();
    let text = fs::read_to_string(path).unwrap();

    assert!(text.contains("vdw000ele000 to vdw050ele000\t1.500000e+00"));
    assert!(text.contains("vdw050ele000 to vdw100ele000\t1.500000e+00"));
    assert!(text.contains("Total: 3.000000e+00"));
}

#[test]
pub fn missing_bar2_log_is_fatal() {
    let root = TempDir::new().unwrap();
    let workspace = Workspace::new(root.path());

    let complete = workspace.bar_dir().join("vdw000ele000_vdw050ele000");
    fs::create_dir_all(&complete).unwrap();
    fs::write(complete.join("bar2.log"), BAR2_LOG_TEXT).unwrap();
    let incomplete = workspace.bar_dir().join("vdw050ele000_vdw100ele000");
    fs::create_dir_all(&incomplete).unwrap();

    assert!(matches!(
        aggregate(&workspace).unwrap_err(),
        ResultsError::MissingLog { dir } if dir.ends_with("vdw050ele000_vdw100ele000")
    ));
}
