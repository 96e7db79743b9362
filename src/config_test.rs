use crate::config::{ConfigErrors, Ensemble, FepConfig, NodePreference};
use std::{fs, path::Path};
use tempfile::TempDir;

/// A target directory with every referenced input file present.
fn scaffold() -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in ["mol.xyz", "mol.key", "amoeba.prm", "nodes.csv", "cuda11.sh"] {
        fs::write(dir.path().join(name), "x\n").unwrap();
    }
    fs::create_dir(dir.path().join("cuda11")).unwrap();
    dir
}

fn base_ini(target: &Path) -> String {
    format!(
        "general\n\
         targetDirectory {target}\n\
         xyz mol.xyz\n\
         key mol.key\n\
         prm amoeba.prm\n\
         nodeFile nodes.csv\n\
         nodePreference fastest\n\
         toolchain Ampere cuda11.sh cuda11\n\
         setup\n\
         vdwLambdas 0.0 0.5 1.0\n\
         eleLambdas 0.0 0.0 1.0\n\
         bar\n\
         temp 298.0\n\
         frameInterval 2\n\
         dynamic\n\
         name equilibrate\n\
         order 10\n\
         repetitions 2\n\
         ensemble 4\n\
         temp 298.0\n\
         pressure 1.0\n\
         stepInterval 2.0\n\
         saveInterval 10.0\n\
         simulationTime 1.0\n",
        target = target.display()
    )
}

fn load(dir: &TempDir, ini: &str) -> Result<FepConfig, ConfigErrors> {
    let path = dir.path().join("run.ini");
    fs::write(&path, ini).unwrap();
    FepConfig::load(&path)
}

#[test]
pub fn full_config_loads() {
    let dir = scaffold();
    let cfg = load(&dir, &base_ini(dir.path())).unwrap();

    assert_eq!(cfg.ladder.len(), 3);
    assert_eq!(cfg.general.node_preference, NodePreference::Fastest);
    assert_eq!(cfg.general.xyz, dir.path().join("mol.xyz"));
    assert_eq!(cfg.phases.len(), 1);

    let phase = &cfg.phases[0];
    assert_eq!(phase.name.as_str(), "equilibrate");
    assert_eq!(
        phase.ensemble,
        Ensemble::Npt {
            temp: 298.0,
            pressure: 1.0
        }
    );
    // 1 ns at 2 fs per step
    assert_eq!(phase.num_steps(), 500_000);

    assert_eq!(cfg.bar.frame_interval, 2);
    let toolchain = cfg.general.toolchains.values().next().unwrap();
    assert_eq!(toolchain.home, dir.path().join("cuda11"));
}

#[test]
pub fn num_steps_rounds_to_nearest() {
    let dir = scaffold();
    let ini = base_ini(dir.path())
        .replace("simulationTime 1.0", "simulationTime 0.0025")
        .replace("stepInterval 2.0", "stepInterval 3.0");
    let cfg = load(&dir, &ini).unwrap();

    // 1e6 * 0.0025 / 3 = 833.33..
    assert_eq!(cfg.phases[0].num_steps(), 833);
}

#[test]
pub fn phases_sort_by_order() {
    let dir = scaffold();
    let ini = base_ini(dir.path())
        + "dynamic\n\
           name production\n\
           order 5\n\
           repetitions 1\n\
           ensemble 1\n\
           stepInterval 2.0\n\
           saveInterval 10.0\n\
           simulationTime 1.0\n";
    let cfg = load(&dir, &ini).unwrap();

    assert_eq!(cfg.phases[0].name.as_str(), "production");
    assert_eq!(cfg.phases[1].name.as_str(), "equilibrate");
    assert_eq!(cfg.phases[0].ensemble, Ensemble::Nve);
}

#[test]
pub fn duplicate_order_is_rejected() {
    let dir = scaffold();
    let ini = base_ini(dir.path())
        + "dynamic\n\
           name production\n\
           order 10\n\
           repetitions 1\n\
           ensemble 1\n\
           stepInterval 2.0\n\
           saveInterval 10.0\n\
           simulationTime 1.0\n";

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::DuplicateOrder(..)
    ));
}

#[test]
pub fn duplicate_name_is_rejected() {
    let dir = scaffold();
    let ini = base_ini(dir.path())
        + "dynamic\n\
           name equilibrate\n\
           order 20\n\
           repetitions 1\n\
           ensemble 1\n\
           stepInterval 2.0\n\
           saveInterval 10.0\n\
           simulationTime 1.0\n";

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::DuplicateName(name) if name.as_str() == "equilibrate"
    ));
}

#[test]
pub fn ladder_length_mismatch_is_rejected() {
    let dir = scaffold();
    let ini = base_ini(dir.path()).replace("eleLambdas 0.0 0.0 1.0", "eleLambdas 0.0 1.0");

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::LadderLengthMismatch { vdw: 3, ele: 2, .. }
    ));
}

#[test]
pub fn restraints_must_match_ladder_length() {
    let dir = scaffold();
    let ini = base_ini(dir.path()).replace(
        "eleLambdas 0.0 0.0 1.0",
        "eleLambdas 0.0 0.0 1.0\nrestraints 5.0 5.0",
    );

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::LadderLengthMismatch { rst: 2, .. }
    ));
}

#[test]
pub fn single_point_ladder_is_rejected() {
    let dir = scaffold();
    let ini = base_ini(dir.path())
        .replace("vdwLambdas 0.0 0.5 1.0", "vdwLambdas 1.0")
        .replace("eleLambdas 0.0 0.0 1.0", "eleLambdas 1.0");

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::LadderTooShort(1)
    ));
}

#[test]
pub fn nvt_requires_a_temperature() {
    let dir = scaffold();
    // drop temp and pressure from the dynamic block only; bar keeps its own
    let ini = base_ini(dir.path())
        .replace("ensemble 4", "ensemble 2")
        .replace("temp 298.0\npressure 1.0\nstepInterval", "stepInterval");

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::MissingKey {
            block: "dynamic",
            key: "temp"
        }
    ));
}

#[test]
pub fn out_of_range_ensemble_is_rejected() {
    let dir = scaffold();
    let ini = base_ini(dir.path()).replace("ensemble 4", "ensemble 5");

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::InvalidValue {
            key: "ensemble",
            ..
        }
    ));
}

#[test]
pub fn missing_referenced_file_is_rejected() {
    let dir = scaffold();
    fs::remove_file(dir.path().join("amoeba.prm")).unwrap();

    assert!(matches!(
        load(&dir, &base_ini(dir.path())).unwrap_err(),
        ConfigErrors::MissingPath { path } if path.ends_with("amoeba.prm")
    ));
}

#[test]
pub fn relative_target_directory_is_rejected() {
    let dir = scaffold();
    let ini = base_ini(dir.path()).replace(
        &format!("targetDirectory {}", dir.path().display()),
        "targetDirectory runs/feb",
    );

    assert!(matches!(
        load(&dir, &ini).unwrap_err(),
        ConfigErrors::RelativeTarget(..)
    ));
}
