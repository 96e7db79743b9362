pub mod ini;


use cowstr::CowStr;
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    env, io,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("line {line} of {path:?} sits outside any block")]
    LineOutsideBlock { path: PathBuf, line: usize },
    #[error("missing `{0}` block")]
    MissingBlock(&'static str),
    #[error("multiple `{0}` blocks defined")]
    DuplicateBlock(&'static str),
    #[error("missing `{key}` in `{block}` block")]
    MissingKey {
        block: &'static str,
        key: &'static str,
    },
    #[error("invalid `{key}` value {value:?} in `{block}` block: {reason}")]
    InvalidValue {
        block: &'static str,
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("`vdwLambdas` ({vdw}), `eleLambdas` ({ele}) and `restraints` ({rst}) must have equal lengths")]
    LadderLengthMismatch { vdw: usize, ele: usize, rst: usize },
    #[error("the lambda ladder needs at least two points to form a pair, got {0}")]
    LadderTooShort(usize),
    #[error("dynamic blocks {0} and {1} share the same `order`")]
    DuplicateOrder(CowStr, CowStr),
    #[error("more than one dynamic block is named {0}")]
    DuplicateName(CowStr),
    #[error("{path:?} referenced by the config does not exist")]
    MissingPath { path: PathBuf },
    #[error("`targetDirectory` must be absolute, got {0:?}")]
    RelativeTarget(PathBuf),
    #[error("the `general` block needs at least one `toolchain` entry")]
    NoToolchains,
}

/// Fully validated run configuration; immutable once loaded.
#[derive(Debug, Clone)]
pub struct FepConfig {
    pub general: GeneralConfig,
    pub ladder: LambdaLadder,
    /// Dynamic phases, ascending by `order`.
    pub phases: Vec<DynamicPhase>,
    pub bar: BarConfig,
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub target_dir: PathBuf,
    pub xyz: PathBuf,
    pub key: PathBuf,
    pub prm: PathBuf,
    pub node_file: PathBuf,
    pub node_preference: NodePreference,
    /// GPU generation tag -> toolchain to source on nodes of that generation.
    pub toolchains: BTreeMap<CowStr, Toolchain>,
}

#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Environment script `source`d on the node before launching the binary.
    pub env_script: PathBuf,
    /// Directory holding `dynamic_omm.x` and `bar_omm.x`.
    pub home: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePreference {
    Fastest,
    Slowest,
    Memory,
    Random,
    None,
}

/// The coupling-coefficient ladder: parallel per-point sequences.
#[derive(Debug, Clone)]
pub struct LambdaLadder {
    pub vdw: Vec<f64>,
    pub ele: Vec<f64>,
    /// Restraint tokens spliced into `restrain-groups` key lines; opaque.
    pub rst: Option<Vec<CowStr>>,
}

impl LambdaLadder {
    pub fn len(&self) -> usize {
        self.vdw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vdw.is_empty()
    }

    pub fn restraint(&self, index: usize) -> Option<&str> {
        self.rst.as_ref().map(|rst| rst[index].as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DynamicPhase {
    pub name: CowStr,
    pub order: i64,
    pub repetitions: u32,
    pub ensemble: Ensemble,
    /// Integration step in femtoseconds.
    pub step_interval: f64,
    pub save_interval: f64,
    /// Trajectory length in nanoseconds.
    pub simulation_time: f64,
}

impl DynamicPhase {
    pub fn num_steps(&self) -> u64 {
        (1e6 * self.simulation_time / self.step_interval).round() as u64
    }
}

/// Thermodynamic ensemble; each variant carries the parameters the external
/// binary needs for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ensemble {
    Nve,
    Nvt { temp: f64 },
    Nph { pressure: f64 },
    Npt { temp: f64, pressure: f64 },
}

impl Ensemble {
    pub fn code(self) -> u8 {
        match self {
            Self::Nve => 1,
            Self::Nvt { .. } => 2,
            Self::Nph { .. } => 3,
            Self::Npt { .. } => 4,
        }
    }

    /// Trailing ensemble arguments of the dynamics command line.
    pub fn extra_args(self) -> String {
        match self {
            Self::Nve => String::new(),
            Self::Nvt { temp } => format!("{temp}"),
            Self::Nph { pressure } => format!("{pressure}"),
            Self::Npt { temp, pressure } => format!("{temp} {pressure}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BarConfig {
    pub temp: f64,
    pub frame_interval: u64,
}

impl FepConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let blocks = ini::read_blocks(path)?;

        let mut general = None;
        let mut ladder = None;
        let mut bar = None;
        let mut phases = Vec::new();

        for block in &blocks {
            match block.keyword {
                "general" => match general {
                    None => general = Some(GeneralConfig::from_block(block)?),
                    Some(_) => return Err(ConfigErrors::DuplicateBlock("general")),
                },
                "setup" => match ladder {
                    None => ladder = Some(LambdaLadder::from_block(block)?),
                    Some(_) => return Err(ConfigErrors::DuplicateBlock("setup")),
                },
                "bar" => match bar {
                    None => bar = Some(BarConfig::from_block(block)?),
                    Some(_) => return Err(ConfigErrors::DuplicateBlock("bar")),
                },
                "dynamic" => phases.push(DynamicPhase::from_block(block)?),
                keyword => unreachable!("ini reader only yields known keywords, got {keyword}"),
            }
        }

        let general = general.ok_or(ConfigErrors::MissingBlock("general"))?;
        let ladder = ladder.ok_or(ConfigErrors::MissingBlock("setup"))?;
        let bar = bar.ok_or(ConfigErrors::MissingBlock("bar"))?;
        if phases.is_empty() {
            return Err(ConfigErrors::MissingBlock("dynamic"));
        }

        phases.sort_by_key(|phase| phase.order);
        if let Some(pair) = phases.windows(2).find(|pair| pair[0].order == pair[1].order) {
            return Err(ConfigErrors::DuplicateOrder(
                pair[0].name.clone(),
                pair[1].name.clone(),
            ));
        }
        if let Some(name) = phases
            .iter()
            .map(|phase| phase.name.clone())
            .duplicates()
            .next()
        {
            return Err(ConfigErrors::DuplicateName(name));
        }

        Ok(Self {
            general,
            ladder,
            phases,
            bar,
        })
    }
}

impl GeneralConfig {
    fn from_block(block: &ini::Block) -> Result<Self, ConfigErrors> {
        let target_dir = match block.get("targetDirectory").and_then(|values| values.first()) {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                if !dir.is_absolute() {
                    return Err(ConfigErrors::RelativeTarget(dir));
                }
                dir
            }
            // relative input paths then resolve against where we were launched
            None => env::current_dir().map_err(|source| ConfigErrors::Io {
                path: PathBuf::from("."),
                source,
            })?,
        };

        let resolve = |raw: &str| {
            let path = PathBuf::from(raw);
            if path.is_absolute() {
                path
            } else {
                target_dir.join(path)
            }
        };

        let xyz = resolve(block.one("xyz")?);
        let key = resolve(block.one("key")?);
        let prm = resolve(block.one("prm")?);
        let node_file = resolve(block.one("nodeFile")?);

        let node_preference = match block.one("nodePreference")? {
            "fastest" => NodePreference::Fastest,
            "slowest" => NodePreference::Slowest,
            "memory" => NodePreference::Memory,
            "random" => NodePreference::Random,
            "none" => NodePreference::None,
            other => {
                warn!("unknown nodePreference {other:?}, keeping inventory file order");
                NodePreference::None
            }
        };

        let mut toolchains = BTreeMap::new();
        for values in block.get_all("toolchain") {
            let [tag, env_script, home] = values else {
                return Err(ConfigErrors::InvalidValue {
                    block: "general",
                    key: "toolchain",
                    value: values.iter().join(" "),
                    reason: "expected `<generation> <env-script> <toolkit-home>`",
                });
            };
            let replaced = toolchains.insert(
                CowStr::from(tag.as_str()),
                Toolchain {
                    env_script: resolve(env_script),
                    home: resolve(home),
                },
            );
            if replaced.is_some() {
                return Err(ConfigErrors::InvalidValue {
                    block: "general",
                    key: "toolchain",
                    value: tag.clone(),
                    reason: "generation tag defined twice",
                });
            }
        }
        if toolchains.is_empty() {
            return Err(ConfigErrors::NoToolchains);
        }

        let general = Self {
            target_dir,
            xyz,
            key,
            prm,
            node_file,
            node_preference,
            toolchains,
        };
        general.check_paths_exist()?;

        Ok(general)
    }

    fn check_paths_exist(&self) -> Result<(), ConfigErrors> {
        let mut referenced = vec![
            &self.target_dir,
            &self.xyz,
            &self.key,
            &self.prm,
            &self.node_file,
        ];
        for toolchain in self.toolchains.values() {
            referenced.push(&toolchain.env_script);
            referenced.push(&toolchain.home);
        }

        match referenced.into_iter().find(|path| !path.exists()) {
            Some(path) => Err(ConfigErrors::MissingPath { path: path.clone() }),
            None => Ok(()),
        }
    }
}

impl LambdaLadder {
    fn from_block(block: &ini::Block) -> Result<Self, ConfigErrors> {
        let vdw = parse_list(block, "vdwLambdas")?;
        let ele = parse_list(block, "eleLambdas")?;
        let rst: Option<Vec<CowStr>> = block.get("restraints").map(|values| {
            values
                .iter()
                .map(|value| CowStr::from(value.as_str()))
                .collect()
        });

        let rst_len = rst.as_ref().map_or(vdw.len(), Vec::len);
        if vdw.len() != ele.len() || ele.len() != rst_len {
            return Err(ConfigErrors::LadderLengthMismatch {
                vdw: vdw.len(),
                ele: ele.len(),
                rst: rst_len,
            });
        }
        if vdw.len() < 2 {
            return Err(ConfigErrors::LadderTooShort(vdw.len()));
        }

        Ok(Self { vdw, ele, rst })
    }
}

impl DynamicPhase {
    fn from_block(block: &ini::Block) -> Result<Self, ConfigErrors> {
        let name = CowStr::from(block.one("name")?);
        if name.is_empty() {
            return Err(ConfigErrors::InvalidValue {
                block: "dynamic",
                key: "name",
                value: String::new(),
                reason: "phase names must be at least one character",
            });
        }

        let order = parse_value(block, "order")?;
        let repetitions: u32 = parse_value(block, "repetitions")?;
        if repetitions == 0 {
            return Err(ConfigErrors::InvalidValue {
                block: "dynamic",
                key: "repetitions",
                value: "0".into(),
                reason: "at least one repetition is required",
            });
        }

        let step_interval: f64 = parse_value(block, "stepInterval")?;
        if step_interval <= 0.0 {
            return Err(ConfigErrors::InvalidValue {
                block: "dynamic",
                key: "stepInterval",
                value: block.one("stepInterval")?.to_owned(),
                reason: "must be positive",
            });
        }
        let save_interval = parse_value(block, "saveInterval")?;
        let simulation_time = parse_value(block, "simulationTime")?;

        let ensemble = match block.one("ensemble")? {
            "1" => Ensemble::Nve,
            "2" => Ensemble::Nvt {
                temp: parse_value(block, "temp")?,
            },
            "3" => Ensemble::Nph {
                pressure: parse_value(block, "pressure")?,
            },
            "4" => Ensemble::Npt {
                temp: parse_value(block, "temp")?,
                pressure: parse_value(block, "pressure")?,
            },
            other => {
                return Err(ConfigErrors::InvalidValue {
                    block: "dynamic",
                    key: "ensemble",
                    value: other.to_owned(),
                    reason: "must be 1, 2, 3 or 4",
                })
            }
        };

        Ok(Self {
            name,
            order,
            repetitions,
            ensemble,
            step_interval,
            save_interval,
            simulation_time,
        })
    }
}

impl BarConfig {
    fn from_block(block: &ini::Block) -> Result<Self, ConfigErrors> {
        Ok(Self {
            temp: parse_value(block, "temp")?,
            frame_interval: parse_value(block, "frameInterval")?,
        })
    }
}

fn parse_value<T: FromStr>(block: &ini::Block, key: &'static str) -> Result<T, ConfigErrors> {
    let raw = block.one(key)?;
    raw.parse().map_err(|_| ConfigErrors::InvalidValue {
        block: block.keyword,
        key,
        value: raw.to_owned(),
        reason: "not a valid number",
    })
}

fn parse_list(block: &ini::Block, key: &'static str) -> Result<Vec<f64>, ConfigErrors> {
    block
        .list(key)?
        .iter()
        .map(|raw| {
            raw.parse().map_err(|_| ConfigErrors::InvalidValue {
                block: block.keyword,
                key,
                value: raw.clone(),
                reason: "not a valid number",
            })
        })
        .collect()
}
