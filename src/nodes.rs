use crate::{
    config::{ini, NodePreference},
    workspace,
};
use cowstr::CowStr;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{debug, warn};

pub const PROBE_SCRIPT_NAME: &str = "run_nvidia_smi.sh";

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("failed to read node inventory {path:?}")]
    Inventory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed record on line {line} of {path:?}: expected 7 comma-separated fields")]
    MalformedRecord { path: PathBuf, line: usize },
    #[error("invalid `{field}` value {value:?} on line {line} of {path:?}")]
    InvalidField {
        field: &'static str,
        value: String,
        line: usize,
        path: PathBuf,
    },
    #[error("failed to write probe script {path:?}")]
    ProbeScript {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One GPU on one cluster host. Identity is `name` + `card_number`; a host
/// with several cards appears as several nodes.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: CowStr,
    /// Card index as written in the inventory. Kept as text: the probe treats
    /// an unparseable index as "busy", and scripts splice it verbatim into
    /// `CUDA_VISIBLE_DEVICES`.
    pub card_number: CowStr,
    pub card_manufacturer: CowStr,
    pub card_generation: CowStr,
    pub card_model: CowStr,
    /// MiB
    pub memory: u64,
    pub performance_index: i64,

    pub is_free: bool,
}

#[derive(Debug, Clone)]
pub struct NodePool {
    pub nodes: Vec<Node>,
}

impl NodePool {
    /// Load the inventory and order it by the configured preference.
    pub fn load(path: &Path, preference: NodePreference) -> Result<Self, NodeError> {
        let text = fs::read_to_string(path).map_err(|source| NodeError::Inventory {
            path: path.to_path_buf(),
            source,
        })?;

        let mut nodes = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = ini::strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 7 {
                return Err(NodeError::MalformedRecord {
                    path: path.to_path_buf(),
                    line: index + 1,
                });
            }

            let parse_int = |field: &'static str, value: &str| -> Result<i64, NodeError> {
                value.parse().map_err(|_| NodeError::InvalidField {
                    field,
                    value: value.to_owned(),
                    line: index + 1,
                    path: path.to_path_buf(),
                })
            };

            nodes.push(Node {
                name: CowStr::from(fields[0]),
                card_number: CowStr::from(fields[1]),
                card_manufacturer: CowStr::from(fields[2]),
                card_generation: CowStr::from(fields[3]),
                card_model: CowStr::from(fields[4]),
                memory: parse_int("memory", fields[5])? as u64,
                performance_index: parse_int("performanceIndex", fields[6])?,
                is_free: false,
            });
        }

        let mut pool = Self { nodes };
        pool.apply_preference(preference);

        Ok(pool)
    }

    fn apply_preference(&mut self, preference: NodePreference) {
        match preference {
            NodePreference::Fastest => self
                .nodes
                .sort_by(|a, b| b.performance_index.cmp(&a.performance_index)),
            NodePreference::Slowest => self
                .nodes
                .sort_by(|a, b| a.performance_index.cmp(&b.performance_index)),
            NodePreference::Memory => self.nodes.sort_by(|a, b| b.memory.cmp(&a.memory)),
            NodePreference::Random => self.nodes.shuffle(&mut rand::thread_rng()),
            NodePreference::None => {}
        }
    }

    /// Probe every node and refresh its `is_free` flag. Probes run in
    /// parallel and are independent; results are joined before returning.
    pub fn refresh(&mut self, probe: &ProbeScript) {
        self.nodes.par_iter_mut().for_each(|node| {
            node.is_free = probe.node_is_free(node);
        });

        debug!(
            free = self.free_indices().len(),
            total = self.nodes.len(),
            "node probe joined"
        );
    }

    /// Indices of free nodes, in preference order.
    pub fn free_indices(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_free)
            .map(|(index, _)| index)
            .collect()
    }
}

/// The on-disk wrapper that runs `nvidia-smi` on a node over a
/// non-interactive remote shell.
#[derive(Debug)]
pub struct ProbeScript {
    path: PathBuf,
}

impl ProbeScript {
    pub fn write(temp_dir: &Path) -> Result<Self, NodeError> {
        let path = temp_dir.join(PROBE_SCRIPT_NAME);
        let io_err = |source| NodeError::ProbeScript {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(temp_dir).map_err(io_err)?;
        workspace::write_broad(
            &path,
            "#!/bin/bash\nnode=$1\nssh -o \"StrictHostKeyChecking no\" $node nvidia-smi\n",
        )
        .map_err(io_err)?;

        Ok(Self { path })
    }

    /// True iff the node's designated card shows no running process right
    /// now. A probe that cannot run asserts availability rather than failure.
    fn node_is_free(&self, node: &Node) -> bool {
        let output = Command::new("sh")
            .arg(&self.path)
            .arg(node.name.as_str())
            .output();

        let combined = match output {
            Ok(output) => {
                if !output.status.success() {
                    warn!(
                        node = %node.name,
                        status = %output.status,
                        "probe exited non-zero; the node may be down, check it manually"
                    );
                }
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                combined
            }
            Err(error) => {
                warn!(node = %node.name, %error, "probe failed to run, assuming the node is free");
                return true;
            }
        };

        card_is_free(&combined, &node.card_number, &node.name)
    }
}

/// Scan combined `nvidia-smi` output for a process on `card_number`.
pub(crate) fn card_is_free(output: &str, card_number: &str, node_name: &str) -> bool {
    let lines: Vec<&str> = output.lines().collect();
    let last = lines.len().saturating_sub(1);

    // the process table header sits well below the utilization table; rows
    // start two lines under it. No header means no process table at all.
    let mut first_row = last;
    for index in 11..last {
        if lines[index].contains("PID") {
            first_row = index + 2;
        }
    }

    let card: i64 = match card_number.parse() {
        Ok(card) => card,
        Err(_) => {
            warn!(
                node = node_name,
                card = card_number,
                "card number is not an integer, treating the card as busy"
            );
            return false;
        }
    };

    for line in lines.iter().take(last).skip(first_row) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if let Some(gpu) = tokens.get(1).and_then(|token| token.parse::<i64>().ok()) {
            if gpu == card {
                return false;
            }
        }
    }

    true
}
