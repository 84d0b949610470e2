use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const NODE_DIR: &str = "/sys/devices/system/node";

#[derive(Debug, Error)]
pub enum TopologyError {
    /// A node cpulist had more than two core groups.
    #[error("invalid NUMA topology: {0:?}")]
    InvalidNumaTopology(String),
    /// The physical and SMT-sibling groups differ in length.
    #[error("invalid cpu list: {0:?}")]
    InvalidCpuList(String),
    #[error("invalid core id in {0:?}")]
    InvalidCoreId(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// One SMT sibling pair on one NUMA node. On non-SMT nodes both halves
/// name the same core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorePair {
    pub physical_core: u32,
    pub logical_core: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    pub pairs: Vec<CorePair>,
    pub physical_core_min: u32,
    pub physical_core_max: u32,
    pub logical_core_min: u32,
    pub logical_core_max: u32,
}

impl NumaNode {
    fn new(physical: Vec<u32>, logical: Vec<u32>) -> Self {
        let pairs = physical
            .iter()
            .zip(logical.iter())
            .map(|(&p, &l)| CorePair {
                physical_core: p,
                logical_core: l,
            })
            .collect();
        NumaNode {
            pairs,
            physical_core_min: physical.iter().copied().min().unwrap_or(0),
            physical_core_max: physical.iter().copied().max().unwrap_or(0),
            logical_core_min: logical.iter().copied().min().unwrap_or(0),
            logical_core_max: logical.iter().copied().max().unwrap_or(0),
        }
    }
}

/// Read the host NUMA layout from the kernel's node directory, in
/// ascending node-index order.
pub fn local_numa_nodes() -> Result<Vec<NumaNode>, TopologyError> {
    local_numa_nodes_at(Path::new(NODE_DIR))
}

fn local_numa_nodes_at(dir: &Path) -> Result<Vec<NumaNode>, TopologyError> {
    let entries = fs::read_dir(dir).map_err(|e| TopologyError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut indexed = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TopologyError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(index) = name
            .strip_prefix("node")
            .and_then(|rest| rest.parse::<u32>().ok())
        else {
            continue;
        };

        let cpulist_path = entry.path().join("cpulist");
        let cpulist = fs::read_to_string(&cpulist_path).map_err(|e| TopologyError::Io {
            path: cpulist_path.display().to_string(),
            source: e,
        })?;
        indexed.push((index, parse_node_list(&cpulist)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, node)| node).collect())
}

/// Parse one node's cpulist, e.g. `0-23,48-71`.
///
/// Two groups describe the physical cores and their SMT siblings in
/// matching order. A single group is a non-SMT node: each core pairs with
/// itself. Anything else is rejected.
pub fn parse_node_list(cpulist: &str) -> Result<NumaNode, TopologyError> {
    let cpulist = cpulist.trim();
    let groups: Vec<&str> = cpulist.split(',').collect();
    match groups.as_slice() {
        [single] => {
            let cores = extract_core_ids(single)?;
            Ok(NumaNode::new(cores.clone(), cores))
        }
        [physical, logical] => {
            let physical = extract_core_ids(physical)?;
            let logical = extract_core_ids(logical)?;
            if physical.len() != logical.len() {
                return Err(TopologyError::InvalidCpuList(cpulist.to_string()));
            }
            Ok(NumaNode::new(physical, logical))
        }
        _ => Err(TopologyError::InvalidNumaTopology(cpulist.to_string())),
    }
}

/// Expand a `a-b` range (inclusive) or a bare core id.
fn extract_core_ids(s: &str) -> Result<Vec<u32>, TopologyError> {
    let s = s.trim();
    match s.split_once('-') {
        None => {
            let id = s
                .parse::<u32>()
                .map_err(|_| TopologyError::InvalidCoreId(s.to_string()))?;
            Ok(vec![id])
        }
        Some((start, end)) => {
            let start = start
                .parse::<u32>()
                .map_err(|_| TopologyError::InvalidCoreId(s.to_string()))?;
            let end = end
                .parse::<u32>()
                .map_err(|_| TopologyError::InvalidCoreId(s.to_string()))?;
            Ok((start..=end).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(p: u32, l: u32) -> CorePair {
        CorePair {
            physical_core: p,
            logical_core: l,
        }
    }

    #[test]
    fn two_group_node() {
        let node = parse_node_list("0-23,48-71").unwrap();
        assert_eq!(node.pairs.len(), 24);
        assert_eq!(node.pairs[0], pair(0, 48));
        assert_eq!(node.pairs[23], pair(23, 71));
        // strictly ascending in both columns
        for w in node.pairs.windows(2) {
            assert!(w[0].physical_core < w[1].physical_core);
            assert!(w[0].logical_core < w[1].logical_core);
        }
        assert_eq!(node.physical_core_min, 0);
        assert_eq!(node.physical_core_max, 23);
        assert_eq!(node.logical_core_min, 48);
        assert_eq!(node.logical_core_max, 71);
    }

    #[test]
    fn second_socket_offsets() {
        let node = parse_node_list("24-47,72-95").unwrap();
        assert_eq!(node.pairs.len(), 24);
        assert_eq!(node.pairs[0], pair(24, 72));
        assert_eq!(node.pairs[23], pair(47, 95));
    }

    #[test]
    fn single_group_is_a_non_smt_node() {
        let node = parse_node_list("0-23").unwrap();
        assert_eq!(node.pairs.len(), 24);
        assert_eq!(node.pairs[0], pair(0, 0));
        assert_eq!(node.pairs[23], pair(23, 23));
        assert_eq!(node.physical_core_min, node.logical_core_min);
        assert_eq!(node.physical_core_max, node.logical_core_max);
    }

    #[test]
    fn bare_core_id() {
        let node = parse_node_list("5").unwrap();
        assert_eq!(node.pairs, vec![pair(5, 5)]);
    }

    #[test]
    fn trailing_newline_from_sysfs() {
        let node = parse_node_list("0-3,8-11\n").unwrap();
        assert_eq!(node.pairs.len(), 4);
    }

    #[test]
    fn more_than_two_groups_is_rejected() {
        assert!(matches!(
            parse_node_list("0-3,8-11,16-19"),
            Err(TopologyError::InvalidNumaTopology(_))
        ));
    }

    #[test]
    fn unequal_groups_are_rejected() {
        assert!(matches!(
            parse_node_list("0-3,8-12"),
            Err(TopologyError::InvalidCpuList(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_node_list("0-x"),
            Err(TopologyError::InvalidCoreId(_))
        ));
        assert!(matches!(
            parse_node_list(""),
            Err(TopologyError::InvalidCoreId(_))
        ));
    }
}
