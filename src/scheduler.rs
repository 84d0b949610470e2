use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::topology::{CorePair, NumaNode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// No single NUMA node holds enough free pairs.
    #[error("no valid core found")]
    NoValidCoreFound,
    /// The pair does not belong to any node's core range.
    #[error("invalid core pair ({0}, {1})")]
    InvalidCorePair(u32, u32),
}

struct Node {
    free: VecDeque<CorePair>,
    physical_core_min: u32,
    physical_core_max: u32,
    logical_core_min: u32,
    logical_core_max: u32,
}

impl Node {
    fn holds(&self, pair: CorePair) -> bool {
        pair.physical_core >= self.physical_core_min
            && pair.physical_core <= self.physical_core_max
            && pair.logical_core >= self.logical_core_min
            && pair.logical_core <= self.logical_core_max
    }
}

/// Allocator of core pairs over the host NUMA layout. An allocation never
/// straddles nodes. The only shared mutable state in the agent; one mutex,
/// held for the duration of each operation.
pub struct Scheduler {
    nodes: Mutex<Vec<Node>>,
}

impl Scheduler {
    pub fn new(layout: &[NumaNode]) -> Self {
        let nodes = layout
            .iter()
            .map(|n| Node {
                free: n.pairs.iter().copied().collect(),
                physical_core_min: n.physical_core_min,
                physical_core_max: n.physical_core_max,
                logical_core_min: n.logical_core_min,
                logical_core_max: n.logical_core_max,
            })
            .collect();
        Scheduler {
            nodes: Mutex::new(nodes),
        }
    }

    /// Take `num` pairs from the first node that has that many free.
    pub fn pop_core_pairs(&self, num: usize) -> Result<Vec<CorePair>, SchedulerError> {
        let mut nodes = self.nodes.lock().unwrap();
        for node in nodes.iter_mut() {
            if node.free.len() < num {
                continue;
            }
            return Ok(node.free.drain(..num).collect());
        }
        Err(SchedulerError::NoValidCoreFound)
    }

    /// Return pairs to their owning nodes. Returned pairs go to the front
    /// of the queue, so the next pop prefers the most recently freed
    /// cores.
    pub fn push_core_pairs(&self, pairs: &[CorePair]) -> Result<(), SchedulerError> {
        let mut nodes = self.nodes.lock().unwrap();
        for &pair in pairs {
            let node = nodes
                .iter_mut()
                .find(|n| n.holds(pair))
                .ok_or(SchedulerError::InvalidCorePair(
                    pair.physical_core,
                    pair.logical_core,
                ))?;
            node.free.push_front(pair);
        }
        Ok(())
    }

    /// Mark pairs as already taken. Used at bootstrap to account for
    /// domains that were defined before the agent restarted; pairs that no
    /// longer match the topology are ignored.
    pub fn reserve(&self, pairs: &[CorePair]) {
        let mut nodes = self.nodes.lock().unwrap();
        for pair in pairs {
            for node in nodes.iter_mut() {
                node.free.retain(|p| p != pair);
            }
        }
    }

    #[cfg(test)]
    fn free_pairs(&self) -> Vec<Vec<CorePair>> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.free.iter().copied().collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::parse_node_list;

    fn pair(p: u32, l: u32) -> CorePair {
        CorePair {
            physical_core: p,
            logical_core: l,
        }
    }

    fn two_node_scheduler() -> Scheduler {
        let node0 = parse_node_list("0-3,8-11").unwrap();
        let node1 = parse_node_list("4-7,12-15").unwrap();
        Scheduler::new(&[node0, node1])
    }

    #[test]
    fn pop_fills_one_node_then_the_next() {
        let s = two_node_scheduler();
        assert_eq!(s.pop_core_pairs(2).unwrap(), vec![pair(0, 8), pair(1, 9)]);
        assert_eq!(s.pop_core_pairs(2).unwrap(), vec![pair(2, 10), pair(3, 11)]);
        assert_eq!(
            s.pop_core_pairs(4).unwrap(),
            vec![pair(4, 12), pair(5, 13), pair(6, 14), pair(7, 15)]
        );
        assert_eq!(s.pop_core_pairs(2), Err(SchedulerError::NoValidCoreFound));
    }

    #[test]
    fn pop_never_straddles_nodes() {
        let s = two_node_scheduler();
        // 5 > any single node, even though 8 pairs are free in total
        assert_eq!(s.pop_core_pairs(5), Err(SchedulerError::NoValidCoreFound));
    }

    #[test]
    fn push_returns_to_the_front() {
        let s = two_node_scheduler();
        for _ in 0..3 {
            let _ = s.pop_core_pairs(2);
        }
        s.push_core_pairs(&[pair(2, 10), pair(3, 11)]).unwrap();
        let free = s.free_pairs();
        assert_eq!(free[0], vec![pair(3, 11), pair(2, 10)]);
        assert_eq!(free[1], vec![pair(6, 14), pair(7, 15)]);
    }

    #[test]
    fn push_rejects_unknown_pairs() {
        let s = two_node_scheduler();
        assert_eq!(
            s.push_core_pairs(&[pair(40, 80)]),
            Err(SchedulerError::InvalidCorePair(40, 80))
        );
    }

    #[test]
    fn pairs_are_conserved() {
        let s = two_node_scheduler();
        let a = s.pop_core_pairs(3).unwrap();
        let b = s.pop_core_pairs(4).unwrap();
        s.push_core_pairs(&a).unwrap();
        s.push_core_pairs(&b).unwrap();
        let total: usize = s.free_pairs().iter().map(|n| n.len()).sum();
        assert_eq!(total, 8);
        // no duplicates
        let mut all: Vec<CorePair> = s.free_pairs().concat();
        all.sort_by_key(|p| (p.physical_core, p.logical_core));
        all.dedup();
        assert_eq!(all.len(), 8);
    }

    #[test]
    fn reserve_removes_specific_pairs() {
        let s = two_node_scheduler();
        s.reserve(&[pair(0, 8), pair(5, 13), pair(40, 80)]);
        assert_eq!(s.pop_core_pairs(2).unwrap(), vec![pair(1, 9), pair(2, 10)]);
        let total: usize = s.free_pairs().iter().map(|n| n.len()).sum();
        assert_eq!(total, 4);
    }
}
