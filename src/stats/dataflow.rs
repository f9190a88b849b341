use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use smallvec::SmallVec;

/// Hazard kinds carried by a single producer -> consumer edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepKind {
    pub raw: bool,
    pub war: bool,
    pub waw: bool,
}

impl DepKind {
    pub const RAW: DepKind = DepKind {
        raw: true,
        war: false,
        waw: false,
    };
    pub const WAR: DepKind = DepKind {
        raw: false,
        war: true,
        waw: false,
    };
    pub const WAW: DepKind = DepKind {
        raw: false,
        war: false,
        waw: true,
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataflowStats {
    pub critical_path_length: u64,
    pub critical_path_instructions: u64,
    pub critical_path_loads: u64,
    pub critical_path_stores: u64,
    pub critical_path_computes: u64,
    pub critical_path_by_opcode: BTreeMap<u32, u64>,
    pub max_parallel_ops: u64,
    pub total_instructions: u64,
    pub true_dependencies: u64,
    pub anti_dependencies: u64,
    pub output_dependencies: u64,
    pub control_dependencies: u64,
    pub memory_dependencies: u64,
    pub total_dependency_edges: u64,
    pub avg_dependency_depth: f64,
    pub max_dependency_depth: u64,
    /// ready-instruction count -> cycles observed at that count
    pub parallelism_histogram: BTreeMap<u64, u64>,
}

impl DataflowStats {
    pub fn record_dependency(&mut self, kind: DepKind) {
        self.total_dependency_edges += 1;
        if kind.raw {
            self.true_dependencies += 1;
        }
        if kind.war {
            self.anti_dependencies += 1;
        }
        if kind.waw {
            self.output_dependencies += 1;
        }
    }

    pub fn record_critical_path_node(&mut self, opcode: u32, is_load: bool, is_store: bool) {
        self.critical_path_instructions += 1;
        *self.critical_path_by_opcode.entry(opcode).or_default() += 1;
        if is_load {
            self.critical_path_loads += 1;
        }
        if is_store {
            self.critical_path_stores += 1;
        }
        if !is_load && !is_store {
            self.critical_path_computes += 1;
        }
    }

    pub fn record_parallelism(&mut self, ready: u64, issued: u64) {
        *self.parallelism_histogram.entry(ready).or_default() += 1;
        self.total_instructions += issued;
        self.max_parallel_ops = self.max_parallel_ops.max(ready);
    }

    /// sum(ready * cycles) / sum(cycles)
    pub fn avg_parallelism(&self) -> f64 {
        let (weighted, cycles) = self
            .parallelism_histogram
            .iter()
            .fold((0u64, 0u64), |(w, c), (&ready, &count)| (w + ready * count, c + count));
        if cycles == 0 {
            return 0.0;
        }
        weighted as f64 / cycles as f64
    }

    pub fn ilp(&self) -> f64 {
        if self.critical_path_length == 0 {
            return 0.0;
        }
        self.total_instructions as f64 / self.critical_path_length as f64
    }
}

/// Producer lists per instruction, used to derive dependency depth and the critical path.
/// Depth of an instruction with no producers is 1.
///
/// `running` is updated edge by edge and is exact when edges arrive producer-first;
/// `depths()` recomputes from the whole graph.
#[derive(Debug, Clone, Default)]
pub struct DepthTracker {
    producers: HashMap<u32, SmallVec<[u32; 4]>>,
    running: HashMap<u32, u64>,
    // running depths only grow, so max and sum are kept incrementally
    running_max: u64,
    running_sum: u64,
}

impl DepthTracker {
    pub fn add_node(&mut self, uid: u32) {
        self.producers.entry(uid).or_default();
        if let Entry::Vacant(slot) = self.running.entry(uid) {
            slot.insert(1);
            self.running_sum += 1;
            self.running_max = self.running_max.max(1);
        }
    }

    /// Returns the consumer's running depth.
    pub fn add_edge(&mut self, producer: u32, consumer: u32) -> u64 {
        self.add_node(producer);
        self.add_node(consumer);
        let list = self.producers.entry(consumer).or_default();
        if !list.contains(&producer) {
            list.push(producer);
        }
        let producer_depth = self.running.get(&producer).copied().unwrap_or(1);
        let depth = self.running.entry(consumer).or_insert(1);
        if producer_depth + 1 > *depth {
            self.running_sum += producer_depth + 1 - *depth;
            *depth = producer_depth + 1;
            self.running_max = self.running_max.max(*depth);
        }
        *depth
    }

    /// (max, average) of the running depths.
    pub fn running_depth(&self) -> (u64, f64) {
        if self.running.is_empty() {
            return (0, 0.0);
        }
        (
            self.running_max,
            self.running_sum as f64 / self.running.len() as f64,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn clear(&mut self) {
        self.producers.clear();
        self.running.clear();
        self.running_max = 0;
        self.running_sum = 0;
    }

    /// Longest-chain depth of every known instruction.  Back edges are ignored.
    pub fn depths(&self) -> HashMap<u32, u64> {
        let mut depth: HashMap<u32, u64> = HashMap::with_capacity(self.producers.len());
        let mut on_stack: HashMap<u32, bool> = HashMap::new();
        let mut roots: Vec<u32> = self.producers.keys().copied().collect();
        roots.sort_unstable();

        for root in roots {
            if depth.contains_key(&root) {
                continue;
            }
            let mut stack = vec![(root, false)];
            while let Some((uid, expanded)) = stack.pop() {
                if expanded {
                    let best = self.producers[&uid]
                        .iter()
                        .filter_map(|p| depth.get(p))
                        .max()
                        .copied()
                        .unwrap_or(0);
                    depth.insert(uid, best + 1);
                    on_stack.insert(uid, false);
                    continue;
                }
                if depth.contains_key(&uid) || on_stack.get(&uid).copied().unwrap_or(false) {
                    continue;
                }
                on_stack.insert(uid, true);
                stack.push((uid, true));
                for &p in &self.producers[&uid] {
                    if !depth.contains_key(&p) && !on_stack.get(&p).copied().unwrap_or(false) {
                        stack.push((p, false));
                    }
                }
            }
        }
        depth
    }

    /// Instructions on one longest chain, producer first.  Ties pick the lowest uid.
    pub fn critical_path(&self, depth: &HashMap<u32, u64>) -> Vec<u32> {
        let Some((&tail, &tail_depth)) = depth
            .iter()
            .max_by(|(ua, da), (ub, db)| da.cmp(db).then(ub.cmp(ua)))
        else {
            return Vec::new();
        };

        let mut path = vec![tail];
        let mut cur = tail;
        let mut cur_depth = tail_depth;
        while cur_depth > 1 {
            let next = self.producers[&cur]
                .iter()
                .copied()
                .filter(|p| depth.get(p) == Some(&(cur_depth - 1)))
                .min();
            match next {
                Some(p) => {
                    path.push(p);
                    cur = p;
                    cur_depth -= 1;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_kinds_count_independently() {
        let mut df = DataflowStats::default();
        df.record_dependency(DepKind::RAW);
        df.record_dependency(DepKind {
            raw: true,
            war: false,
            waw: true,
        });
        df.record_dependency(DepKind::default());
        assert_eq!(3, df.total_dependency_edges);
        assert_eq!(2, df.true_dependencies);
        assert_eq!(1, df.output_dependencies);
        assert_eq!(0, df.anti_dependencies);
    }

    #[test]
    fn parallelism_and_ilp() {
        let mut df = DataflowStats::default();
        df.record_parallelism(4, 2);
        df.record_parallelism(2, 2);
        df.record_parallelism(0, 0);
        assert_eq!(2.0, df.avg_parallelism());
        assert_eq!(4, df.max_parallel_ops);
        assert_eq!(0.0, df.ilp());
        df.critical_path_length = 2;
        assert_eq!(2.0, df.ilp());
    }

    #[test]
    fn critical_path_composition() {
        let mut df = DataflowStats::default();
        df.record_critical_path_node(27, true, false);
        df.record_critical_path_node(13, false, false);
        df.record_critical_path_node(13, false, false);
        df.record_critical_path_node(28, false, true);
        assert_eq!(4, df.critical_path_instructions);
        assert_eq!((1, 1, 2), (df.critical_path_loads, df.critical_path_stores, df.critical_path_computes));
        assert_eq!(Some(&2), df.critical_path_by_opcode.get(&13));
    }

    #[test]
    fn depth_follows_longest_chain() {
        // 1 -> 2 -> 4, 1 -> 3 -> 4 -> 5, 6 alone
        let mut deps = DepthTracker::default();
        deps.add_edge(3, 4);
        deps.add_edge(1, 2);
        deps.add_edge(2, 4);
        deps.add_edge(1, 3);
        deps.add_edge(4, 5);
        deps.add_node(6);
        assert_eq!((4, 13.0 / 6.0), deps.running_depth());
        let depth = deps.depths();
        assert_eq!(1, depth[&1]);
        assert_eq!(3, depth[&4]);
        assert_eq!(4, depth[&5]);
        assert_eq!(1, depth[&6]);
        assert_eq!(vec![1, 2, 4, 5], deps.critical_path(&depth));
    }

    #[test]
    fn running_depth_lags_out_of_order_edges() {
        let mut deps = DepthTracker::default();
        deps.add_edge(2, 3);
        assert_eq!(2, deps.add_edge(1, 2));
        assert_eq!((2, 5.0 / 3.0), deps.running_depth());
        assert_eq!(3, deps.depths()[&3]);
    }

    #[test]
    fn running_depth_tracks_long_chains() {
        let mut deps = DepthTracker::default();
        let n = 20_000u32;
        for uid in 1..n {
            deps.add_edge(uid - 1, uid);
            // fan-in from the root never raises an already deeper node
            deps.add_edge(0, uid);
        }
        let sum: u64 = (1..=n as u64).sum();
        assert_eq!((n as u64, sum as f64 / n as f64), deps.running_depth());

        deps.clear();
        assert_eq!((0, 0.0), deps.running_depth());
        deps.add_node(7);
        assert_eq!((1, 1.0), deps.running_depth());
    }

    #[test]
    fn cycles_do_not_hang() {
        let mut deps = DepthTracker::default();
        deps.add_edge(1, 2);
        deps.add_edge(2, 1);
        let depth = deps.depths();
        assert_eq!(2, depth.len());
        assert!(!deps.critical_path(&depth).is_empty());
    }
}
