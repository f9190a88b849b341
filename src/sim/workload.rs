use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use log::info;
use phf::phf_map;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::stats::types::{FuType, MemClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    pub id: u32,
    pub fu: FuType,
}

const fn op(id: u32, fu: FuType) -> OpcodeInfo {
    OpcodeInfo { id, fu }
}

/// IR opcode name -> numeric id and the FU class that executes it.
static OPCODES: phf::Map<&'static str, OpcodeInfo> = phf_map! {
    "ret" => op(1, FuType::ZeroCycle),
    "br" => op(2, FuType::ZeroCycle),
    "add" => op(13, FuType::IntAddSub),
    "fadd" => op(14, FuType::FpFloatAddSub),
    "sub" => op(15, FuType::IntAddSub),
    "fsub" => op(16, FuType::FpFloatAddSub),
    "mul" => op(17, FuType::IntMulDiv),
    "fmul" => op(18, FuType::FpFloatMulDiv),
    "udiv" => op(19, FuType::IntMulDiv),
    "sdiv" => op(20, FuType::IntMulDiv),
    "fdiv" => op(21, FuType::FpFloatMulDiv),
    "urem" => op(22, FuType::IntMulDiv),
    "srem" => op(23, FuType::IntMulDiv),
    "frem" => op(24, FuType::FpFloatMulDiv),
    "shl" => op(25, FuType::IntShift),
    "lshr" => op(26, FuType::IntShift),
    "ashr" => op(27, FuType::IntShift),
    "and" => op(28, FuType::IntBitwise),
    "or" => op(29, FuType::IntBitwise),
    "xor" => op(30, FuType::IntBitwise),
    "load" => op(32, FuType::Other),
    "store" => op(33, FuType::Other),
    "getelementptr" => op(34, FuType::Gep),
    "gep" => op(34, FuType::Gep),
    "trunc" => op(38, FuType::Conversion),
    "zext" => op(39, FuType::Conversion),
    "sext" => op(40, FuType::Conversion),
    "fptoui" => op(41, FuType::Conversion),
    "fptosi" => op(42, FuType::Conversion),
    "uitofp" => op(43, FuType::Conversion),
    "sitofp" => op(44, FuType::Conversion),
    "fptrunc" => op(45, FuType::Conversion),
    "fpext" => op(46, FuType::Conversion),
    "bitcast" => op(49, FuType::ZeroCycle),
    "icmp" => op(53, FuType::IntAddSub),
    "fcmp" => op(54, FuType::FpFloatAddSub),
    "phi" => op(55, FuType::ZeroCycle),
    "select" => op(57, FuType::IntBitwise),
    "counter" => op(100, FuType::Counter),
    "dadd" => op(101, FuType::FpDoubleAddSub),
    "dmul" => op(102, FuType::FpDoubleMulDiv),
};

pub fn opcode_info(name: &str) -> OpcodeInfo {
    OPCODES.get(name).copied().unwrap_or(op(0, FuType::Other))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemOp {
    pub is_write: bool,
    pub address: u64,
    pub size: u32,
    #[serde(default)]
    pub class: MemClass,
}

/// One operation of the dependency graph.  `deps` are the uids whose results it reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub uid: u32,
    pub opcode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fu: Option<FuType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<u32>,
    #[serde(default)]
    pub deps: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<MemOp>,
}

impl Node {
    pub fn compute(uid: u32, opcode: &str, deps: Vec<u32>) -> Self {
        Self {
            uid,
            opcode: opcode.to_string(),
            fu: None,
            latency: None,
            deps,
            mem: None,
        }
    }

    pub fn memory(uid: u32, mem: MemOp, deps: Vec<u32>) -> Self {
        Self {
            uid,
            opcode: if mem.is_write { "store" } else { "load" }.to_string(),
            fu: None,
            latency: None,
            deps,
            mem: Some(mem),
        }
    }

    pub fn opcode_id(&self) -> u32 {
        opcode_info(&self.opcode).id
    }

    pub fn fu_type(&self) -> FuType {
        self.fu.unwrap_or_else(|| opcode_info(&self.opcode).fu)
    }

    /// Cycles the node occupies its functional unit.
    pub fn latency(&self) -> u32 {
        self.latency.unwrap_or_else(|| self.fu_type().default_latency())
    }

    pub fn is_load(&self) -> bool {
        self.mem.is_some_and(|m| !m.is_write)
    }

    pub fn is_store(&self) -> bool {
        self.mem.is_some_and(|m| m.is_write)
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WorkloadFile {
    #[serde(rename = "node", default)]
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workload {
    pub nodes: Vec<Node>,
}

impl Workload {
    /// Nodes are kept in uid order.
    pub fn new(mut nodes: Vec<Node>) -> Result<Self, anyhow::Error> {
        nodes.sort_by_key(|n| n.uid);
        let workload = Self { nodes };
        workload.validate()?;
        Ok(workload)
    }

    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read workload {}", path.display()))?;
        let file: WorkloadFile = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&text).with_context(|| format!("malformed workload {}", path.display()))?
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("malformed workload {}", path.display()))?
        };
        let workload = Self::new(file.nodes)?;
        info!("loaded {} nodes from {}", workload.nodes.len(), path.display());
        Ok(workload)
    }

    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        let file = WorkloadFile {
            nodes: self.nodes.clone(),
        };
        let text = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::to_string_pretty(&file)?
        } else {
            serde_json::to_string_pretty(&file)?
        };
        fs::write(path, text).with_context(|| format!("cannot write workload {}", path.display()))
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.uid) {
                bail!("duplicate node uid {}", node.uid);
            }
        }
        for node in &self.nodes {
            for dep in &node.deps {
                if *dep == node.uid {
                    bail!("node {} depends on itself", node.uid);
                }
                if !seen.contains(dep) {
                    bail!("node {} depends on unknown uid {}", node.uid, dep);
                }
            }
            if let Some(mem) = node.mem {
                if mem.size == 0 {
                    bail!("node {} has a zero-sized memory access", node.uid);
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), anyhow::Error> {
        let index: HashMap<u32, usize> =
            self.nodes.iter().enumerate().map(|(i, n)| (n.uid, i)).collect();
        let mut consumers = vec![Vec::new(); self.nodes.len()];
        let mut indegree = vec![0usize; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.deps {
                consumers[index[dep]].push(i);
                indegree[i] += 1;
            }
        }

        let mut ready: Vec<usize> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = ready.pop() {
            visited += 1;
            for &c in &consumers[i] {
                indegree[c] -= 1;
                if indegree[c] == 0 {
                    ready.push(c);
                }
            }
        }
        if visited != self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .zip(&indegree)
                .find(|(_, &d)| d > 0)
                .map_or(0, |(n, _)| n.uid);
            bail!("dependency cycle through node {}", stuck);
        }
        Ok(())
    }

    /// Random DAG of loads feeding compute feeding stores.  Addresses are `size`-aligned and
    /// fall inside `[base, base + span)`.
    pub fn synthetic(count: usize, seed: u64, base: u64, span: u64) -> Self {
        const COMPUTE: &[&str] = &[
            "add", "sub", "mul", "fadd", "fmul", "shl", "and", "getelementptr", "sitofp", "dmul",
        ];
        let mut rng = StdRng::seed_from_u64(seed);
        let count = count.max(3);
        let loads = (count / 4).max(1);
        let stores = (count / 8).max(1);
        let slots = (span / 8).max(1);

        let mut nodes = Vec::with_capacity(count);
        for uid in 0..count as u32 {
            let i = uid as usize;
            let node = if i < loads {
                let class = match rng.gen_range(0..10) {
                    0 => MemClass::Dma,
                    1..=3 => MemClass::Cache,
                    _ => MemClass::Spm,
                };
                let mem = MemOp {
                    is_write: false,
                    address: base + rng.gen_range(0..slots) * 8,
                    size: if rng.gen_bool(0.5) { 4 } else { 8 },
                    class,
                };
                Node::memory(uid, mem, Vec::new())
            } else if i >= count - stores {
                let mem = MemOp {
                    is_write: true,
                    address: base + rng.gen_range(0..slots) * 8,
                    size: 8,
                    class: if rng.gen_bool(0.25) { MemClass::Cache } else { MemClass::Spm },
                };
                let src = rng.gen_range(loads..count - stores) as u32;
                Node::memory(uid, mem, vec![src])
            } else {
                let opcode = COMPUTE[rng.gen_range(0..COMPUTE.len())];
                let mut deps = vec![rng.gen_range(0..uid)];
                if rng.gen_bool(0.5) {
                    let other = rng.gen_range(0..uid);
                    if !deps.contains(&other) {
                        deps.push(other);
                    }
                }
                Node::compute(uid, opcode, deps)
            };
            nodes.push(node);
        }
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
