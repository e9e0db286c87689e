//! IR Model: the typed in-memory graph of nets, gates, flip-flops, named
//! port bundles, and the evaluation schedule, plus its canonical JSON form
//! (the backend ABI, spec.md §6).
//!
//! An IR [`Module`] is built once through [`ModuleBuilder`] and is immutable
//! thereafter — a `Simulator` owns one and never mutates it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{InvalidScheduleKind, RhdlError, Result};

/// Dense, non-negative net id. Newtype over `u32` rather than bare `usize` so
/// net/gate/dff indices can't be silently swapped at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DffId(pub u32);

impl NetId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl GateId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Gate kind, matching the wire format's `"type"` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    And,
    Or,
    Xor,
    Not,
    Mux,
    Buf,
    Const,
}

impl GateKind {
    /// Expected input arity, or `None` for `Const` (no inputs, arity checked
    /// specially since zero is also a valid "no constraint" arity elsewhere).
    pub fn arity(self) -> usize {
        match self {
            GateKind::Not | GateKind::Buf => 1,
            GateKind::And | GateKind::Or | GateKind::Xor => 2,
            GateKind::Mux => 3,
            GateKind::Const => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GateKind::And => "and",
            GateKind::Or => "or",
            GateKind::Xor => "xor",
            GateKind::Not => "not",
            GateKind::Mux => "mux",
            GateKind::Buf => "buf",
            GateKind::Const => "const",
        }
    }
}

/// A pure combinational operation. AND/OR/XOR are binary, NOT/BUF unary, MUX
/// ternary `(a, b, sel)`, CONST ignores inputs and broadcasts `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(rename = "type")]
    pub kind: GateKind,
    pub inputs: Vec<NetId>,
    pub output: NetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
}

/// D-type flip-flop. `rst`/`en` are active-high; `async_reset` additionally
/// forces `q <- 0` during `evaluate()` whenever `rst` is asserted (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dff {
    pub d: NetId,
    pub q: NetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rst: Option<NetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en: Option<NetId>,
    #[serde(default)]
    pub async_reset: bool,
}

/// Behavioral RAM primitive (spec.md §4.2): lowering emits this rather than
/// expanding memory cells to gates. `read_before_write` resolves the open
/// question on same-cycle `we`+`re` (SPEC_FULL.md §4.3): `true` means a read
/// at the write address during the same tick observes the pre-write value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub name: String,
    pub size: usize,
    pub addr: NetId,
    pub din: Vec<NetId>,
    pub dout: Vec<NetId>,
    pub we: NetId,
    pub clk: NetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re: Option<NetId>,
    #[serde(default = "default_true")]
    pub read_before_write: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_data: Vec<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Ram,
    Rom,
    BootRom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySpace {
    pub name: String,
    pub size: usize,
    pub kind: MemoryKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextDirtyRegion {
    pub space: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ready: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_clear: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_dirty_region: Option<TextDirtyRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pc_debug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<String>,
}

/// Where `Runner::set_reset_vector` writes the boot address: `width` little
/// -endian bytes at `offset` within the named memory space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetVector {
    pub space: String,
    pub offset: usize,
    pub width: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub addr: String,
    pub data_in: String,
    pub data_out: String,
    pub we: String,
    pub re: String,
}

/// Names the signals the runner layer binds to, plus the host-visible memory
/// layout. Present only for IRs intended for embedded host execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerDescriptor {
    pub kind: String,
    pub memory_spaces: Vec<MemorySpace>,
    #[serde(default)]
    pub io: IoHooks,
    pub bus: Bus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_cycles: Option<u32>,
    /// Resolves the "how many cycles must `reset()` run" open question
    /// (SPEC_FULL.md §4.4); defaults to 2 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_cycles: Option<u32>,
    /// Active-high reset input signal name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_vector: Option<ResetVector>,
}

impl RunnerDescriptor {
    pub fn reset_cycles(&self) -> u32 {
        self.reset_cycles.unwrap_or(2)
    }
}

/// Complete, immutable module IR: the lowering output and the simulator's
/// input. Field names and ordering match the canonical JSON ABI (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub net_count: u32,
    pub gates: Vec<Gate>,
    pub dffs: Vec<Dff>,
    pub inputs: HashMap<String, Vec<NetId>>,
    pub outputs: HashMap<String, Vec<NetId>>,
    pub schedule: Vec<GateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerDescriptor>,
    /// Additional field beyond the required ABI fields (spec.md §6:
    /// "additional fields MUST be ignored" by readers that don't know them).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memories: Vec<Memory>,
}

impl Module {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RhdlError::IrMalformed {
            field: "<module>".into(),
            reason: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut de = serde_json::Deserializer::from_str(json);
        de.disable_recursion_limit();
        let module: Module = serde::Deserialize::deserialize(&mut de).map_err(|e| RhdlError::IrMalformed {
            field: "<module>".into(),
            reason: e.to_string(),
        })?;
        module.validate()?;
        Ok(module)
    }

    /// Re-checks the invariants spec.md §3 demands of every `Module`, used
    /// both after `from_json` (untrusted input) and as a debug check after
    /// lowering.
    pub fn validate(&self) -> Result<()> {
        let in_range = |n: NetId| (n.0 as usize) < self.net_count as usize;

        for gate in &self.gates {
            if !in_range(gate.output) {
                return Err(RhdlError::UnknownNet(gate.output.0));
            }
            for &i in &gate.inputs {
                if !in_range(i) {
                    return Err(RhdlError::UnknownNet(i.0));
                }
            }
            if gate.inputs.len() != gate.kind.arity() {
                return Err(RhdlError::ArityMismatch {
                    kind: gate.kind.name(),
                    expected: gate.kind.arity(),
                    got: gate.inputs.len(),
                });
            }
        }

        for dff in &self.dffs {
            for n in [Some(dff.d), Some(dff.q), dff.rst, dff.en].into_iter().flatten() {
                if !in_range(n) {
                    return Err(RhdlError::UnknownNet(n.0));
                }
            }
        }

        for (_, nets) in self.inputs.iter().chain(self.outputs.iter()) {
            for &n in nets {
                if !in_range(n) {
                    return Err(RhdlError::UnknownNet(n.0));
                }
            }
        }

        // Schedule must be a permutation of exactly the combinational gates.
        let mut seen = vec![false; self.gates.len()];
        if self.schedule.len() != self.gates.len() {
            return Err(RhdlError::InvalidSchedule {
                kind: InvalidScheduleKind::Missing,
            });
        }
        for &g in &self.schedule {
            let idx = g.index();
            if idx >= self.gates.len() {
                return Err(RhdlError::InvalidSchedule {
                    kind: InvalidScheduleKind::Missing,
                });
            }
            if seen[idx] {
                return Err(RhdlError::InvalidSchedule {
                    kind: InvalidScheduleKind::Duplicate,
                });
            }
            seen[idx] = true;
        }

        // Every net has at most one producer across gates and DFFs.
        let mut producer = vec![false; self.net_count as usize];
        for gate in &self.gates {
            let idx = gate.output.index();
            if producer[idx] {
                return Err(RhdlError::DoubleProducer(gate.output.0));
            }
            producer[idx] = true;
        }
        for dff in &self.dffs {
            let idx = dff.q.index();
            if producer[idx] {
                return Err(RhdlError::DoubleProducer(dff.q.0));
            }
            producer[idx] = true;
        }
        for mem in &self.memories {
            for &d in &mem.dout {
                let idx = d.index();
                if producer[idx] {
                    return Err(RhdlError::DoubleProducer(d.0));
                }
                producer[idx] = true;
            }
        }

        Ok(())
    }
}

/// Direction marker used only for the `PortDuplicate` error message.
#[derive(Debug, Clone, Copy)]
enum Direction {
    In,
    Out,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::In => "input",
            Direction::Out => "output",
        }
    }
}

/// Mutable builder for a [`Module`]. Lowering (and tests) construct an IR
/// through this; the finished `Module` is immutable (spec.md §3 lifecycle).
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    name: String,
    net_count: u32,
    gates: Vec<Gate>,
    dffs: Vec<Dff>,
    inputs: HashMap<String, Vec<NetId>>,
    outputs: HashMap<String, Vec<NetId>>,
    schedule: Option<Vec<GateId>>,
    runner: Option<RunnerDescriptor>,
    memories: Vec<Memory>,
    producer: Vec<bool>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn new_net(&mut self) -> NetId {
        let id = NetId(self.net_count);
        self.net_count += 1;
        self.producer.push(false);
        id
    }

    pub fn net_count(&self) -> u32 {
        self.net_count
    }

    fn check_net(&self, n: NetId) -> Result<()> {
        if (n.0 as usize) < self.net_count as usize {
            Ok(())
        } else {
            Err(RhdlError::UnknownNet(n.0))
        }
    }

    fn mark_producer(&mut self, n: NetId) -> Result<()> {
        self.check_net(n)?;
        let idx = n.index();
        if self.producer[idx] {
            return Err(RhdlError::DoubleProducer(n.0));
        }
        self.producer[idx] = true;
        Ok(())
    }

    pub fn add_input(&mut self, name: impl Into<String>, nets: Vec<NetId>) -> Result<()> {
        self.add_port(Direction::In, name, nets)
    }

    pub fn add_output(&mut self, name: impl Into<String>, nets: Vec<NetId>) -> Result<()> {
        self.add_port(Direction::Out, name, nets)
    }

    fn add_port(&mut self, dir: Direction, name: impl Into<String>, nets: Vec<NetId>) -> Result<()> {
        let name = name.into();
        if nets.is_empty() {
            return Err(RhdlError::EmptyPort(name));
        }
        for &n in &nets {
            self.check_net(n)?;
        }
        let map = match dir {
            Direction::In => &mut self.inputs,
            Direction::Out => &mut self.outputs,
        };
        if map.contains_key(&name) {
            return Err(RhdlError::PortDuplicate(name, dir.label()));
        }
        map.insert(name, nets);
        Ok(())
    }

    pub fn add_gate(
        &mut self,
        kind: GateKind,
        inputs: Vec<NetId>,
        output: NetId,
        value: Option<u8>,
    ) -> Result<GateId> {
        if inputs.len() != kind.arity() {
            return Err(RhdlError::ArityMismatch {
                kind: kind.name(),
                expected: kind.arity(),
                got: inputs.len(),
            });
        }
        for &n in &inputs {
            self.check_net(n)?;
        }
        self.mark_producer(output)?;
        let id = GateId(self.gates.len() as u32);
        self.gates.push(Gate {
            kind,
            inputs,
            output,
            value,
        });
        Ok(id)
    }

    pub fn add_dff(
        &mut self,
        d: NetId,
        q: NetId,
        rst: Option<NetId>,
        en: Option<NetId>,
        async_reset: bool,
    ) -> Result<DffId> {
        self.check_net(d)?;
        if let Some(r) = rst {
            self.check_net(r)?;
        }
        if let Some(e) = en {
            self.check_net(e)?;
        }
        self.mark_producer(q)?;
        let id = DffId(self.dffs.len() as u32);
        self.dffs.push(Dff {
            d,
            q,
            rst,
            en,
            async_reset,
        });
        Ok(id)
    }

    pub fn add_memory(&mut self, mem: Memory) -> Result<()> {
        self.check_net(mem.addr)?;
        self.check_net(mem.we)?;
        self.check_net(mem.clk)?;
        for &d in &mem.din {
            self.check_net(d)?;
        }
        for &d in &mem.dout {
            self.mark_producer(d)?;
        }
        self.memories.push(mem);
        Ok(())
    }

    pub fn set_runner(&mut self, runner: RunnerDescriptor) {
        self.runner = Some(runner);
    }

    /// Read-only views used by the lowering pass to compute a schedule and
    /// run dead-net elision before the builder is consumed by [`Self::build`].
    pub fn gates_snapshot(&self) -> Vec<Gate> {
        self.gates.clone()
    }

    pub fn dffs_snapshot(&self) -> Vec<Dff> {
        self.dffs.clone()
    }

    pub fn memories_snapshot(&self) -> Vec<Memory> {
        self.memories.clone()
    }

    /// Keeps only the gates named by `order` (by their current ids), in the
    /// given order, discarding the rest and renumbering what remains —
    /// lowering's dead-net elision pass (spec.md §4.2 step 5) calls this
    /// once it has computed which gates are reachable from an output, a DFF
    /// input, or a memory input. Returns the freshly renumbered schedule.
    pub fn retain_gates(&mut self, order: &[GateId]) -> Vec<GateId> {
        let mut new_gates = Vec::with_capacity(order.len());
        for &old_id in order {
            new_gates.push(self.gates[old_id.index()].clone());
        }
        self.gates = new_gates;
        (0..order.len() as u32).map(GateId).collect()
    }

    /// Validates `ids` is a permutation of all combinational gates respecting
    /// data dependencies, else rejects with `InvalidSchedule` (spec.md §4.1).
    pub fn set_schedule(&mut self, ids: Vec<GateId>) -> Result<()> {
        if ids.len() != self.gates.len() {
            return Err(RhdlError::InvalidSchedule {
                kind: InvalidScheduleKind::Missing,
            });
        }
        let mut seen = vec![false; self.gates.len()];
        let mut position = vec![0usize; self.gates.len()];
        for (pos, &g) in ids.iter().enumerate() {
            let idx = g.index();
            if idx >= self.gates.len() {
                return Err(RhdlError::InvalidSchedule {
                    kind: InvalidScheduleKind::Missing,
                });
            }
            if seen[idx] {
                return Err(RhdlError::InvalidSchedule {
                    kind: InvalidScheduleKind::Duplicate,
                });
            }
            seen[idx] = true;
            position[idx] = pos;
        }

        // net -> gate that produces it, to check dependency ordering.
        let mut net_producer_gate: HashMap<u32, usize> = HashMap::new();
        for (idx, gate) in self.gates.iter().enumerate() {
            net_producer_gate.insert(gate.output.0, idx);
        }
        for (idx, gate) in self.gates.iter().enumerate() {
            for &input in &gate.inputs {
                if let Some(&producer_idx) = net_producer_gate.get(&input.0) {
                    if producer_idx != idx && position[producer_idx] >= position[idx] {
                        return Err(RhdlError::InvalidSchedule {
                            kind: InvalidScheduleKind::Cycle,
                        });
                    }
                }
            }
        }

        self.schedule = Some(ids);
        Ok(())
    }

    pub fn build(self) -> Result<Module> {
        let schedule = self.schedule.ok_or(RhdlError::InvalidSchedule {
            kind: InvalidScheduleKind::Missing,
        })?;
        let module = Module {
            name: self.name,
            net_count: self.net_count,
            gates: self.gates,
            dffs: self.dffs,
            inputs: self.inputs,
            outputs: self.outputs,
            schedule,
            runner: self.runner,
            memories: self.memories,
        };
        module.validate()?;
        Ok(module)
    }
}
