//! Gate-level interpreter backend: a dispatch loop over the schedule-ordered
//! gate list operating on lane-packed `u64` net words (spec.md §4.3). Always
//! available — every other backend falls back to this one.

use crate::error::{RhdlError, Result};
use crate::ir::{GateKind, Module};
use crate::sim::Features;

pub struct InterpretSim {
    ir: Module,
    lanes: u8,
    lane_mask: u64,
    strict_poke: bool,
    nets: Vec<u64>,
    dff_q: Vec<u64>,
    memories: Vec<Vec<u64>>,
    driven: Vec<bool>,
}

impl InterpretSim {
    pub fn new(ir: Module, lanes: u8, strict_poke: bool) -> Result<Self> {
        let lanes = lanes.max(1).min(64);
        let lane_mask = if lanes == 64 { u64::MAX } else { (1u64 << lanes) - 1 };
        let net_count = ir.net_count as usize;

        let mut driven = vec![false; net_count];
        for g in &ir.gates {
            driven[g.output.index()] = true;
        }
        for d in &ir.dffs {
            driven[d.q.index()] = true;
        }
        for m in &ir.memories {
            for &d in &m.dout {
                driven[d.index()] = true;
            }
        }

        let dff_q = vec![0u64; ir.dffs.len()];
        let memories = ir
            .memories
            .iter()
            .map(|m| {
                let mut words = vec![0u64; m.size];
                for (i, &v) in m.initial_data.iter().enumerate().take(m.size) {
                    words[i] = v;
                }
                words
            })
            .collect();

        let mut sim = Self {
            ir,
            lanes,
            lane_mask,
            strict_poke,
            nets: vec![0u64; net_count],
            dff_q,
            memories,
            driven,
        };
        sim.seed_dff_nets();
        sim.evaluate();
        Ok(sim)
    }

    fn seed_dff_nets(&mut self) {
        for (i, d) in self.ir.dffs.iter().enumerate() {
            self.nets[d.q.index()] = self.dff_q[i];
        }
    }

    pub fn ir(&self) -> &Module {
        &self.ir
    }

    pub fn features(&self) -> Features {
        Features {
            max_lanes: 64,
            supports_snapshot: true,
        }
    }

    fn resolve_port(&self, name: &str) -> Result<&[crate::ir::NetId]> {
        self.ir
            .inputs
            .get(name)
            .or_else(|| self.ir.outputs.get(name))
            .map(|v| v.as_slice())
            .ok_or_else(|| RhdlError::UnknownPort(name.to_string()))
    }

    pub fn poke(&mut self, port: &str, value: u64) -> Result<()> {
        let nets = self.resolve_port(port)?.to_vec();
        if nets.len() < 64 && value >> nets.len() != 0 {
            return Err(RhdlError::PokeOutOfRange {
                port: port.to_string(),
                got: value,
                width: nets.len(),
            });
        }
        for (i, &n) in nets.iter().enumerate() {
            if self.driven[n.index()] {
                if self.strict_poke {
                    return Err(RhdlError::PokeOnDrivenNet(port.to_string()));
                }
                tracing::warn!(port, net = n.0, "poke overriding a gate/dff-driven net");
            }
            let bit = (value >> i) & 1;
            self.nets[n.index()] = if bit == 1 { self.lane_mask } else { 0 };
        }
        Ok(())
    }

    pub fn peek(&self, port: &str) -> Result<u64> {
        let nets = self.resolve_port(port)?;
        let mut v: u64 = 0;
        for (i, &n) in nets.iter().enumerate() {
            if i >= 64 {
                break;
            }
            let bit = if self.nets[n.index()] & self.lane_mask == self.lane_mask { 1 } else { 0 };
            v |= bit << i;
        }
        Ok(v)
    }

    /// Per-lane poke: `values[lane]` is the port's value in that lane, letting
    /// each simulation lane carry an independent test vector instead of the
    /// lane-broadcast value [`Self::poke`] sets (spec.md §4.3's "lane
    /// independence" requirement).
    pub fn poke_lanes(&mut self, port: &str, values: &[u64]) -> Result<()> {
        if values.len() != self.lanes as usize {
            return Err(RhdlError::LaneCountMismatch {
                port: port.to_string(),
                expected: self.lanes,
                got: values.len(),
            });
        }
        let nets = self.resolve_port(port)?.to_vec();
        for (bit_i, &n) in nets.iter().enumerate() {
            if self.driven[n.index()] {
                if self.strict_poke {
                    return Err(RhdlError::PokeOnDrivenNet(port.to_string()));
                }
                tracing::warn!(port, net = n.0, "poke overriding a gate/dff-driven net");
            }
            let mut word = 0u64;
            for (lane, &value) in values.iter().enumerate() {
                if bit_i < 64 && (value >> bit_i) & 1 == 1 {
                    word |= 1 << lane;
                }
            }
            self.nets[n.index()] = word & self.lane_mask;
        }
        Ok(())
    }

    /// Per-lane peek: returns the port's value in every lane independently,
    /// the inverse of [`Self::poke_lanes`].
    pub fn peek_lanes(&self, port: &str) -> Result<Vec<u64>> {
        let nets = self.resolve_port(port)?;
        let mut out = vec![0u64; self.lanes as usize];
        for (bit_i, &n) in nets.iter().enumerate() {
            if bit_i >= 64 {
                break;
            }
            let word = self.nets[n.index()];
            for (lane_idx, slot) in out.iter_mut().enumerate() {
                if (word >> lane_idx) & 1 == 1 {
                    *slot |= 1 << bit_i;
                }
            }
        }
        Ok(out)
    }

    /// Combinational settle: runs the schedule once, then forces every
    /// asynchronously-reset DFF's `q` net to 0 while `rst` is asserted
    /// (spec.md §3's async-reset-during-evaluate rule).
    pub fn evaluate(&mut self) {
        self.gate_loop();
        self.post_evaluate_tail();
    }

    /// Runs a Cranelift-compiled version of the gate loop in place of
    /// [`Self::gate_loop`], then the same memory/async-reset tail every
    /// backend shares — lets the JIT backend reuse this state machine
    /// instead of re-implementing DFF/memory handling.
    pub(crate) fn run_compiled_evaluate(&mut self, f: unsafe extern "C" fn(*mut u64, u64)) {
        unsafe { f(self.nets.as_mut_ptr(), self.lane_mask) };
        self.post_evaluate_tail();
    }

    fn gate_loop(&mut self) {
        for &gid in &self.ir.schedule {
            let g = &self.ir.gates[gid.index()];
            let v: u64 = match g.kind {
                GateKind::And => self.nets[g.inputs[0].index()] & self.nets[g.inputs[1].index()],
                GateKind::Or => self.nets[g.inputs[0].index()] | self.nets[g.inputs[1].index()],
                GateKind::Xor => self.nets[g.inputs[0].index()] ^ self.nets[g.inputs[1].index()],
                GateKind::Not => !self.nets[g.inputs[0].index()] & self.lane_mask,
                GateKind::Buf => self.nets[g.inputs[0].index()],
                GateKind::Mux => {
                    let a = self.nets[g.inputs[0].index()];
                    let b = self.nets[g.inputs[1].index()];
                    let sel = self.nets[g.inputs[2].index()];
                    (a & !sel) | (b & sel) & self.lane_mask
                }
                GateKind::Const => {
                    if g.value.unwrap_or(0) != 0 {
                        self.lane_mask
                    } else {
                        0
                    }
                }
            };
            self.nets[g.output.index()] = v & self.lane_mask;
        }
    }

    fn post_evaluate_tail(&mut self) {
        for (mi, mem) in self.ir.memories.iter().enumerate() {
            let addr = (self.nets[mem.addr.index()] & self.lane_mask) as usize;
            let words = &self.memories[mi];
            let v = words.get(addr % words.len().max(1)).copied().unwrap_or(0);
            for (i, &d) in mem.dout.iter().enumerate() {
                let bit = (v >> i) & 1;
                self.nets[d.index()] = if bit == 1 { self.lane_mask } else { 0 };
            }
        }

        for d in &self.ir.dffs {
            if d.async_reset {
                if let Some(rst) = d.rst {
                    let asserted = self.nets[rst.index()] & self.lane_mask == self.lane_mask;
                    if asserted {
                        self.nets[d.q.index()] = 0;
                    }
                }
            }
        }
    }

    /// Clock edge: sample every DFF's next `q` from the settled combinational
    /// state, then commit all of them atomically (spec.md §3's "DFF
    /// sample-then-update" invariant — no DFF's new `q` is visible to any
    /// other DFF's `d` logic during the same edge).
    pub fn tick(&mut self) {
        let mut next_q = vec![0u64; self.ir.dffs.len()];
        for (i, d) in self.ir.dffs.iter().enumerate() {
            let rst_asserted = d.rst.map(|r| self.nets[r.index()] & self.lane_mask == self.lane_mask).unwrap_or(false);
            let en_asserted = d.en.map(|e| self.nets[e.index()] & self.lane_mask == self.lane_mask).unwrap_or(true);
            next_q[i] = if rst_asserted {
                0
            } else if en_asserted {
                self.nets[d.d.index()]
            } else {
                self.dff_q[i]
            };
        }

        for (mi, mem) in self.ir.memories.iter().enumerate() {
            let addr = (self.nets[mem.addr.index()] & self.lane_mask) as usize;
            let we = self.nets[mem.we.index()] & self.lane_mask == self.lane_mask;
            if !we {
                continue;
            }
            let mut v: u64 = 0;
            for (i, &d) in mem.din.iter().enumerate() {
                let bit = if self.nets[d.index()] & self.lane_mask == self.lane_mask { 1 } else { 0 };
                v |= bit << i;
            }
            let words = &mut self.memories[mi];
            let len = words.len().max(1);
            words[addr % len] = v;
        }

        self.dff_q = next_q;
        self.seed_dff_nets();
        self.evaluate();
    }

    /// Clears every net and register to 0. Memories are externally loaded
    /// and survive `reset()` untouched (spec.md §4.3).
    pub fn reset(&mut self) {
        self.dff_q.iter_mut().for_each(|q| *q = 0);
        self.seed_dff_nets();
        self.evaluate();
    }

    pub fn state_snapshot(&self) -> Vec<u8> {
        crate::snapshot::encode(&self.ir, self.lanes, &self.nets, &self.dff_q, &self.memories)
    }

    pub fn state_restore(&mut self, blob: &[u8]) -> Result<()> {
        let (nets, dff_q, memories) = crate::snapshot::decode(&self.ir, self.lanes, blob)?;
        self.nets = nets;
        self.dff_q = dff_q;
        self.memories = memories;
        Ok(())
    }
}
