//! Host-embedding runner (spec.md §4.4): wraps a [`Simulator`] with named
//! host-visible memory spaces and key/reset/telemetry conveniences,
//! generalized from the teacher's `Apple2Runner`/`Apple2Extension` pattern.
//! Where the teacher hardcoded Apple II/6502 signal names
//! (`ram_addr`, `cpu__addr_reg`, `k`, `speaker`, ...), every signal name here
//! is read once at construction from the IR's [`RunnerDescriptor`], so the
//! same runner serves whatever machine the IR declares.

use std::collections::HashMap;

use crate::error::{RhdlError, Result};
use crate::ir::{MemorySpace, RunnerDescriptor};
use crate::sim::Simulator;

/// What `run_cycles` observed during its run — the generalized form of the
/// teacher's `Apple2RunResult`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTelemetry {
    pub cycles_run: u64,
    pub halted: bool,
    pub text_dirty: bool,
    pub speaker_toggles: u64,
    pub key_cleared: bool,
}

pub struct Runner {
    sim: Simulator,
    descriptor: RunnerDescriptor,
    memory: HashMap<String, Vec<u8>>,
    last_speaker: Option<bool>,
    last_write: HashMap<String, usize>,
}

impl Runner {
    pub fn new(sim: Simulator) -> Result<Self> {
        let descriptor = sim.ir().runner.clone().ok_or_else(|| RhdlError::IrMalformed {
            field: "runner".into(),
            reason: "module has no runner descriptor".into(),
        })?;
        let memory = descriptor
            .memory_spaces
            .iter()
            .map(|m: &MemorySpace| (m.name.clone(), vec![0u8; m.size]))
            .collect();
        Ok(Self {
            sim,
            descriptor,
            memory,
            last_speaker: None,
            last_write: HashMap::new(),
        })
    }

    fn space_mut(&mut self, space: &str) -> Result<&mut Vec<u8>> {
        self.memory.get_mut(space).ok_or_else(|| RhdlError::UnknownMemorySpace(space.to_string()))
    }

    fn space(&self, space: &str) -> Result<&Vec<u8>> {
        self.memory.get(space).ok_or_else(|| RhdlError::UnknownMemorySpace(space.to_string()))
    }

    pub fn load_memory(&mut self, space: &str, offset: usize, bytes: &[u8]) -> Result<()> {
        let buf = self.space_mut(space)?;
        if offset + bytes.len() > buf.len() {
            return Err(RhdlError::LoadOutOfBounds {
                space: space.to_string(),
                offset,
                length: bytes.len(),
                size: buf.len(),
            });
        }
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_memory(&self, space: &str, offset: usize, len: usize) -> Result<&[u8]> {
        let buf = self.space(space)?;
        buf.get(offset..offset + len).ok_or_else(|| RhdlError::LoadOutOfBounds {
            space: space.to_string(),
            offset,
            length: len,
            size: buf.len(),
        })
    }

    pub fn set_reset_vector(&mut self, addr: u64) -> Result<()> {
        let rv = self
            .descriptor
            .reset_vector
            .clone()
            .ok_or(RhdlError::ResetUnavailable)?;
        let bytes: Vec<u8> = (0..rv.width).map(|i| ((addr >> (8 * i)) & 0xff) as u8).collect();
        self.load_memory(&rv.space, rv.offset, &bytes)
    }

    /// Holds the reset signal asserted for `descriptor.reset_cycles()` ticks,
    /// then releases it and lets the design settle for one more tick — the
    /// generalized form of the Apple II runner's reset sequencing.
    pub fn reset(&mut self) -> Result<()> {
        self.sim.reset();
        if let Some(sig) = self.descriptor.reset_signal.clone() {
            self.sim.poke(&sig, 1)?;
            for _ in 0..self.descriptor.reset_cycles() {
                self.sim.tick();
            }
            self.sim.poke(&sig, 0)?;
            self.sim.tick();
        }
        self.last_speaker = None;
        Ok(())
    }

    /// Runs `n` host clock cycles (each possibly `sub_cycles` simulator
    /// ticks), servicing the memory bus every tick and the key-input latch
    /// on demand — the generalized five-step hot path spec.md §4.4
    /// describes for the teacher's Apple II extension:
    /// 1. drive key_code/key_ready if requested,
    /// 2. evaluate the combinational cloud,
    /// 3. mux memory reads/writes across every declared memory space,
    /// 4. tick the clock edge,
    /// 5. collect telemetry (text-dirty, speaker toggle, halt, key-clear).
    pub fn run_cycles(&mut self, n: u64, key_code: Option<u8>, key_ready: bool) -> Result<RunTelemetry> {
        let sub_cycles = self.descriptor.sub_cycles.unwrap_or(1).max(1) as u64;
        let mut telemetry = RunTelemetry::default();
        self.last_write.clear();

        if let (Some(code), Some(sig)) = (key_code, self.descriptor.io.key_in.clone()) {
            self.sim.poke(&sig, code as u64)?;
        }
        if let Some(sig) = self.descriptor.io.key_ready.clone() {
            self.sim.poke(&sig, if key_ready { 1 } else { 0 })?;
        }

        for _ in 0..(n * sub_cycles) {
            self.sim.evaluate();
            self.service_bus()?;
            self.sim.tick();
            telemetry.cycles_run += 1;

            if let Some(sig) = &self.descriptor.io.halt {
                if self.sim.peek(sig)? != 0 {
                    telemetry.halted = true;
                    break;
                }
            }
            if let Some(sig) = &self.descriptor.io.speaker {
                let level = self.sim.peek(sig)? != 0;
                if let Some(prev) = self.last_speaker {
                    if prev != level {
                        telemetry.speaker_toggles += 1;
                    }
                }
                self.last_speaker = Some(level);
            }
            if let Some(region) = &self.descriptor.io.text_dirty_region {
                if self.touched_region(region)? {
                    telemetry.text_dirty = true;
                }
            }
        }

        if let Some(sig) = self.descriptor.io.key_clear.clone() {
            if self.sim.peek(&sig)? != 0 {
                telemetry.key_cleared = true;
                self.sim.poke(self.descriptor.io.key_ready.as_deref().unwrap_or(&sig), 0)?;
            }
        }

        Ok(telemetry)
    }

    /// Reads a named simulator signal directly — the generalized form of the
    /// teacher's `a_debug`/`pc_debug` probe reads (spec.md §4.4 step 3).
    pub fn peek(&self, signal: &str) -> Result<u64> {
        self.sim.peek(signal)
    }

    fn touched_region(&self, region: &crate::ir::TextDirtyRegion) -> Result<bool> {
        let _ = self.space(&region.space)?;
        // Conservative: any write inside the bus-declared text window during
        // this cycle counts as dirty. The bus write is resolved in
        // `service_bus`, which records the last write address per space.
        Ok(self
            .last_write
            .get(&region.space)
            .map(|&addr| addr >= region.start && addr < region.end)
            .unwrap_or(false))
    }

    fn service_bus(&mut self) -> Result<()> {
        let bus = self.descriptor.bus.clone();
        let addr = self.sim.peek(&bus.addr)? as usize;
        let we = self.sim.peek(&bus.we)? != 0;
        let re = self.sim.peek(&bus.re).unwrap_or(0) != 0;

        let space_name = self
            .descriptor
            .memory_spaces
            .iter()
            .find(|m| addr < m.size)
            .map(|m| m.name.clone());
        let Some(space_name) = space_name else {
            return Ok(());
        };

        if we {
            // Guest write: the design drives the write byte onto `data_out`.
            let data = self.sim.peek(&bus.data_out)? as u8;
            self.load_memory(&space_name, addr, &[data])?;
            self.last_write.insert(space_name, addr);
        } else if re || !we {
            // Guest read: the host drives the fetched byte onto `data_in`,
            // modeling memory as a combinational read (spec.md §4.4 step 4).
            let byte = self.read_memory(&space_name, addr, 1)?[0];
            self.sim.poke(&bus.data_in, byte as u64)?;
        }
        Ok(())
    }

    /// Wraps the simulator's own snapshot with the runner's host-side memory
    /// spaces (ROM/RAM content `load_memory` writes), so a restore brings
    /// back everything a guest program needs, not just gate/DFF state.
    pub fn state_snapshot(&self) -> Vec<u8> {
        let sim_blob = self.sim.state_snapshot();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(sim_blob.len() as u32).to_le_bytes());
        buf.extend_from_slice(&sim_blob);

        buf.extend_from_slice(&(self.descriptor.memory_spaces.len() as u32).to_le_bytes());
        for space in &self.descriptor.memory_spaces {
            let bytes = &self.memory[&space.name];
            let name_bytes = space.name.as_bytes();
            buf.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(name_bytes);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        buf
    }

    pub fn state_restore(&mut self, blob: &[u8]) -> Result<()> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
            blob.get(*pos..*pos + n)
                .map(|s| {
                    *pos += n;
                    s
                })
                .ok_or_else(|| RhdlError::SnapshotMismatch("truncated runner snapshot".into()))
        };
        let u32_at = |s: &[u8]| u32::from_le_bytes(s.try_into().unwrap()) as usize;

        let sim_len = u32_at(take(&mut pos, 4)?);
        let sim_blob = take(&mut pos, sim_len)?.to_vec();

        let space_count = u32_at(take(&mut pos, 4)?);
        let mut restored = HashMap::with_capacity(space_count);
        for _ in 0..space_count {
            let name_len = u32_at(take(&mut pos, 4)?);
            let name = String::from_utf8(take(&mut pos, name_len)?.to_vec())
                .map_err(|_| RhdlError::SnapshotMismatch("non-utf8 memory space name".into()))?;
            let data_len = u32_at(take(&mut pos, 4)?);
            let data = take(&mut pos, data_len)?.to_vec();
            restored.insert(name, data);
        }

        self.sim.state_restore(&sim_blob)?;
        self.memory = restored;
        Ok(())
    }
}
