//! Persisted simulator state: a little-endian binary blob carrying every net,
//! DFF, and memory word, guarded by a magic tag and the IR's content hash so
//! a snapshot can never be silently replayed against the wrong module
//! (spec.md §6).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{RhdlError, Result};
use crate::ir::Module;

const MAGIC: &[u8; 6] = b"RHDL01";

/// 16-byte content hash: two `DefaultHasher` passes over the same JSON bytes
/// with different seeds, concatenated. `DefaultHasher` only yields 64 bits
/// per instance, so two independently-seeded instances are combined to reach
/// the 16-byte width spec.md §6 specifies without pulling in a cryptographic
/// hash crate (SPEC_FULL.md §5).
fn ir_hash(ir: &Module) -> [u8; 16] {
    let json = ir.to_json().unwrap_or_default();
    let mut h1 = DefaultHasher::new();
    json.hash(&mut h1);
    let mut h2 = DefaultHasher::new();
    0xa5a5_a5a5_a5a5_a5a5u64.hash(&mut h2);
    json.hash(&mut h2);

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&h1.finish().to_le_bytes());
    out[8..].copy_from_slice(&h2.finish().to_le_bytes());
    out
}

pub fn encode(ir: &Module, lanes: u8, nets: &[u64], dff_q: &[u64], memories: &[Vec<u64>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&ir_hash(ir));
    buf.extend_from_slice(&(lanes as u16).to_le_bytes());

    buf.extend_from_slice(&(nets.len() as u32).to_le_bytes());
    for &n in nets {
        buf.extend_from_slice(&n.to_le_bytes());
    }

    buf.extend_from_slice(&(dff_q.len() as u32).to_le_bytes());
    for &q in dff_q {
        buf.extend_from_slice(&q.to_le_bytes());
    }

    buf.extend_from_slice(&(memories.len() as u32).to_le_bytes());
    for words in memories {
        buf.extend_from_slice(&(words.len() as u32).to_le_bytes());
        for &w in words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
    }

    buf
}

pub fn decode(ir: &Module, lanes: u8, blob: &[u8]) -> Result<(Vec<u64>, Vec<u64>, Vec<Vec<u64>>)> {
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        let slice = blob.get(*pos..*pos + n).ok_or_else(|| RhdlError::SnapshotMismatch("truncated snapshot".into()))?;
        *pos += n;
        Ok(slice)
    };

    if take(&mut pos, 6)? != MAGIC {
        return Err(RhdlError::SnapshotMismatch("bad magic".into()));
    }
    let hash: [u8; 16] = take(&mut pos, 16)?.try_into().unwrap();
    if hash != ir_hash(ir) {
        return Err(RhdlError::SnapshotMismatch("IR content hash mismatch".into()));
    }
    let snap_lanes = u16::from_le_bytes(take(&mut pos, 2)?.try_into().unwrap());
    if snap_lanes as u8 != lanes {
        return Err(RhdlError::SnapshotMismatch(format!("lane count mismatch: snapshot has {snap_lanes}, simulator has {lanes}")));
    }

    let net_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
    if net_count != ir.net_count as usize {
        return Err(RhdlError::SnapshotMismatch("net count mismatch".into()));
    }
    let mut nets = Vec::with_capacity(net_count);
    for _ in 0..net_count {
        nets.push(u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()));
    }

    let dff_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
    if dff_count != ir.dffs.len() {
        return Err(RhdlError::SnapshotMismatch("dff count mismatch".into()));
    }
    let mut dff_q = Vec::with_capacity(dff_count);
    for _ in 0..dff_count {
        dff_q.push(u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()));
    }

    let mem_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
    if mem_count != ir.memories.len() {
        return Err(RhdlError::SnapshotMismatch("memory count mismatch".into()));
    }
    let mut memories = Vec::with_capacity(mem_count);
    for _ in 0..mem_count {
        let len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
        let mut words = Vec::with_capacity(len);
        for _ in 0..len {
            words.push(u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()));
        }
        memories.push(words);
    }

    Ok((nets, dff_q, memories))
}
