//! Backend dispatch (spec.md §4.5): a single enum-dispatched [`Simulator`]
//! facade over the interpreter, JIT, and AOT-compile backends. No trait
//! object — matching the teacher's avoidance of virtual dispatch per gate.

pub mod interpret;
#[cfg(feature = "compile")]
pub mod compile;
#[cfg(feature = "jit")]
pub mod jit;

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::error::Result;
use crate::ir::Module;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Interpret,
    Jit,
    Compile,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Interpret => "interpret",
            BackendKind::Jit => "jit",
            BackendKind::Compile => "compile",
        }
    }
}

/// Construction-time configuration (SPEC_FULL.md §2's "configuration
/// surface" — plain fields set by the embedding front-end, not parsed from
/// environment or file).
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub backend: BackendKind,
    /// Number of parallel simulation lanes packed into each `u64` net word.
    pub lanes: u8,
    /// If the requested backend can't be built (missing feature, codegen
    /// failure) and this is `true`, fall back to the interpreter rather than
    /// returning `BackendUnavailable`.
    pub allow_fallback: bool,
    /// Rejects pokes onto gate/DFF-driven nets instead of clamping+warning.
    pub strict_poke: bool,
    /// Disables dead-net elision during lowering so every signal stays
    /// observable. Simulators don't consume this directly; it's threaded
    /// through from lowering and kept here so one options struct configures
    /// the whole pipeline.
    pub preserve_all: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::Interpret,
            lanes: 1,
            allow_fallback: true,
            strict_poke: false,
            preserve_all: false,
        }
    }
}

/// What a backend supports, surfaced so callers can probe before relying on
/// a capability (e.g. snapshotting during a JIT run).
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub max_lanes: u8,
    pub supports_snapshot: bool,
}

fn content_hash(ir: &Module) -> Result<u64> {
    let json = ir.to_json()?;
    let mut h = DefaultHasher::new();
    json.hash(&mut h);
    Ok(h.finish())
}

#[cfg(feature = "jit")]
static JIT_CACHE: Mutex<Option<HashMap<u64, std::sync::Arc<jit::CompiledFns>>>> = Mutex::new(None);
#[cfg(feature = "compile")]
static COMPILE_CACHE: Mutex<Option<HashMap<u64, std::sync::Arc<compile::CompiledLib>>>> = Mutex::new(None);

/// Enum-dispatched simulator facade (spec.md §4.5). Every inherent method
/// matches on `self` once, not once per gate.
pub enum Simulator {
    Interpret(interpret::InterpretSim),
    #[cfg(feature = "jit")]
    Jit(jit::JitSim),
    #[cfg(feature = "compile")]
    Compile(compile::CompileSim),
}

impl Simulator {
    #[tracing::instrument(skip(ir), fields(module = %ir.name))]
    pub fn new(ir: Module, opts: SimOptions) -> Result<Self> {
        ir.validate()?;
        match opts.backend {
            BackendKind::Interpret => Ok(Simulator::Interpret(interpret::InterpretSim::new(ir, opts.lanes, opts.strict_poke)?)),
            BackendKind::Jit => Self::build_jit(ir, opts),
            BackendKind::Compile => Self::build_compile(ir, opts),
        }
    }

    #[cfg(feature = "jit")]
    fn build_jit(ir: Module, opts: SimOptions) -> Result<Self> {
        let hash = content_hash(&ir)?;
        let compiled = {
            let mut guard = JIT_CACHE.lock().expect("jit cache poisoned");
            let cache = guard.get_or_insert_with(HashMap::new);
            if let Some(c) = cache.get(&hash) {
                c.clone()
            } else {
                let c = std::sync::Arc::new(jit::compile(&ir)?);
                cache.insert(hash, c.clone());
                c
            }
        };
        let fallback_ir = ir.clone();
        match jit::JitSim::new(ir, compiled, opts.lanes, opts.strict_poke) {
            Ok(s) => Ok(Simulator::Jit(s)),
            Err(e) if opts.allow_fallback => {
                tracing::warn!(error = %e, "jit backend unavailable, falling back to interpreter");
                Ok(Simulator::Interpret(interpret::InterpretSim::new(fallback_ir, opts.lanes, opts.strict_poke)?))
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(not(feature = "jit"))]
    fn build_jit(ir: Module, opts: SimOptions) -> Result<Self> {
        if opts.allow_fallback {
            tracing::warn!("jit feature not compiled in, falling back to interpreter");
            Ok(Simulator::Interpret(interpret::InterpretSim::new(ir, opts.lanes, opts.strict_poke)?))
        } else {
            Err(RhdlError::BackendUnavailable("jit"))
        }
    }

    #[cfg(feature = "compile")]
    fn build_compile(ir: Module, opts: SimOptions) -> Result<Self> {
        let hash = content_hash(&ir)?;
        let compiled = {
            let mut guard = COMPILE_CACHE.lock().expect("compile cache poisoned");
            let cache = guard.get_or_insert_with(HashMap::new);
            if let Some(c) = cache.get(&hash) {
                c.clone()
            } else {
                let c = std::sync::Arc::new(compile::compile(&ir)?);
                cache.insert(hash, c.clone());
                c
            }
        };
        let fallback_ir = ir.clone();
        match compile::CompileSim::new(ir, compiled, opts.lanes, opts.strict_poke) {
            Ok(s) => Ok(Simulator::Compile(s)),
            Err(e) if opts.allow_fallback => {
                tracing::warn!(error = %e, "compile backend unavailable, falling back to interpreter");
                Ok(Simulator::Interpret(interpret::InterpretSim::new(fallback_ir, opts.lanes, opts.strict_poke)?))
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(not(feature = "compile"))]
    fn build_compile(ir: Module, opts: SimOptions) -> Result<Self> {
        if opts.allow_fallback {
            tracing::warn!("compile feature not compiled in, falling back to interpreter");
            Ok(Simulator::Interpret(interpret::InterpretSim::new(ir, opts.lanes, opts.strict_poke)?))
        } else {
            Err(RhdlError::BackendUnavailable("compile"))
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Simulator::Interpret(_) => BackendKind::Interpret,
            #[cfg(feature = "jit")]
            Simulator::Jit(_) => BackendKind::Jit,
            #[cfg(feature = "compile")]
            Simulator::Compile(_) => BackendKind::Compile,
        }
    }

    pub fn features(&self) -> Features {
        match self {
            Simulator::Interpret(s) => s.features(),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.features(),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.features(),
        }
    }

    pub fn ir(&self) -> &Module {
        match self {
            Simulator::Interpret(s) => s.ir(),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.ir(),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.ir(),
        }
    }

    pub fn poke(&mut self, port: &str, value: u64) -> Result<()> {
        match self {
            Simulator::Interpret(s) => s.poke(port, value),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.poke(port, value),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.poke(port, value),
        }
    }

    pub fn peek(&self, port: &str) -> Result<u64> {
        match self {
            Simulator::Interpret(s) => s.peek(port),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.peek(port),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.peek(port),
        }
    }

    /// Per-lane poke: `values[lane]` is this port's value in that lane.
    pub fn poke_lanes(&mut self, port: &str, values: &[u64]) -> Result<()> {
        match self {
            Simulator::Interpret(s) => s.poke_lanes(port, values),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.poke_lanes(port, values),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.poke_lanes(port, values),
        }
    }

    /// Per-lane peek: returns this port's value in every lane independently.
    pub fn peek_lanes(&self, port: &str) -> Result<Vec<u64>> {
        match self {
            Simulator::Interpret(s) => s.peek_lanes(port),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.peek_lanes(port),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.peek_lanes(port),
        }
    }

    pub fn evaluate(&mut self) {
        match self {
            Simulator::Interpret(s) => s.evaluate(),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.evaluate(),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.evaluate(),
        }
    }

    pub fn tick(&mut self) {
        match self {
            Simulator::Interpret(s) => s.tick(),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.tick(),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.tick(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Simulator::Interpret(s) => s.reset(),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.reset(),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.reset(),
        }
    }

    pub fn state_snapshot(&self) -> Vec<u8> {
        match self {
            Simulator::Interpret(s) => s.state_snapshot(),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.state_snapshot(),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.state_snapshot(),
        }
    }

    pub fn state_restore(&mut self, blob: &[u8]) -> Result<()> {
        match self {
            Simulator::Interpret(s) => s.state_restore(blob),
            #[cfg(feature = "jit")]
            Simulator::Jit(s) => s.state_restore(blob),
            #[cfg(feature = "compile")]
            Simulator::Compile(s) => s.state_restore(blob),
        }
    }
}

// SAFETY: no interior mutability is exposed by any backend; all mutation
// requires `&mut self`, so moving a `Simulator` across threads is sound even
// though it isn't `Sync`.
unsafe impl Send for Simulator {}
