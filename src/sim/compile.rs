//! AOT "compile" backend: emits the schedule-ordered gate loop as literal
//! Rust source, shells out to `rustc` for a `cdylib`, and `dlopen`s it via
//! `libloading` — generalized from the teacher's netlist AOT compiler. The
//! emitted function has the exact same signature and semantics as the JIT
//! backend's compiled `evaluate`, so both share the interpreter's DFF/memory
//! tail through [`crate::sim::interpret::InterpretSim::run_compiled_evaluate`].

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Command;

use libloading::{Library, Symbol};

use crate::error::{RhdlError, Result};
use crate::ir::{GateKind, Module as IrModule};
use crate::sim::Features;

type EvaluateFn = unsafe extern "C" fn(*mut u64, u64);

pub struct CompiledLib {
    _lib: Library,
    evaluate: EvaluateFn,
}

// SAFETY: the dlopen'd library stays mapped for the lifetime of `CompiledLib`
// and `evaluate` is a plain, reentrant exported function.
unsafe impl Send for CompiledLib {}
unsafe impl Sync for CompiledLib {}

fn generate_rust_source(ir: &IrModule) -> String {
    let mut src = String::new();
    src.push_str("#[no_mangle]\n");
    src.push_str("pub extern \"C\" fn evaluate(nets: *mut u64, lane_mask: u64) {\n");
    src.push_str("    unsafe {\n");
    for &gid in &ir.schedule {
        let g = &ir.gates[gid.index()];
        let load = |n: u32| format!("(*nets.add({n}))");
        let expr = match g.kind {
            GateKind::And => format!("{} & {}", load(g.inputs[0].0), load(g.inputs[1].0)),
            GateKind::Or => format!("{} | {}", load(g.inputs[0].0), load(g.inputs[1].0)),
            GateKind::Xor => format!("{} ^ {}", load(g.inputs[0].0), load(g.inputs[1].0)),
            GateKind::Not => format!("!{} & lane_mask", load(g.inputs[0].0)),
            GateKind::Buf => load(g.inputs[0].0),
            GateKind::Mux => format!(
                "({} & !{sel} | {} & {sel}) & lane_mask",
                load(g.inputs[0].0),
                load(g.inputs[1].0),
                sel = load(g.inputs[2].0)
            ),
            GateKind::Const => {
                if g.value.unwrap_or(0) != 0 {
                    "lane_mask".to_string()
                } else {
                    "0u64".to_string()
                }
            }
        };
        let masked = if matches!(g.kind, GateKind::Not | GateKind::Mux | GateKind::Const) {
            expr
        } else {
            format!("({expr}) & lane_mask")
        };
        let _ = writeln!(src, "        *nets.add({}) = {};", g.output.0, masked);
    }
    src.push_str("    }\n}\n");
    src
}

pub fn compile(ir: &IrModule) -> Result<CompiledLib> {
    let src = generate_rust_source(ir);

    let dir = std::env::temp_dir().join(format!("rhdl-compile-{}", std::process::id()));
    std::fs::create_dir_all(&dir).map_err(|e| RhdlError::IrIncompatible(e.to_string()))?;
    let src_path: PathBuf = dir.join(format!("{}.rs", ir.name.replace(|c: char| !c.is_alphanumeric(), "_")));
    let lib_path = dir.join(format!(
        "lib{}.so",
        ir.name.replace(|c: char| !c.is_alphanumeric(), "_")
    ));
    std::fs::write(&src_path, &src).map_err(|e| RhdlError::IrIncompatible(e.to_string()))?;

    let status = Command::new("rustc")
        .arg("--crate-type=cdylib")
        .arg("-C")
        .arg("opt-level=3")
        .arg("-C")
        .arg("lto=thin")
        .arg("-o")
        .arg(&lib_path)
        .arg(&src_path)
        .status()
        .map_err(|e| RhdlError::IrIncompatible(format!("failed to invoke rustc: {e}")))?;
    if !status.success() {
        return Err(RhdlError::IrIncompatible(format!("rustc failed compiling {}", src_path.display())));
    }

    let lib = unsafe { Library::new(&lib_path) }.map_err(|e| RhdlError::IrIncompatible(e.to_string()))?;
    let evaluate: EvaluateFn = unsafe {
        let sym: Symbol<EvaluateFn> = lib.get(b"evaluate").map_err(|e| RhdlError::IrIncompatible(e.to_string()))?;
        *sym
    };

    Ok(CompiledLib { _lib: lib, evaluate })
}

pub struct CompileSim {
    interpret: crate::sim::interpret::InterpretSim,
    compiled: std::sync::Arc<CompiledLib>,
}

impl CompileSim {
    pub fn new(ir: IrModule, compiled: std::sync::Arc<CompiledLib>, lanes: u8, strict_poke: bool) -> Result<Self> {
        let interpret = crate::sim::interpret::InterpretSim::new(ir, lanes, strict_poke)?;
        Ok(Self { interpret, compiled })
    }

    pub fn ir(&self) -> &IrModule {
        self.interpret.ir()
    }

    pub fn features(&self) -> Features {
        Features {
            max_lanes: 64,
            supports_snapshot: true,
        }
    }

    pub fn poke(&mut self, port: &str, value: u64) -> Result<()> {
        self.interpret.poke(port, value)
    }

    pub fn peek(&self, port: &str) -> Result<u64> {
        self.interpret.peek(port)
    }

    pub fn poke_lanes(&mut self, port: &str, values: &[u64]) -> Result<()> {
        self.interpret.poke_lanes(port, values)
    }

    pub fn peek_lanes(&self, port: &str) -> Result<Vec<u64>> {
        self.interpret.peek_lanes(port)
    }

    pub fn evaluate(&mut self) {
        self.interpret.run_compiled_evaluate(self.compiled.evaluate);
    }

    pub fn tick(&mut self) {
        self.interpret.tick();
    }

    pub fn reset(&mut self) {
        self.interpret.reset();
    }

    pub fn state_snapshot(&self) -> Vec<u8> {
        self.interpret.state_snapshot()
    }

    pub fn state_restore(&mut self, blob: &[u8]) -> Result<()> {
        self.interpret.state_restore(blob)
    }
}
