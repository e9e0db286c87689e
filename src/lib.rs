//! Gate-level netlist lowering, cycle-accurate simulation, and the runner
//! ABI for embedding a synthesized hardware design in a host application.
//!
//! The crate is organized the way the IR flows through it: [`ir`] defines
//! the typed graph and its canonical JSON form, [`lower`] flattens a
//! component tree into that graph, [`sim`] runs it (three interchangeable
//! backends behind one facade), and [`runner`] wraps a running simulator
//! with the host-memory and telemetry conveniences an emulator-style
//! embedding needs. [`error`] holds the single error enum every fallible
//! operation in this crate returns.

pub mod error;
pub mod ir;
pub mod lower;
pub mod runner;
pub mod sim;
pub mod snapshot;

pub use error::{RhdlError, Result};
pub use ir::{Dff, Gate, GateId, GateKind, Memory, Module, ModuleBuilder, NetId};
pub use lower::{lower, ComponentArena, ComponentDescriptor, ComponentId, LowerOptions};
pub use runner::{RunTelemetry, Runner};
pub use sim::{BackendKind, SimOptions, Simulator};
