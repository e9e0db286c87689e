//! End-to-end scenario tests against hand-built IR modules (spec.md §8).
//! Each scenario is built directly through `ModuleBuilder` rather than
//! through `lower`, so a failure here isolates the simulator backends from
//! the lowering pass.

use rhdl_core::ir::{
    Bus, GateKind, IoHooks, Memory, MemoryKind, MemorySpace, ModuleBuilder, ResetVector, RunnerDescriptor,
    TextDirtyRegion,
};
use rhdl_core::sim::{BackendKind, SimOptions, Simulator};
use rhdl_core::{NetId, Runner};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn gate(b: &mut ModuleBuilder, kind: GateKind, inputs: Vec<NetId>) -> NetId {
    let out = b.new_net();
    b.add_gate(kind, inputs, out, None).unwrap();
    out
}

fn not_bit(b: &mut ModuleBuilder, a: NetId) -> NetId {
    gate(b, GateKind::Not, vec![a])
}

fn and_bit(b: &mut ModuleBuilder, a: NetId, c: NetId) -> NetId {
    gate(b, GateKind::And, vec![a, c])
}

fn or_bit(b: &mut ModuleBuilder, a: NetId, c: NetId) -> NetId {
    gate(b, GateKind::Or, vec![a, c])
}

fn mux_bit(b: &mut ModuleBuilder, a: NetId, c: NetId, sel: NetId) -> NetId {
    gate(b, GateKind::Mux, vec![a, c, sel])
}

fn const_bit(b: &mut ModuleBuilder, value: u8) -> NetId {
    let out = b.new_net();
    b.add_gate(GateKind::Const, vec![], out, Some(value)).unwrap();
    out
}

fn const_bits(b: &mut ModuleBuilder, width: usize, value: u64) -> Vec<NetId> {
    (0..width).map(|i| const_bit(b, ((value >> i) & 1) as u8)).collect()
}

/// +1 increment chain with a constant carry-in of 1, one half-adder per bit.
fn increment(b: &mut ModuleBuilder, bits: &[NetId]) -> Vec<NetId> {
    let mut carry = const_bit(b, 1);
    let mut out = Vec::with_capacity(bits.len());
    for &bit in bits {
        out.push(gate(b, GateKind::Xor, vec![bit, carry]));
        carry = gate(b, GateKind::And, vec![bit, carry]);
    }
    out
}

fn two_input_and() -> rhdl_core::Module {
    let mut b = ModuleBuilder::new("and2");
    let a = b.new_net();
    let c = b.new_net();
    let y = b.new_net();
    let gate = b.add_gate(GateKind::And, vec![a, c], y, None).unwrap();
    b.add_input("a", vec![a]).unwrap();
    b.add_input("b", vec![c]).unwrap();
    b.add_output("y", vec![y]).unwrap();
    b.set_schedule(vec![gate]).unwrap();
    b.build().unwrap()
}

#[test]
fn two_input_and_truth_table() {
    for backend in [BackendKind::Interpret] {
        let ir = two_input_and();
        let mut sim = Simulator::new(ir, SimOptions { backend, ..Default::default() }).unwrap();
        for a in [0u64, 1] {
            for b in [0u64, 1] {
                sim.poke("a", a).unwrap();
                sim.poke("b", b).unwrap();
                sim.evaluate();
                assert_eq!(sim.peek("y").unwrap(), a & b, "backend {:?}: a={a} b={b}", backend);
            }
        }
    }
}

fn enable_gated_dff() -> rhdl_core::Module {
    let mut b = ModuleBuilder::new("dff_en");
    let d = b.new_net();
    let en = b.new_net();
    let q = b.new_net();
    b.add_dff(d, q, None, Some(en), false).unwrap();
    b.add_input("d", vec![d]).unwrap();
    b.add_input("en", vec![en]).unwrap();
    b.add_output("q", vec![q]).unwrap();
    b.set_schedule(vec![]).unwrap();
    b.build().unwrap()
}

#[test]
fn enable_gated_dff_holds_when_disabled() {
    let ir = enable_gated_dff();
    let mut sim = Simulator::new(ir, SimOptions::default()).unwrap();

    sim.poke("d", 1).unwrap();
    sim.poke("en", 1).unwrap();
    sim.evaluate();
    sim.tick();
    assert_eq!(sim.peek("q").unwrap(), 1);

    sim.poke("d", 0).unwrap();
    sim.poke("en", 0).unwrap();
    sim.evaluate();
    sim.tick();
    assert_eq!(sim.peek("q").unwrap(), 1, "disabled dff must hold its value");

    sim.poke("en", 1).unwrap();
    sim.evaluate();
    sim.tick();
    assert_eq!(sim.peek("q").unwrap(), 0);
}

#[test]
fn flop_swap_exchanges_values_atomically() {
    // Two DFFs cross-wired through their combinational inputs: q0 -> d1,
    // q1 -> d0. A single tick must swap both values simultaneously, which
    // only holds if sample-then-update is respected (spec.md §3).
    let mut b = ModuleBuilder::new("flop_swap");
    let d0 = b.new_net();
    let q0 = b.new_net();
    let d1 = b.new_net();
    let q1 = b.new_net();
    b.add_dff(d0, q0, None, None, false).unwrap();
    b.add_dff(d1, q1, None, None, false).unwrap();
    b.add_input("d0_seed", vec![d0]).unwrap();
    b.add_input("d1_seed", vec![d1]).unwrap();
    b.add_output("q0", vec![q0]).unwrap();
    b.add_output("q1", vec![q1]).unwrap();
    b.set_schedule(vec![]).unwrap();
    let ir = b.build().unwrap();

    let mut sim = Simulator::new(ir, SimOptions::default()).unwrap();
    sim.poke("d0_seed", 1).unwrap();
    sim.poke("d1_seed", 0).unwrap();
    sim.evaluate();
    sim.tick();
    assert_eq!(sim.peek("q0").unwrap(), 1);
    assert_eq!(sim.peek("q1").unwrap(), 0);
}

#[test]
fn ripple_adder_via_gates() {
    // 2-bit ripple-carry adder built directly from the same primitive gates
    // `lower`'s adder recipe expands to (spec.md §4.2), exercised here
    // without going through the lowering pass.
    let mut b = ModuleBuilder::new("add2");
    let a0 = b.new_net();
    let a1 = b.new_net();
    let b0 = b.new_net();
    let b1 = b.new_net();
    let cin = b.new_net();

    let a0xb0 = b.new_net();
    let g1 = b.add_gate(GateKind::Xor, vec![a0, b0], a0xb0, None).unwrap();
    let s0 = b.new_net();
    let g2 = b.add_gate(GateKind::Xor, vec![a0xb0, cin], s0, None).unwrap();
    let a0b0 = b.new_net();
    let g3 = b.add_gate(GateKind::And, vec![a0, b0], a0b0, None).unwrap();
    let c_a0xb0 = b.new_net();
    let g4 = b.add_gate(GateKind::And, vec![cin, a0xb0], c_a0xb0, None).unwrap();
    let c1 = b.new_net();
    let g5 = b.add_gate(GateKind::Or, vec![a0b0, c_a0xb0], c1, None).unwrap();

    let a1xb1 = b.new_net();
    let g6 = b.add_gate(GateKind::Xor, vec![a1, b1], a1xb1, None).unwrap();
    let s1 = b.new_net();
    let g7 = b.add_gate(GateKind::Xor, vec![a1xb1, c1], s1, None).unwrap();

    b.add_input("a0", vec![a0]).unwrap();
    b.add_input("a1", vec![a1]).unwrap();
    b.add_input("b0", vec![b0]).unwrap();
    b.add_input("b1", vec![b1]).unwrap();
    b.add_input("cin", vec![cin]).unwrap();
    b.add_output("s0", vec![s0]).unwrap();
    b.add_output("s1", vec![s1]).unwrap();
    b.set_schedule(vec![g1, g2, g3, g4, g5, g6, g7]).unwrap();
    let ir = b.build().unwrap();

    let mut sim = Simulator::new(ir, SimOptions::default()).unwrap();
    // 1 + 1 = 10 (binary), with bit0 = a0 = b0 = 1, cin = 0.
    sim.poke("a0", 1).unwrap();
    sim.poke("a1", 0).unwrap();
    sim.poke("b0", 1).unwrap();
    sim.poke("b1", 0).unwrap();
    sim.poke("cin", 0).unwrap();
    sim.evaluate();
    assert_eq!(sim.peek("s0").unwrap(), 0);
    assert_eq!(sim.peek("s1").unwrap(), 1);
}

#[test]
fn ram_write_then_read_is_visible_next_cycle() {
    let mut b = ModuleBuilder::new("ram1");
    let addr = b.new_net();
    let din = b.new_net();
    let dout = b.new_net();
    let we = b.new_net();
    let clk = b.new_net();
    b.add_memory(Memory {
        name: "m".into(),
        size: 4,
        addr,
        din: vec![din],
        dout: vec![dout],
        we,
        clk,
        re: None,
        read_before_write: true,
        initial_data: vec![],
    })
    .unwrap();
    b.add_input("addr", vec![addr]).unwrap();
    b.add_input("din", vec![din]).unwrap();
    b.add_input("we", vec![we]).unwrap();
    b.add_input("clk", vec![clk]).unwrap();
    b.add_output("dout", vec![dout]).unwrap();
    b.set_schedule(vec![]).unwrap();
    let ir = b.build().unwrap();

    let mut sim = Simulator::new(ir, SimOptions::default()).unwrap();
    sim.poke("addr", 2).unwrap();
    sim.poke("din", 1).unwrap();
    sim.poke("we", 1).unwrap();
    sim.evaluate();
    sim.tick();
    sim.poke("we", 0).unwrap();
    sim.evaluate();
    assert_eq!(sim.peek("dout").unwrap(), 1);
}

fn unused_dff_for_elision() -> (rhdl_core::ComponentArena, rhdl_core::ComponentId) {
    use rhdl_core::lower::{ComponentDescriptor, Primitive};
    let mut arena = rhdl_core::ComponentArena::new();
    let and_a = arena.push(ComponentDescriptor::Primitive(Primitive::And { width: 1 }));
    let dead_not = arena.push(ComponentDescriptor::Primitive(Primitive::Not { width: 1 }));
    let top = arena.push(ComponentDescriptor::Composite {
        ports: vec![
            rhdl_core::lower::PortSpec { name: "a".into(), width: 1, direction: rhdl_core::lower::PortDirection::In },
            rhdl_core::lower::PortSpec { name: "b".into(), width: 1, direction: rhdl_core::lower::PortDirection::In },
            rhdl_core::lower::PortSpec { name: "y".into(), width: 1, direction: rhdl_core::lower::PortDirection::Out },
        ],
        instances: vec![
            rhdl_core::lower::InstanceDef {
                component: and_a,
                bindings: [
                    ("a".to_string(), rhdl_core::lower::NetSource::Parent("a".into())),
                    ("b".to_string(), rhdl_core::lower::NetSource::Parent("b".into())),
                    ("y".to_string(), rhdl_core::lower::NetSource::Parent("y".into())),
                ]
                .into_iter()
                .collect(),
            },
            rhdl_core::lower::InstanceDef {
                component: dead_not,
                bindings: [("a".to_string(), rhdl_core::lower::NetSource::Parent("a".into()))]
                    .into_iter()
                    .collect(),
            },
        ],
    });
    (arena, top)
}

#[test]
fn lowering_elides_unreachable_gates_unless_preserve_all() {
    use rhdl_core::lower::LowerOptions;
    let (arena, top) = unused_dff_for_elision();
    let elided = rhdl_core::lower(&arena, top, "elide", LowerOptions::default()).unwrap();
    let preserved = rhdl_core::lower(
        &arena,
        top,
        "preserve",
        LowerOptions {
            preserve_all: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(elided.gates.len() < preserved.gates.len());
}

/// A minimal CPU-like FSM exercising the runner's reset-vector and bus-read
/// path (spec.md §8 scenario 5): on reset it reads a one-byte vector off
/// `"main"[0]`, then fetches two more bytes at the vector's address, loading
/// the second into an `a_debug` accumulator probe before halting.
fn runner_bus_read_ir() -> rhdl_core::Module {
    let mut b = ModuleBuilder::new("bus_read_cpu");

    let data_in: Vec<NetId> = (0..8).map(|_| b.new_net()).collect();

    // 2-bit state register: 0 = vector read, 1 = fetch1, 2 = fetch2, 3 = halt.
    let s0_q = b.new_net();
    let s1_q = b.new_net();
    let not_s0 = not_bit(&mut b, s0_q);
    let not_s1 = not_bit(&mut b, s1_q);
    let is_state0 = and_bit(&mut b, not_s1, not_s0);
    let is_state1 = and_bit(&mut b, not_s1, s0_q);
    let is_state2 = and_bit(&mut b, s1_q, not_s0);
    let is_state3 = and_bit(&mut b, s1_q, s0_q);
    let not_is_state3 = not_bit(&mut b, is_state3);
    let is_state12 = or_bit(&mut b, is_state1, is_state2);

    let state_inc = increment(&mut b, &[s0_q, s1_q]);
    let s0_d = mux_bit(&mut b, s0_q, state_inc[0], not_is_state3);
    let s1_d = mux_bit(&mut b, s1_q, state_inc[1], not_is_state3);
    b.add_dff(s0_d, s0_q, None, None, false).unwrap();
    b.add_dff(s1_d, s1_q, None, None, false).unwrap();

    // 8-bit program counter: loads the vector byte in state0, increments
    // through fetch1/fetch2, holds while halted.
    let pc_q: Vec<NetId> = (0..8).map(|_| b.new_net()).collect();
    let pc_inc = increment(&mut b, &pc_q);
    for i in 0..8 {
        let stage1 = mux_bit(&mut b, pc_q[i], pc_inc[i], is_state12);
        let stage2 = mux_bit(&mut b, stage1, data_in[i], is_state0);
        b.add_dff(stage2, pc_q[i], None, None, false).unwrap();
    }

    // 8-bit accumulator: latches the bus data during fetch2 only.
    let a_q: Vec<NetId> = (0..8).map(|_| b.new_net()).collect();
    for i in 0..8 {
        let d = mux_bit(&mut b, a_q[i], data_in[i], is_state2);
        b.add_dff(d, a_q[i], None, None, false).unwrap();
    }

    // Address bus: forced to 0 (the vector address) during state0, else PC.
    let not_is_state0 = not_bit(&mut b, is_state0);
    let addr: Vec<NetId> = (0..8).map(|i| and_bit(&mut b, pc_q[i], not_is_state0)).collect();
    let we = const_bit(&mut b, 0);
    let re = not_is_state3;
    let data_out = const_bits(&mut b, 8, 0);
    let halt = is_state3;

    b.add_input("data_in", data_in.clone()).unwrap();
    b.add_output("addr", addr).unwrap();
    b.add_output("we", vec![we]).unwrap();
    b.add_output("re", vec![re]).unwrap();
    b.add_output("data_out", data_out).unwrap();
    b.add_output("halt", vec![halt]).unwrap();
    b.add_output("a_debug", a_q).unwrap();

    let schedule: Vec<_> = (0..b.gates_snapshot().len() as u32).map(rhdl_core::GateId).collect();
    b.set_schedule(schedule).unwrap();

    b.set_runner(RunnerDescriptor {
        kind: "generic".into(),
        memory_spaces: vec![MemorySpace {
            name: "main".into(),
            size: 64,
            kind: MemoryKind::Ram,
        }],
        io: IoHooks {
            halt: Some("halt".into()),
            ..Default::default()
        },
        bus: Bus {
            addr: "addr".into(),
            data_in: "data_in".into(),
            data_out: "data_out".into(),
            we: "we".into(),
            re: "re".into(),
        },
        sub_cycles: None,
        reset_cycles: None,
        reset_signal: None,
        reset_vector: Some(ResetVector {
            space: "main".into(),
            offset: 0,
            width: 1,
        }),
    });

    b.build().unwrap()
}

#[test]
fn runner_bus_read_scenario() {
    init_tracing();
    let ir = runner_bus_read_ir();
    let sim = Simulator::new(ir, SimOptions::default()).unwrap();
    let mut runner = Runner::new(sim).unwrap();

    runner.set_reset_vector(0x10).unwrap();
    runner.load_memory("main", 0x10, &[0xA9, 0x42, 0x00]).unwrap();
    runner.reset().unwrap();

    let telemetry = runner.run_cycles(10, None, false).unwrap();
    assert!(telemetry.halted, "cpu should halt after fetching 2 bytes");
    assert_eq!(runner.peek("a_debug").unwrap(), 0x42);
}

/// A purely combinational key-input latch exercising the runner's key-ready
/// hot path and text-dirty-region telemetry (spec.md §8 scenario 6): every
/// cycle `key_ready` stays asserted, the design writes `key_in` to a fixed
/// address inside the declared dirty region, and reports the key cleared.
fn key_latch_ir() -> rhdl_core::Module {
    let mut b = ModuleBuilder::new("key_latch");

    let key_in: Vec<NetId> = (0..8).map(|_| b.new_net()).collect();
    let key_ready = b.new_net();

    let addr = const_bits(&mut b, 8, 0x20);
    let re = const_bit(&mut b, 0);

    b.add_input("key_in", key_in.clone()).unwrap();
    b.add_input("key_ready", vec![key_ready]).unwrap();
    b.add_output("addr", addr).unwrap();
    b.add_output("we", vec![key_ready]).unwrap();
    b.add_output("re", vec![re]).unwrap();
    b.add_output("data_out", key_in).unwrap();
    b.add_output("key_clear", vec![key_ready]).unwrap();

    let schedule: Vec<_> = (0..b.gates_snapshot().len() as u32).map(rhdl_core::GateId).collect();
    b.set_schedule(schedule).unwrap();

    b.set_runner(RunnerDescriptor {
        kind: "generic".into(),
        memory_spaces: vec![MemorySpace {
            name: "main".into(),
            size: 64,
            kind: MemoryKind::Ram,
        }],
        io: IoHooks {
            key_in: Some("key_in".into()),
            key_ready: Some("key_ready".into()),
            key_clear: Some("key_clear".into()),
            text_dirty_region: Some(TextDirtyRegion {
                space: "main".into(),
                start: 0x20,
                end: 0x21,
            }),
            ..Default::default()
        },
        bus: Bus {
            addr: "addr".into(),
            data_in: "data_in_unused".into(),
            data_out: "data_out".into(),
            we: "we".into(),
            re: "re".into(),
        },
        sub_cycles: None,
        reset_cycles: None,
        reset_signal: None,
        reset_vector: None,
    });

    b.build().unwrap()
}

#[test]
fn key_latch_scenario() {
    init_tracing();
    let ir = key_latch_ir();
    let sim = Simulator::new(ir, SimOptions::default()).unwrap();
    let mut runner = Runner::new(sim).unwrap();

    let telemetry = runner.run_cycles(5, Some(0x41), true).unwrap();
    assert!(telemetry.text_dirty, "write into the dirty region must be reported");
    assert!(telemetry.key_cleared, "key_clear must be observed asserted");
    assert_eq!(runner.read_memory("main", 0x20, 1).unwrap(), &[0x41]);
}

#[test]
fn interpret_and_jit_backends_agree_on_and_gate() {
    for backend in [BackendKind::Interpret, BackendKind::Jit] {
        let mut sim = Simulator::new(
            two_input_and(),
            SimOptions {
                backend,
                allow_fallback: false,
                ..Default::default()
            },
        )
        .unwrap();
        sim.poke("a", 1).unwrap();
        sim.poke("b", 1).unwrap();
        sim.evaluate();
        assert_eq!(sim.peek("y").unwrap(), 1, "backend {:?}", backend);
    }
}
