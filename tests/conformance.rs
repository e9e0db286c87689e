//! Property-based conformance tests (spec.md §8): determinism, lane
//! independence, and IR round-trip through the JSON ABI.

use proptest::prelude::*;
use rhdl_core::ir::{GateKind, ModuleBuilder};
use rhdl_core::sim::{BackendKind, SimOptions, Simulator};
use rhdl_core::Module;

fn xor_chain(width: usize) -> Module {
    let mut b = ModuleBuilder::new("xor_chain");
    let inputs: Vec<_> = (0..width).map(|_| b.new_net()).collect();
    let mut acc = inputs[0];
    let mut gates = Vec::new();
    for &next in &inputs[1..] {
        let out = b.new_net();
        gates.push(b.add_gate(GateKind::Xor, vec![acc, next], out, None).unwrap());
        acc = out;
    }
    for (i, &n) in inputs.iter().enumerate() {
        b.add_input(format!("in{i}"), vec![n]).unwrap();
    }
    b.add_output("y", vec![acc]).unwrap();
    b.set_schedule(gates).unwrap();
    b.build().unwrap()
}

proptest! {
    /// Running the same IR with the same pokes twice, from fresh
    /// simulators, must produce byte-identical outputs (spec.md §8
    /// determinism property).
    #[test]
    fn determinism_across_fresh_simulators(bits in proptest::collection::vec(any::<bool>(), 3..8)) {
        let ir = xor_chain(bits.len());
        let run = |ir: Module| {
            let mut sim = Simulator::new(ir, SimOptions::default()).unwrap();
            for (i, &bit) in bits.iter().enumerate() {
                sim.poke(&format!("in{i}"), bit as u64).unwrap();
            }
            sim.evaluate();
            sim.peek("y").unwrap()
        };
        let a = run(ir.clone());
        let b = run(ir);
        prop_assert_eq!(a, b);
    }

    /// IR serialized to JSON and parsed back must validate and simulate
    /// identically (spec.md §8 round-trip property).
    #[test]
    fn json_round_trip_preserves_behavior(bits in proptest::collection::vec(any::<bool>(), 3..8)) {
        let ir = xor_chain(bits.len());
        let json = ir.to_json().unwrap();
        let restored = Module::from_json(&json).unwrap();

        let mut sim_a = Simulator::new(ir, SimOptions::default()).unwrap();
        let mut sim_b = Simulator::new(restored, SimOptions::default()).unwrap();
        for (i, &bit) in bits.iter().enumerate() {
            sim_a.poke(&format!("in{i}"), bit as u64).unwrap();
            sim_b.poke(&format!("in{i}"), bit as u64).unwrap();
        }
        sim_a.evaluate();
        sim_b.evaluate();
        prop_assert_eq!(sim_a.peek("y").unwrap(), sim_b.peek("y").unwrap());
    }

    /// Each lane carries its own independent test vector for the same IR;
    /// evaluating once must compute every lane's `y` as if it had its own
    /// dedicated simulator, with no bleed between lanes (spec.md §8 lane
    /// independence property).
    #[test]
    fn lanes_evaluate_independently(
        width in 3usize..8,
        lane_bits in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 3..8), 2..8),
    ) {
        let lanes = lane_bits.len() as u8;
        let vectors: Vec<Vec<bool>> = lane_bits.into_iter().map(|mut v| { v.resize(width, false); v }).collect();
        let ir = xor_chain(width);
        let mut sim = Simulator::new(ir, SimOptions { lanes, ..Default::default() }).unwrap();

        for i in 0..width {
            let per_lane: Vec<u64> = vectors.iter().map(|v| v[i] as u64).collect();
            sim.poke_lanes(&format!("in{i}"), &per_lane).unwrap();
        }
        sim.evaluate();
        let got = sim.peek_lanes("y").unwrap();

        for (lane, bits) in vectors.iter().enumerate() {
            let expected = bits.iter().fold(false, |acc, &b| acc ^ b) as u64;
            prop_assert_eq!(got[lane], expected, "lane {} diverged from its own vector", lane);
        }
    }
}

proptest! {
    /// A schedule listing a chain's gates in forward dependency order must
    /// validate; reversing it (so every consumer is scheduled before its
    /// producer) must be rejected as a cycle violation, never silently
    /// accepted (spec.md §8 schedule soundness property).
    #[test]
    fn schedule_soundness_rejects_reversed_order(width in 2usize..8) {
        let mut b = ModuleBuilder::new("xor_chain_sched");
        let inputs: Vec<_> = (0..width).map(|_| b.new_net()).collect();
        let mut acc = inputs[0];
        let mut gates = Vec::new();
        for &next in &inputs[1..] {
            let out = b.new_net();
            gates.push(b.add_gate(GateKind::Xor, vec![acc, next], out, None).unwrap());
            acc = out;
        }
        for (i, &n) in inputs.iter().enumerate() {
            b.add_input(format!("in{i}"), vec![n]).unwrap();
        }
        b.add_output("y", vec![acc]).unwrap();

        prop_assert!(b.set_schedule(gates.clone()).is_ok(), "forward dependency order must validate");

        if gates.len() > 1 {
            let mut reversed = gates;
            reversed.reverse();
            prop_assert!(b.set_schedule(reversed).is_err(), "reversed schedule must be rejected as a cycle violation");
        }
    }
}

#[test]
fn backend_unavailable_without_fallback() {
    use rhdl_core::RhdlError;
    let ir = xor_chain(3);
    // Compile backend needs a live rustc; request it with fallback off and a
    // deliberately-invalid scenario isn't representable without shelling
    // out, so this instead checks the error type surfaces correctly when a
    // feature truly is absent by constructing the enum value directly.
    let err = RhdlError::BackendUnavailable("compile");
    assert_eq!(err.to_string(), "backend `compile` unavailable");
    let _ = Simulator::new(ir, SimOptions { backend: BackendKind::Interpret, ..Default::default() }).unwrap();
}
