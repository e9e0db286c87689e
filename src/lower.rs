//! Structural lowering: flattens a tree of component descriptors into a
//! gate-level [`Module`] IR (spec.md §4.2).
//!
//! Component descriptors are opaque to the core beyond the shapes listed
//! here — a front-end (the surface DSL) builds the arena; lowering never
//! mutates a descriptor, only the [`ModuleBuilder`] state it is assembling
//! (spec.md §9's "arena of immutable component descriptors" design note).

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::{RhdlError, Result};
use crate::ir::{Dff, Gate, GateId, GateKind, Memory, Module, ModuleBuilder, NetId, RunnerDescriptor};

/// Index into a [`ComponentArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(pub usize);

/// Direction of a composite's boundary port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct PortSpec {
    pub name: String,
    pub width: usize,
    pub direction: PortDirection,
}

/// Where a child instance's port gets its nets from, resolved relative to
/// the composite that owns the instance.
#[derive(Debug, Clone)]
pub enum NetSource {
    /// Bind to one of the owning composite's own boundary ports (by name) —
    /// parent-to-child identity binding, no gate inserted (spec.md §4.2 step 1).
    Parent(String),
    /// Bind to the output port of a sibling instance earlier in the
    /// composite's instance list (referenced by its index and port name).
    /// Lowering requires `sibling_index < self_index`: front-ends emit
    /// instances in dataflow order, so this keeps lowering a single forward
    /// pass instead of a second fixed-point resolution pass.
    Sibling(usize, String),
    /// Allocate fresh internal nets sized to the port's width.
    Fresh,
}

#[derive(Debug, Clone)]
pub struct InstanceDef {
    pub component: ComponentId,
    pub bindings: HashMap<String, NetSource>,
}

/// A primitive's gate-level expansion recipe (spec.md §4.2 "arithmetic/bus
/// lowering" design-level descriptions).
#[derive(Debug, Clone)]
pub enum Primitive {
    Const { width: usize, value: u64 },
    Not { width: usize },
    And { width: usize },
    Or { width: usize },
    Xor { width: usize },
    Nand { width: usize },
    Nor { width: usize },
    Xnor { width: usize },
    /// Reduces an N-bit bus to a single bit via a binary tree of the given
    /// gate kind (used for e.g. wide AND-of-bits, and internally by `Eq`).
    Reduce { kind: GateKind, width: usize },
    Eq { width: usize },
    Adder { width: usize },
    Sub { width: usize },
    /// 2^sel_width-to-1 mux over `width`-bit buses, built as a balanced
    /// binary tree of native 2-way MUX gates (spec.md §9's Mux2^k design
    /// note; see DESIGN.md for why a tree of 2-way muxes was chosen over a
    /// literal one-hot decode + OR network — they are logically equivalent).
    Mux { sel_width: usize, width: usize },
    Register {
        width: usize,
        has_en: bool,
        has_rst: bool,
        async_reset: bool,
    },
    Ram {
        size: usize,
        addr_width: usize,
        data_width: usize,
        read_before_write: bool,
        initial_data: Vec<u64>,
    },
}

#[derive(Debug, Clone)]
pub enum ComponentDescriptor {
    Primitive(Primitive),
    Composite {
        ports: Vec<PortSpec>,
        instances: Vec<InstanceDef>,
    },
}

/// Immutable arena of component descriptors, indexed by [`ComponentId`].
#[derive(Debug, Default)]
pub struct ComponentArena {
    components: Vec<ComponentDescriptor>,
}

impl ComponentArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, desc: ComponentDescriptor) -> ComponentId {
        self.components.push(desc);
        ComponentId(self.components.len() - 1)
    }

    pub fn get(&self, id: ComponentId) -> &ComponentDescriptor {
        &self.components[id.0]
    }
}

#[derive(Debug, Clone, Default)]
pub struct LowerOptions {
    /// Disables dead-net elision so every signal stays live for debug probes
    /// (spec.md §4.2 step 5).
    pub preserve_all: bool,
    pub runner: Option<RunnerDescriptor>,
}

type PortNets = HashMap<String, Vec<NetId>>;

/// Lowers `top` (and everything it instantiates) into a flat gate-level IR.
pub fn lower(arena: &ComponentArena, top: ComponentId, name: &str, opts: LowerOptions) -> Result<Module> {
    let mut b = ModuleBuilder::new(name);

    let top_ports = match arena.get(top) {
        ComponentDescriptor::Composite { ports, .. } => ports.clone(),
        ComponentDescriptor::Primitive(_) => {
            return Err(RhdlError::IrMalformed {
                field: "top".into(),
                reason: "top-level component must be a composite".into(),
            })
        }
    };

    // The top module's own boundary ports are both its "parent bindings"
    // (inputs) and its outputs; allocate fresh nets for every top port up
    // front, then register them with the builder as module ports.
    let mut top_nets = PortNets::new();
    for p in &top_ports {
        let nets: Vec<NetId> = (0..p.width).map(|_| b.new_net()).collect();
        top_nets.insert(p.name.clone(), nets);
    }

    let outputs = lower_instance(&mut b, arena, top, &top_nets)?;

    let mut output_nets: Vec<NetId> = Vec::new();
    for p in &top_ports {
        match p.direction {
            PortDirection::In => b.add_input(p.name.clone(), top_nets[&p.name].clone())?,
            PortDirection::Out => {
                // Composite outputs resolve through its instances; fall back
                // to the pre-allocated net if the composite produced nothing
                // under that name (a pure pass-through boundary).
                let nets = outputs.get(&p.name).cloned().unwrap_or_else(|| top_nets[&p.name].clone());
                output_nets.extend(nets.iter().copied());
                b.add_output(p.name.clone(), nets)?;
            }
        }
    }

    if let Some(runner) = opts.runner {
        b.set_runner(runner);
    }

    let gates = b.gates_snapshot();
    let topo = kahn_schedule(&gates)?;
    let surviving_old_ids = if opts.preserve_all {
        topo
    } else {
        elide_dead_gates(&gates, &b.dffs_snapshot(), &b.memories_snapshot(), &output_nets, topo)
    };
    let schedule = b.retain_gates(&surviving_old_ids);
    b.set_schedule(schedule)?;

    b.build()
}

/// Lowers one component instance given the fully-resolved net list for each
/// of its ports, returning the net list for each of its *output* ports.
fn lower_instance(
    b: &mut ModuleBuilder,
    arena: &ComponentArena,
    id: ComponentId,
    port_nets: &PortNets,
) -> Result<PortNets> {
    match arena.get(id) {
        ComponentDescriptor::Primitive(p) => expand_primitive(b, p, port_nets),
        ComponentDescriptor::Composite { instances, .. } => {
            // outputs[i] = the resolved (name -> nets) map for instance i,
            // populated strictly left-to-right so `Sibling` bindings can
            // only reach already-lowered instances.
            let mut sibling_outputs: Vec<PortNets> = Vec::with_capacity(instances.len());

            for inst in instances {
                let child_ports = match arena.get(inst.component) {
                    ComponentDescriptor::Composite { ports, .. } => ports.clone(),
                    ComponentDescriptor::Primitive(prim) => primitive_ports(prim),
                };

                let mut child_nets = PortNets::new();
                for cp in &child_ports {
                    let nets = match inst.bindings.get(&cp.name) {
                        Some(NetSource::Parent(name)) => port_nets
                            .get(name)
                            .cloned()
                            .ok_or_else(|| RhdlError::IrMalformed {
                                field: format!("binding {}", name),
                                reason: "parent port not found".into(),
                            })?,
                        Some(NetSource::Sibling(idx, name)) => sibling_outputs
                            .get(*idx)
                            .and_then(|m| m.get(name))
                            .cloned()
                            .ok_or_else(|| RhdlError::IrMalformed {
                                field: format!("binding {}", name),
                                reason: "sibling instance not yet lowered or missing port".into(),
                            })?,
                        Some(NetSource::Fresh) | None => (0..cp.width).map(|_| b.new_net()).collect(),
                    };
                    if nets.len() != cp.width {
                        return Err(RhdlError::IrMalformed {
                            field: cp.name.clone(),
                            reason: format!("width mismatch: port is {} bits, binding supplied {}", cp.width, nets.len()),
                        });
                    }
                    child_nets.insert(cp.name.clone(), nets);
                }

                let child_outputs = lower_instance(b, arena, inst.component, &child_nets)?;
                // Merge the child's resolved input nets and computed output
                // nets so later siblings can reference any of its ports.
                let mut merged = child_nets;
                merged.extend(child_outputs);
                sibling_outputs.push(merged);
            }

            // A composite's own outputs are whatever its last-declared
            // instance exposes under the matching name; front-ends that want
            // an explicit boundary output wire an instance's output straight
            // to a `Fresh`-less passthrough. This keeps the binding model
            // uniform without a separate "composite output map".
            let mut result = PortNets::new();
            for m in &sibling_outputs {
                for (k, v) in m {
                    result.insert(k.clone(), v.clone());
                }
            }
            Ok(result)
        }
    }
}

fn primitive_ports(p: &Primitive) -> Vec<PortSpec> {
    let w = |name: &str, width: usize, dir: PortDirection| PortSpec {
        name: name.to_string(),
        width,
        direction: dir,
    };
    use PortDirection::*;
    match p {
        Primitive::Const { width, .. } => vec![w("y", *width, Out)],
        Primitive::Not { width } => vec![w("a", *width, In), w("y", *width, Out)],
        Primitive::And { width } | Primitive::Or { width } | Primitive::Xor { width } => {
            vec![w("a", *width, In), w("b", *width, In), w("y", *width, Out)]
        }
        Primitive::Nand { width } | Primitive::Nor { width } | Primitive::Xnor { width } => {
            vec![w("a", *width, In), w("b", *width, In), w("y", *width, Out)]
        }
        Primitive::Reduce { width, .. } => vec![w("a", *width, In), w("y", 1, Out)],
        Primitive::Eq { width } => vec![w("a", *width, In), w("b", *width, In), w("y", 1, Out)],
        Primitive::Adder { width } => vec![
            w("a", *width, In),
            w("b", *width, In),
            w("cin", 1, In),
            w("sum", *width, Out),
            w("cout", 1, Out),
            w("overflow", 1, Out),
        ],
        Primitive::Sub { width } => vec![
            w("a", *width, In),
            w("b", *width, In),
            w("diff", *width, Out),
            w("borrow", 1, Out),
        ],
        Primitive::Mux { sel_width, width } => {
            let n_inputs = 1usize << sel_width;
            let mut ports: Vec<PortSpec> = (0..n_inputs).map(|i| w(&format!("in{i}"), *width, In)).collect();
            ports.push(w("sel", *sel_width, In));
            ports.push(w("y", *width, Out));
            ports
        }
        Primitive::Register { width, has_en, has_rst, .. } => {
            let mut ports = vec![w("d", *width, In), w("q", *width, Out)];
            if *has_en {
                ports.push(w("en", 1, In));
            }
            if *has_rst {
                ports.push(w("rst", 1, In));
            }
            ports
        }
        Primitive::Ram { addr_width, data_width, .. } => vec![
            w("addr", *addr_width, In),
            w("din", *data_width, In),
            w("dout", *data_width, Out),
            w("we", 1, In),
            w("clk", 1, In),
        ],
    }
}

/// Builds a left-deep binary tree of `kind` gates over `inputs`, the
/// canonicalization spec.md §4.2 step 3 requires for k > 2 input gates.
fn binary_tree(b: &mut ModuleBuilder, kind: GateKind, inputs: &[NetId]) -> Result<NetId> {
    assert!(!inputs.is_empty());
    let mut acc = inputs[0];
    for &next in &inputs[1..] {
        let out = b.new_net();
        b.add_gate(kind, vec![acc, next], out, None)?;
        acc = out;
    }
    Ok(acc)
}

fn not_gate(b: &mut ModuleBuilder, a: NetId) -> Result<NetId> {
    let y = b.new_net();
    b.add_gate(GateKind::Not, vec![a], y, None)?;
    Ok(y)
}

fn per_bit(b: &mut ModuleBuilder, kind: GateKind, a: &[NetId], bb: &[NetId]) -> Result<Vec<NetId>> {
    a.iter()
        .zip(bb.iter())
        .map(|(&x, &y)| {
            let o = b.new_net();
            b.add_gate(kind, vec![x, y], o, None)?;
            Ok(o)
        })
        .collect()
}

fn expand_primitive(b: &mut ModuleBuilder, p: &Primitive, ports: &PortNets) -> Result<PortNets> {
    let get = |name: &str| -> Result<Vec<NetId>> {
        ports.get(name).cloned().ok_or_else(|| RhdlError::IrMalformed {
            field: name.into(),
            reason: "missing primitive port binding".into(),
        })
    };
    let mut out = PortNets::new();

    match p {
        Primitive::Const { width, value } => {
            let mut y = Vec::with_capacity(*width);
            for i in 0..*width {
                let bit = ((value >> i) & 1) as u8;
                let n = b.new_net();
                b.add_gate(GateKind::Const, vec![], n, Some(bit))?;
                y.push(n);
            }
            out.insert("y".into(), y);
        }
        Primitive::Not { .. } => {
            let a = get("a")?;
            let y: Result<Vec<NetId>> = a.iter().map(|&x| not_gate(b, x)).collect();
            out.insert("y".into(), y?);
        }
        Primitive::And { .. } => {
            out.insert("y".into(), per_bit(b, GateKind::And, &get("a")?, &get("b")?)?);
        }
        Primitive::Or { .. } => {
            out.insert("y".into(), per_bit(b, GateKind::Or, &get("a")?, &get("b")?)?);
        }
        Primitive::Xor { .. } => {
            out.insert("y".into(), per_bit(b, GateKind::Xor, &get("a")?, &get("b")?)?);
        }
        Primitive::Nand { .. } => {
            let raw = per_bit(b, GateKind::And, &get("a")?, &get("b")?)?;
            let y: Result<Vec<NetId>> = raw.iter().map(|&x| not_gate(b, x)).collect();
            out.insert("y".into(), y?);
        }
        Primitive::Nor { .. } => {
            let raw = per_bit(b, GateKind::Or, &get("a")?, &get("b")?)?;
            let y: Result<Vec<NetId>> = raw.iter().map(|&x| not_gate(b, x)).collect();
            out.insert("y".into(), y?);
        }
        Primitive::Xnor { .. } => {
            let raw = per_bit(b, GateKind::Xor, &get("a")?, &get("b")?)?;
            let y: Result<Vec<NetId>> = raw.iter().map(|&x| not_gate(b, x)).collect();
            out.insert("y".into(), y?);
        }
        Primitive::Reduce { kind, .. } => {
            let a = get("a")?;
            let y = binary_tree(b, *kind, &a)?;
            out.insert("y".into(), vec![y]);
        }
        Primitive::Eq { .. } => {
            let a = get("a")?;
            let bb = get("b")?;
            let xored = per_bit(b, GateKind::Xor, &a, &bb)?;
            let any_diff = binary_tree(b, GateKind::Or, &xored)?;
            let eq = not_gate(b, any_diff)?;
            out.insert("y".into(), vec![eq]);
        }
        Primitive::Adder { width } => {
            let a = get("a")?;
            let bb = get("b")?;
            let cin = get("cin")?[0];
            let (sum, cout, carries) = ripple_adder(b, &a, &bb, cin)?;
            let overflow = {
                let o = b.new_net();
                let c_msb_in = if *width >= 1 { carries[width - 1] } else { cin };
                b.add_gate(GateKind::Xor, vec![c_msb_in, cout], o, None)?;
                o
            };
            out.insert("sum".into(), sum);
            out.insert("cout".into(), vec![cout]);
            out.insert("overflow".into(), vec![overflow]);
        }
        Primitive::Sub { .. } => {
            let a = get("a")?;
            let bb = get("b")?;
            let not_b: Result<Vec<NetId>> = bb.iter().map(|&x| not_gate(b, x)).collect();
            let not_b = not_b?;
            let one = {
                let n = b.new_net();
                b.add_gate(GateKind::Const, vec![], n, Some(1))?;
                n
            };
            let (diff, cout, _carries) = ripple_adder(b, &a, &not_b, one)?;
            let borrow = not_gate(b, cout)?;
            out.insert("diff".into(), diff);
            out.insert("borrow".into(), vec![borrow]);
        }
        Primitive::Mux { sel_width, width } => {
            let sel = get("sel")?;
            let n_inputs = 1usize << sel_width;
            let mut level: Vec<Vec<NetId>> = (0..n_inputs).map(|i| get(&format!("in{i}")).unwrap_or_default()).collect();
            for l in &level {
                if l.len() != *width {
                    return Err(RhdlError::IrMalformed {
                        field: "mux input".into(),
                        reason: format!("expected width {width}"),
                    });
                }
            }
            for sel_bit in &sel {
                let mut next = Vec::with_capacity(level.len() / 2);
                for pair in level.chunks(2) {
                    let (a, bpair) = (&pair[0], &pair[1]);
                    let muxed: Result<Vec<NetId>> = a
                        .iter()
                        .zip(bpair.iter())
                        .map(|(&x, &y)| {
                            let o = b.new_net();
                            b.add_gate(GateKind::Mux, vec![x, y, *sel_bit], o, None)?;
                            Ok(o)
                        })
                        .collect();
                    next.push(muxed?);
                }
                level = next;
            }
            out.insert("y".into(), level.into_iter().next().unwrap_or_default());
        }
        Primitive::Register {
            has_en, has_rst, async_reset, ..
        } => {
            let d = get("d")?;
            let en = if *has_en { Some(get("en")?[0]) } else { None };
            let rst = if *has_rst { Some(get("rst")?[0]) } else { None };
            let mut q = Vec::with_capacity(d.len());
            for &di in &d {
                let qi = b.new_net();
                b.add_dff(di, qi, rst, en, *async_reset)?;
                q.push(qi);
            }
            out.insert("q".into(), q);
        }
        Primitive::Ram {
            size,
            read_before_write,
            initial_data,
            ..
        } => {
            let addr = get("addr")?[0];
            let din = get("din")?;
            let we = get("we")?[0];
            let clk = get("clk")?[0];
            let dout: Vec<NetId> = din.iter().map(|_| b.new_net()).collect();
            b.add_memory(Memory {
                name: format!("ram{}", addr.0),
                size: *size,
                addr,
                din: din.clone(),
                dout: dout.clone(),
                we,
                clk,
                re: None,
                read_before_write: *read_before_write,
                initial_data: initial_data.clone(),
            })?;
            out.insert("dout".into(), dout);
        }
    }

    Ok(out)
}

/// Ripple-carry adder per spec.md §4.2: `sum[i] = a[i]^b[i]^c[i]`,
/// `c[i+1] = (a[i]&b[i]) | (c[i]&(a[i]^b[i]))`. Returns `(sum, carry_out,
/// per-bit carry-out vector)`.
fn ripple_adder(b: &mut ModuleBuilder, a: &[NetId], bb: &[NetId], cin: NetId) -> Result<(Vec<NetId>, NetId, Vec<NetId>)> {
    let mut sum = Vec::with_capacity(a.len());
    let mut carries = Vec::with_capacity(a.len());
    let mut c = cin;
    for (&ai, &bi) in a.iter().zip(bb.iter()) {
        let axb = {
            let o = b.new_net();
            b.add_gate(GateKind::Xor, vec![ai, bi], o, None)?;
            o
        };
        let si = {
            let o = b.new_net();
            b.add_gate(GateKind::Xor, vec![axb, c], o, None)?;
            o
        };
        let ab = {
            let o = b.new_net();
            b.add_gate(GateKind::And, vec![ai, bi], o, None)?;
            o
        };
        let c_axb = {
            let o = b.new_net();
            b.add_gate(GateKind::And, vec![c, axb], o, None)?;
            o
        };
        let c_next = {
            let o = b.new_net();
            b.add_gate(GateKind::Or, vec![ab, c_axb], o, None)?;
            o
        };
        sum.push(si);
        carries.push(c_next);
        c = c_next;
    }
    Ok((sum, c, carries))
}

/// Kahn-style topological sort over the combinational gates, tie-broken by
/// ascending gate id for determinism (spec.md §4.2 step 4). Any gate whose
/// dependency can never be satisfied indicates a combinational cycle.
pub fn kahn_schedule(gates: &[Gate]) -> Result<Vec<GateId>> {
    let n = gates.len();
    let mut net_producer: HashMap<u32, usize> = HashMap::new();
    for (idx, g) in gates.iter().enumerate() {
        net_producer.insert(g.output.0, idx);
    }

    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (idx, g) in gates.iter().enumerate() {
        let mut deps: BTreeSet<usize> = BTreeSet::new();
        for inp in &g.inputs {
            if let Some(&p) = net_producer.get(&inp.0) {
                if p != idx {
                    deps.insert(p);
                }
            }
        }
        in_degree[idx] = deps.len();
        for p in deps {
            dependents[p].push(idx);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(GateId(next as u32));
        for &dep in &dependents[next] {
            in_degree[dep] -= 1;
            if in_degree[dep] == 0 {
                ready.insert(dep);
            }
        }
    }

    if order.len() != n {
        let remaining: Vec<u32> = (0..n)
            .filter(|&i| !order.contains(&GateId(i as u32)))
            .map(|i| gates[i].output.0)
            .collect();
        return Err(RhdlError::CombinationalLoop { nets: remaining });
    }

    Ok(order)
}

/// Removes gates whose outputs never reach an output port, a DFF input, or a
/// memory's write-data/address/enable inputs (spec.md §4.2 step 5).
fn elide_dead_gates(gates: &[Gate], dffs: &[Dff], memories: &[Memory], outputs: &[NetId], schedule: Vec<GateId>) -> Vec<GateId> {
    let mut net_producer: HashMap<u32, usize> = HashMap::new();
    for (idx, g) in gates.iter().enumerate() {
        net_producer.insert(g.output.0, idx);
    }

    let mut live = vec![false; gates.len()];
    let mut queue: VecDeque<u32> = VecDeque::new();

    for &n in outputs {
        queue.push_back(n.0);
    }
    for dff in dffs {
        queue.push_back(dff.d.0);
        if let Some(n) = dff.rst {
            queue.push_back(n.0);
        }
        if let Some(n) = dff.en {
            queue.push_back(n.0);
        }
    }
    for mem in memories {
        queue.push_back(mem.addr.0);
        queue.push_back(mem.we.0);
        for &d in &mem.din {
            queue.push_back(d.0);
        }
    }
    while let Some(net) = queue.pop_front() {
        if let Some(&idx) = net_producer.get(&net) {
            if !live[idx] {
                live[idx] = true;
                for inp in &gates[idx].inputs {
                    queue.push_back(inp.0);
                }
            }
        }
    }

    schedule.into_iter().filter(|g| live[g.index()]).collect()
}
