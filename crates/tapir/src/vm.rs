//! The tape machine: executes a compiled program over a register file,
//! binding forward values into the graph and accumulating gradients into
//! dual values as recorded gradient sources are produced.

use rustc_hash::FxHashSet;

use tapir_core::{Error, ExprGraph, NodeId, Op, Result, Value};

use crate::compile::{compile, Instruction, Program, Register};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Idle => "idle",
            MachineState::Running => "running",
            MachineState::Completed => "completed",
            MachineState::Failed => "failed",
        }
    }
}

/// A gradient contribution whose target had no forward value yet when it
/// was produced. Owns its payload; drained after the pass.
#[derive(Debug)]
struct Deferred {
    target: NodeId,
    contribution: Value,
}

/// Owns a graph and executes its compiled program.
///
/// One machine per thread; machines share nothing. The state machine is
/// `Idle -> Running -> (Completed | Failed)`, with `reset` the only way
/// back to `Idle`.
pub struct TapeMachine {
    graph: ExprGraph,
    program: Program,
    registers: Vec<Option<Value>>,
    state: MachineState,
    deferred: Vec<Deferred>,
    bind_duals: bool,
    dual_filter: Option<FxHashSet<NodeId>>,
    watch: FxHashSet<NodeId>,
}

impl TapeMachine {
    /// Compile `graph` and set up the register file. Dual binding is on when
    /// the graph has recorded gradient sources.
    pub fn new(graph: ExprGraph) -> Result<TapeMachine> {
        let program = compile(&graph)?;
        let registers = vec![None; program.n_registers];
        let bind_duals = graph.has_gradient_sources();
        Ok(TapeMachine {
            graph,
            program,
            registers,
            state: MachineState::Idle,
            deferred: Vec::new(),
            bind_duals,
            dual_filter: None,
            watch: FxHashSet::default(),
        })
    }

    /// Restrict dual binding to the given nodes (and force it on).
    pub fn bind_dual_values(mut self, nodes: &[NodeId]) -> Self {
        self.bind_duals = true;
        self.dual_filter = Some(nodes.iter().copied().collect());
        self
    }

    /// Trace the values of the given nodes as they are computed.
    pub fn watch(mut self, nodes: &[NodeId]) -> Self {
        self.watch.extend(nodes.iter().copied());
        self
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn graph(&self) -> &ExprGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ExprGraph {
        &mut self.graph
    }

    pub fn into_graph(self) -> ExprGraph {
        self.graph
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Bind an input value ("let").
    pub fn let_value(&mut self, node: NodeId, value: Value) -> Result<()> {
        self.graph.bind(node, value)
    }

    pub fn value(&self, node: NodeId) -> Option<&Value> {
        self.graph.value(node)
    }

    pub fn grad(&self, node: NodeId) -> Result<&Value> {
        self.graph.grad(node)
    }

    /// Execute the whole program, then drain deferred gradient
    /// accumulations. Errors carry the failing instruction's identity and
    /// leave the machine `Failed`; `reset` recovers.
    pub fn run_all(&mut self) -> Result<()> {
        if self.state != MachineState::Idle {
            return Err(Error::InvalidMachineState {
                action: "run",
                state: self.state.as_str(),
            });
        }
        self.state = MachineState::Running;
        for pc in 0..self.program.instructions.len() {
            if let Err(e) = self.step(pc) {
                self.state = MachineState::Failed;
                let instr = &self.program.instructions[pc];
                let op = match instr {
                    Instruction::LoadArg { .. } => "load".to_string(),
                    Instruction::Exec { op, .. } => op.to_string(),
                };
                return Err(Error::Instruction {
                    pc,
                    node: instr.node().0,
                    op,
                    source: Box::new(e),
                });
            }
        }
        if let Err(e) = self.drain_deferred() {
            self.state = MachineState::Failed;
            return Err(e);
        }
        self.state = MachineState::Completed;
        Ok(())
    }

    /// Clear every register, drop pending deferrals, destroy dual values,
    /// and return to `Idle`. Bound forward values survive.
    pub fn reset(&mut self) {
        for r in &mut self.registers {
            *r = None;
        }
        self.deferred.clear();
        self.graph.unbind_duals();
        self.state = MachineState::Idle;
    }

    fn step(&mut self, pc: usize) -> Result<()> {
        let instr = self.program.instructions[pc].clone();
        match instr {
            Instruction::LoadArg { node, write_to } => {
                let v = self.graph.value(node).cloned().ok_or_else(|| {
                    Error::UnboundInput {
                        node: node.0,
                        name: self.graph.node(node).name().to_string(),
                    }
                })?;
                log::trace!("{pc:>4} load {node} -> {write_to}");
                self.note_gradient_source(node, &v)?;
                self.registers[write_to.0] = Some(v);
            }
            Instruction::Exec {
                node,
                op,
                read_from,
                write_to,
                prealloc,
                use_unsafe,
            } => {
                let result =
                    self.exec_op(node, op.as_ref(), &read_from, write_to, prealloc, use_unsafe)?;
                self.graph.bind_result(node, result.clone());
                if self.watch.contains(&node) {
                    log::trace!("watch {node} ({op}): {result:?}");
                }
                self.note_gradient_source(node, &result)?;
                self.registers[write_to.0] = Some(result);
            }
        }
        Ok(())
    }

    /// Evaluate one op, picking a strategy in priority order: pre-marked
    /// buffer reuse, leftover-value reuse with fallback, in-place overwrite
    /// of a dying input, then plain allocating evaluation.
    fn exec_op(
        &mut self,
        node: NodeId,
        op: &dyn Op,
        read_from: &[Register],
        write_to: Register,
        prealloc: bool,
        use_unsafe: bool,
    ) -> Result<Value> {
        if prealloc && op.supports_prealloc() {
            // a recycled register can hold a leftover of the wrong shape
            let mut dest = match self.registers[write_to.0].take() {
                Some(v)
                    if &v.shape() == self.graph.shape_of(node)
                        && v.dtype() == self.graph.dtype_of(node) =>
                {
                    v
                }
                _ => Value::zeros(self.graph.shape_of(node), self.graph.dtype_of(node)),
            };
            let inputs = self.gather(read_from)?;
            log::trace!("exec {node} {op} preallocated");
            op.forward_prealloc(&mut dest, &inputs)?;
            return Ok(dest);
        }

        if op.supports_prealloc() {
            if let Some(mut dest) = self.registers[write_to.0].take() {
                {
                    let inputs = self.gather(read_from)?;
                    match op.forward_prealloc(&mut dest, &inputs) {
                        Ok(()) => {
                            log::trace!("exec {node} {op} reusing leftover buffer");
                            return Ok(dest);
                        }
                        Err(e) => log::trace!("exec {node} {op}: buffer reuse fell back ({e})"),
                    }
                }
                let inputs = self.gather(read_from)?;
                return op.forward(&inputs);
            }
        }

        if use_unsafe {
            if let Some(i) = op.overwrites_input() {
                let target = self.registers[read_from[i].0].take().ok_or_else(|| {
                    Error::msg(format!("register {} is empty", read_from[i]))
                })?;
                let rest_regs: Vec<Register> = read_from
                    .iter()
                    .enumerate()
                    .filter_map(|(j, &r)| (j != i).then_some(r))
                    .collect();
                let rest = self.gather(&rest_regs)?;
                log::trace!("exec {node} {op} in place");
                return op.forward_unsafe(target, &rest);
            }
        }

        let inputs = self.gather(read_from)?;
        op.forward(&inputs)
    }

    fn gather(&self, regs: &[Register]) -> Result<Vec<&Value>> {
        regs.iter()
            .map(|r| {
                self.registers[r.0]
                    .as_ref()
                    .ok_or_else(|| Error::msg(format!("register {r} is empty")))
            })
            .collect()
    }

    /// If `node` holds gradients of other nodes, accumulate its value into
    /// each target's dual. Targets with no forward value yet get a deferred
    /// accumulation instead; the queue drains after the pass.
    fn note_gradient_source(&mut self, node: NodeId, v: &Value) -> Result<()> {
        if !self.bind_duals {
            return Ok(());
        }
        let targets = self.graph.node(node).deriv_of();
        if targets.is_empty() {
            return Ok(());
        }
        let targets = targets.to_vec();
        for target in targets {
            if let Some(filter) = &self.dual_filter {
                if !filter.contains(&target) {
                    continue;
                }
            }
            if self.graph.value(target).is_none() {
                log::trace!("deferring gradient accumulation into {target}");
                self.deferred.push(Deferred {
                    target,
                    contribution: v.clone(),
                });
            } else {
                self.graph.accumulate_dual(target, v)?;
            }
        }
        Ok(())
    }

    fn drain_deferred(&mut self) -> Result<()> {
        for d in std::mem::take(&mut self.deferred) {
            log::trace!("draining deferred gradient into {}", d.target);
            self.graph.accumulate_dual(d.target, &d.contribution)?;
        }
        Ok(())
    }
}
