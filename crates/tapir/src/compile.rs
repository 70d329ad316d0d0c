//! Lowering an expression graph to a register program.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use tapir_core::{Error, ExprGraph, NodeId, Op, Result};

/// Index into the machine's register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(pub usize);

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Instruction {
    /// Copy a leaf node's bound value into a register.
    LoadArg { node: NodeId, write_to: Register },
    /// Evaluate an op over input registers into a destination register.
    Exec {
        node: NodeId,
        op: Arc<dyn Op>,
        read_from: Vec<Register>,
        write_to: Register,
        /// The destination is pre-marked for buffer-reuse evaluation.
        prealloc: bool,
        /// The overwritten input's register dies here; in-place is safe.
        use_unsafe: bool,
    },
}

impl Instruction {
    pub fn node(&self) -> NodeId {
        match self {
            Instruction::LoadArg { node, .. } => *node,
            Instruction::Exec { node, .. } => *node,
        }
    }

    pub fn write_to(&self) -> Register {
        match self {
            Instruction::LoadArg { write_to, .. } => *write_to,
            Instruction::Exec { write_to, .. } => *write_to,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::LoadArg { node, write_to } => write!(f, "load {node} -> {write_to}"),
            Instruction::Exec {
                node,
                op,
                read_from,
                write_to,
                prealloc,
                use_unsafe,
            } => {
                write!(f, "exec {node} {op} [")?;
                for (i, r) in read_from.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{r}")?;
                }
                write!(f, "] -> {write_to}")?;
                if *prealloc {
                    write!(f, " (prealloc)")?;
                }
                if *use_unsafe {
                    write!(f, " (unsafe)")?;
                }
                Ok(())
            }
        }
    }
}

/// A compiled graph: instructions in execution order plus the register
/// assignment.
#[derive(Debug, Clone)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub n_registers: usize,
    registers: FxHashMap<NodeId, Register>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn register_of(&self, node: NodeId) -> Option<Register> {
        self.registers.get(&node).copied()
    }
}

/// Compile a graph to a [`Program`].
///
/// Leaves load first (in topological encounter order), then ops follow in
/// topological order. Registers are assigned by linear scan with a free
/// list: a register returns to the pool once its node's last reader has
/// executed, which is what lets later instructions find a leftover value in
/// their destination and reuse its buffer.
pub fn compile(g: &ExprGraph) -> Result<Program> {
    let topo = g.topo_order();
    let mut order: Vec<NodeId> = topo
        .iter()
        .copied()
        .filter(|&id| g.node(id).is_leaf())
        .collect();
    order.extend(topo.iter().copied().filter(|&id| !g.node(id).is_leaf()));

    let mut last_read: FxHashMap<NodeId, usize> = FxHashMap::default();
    for (pos, &id) in order.iter().enumerate() {
        for &inp in g.node(id).inputs() {
            last_read.insert(inp, pos);
        }
    }

    let mut registers: FxHashMap<NodeId, Register> = FxHashMap::default();
    let mut free: Vec<usize> = Vec::new();
    let mut next = 0usize;
    let mut instructions = Vec::with_capacity(order.len());

    for (pos, &id) in order.iter().enumerate() {
        let node = g.node(id);
        let reads: Vec<Register> = node.inputs().iter().map(|i| registers[i]).collect();
        // the destination is allocated before the inputs are freed, so it
        // never aliases a register this instruction still reads
        let dest = Register(free.pop().unwrap_or_else(|| {
            let r = next;
            next += 1;
            r
        }));
        registers.insert(id, dest);

        let instr = if node.is_leaf() {
            Instruction::LoadArg {
                node: id,
                write_to: dest,
            }
        } else {
            let op = node
                .op()
                .cloned()
                .ok_or_else(|| Error::msg(format!("non-leaf node {id} has no op")))?;
            let use_unsafe = match op.overwrites_input() {
                Some(i) => {
                    let target = node.inputs()[i];
                    let treg = reads[i];
                    last_read.get(&target) == Some(&pos)
                        && reads.iter().filter(|&&r| r == treg).count() == 1
                }
                None => false,
            };
            Instruction::Exec {
                node: id,
                op: op.clone(),
                read_from: reads,
                write_to: dest,
                prealloc: op.calls_extern(),
                use_unsafe,
            }
        };
        log::debug!("{pos:>4} {instr}");
        instructions.push(instr);

        for &inp in node.inputs() {
            if last_read.get(&inp) == Some(&pos) {
                let r = registers[&inp];
                if !free.contains(&r.0) {
                    free.push(r.0);
                }
            }
        }
    }

    Ok(Program {
        instructions,
        n_registers: next,
        registers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapir_core::DType;

    #[test]
    fn leaves_load_before_ops() {
        let mut g = ExprGraph::new();
        let x = g.vector("x", DType::F64, 2);
        let y = g.vector("y", DType::F64, 2);
        let s = g.add(x, y).unwrap();
        let c = g.sum_all(s).unwrap();
        let p = compile(&g).unwrap();
        assert_eq!(p.len(), 4);
        assert!(matches!(p.instructions[0], Instruction::LoadArg { .. }));
        assert!(matches!(p.instructions[1], Instruction::LoadArg { .. }));
        assert_eq!(p.instructions[3].node(), c);
        assert!(p.register_of(s).is_some());
    }

    #[test]
    fn registers_are_reused() {
        let mut g = ExprGraph::new();
        let x = g.vector("x", DType::F64, 2);
        let y = g.vector("y", DType::F64, 2);
        let s = g.add(x, y).unwrap();
        let n = g.neg(s).unwrap();
        let _c = g.sum_all(n).unwrap();
        let p = compile(&g).unwrap();
        // x and y die at the add; their registers come back for later nodes
        assert!(p.n_registers < p.len());
    }

    #[test]
    fn dying_overwritable_input_marks_unsafe() {
        let mut g = ExprGraph::new();
        let x = g.vector("x", DType::F64, 2);
        let y = g.vector("y", DType::F64, 2);
        let s = g.add(x, y).unwrap();
        let _t = g.neg(s).unwrap();
        let p = compile(&g).unwrap();
        let add = p
            .instructions
            .iter()
            .find(|i| i.node() == s)
            .expect("add instruction");
        match add {
            Instruction::Exec { use_unsafe, .. } => assert!(use_unsafe),
            _ => panic!("expected an exec instruction"),
        }
        // x + x reads the target register twice; in-place is not safe
        let mut g = ExprGraph::new();
        let x = g.vector("x", DType::F64, 2);
        let d = g.add(x, x).unwrap();
        let p = compile(&g).unwrap();
        let add = p.instructions.iter().find(|i| i.node() == d).unwrap();
        match add {
            Instruction::Exec { use_unsafe, .. } => assert!(!use_unsafe),
            _ => panic!("expected an exec instruction"),
        }
    }
}
