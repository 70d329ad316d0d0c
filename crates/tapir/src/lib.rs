//! Execution layer for tapir expression graphs: the tape compiler, the tape
//! machine, and a vanilla gradient-descent solver.
//!
//! The usual flow: build an [`ExprGraph`](tapir_core::ExprGraph), call
//! `backprop` to record the static backward graph, compile it into a
//! [`TapeMachine`], bind inputs, `run_all`, read values and gradients, step
//! the [`VanillaSolver`], and `reset` for the next pass.

pub mod compile;
pub mod solver;
pub mod vm;

pub use compile::{compile, Instruction, Program, Register};
pub use solver::VanillaSolver;
pub use vm::{MachineState, TapeMachine};

pub mod prelude {
    pub use crate::{MachineState, TapeMachine, VanillaSolver};
    pub use tapir_core::{
        auto_broadcast_pattern, broadcast, BroadcastPattern, DType, Dense, ExprGraph, NodeId,
        Shape, Value,
    };
}
