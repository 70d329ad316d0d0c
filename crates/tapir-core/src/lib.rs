//! Core primitives for tapir: shapes, runtime values, the broadcast algebra,
//! the operation contract, concrete operations, and the expression graph
//! with its symbolic backward-pass builder.
//!
//! The execution layer (tape compiler, tape machine, solver) lives in the
//! `tapir` crate.

pub mod broadcast;
pub mod dtype;
pub mod dual;
pub mod error;
pub mod graph;
pub mod op;
pub mod ops;
pub mod shape;
pub mod value;

pub use broadcast::{auto_broadcast_pattern, broadcast, BroadcastPattern, MAX_BROADCAST_AXES};
pub use dtype::{DType, WithDType};
pub use dual::DualValue;
pub use error::{Error, Result};
pub use graph::{Bound, ExprGraph, Node, NodeId};
pub use op::{check_arity, Op, ShapeDesc};
pub use shape::Shape;
pub use value::{BinaryKind, Buffer, Dense, Value};
