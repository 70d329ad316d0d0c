//! Concrete operations.

pub mod arith;
pub mod tensor;

pub use arith::{ElemBinOp, Neg, Sum};
pub use tensor::{At, Concat, Repeat, Reshape, SizeOf, Slice, SliceIncr, Transpose};
