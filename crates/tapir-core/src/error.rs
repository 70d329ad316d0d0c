use crate::{DType, Shape};

/// Unified error type for the whole workspace.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{op}: expected {expected} input(s), got {got}")]
    ArityMismatch {
        op: String,
        expected: usize,
        got: usize,
    },

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("rank mismatch: expected {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("dimension {dim} out of range for shape {shape}")]
    DimOutOfRange { dim: usize, shape: Shape },

    #[error("cannot reshape {from} ({from_count} elements) to {to} ({to_count} elements)")]
    ElementCountMismatch {
        from: Shape,
        to: Shape,
        from_count: usize,
        to_count: usize,
    },

    #[error("slice [{start}..{end};{step}] out of bounds along axis {along} of {shape}")]
    SliceOutOfBounds {
        along: usize,
        start: usize,
        end: usize,
        step: usize,
        shape: Shape,
    },

    #[error("{op} does not support {kind}")]
    Unsupported { op: String, kind: &'static str },

    #[error("cannot reuse buffer of shape {buffer} for a result of shape {result}")]
    ReuseMismatch { buffer: Shape, result: Shape },

    #[error("{op} is not differentiable")]
    NonDifferentiable { op: String },

    #[error("node {node} ({name}) has no bound value")]
    UnboundInput { node: usize, name: String },

    #[error("node {node} ({name}) has no gradient")]
    NoGradient { node: usize, name: String },

    #[error("cannot {action} while the machine is {state}")]
    InvalidMachineState {
        action: &'static str,
        state: &'static str,
    },

    #[error("instruction {pc} (node {node}, {op}) failed: {source}")]
    Instruction {
        pc: usize,
        node: usize,
        op: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Msg(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::msg(format!($msg)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::msg(format!($fmt, $($arg)*)))
    };
}
