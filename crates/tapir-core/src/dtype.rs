use crate::{Error, Result};

/// Element type of a value's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I64,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I64 => "i64",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bridge between Rust element types and [`DType`], for generic storage code.
pub trait WithDType:
    Sized + Copy + num_traits::NumCast + std::cmp::PartialEq + std::fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Result<Self>;

    fn zero() -> Self;
    fn one() -> Self;
}

macro_rules! with_dtype {
    ($ty:ty, $dtype:ident, $zero:expr, $one:expr) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Result<Self> {
                num_traits::cast(v).ok_or_else(|| {
                    Error::msg(format!("cannot represent {v} as {}", DType::$dtype))
                })
            }

            fn zero() -> Self {
                $zero
            }

            fn one() -> Self {
                $one
            }
        }
    };
}

with_dtype!(f32, F32, 0.0, 1.0);
with_dtype!(f64, F64, 0.0, 1.0);
with_dtype!(i64, I64, 0, 1);
