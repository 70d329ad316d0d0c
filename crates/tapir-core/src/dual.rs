use crate::{Result, Value};

/// A forward value paired with its accumulated gradient.
///
/// Duals are created lazily by the machine when a node receives its first
/// gradient contribution, accumulated into afterwards, and destroyed on
/// machine reset.
#[derive(Debug, Clone, PartialEq)]
pub struct DualValue {
    pub value: Value,
    pub d: Value,
}

impl DualValue {
    /// Wrap a forward value with a zeroed gradient of the same shape.
    pub fn unit(value: Value) -> DualValue {
        let d = value.zeros_like();
        DualValue { value, d }
    }

    pub fn accumulate(&mut self, contribution: &Value) -> Result<()> {
        self.d.add_assign(contribution)
    }
}
