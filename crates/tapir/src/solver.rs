//! Gradient-descent update over gradient-bearing nodes.

use tapir_core::{DualValue, ExprGraph, NodeId, Result};

/// Plain SGD: `w -= learn_rate * grad / batch_size`, applied in place to
/// each node's dual value.
#[derive(Debug, Clone, Copy)]
pub struct VanillaSolver {
    learn_rate: f64,
    batch_size: f64,
}

impl Default for VanillaSolver {
    fn default() -> Self {
        Self {
            learn_rate: 0.01,
            batch_size: 1.0,
        }
    }
}

impl VanillaSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_learn_rate(mut self, learn_rate: f64) -> Self {
        self.learn_rate = learn_rate;
        self
    }

    pub fn with_batch_size(mut self, batch_size: f64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Apply one update to each node. The nodes must hold duals, so step
    /// before resetting the machine.
    pub fn step(&self, g: &mut ExprGraph, nodes: &[NodeId]) -> Result<()> {
        let factor = -self.learn_rate / self.batch_size;
        for &n in nodes {
            let DualValue { value, d } = g.dual_mut(n)?;
            value.scaled_add_assign(d, factor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapir_core::{DType, Dense, Value};

    #[test]
    fn step_moves_against_the_gradient() {
        let mut g = ExprGraph::new();
        let w = g.vector("w", DType::F64, 2);
        g.bind(
            w,
            Value::Dense(Dense::from_f64_slice(&[1.0, 1.0], [2], DType::F64).unwrap()),
        )
        .unwrap();
        g.accumulate_dual(
            w,
            &Value::Dense(Dense::from_f64_slice(&[2.0, -4.0], [2], DType::F64).unwrap()),
        )
        .unwrap();
        let solver = VanillaSolver::new().with_learn_rate(0.5).with_batch_size(2.0);
        solver.step(&mut g, &[w]).unwrap();
        assert_eq!(g.value(w).unwrap().to_f64_vec(), vec![0.5, 2.0]);
    }

    #[test]
    fn step_requires_a_dual() {
        let mut g = ExprGraph::new();
        let w = g.scalar("w", DType::F64);
        g.bind(w, Value::F64(1.0)).unwrap();
        let solver = VanillaSolver::new();
        assert!(solver.step(&mut g, &[w]).is_err());
    }
}
