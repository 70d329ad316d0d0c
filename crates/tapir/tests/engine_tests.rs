use approx::assert_relative_eq;
use tapir::{MachineState, TapeMachine};
use tapir_core::{auto_broadcast_pattern, broadcast, DType, Dense, ExprGraph, Shape, Value};

fn dense(data: &[f64], shape: impl Into<Shape>) -> Value {
    Value::Dense(Dense::from_f64_slice(data, shape, DType::F64).unwrap())
}

// ---------------- broadcasting ----------------

#[test]
fn auto_broadcast_equalizes_extents_and_adds() {
    let mut g = ExprGraph::new();
    let a = g.matrix("a", DType::F64, 2, 3);
    let b = g.matrix("b", DType::F64, 2, 1);
    let pattern = auto_broadcast_pattern(g.shape_of(a), g.shape_of(b)).unwrap();
    let (x, y) = broadcast(&mut g, a, b, pattern).unwrap();
    assert_eq!(g.shape_of(x).dims(), g.shape_of(y).dims());
    let s = g.add(x, y).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(a, dense(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)))
        .unwrap();
    m.let_value(b, dense(&[10.0, 20.0], (2, 1))).unwrap();
    m.run_all().unwrap();
    assert_eq!(
        m.value(s).unwrap().to_f64_vec(),
        vec![11.0, 12.0, 13.0, 24.0, 25.0, 26.0]
    );
}

// ---------------- repeat ----------------

#[test]
fn repeat_shapes() {
    let mut g = ExprGraph::new();
    let x = g.matrix("x", DType::F64, 2, 2);
    let r0 = g.repeat(x, 0, 2).unwrap();
    assert_eq!(g.shape_of(r0), &Shape::from((4, 2)));
    let r1 = g.repeat(x, 1, 2).unwrap();
    assert_eq!(g.shape_of(r1), &Shape::from((2, 4)));
    let s = g.scalar("s", DType::F64);
    let rs = g.repeat(s, 0, 2).unwrap();
    assert_eq!(g.shape_of(rs), &Shape::from(2usize));
}

#[test]
fn repeat_values_interleave_per_index() {
    let mut g = ExprGraph::new();
    let x = g.matrix("x", DType::F64, 2, 2);
    let r = g.repeat(x, 0, 2).unwrap();
    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0, 3.0, 4.0], (2, 2))).unwrap();
    m.run_all().unwrap();
    assert_eq!(
        m.value(r).unwrap().to_f64_vec(),
        vec![1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0]
    );
}

#[test]
fn repeat_gradient_sums_over_repeats() {
    // extent > 1: the output gradient is split into (extent, repeats) and
    // summed over the repeats
    let mut g = ExprGraph::new();
    let x = g.matrix("x", DType::F64, 2, 2);
    let w = g.constant(
        "w",
        dense(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], (4, 2)),
    );
    let r = g.repeat(x, 0, 2).unwrap();
    let p = g.mul(r, w).unwrap();
    let cost = g.sum_all(p).unwrap();
    g.backprop(cost, &[x]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0, 3.0, 4.0], (2, 2))).unwrap();
    m.run_all().unwrap();
    assert_eq!(m.grad(x).unwrap().to_f64_vec(), vec![4.0, 6.0, 12.0, 14.0]);
}

#[test]
fn repeat_gradient_unit_extent() {
    let mut g = ExprGraph::new();
    let x = g.matrix("x", DType::F64, 2, 1);
    let r = g.repeat(x, 1, 3).unwrap();
    let cost = g.sum_all(r).unwrap();
    g.backprop(cost, &[x]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0], (2, 1))).unwrap();
    m.run_all().unwrap();
    let gx = m.grad(x).unwrap();
    assert_eq!(gx.shape(), Shape::from((2, 1)));
    assert_eq!(gx.to_f64_vec(), vec![3.0, 3.0]);
}

#[test]
fn repeat_gradient_scalar_input() {
    let mut g = ExprGraph::new();
    let s = g.scalar("s", DType::F64);
    let r = g.repeat(s, 0, 4).unwrap();
    let cost = g.sum_all(r).unwrap();
    g.backprop(cost, &[s]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(s, Value::F64(7.0)).unwrap();
    m.run_all().unwrap();
    assert_eq!(m.value(cost).unwrap(), &Value::F64(28.0));
    assert_eq!(m.grad(s).unwrap(), &Value::F64(4.0));
}

// ---------------- transpose ----------------

#[test]
fn transpose_round_trip_by_inverse_permutation() {
    let mut g = ExprGraph::new();
    let t = g.tensor("t", DType::F64, (2, 3, 4));
    let tt = g.transpose(t, &[2, 0, 1]).unwrap();
    assert_eq!(g.shape_of(tt), &Shape::from((4, 2, 3)));
    let back = g.transpose(tt, &[1, 2, 0]).unwrap();
    assert_eq!(g.shape_of(back), &Shape::from((2, 3, 4)));

    let data: Vec<f64> = (0..24).map(|i| i as f64).collect();
    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(t, dense(&data, (2, 3, 4))).unwrap();
    m.run_all().unwrap();
    assert_eq!(m.value(back).unwrap().to_f64_vec(), data);
}

#[test]
fn transpose_gradient_is_inverse_permutation() {
    let mut g = ExprGraph::new();
    let t = g.matrix("t", DType::F64, 2, 3);
    let w = g.constant("w", dense(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2)));
    let tt = g.transpose(t, &[1, 0]).unwrap();
    let p = g.mul(tt, w).unwrap();
    let cost = g.sum_all(p).unwrap();
    g.backprop(cost, &[t]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(t, dense(&[0.0; 6], (2, 3))).unwrap();
    m.run_all().unwrap();
    // grad t = w transposed back
    assert_eq!(
        m.grad(t).unwrap().to_f64_vec(),
        vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]
    );
}

// ---------------- concat ----------------

#[test]
fn concat_gradient_slices_one_to_one() {
    let mut g = ExprGraph::new();
    let x = g.vector("x", DType::F64, 2);
    let y = g.vector("y", DType::F64, 2);
    let w = g.constant("w", dense(&[1.0, 2.0, 3.0, 4.0], [4]));
    let c = g.concat(0, &[x, y]).unwrap();
    assert_eq!(g.shape_of(c), &Shape::from(4usize));
    let p = g.mul(c, w).unwrap();
    let cost = g.sum_all(p).unwrap();
    g.backprop(cost, &[x, y]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0], [2])).unwrap();
    m.let_value(y, dense(&[3.0, 4.0], [2])).unwrap();
    m.run_all().unwrap();
    assert_eq!(m.value(cost).unwrap(), &Value::F64(30.0));
    // each operand's gradient is exactly its span of the output gradient
    assert_eq!(m.grad(x).unwrap().to_f64_vec(), vec![1.0, 2.0]);
    assert_eq!(m.grad(y).unwrap().to_f64_vec(), vec![3.0, 4.0]);
}

#[test]
fn concat_gradient_restores_unit_spans() {
    let mut g = ExprGraph::new();
    let x = g.matrix("x", DType::F64, 2, 1);
    let y = g.matrix("y", DType::F64, 2, 2);
    let c = g.concat(1, &[x, y]).unwrap();
    let cost = g.sum_all(c).unwrap();
    g.backprop(cost, &[x, y]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0], (2, 1))).unwrap();
    m.let_value(y, dense(&[3.0, 4.0, 5.0, 6.0], (2, 2))).unwrap();
    m.run_all().unwrap();
    // a unit span collapses the slice axis; the gradient reshapes it back
    assert_eq!(m.grad(x).unwrap().shape(), Shape::from((2, 1)));
    assert_eq!(m.grad(x).unwrap().to_f64_vec(), vec![1.0, 1.0]);
    assert_eq!(m.grad(y).unwrap().shape(), Shape::from((2, 2)));
}

// ---------------- slicing ----------------

#[test]
fn disjoint_slices_accumulate_independent_gradients() {
    let mut g = ExprGraph::new();
    let x = g.vector("x", DType::F64, 4);
    let s1 = g.slice(x, 0, 0, 2).unwrap();
    let s2 = g.slice(x, 0, 2, 4).unwrap();
    let a = g.sum_all(s1).unwrap();
    let b = g.sum_all(s2).unwrap();
    let b2 = g.add(b, b).unwrap();
    let cost = g.add(a, b2).unwrap();
    g.backprop(cost, &[x]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0, 3.0, 4.0], [4])).unwrap();
    m.run_all().unwrap();
    assert_eq!(m.value(cost).unwrap(), &Value::F64(17.0));
    // the first span gets weight 1, the doubled span weight 2, and the
    // scatter never leaks across the boundary
    assert_eq!(m.grad(x).unwrap().to_f64_vec(), vec![1.0, 1.0, 2.0, 2.0]);
}

// ---------------- arithmetic gradients ----------------

#[test]
fn division_gradients() {
    let mut g = ExprGraph::new();
    let x = g.vector("x", DType::F64, 2);
    let y = g.vector("y", DType::F64, 2);
    let q = g.div(x, y).unwrap();
    let cost = g.sum_all(q).unwrap();
    g.backprop(cost, &[x, y]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0], [2])).unwrap();
    m.let_value(y, dense(&[2.0, 4.0], [2])).unwrap();
    m.run_all().unwrap();
    let gx = m.grad(x).unwrap().to_f64_vec();
    let gy = m.grad(y).unwrap().to_f64_vec();
    assert_relative_eq!(gx[0], 0.5);
    assert_relative_eq!(gx[1], 0.25);
    assert_relative_eq!(gy[0], -0.25);
    assert_relative_eq!(gy[1], -0.125);
}

#[test]
fn scalar_operand_gradient_reduces() {
    let mut g = ExprGraph::new();
    let x = g.vector("x", DType::F64, 3);
    let k = g.scalar("k", DType::F64);
    let p = g.mul(x, k).unwrap();
    let cost = g.sum_all(p).unwrap();
    g.backprop(cost, &[x, k]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0, 3.0], [3])).unwrap();
    m.let_value(k, Value::F64(2.0)).unwrap();
    m.run_all().unwrap();
    assert_eq!(m.grad(x).unwrap().to_f64_vec(), vec![2.0, 2.0, 2.0]);
    // dk collects a contribution from every element
    assert_eq!(m.grad(k).unwrap(), &Value::F64(6.0));
}

// ---------------- idempotence ----------------

#[test]
fn run_reset_run_is_bit_identical() {
    let mut g = ExprGraph::new();
    let x = g.vector("x", DType::F64, 2);
    let y = g.vector("y", DType::F64, 2);
    let w = g.constant("w", dense(&[0.25, 0.5, 0.75, 1.0], [4]));
    let c = g.concat(0, &[x, y]).unwrap();
    let p = g.mul(c, w).unwrap();
    let cost = g.sum_all(p).unwrap();
    g.backprop(cost, &[x, y]).unwrap();

    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(x, dense(&[1.0, 2.0], [2])).unwrap();
    m.let_value(y, dense(&[3.0, 4.0], [2])).unwrap();
    m.run_all().unwrap();
    let cost1 = m.value(cost).unwrap().clone();
    let gx1 = m.grad(x).unwrap().clone();
    let gy1 = m.grad(y).unwrap().clone();

    m.reset();
    assert_eq!(m.state(), MachineState::Idle);
    assert!(m.grad(x).is_err());

    m.run_all().unwrap();
    assert_eq!(m.value(cost).unwrap(), &cost1);
    assert_eq!(m.grad(x).unwrap(), &gx1);
    assert_eq!(m.grad(y).unwrap(), &gy1);
}
