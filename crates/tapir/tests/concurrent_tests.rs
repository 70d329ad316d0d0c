use approx::assert_relative_eq;
use tapir::{TapeMachine, VanillaSolver};
use tapir_core::{DType, Dense, ExprGraph, NodeId, Value};

fn dense(data: &[f64], shape: impl Into<tapir_core::Shape>) -> Value {
    Value::Dense(Dense::from_f64_slice(data, shape, DType::F64).unwrap())
}

/// Squared-error model over a two-weight linear predictor. Returns the graph
/// plus the nodes a trainer needs to bind and read.
fn build_model() -> (ExprGraph, NodeId, NodeId, NodeId, NodeId) {
    let mut g = ExprGraph::new();
    let w = g.vector("w", DType::F64, 2);
    let x = g.vector("x", DType::F64, 2);
    let y = g.scalar("y", DType::F64);
    let wx = g.mul(x, w).unwrap();
    let p = g.sum_all(wx).unwrap();
    let diff = g.sub(p, y).unwrap();
    let cost = g.mul(diff, diff).unwrap();
    g.backprop(cost, &[w]).unwrap();
    (g, w, x, y, cost)
}

#[test]
fn machine_per_thread_trains_disjoint_batches() {
    let batches: Vec<(Vec<f64>, f64)> = vec![
        (vec![1.0, 0.0], 1.0),
        (vec![0.0, 1.0], 1.0),
        (vec![1.0, 1.0], 0.0),
    ];
    let w0 = [0.5, -0.5];
    let solver = VanillaSolver::new().with_learn_rate(0.1);

    let results: Vec<(f64, Vec<f64>, Vec<f64>)> = std::thread::scope(|s| {
        let handles: Vec<_> = batches
            .iter()
            .map(|(bx, by)| {
                s.spawn(move || {
                    let (g, w, x, y, cost) = build_model();
                    let mut m = TapeMachine::new(g).unwrap();
                    m.let_value(w, dense(&w0, [2])).unwrap();
                    m.let_value(x, dense(bx, [2])).unwrap();
                    m.let_value(y, Value::F64(*by)).unwrap();
                    m.run_all().unwrap();
                    let c = m.value(cost).unwrap().to_f64().unwrap();
                    let gw = m.grad(w).unwrap().to_f64_vec();
                    solver.step(m.graph_mut(), &[w]).unwrap();
                    let w1 = m.graph().value(w).unwrap().to_f64_vec();
                    (c, gw, w1)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // each thread sees only its own batch: grad w = 2 * (pred - y) * x
    let (c0, g0, w1_0) = &results[0];
    assert_relative_eq!(*c0, 0.25);
    assert_eq!(g0, &vec![-1.0, 0.0]);
    assert_eq!(w1_0, &vec![0.6, -0.5]);

    let (c1, g1, w1_1) = &results[1];
    assert_relative_eq!(*c1, 2.25);
    assert_eq!(g1, &vec![0.0, -3.0]);
    assert_eq!(w1_1, &vec![0.5, -0.2]);

    let (c2, g2, w1_2) = &results[2];
    assert_relative_eq!(*c2, 0.0);
    assert_eq!(g2, &vec![0.0, 0.0]);
    assert_eq!(w1_2, &vec![0.5, -0.5]);
}

#[test]
fn training_loop_converges() {
    let (g, w, x, y, cost) = build_model();
    let w0 = Dense::rand_normal([2], DType::F64, 0.0, 0.08).unwrap();
    let mut m = TapeMachine::new(g).unwrap();
    m.let_value(w, Value::Dense(w0)).unwrap();
    m.let_value(x, dense(&[1.0, 2.0], [2])).unwrap();
    m.let_value(y, Value::F64(3.0)).unwrap();
    let solver = VanillaSolver::new().with_learn_rate(0.05);

    let mut first = None;
    let mut last = 0.0;
    for _ in 0..50 {
        m.run_all().unwrap();
        last = m.value(cost).unwrap().to_f64().unwrap();
        first.get_or_insert(last);
        // step before reset: reset destroys the duals the update reads
        solver.step(m.graph_mut(), &[w]).unwrap();
        m.reset();
    }
    assert!(last <= first.unwrap());
    assert!(last < 1e-3, "cost did not converge: {last}");
}
