use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::DMatrix;
use netdesign::{
    IterativeConfig, LowRankBasis, NetworkPlanner, PlannerConfig, SelectionMatrix, VarianceModel,
};
use rand::prelude::*;

fn random_basis(n: usize, r: usize, rng: &mut StdRng) -> LowRankBasis {
    let a = DMatrix::from_fn(n, r, |_, _| rng.random::<f64>() - 0.5);
    LowRankBasis::new(a.qr().q()).unwrap()
}

fn bench_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement");
    let mut rng = StdRng::seed_from_u64(42);

    let basis = random_basis(60, 5, &mut rng);
    let selection = SelectionMatrix::new((0..60).step_by(4), 60).unwrap();

    group.bench_function("variance_n60_r5_s15", |b| {
        let model = VarianceModel::new(&basis);
        b.iter(|| model.exact(black_box(&selection)).unwrap())
    });

    group.bench_function("fixed_budget_n60_r5_k10", |b| {
        let planner = NetworkPlanner::new(basis.clone(), PlannerConfig::fixed_budget(10));
        b.iter(|| black_box(planner.plan().unwrap()))
    });

    // IRL1ND runs many barrier solves; keep the instance small.
    let small = random_basis(20, 3, &mut rng);
    group.sample_size(10);
    group.bench_function("irl1nd_n20_r3_ratio2", |b| {
        let planner = NetworkPlanner::new(
            small.clone(),
            PlannerConfig::variance_constrained(IterativeConfig::new(2.0)),
        );
        b.iter(|| black_box(planner.plan().unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_placement);
criterion_main!(benches);
