//! Design a monitoring network for a synthetic 1-D field.
//!
//! Training snapshots are sums of a few smooth spatial modes with random
//! amplitudes plus small noise. The leading left singular vectors of the
//! centered snapshots form the basis; both placement strategies are run and
//! the resulting networks are scored by reconstructing held-out snapshots.
//!
//! Run: `cargo run --example design_network`

use nalgebra::{DMatrix, DVector};
use netdesign::{
    error_variance, rmse_per_snapshot, IterativeConfig, LowRankBasis, NetworkDesign,
    NetworkPlanner, PlannerConfig, Reconstructor,
};
use rand::prelude::*;

const LOCATIONS: usize = 40;
const MODES: usize = 4;

fn snapshots(count: usize, rng: &mut StdRng) -> DMatrix<f64> {
    let amplitudes = DMatrix::from_fn(MODES, count, |_, _| rng.random::<f64>() - 0.5);
    let modes = DMatrix::from_fn(LOCATIONS, MODES, |i, m| {
        let x = i as f64 / (LOCATIONS - 1) as f64;
        let m = (m + 1) as f64;
        (std::f64::consts::PI * m * x).sin() / m
    });
    let noise = DMatrix::from_fn(LOCATIONS, count, |_, _| 1e-3 * (rng.random::<f64>() - 0.5));
    (modes * amplitudes + noise).add_scalar(2.0)
}

fn report(label: &str, design: &NetworkDesign, basis: &LowRankBasis, test: &DMatrix<f64>) {
    println!("--- {label} ---");
    println!("monitored ({}): {:?}", design.monitored.len(), design.monitored);
    println!(
        "worst-case variance {:.4} ({:.2}x fully monitored{})",
        design.variance.worst_case,
        design.variance_ratio(),
        if design.variance.exact { "" } else { ", approximate" }
    );
    if let Some(rho) = design.threshold {
        println!("threshold {rho:.4}, met: {}", design.meets_threshold());
    }

    let rec = Reconstructor::new(basis, &design.selection().unwrap()).unwrap();
    let estimate = rec.reconstruct_snapshots(test).unwrap();
    let rmse = rmse_per_snapshot(test, &estimate).unwrap();
    let mean_rmse = rmse.iter().sum::<f64>() / rmse.len() as f64;
    let var = error_variance(test, &estimate).unwrap();
    println!("mean RMSE {mean_rmse:.2e}, max error variance {:.2e}\n", var.max());
}

fn main() {
    let mut rng = StdRng::seed_from_u64(2024);
    let train = snapshots(120, &mut rng);
    let test = snapshots(30, &mut rng);

    let mean = DVector::from_iterator(LOCATIONS, train.row_iter().map(|r| r.mean()));
    let mut centered = train.clone();
    for mut col in centered.column_iter_mut() {
        col -= &mean;
    }
    let svd = centered.svd(true, false);
    let u = svd.u.expect("left singular vectors requested");
    let basis = LowRankBasis::from_singular_vectors(&u, MODES)
        .and_then(|b| b.with_mean(mean))
        .unwrap();

    let fixed = NetworkPlanner::new(basis.clone(), PlannerConfig::fixed_budget(MODES + 2))
        .plan()
        .unwrap();
    report("D-optimal, 6 sensors", &fixed, &basis, &test);

    for ratio in [1.5, 3.0] {
        let design = NetworkPlanner::new(
            basis.clone(),
            PlannerConfig::variance_constrained(IterativeConfig::new(ratio)),
        )
        .plan()
        .unwrap();
        report(&format!("IRL1ND, ratio {ratio}"), &design, &basis, &test);
    }
}
