use nalgebra::DMatrix;
use netdesign::{
    FixedBudgetPlacer, IterativeConfig, IterativePlacer, InteriorPointSolver, LowRankBasis,
    SelectionMatrix, VarianceModel,
};
use proptest::prelude::*;
use rand::prelude::*;
use rand::Rng;

fn random_basis(n: usize, r: usize, seed: u64) -> LowRankBasis {
    let mut rng = StdRng::seed_from_u64(seed);
    let a = DMatrix::from_fn(n, r, |_, _| rng.random::<f64>() - 0.5);
    LowRankBasis::new(a.qr().q()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn fixed_budget_returns_exactly_k(seed in any::<u64>(), n in 4usize..10, r in 1usize..3, extra in 0usize..4) {
        let basis = random_basis(n, r, seed);
        let k = (r + extra).min(n);
        let placement = FixedBudgetPlacer::new(InteriorPointSolver::default()).place(&basis, k).unwrap();
        prop_assert_eq!(placement.monitored.len(), k);
        prop_assert_eq!(placement.unmonitored.len(), n - k);
        prop_assert!(placement.monitored.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(placement.variance.per_location.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn iterative_design_terminates_monotonically(
        seed in any::<u64>(),
        n in 4usize..9,
        r in 1usize..3,
        ratio in 1.2f64..4.0,
        epsilon in 0.005f64..0.45,
        n_it in 1usize..6,
    ) {
        let basis = random_basis(n, r, seed);
        let config = IterativeConfig::new(ratio)
            .with_epsilon(epsilon)
            .with_max_inner_iterations(n_it);
        let solver = InteriorPointSolver::default();
        let mut placer = IterativePlacer::new(&basis, &config).unwrap();
        let rho = placer.threshold();

        let mut prev = (Vec::new(), Vec::new());
        let mut outer = 0;
        while !placer.is_complete() {
            placer.step(&solver).unwrap();
            outer += 1;
            prop_assert!(outer <= n * n_it, "no termination within n * n_it iterations");
            prop_assert!(placer.monitored().starts_with(&prev.0));
            prop_assert!(placer.unmonitored().starts_with(&prev.1));
            prev = (placer.monitored().to_vec(), placer.unmonitored().to_vec());
        }
        prop_assert_eq!(placer.decided(), n);

        let selection = SelectionMatrix::new(placer.monitored().iter().copied(), n).unwrap();
        let report = VarianceModel::new(&basis).exact(&selection).unwrap();
        prop_assert!(report.worst_case <= rho * (1.0 + 1e-9), "V(S) = {} > rho = {}", report.worst_case, rho);
    }

    #[test]
    fn selection_ignores_insertion_order(mut indices in prop::collection::vec(0usize..12, 0..12), seed in any::<u64>()) {
        let a = SelectionMatrix::new(indices.clone(), 12).unwrap();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        let b = SelectionMatrix::new(indices, 12).unwrap();
        prop_assert_eq!(a.to_matrix(), b.to_matrix());
        prop_assert_eq!(a, b);
    }

    #[test]
    fn adding_a_location_never_raises_variance(seed in any::<u64>(), extra in 0usize..6) {
        let basis = random_basis(8, 2, seed);
        let model = VarianceModel::new(&basis);
        let small = SelectionMatrix::new([0, 1, 2], 8).unwrap();
        let mut grown = small.indices().to_vec();
        grown.push(3 + extra % 5);
        let large = SelectionMatrix::new(grown, 8).unwrap();
        let (vs, vl) = (model.exact(&small).unwrap(), model.exact(&large).unwrap());
        for (s, l) in vs.per_location.iter().zip(&vl.per_location) {
            prop_assert!(*l <= s + 1e-9);
        }
    }
}
