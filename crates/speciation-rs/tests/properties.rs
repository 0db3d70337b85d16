//! End-to-end properties of the speciation engine.

use approx::assert_relative_eq;
use ndarray::{array, Array1, Array2};
use std::sync::atomic::AtomicBool;
use titra_core::{Schedule, SolverOptions, TitraError};
use titra_speciation::polymer;
use titra_speciation::{
    BindingModel, Bounds, FreeConcentrationSolver, GeneralModel, SequentialDriver, SpeciationModel,
    Stoichiometry, WarmStart,
};

const MASS_BALANCE_TOL: f64 = 1e-6 * 1.001;

fn host_guest(rows: &[Vec<i32>], constants: &[f64]) -> SpeciationModel {
    let s = Stoichiometry::from_rows(&["H", "G"], rows).unwrap();
    SpeciationModel::from_flat(s, constants).unwrap()
}

/// Complexes, a capped and an uncapped polymer of H in one model
fn mixed_model() -> SpeciationModel {
    host_guest(
        &[vec![1, 1], vec![1, 2], vec![-1, 0], vec![-1, 1]],
        // HG, HG₂, H₂, Hₙ, HₙG
        &[1e4, 1e7, 50.0, 300.0, 20.0],
    )
}

fn guest_titration(host: f64, max_guest: f64, n: usize) -> Array2<f64> {
    Array2::from_shape_fn((n, 2), |(i, j)| {
        if j == 0 {
            host
        } else {
            max_guest * i as f64 / (n - 1) as f64
        }
    })
}

fn assert_mass_balance(model: &SpeciationModel, free: &Array1<f64>, bound: &Array1<f64>, total: &Array1<f64>) {
    let r = model.mass_balance_residual(free, bound, total).unwrap();
    for j in 0..total.len() {
        if total[j] > 0.0 {
            assert!(
                r[j].abs() <= MASS_BALANCE_TOL * total[j],
                "component {}: residual {:e}, total {:e}",
                j,
                r[j],
                total[j]
            );
        } else {
            assert_eq!(r[j], 0.0);
        }
    }
}

#[test]
fn mass_balance_holds_across_models() {
    let cases = vec![
        (host_guest(&[vec![1, 1]], &[1e4]), array![1e-3, 2e-3]),
        (host_guest(&[vec![1, 1], vec![2, 1], vec![1, 2]], &[1e5, 1e9, 1e8]), array![2e-3, 1e-3]),
        (host_guest(&[vec![-1, 0]], &[100.0, 1e4]), array![1e-4, 5e-3]),
        (mixed_model(), array![1e-3, 1e-3]),
        (mixed_model(), array![1e-3, 1e-1]),
        (mixed_model(), array![1e-6, 1e-3]),
    ];
    for (model, total) in cases {
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        let sol = solver.solve(&total, None).unwrap();
        assert!(sol.converged, "gradient {:e} at {}", sol.gradient_norm, total);
        assert_mass_balance(&model, &sol.free, &sol.bound, &total);
        assert!(sol.free.iter().all(|f| *f > 0.0));
        assert!(sol.bound.iter().all(|b| *b >= 0.0));
    }
}

#[test]
fn zero_totals_give_zero_species() {
    let model = mixed_model();
    let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());

    // No guest: nothing containing G may form
    let sol = solver.solve(&array![1e-3, 0.0], None).unwrap();
    assert_eq!(sol.free[1], 0.0);
    let contains_guest = model.stoichiometry().output_contains(1);
    for (b, has_guest) in sol.bound.iter().zip(contains_guest) {
        if has_guest {
            assert_eq!(*b, 0.0);
        }
    }
    // The uncapped polymer still forms
    assert!(sol.bound[2] > 0.0);
    assert_mass_balance(&model, &sol.free, &sol.bound, &array![1e-3, 0.0]);

    // No host: only free guest
    let sol = solver.solve(&array![0.0, 1e-3], None).unwrap();
    assert_eq!(sol.free[0], 0.0);
    assert!(sol.bound.iter().all(|b| *b == 0.0));
    assert_relative_eq!(sol.free[1], 1e-3, max_relative = 1e-9);
}

#[test]
fn bound_species_grow_with_their_total() {
    let tight = SolverOptions {
        gradient_tolerance: 1e-10,
        ..Default::default()
    };

    // 1:1: HG rises with either total
    let model = host_guest(&[vec![1, 1]], &[1e4]);
    let solver = FreeConcentrationSolver::new(&model, tight);
    let base = solver.solve(&array![1e-3, 1e-3], None).unwrap();
    for j in 0..2 {
        let mut total = array![1e-3, 1e-3];
        total[j] *= 1.01;
        let bumped = solver.solve(&total, None).unwrap();
        assert!(bumped.bound[0] > base.bound[0]);
        assert!(bumped.free[j] > base.free[j]);
    }

    // Pure polymer: both unit counts rise with the total
    let model = host_guest(&[vec![-1, 0]], &[100.0, 1e4]);
    let solver = FreeConcentrationSolver::new(&model, tight);
    let mut previous = solver.solve(&array![1e-5, 0.0], None).unwrap();
    for total in [2e-5, 5e-5, 1e-4, 2e-4] {
        let next = solver.solve(&array![total, 0.0], None).unwrap();
        assert!(next.free[0] > previous.free[0]);
        assert!(next.bound[0] > previous.bound[0]);
        assert!(next.bound[1] > previous.bound[1]);
        previous = next;
    }

    // Mixed model: free guest rises with total guest
    let model = mixed_model();
    let solver = FreeConcentrationSolver::new(&model, tight);
    let mut previous = solver.solve(&array![1e-3, 1e-4], None).unwrap();
    for guest in [2e-4, 5e-4, 1e-3, 2e-3, 5e-3] {
        let next = solver.solve(&array![1e-3, guest], None).unwrap();
        assert!(next.free[1] > previous.free[1]);
        previous = next;
    }
}

#[test]
fn converged_free_is_a_fixed_point() {
    let model = mixed_model();
    let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
    let total = array![1e-3, 7e-4];
    let sol = solver.solve(&total, None).unwrap();
    let again = solver
        .solve_with_bounds(&total, &Bounds::fixed(&sol.free), None)
        .unwrap();
    for (a, b) in sol.free.iter().zip(again.free.iter()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-12);
    }
    for (a, b) in sol.bound.iter().zip(again.bound.iter()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-10);
    }
}

#[test]
fn one_to_one_matches_quadratic() {
    let (ht, gt, k): (f64, f64, f64) = (1e-3, 1e-3, 1e4);
    let s = ht + gt + 1.0 / k;
    let hg = (s - (s * s - 4.0 * ht * gt).sqrt()) / 2.0;

    let model = host_guest(&[vec![1, 1]], &[k]);
    let options = SolverOptions {
        gradient_tolerance: 1e-12,
        ..Default::default()
    };
    let sol = FreeConcentrationSolver::new(&model, options)
        .solve(&array![ht, gt], None)
        .unwrap();
    assert_relative_eq!(sol.bound[0], hg, max_relative = 1e-8);
    assert_relative_eq!(sol.free[0], ht - hg, max_relative = 1e-8);

    let closed = BindingModel::OneToOne.run(&[k], &array![[ht, gt]]).unwrap();
    assert_relative_eq!(closed.bound[[0, 0]], hg, max_relative = 1e-10);
}

#[test]
fn dimerization_balance() {
    let (ht, k) = (1e-3, 1e5);
    let model = SpeciationModel::from_flat(
        Stoichiometry::from_rows(&["H"], &[vec![2]]).unwrap(),
        &[k],
    )
    .unwrap();
    let options = SolverOptions {
        gradient_tolerance: 1e-12,
        ..Default::default()
    };
    let sol = FreeConcentrationSolver::new(&model, options)
        .solve(&array![ht], None)
        .unwrap();
    let (h, h2) = (sol.free[0], sol.bound[0]);
    assert_relative_eq!(h + 2.0 * h2, ht, max_relative = 1e-10);
    assert_relative_eq!(h2, k * h * h, max_relative = 1e-12);

    let closed = BindingModel::Dimerization.run(&[k], &array![[ht]]).unwrap();
    assert_relative_eq!(closed.free[[0, 0]], h, max_relative = 1e-8);
}

#[test]
fn pure_polymer_matches_exact_root() {
    let (k2, kn, total) = (100.0, 1e4, 1e-4);
    let model = SpeciationModel::from_flat(
        Stoichiometry::from_rows(&["H"], &[vec![-1]]).unwrap(),
        &[k2, kn],
    )
    .unwrap();
    let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
    let total = array![total];

    let sol = solver.solve(&total, None).unwrap();
    assert!(sol.free[0] * kn < 1.0);
    assert_mass_balance(&model, &sol.free, &sol.bound, &total);

    let exact = polymer::exact_free_single(total[0], k2, kn).unwrap();
    assert_relative_eq!(sol.free[0], exact, max_relative = 1e-5);

    let pinned = solver
        .solve_with_bounds(&total, &Bounds::fixed(&array![exact]), None)
        .unwrap();
    assert!(pinned.converged);
    assert_relative_eq!(pinned.free[0], exact, max_relative = 1e-12);
    assert_mass_balance(&model, &pinned.free, &pinned.bound, &total);
}

#[test]
fn warm_start_does_not_change_the_answer() {
    let model = mixed_model();
    let totals = guest_titration(1e-3, 4e-3, 15);
    let continuation = SequentialDriver::new(&model, SolverOptions::default())
        .run(&totals)
        .unwrap();
    let cold = SequentialDriver::new(&model, SolverOptions::default())
        .with_warm_start(WarmStart::UpperBound)
        .run(&totals)
        .unwrap();
    for (a, b) in continuation.free.iter().zip(cold.free.iter()) {
        assert_relative_eq!(*a, *b, max_relative = 1e-4, epsilon = 1e-15);
    }
    assert!(continuation.max_mass_balance_error(&model, &totals).unwrap() <= MASS_BALANCE_TOL);
    assert!(cold.max_mass_balance_error(&model, &totals).unwrap() <= MASS_BALANCE_TOL);
}

#[test]
fn dilution_series() {
    // Both totals fall point to point
    let model = host_guest(&[vec![1, 1], vec![1, 2]], &[1e4, 1e7]);
    let totals = Array2::from_shape_fn((8, 2), |(i, j)| {
        let dilution = 0.8_f64.powi(i as i32);
        if j == 0 {
            1e-3 * dilution
        } else {
            2e-3 * dilution
        }
    });
    let s = SequentialDriver::new(&model, SolverOptions::default())
        .run(&totals)
        .unwrap();
    assert_eq!(s.stats.accuracy_warnings, 0);
    assert!(s.max_mass_balance_error(&model, &totals).unwrap() <= MASS_BALANCE_TOL);
}

#[test]
fn general_model_schedules() {
    let stoich = Stoichiometry::from_rows(&["H", "G"], &[vec![1, 1], vec![-1, 0]]).unwrap();
    let totals = guest_titration(5e-4, 2e-3, 12);
    let constants = [1e4, 100.0, 1e3];

    let mut runs = Vec::new();
    for schedule in [Schedule::Sequential, Schedule::Parallel, Schedule::TwoPass] {
        let mut general = GeneralModel::new(stoich.clone());
        general.schedule = schedule;
        let model = BindingModel::General(general);
        assert_eq!(model.name(), "general");
        runs.push(model.run(&constants, &totals).unwrap());
    }
    for other in &runs[1..] {
        assert_eq!(other.stats.points, 12);
        for (a, b) in runs[0].bound.iter().zip(other.bound.iter()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-4, epsilon = 1e-15);
        }
    }
}

#[test]
fn cancellation_between_points() {
    let model = mixed_model();
    let flag = AtomicBool::new(true);
    let err = SequentialDriver::new(&model, SolverOptions::default())
        .with_cancel(&flag)
        .run_two_pass(&guest_titration(1e-3, 1e-3, 4))
        .unwrap_err();
    assert!(matches!(err, TitraError::Cancelled { completed: 0 }));
}

#[test]
fn invalid_constants_are_reported() {
    let s = Stoichiometry::from_rows(&["H", "G"], &[vec![1, 1]]).unwrap();
    let err = SpeciationModel::from_flat(s, &[0.0]).unwrap_err();
    assert!(matches!(err, TitraError::Domain(_)));
    assert!(err.to_string().contains("HG"));
}
