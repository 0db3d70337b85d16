//! Free-concentration solver for a single addition point.
//!
//! Each call runs Bounding → Minimizing → (Refining) → Solved:
//!
//! 1. **Bounding**: the upper bound on each free concentration is the
//!    smaller of the complex ceiling (the total) and the polymer ceiling.
//!    The lower bound is the root of the chord from `free = 0` to the upper
//!    bound of the mass-balance function, with every other component held
//!    at its upper bound. Both are mapped to `x = total · log10(free)`.
//! 2. **Minimizing**: box-constrained L-BFGS on the potential.
//! 3. **Refining**: if the gradient tolerance is missed, the potential is
//!    multiplied by `rescale_factor` and minimized again from the best
//!    point; the better of the two attempts is kept.
//!
//! Components with zero total never enter the variable vector.

use crate::complex::ComplexTerms;
use crate::constants::EquilibriumConstants;
use crate::minimize::{self, BoxBounds, Evaluation, Objective, Scaled};
use crate::polymer::PolymerTerms;
use crate::stoichiometry::Stoichiometry;
use crate::{ln_concentrations, Contribution, EquilibriumTerms};
use log::debug;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_10;
use titra_core::{Result, SolverOptions, TitraError};

// =============================================================================
// MODEL
// =============================================================================

/// Stoichiometry with its constants resolved into the two submodels
#[derive(Debug, Clone)]
pub struct SpeciationModel {
    stoichiometry: Stoichiometry,
    constants: EquilibriumConstants,
    complexes: ComplexTerms,
    polymers: PolymerTerms,
}

impl SpeciationModel {
    pub fn new(stoichiometry: Stoichiometry, constants: EquilibriumConstants) -> Result<Self> {
        constants.validate(&stoichiometry)?;
        let complexes = ComplexTerms::new(stoichiometry.complex_matrix(), &constants.complex)?;
        let polymers = PolymerTerms::new(&stoichiometry, &constants.polymer, &constants.kabs)?;
        Ok(Self {
            stoichiometry,
            constants,
            complexes,
            polymers,
        })
    }

    /// Constants as a flat vector ordered like the variable names
    pub fn from_flat(stoichiometry: Stoichiometry, values: &[f64]) -> Result<Self> {
        let constants = EquilibriumConstants::from_flat(&stoichiometry, values)?;
        Self::new(stoichiometry, constants)
    }

    pub fn stoichiometry(&self) -> &Stoichiometry {
        &self.stoichiometry
    }

    pub fn constants(&self) -> &EquilibriumConstants {
        &self.constants
    }

    pub fn n_components(&self) -> usize {
        self.stoichiometry.n_components()
    }

    fn terms(&self) -> [&dyn EquilibriumTerms; 2] {
        [&self.complexes, &self.polymers]
    }

    /// Potential terms of all bound species at `ln_free`
    pub fn contribution(&self, ln_free: &Array1<f64>) -> Contribution {
        let mut acc = Contribution::zeros(self.n_components());
        for terms in self.terms() {
            terms.accumulate(ln_free, &mut acc);
        }
        acc
    }

    /// Bound vector: complexes, then polymer terminal/internal pairs
    pub fn bound_concentrations(&self, free: &Array1<f64>) -> Array1<f64> {
        let ln_free = ln_concentrations(free);
        let complexes = self.complexes.concentrations(&ln_free);
        let polymers = self.polymers.concentrations(&ln_free);
        complexes.iter().chain(polymers.iter()).copied().collect()
    }

    /// Smallest ceiling imposed by any submodel
    pub fn upper_bounds(&self, total: &Array1<f64>) -> Result<Array1<f64>> {
        let mut upper = Array1::from_elem(total.len(), f64::INFINITY);
        for terms in self.terms() {
            let bound = terms.upper_bounds(total)?;
            upper.zip_mut_with(&bound, |u, &b| *u = u.min(b));
        }
        Ok(upper)
    }

    /// `free + bound − total` per component
    pub fn mass_balance_residual(
        &self,
        free: &Array1<f64>,
        bound: &Array1<f64>,
        total: &Array1<f64>,
    ) -> Result<Array1<f64>> {
        let held = self.stoichiometry.bound_totals(bound)?;
        Ok(free + &held - total)
    }
}

// =============================================================================
// POTENTIAL
// =============================================================================

/// The convex potential in `x = total · log10(free)` over active components
struct Potential<'a> {
    model: &'a SpeciationModel,
    active: &'a [usize],
    total: Array1<f64>,
    bounds: &'a BoxBounds,
}

impl Potential<'_> {
    fn ln_free(&self, x: &Array1<f64>) -> Array1<f64> {
        let mut ln_free = Array1::from_elem(self.model.n_components(), f64::NEG_INFINITY);
        for (k, &j) in self.active.iter().enumerate() {
            ln_free[j] = LN_10 * x[k] / self.total[k];
        }
        ln_free
    }

    fn free(&self, x: &Array1<f64>) -> Array1<f64> {
        let mut free = Array1::zeros(self.model.n_components());
        for (k, &j) in self.active.iter().enumerate() {
            free[j] = (LN_10 * x[k] / self.total[k]).exp();
        }
        free
    }

    /// Evaluation at a point inside the box
    fn exact(&self, x: &Array1<f64>) -> Evaluation {
        let ln_free = self.ln_free(x);
        let terms = self.model.contribution(&ln_free);
        let n = self.active.len();

        let mut value = terms.objective;
        let mut gradient = Array1::zeros(n);
        let mut hessian_diagonal = Array1::zeros(n);
        for (k, &j) in self.active.iter().enumerate() {
            let free = ln_free[j].exp();
            let total = self.total[k];
            let scale = LN_10 / total;
            value += free - LN_10 * x[k];
            gradient[k] = scale * (free + terms.gradient[j] - total);
            hessian_diagonal[k] = scale * scale * (free + terms.hessian_diagonal[j]);
        }
        Evaluation {
            value,
            gradient,
            hessian_diagonal,
        }
    }
}

impl Objective for Potential<'_> {
    /// Outside the box: the tangent plane at the clipped point
    fn evaluate(&self, x: &Array1<f64>) -> Evaluation {
        let clipped = self.bounds.projected(x);
        let mut eval = self.exact(&clipped);
        if clipped != *x {
            eval.value += eval.gradient.dot(&(x - &clipped));
        }
        eval
    }
}

// =============================================================================
// SOLVER
// =============================================================================

/// Relative gap up to which an inverted bound pair counts as rounding noise
const INVERSION_TOLERANCE: f64 = 1e-9;

/// Free-concentration bounds of one addition point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
}

impl Bounds {
    /// Degenerate bounds pinning every component at `free`
    pub fn fixed(free: &Array1<f64>) -> Self {
        Self {
            lower: free.clone(),
            upper: free.clone(),
        }
    }
}

/// Result of one addition point
#[derive(Debug, Clone)]
pub struct PointSolution {
    pub free: Array1<f64>,
    pub bound: Array1<f64>,
    /// Projected gradient infinity norm at the returned point
    pub gradient_norm: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Whether the rescaled second attempt ran
    pub refined: bool,
}

/// Solves `free + bound(free) = total` at one addition point
#[derive(Debug, Clone, Copy)]
pub struct FreeConcentrationSolver<'a> {
    model: &'a SpeciationModel,
    options: SolverOptions,
}

impl<'a> FreeConcentrationSolver<'a> {
    pub fn new(model: &'a SpeciationModel, options: SolverOptions) -> Self {
        Self { model, options }
    }

    pub fn model(&self) -> &'a SpeciationModel {
        self.model
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    fn check_total(&self, total: &Array1<f64>) -> Result<()> {
        if total.len() != self.model.n_components() {
            return Err(TitraError::Shape(format!(
                "total vector has {} entries, model has {} components",
                total.len(),
                self.model.n_components()
            )));
        }
        if let Some(t) = total.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
            return Err(TitraError::Domain(format!(
                "total concentrations must be finite and non-negative, got {}",
                t
            )));
        }
        Ok(())
    }

    /// Bounds on the free concentrations at `total`
    pub fn bounds(&self, total: &Array1<f64>) -> Result<Bounds> {
        self.check_total(total)?;
        let upper = self.model.upper_bounds(total)?;

        // Chord from (0, −total) to (upper, upper + bound(upper) − total):
        // the mass balance is convex in each free concentration, so the
        // chord root never exceeds the true one.
        let held = self.model.contribution(&ln_concentrations(&upper)).gradient;
        let lower: Array1<f64> = (0..total.len())
            .map(|j| {
                if total[j] == 0.0 {
                    return 0.0;
                }
                let lo = upper[j] * total[j] / (upper[j] + held[j]);
                if lo > 0.0 && lo.is_finite() {
                    lo
                } else {
                    f64::MIN_POSITIVE
                }
            })
            .collect();

        debug!("free bounds: lower = {:e}, upper = {:e}", lower, upper);
        Ok(Bounds { lower, upper })
    }

    /// Solve with bounds from [`bounds`](Self::bounds). `start` is a guess of
    /// the free concentrations; entries that are not positive fall back to
    /// the upper bound.
    pub fn solve(&self, total: &Array1<f64>, start: Option<&Array1<f64>>) -> Result<PointSolution> {
        let bounds = self.bounds(total)?;
        self.solve_with_bounds(total, &bounds, start)
    }

    /// Solve inside caller-supplied free-concentration bounds
    pub fn solve_with_bounds(
        &self,
        total: &Array1<f64>,
        bounds: &Bounds,
        start: Option<&Array1<f64>>,
    ) -> Result<PointSolution> {
        self.check_total(total)?;
        let n = self.model.n_components();
        if bounds.lower.len() != n || bounds.upper.len() != n {
            return Err(TitraError::Shape(format!(
                "bounds have {}/{} entries, model has {} components",
                bounds.lower.len(),
                bounds.upper.len(),
                n
            )));
        }

        let active: Vec<usize> = (0..n).filter(|&j| total[j] > 0.0).collect();
        if active.is_empty() {
            return Ok(PointSolution {
                free: Array1::zeros(n),
                bound: Array1::zeros(self.model.stoichiometry().n_outputs()),
                gradient_norm: 0.0,
                iterations: 0,
                converged: true,
                refined: false,
            });
        }

        let active_total: Array1<f64> = active.iter().map(|&j| total[j]).collect();
        let to_x = |k: usize, free: f64| active_total[k] * free.max(f64::MIN_POSITIVE).log10();

        let mut lower = Array1::zeros(active.len());
        let mut upper = Array1::zeros(active.len());
        for (k, &j) in active.iter().enumerate() {
            let (lo, hi) = (bounds.lower[j], bounds.upper[j]);
            if !(lo.is_finite() && hi.is_finite()) {
                return Err(TitraError::Domain(format!(
                    "free-concentration bounds of {} are not finite ({}, {})",
                    self.model.stoichiometry().components()[j],
                    lo,
                    hi
                )));
            }
            if lo > hi && lo - hi > INVERSION_TOLERANCE * lo.abs() {
                return Err(TitraError::Domain(format!(
                    "free-concentration bounds of {} are inverted ({:e} > {:e})",
                    self.model.stoichiometry().components()[j],
                    lo,
                    hi
                )));
            }
            lower[k] = to_x(k, lo);
            upper[k] = to_x(k, hi);
        }
        let x_bounds = BoxBounds::new(lower, upper);

        let x0: Array1<f64> = active
            .iter()
            .enumerate()
            .map(|(k, &j)| match start.map(|s| s[j]) {
                Some(f) if f > 0.0 && f.is_finite() => to_x(k, f),
                _ => x_bounds.upper[k],
            })
            .collect();

        let potential = Potential {
            model: self.model,
            active: &active,
            total: active_total,
            bounds: &x_bounds,
        };

        let tolerance = self.options.gradient_tolerance;
        let first = minimize::minimize(&potential, x0, &x_bounds, &self.options);
        let mut x = first.x;
        let mut gradient_norm = first.projected_gradient_norm;
        let mut iterations = first.iterations;
        let mut refined = false;

        if gradient_norm > tolerance {
            let factor = self.options.rescale_factor;
            debug!(
                "gradient {:.3e} above {:.3e} after {} iterations, refining with factor {:e}",
                gradient_norm, tolerance, iterations, factor
            );
            let scaled = Scaled {
                inner: &potential,
                factor,
            };
            let scaled_options = SolverOptions {
                gradient_tolerance: tolerance * factor,
                hessian_floor: self.options.hessian_floor * factor,
                ..self.options
            };
            let second = minimize::minimize(&scaled, x.clone(), &x_bounds, &scaled_options);
            let second_norm = second.projected_gradient_norm / factor;
            iterations += second.iterations;
            refined = true;
            if second_norm < gradient_norm {
                x = second.x;
                gradient_norm = second_norm;
            }
        }

        let converged = gradient_norm <= tolerance;
        if !converged {
            debug!(
                "gradient {:.3e} still above {:.3e} at totals {:e}",
                gradient_norm, tolerance, total
            );
        }

        let free = potential.free(&x);
        let bound = self.model.bound_concentrations(&free);
        Ok(PointSolution {
            free,
            bound,
            gradient_norm,
            iterations,
            converged,
            refined,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polymer;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn one_to_two() -> SpeciationModel {
        let s = Stoichiometry::from_rows(&["H", "G"], &[vec![1, 1], vec![1, 2]]).unwrap();
        SpeciationModel::from_flat(s, &[1e4, 1e7]).unwrap()
    }

    fn assert_mass_balance(model: &SpeciationModel, sol: &PointSolution, total: &Array1<f64>, tol: f64) {
        let r = model.mass_balance_residual(&sol.free, &sol.bound, total).unwrap();
        for j in 0..total.len() {
            assert!(
                r[j].abs() <= tol * total[j],
                "component {}: residual {:e} vs total {:e}",
                j,
                r[j],
                total[j]
            );
        }
    }

    #[test]
    fn test_bounds_bracket_solution() {
        let model = one_to_two();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        let total = array![1e-3, 2e-3];
        let b = solver.bounds(&total).unwrap();
        let sol = solver.solve(&total, None).unwrap();
        for j in 0..2 {
            assert!(b.lower[j] <= sol.free[j] * (1.0 + 1e-9));
            assert!(sol.free[j] <= b.upper[j] * (1.0 + 1e-9));
        }
        assert_eq!(b.upper, total);
    }

    #[test]
    fn test_mass_balance() {
        let model = one_to_two();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        for total in [array![1e-3, 5e-4], array![1e-3, 1e-2], array![1e-6, 1e-1]] {
            let sol = solver.solve(&total, None).unwrap();
            assert!(sol.converged);
            assert_mass_balance(&model, &sol, &total, 1e-5);
        }
    }

    #[test]
    fn test_zero_total_short_circuit() {
        let model = one_to_two();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        let sol = solver.solve(&array![1e-3, 0.0], None).unwrap();
        assert_eq!(sol.free[1], 0.0);
        assert_eq!(sol.bound, array![0.0, 0.0]);
        assert_relative_eq!(sol.free[0], 1e-3, max_relative = 1e-9);

        let sol = solver.solve(&array![0.0, 0.0], None).unwrap();
        assert!(sol.converged);
        assert_eq!(sol.free, array![0.0, 0.0]);
    }

    #[test]
    fn test_invalid_totals() {
        let model = one_to_two();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        assert!(matches!(solver.solve(&array![-1.0, 0.0], None), Err(TitraError::Domain(_))));
        assert!(matches!(solver.solve(&array![1.0], None), Err(TitraError::Shape(_))));
    }

    #[test]
    fn test_fixed_bounds_are_a_fixed_point() {
        let model = one_to_two();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        let total = array![1e-3, 1.5e-3];
        let sol = solver.solve(&total, None).unwrap();

        let again = solver
            .solve_with_bounds(&total, &Bounds::fixed(&sol.free), None)
            .unwrap();
        assert_eq!(again.iterations, 0);
        for j in 0..2 {
            assert_relative_eq!(again.free[j], sol.free[j], max_relative = 1e-12);
            assert_relative_eq!(again.bound[j], sol.bound[j], max_relative = 1e-11);
        }
    }

    #[test]
    fn test_inverted_bounds() {
        let model = one_to_two();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        let total = array![1e-3, 1.5e-3];
        let sol = solver.solve(&total, None).unwrap();

        // Rounding-level inversion is accepted
        let nudged = Bounds {
            lower: sol.free.mapv(|f| f * (1.0 + 1e-12)),
            upper: sol.free.clone(),
        };
        let again = solver.solve_with_bounds(&total, &nudged, None).unwrap();
        assert_relative_eq!(again.free[0], sol.free[0], max_relative = 1e-10);

        let swapped = Bounds {
            lower: array![1e-3, 1.5e-3],
            upper: array![1e-6, 1e-6],
        };
        assert!(matches!(
            solver.solve_with_bounds(&total, &swapped, None),
            Err(TitraError::Domain(_))
        ));
    }

    #[test]
    fn test_refine_after_shortfall() {
        // One iteration cannot reach the tolerance on this problem
        let s = Stoichiometry::from_rows(&["H", "G"], &[vec![1, 1], vec![1, 2]]).unwrap();
        let model = SpeciationModel::from_flat(s, &[1e8, 1e14]).unwrap();
        let options = SolverOptions {
            max_iterations: 1,
            ..Default::default()
        };
        let sol = FreeConcentrationSolver::new(&model, options)
            .solve(&array![1e-9, 1e-1], None)
            .unwrap();
        assert!(sol.refined);
        assert!(!sol.converged);
        assert!(sol.gradient_norm > options.gradient_tolerance);
        assert!(sol.free.iter().all(|f| f.is_finite() && *f > 0.0));
    }

    #[test]
    fn test_pure_polymer_bounds_collapse_to_exact_root() {
        let s = Stoichiometry::from_rows(&["H"], &[vec![-1]]).unwrap();
        let model = SpeciationModel::from_flat(s, &[100.0, 1e4]).unwrap();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        let total = array![1e-4];

        let exact = polymer::exact_free_single(1e-4, 100.0, 1e4).unwrap();
        let b = solver.bounds(&total).unwrap();
        assert_relative_eq!(b.upper[0], exact, max_relative = 1e-14);
        assert_relative_eq!(b.lower[0], exact, max_relative = 1e-9);

        let sol = solver.solve_with_bounds(&total, &Bounds::fixed(&array![exact]), None).unwrap();
        assert!(sol.converged);
        assert_relative_eq!(sol.free[0], exact, max_relative = 1e-12);
        assert!(sol.free[0] * 1e4 < 1.0);
        assert_mass_balance(&model, &sol, &total, 1e-8);
    }

    #[test]
    fn test_tangent_extrapolation_outside_box() {
        let model = one_to_two();
        let active = vec![0, 1];
        let total = array![1e-3, 1e-3];
        let x_bounds = BoxBounds::new(array![-4e-3, -4e-3], array![-3e-3, -3e-3]);
        let potential = Potential {
            model: &model,
            active: &active,
            total: total.clone(),
            bounds: &x_bounds,
        };

        let edge = array![-3e-3, -3.5e-3];
        let beyond = array![-2e-3, -3.5e-3];
        let at_edge = potential.evaluate(&edge);
        let outside = potential.evaluate(&beyond);

        assert!(outside.value.is_finite());
        assert_eq!(outside.gradient, at_edge.gradient);
        assert_relative_eq!(
            outside.value,
            at_edge.value + at_edge.gradient[0] * 1e-3,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_gradient_is_scaled_mass_balance() {
        let model = one_to_two();
        let active = vec![0, 1];
        let total = array![1e-3, 2e-3];
        let x_bounds = BoxBounds::new(array![-1.0, -1.0], array![0.0, 0.0]);
        let potential = Potential {
            model: &model,
            active: &active,
            total: total.clone(),
            bounds: &x_bounds,
        };
        let free = array![4e-4, 9e-4];
        let x = array![1e-3 * 4e-4_f64.log10(), 2e-3 * 9e-4_f64.log10()];
        let eval = potential.evaluate(&x);
        let bound = model.bound_concentrations(&free);
        let r = model.mass_balance_residual(&free, &bound, &total).unwrap();
        for k in 0..2 {
            assert_relative_eq!(eval.gradient[k], LN_10 / total[k] * r[k], max_relative = 1e-9);
        }
    }

    #[test]
    fn test_poorly_scaled_totals() {
        // Totals six orders of magnitude apart, strong binding
        let s = Stoichiometry::from_rows(&["H", "G"], &[vec![1, 1], vec![2, 1]]).unwrap();
        let model = SpeciationModel::from_flat(s, &[1e7, 1e12]).unwrap();
        let solver = FreeConcentrationSolver::new(&model, SolverOptions::default());
        let total = array![1e-7, 1e-1];
        let sol = solver.solve(&total, None).unwrap();
        assert!(sol.gradient_norm.is_finite());
        assert_mass_balance(&model, &sol, &total, 1e-5);
    }
}
