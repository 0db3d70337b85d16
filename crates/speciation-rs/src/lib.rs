//! # Titra Speciation
//!
//! Equilibrium speciation for host-guest titrations.
//!
//! Given the total concentration of every free component at each addition
//! of a titration, and a set of formation constants, compute the free
//! concentrations and the concentration of every bound species. Bound
//! species are either complexes of fixed stoichiometry or open polymer
//! chains of a single self-associating component (dimerization constant
//! `k2`, elongation constant `kn`), optionally end-capped.
//!
//! ## Method
//!
//! Each addition point is solved by minimizing a convex potential in the
//! scaled log variables `x = total · log10(free)`:
//!
//! ```text
//! Φ(x) = Σ free − ln10 · Σ x + Σ complexes + Σ polymer chains
//! ∂Φ/∂x_j = ln10 / total_j · (free_j + bound_j − total_j)
//! ```
//!
//! so a stationary point is exactly mass balance. The minimizer is a box
//! constrained L-BFGS with the exact Hessian diagonal as preconditioner.
//!
//! ## Components
//!
//! 1. [`stoichiometry`]: row classification and naming
//! 2. [`complex`] / [`polymer`]: stateless equilibrium terms
//! 3. [`solver`]: per-point bounding, minimization and refinement
//! 4. [`driver`]: warm-started sweep over all addition points
//! 5. [`models`]: closed-form and general binding models

use ndarray::Array1;

pub mod complex;
pub mod constants;
pub mod cubic;
pub mod driver;
pub mod minimize;
pub mod models;
pub mod polymer;
pub mod solver;
pub mod stoichiometry;

pub use constants::{EquilibriumConstants, PolymerConstants};
pub use driver::{Speciation, SpeciationStats, SequentialDriver, WarmStart};
pub use models::{BindingModel, GeneralModel};
pub use solver::{Bounds, FreeConcentrationSolver, PointSolution, SpeciationModel};
pub use stoichiometry::{PolymerRow, Stoichiometry};

/// Potential terms accumulated in log space (`u = ln free`).
///
/// `gradient[j]` is the amount of component `j` held in bound species,
/// `hessian_diagonal[j]` its derivative with respect to `u_j`.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub objective: f64,
    pub gradient: Array1<f64>,
    pub hessian_diagonal: Array1<f64>,
}

impl Contribution {
    pub fn zeros(n_components: usize) -> Self {
        Self {
            objective: 0.0,
            gradient: Array1::zeros(n_components),
            hessian_diagonal: Array1::zeros(n_components),
        }
    }
}

/// A source of bound species inside the potential
pub trait EquilibriumTerms {
    /// Add objective, gradient and Hessian diagonal at `ln_free`.
    /// Absent components carry `f64::NEG_INFINITY`.
    fn accumulate(&self, ln_free: &Array1<f64>, acc: &mut Contribution);

    /// Per-component ceiling on the free concentration from these terms
    /// alone; `f64::INFINITY` where they impose none.
    fn upper_bounds(&self, total: &Array1<f64>) -> titra_core::Result<Array1<f64>>;

    /// Output concentrations contributed by these terms
    fn concentrations(&self, ln_free: &Array1<f64>) -> Array1<f64>;
}

/// `ln` of a concentration vector, with zeros mapped to `-inf`
pub fn ln_concentrations(free: &Array1<f64>) -> Array1<f64> {
    free.mapv(|f| if f > 0.0 { f.ln() } else { f64::NEG_INFINITY })
}
