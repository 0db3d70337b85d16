//! Binding models offered to callers.
//!
//! The three classic host-guest models have closed forms and bypass the
//! minimizer; anything else goes through the general solver.

use crate::constants::EquilibriumConstants;
use crate::cubic;
use crate::driver::{Speciation, SpeciationStats, SequentialDriver, WarmStart};
use crate::solver::SpeciationModel;
use crate::stoichiometry::Stoichiometry;
use ndarray::{Array1, Array2};
use titra_core::{Result, Schedule, SolverOptions, TitraError};

/// An arbitrary stoichiometry solved numerically
#[derive(Debug, Clone)]
pub struct GeneralModel {
    pub stoichiometry: Stoichiometry,
    pub options: SolverOptions,
    pub schedule: Schedule,
    pub warm_start: WarmStart,
}

impl GeneralModel {
    pub fn new(stoichiometry: Stoichiometry) -> Self {
        Self {
            stoichiometry,
            options: SolverOptions::default(),
            schedule: Schedule::default(),
            warm_start: WarmStart::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BindingModel {
    /// H + G ⇌ HG
    OneToOne,
    /// H + G ⇌ HG, H + 2G ⇌ HG₂ (global constants β1, β2)
    OneToTwo,
    /// 2H ⇌ H₂
    Dimerization,
    General(GeneralModel),
}

impl BindingModel {
    /// The closed-form models
    pub fn builtins() -> Vec<BindingModel> {
        vec![Self::OneToOne, Self::OneToTwo, Self::Dimerization]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OneToOne => "1:1",
            Self::OneToTwo => "1:2",
            Self::Dimerization => "dimerization",
            Self::General(_) => "general",
        }
    }

    pub fn stoichiometry(&self) -> Result<Stoichiometry> {
        match self {
            Self::OneToOne => Stoichiometry::from_rows(&["H", "G"], &[vec![1, 1]]),
            Self::OneToTwo => Stoichiometry::from_rows(&["H", "G"], &[vec![1, 1], vec![1, 2]]),
            Self::Dimerization => Stoichiometry::from_rows(&["H"], &[vec![2]]),
            Self::General(model) => Ok(model.stoichiometry.clone()),
        }
    }

    /// Speciate every row of `totals` with constants ordered like
    /// [`Stoichiometry::variable_names`]
    pub fn run(&self, constants: &[f64], totals: &Array2<f64>) -> Result<Speciation> {
        let stoich = self.stoichiometry()?;

        if let Self::General(general) = self {
            let model = SpeciationModel::from_flat(stoich, constants)?;
            return SequentialDriver::new(&model, general.options)
                .with_warm_start(general.warm_start)
                .run_scheduled(totals, general.schedule);
        }

        self.run_closed_form(&stoich, constants, totals)
    }

    fn run_closed_form(
        &self,
        stoich: &Stoichiometry,
        constants: &[f64],
        totals: &Array2<f64>,
    ) -> Result<Speciation> {
        EquilibriumConstants::from_flat(stoich, constants)?;
        if totals.ncols() != stoich.n_components() {
            return Err(TitraError::Shape(format!(
                "{} model needs {} total columns, got {}",
                self.name(),
                stoich.n_components(),
                totals.ncols()
            )));
        }

        let n = totals.nrows();
        let mut free = Array2::zeros((n, stoich.n_components()));
        let mut bound = Array2::zeros((n, stoich.n_outputs()));
        for (i, row) in totals.rows().into_iter().enumerate() {
            if let Some(t) = row.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
                return Err(TitraError::Domain(format!(
                    "total concentrations must be finite and non-negative, got {}",
                    t
                )));
            }
            let (f, b) = match self {
                Self::OneToOne => one_to_one(row[0], row[1], constants[0]),
                Self::OneToTwo => one_to_two(row[0], row[1], constants[0], constants[1])?,
                Self::Dimerization => dimerization(row[0], constants[0]),
                Self::General(_) => {
                    return Err(TitraError::Configuration(
                        "general model has no closed form".into(),
                    ))
                }
            };
            free.row_mut(i).assign(&f);
            bound.row_mut(i).assign(&b);
        }

        Ok(Speciation {
            free,
            bound,
            stats: SpeciationStats {
                points: n,
                ..Default::default()
            },
        })
    }
}

/// Free [H, G] and bound [HG]
fn one_to_one(host: f64, guest: f64, k: f64) -> (Array1<f64>, Array1<f64>) {
    let product = host * guest;
    let hg = if product == 0.0 {
        0.0
    } else {
        // Smaller root of HG² − s·HG + Ht·Gt, written without cancellation
        let s = host + guest + 1.0 / k;
        2.0 * product / (s + (s * s - 4.0 * product).max(0.0).sqrt())
    };
    (
        Array1::from(vec![host - hg, guest - hg]),
        Array1::from(vec![hg]),
    )
}

/// Free [H, G] and bound [HG, HG₂]
fn one_to_two(
    host: f64,
    guest: f64,
    beta1: f64,
    beta2: f64,
) -> Result<(Array1<f64>, Array1<f64>)> {
    if host == 0.0 || guest == 0.0 {
        return Ok((
            Array1::from(vec![host, guest]),
            Array1::from(vec![0.0, 0.0]),
        ));
    }

    // Guest mass balance with the host eliminated
    let a = beta2;
    let b = beta1 + beta2 * (2.0 * host - guest);
    let c = 1.0 + beta1 * (host - guest);
    let d = -guest;

    let slack = 1e-9 * guest;
    let g = cubic::real_roots(a, b, c, d)
        .into_iter()
        .find(|&g| g >= -slack && g <= guest + slack)
        .map(|g| g.clamp(0.0, guest))
        .ok_or_else(|| {
            TitraError::Domain(format!(
                "no root in [0, {}] for the 1:2 guest balance (Ht = {}, β1 = {}, β2 = {})",
                guest, host, beta1, beta2
            ))
        })?;

    let h = host / (1.0 + beta1 * g + beta2 * g * g);
    let hg = beta1 * h * g;
    let hg2 = beta2 * h * g * g;
    Ok((Array1::from(vec![h, g]), Array1::from(vec![hg, hg2])))
}

/// Free [H] and bound [H₂]
fn dimerization(host: f64, k: f64) -> (Array1<f64>, Array1<f64>) {
    let h = 2.0 * host / (1.0 + (1.0 + 8.0 * k * host).sqrt());
    (Array1::from(vec![h]), Array1::from(vec![k * h * h]))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_names_and_stoichiometries() {
        let names: Vec<_> = BindingModel::builtins().iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["1:1", "1:2", "dimerization"]);
        assert_eq!(
            BindingModel::OneToTwo.stoichiometry().unwrap().variable_names(),
            vec!["HG", "HG₂"]
        );
        assert_eq!(
            BindingModel::Dimerization.stoichiometry().unwrap().variable_names(),
            vec!["H₂"]
        );
    }

    #[test]
    fn test_one_to_one_mass_balance() {
        let (free, bound) = one_to_one(1e-3, 2e-3, 1e4);
        let (h, g, hg) = (free[0], free[1], bound[0]);
        assert_relative_eq!(hg, 1e4 * h * g, max_relative = 1e-10);
        assert_relative_eq!(h + hg, 1e-3, max_relative = 1e-14);
        assert_relative_eq!(g + hg, 2e-3, max_relative = 1e-14);
    }

    #[test]
    fn test_one_to_two_mass_balance() {
        let (free, bound) = one_to_two(1e-3, 3e-3, 1e4, 1e7).unwrap();
        let (h, g) = (free[0], free[1]);
        assert_relative_eq!(bound[0], 1e4 * h * g, max_relative = 1e-12);
        assert_relative_eq!(bound[1], 1e7 * h * g * g, max_relative = 1e-12);
        assert_relative_eq!(h + bound[0] + bound[1], 1e-3, max_relative = 1e-9);
        assert_relative_eq!(g + bound[0] + 2.0 * bound[1], 3e-3, max_relative = 1e-9);
    }

    #[test]
    fn test_dimerization_mass_balance() {
        let (free, bound) = dimerization(1e-3, 1e5);
        assert_relative_eq!(free[0] + 2.0 * bound[0], 1e-3, max_relative = 1e-12);
    }

    #[test]
    fn test_closed_forms_match_general_solver() {
        let totals = array![[1e-3, 0.0], [1e-3, 5e-4], [1e-3, 1e-3], [1e-3, 4e-3]];
        let options = SolverOptions {
            gradient_tolerance: 1e-11,
            ..Default::default()
        };
        for (model, constants) in [
            (BindingModel::OneToOne, vec![1e4]),
            (BindingModel::OneToTwo, vec![1e4, 1e7]),
        ] {
            let closed = model.run(&constants, &totals).unwrap();
            let mut general = GeneralModel::new(model.stoichiometry().unwrap());
            general.options = options;
            let numeric = BindingModel::General(general).run(&constants, &totals).unwrap();
            for (a, b) in closed.bound.iter().zip(numeric.bound.iter()) {
                assert_relative_eq!(*a, *b, max_relative = 1e-7, epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn test_zero_totals() {
        let s = BindingModel::OneToTwo
            .run(&[1e4, 1e7], &array![[0.0, 1e-3], [1e-3, 0.0]])
            .unwrap();
        assert_eq!(s.bound, array![[0.0, 0.0], [0.0, 0.0]]);
        assert_eq!(s.free, array![[0.0, 1e-3], [1e-3, 0.0]]);
    }

    #[test]
    fn test_rejects_bad_input() {
        let totals = array![[1e-3, 1e-3]];
        assert!(matches!(
            BindingModel::OneToOne.run(&[], &totals),
            Err(TitraError::Configuration(_))
        ));
        assert!(matches!(
            BindingModel::OneToOne.run(&[-1.0], &totals),
            Err(TitraError::Domain(_))
        ));
        assert!(matches!(
            BindingModel::Dimerization.run(&[1e5], &totals),
            Err(TitraError::Shape(_))
        ));
    }
}
