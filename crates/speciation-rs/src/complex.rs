//! Complexes of fixed stoichiometry.
//!
//! `[C_i] = K_i · Π_j free_j^M[i,j]`. In log space the potential term of a
//! complex is its own concentration, its gradient the units of each
//! component it holds.

use crate::{Contribution, EquilibriumTerms};
use ndarray::{Array1, Array2};
use titra_core::{Result, TitraError};

/// Complex rows of the stoichiometry with their formation constants
#[derive(Debug, Clone)]
pub struct ComplexTerms {
    matrix: Array2<i32>,
    ln_k: Array1<f64>,
}

impl ComplexTerms {
    pub fn new(matrix: Array2<i32>, ks: &[f64]) -> Result<Self> {
        if matrix.nrows() != ks.len() {
            return Err(TitraError::Configuration(format!(
                "{} complexes but {} complex constants",
                matrix.nrows(),
                ks.len()
            )));
        }
        if matrix.iter().any(|&m| m < 0) {
            return Err(TitraError::Configuration(
                "complex rows cannot contain negative entries".into(),
            ));
        }
        Ok(Self {
            matrix,
            ln_k: ks.iter().map(|k| k.ln()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }

    /// `ln [C_i]`; zero exponents are skipped so absent components only
    /// silence the complexes that contain them
    fn ln_concentration(&self, i: usize, ln_free: &Array1<f64>) -> f64 {
        self.matrix
            .row(i)
            .iter()
            .zip(ln_free.iter())
            .filter(|(&m, _)| m > 0)
            .fold(self.ln_k[i], |acc, (&m, &lf)| acc + m as f64 * lf)
    }
}

impl EquilibriumTerms for ComplexTerms {
    fn accumulate(&self, ln_free: &Array1<f64>, acc: &mut Contribution) {
        for i in 0..self.len() {
            let c = self.ln_concentration(i, ln_free).exp();
            if c == 0.0 {
                continue;
            }
            acc.objective += c;
            for (j, &m) in self.matrix.row(i).iter().enumerate() {
                if m > 0 {
                    let m = m as f64;
                    acc.gradient[j] += m * c;
                    acc.hessian_diagonal[j] += m * m * c;
                }
            }
        }
    }

    /// A complex cannot hold more of a component than the total supply
    fn upper_bounds(&self, total: &Array1<f64>) -> Result<Array1<f64>> {
        Ok(total.clone())
    }

    fn concentrations(&self, ln_free: &Array1<f64>) -> Array1<f64> {
        (0..self.len())
            .map(|i| self.ln_concentration(i, ln_free).exp())
            .collect()
    }
}
