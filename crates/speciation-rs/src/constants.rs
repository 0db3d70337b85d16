//! Equilibrium constants split by category.

use crate::stoichiometry::Stoichiometry;
use serde::{Deserialize, Serialize};
use titra_core::{Result, TitraError};

/// Dimerization and elongation constants of one self-associating component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolymerConstants {
    pub component: usize,
    /// 2 X ⇌ X₂ (M⁻¹)
    pub k2: f64,
    /// Xₙ + X ⇌ Xₙ₊₁ (M⁻¹)
    pub kn: f64,
}

/// Constants for one speciation run, fixed across all addition points
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumConstants {
    /// Global formation constant per complex row, in row order
    pub complex: Vec<f64>,
    /// One entry per self-associating component
    pub polymer: Vec<PolymerConstants>,
    /// One entry per capped polymer row, in row order
    pub kabs: Vec<f64>,
}

impl EquilibriumConstants {
    pub fn complexes(complex: Vec<f64>) -> Self {
        Self {
            complex,
            ..Default::default()
        }
    }

    /// Split a flat vector ordered like [`Stoichiometry::variable_names`]
    pub fn from_flat(stoich: &Stoichiometry, values: &[f64]) -> Result<Self> {
        if values.len() != stoich.n_variables() {
            return Err(TitraError::Configuration(format!(
                "model needs {} constants ({}), got {}",
                stoich.n_variables(),
                stoich.variable_names().join(", "),
                values.len()
            )));
        }

        let n_complex = stoich.n_complexes();
        let n_self = stoich.self_associating().len();
        let complex = values[..n_complex].to_vec();
        let polymer = stoich
            .self_associating()
            .iter()
            .enumerate()
            .map(|(i, &component)| PolymerConstants {
                component,
                k2: values[n_complex + 2 * i],
                kn: values[n_complex + 2 * i + 1],
            })
            .collect();
        let kabs = values[n_complex + 2 * n_self..].to_vec();

        let constants = Self {
            complex,
            polymer,
            kabs,
        };
        constants.validate(stoich)?;
        Ok(constants)
    }

    /// Inverse of [`from_flat`](Self::from_flat)
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = self.complex.clone();
        for pc in &self.polymer {
            flat.push(pc.k2);
            flat.push(pc.kn);
        }
        flat.extend_from_slice(&self.kabs);
        flat
    }

    /// Check counts against the stoichiometry and positivity of every value
    pub fn validate(&self, stoich: &Stoichiometry) -> Result<()> {
        if self.complex.len() != stoich.n_complexes() {
            return Err(TitraError::Configuration(format!(
                "{} complexes but {} complex constants",
                stoich.n_complexes(),
                self.complex.len()
            )));
        }
        if self.kabs.len() != stoich.n_capped() {
            return Err(TitraError::Configuration(format!(
                "{} capped polymer rows but {} kabs constants",
                stoich.n_capped(),
                self.kabs.len()
            )));
        }
        if self.polymer.len() != stoich.self_associating().len() {
            return Err(TitraError::Configuration(format!(
                "{} self-associating components but {} k2/kn pairs",
                stoich.self_associating().len(),
                self.polymer.len()
            )));
        }

        // Values in variable-name order, whatever order `polymer` is in
        let mut ordered = self.complex.clone();
        for &component in stoich.self_associating() {
            let mut pairs = self.polymer.iter().filter(|pc| pc.component == component);
            match (pairs.next(), pairs.next()) {
                (Some(pc), None) => ordered.extend([pc.k2, pc.kn]),
                _ => {
                    return Err(TitraError::Configuration(format!(
                        "component {} needs exactly one k2/kn pair",
                        stoich.components()[component]
                    )))
                }
            }
        }
        ordered.extend_from_slice(&self.kabs);

        let names = stoich.variable_names();
        for (name, value) in names.iter().zip(ordered) {
            if !(value.is_finite() && value > 0.0) {
                return Err(TitraError::Domain(format!(
                    "constant {} must be finite and positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}
