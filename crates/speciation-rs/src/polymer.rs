//! Open polymer chains of one self-associating component.
//!
//! A chain of `n ≥ 2` units has concentration `k2 · kn^(n-2) · h^n`, so with
//! `x = kn · h < 1` the geometric series sum in closed form:
//!
//! ```text
//! chains         S = k2·h² / (1 − x)
//! terminal units     2·S
//! internal units     k2·kn·h³ / (1 − x)²
//! all units          k2·h²·(2 − x) / (1 − x)²      = h · dS/dh
//! ```
//!
//! `S` is the potential term of a chain family; a capped family multiplies
//! it by `kabs · Π cap^m`. The series diverges at `x = 1`, so every
//! evaluation has to stay strictly inside `h < 1/kn`.

use crate::constants::PolymerConstants;
use crate::cubic;
use crate::stoichiometry::Stoichiometry;
use crate::{Contribution, EquilibriumTerms};
use ndarray::Array1;
use titra_core::{Result, TitraError};

/// Relative distance kept from the divergence at `h = 1/kn`
pub const DOMAIN_MARGIN: f64 = 1e-9;

const BISECTION_STEPS: usize = 200;

/// Number of chains (no factor of n)
pub fn chain_count(h: f64, k2: f64, kn: f64) -> f64 {
    k2 * h * h / (1.0 - kn * h)
}

/// Concentration of chain-end units
pub fn terminal_units(h: f64, k2: f64, kn: f64) -> f64 {
    2.0 * chain_count(h, k2, kn)
}

/// Concentration of units inside chains
pub fn internal_units(h: f64, k2: f64, kn: f64) -> f64 {
    let x = kn * h;
    k2 * kn * h * h * h / ((1.0 - x) * (1.0 - x))
}

/// All units held in chains (with factor of n)
pub fn total_units(h: f64, k2: f64, kn: f64) -> f64 {
    let x = kn * h;
    k2 * h * h * (2.0 - x) / ((1.0 - x) * (1.0 - x))
}

/// `h · d(total_units)/dh`, the log-space second derivative of a chain
pub fn total_units_log_derivative(h: f64, k2: f64, kn: f64) -> f64 {
    let x = kn * h;
    let d = 1.0 - x;
    k2 * h * h * (4.0 - 3.0 * x + x * x) / (d * d * d)
}

/// Largest free concentration the elongation series allows
pub fn domain_limit(kn: f64) -> f64 {
    (1.0 - DOMAIN_MARGIN) / kn
}

/// Free concentration of a component whose only bound form is one uncapped
/// chain family.
///
/// Mass balance `h + k2·h²(2 − kn·h)/(1 − kn·h)² = total` multiplied out is
/// the cubic
///
/// ```text
/// kn(k2 − kn)·h³ + (total·kn² + 2kn − 2k2)·h² − (1 + 2·total·kn)·h + total = 0
/// ```
///
/// whose smallest root in `(0, 1/kn)` is the physical one.
pub fn exact_free_single(total: f64, k2: f64, kn: f64) -> Result<f64> {
    if total == 0.0 {
        return Ok(0.0);
    }
    let a = kn * (k2 - kn);
    let b = total * kn * kn + 2.0 * kn - 2.0 * k2;
    let c = -(1.0 + 2.0 * total * kn);
    let d = total;

    let limit = 1.0 / kn;
    let root = cubic::real_roots(a, b, c, d)
        .into_iter()
        .find(|&h| h > 0.0 && h < limit)
        .ok_or_else(|| {
            TitraError::Domain(format!(
                "no positive real root for polymer free concentration \
                 (total = {:e} M, k2 = {:e}, kn = {:e})",
                total, k2, kn
            ))
        })?;

    Ok(refine_free(total, k2, kn, 1.0, root))
}

/// Free concentration by bisection for `multiplicity` identical uncapped
/// chain families; returns the upper end of the final bracket.
pub fn numeric_free(total: f64, k2: f64, kn: f64, multiplicity: f64) -> f64 {
    if total == 0.0 {
        return 0.0;
    }
    let residual = |h: f64| h + multiplicity * total_units(h, k2, kn) - total;
    let mut lo = 0.0;
    let mut hi = total.min(domain_limit(kn));
    if residual(hi) <= 0.0 {
        return hi;
    }
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        if residual(mid) > 0.0 {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    hi
}

/// A few Newton steps on the mass-balance residual, kept only while they
/// improve it and stay inside the domain
fn refine_free(total: f64, k2: f64, kn: f64, multiplicity: f64, mut h: f64) -> f64 {
    let residual = |h: f64| h + multiplicity * total_units(h, k2, kn) - total;
    let mut r = residual(h);
    for _ in 0..4 {
        let slope = 1.0 + multiplicity * total_units_log_derivative(h, k2, kn) / h;
        let next = h - r / slope;
        if !(next > 0.0 && next < 1.0 / kn) {
            break;
        }
        let r_next = residual(next);
        if r_next.abs() >= r.abs() {
            break;
        }
        h = next;
        r = r_next;
    }
    h
}

/// One chain family: a polymer row with its constants resolved
#[derive(Debug, Clone)]
pub struct PolymerChain {
    pub component: usize,
    pub caps: Vec<(usize, u32)>,
    pub k2: f64,
    pub kn: f64,
    /// `ln kabs`, zero for uncapped chains
    pub ln_kabs: f64,
}

impl PolymerChain {
    fn ln_factor(&self, ln_free: &Array1<f64>) -> f64 {
        self.caps
            .iter()
            .fold(self.ln_kabs, |acc, &(c, m)| acc + m as f64 * ln_free[c])
    }
}

/// All polymer rows of a stoichiometry
#[derive(Debug, Clone, Default)]
pub struct PolymerTerms {
    chains: Vec<PolymerChain>,
}

impl PolymerTerms {
    pub fn new(
        stoich: &Stoichiometry,
        constants: &[PolymerConstants],
        kabs: &[f64],
    ) -> Result<Self> {
        let chains = stoich
            .polymer_rows()
            .iter()
            .map(|row| {
                let pc = constants
                    .iter()
                    .find(|pc| pc.component == row.component)
                    .ok_or_else(|| {
                        TitraError::Configuration(format!(
                            "no k2/kn given for self-associating component {}",
                            stoich.components()[row.component]
                        ))
                    })?;
                let ln_kabs = match row.kabs_index {
                    Some(i) => kabs
                        .get(i)
                        .map(|k| k.ln())
                        .ok_or_else(|| {
                            TitraError::Configuration(format!(
                                "missing kabs for capped polymer row {}",
                                row.row
                            ))
                        })?,
                    None => 0.0,
                };
                Ok(PolymerChain {
                    component: row.component,
                    caps: row.caps.clone(),
                    k2: pc.k2,
                    kn: pc.kn,
                    ln_kabs,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { chains })
    }

    pub fn chains(&self) -> &[PolymerChain] {
        &self.chains
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Free-concentration ceiling of a self-associating component from its
    /// uncapped chains alone. Caps only bind more of the component, so the
    /// true value is never higher.
    fn component_upper_bound(&self, component: usize, total: f64) -> Result<f64> {
        let family: Vec<&PolymerChain> = self
            .chains
            .iter()
            .filter(|c| c.component == component)
            .collect();
        let Some(first) = family.first() else {
            return Ok(f64::INFINITY);
        };
        let (k2, kn) = (first.k2, first.kn);
        let uncapped = family.iter().filter(|c| c.caps.is_empty()).count();

        let bound = match uncapped {
            0 => total,
            1 => exact_free_single(total, k2, kn)?,
            n => numeric_free(total, k2, kn, n as f64),
        };
        Ok(bound.min(domain_limit(kn)))
    }
}

impl EquilibriumTerms for PolymerTerms {
    fn accumulate(&self, ln_free: &Array1<f64>, acc: &mut Contribution) {
        for chain in &self.chains {
            let h = ln_free[chain.component].exp();
            let factor = chain.ln_factor(ln_free).exp();
            if h == 0.0 || factor == 0.0 {
                continue;
            }
            let (k2, kn) = (chain.k2, chain.kn);
            if kn * h >= 1.0 {
                acc.objective = f64::INFINITY;
                continue;
            }

            let s = factor * chain_count(h, k2, kn);
            acc.objective += s;
            acc.gradient[chain.component] += factor * total_units(h, k2, kn);
            acc.hessian_diagonal[chain.component] +=
                factor * total_units_log_derivative(h, k2, kn);
            for &(c, m) in &chain.caps {
                let m = m as f64;
                acc.gradient[c] += m * s;
                acc.hessian_diagonal[c] += m * m * s;
            }
        }
    }

    fn upper_bounds(&self, total: &Array1<f64>) -> Result<Array1<f64>> {
        let mut bounds = Array1::from_elem(total.len(), f64::INFINITY);
        for chain in &self.chains {
            let p = chain.component;
            if bounds[p].is_finite() {
                continue;
            }
            bounds[p] = self.component_upper_bound(p, total[p])?;
        }
        Ok(bounds)
    }

    /// Terminal and internal units per chain family, interleaved
    fn concentrations(&self, ln_free: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(2 * self.chains.len());
        for (r, chain) in self.chains.iter().enumerate() {
            let h = ln_free[chain.component].exp();
            let factor = chain.ln_factor(ln_free).exp();
            if h == 0.0 || factor == 0.0 {
                continue;
            }
            out[2 * r] = factor * terminal_units(h, chain.k2, chain.kn);
            out[2 * r + 1] = factor * internal_units(h, chain.k2, chain.kn);
        }
        out
    }
}
