//! # Titra Core
//!
//! Shared types and utilities for titration speciation.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`TitraError`] | Error taxonomy shared by every crate |
//! | [`Parameter`] | Known / unknown / initial-guess constant slots |
//! | [`SolverOptions`] | Tolerances of the free-concentration solver |
//! | [`Schedule`] | How addition points are distributed over workers |
//!
//! ## Design Philosophy
//!
//! 1. Constants and totals are plain `f64` in mol/L (M)
//! 2. Unknown values are explicit, never masked
//! 3. Accuracy shortfalls are reported, not raised

use serde::{Deserialize, Serialize};
use std::f64::consts::LN_10;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum TitraError {
    /// Malformed model description (stoichiometry, constant counts, names)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Physically impossible inputs, e.g. no positive real root
    #[error("Domain error: {0}")]
    Domain(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Cancelled after {completed} addition points")]
    Cancelled { completed: usize },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TitraError>;

// =============================================================================
// PARAMETERS
// =============================================================================

/// A single equilibrium-constant slot as seen by the outer fitting loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Parameter {
    /// Fixed by the user, never fitted
    Known(f64),
    /// Fitted, no starting value supplied
    Unknown,
    /// Fitted, starting from the given value
    InitialGuess(f64),
}

impl Parameter {
    pub fn is_fitted(&self) -> bool {
        !matches!(self, Self::Known(_))
    }

    /// Value usable as a starting point, if any
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Known(v) | Self::InitialGuess(v) => Some(*v),
            Self::Unknown => None,
        }
    }
}

/// Number of slots the outer optimizer has to fit.
pub fn fitted_count(params: &[Parameter]) -> usize {
    params.iter().filter(|p| p.is_fitted()).count()
}

/// Starting vector for the fitted slots, in order.
pub fn initial_guesses(params: &[Parameter], default: f64) -> Vec<f64> {
    params
        .iter()
        .filter(|p| p.is_fitted())
        .map(|p| p.value().unwrap_or(default))
        .collect()
}

/// Merge known values with the optimizer's current vector.
///
/// Every resolved constant must be finite and strictly positive.
pub fn resolve(params: &[Parameter], fitted: &[f64]) -> Result<Vec<f64>> {
    let expected = fitted_count(params);
    if fitted.len() != expected {
        return Err(TitraError::Configuration(format!(
            "expected {} fitted constants, got {}",
            expected,
            fitted.len()
        )));
    }

    let mut next = fitted.iter();
    params
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let value = match p {
                Parameter::Known(v) => *v,
                // Length checked above
                _ => *next.next().unwrap_or(&f64::NAN),
            };
            if value.is_finite() && value > 0.0 {
                Ok(value)
            } else {
                Err(TitraError::Domain(format!(
                    "constant #{} must be finite and positive, got {}",
                    i, value
                )))
            }
        })
        .collect()
}

// =============================================================================
// SOLVER OPTIONS
// =============================================================================

/// Free-concentration solver parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Infinity norm of the projected gradient at convergence
    pub gradient_tolerance: f64,
    /// Quasi-Newton iterations per attempt
    pub max_iterations: usize,
    /// Number of stored (s, y) correction pairs
    pub lbfgs_history: usize,
    /// Objective multiplier for the refine attempt
    pub rescale_factor: f64,
    /// Sufficient-decrease constant
    pub armijo_c1: f64,
    /// Step shrink factor during backtracking
    pub backtrack_beta: f64,
    pub max_line_search_trials: usize,
    /// Lower clamp on Hessian diagonal entries
    pub hessian_floor: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            gradient_tolerance: 1e-6 * LN_10,
            max_iterations: 1000,
            lbfgs_history: 10,
            rescale_factor: 1e4,
            armijo_c1: 1e-4,
            backtrack_beta: 0.5,
            max_line_search_trials: 60,
            hessian_floor: 1e-12,
        }
    }
}

impl SolverOptions {
    /// Same options with a looser gradient tolerance
    pub fn loosened(&self, factor: f64) -> Self {
        Self {
            gradient_tolerance: self.gradient_tolerance * factor,
            ..*self
        }
    }
}

/// How addition points are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Schedule {
    /// Index order, each point warm-started from the previous one
    #[default]
    Sequential,
    /// Independent points on the rayon pool, each from its own upper bound
    Parallel,
    /// Loose sequential pass, then parallel refinement from its results
    TwoPass,
}

// =============================================================================
// TESTS
// =============================================================================
