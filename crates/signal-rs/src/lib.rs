//! # Titra Signal
//!
//! Linear regression of measured titration signals against speciation.
//!
//! Each observed channel (a chemical shift, an absorbance at one wavelength)
//! is modelled as a concentration-weighted sum over its contributing
//! species:
//!
//! ```text
//! signal[i, c] = Σ_k conc[i, k] · response[k, c]
//! ```
//!
//! The molar responses are found by ordinary least squares through an SVD
//! of the contributor concentration matrix, shared by every channel.

use log::debug;
use nalgebra::DMatrix;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use titra_core::{Result, TitraError};

/// A column of a speciation result that contributes to the signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeciesColumn {
    Free(usize),
    Bound(usize),
}

/// Gather contributor concentrations (points × contributors)
pub fn select_contributors(
    free: &Array2<f64>,
    bound: &Array2<f64>,
    columns: &[SpeciesColumn],
) -> Result<Array2<f64>> {
    if free.nrows() != bound.nrows() {
        return Err(TitraError::Shape(format!(
            "free has {} rows but bound has {}",
            free.nrows(),
            bound.nrows()
        )));
    }
    for column in columns {
        let (source, index, width) = match *column {
            SpeciesColumn::Free(j) => ("free", j, free.ncols()),
            SpeciesColumn::Bound(j) => ("bound", j, bound.ncols()),
        };
        if index >= width {
            return Err(TitraError::Shape(format!(
                "{} column {} out of range ({} columns)",
                source, index, width
            )));
        }
    }

    Ok(Array2::from_shape_fn((free.nrows(), columns.len()), |(i, k)| {
        match columns[k] {
            SpeciesColumn::Free(j) => free[[i, j]],
            SpeciesColumn::Bound(j) => bound[[i, j]],
        }
    }))
}

/// Least-squares molar responses and the resulting fit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFit {
    /// contributors × channels
    pub coefficients: Array2<f64>,
    /// Predicted signal at every point, including skipped ones
    pub fitted: Array2<f64>,
    /// `signal − fitted`; NaN on skipped points
    pub residuals: Array2<f64>,
    /// Root mean square residual over the measured points
    pub rms: f64,
    /// Number of measured points used in the fit
    pub points_used: usize,
}

/// Fit molar responses of `concs` (points × contributors) to `signals`
/// (points × channels). Points with any NaN signal are left out.
pub fn fit_molar_responses(concs: &Array2<f64>, signals: &Array2<f64>) -> Result<SignalFit> {
    let (n_points, n_contributors) = concs.dim();
    let n_channels = signals.ncols();
    if signals.nrows() != n_points {
        return Err(TitraError::Shape(format!(
            "{} concentration rows but {} signal rows",
            n_points,
            signals.nrows()
        )));
    }
    if n_contributors == 0 || n_channels == 0 {
        return Err(TitraError::Shape(
            "need at least one contributor and one signal channel".into(),
        ));
    }
    if concs.iter().any(|c| !c.is_finite()) {
        return Err(TitraError::Domain(
            "contributor concentrations must be finite".into(),
        ));
    }

    let measured: Vec<usize> = (0..n_points)
        .filter(|&i| signals.row(i).iter().all(|s| !s.is_nan()))
        .collect();
    if measured.len() < n_contributors {
        return Err(TitraError::Numerical(format!(
            "{} measured points cannot determine {} molar responses",
            measured.len(),
            n_contributors
        )));
    }
    debug!(
        "fitting {} channels on {} of {} points",
        n_channels,
        measured.len(),
        n_points
    );

    let a = DMatrix::from_fn(measured.len(), n_contributors, |r, k| concs[[measured[r], k]]);
    let b = DMatrix::from_fn(measured.len(), n_channels, |r, c| signals[[measured[r], c]]);

    let svd = a.svd(true, true);
    let largest = svd.singular_values.max();
    let eps = largest * f64::EPSILON * measured.len().max(n_contributors) as f64;
    let x = svd
        .solve(&b, eps)
        .map_err(|e| TitraError::Numerical(format!("SVD solve failed: {}", e)))?;

    let coefficients = Array2::from_shape_fn((n_contributors, n_channels), |(k, c)| x[(k, c)]);
    let fitted = concs.dot(&coefficients);

    let mut residuals = Array2::from_elem((n_points, n_channels), f64::NAN);
    let mut sum_sq = 0.0;
    for &i in &measured {
        for c in 0..n_channels {
            let r = signals[[i, c]] - fitted[[i, c]];
            residuals[[i, c]] = r;
            sum_sq += r * r;
        }
    }
    let rms = (sum_sq / (measured.len() * n_channels) as f64).sqrt();

    Ok(SignalFit {
        coefficients,
        fitted,
        residuals,
        rms,
        points_used: measured.len(),
    })
}

// =============================================================================
// TESTS
// =============================================================================
