//! Sweep over all addition points of a titration.
//!
//! The sequential schedule solves points in index order and warm-starts
//! each one from the previous solution, adjusted for the change in totals.
//! Points are independent given their totals, so the parallel schedule
//! solves them on the rayon pool from their own upper bounds. The two-pass
//! schedule combines both: a loose sequential pass, then a parallel
//! refinement started from its results.

use crate::solver::{FreeConcentrationSolver, PointSolution, SpeciationModel};
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use titra_core::{Result, Schedule, SolverOptions, TitraError};

/// Tolerance multiplier for the first pass of [`Schedule::TwoPass`]
const TWO_PASS_LOOSENING: f64 = 1e3;

/// Initial guess policy for sequential sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarmStart {
    /// Previous solution adjusted for the change in totals
    #[default]
    Continuation,
    /// Every point from its upper bound
    UpperBound,
}

/// Counters collected over one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciationStats {
    pub points: usize,
    pub iterations: usize,
    /// Points that missed the gradient tolerance after refinement
    pub accuracy_warnings: usize,
    pub refine_passes: usize,
    pub max_gradient_norm: f64,
}

impl SpeciationStats {
    fn record(&mut self, point: &PointSolution) {
        self.points += 1;
        self.iterations += point.iterations;
        self.accuracy_warnings += usize::from(!point.converged);
        self.refine_passes += usize::from(point.refined);
        self.max_gradient_norm = self.max_gradient_norm.max(point.gradient_norm);
    }
}

/// Free and bound concentrations at every addition point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speciation {
    /// points × components
    pub free: Array2<f64>,
    /// points × outputs (complexes, then polymer terminal/internal pairs)
    pub bound: Array2<f64>,
    pub stats: SpeciationStats,
}

impl Speciation {
    pub fn from_points(n_components: usize, n_outputs: usize, points: &[PointSolution]) -> Self {
        let mut free = Array2::zeros((points.len(), n_components));
        let mut bound = Array2::zeros((points.len(), n_outputs));
        let mut stats = SpeciationStats::default();
        for (i, point) in points.iter().enumerate() {
            free.row_mut(i).assign(&point.free);
            bound.row_mut(i).assign(&point.bound);
            stats.record(point);
        }
        Self { free, bound, stats }
    }

    pub fn n_points(&self) -> usize {
        self.free.nrows()
    }

    /// Largest `|free + bound − total| / total` over all points and
    /// components with a non-zero total
    pub fn max_mass_balance_error(
        &self,
        model: &SpeciationModel,
        totals: &Array2<f64>,
    ) -> Result<f64> {
        let mut worst = 0.0_f64;
        for i in 0..self.n_points() {
            let total = totals.row(i).to_owned();
            let r = model.mass_balance_residual(
                &self.free.row(i).to_owned(),
                &self.bound.row(i).to_owned(),
                &total,
            )?;
            for (r, t) in r.iter().zip(total.iter()) {
                if *t > 0.0 {
                    worst = worst.max(r.abs() / t);
                }
            }
        }
        Ok(worst)
    }
}

/// Free-concentration guess from the previous point.
///
/// Where a total grew, the free concentration grows by the same amount;
/// where it shrank (dilution), the free concentration shrinks in
/// proportion. Components without a usable previous value get `NaN`, which
/// the solver replaces with the upper bound.
pub fn warm_start_guess(
    previous_free: &Array1<f64>,
    previous_total: &Array1<f64>,
    total: &Array1<f64>,
) -> Array1<f64> {
    Array1::from_shape_fn(total.len(), |j| {
        let (f, t0, t) = (previous_free[j], previous_total[j], total[j]);
        if t0 == 0.0 || !(f > 0.0) {
            f64::NAN
        } else if t >= t0 {
            f + (t - t0)
        } else {
            f * t / t0
        }
    })
}

fn report(index: usize, point: &PointSolution, options: &SolverOptions) {
    debug!(
        "point {}: {} iterations, gradient {:.3e}{}",
        index,
        point.iterations,
        point.gradient_norm,
        if point.refined { " (refined)" } else { "" }
    );
    if !point.converged {
        warn!(
            "desired accuracy not achieved at point {}: gradient {:.3e} > {:.3e}",
            index, point.gradient_norm, options.gradient_tolerance
        );
    }
}

/// Solves every row of a totals matrix
#[derive(Debug, Clone, Copy)]
pub struct SequentialDriver<'a> {
    model: &'a SpeciationModel,
    options: SolverOptions,
    warm_start: WarmStart,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> SequentialDriver<'a> {
    pub fn new(model: &'a SpeciationModel, options: SolverOptions) -> Self {
        Self {
            model,
            options,
            warm_start: WarmStart::default(),
            cancel: None,
        }
    }

    pub fn with_warm_start(mut self, warm_start: WarmStart) -> Self {
        self.warm_start = warm_start;
        self
    }

    /// Stop between addition points once `flag` is set
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.load(Ordering::Relaxed))
    }

    fn check_shape(&self, totals: &Array2<f64>) -> Result<()> {
        let n = self.model.n_components();
        if totals.ncols() != n {
            return Err(TitraError::Shape(format!(
                "totals have {} columns, model has {} components",
                totals.ncols(),
                n
            )));
        }
        Ok(())
    }

    fn assemble(&self, points: &[PointSolution]) -> Speciation {
        let speciation = Speciation::from_points(
            self.model.n_components(),
            self.model.stoichiometry().n_outputs(),
            points,
        );
        info!(
            "speciation of {} points: {} iterations, {} refined, {} below accuracy",
            speciation.stats.points,
            speciation.stats.iterations,
            speciation.stats.refine_passes,
            speciation.stats.accuracy_warnings
        );
        speciation
    }

    pub fn run_scheduled(&self, totals: &Array2<f64>, schedule: Schedule) -> Result<Speciation> {
        match schedule {
            Schedule::Sequential => self.run(totals),
            Schedule::Parallel => self.run_parallel(totals),
            Schedule::TwoPass => self.run_two_pass(totals),
        }
    }

    /// Sequential sweep in index order
    pub fn run(&self, totals: &Array2<f64>) -> Result<Speciation> {
        self.run_with_progress(totals, |_| {})
    }

    /// Sequential sweep calling `progress` with the number of completed
    /// points after each one
    pub fn run_with_progress<F>(&self, totals: &Array2<f64>, progress: F) -> Result<Speciation>
    where
        F: FnMut(usize),
    {
        let points = self.sweep(totals, &self.options, progress)?;
        Ok(self.assemble(&points))
    }

    fn sweep<F>(
        &self,
        totals: &Array2<f64>,
        options: &SolverOptions,
        mut progress: F,
    ) -> Result<Vec<PointSolution>>
    where
        F: FnMut(usize),
    {
        self.check_shape(totals)?;
        let solver = FreeConcentrationSolver::new(self.model, *options);
        let mut points: Vec<PointSolution> = Vec::with_capacity(totals.nrows());
        let mut previous: Option<Array1<f64>> = None;

        for (i, row) in totals.rows().into_iter().enumerate() {
            if self.cancelled() {
                return Err(TitraError::Cancelled { completed: i });
            }
            let total = row.to_owned();
            let guess = match (self.warm_start, previous.as_ref(), points.last()) {
                (WarmStart::Continuation, Some(t0), Some(last)) => {
                    Some(warm_start_guess(&last.free, t0, &total))
                }
                _ => None,
            };
            let point = solver.solve(&total, guess.as_ref())?;
            report(i, &point, options);
            points.push(point);
            previous = Some(total);
            progress(i + 1);
        }
        Ok(points)
    }

    /// Independent points on the rayon pool, each from its upper bound
    pub fn run_parallel(&self, totals: &Array2<f64>) -> Result<Speciation> {
        let points = self.solve_parallel(totals, None)?;
        Ok(self.assemble(&points))
    }

    fn solve_parallel(
        &self,
        totals: &Array2<f64>,
        starts: Option<&[PointSolution]>,
    ) -> Result<Vec<PointSolution>> {
        self.check_shape(totals)?;
        let solver = FreeConcentrationSolver::new(self.model, self.options);
        let completed = AtomicUsize::new(0);

        (0..totals.nrows())
            .into_par_iter()
            .map(|i| {
                if self.cancelled() {
                    return Err(TitraError::Cancelled {
                        completed: completed.load(Ordering::Relaxed),
                    });
                }
                let total = totals.row(i).to_owned();
                let start = starts.map(|s| &s[i].free);
                let point = solver.solve(&total, start)?;
                report(i, &point, &self.options);
                completed.fetch_add(1, Ordering::Relaxed);
                Ok(point)
            })
            .collect()
    }

    /// Loose sequential pass, then parallel refinement from its results
    pub fn run_two_pass(&self, totals: &Array2<f64>) -> Result<Speciation> {
        let loose = self.options.loosened(TWO_PASS_LOOSENING);
        let first = self.sweep(totals, &loose, |_| {})?;
        let mut points = self.solve_parallel(totals, Some(&first))?;
        for (point, rough) in points.iter_mut().zip(&first) {
            point.iterations += rough.iterations;
        }
        Ok(self.assemble(&points))
    }
}

// =============================================================================
// TESTS
// =============================================================================
