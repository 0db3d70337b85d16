//! Box-constrained L-BFGS.
//!
//! Search directions come from the two-loop recursion restricted to the
//! coordinates that are free to move (not pinned against a bound by the
//! gradient), with the objective's own Hessian diagonal as the initial
//! inverse-Hessian scaling. Steps are projected back into the box and
//! accepted on sufficient decrease, or on the approximate Wolfe conditions
//! once the decrease is below the resolution of the objective.

use ndarray::Array1;
use titra_core::SolverOptions;

/// Relative tolerance for treating a coordinate as sitting on a bound
const ACTIVE_EPS: f64 = 1e-12;
/// Objective change regarded as rounding noise, relative to |f|
const NOISE_EPS: f64 = 1e-12;
const WOLFE_DELTA: f64 = 0.1;
const WOLFE_SIGMA: f64 = 0.9;
const MIN_CURVATURE: f64 = 1e-12;
const RESCUE_TRIALS: usize = 16;

/// Value, gradient and Hessian diagonal at one point
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: f64,
    pub gradient: Array1<f64>,
    pub hessian_diagonal: Array1<f64>,
}

/// Smooth objective to be minimized
pub trait Objective {
    fn evaluate(&self, x: &Array1<f64>) -> Evaluation;
}

/// The same objective multiplied by a constant
pub struct Scaled<'a, O: ?Sized> {
    pub inner: &'a O,
    pub factor: f64,
}

impl<O: Objective + ?Sized> Objective for Scaled<'_, O> {
    fn evaluate(&self, x: &Array1<f64>) -> Evaluation {
        let e = self.inner.evaluate(x);
        Evaluation {
            value: e.value * self.factor,
            gradient: e.gradient * self.factor,
            hessian_diagonal: e.hessian_diagonal * self.factor,
        }
    }
}

/// Lower and upper bound per coordinate
#[derive(Debug, Clone, PartialEq)]
pub struct BoxBounds {
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
}

impl BoxBounds {
    /// Inverted pairs are swapped; callers reject inversions beyond rounding
    pub fn new(mut lower: Array1<f64>, mut upper: Array1<f64>) -> Self {
        for (lo, hi) in lower.iter_mut().zip(upper.iter_mut()) {
            if *lo > *hi {
                std::mem::swap(lo, hi);
            }
        }
        Self { lower, upper }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn project(&self, x: &mut Array1<f64>) {
        for ((xi, &lo), &hi) in x.iter_mut().zip(self.lower.iter()).zip(self.upper.iter()) {
            *xi = xi.clamp(lo, hi);
        }
    }

    pub fn projected(&self, x: &Array1<f64>) -> Array1<f64> {
        let mut p = x.clone();
        self.project(&mut p);
        p
    }

    /// Box of zero width in coordinate `i`
    pub fn is_fixed(&self, i: usize) -> bool {
        let (lo, hi) = (self.lower[i], self.upper[i]);
        hi - lo <= 4.0 * f64::EPSILON * lo.abs().max(hi.abs())
    }
}

/// Outcome of one minimization
#[derive(Debug, Clone)]
pub struct Minimum {
    pub x: Array1<f64>,
    pub evaluation: Evaluation,
    /// Infinity norm of the gradient with bound-pinned components removed
    pub projected_gradient_norm: f64,
    pub converged: bool,
    pub iterations: usize,
    pub line_search_trials: usize,
    pub curvature_skips: usize,
}

#[derive(Debug, Clone)]
struct CorrectionPair {
    s: Array1<f64>,
    y: Array1<f64>,
    rho: f64,
}

#[derive(Debug, Default)]
struct LbfgsMemory {
    pairs: Vec<CorrectionPair>,
    curvature_skips: usize,
}

impl LbfgsMemory {
    fn clear(&mut self) {
        self.pairs.clear();
    }

    fn update(&mut self, s: Array1<f64>, y: Array1<f64>, history: usize) {
        if history == 0 {
            self.clear();
            return;
        }
        let s_dot_y = s.dot(&y);
        let s_norm = s.dot(&s).sqrt();
        let y_norm = y.dot(&y).sqrt();
        if !s_dot_y.is_finite() || s_dot_y <= MIN_CURVATURE * s_norm * y_norm || s_dot_y <= 0.0 {
            self.curvature_skips += 1;
            return;
        }
        self.pairs.push(CorrectionPair {
            s,
            y,
            rho: 1.0 / s_dot_y,
        });
        if self.pairs.len() > history {
            let overflow = self.pairs.len() - history;
            self.pairs.drain(0..overflow);
        }
    }
}

fn near_lower(x: f64, lo: f64, hi: f64) -> bool {
    x - lo <= ACTIVE_EPS * lo.abs().max(hi.abs())
}

fn near_upper(x: f64, lo: f64, hi: f64) -> bool {
    hi - x <= ACTIVE_EPS * lo.abs().max(hi.abs())
}

fn projected_gradient_component(bounds: &BoxBounds, i: usize, x: f64, g: f64) -> f64 {
    let (lo, hi) = (bounds.lower[i], bounds.upper[i]);
    if bounds.is_fixed(i) {
        0.0
    } else if near_lower(x, lo, hi) {
        g.min(0.0)
    } else if near_upper(x, lo, hi) {
        g.max(0.0)
    } else {
        g
    }
}

/// Infinity norm of the projected gradient
pub fn projected_gradient_norm(x: &Array1<f64>, g: &Array1<f64>, bounds: &BoxBounds) -> f64 {
    (0..x.len())
        .map(|i| projected_gradient_component(bounds, i, x[i], g[i]).abs())
        .fold(0.0, f64::max)
}

/// Coordinates not held against a bound by the gradient
fn free_mask(x: &Array1<f64>, g: &Array1<f64>, bounds: &BoxBounds) -> Vec<bool> {
    (0..x.len())
        .map(|i| {
            if bounds.is_fixed(i) {
                return false;
            }
            let (lo, hi) = (bounds.lower[i], bounds.upper[i]);
            let pinned_lower = near_lower(x[i], lo, hi) && g[i] > 0.0;
            let pinned_upper = near_upper(x[i], lo, hi) && g[i] < 0.0;
            !(pinned_lower || pinned_upper)
        })
        .collect()
}

fn scaled_steepest_descent(
    g: &Array1<f64>,
    hdiag: &Array1<f64>,
    mask: &[bool],
    floor: f64,
) -> Array1<f64> {
    (0..g.len())
        .map(|i| if mask[i] { -g[i] / hdiag[i].max(floor) } else { 0.0 })
        .collect()
}

fn lbfgs_direction(
    g: &Array1<f64>,
    hdiag: &Array1<f64>,
    mask: &[bool],
    memory: &LbfgsMemory,
    floor: f64,
) -> Array1<f64> {
    let masked_dot = |a: &Array1<f64>, b: &Array1<f64>| -> f64 {
        (0..a.len()).filter(|&i| mask[i]).map(|i| a[i] * b[i]).sum()
    };

    let mut q: Array1<f64> = (0..g.len()).map(|i| if mask[i] { g[i] } else { 0.0 }).collect();
    let mut alphas = Vec::with_capacity(memory.pairs.len());
    for pair in memory.pairs.iter().rev() {
        let alpha = pair.rho * masked_dot(&pair.s, &q);
        alphas.push(alpha);
        for i in 0..q.len() {
            if mask[i] {
                q[i] -= alpha * pair.y[i];
            }
        }
    }

    let mut r: Array1<f64> = (0..q.len())
        .map(|i| if mask[i] { q[i] / hdiag[i].max(floor) } else { 0.0 })
        .collect();

    for (pair, alpha) in memory.pairs.iter().zip(alphas.into_iter().rev()) {
        let beta = pair.rho * masked_dot(&pair.y, &r);
        for i in 0..r.len() {
            if mask[i] {
                r[i] += pair.s[i] * (alpha - beta);
            }
        }
    }

    -r
}

struct LineSearch<'a, O: ?Sized> {
    objective: &'a O,
    bounds: &'a BoxBounds,
    c1: f64,
    beta: f64,
    trials: usize,
}

impl<O: Objective + ?Sized> LineSearch<'_, O> {
    /// Backtrack along the projected path; returns the accepted point
    fn search(
        &mut self,
        x: &Array1<f64>,
        current: &Evaluation,
        direction: &Array1<f64>,
        max_trials: usize,
        approximate_wolfe: bool,
    ) -> Option<(Array1<f64>, Evaluation)> {
        let x_scale = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let mut alpha = 1.0;
        for _ in 0..max_trials {
            self.trials += 1;
            let trial = self.bounds.projected(&(x + &(direction * alpha)));
            let step = &trial - x;
            let step_norm = step.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            if step_norm <= f64::EPSILON * x_scale || step_norm == 0.0 {
                return None;
            }

            let eval = self.objective.evaluate(&trial);
            if eval.value.is_finite() {
                let slope = current.gradient.dot(&step);
                if eval.value <= current.value + self.c1 * slope {
                    return Some((trial, eval));
                }
                if approximate_wolfe && slope < 0.0 {
                    let noise = NOISE_EPS * current.value.abs();
                    let new_slope = eval.gradient.dot(&step);
                    if eval.value <= current.value + noise
                        && new_slope <= (2.0 * WOLFE_DELTA - 1.0) * slope
                        && new_slope >= WOLFE_SIGMA * slope
                    {
                        return Some((trial, eval));
                    }
                }
            }
            alpha *= self.beta;
        }
        None
    }
}

/// Minimize `objective` over `bounds` starting from `x0` (projected first).
pub fn minimize<O: Objective + ?Sized>(
    objective: &O,
    x0: Array1<f64>,
    bounds: &BoxBounds,
    options: &SolverOptions,
) -> Minimum {
    let floor = options.hessian_floor;
    let mut x = bounds.projected(&x0);
    let mut eval = objective.evaluate(&x);
    let mut memory = LbfgsMemory::default();
    let mut search = LineSearch {
        objective,
        bounds,
        c1: options.armijo_c1,
        beta: options.backtrack_beta,
        trials: 0,
    };

    let mut converged = false;
    let mut iterations = 0;
    while iterations < options.max_iterations {
        if projected_gradient_norm(&x, &eval.gradient, bounds) <= options.gradient_tolerance {
            converged = true;
            break;
        }
        iterations += 1;

        let mask = free_mask(&x, &eval.gradient, bounds);
        let mut direction = lbfgs_direction(&eval.gradient, &eval.hessian_diagonal, &mask, &memory, floor);
        let slope = eval.gradient.dot(&direction);
        if !slope.is_finite() || slope >= 0.0 || direction.iter().any(|v| !v.is_finite()) {
            direction = scaled_steepest_descent(&eval.gradient, &eval.hessian_diagonal, &mask, floor);
        }

        let accepted = search
            .search(&x, &eval, &direction, options.max_line_search_trials, true)
            .or_else(|| {
                // Restart from scaled steepest descent with a clean memory
                memory.clear();
                let rescue = scaled_steepest_descent(&eval.gradient, &eval.hessian_diagonal, &mask, floor);
                search.search(&x, &eval, &rescue, RESCUE_TRIALS, false)
            });

        let Some((x_new, eval_new)) = accepted else {
            break;
        };
        let s = &x_new - &x;
        let y = &eval_new.gradient - &eval.gradient;
        memory.update(s, y, options.lbfgs_history);
        x = x_new;
        eval = eval_new;
    }

    let projected_gradient_norm = projected_gradient_norm(&x, &eval.gradient, bounds);
    if projected_gradient_norm <= options.gradient_tolerance {
        converged = true;
    }

    Minimum {
        x,
        evaluation: eval,
        projected_gradient_norm,
        converged,
        iterations,
        line_search_trials: search.trials,
        curvature_skips: memory.curvature_skips,
    }
}
