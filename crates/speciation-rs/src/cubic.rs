//! Real roots of low-order polynomials.
//!
//! Cubics go through the complex Cardano formula and every real candidate
//! is polished with Newton steps on the original coefficients.

use num_complex::Complex64;

/// Relative size of the imaginary part still accepted as rounding noise
const IMAG_TOL: f64 = 1e-6;
const POLISH_STEPS: usize = 8;

/// Real roots of `a·x³ + b·x² + c·x + d`, ascending.
///
/// Falls back to the quadratic (and linear) case when the leading
/// coefficient vanishes.
pub fn real_roots(a: f64, b: f64, c: f64, d: f64) -> Vec<f64> {
    let scale = b.abs().max(c.abs()).max(d.abs());
    if a == 0.0 || a.abs() <= f64::EPSILON * scale {
        return quadratic_roots(b, c, d);
    }

    let delta0 = b * b - 3.0 * a * c;
    let delta1 = 2.0 * b * b * b - 9.0 * a * b * c + 27.0 * a * a * d;

    let mut roots: Vec<f64> = if delta0 == 0.0 && delta1 == 0.0 {
        vec![-b / (3.0 * a)]
    } else {
        let disc = Complex64::new(delta1 * delta1 - 4.0 * delta0 * delta0 * delta0, 0.0).sqrt();
        // Pick the sign that keeps C away from zero
        let plus = (Complex64::new(delta1, 0.0) + disc) / 2.0;
        let minus = (Complex64::new(delta1, 0.0) - disc) / 2.0;
        let big = if plus.norm() >= minus.norm() { plus } else { minus };
        let c0 = big.cbrt();
        let xi = Complex64::new(-0.5, 3.0_f64.sqrt() / 2.0);

        let mut candidates = Vec::with_capacity(3);
        let mut ck = c0;
        for _ in 0..3 {
            let x = -(Complex64::new(b, 0.0) + ck + Complex64::new(delta0, 0.0) / ck) / (3.0 * a);
            if x.im.abs() <= IMAG_TOL * x.norm() {
                candidates.push(x.re);
            }
            ck *= xi;
        }
        candidates
    };

    for r in roots.iter_mut() {
        *r = polish(a, b, c, d, *r);
    }
    roots.retain(|r| r.is_finite());
    roots.sort_by(|x, y| x.total_cmp(y));
    roots.dedup_by(|x, y| (*x - *y).abs() <= 1e-12 * x.abs().max(y.abs()));
    roots
}

/// Real roots of `a·x² + b·x + c`, ascending
pub fn quadratic_roots(a: f64, b: f64, c: f64) -> Vec<f64> {
    if a == 0.0 {
        return if b == 0.0 { vec![] } else { vec![-c / b] };
    }
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return vec![];
    }
    // Citardauq form avoids cancellation
    let q = -0.5 * (b + b.signum() * disc.sqrt());
    let mut roots = if q == 0.0 {
        vec![0.0]
    } else {
        vec![q / a, c / q]
    };
    roots.sort_by(|x, y| x.total_cmp(y));
    roots.dedup();
    roots
}

fn polish(a: f64, b: f64, c: f64, d: f64, mut x: f64) -> f64 {
    for _ in 0..POLISH_STEPS {
        let p = ((a * x + b) * x + c) * x + d;
        let dp = (3.0 * a * x + 2.0 * b) * x + c;
        if dp == 0.0 || !dp.is_finite() {
            break;
        }
        let step = p / dp;
        if !step.is_finite() {
            break;
        }
        x -= step;
        if step.abs() <= f64::EPSILON * x.abs() {
            break;
        }
    }
    x
}
