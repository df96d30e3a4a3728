//! Local minimisers for small, smooth, unconstrained problems.
//!
//! Each solver starts from a caller-supplied point and runs until its own
//! convergence test passes or the iteration budget is spent. Running out of
//! iterations is not an error: the best point seen is always returned, with
//! `converged` set to `false`.

use crate::types::{DpcError, DpcResult};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Armijo sufficient-decrease constant
const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 60;
const GOLDEN_GROW: f64 = 1.618_034;
const GOLDEN_C: f64 = 0.381_966;
const GOLDEN_R: f64 = 1.0 - GOLDEN_C;
const MAX_BRACKET_STEPS: usize = 50;
const MAX_GOLDEN_STEPS: usize = 200;
const LBFGS_HISTORY: usize = 10;
const ANNEAL_SEED: u64 = 0x5eed_d9c0;
const ANNEAL_COOLING: f64 = 0.95;
const COBYLA_RHO_BEGIN: f64 = 0.5;

/// A scalar function of a parameter vector
pub trait Objective {
    fn value(&self, x: &Array1<f64>) -> f64;

    /// Gradient of [`Objective::value`]; central differences unless overridden
    fn gradient(&self, x: &Array1<f64>) -> Array1<f64> {
        let h0 = f64::EPSILON.cbrt();
        let mut grad = Array1::zeros(x.len());
        let mut stepped = x.clone();
        for i in 0..x.len() {
            let h = h0 * (1.0 + x[i].abs());
            stepped[i] = x[i] + h;
            let forward = self.value(&stepped);
            stepped[i] = x[i] - h;
            let backward = self.value(&stepped);
            stepped[i] = x[i];
            grad[i] = (forward - backward) / (2.0 * h);
        }
        grad
    }
}

/// Available local minimisation methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Solver {
    #[default]
    NelderMead,
    Powell,
    ConjugateGradient,
    Bfgs,
    Anneal,
    LBfgsB,
    TruncatedNewton,
    Cobyla,
    Slsqp,
}

impl Solver {
    /// Every solver, in canonical order
    pub const ALL: [Solver; 9] = [
        Solver::NelderMead,
        Solver::Powell,
        Solver::ConjugateGradient,
        Solver::Bfgs,
        Solver::Anneal,
        Solver::LBfgsB,
        Solver::TruncatedNewton,
        Solver::Cobyla,
        Solver::Slsqp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Solver::NelderMead => "Nelder-Mead",
            Solver::Powell => "Powell",
            Solver::ConjugateGradient => "CG",
            Solver::Bfgs => "BFGS",
            Solver::Anneal => "Anneal",
            Solver::LBfgsB => "L-BFGS-B",
            Solver::TruncatedNewton => "TNC",
            Solver::Cobyla => "COBYLA",
            Solver::Slsqp => "SLSQP",
        }
    }
}

impl fmt::Display for Solver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Solver {
    type Err = DpcError;

    fn from_str(s: &str) -> DpcResult<Self> {
        Solver::ALL
            .iter()
            .copied()
            .find(|solver| solver.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                DpcError::InvalidConfiguration(format!(
                    "Unsupported solver '{}', expected one of: {}",
                    s,
                    Solver::ALL.iter().map(|v| v.name()).collect::<Vec<_>>().join(", ")
                ))
            })
    }
}

/// Termination controls shared by all solvers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinimizeOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 2000,
        }
    }
}

/// Final state of a minimisation
#[derive(Debug, Clone)]
pub struct OptimizeResult {
    pub x: Array1<f64>,
    pub fun: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimise `objective` from `x0` with the chosen method
pub fn minimize<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    solver: Solver,
    options: &MinimizeOptions,
) -> OptimizeResult {
    match solver {
        Solver::NelderMead => nelder_mead(objective, x0, options),
        Solver::Powell => powell(objective, x0, options),
        Solver::ConjugateGradient => conjugate_gradient(objective, x0, options),
        Solver::Bfgs => bfgs(objective, x0, options),
        Solver::Anneal => anneal(objective, x0, options),
        Solver::LBfgsB => lbfgs(objective, x0, options),
        Solver::TruncatedNewton => truncated_newton(objective, x0, options),
        Solver::Cobyla => cobyla(objective, x0, options),
        Solver::Slsqp => slsqp(objective, x0, options),
    }
}

fn inf_norm(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0, |acc, &x| acc.max(x.abs()))
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// First trial step length, capped so the step stays within `1 + |x|`
fn initial_step(x: &Array1<f64>, direction: &Array1<f64>) -> f64 {
    let step_norm = norm(direction);
    if step_norm > 0.0 {
        ((1.0 + norm(x)) / step_norm).min(1.0)
    } else {
        1.0
    }
}

/// Backtracking line search satisfying the Armijo condition
fn backtrack<O: Objective + ?Sized>(
    objective: &O,
    x: &Array1<f64>,
    fx: f64,
    grad: &Array1<f64>,
    direction: &Array1<f64>,
    alpha0: f64,
) -> Option<(Array1<f64>, f64)> {
    let slope = grad.dot(direction);
    let mut alpha = alpha0;
    for _ in 0..MAX_BACKTRACKS {
        let candidate = x + &(direction * alpha);
        let fc = objective.value(&candidate);
        if fc <= fx + ARMIJO_C1 * alpha * slope {
            return Some((candidate, fc));
        }
        alpha *= 0.5;
    }
    None
}

/// Minimise along `x + alpha * direction`, returning `(alpha, f)`
fn line_minimize<O: Objective + ?Sized>(
    objective: &O,
    x: &Array1<f64>,
    fx: f64,
    direction: &Array1<f64>,
    tol: f64,
) -> (f64, f64) {
    let phi = |alpha: f64| objective.value(&(x + &(direction * alpha)));

    // bracket
    let f_unit = phi(1.0);
    let (mut a, mut b, mut fb) = if f_unit > fx {
        (1.0, 0.0, fx)
    } else {
        (0.0, 1.0, f_unit)
    };
    let mut c = b + GOLDEN_GROW * (b - a);
    let mut fc = phi(c);
    let mut steps = 0;
    while fc < fb && steps < MAX_BRACKET_STEPS {
        a = b;
        b = c;
        fb = fc;
        c = b + GOLDEN_GROW * (b - a);
        fc = phi(c);
        steps += 1;
    }
    if fc < fb {
        return if fc < fx { (c, fc) } else { (0.0, fx) };
    }

    // golden section
    let (mut x0, mut x3) = (a, c);
    let (mut x1, mut x2) = if (c - b).abs() > (b - a).abs() {
        (b, b + GOLDEN_C * (c - b))
    } else {
        (b - GOLDEN_C * (b - a), b)
    };
    let mut f1 = phi(x1);
    let mut f2 = phi(x2);
    let mut steps = 0;
    while (x3 - x0).abs() > tol * (x1.abs() + x2.abs()) + 1e-10 && steps < MAX_GOLDEN_STEPS {
        if f2 < f1 {
            x0 = x1;
            x1 = x2;
            x2 = GOLDEN_R * x2 + GOLDEN_C * x3;
            f1 = f2;
            f2 = phi(x2);
        } else {
            x3 = x2;
            x2 = x1;
            x1 = GOLDEN_R * x1 + GOLDEN_C * x0;
            f2 = f1;
            f1 = phi(x1);
        }
        steps += 1;
    }

    let (alpha, fmin) = if f1 < f2 { (x1, f1) } else { (x2, f2) };
    if fmin < fx {
        (alpha, fmin)
    } else {
        (0.0, fx)
    }
}

fn nelder_mead<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    const RHO: f64 = 1.0;
    const CHI: f64 = 2.0;
    const PSI: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    let n = x0.len();
    let mut simplex: Vec<(Array1<f64>, f64)> = Vec::with_capacity(n + 1);
    simplex.push((x0.clone(), objective.value(x0)));
    for k in 0..n {
        let mut vertex = x0.clone();
        vertex[k] = if vertex[k] != 0.0 { vertex[k] * 1.05 } else { 0.00025 };
        let fv = objective.value(&vertex);
        simplex.push((vertex, fv));
    }
    simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        let best = &simplex[0];
        let x_spread = simplex[1..]
            .iter()
            .map(|(v, _)| inf_norm(&(v - &best.0)))
            .fold(0.0, f64::max);
        let f_spread = simplex[1..]
            .iter()
            .map(|(_, fv)| (fv - best.1).abs())
            .fold(0.0, f64::max);
        if x_spread <= options.tolerance && f_spread <= options.tolerance {
            converged = true;
            break;
        }

        let mut centroid = Array1::<f64>::zeros(n);
        for (v, _) in &simplex[..n] {
            centroid += v;
        }
        centroid /= n as f64;

        let worst = simplex[n].0.clone();
        let f_worst = simplex[n].1;
        let f_second_worst = simplex[n.saturating_sub(1)].1;

        let xr = &centroid * (1.0 + RHO) - &worst * RHO;
        let fxr = objective.value(&xr);
        let mut shrink = false;

        if fxr < simplex[0].1 {
            let xe = &centroid * (1.0 + RHO * CHI) - &worst * (RHO * CHI);
            let fxe = objective.value(&xe);
            simplex[n] = if fxe < fxr { (xe, fxe) } else { (xr, fxr) };
        } else if fxr < f_second_worst {
            simplex[n] = (xr, fxr);
        } else if fxr < f_worst {
            let xc = &centroid * (1.0 + PSI * RHO) - &worst * (PSI * RHO);
            let fxc = objective.value(&xc);
            if fxc <= fxr {
                simplex[n] = (xc, fxc);
            } else {
                shrink = true;
            }
        } else {
            let xcc = &centroid * (1.0 - PSI) + &worst * PSI;
            let fxcc = objective.value(&xcc);
            if fxcc < f_worst {
                simplex[n] = (xcc, fxcc);
            } else {
                shrink = true;
            }
        }

        if shrink {
            let anchor = simplex[0].0.clone();
            for vertex in simplex.iter_mut().skip(1) {
                let moved = &anchor + &((&vertex.0 - &anchor) * SIGMA);
                let fv = objective.value(&moved);
                *vertex = (moved, fv);
            }
        }

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        iterations += 1;
    }

    let (x, fun) = simplex.swap_remove(0);
    OptimizeResult {
        x,
        fun,
        iterations,
        converged,
    }
}

fn powell<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let n = x0.len();
    let mut directions: Vec<Array1<f64>> = (0..n)
        .map(|i| {
            let mut d = Array1::zeros(n);
            d[i] = 1.0;
            d
        })
        .collect();

    let mut x = x0.clone();
    let mut fval = objective.value(&x);
    let mut iterations = 0;
    let mut converged = false;
    let line_tol = options.tolerance.max(1e-8);

    while iterations < options.max_iterations {
        let x_start = x.clone();
        let f_start = fval;
        let mut biggest_drop = 0.0;
        let mut biggest_index = 0;

        for (i, direction) in directions.iter().enumerate() {
            let f_before = fval;
            let (alpha, f_new) = line_minimize(objective, &x, fval, direction, line_tol);
            if alpha != 0.0 {
                x = &x + &(direction * alpha);
                fval = f_new;
            }
            if f_before - fval > biggest_drop {
                biggest_drop = f_before - fval;
                biggest_index = i;
            }
        }
        iterations += 1;

        if 2.0 * (f_start - fval) <= options.tolerance * (f_start.abs() + fval.abs()) + 1e-20 {
            converged = true;
            break;
        }

        let shift = &x - &x_start;
        let extrapolated = &x * 2.0 - &x_start;
        let f_extrapolated = objective.value(&extrapolated);
        if f_start > f_extrapolated {
            let mut t = 2.0 * (f_start + f_extrapolated - 2.0 * fval);
            t *= (f_start - fval - biggest_drop).powi(2);
            t -= biggest_drop * (f_start - f_extrapolated).powi(2);
            if t < 0.0 {
                let (alpha, f_new) = line_minimize(objective, &x, fval, &shift, line_tol);
                if alpha != 0.0 {
                    x = &x + &(&shift * alpha);
                    fval = f_new;
                }
                let last = n - 1;
                directions[biggest_index] = directions[last].clone();
                directions[last] = if alpha != 0.0 { shift * alpha } else { shift };
            }
        }
    }

    OptimizeResult {
        x,
        fun: fval,
        iterations,
        converged,
    }
}

fn conjugate_gradient<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let n = x0.len();
    let mut x = x0.clone();
    let mut fx = objective.value(&x);
    let mut grad = objective.gradient(&x);
    let mut direction = -&grad;
    let mut iterations = 0;
    let mut converged = false;
    let line_tol = options.tolerance.max(1e-8);

    while iterations < options.max_iterations {
        if inf_norm(&grad) <= options.tolerance {
            converged = true;
            break;
        }

        let d_norm = norm(&direction);
        let unit = &direction / d_norm;
        let (alpha, f_new) = line_minimize(objective, &x, fx, &unit, line_tol);
        iterations += 1;
        if alpha == 0.0 {
            // no progress along a descent direction: the gradient is noise-level
            converged = inf_norm(&grad) <= options.tolerance.sqrt();
            break;
        }

        x = &x + &(&unit * alpha);
        fx = f_new;
        let new_grad = objective.gradient(&x);

        // Polak-Ribiere with restart
        let beta = (new_grad.dot(&(&new_grad - &grad)) / grad.dot(&grad)).max(0.0);
        direction = &direction * beta - &new_grad;
        if iterations % n.max(1) == 0 || direction.dot(&new_grad) >= 0.0 {
            direction = -&new_grad;
        }
        grad = new_grad;
    }

    OptimizeResult {
        x,
        fun: fx,
        iterations,
        converged,
    }
}

fn bfgs<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let n = x0.len();
    let identity = Array2::<f64>::eye(n);
    let mut inv_hessian = identity.clone();
    let mut x = x0.clone();
    let mut fx = objective.value(&x);
    let mut grad = objective.gradient(&x);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        if inf_norm(&grad) <= options.tolerance {
            converged = true;
            break;
        }

        let mut direction = -inv_hessian.dot(&grad);
        if grad.dot(&direction) >= 0.0 {
            inv_hessian = identity.clone();
            direction = -&grad;
        }

        let alpha0 = initial_step(&x, &direction);
        iterations += 1;
        let Some((x_new, f_new)) = backtrack(objective, &x, fx, &grad, &direction, alpha0) else {
            break;
        };

        let grad_new = objective.gradient(&x_new);
        let s = &x_new - &x;
        let y = &grad_new - &grad;
        let sy = s.dot(&y);
        if sy > 1e-12 {
            let rho = 1.0 / sy;
            let s_col = s.view().insert_axis(ndarray::Axis(1));
            let y_row = y.view().insert_axis(ndarray::Axis(0));
            let s_row = s.view().insert_axis(ndarray::Axis(0));
            let left = &identity - &(s_col.dot(&y_row) * rho);
            let right = &identity - &(y_row.t().dot(&s_row) * rho);
            inv_hessian = left.dot(&inv_hessian).dot(&right) + s_col.dot(&s_row) * rho;
        }

        x = x_new;
        fx = f_new;
        grad = grad_new;

        if inf_norm(&s) <= f64::EPSILON * (1.0 + inf_norm(&x)) {
            converged = inf_norm(&grad) <= options.tolerance.sqrt();
            break;
        }
    }

    OptimizeResult {
        x,
        fun: fx,
        iterations,
        converged,
    }
}

fn lbfgs<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let mut history: Vec<(Array1<f64>, Array1<f64>, f64)> = Vec::with_capacity(LBFGS_HISTORY);
    let mut x = x0.clone();
    let mut fx = objective.value(&x);
    let mut grad = objective.gradient(&x);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        if inf_norm(&grad) <= options.tolerance {
            converged = true;
            break;
        }

        // two-loop recursion
        let mut q = grad.clone();
        let mut alphas = Vec::with_capacity(history.len());
        for (s, y, rho) in history.iter().rev() {
            let a = rho * s.dot(&q);
            q = &q - &(y * a);
            alphas.push(a);
        }
        if let Some((s, y, _)) = history.last() {
            q *= s.dot(y) / y.dot(y);
        }
        for ((s, y, rho), a) in history.iter().zip(alphas.iter().rev()) {
            let b = rho * y.dot(&q);
            q = &q + &(s * (a - b));
        }
        let mut direction = -q;
        if grad.dot(&direction) >= 0.0 {
            history.clear();
            direction = -&grad;
        }

        let alpha0 = initial_step(&x, &direction);
        iterations += 1;
        let Some((x_new, f_new)) = backtrack(objective, &x, fx, &grad, &direction, alpha0) else {
            break;
        };

        let grad_new = objective.gradient(&x_new);
        let s = &x_new - &x;
        let y = &grad_new - &grad;
        let sy = s.dot(&y);
        if sy > 1e-12 {
            if history.len() == LBFGS_HISTORY {
                history.remove(0);
            }
            history.push((s.clone(), y, 1.0 / sy));
        }

        x = x_new;
        fx = f_new;
        grad = grad_new;

        if inf_norm(&s) <= f64::EPSILON * (1.0 + inf_norm(&x)) {
            converged = inf_norm(&grad) <= options.tolerance.sqrt();
            break;
        }
    }

    OptimizeResult {
        x,
        fun: fx,
        iterations,
        converged,
    }
}

fn truncated_newton<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let n = x0.len();
    let max_inner = n.max(1) * 5;
    let mut x = x0.clone();
    let mut fx = objective.value(&x);
    let mut grad = objective.gradient(&x);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        let grad_norm = norm(&grad);
        if inf_norm(&grad) <= options.tolerance {
            converged = true;
            break;
        }

        // inner CG on H p = -g with finite-difference Hessian products
        let hessian_product = |v: &Array1<f64>| -> Array1<f64> {
            let eps = f64::EPSILON.sqrt() * (1.0 + norm(&x)) / norm(v).max(f64::MIN_POSITIVE);
            (objective.gradient(&(&x + &(v * eps))) - &grad) / eps
        };
        let forcing = grad_norm * grad_norm.sqrt().min(0.5);
        let mut p = Array1::<f64>::zeros(n);
        let mut r = -&grad;
        let mut d = r.clone();
        let mut rr = r.dot(&r);
        for inner in 0..max_inner {
            let hd = hessian_product(&d);
            let curvature = d.dot(&hd);
            if curvature <= 0.0 {
                if inner == 0 {
                    p = -&grad;
                }
                break;
            }
            let step = rr / curvature;
            p = &p + &(&d * step);
            r = &r - &(&hd * step);
            let rr_new = r.dot(&r);
            if rr_new.sqrt() <= forcing {
                break;
            }
            d = &r + &(&d * (rr_new / rr));
            rr = rr_new;
        }
        if grad.dot(&p) >= 0.0 {
            p = -&grad;
        }

        let alpha0 = initial_step(&x, &p);
        iterations += 1;
        let Some((x_new, f_new)) = backtrack(objective, &x, fx, &grad, &p, alpha0) else {
            break;
        };

        let moved = inf_norm(&(&x_new - &x));
        x = x_new;
        fx = f_new;
        grad = objective.gradient(&x);

        if moved <= f64::EPSILON * (1.0 + inf_norm(&x)) {
            converged = inf_norm(&grad) <= options.tolerance.sqrt();
            break;
        }
    }

    OptimizeResult {
        x,
        fun: fx,
        iterations,
        converged,
    }
}

/// Unconstrained COBYLA: linear models over `n + 1` points in a shrinking trust region
fn cobyla<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let n = x0.len();
    let mut x = x0.clone();
    let mut fx = objective.value(&x);
    let mut rho = COBYLA_RHO_BEGIN.max(options.tolerance);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        if rho <= options.tolerance {
            converged = true;
            break;
        }
        iterations += 1;

        let mut slope = Array1::<f64>::zeros(n);
        let mut best_vertex: Option<(Array1<f64>, f64)> = None;
        for i in 0..n {
            let mut vertex = x.clone();
            vertex[i] += rho;
            let fv = objective.value(&vertex);
            slope[i] = (fv - fx) / rho;
            if fv < best_vertex.as_ref().map_or(fx, |(_, f)| *f) {
                best_vertex = Some((vertex, fv));
            }
        }

        let slope_norm = norm(&slope);
        let mut improved = false;
        if slope_norm > 0.0 {
            let trial = &x - &(&slope * (rho / slope_norm));
            let ft = objective.value(&trial);
            if ft < fx && ft <= best_vertex.as_ref().map_or(fx, |(_, f)| *f) {
                x = trial;
                fx = ft;
                improved = true;
            }
        }
        if !improved {
            if let Some((vertex, fv)) = best_vertex {
                x = vertex;
                fx = fv;
                improved = true;
            }
        }
        if !improved {
            rho *= 0.5;
        }
    }

    OptimizeResult {
        x,
        fun: fx,
        iterations,
        converged,
    }
}

/// Solve `a x = b` through an LU factorisation; `None` when `a` is singular
fn solve_linear(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let matrix = DMatrix::from_fn(n, n, |i, j| a[[i, j]]);
    let rhs = DVector::from_iterator(n, b.iter().copied());
    let solution = matrix.lu().solve(&rhs)?;
    Some(solution.iter().copied().collect())
}

/// SLSQP without constraints: quasi-Newton steps on a damped-BFGS Hessian
fn slsqp<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let n = x0.len();
    let identity = Array2::<f64>::eye(n);
    let mut hessian = identity.clone();
    let mut x = x0.clone();
    let mut fx = objective.value(&x);
    let mut grad = objective.gradient(&x);
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        if inf_norm(&grad) <= options.tolerance {
            converged = true;
            break;
        }

        let neg_grad = -&grad;
        let mut direction = match solve_linear(&hessian, &neg_grad) {
            Some(p) if grad.dot(&p) < 0.0 => p,
            _ => {
                hessian = identity.clone();
                neg_grad
            }
        };
        if !direction.iter().all(|v| v.is_finite()) {
            hessian = identity.clone();
            direction = -&grad;
        }

        let alpha0 = initial_step(&x, &direction);
        iterations += 1;
        let Some((x_new, f_new)) = backtrack(objective, &x, fx, &grad, &direction, alpha0) else {
            break;
        };

        let grad_new = objective.gradient(&x_new);
        let s = &x_new - &x;
        let mut y = &grad_new - &grad;
        let bs = hessian.dot(&s);
        let sbs = s.dot(&bs);
        let sy = s.dot(&y);
        if sbs > 0.0 {
            // Powell damping keeps the update positive definite
            if sy < 0.2 * sbs {
                let theta = 0.8 * sbs / (sbs - sy);
                y = &y * theta + &bs * (1.0 - theta);
            }
            let sy = s.dot(&y);
            if sy > 0.0 {
                let y_col = y.view().insert_axis(ndarray::Axis(1));
                let bs_col = bs.view().insert_axis(ndarray::Axis(1));
                hessian = &hessian + &(y_col.dot(&y_col.t()) / sy) - &(bs_col.dot(&bs_col.t()) / sbs);
            }
        }

        x = x_new;
        fx = f_new;
        grad = grad_new;

        if inf_norm(&s) <= f64::EPSILON * (1.0 + inf_norm(&x)) {
            converged = inf_norm(&grad) <= options.tolerance.sqrt();
            break;
        }
    }

    OptimizeResult {
        x,
        fun: fx,
        iterations,
        converged,
    }
}

/// Simulated annealing with geometric cooling; keeps the best point visited
fn anneal<O: Objective + ?Sized>(
    objective: &O,
    x0: &Array1<f64>,
    options: &MinimizeOptions,
) -> OptimizeResult {
    let mut rng = StdRng::seed_from_u64(ANNEAL_SEED);
    let mut current = x0.clone();
    let mut f_current = objective.value(&current);
    let mut best = current.clone();
    let mut f_best = f_current;

    let t0 = f_current.abs().max(1.0);
    let mut temperature = t0;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < options.max_iterations {
        if temperature <= options.tolerance * t0 {
            converged = true;
            break;
        }
        iterations += 1;

        let scale = 0.5 * (temperature / t0).sqrt();
        let candidate = current.mapv(|v| v + scale * (1.0 + v.abs()) * rng.gen_range(-1.0..1.0));
        let f_candidate = objective.value(&candidate);

        let accept = f_candidate < f_current
            || rng.gen::<f64>() < (-(f_candidate - f_current) / temperature).exp();
        if accept {
            current = candidate;
            f_current = f_candidate;
            if f_current < f_best {
                best = current.clone();
                f_best = f_current;
            }
        }

        temperature *= ANNEAL_COOLING;
    }

    OptimizeResult {
        x: best,
        fun: f_best,
        iterations,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    /// Rosenbrock-like bowl with a known minimum at (1, 2)
    struct Bowl;

    impl Objective for Bowl {
        fn value(&self, x: &Array1<f64>) -> f64 {
            (x[0] - 1.0).powi(2) + 4.0 * (x[1] - 2.0).powi(2) + 0.5 * (x[0] - 1.0) * (x[1] - 2.0)
        }
    }

    #[test]
    fn test_solver_names_roundtrip() {
        for solver in Solver::ALL {
            assert_eq!(solver.name().parse::<Solver>().unwrap(), solver);
        }
        assert_eq!("nelder-mead".parse::<Solver>().unwrap(), Solver::NelderMead);
        assert_eq!(Solver::default(), Solver::NelderMead);
        assert_eq!(Solver::LBfgsB.to_string(), "L-BFGS-B");
    }

    #[test]
    fn test_unknown_solver_rejected() {
        let result = "Newton-Raphson".parse::<Solver>();
        assert!(matches!(result, Err(DpcError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_numeric_gradient() {
        let g = Bowl.gradient(&array![0.0, 0.0]);
        assert_relative_eq!(g[0], -2.0 - 1.0, epsilon = 1e-6);
        assert_relative_eq!(g[1], -16.0 - 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_all_solvers_find_bowl_minimum() {
        let options = MinimizeOptions {
            tolerance: 1e-8,
            max_iterations: 2000,
        };
        for solver in Solver::ALL.into_iter().filter(|s| *s != Solver::Anneal) {
            let result = minimize(&Bowl, &array![0.5, 1.5], solver, &options);
            assert!(
                (result.x[0] - 1.0).abs() < 1e-3 && (result.x[1] - 2.0).abs() < 1e-3,
                "{} ended at {:?}",
                solver,
                result.x
            );
        }
    }

    #[test]
    fn test_anneal_never_worse_than_start() {
        let x0 = array![0.5, 1.5];
        let start = Bowl.value(&x0);
        let result = minimize(&Bowl, &x0, Solver::Anneal, &MinimizeOptions::default());
        assert!(result.fun <= start);
        assert_relative_eq!(result.fun, Bowl.value(&result.x));
    }

    #[test]
    fn test_iteration_budget_returns_best_point() {
        let options = MinimizeOptions {
            tolerance: 1e-12,
            max_iterations: 3,
        };
        let x0 = array![-5.0, 7.0];
        let result = minimize(&Bowl, &x0, Solver::NelderMead, &options);
        assert!(!result.converged);
        assert_eq!(result.iterations, 3);
        assert!(result.fun <= Bowl.value(&x0));
    }

    #[test]
    fn test_solve_linear() {
        let a = array![[4.0, 1.0], [2.0, 3.0]];
        let x = solve_linear(&a, &array![1.0, 2.0]).unwrap();
        assert_relative_eq!(x[0], 0.1, epsilon = 1e-12);
        assert_relative_eq!(x[1], 0.6, epsilon = 1e-12);
        assert!(solve_linear(&array![[1.0, 2.0], [2.0, 4.0]], &array![1.0, 1.0]).is_none());

        // zero leading pivot needs a row swap
        let a = array![[0.0, 2.0, 1.0], [1.0, 1.0, 0.0], [3.0, 0.0, 1.0]];
        let x = solve_linear(&a, &array![5.0, 3.0, 4.0]).unwrap();
        for (got, want) in x.iter().zip([1.0, 2.0, 1.0]) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
    }
}
