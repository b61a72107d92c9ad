//! Adaptive ODE integration with a stiff fallback.
//!
//! The primary method is an embedded Cash–Karp 4(5) Runge–Kutta pair with
//! standard step-size control. It is roughly an order of magnitude faster
//! than a fixed stiff method at the loose exploration tolerances this
//! engine runs at, with a documented ≤2% fit-error deviation trade-off.
//! When the explicit method thrashes (a long streak of rejected steps,
//! the usual stiffness signature), `SolverMethod::Auto` switches to a
//! linearized implicit Euler branch with step-doubling error control and a
//! finite-difference Jacobian solved via LU.
//!
//! Every failure mode (step-size underflow, step-budget exhaustion,
//! non-finite state, a singular implicit matrix, the wall-clock deadline)
//! collapses into the single [`IntegrationFailure`] type. Nothing here
//! panics on bad numerics and no distinct error types can escape an
//! evaluation running inside a worker.

use nalgebra::{DMatrix, DVector};

use crate::domain::{SolverConfig, SolverMethod};
use crate::ode::deadline::Deadline;

/// What broke during integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DeadlineExceeded,
    NonFiniteState,
    StepSizeUnderflow,
    StepBudgetExhausted,
    LinearSolveFailed,
}

/// A failed integration: the kind and the temperature it failed at.
///
/// The objective folds this into a penalty score; it is never surfaced to
/// the optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrationFailure {
    pub kind: FailureKind,
    pub t: f64,
}

impl std::fmt::Display for IntegrationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FailureKind::DeadlineExceeded => "deadline exceeded",
            FailureKind::NonFiniteState => "non-finite state",
            FailureKind::StepSizeUnderflow => "step size underflow",
            FailureKind::StepBudgetExhausted => "step budget exhausted",
            FailureKind::LinearSolveFailed => "linear solve failed",
        };
        write!(f, "integration failed at t={}: {kind}", self.t)
    }
}

/// States sampled at the requested points, plus the accepted-step count.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub states: Vec<Vec<f64>>,
    pub steps: usize,
}

/// Hard cap on attempted steps per call; the wall-clock deadline is the
/// operative budget, this is the backstop when the deadline is disabled.
const MAX_STEPS: usize = 500_000;

/// Consecutive explicit-step rejections before `Auto` switches to the
/// stiff branch.
const STIFF_REJECT_LIMIT: usize = 12;

/// Step-size growth/shrink clamp per accepted/rejected step.
const FACTOR_MIN: f64 = 0.2;
const FACTOR_MAX: f64 = 5.0;
const SAFETY: f64 = 0.9;

/// Integrate `dy/dt = f(t, y)` over `t_span`, sampling the state at
/// `sample_at` (sorted, within the span) by linear interpolation between
/// accepted steps.
///
/// The deadline is checked once per attempted step, the solver's inner
/// loop, so an overrun costs at most one extra step of work.
pub fn integrate<F>(
    f: F,
    y0: &[f64],
    t_span: (f64, f64),
    sample_at: &[f64],
    config: &SolverConfig,
    deadline: &Deadline,
) -> Result<Trajectory, IntegrationFailure>
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    let (t0, t1) = t_span;
    let span = t1 - t0;
    debug_assert!(span > 0.0 && !y0.is_empty());

    let n = y0.len();
    let mut t = t0;
    let mut y = y0.to_vec();
    let mut h = span / 100.0;
    let h_min = span * 1e-14;

    let mut states = Vec::with_capacity(sample_at.len());
    let mut cursor = 0;
    // Samples at (or numerically before) the start point map to y0.
    while cursor < sample_at.len() && sample_at[cursor] <= t0 {
        states.push(y.clone());
        cursor += 1;
    }

    let mut stepper = Stepper::new(n);
    let mut stiff = matches!(config.method, SolverMethod::Stiff);
    let mut rejects_in_a_row = 0usize;
    let mut saw_non_finite = false;
    let mut steps = 0usize;

    while t < t1 {
        // Remaining span below the step floor: nothing meaningful left to
        // integrate, stop before the step size degenerates.
        if t1 - t < h_min {
            break;
        }
        if deadline.expired() {
            return Err(IntegrationFailure {
                kind: FailureKind::DeadlineExceeded,
                t,
            });
        }
        steps += 1;
        if steps > MAX_STEPS {
            return Err(IntegrationFailure {
                kind: FailureKind::StepBudgetExhausted,
                t,
            });
        }
        if h < h_min {
            return Err(IntegrationFailure {
                kind: if saw_non_finite {
                    FailureKind::NonFiniteState
                } else {
                    FailureKind::StepSizeUnderflow
                },
                t,
            });
        }
        h = h.min(t1 - t);

        let attempt = if stiff {
            stepper.stiff_step(&f, t, &y, h, config)?
        } else {
            stepper.explicit_step(&f, t, &y, h, config)
        };

        match attempt {
            StepOutcome::Accept { y_new, factor } => {
                let t_new = t + h;
                // Record every requested sample crossed by this step.
                while cursor < sample_at.len() && sample_at[cursor] <= t_new {
                    let u = ((sample_at[cursor] - t) / h).clamp(0.0, 1.0);
                    let interp: Vec<f64> = y
                        .iter()
                        .zip(y_new.iter())
                        .map(|(&a, &b)| a + u * (b - a))
                        .collect();
                    states.push(interp);
                    cursor += 1;
                }
                t = t_new;
                y = y_new;
                h *= factor;
                rejects_in_a_row = 0;
                saw_non_finite = false;
            }
            StepOutcome::Reject { factor, non_finite } => {
                h *= factor;
                saw_non_finite |= non_finite;
                rejects_in_a_row += 1;
                if !stiff
                    && matches!(config.method, SolverMethod::Auto)
                    && rejects_in_a_row >= STIFF_REJECT_LIMIT
                {
                    stiff = true;
                    rejects_in_a_row = 0;
                }
            }
        }
    }

    // Float residue can leave trailing samples a hair past t1.
    while cursor < sample_at.len() {
        states.push(y.clone());
        cursor += 1;
    }

    Ok(Trajectory { states, steps })
}

enum StepOutcome {
    Accept { y_new: Vec<f64>, factor: f64 },
    Reject { factor: f64, non_finite: bool },
}

/// Preallocated stage buffers, reused across steps.
struct Stepper {
    k: [Vec<f64>; 6],
    tmp: Vec<f64>,
}

// Cash–Karp tableau.
const C: [f64; 6] = [0.0, 0.2, 0.3, 0.6, 1.0, 0.875];
const A2: [f64; 1] = [0.2];
const A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const A4: [f64; 3] = [0.3, -0.9, 1.2];
const A5: [f64; 4] = [-11.0 / 54.0, 2.5, -70.0 / 27.0, 35.0 / 27.0];
const A6: [f64; 5] = [
    1631.0 / 55296.0,
    175.0 / 512.0,
    575.0 / 13824.0,
    44275.0 / 110592.0,
    253.0 / 4096.0,
];
const B5: [f64; 6] = [
    37.0 / 378.0,
    0.0,
    250.0 / 621.0,
    125.0 / 594.0,
    0.0,
    512.0 / 1771.0,
];
const B4: [f64; 6] = [
    2825.0 / 27648.0,
    0.0,
    18575.0 / 48384.0,
    13525.0 / 55296.0,
    277.0 / 14336.0,
    0.25,
];

impl Stepper {
    fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
        }
    }

    /// One attempted Cash–Karp 4(5) step.
    fn explicit_step<F>(
        &mut self,
        f: &F,
        t: f64,
        y: &[f64],
        h: f64,
        config: &SolverConfig,
    ) -> StepOutcome
    where
        F: Fn(f64, &[f64], &mut [f64]),
    {
        let n = y.len();
        let a_rows: [&[f64]; 5] = [&A2, &A3, &A4, &A5, &A6];

        f(t, y, &mut self.k[0]);
        for stage in 1..6 {
            let a = a_rows[stage - 1];
            for i in 0..n {
                let mut acc = 0.0;
                for (j, &aj) in a.iter().enumerate() {
                    acc += aj * self.k[j][i];
                }
                self.tmp[i] = y[i] + h * acc;
            }
            f(t + C[stage] * h, &self.tmp, &mut self.k[stage]);
        }

        let mut y_new = vec![0.0; n];
        let mut err_norm_sq = 0.0;
        let mut finite = true;
        for i in 0..n {
            let mut y5 = 0.0;
            let mut y4 = 0.0;
            for s in 0..6 {
                y5 += B5[s] * self.k[s][i];
                y4 += B4[s] * self.k[s][i];
            }
            let yi = y[i] + h * y5;
            y_new[i] = yi;
            let err = h * (y5 - y4);
            let scale = config.atol + config.rtol * y[i].abs().max(yi.abs());
            let ratio = err / scale;
            err_norm_sq += ratio * ratio;
            finite &= yi.is_finite() && err.is_finite();
        }
        let err_norm = (err_norm_sq / n as f64).sqrt();

        if !finite || !err_norm.is_finite() {
            return StepOutcome::Reject {
                factor: 0.5,
                non_finite: true,
            };
        }
        let factor = (SAFETY * err_norm.powf(-0.2)).clamp(FACTOR_MIN, FACTOR_MAX);
        if err_norm <= 1.0 {
            StepOutcome::Accept { y_new, factor }
        } else {
            StepOutcome::Reject {
                factor,
                non_finite: false,
            }
        }
    }

    /// One attempted linearized implicit Euler step with step-doubling
    /// error control: one full step against two half steps.
    fn stiff_step<F>(
        &mut self,
        f: &F,
        t: f64,
        y: &[f64],
        h: f64,
        config: &SolverConfig,
    ) -> Result<StepOutcome, IntegrationFailure>
    where
        F: Fn(f64, &[f64], &mut [f64]),
    {
        let n = y.len();
        let full = linearized_euler(f, t, y, h).ok_or(IntegrationFailure {
            kind: FailureKind::LinearSolveFailed,
            t,
        })?;
        let half = linearized_euler(f, t, y, 0.5 * h).ok_or(IntegrationFailure {
            kind: FailureKind::LinearSolveFailed,
            t,
        })?;
        let halved = linearized_euler(f, t + 0.5 * h, &half, 0.5 * h).ok_or(IntegrationFailure {
            kind: FailureKind::LinearSolveFailed,
            t,
        })?;

        // Local extrapolation: the doubled-step difference estimates the
        // O(h²) local error, and combining the two solutions cancels it.
        let mut y_new = vec![0.0; n];
        let mut err_norm_sq = 0.0;
        let mut finite = true;
        for i in 0..n {
            let err = halved[i] - full[i];
            y_new[i] = 2.0 * halved[i] - full[i];
            let scale = config.atol + config.rtol * y[i].abs().max(halved[i].abs());
            let ratio = err / scale;
            err_norm_sq += ratio * ratio;
            finite &= y_new[i].is_finite();
        }
        let err_norm = (err_norm_sq / n as f64).sqrt();

        if !finite || !err_norm.is_finite() {
            return Ok(StepOutcome::Reject {
                factor: 0.5,
                non_finite: true,
            });
        }
        // The error estimate is O(h²), so control with exponent 1/2.
        let factor = (SAFETY * err_norm.powf(-0.5)).clamp(FACTOR_MIN, FACTOR_MAX);
        if err_norm <= 1.0 {
            Ok(StepOutcome::Accept { y_new, factor })
        } else {
            Ok(StepOutcome::Reject {
                factor,
                non_finite: false,
            })
        }
    }
}

/// One linearized implicit Euler step: solve `(I − hJ)·Δ = h·f(t, y)`.
///
/// Returns `None` when the implicit matrix is singular.
fn linearized_euler<F>(f: &F, t: f64, y: &[f64], h: f64) -> Option<Vec<f64>>
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    let n = y.len();
    let mut fy = vec![0.0; n];
    f(t, y, &mut fy);

    let jac = jacobian(f, t, y, &fy);
    let m = DMatrix::<f64>::from_fn(n, n, |i, j| {
        let identity = if i == j { 1.0 } else { 0.0 };
        identity - h * jac[(i, j)]
    });
    let rhs = DVector::from_iterator(n, fy.iter().map(|&v| h * v));
    let delta = m.lu().solve(&rhs)?;
    if delta.iter().any(|d| !d.is_finite()) {
        return None;
    }
    Some(y.iter().zip(delta.iter()).map(|(&yi, &d)| yi + d).collect())
}

/// Forward-difference Jacobian of `f` at `(t, y)`.
fn jacobian<F>(f: &F, t: f64, y: &[f64], fy: &[f64]) -> DMatrix<f64>
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    let n = y.len();
    let mut perturbed = y.to_vec();
    let mut fp = vec![0.0; n];
    let mut jac = DMatrix::<f64>::zeros(n, n);
    let sqrt_eps = f64::EPSILON.sqrt();
    for j in 0..n {
        let delta = sqrt_eps * y[j].abs().max(1e-3);
        perturbed[j] = y[j] + delta;
        f(t, &perturbed, &mut fp);
        for i in 0..n {
            jac[(i, j)] = (fp[i] - fy[i]) / delta;
        }
        perturbed[j] = y[j];
    }
    jac
}
