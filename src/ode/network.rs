//! The reaction-network ODE right-hand side.
//!
//! The network is lowered into flat primitive arrays so the derivative loop
//! touches only slices: no per-reaction objects, no allocation in the hot
//! path. The state vector `y` holds the remaining (untransformed) mass
//! fraction of each species; the rate function of a reaction receives the
//! source species' conversion degree `1 − y[source]`, which is the variable
//! the standard f(α) catalog is written in.
//!
//! The exponent clamping below is a robustness policy, not an optimization:
//! reference fits depend on it, so the clamp bounds are part of the
//! numerical contract.

use crate::domain::{ReactionNetwork, ReactionParams};
use crate::models;

/// Universal gas constant, J/(mol·K).
pub const GAS_CONSTANT: f64 = 8.314_462_618;

/// Temperatures are floored here before entering the Arrhenius exponent, so
/// a solver step that probes near absolute zero cannot divide by zero.
pub const TEMP_FLOOR: f64 = 1.0;

/// Arrhenius exponent clamp; `exp(±700)` is still finite in f64.
pub const EXP_CLAMP: f64 = 700.0;

/// Flat-array form of a reaction network, ready for the derivative loop.
#[derive(Debug, Clone)]
pub struct NetworkRates {
    species_count: usize,
    source: Vec<usize>,
    target: Vec<usize>,
    model: Vec<usize>,
    ln_a: Vec<f64>,
    ea: Vec<f64>,
    contribution: Vec<f64>,
    terminal: Vec<bool>,
}

impl NetworkRates {
    /// Lower a validated network into flat arrays.
    pub fn new(network: &ReactionNetwork) -> Self {
        let reactions = network.reactions();
        let mut terminal = vec![true; network.species_count()];
        for r in reactions {
            terminal[r.source] = false;
        }
        Self {
            species_count: network.species_count(),
            source: reactions.iter().map(|r| r.source).collect(),
            target: reactions.iter().map(|r| r.target).collect(),
            model: reactions.iter().map(|r| r.model).collect(),
            ln_a: reactions.iter().map(|r| r.ln_a).collect(),
            ea: reactions.iter().map(|r| r.ea).collect(),
            contribution: reactions.iter().map(|r| r.contribution).collect(),
            terminal,
        }
    }

    /// Build from raw connectivity plus candidate parameters.
    ///
    /// Connectivity comes from the (already validated) network the objective
    /// was built from; `params` carries one entry per reaction.
    pub fn from_connectivity(
        species_count: usize,
        source: &[usize],
        target: &[usize],
        params: &[ReactionParams],
    ) -> Self {
        let mut terminal = vec![true; species_count];
        for &s in source {
            terminal[s] = false;
        }
        Self {
            species_count,
            source: source.to_vec(),
            target: target.to_vec(),
            model: params.iter().map(|p| p.model).collect(),
            ln_a: params.iter().map(|p| p.ln_a).collect(),
            ea: params.iter().map(|p| p.ea).collect(),
            contribution: params.iter().map(|p| p.contribution).collect(),
            terminal,
        }
    }

    /// Initial state: all mass in the root species.
    pub fn initial_state(&self) -> Vec<f64> {
        let mut y0 = vec![0.0; self.species_count];
        y0[0] = 1.0;
        y0
    }

    /// Evaluate `dy/dT` at temperature `t` for heating rate `beta`.
    ///
    /// Per reaction: `k = exp(clamp(ln_a − ea/(R·T)))`, flux
    /// `w·k·f(model, 1 − y[source])/β`, consumed from the source and
    /// produced into the target. Division by β converts the time-derivative
    /// system into a temperature-derivative one for ramp integration.
    #[inline]
    pub fn derivative(&self, t: f64, y: &[f64], dydt: &mut [f64], beta: f64) {
        dydt.fill(0.0);
        let t_safe = t.max(TEMP_FLOOR);
        for r in 0..self.source.len() {
            let exponent =
                (self.ln_a[r] - self.ea[r] / (GAS_CONSTANT * t_safe)).clamp(-EXP_CLAMP, EXP_CLAMP);
            let k = exponent.exp();
            let alpha_src = 1.0 - y[self.source[r]];
            let flux = self.contribution[r] * k * models::rate(self.model[r], alpha_src) / beta;
            dydt[self.source[r]] -= flux;
            dydt[self.target[r]] += flux;
        }
    }

    /// Simulated measured conversion: the summed state of terminal species.
    ///
    /// For a single-step network this is the classic conversion degree; for
    /// chains it tracks final-product formation, which keeps the objective
    /// sensitive to every reaction on the path.
    #[inline]
    pub fn conversion(&self, y: &[f64]) -> f64 {
        let mut total = 0.0;
        for (i, &yi) in y.iter().enumerate() {
            if self.terminal[i] {
                total += yi;
            }
        }
        total
    }
}
