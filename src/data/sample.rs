//! Synthetic conversion curves from forward simulation of a ground-truth
//! network.
//!
//! Used by the end-to-end tests and by downstream tooling that wants a
//! self-test dataset: simulate the network at each heating rate with a
//! tightened solver configuration, then add seeded Gaussian noise.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::domain::{ExperimentCurve, ReactionNetwork, SolverConfig, SolverMethod};
use crate::error::EngineError;
use crate::ode::{Deadline, NetworkRates, integrate};

/// Configuration for synthetic curve generation.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Heating rates, one curve per entry.
    pub betas: Vec<f64>,
    pub t_start: f64,
    pub t_end: f64,
    pub samples_per_curve: usize,
    /// Standard deviation of the additive Gaussian noise; 0 disables noise.
    pub noise_sigma: f64,
    pub seed: u64,
}

/// Forward-simulate `network` at each heating rate and return noisy
/// conversion curves.
///
/// Noise is seeded per curve (`seed + curve index`) so adding a heating
/// rate does not reshuffle the noise of the existing curves. Conversions
/// are clamped to [0, 1] after noise, like a normalized measurement.
pub fn generate_curves(
    network: &ReactionNetwork,
    config: &SyntheticConfig,
) -> Result<Vec<ExperimentCurve>, EngineError> {
    if config.betas.is_empty() {
        return Err(EngineError::Config("no heating rates supplied".into()));
    }
    if config.betas.iter().any(|b| !(b.is_finite() && *b > 0.0)) {
        return Err(EngineError::Config("heating rates must be positive".into()));
    }
    if config.samples_per_curve < 2 {
        return Err(EngineError::Config("need at least two samples per curve".into()));
    }
    if !(config.t_start.is_finite()
        && config.t_end.is_finite()
        && config.t_end > config.t_start)
    {
        return Err(EngineError::Config(format!(
            "invalid temperature range {}..{}",
            config.t_start, config.t_end
        )));
    }
    if !(config.noise_sigma.is_finite() && config.noise_sigma >= 0.0) {
        return Err(EngineError::Config("noise sigma must be non-negative".into()));
    }

    // Ground truth is simulated tighter than the exploration defaults and
    // without a wall-clock budget.
    let solver = SolverConfig {
        method: SolverMethod::Explicit,
        rtol: 1e-6,
        atol: 1e-9,
        timeout_ms: 0,
    };

    let rates = NetworkRates::new(network);
    let y0 = rates.initial_state();
    let n = config.samples_per_curve;
    let step = (config.t_end - config.t_start) / (n as f64 - 1.0);
    let temperatures: Vec<f64> = (0..n).map(|i| config.t_start + step * i as f64).collect();

    let noise = Normal::new(0.0, 1.0)
        .map_err(|e| EngineError::Config(format!("noise distribution error: {e}")))?;

    let mut curves = Vec::with_capacity(config.betas.len());
    for (c, &beta) in config.betas.iter().enumerate() {
        let trajectory = integrate(
            |t, y: &[f64], dydt: &mut [f64]| rates.derivative(t, y, dydt, beta),
            &y0,
            (config.t_start, config.t_end),
            &temperatures,
            &solver,
            &Deadline::unlimited(),
        )
        .map_err(|failure| {
            EngineError::Curve(format!("forward simulation at beta={beta} failed: {failure}"))
        })?;

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(c as u64));
        let conversions: Vec<f64> = trajectory
            .states
            .iter()
            .map(|state| {
                let clean = rates.conversion(state);
                let noisy = clean + config.noise_sigma * noise.sample(&mut rng);
                noisy.clamp(0.0, 1.0)
            })
            .collect();

        curves.push(ExperimentCurve::new(beta, temperatures.clone(), conversions)?);
    }
    Ok(curves)
}
