//! The fit objective: aggregate MSE of a candidate against the experiment
//! curves.
//!
//! The objective is fully self-contained: everything needed for evaluation
//! (per-curve temperatures and targets, the species-graph connectivity, the
//! enabled model list, the solver configuration) is captured as plain
//! numeric data at construction. No handles, no callbacks, no references to
//! runtime state: the object can be serialized, shipped to an independent
//! worker process, reconstructed, and will evaluate identically. The JSON
//! round trip is the explicit transport contract; `start_optimization`
//! preflights it before any generation starts.

use serde::{Deserialize, Serialize};

use crate::domain::{ExperimentCurve, ReactionNetwork, ReactionParams, SolverConfig, decode_candidate};
use crate::error::EngineError;
use crate::fit::Objective;
use crate::models::ModelSubset;
use crate::ode::{Deadline, NetworkRates, integrate};

/// Score substituted for the whole evaluation on any integration failure
/// (timeout, solver error, numerical breakdown). Large enough to dominate
/// any physical MSE (conversions live in [0, 1]) and finite so the
/// optimizer can still rank failed regions instead of aborting the run.
pub const PENALTY_MSE: f64 = 1e10;

/// Per-curve data captured at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CurveData {
    beta: f64,
    temperatures: Vec<f64>,
    targets: Vec<f64>,
}

/// Self-contained MSE objective over one or more heating-rate curves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitObjective {
    species_count: usize,
    source: Vec<usize>,
    target: Vec<usize>,
    models: ModelSubset,
    curves: Vec<CurveData>,
    solver: SolverConfig,
}

impl FitObjective {
    /// Capture the network connectivity, curves and solver configuration.
    pub fn new(
        network: &ReactionNetwork,
        curves: &[ExperimentCurve],
        models: ModelSubset,
        solver: SolverConfig,
    ) -> Result<Self, EngineError> {
        if curves.is_empty() {
            return Err(EngineError::Curve("no experiment curves supplied".into()));
        }
        solver.validate()?;
        Ok(Self {
            species_count: network.species_count(),
            source: network.reactions().iter().map(|r| r.source).collect(),
            target: network.reactions().iter().map(|r| r.target).collect(),
            models,
            curves: curves
                .iter()
                .map(|c| CurveData {
                    beta: c.heating_rate(),
                    temperatures: c.temperatures().to_vec(),
                    targets: c.conversions().to_vec(),
                })
                .collect(),
            solver,
        })
    }

    /// Candidate vector length: 4 parameters per reaction.
    pub fn dim(&self) -> usize {
        4 * self.source.len()
    }

    /// Decode a candidate into per-reaction parameters.
    pub fn decode(&self, candidate: &[f64]) -> Vec<ReactionParams> {
        decode_candidate(candidate, &self.models)
    }

    /// Score a candidate: per-curve MSE between simulated and experimental
    /// conversion, summed (not averaged) across curves. Any integration
    /// failure yields [`PENALTY_MSE`].
    pub fn evaluate(&self, candidate: &[f64]) -> f64 {
        let params = self.decode(candidate);
        let rates =
            NetworkRates::from_connectivity(self.species_count, &self.source, &self.target, &params);
        let y0 = rates.initial_state();

        let mut total = 0.0;
        for curve in &self.curves {
            let deadline = Deadline::start(self.solver.timeout_ms);
            let t0 = curve.temperatures[0];
            let t1 = curve.temperatures[curve.temperatures.len() - 1];
            let beta = curve.beta;
            let result = integrate(
                |t, y: &[f64], dydt: &mut [f64]| rates.derivative(t, y, dydt, beta),
                &y0,
                (t0, t1),
                &curve.temperatures,
                &self.solver,
                &deadline,
            );
            let trajectory = match result {
                Ok(trajectory) => trajectory,
                Err(_) => return PENALTY_MSE,
            };

            let mut sse = 0.0;
            for (state, &target) in trajectory.states.iter().zip(curve.targets.iter()) {
                let residual = rates.conversion(state) - target;
                sse += residual * residual;
            }
            if !sse.is_finite() {
                return PENALTY_MSE;
            }
            total += sse / curve.targets.len() as f64;
        }
        total
    }
}

impl Objective for FitObjective {
    fn evaluate(&self, candidate: &[f64]) -> f64 {
        FitObjective::evaluate(self, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Reaction;

    fn single_step_network() -> ReactionNetwork {
        ReactionNetwork::new(
            2,
            vec![Reaction {
                source: 0,
                target: 1,
                model: 3,
                ln_a: 18.0,
                ea: 80_000.0,
                contribution: 1.0,
            }],
        )
        .unwrap()
    }

    fn curve() -> ExperimentCurve {
        let temperatures: Vec<f64> = (0..60).map(|i| 400.0 + 4.0 * i as f64).collect();
        let conversions = vec![0.5; 60];
        ExperimentCurve::new(5.0, temperatures, conversions).unwrap()
    }

    fn objective() -> FitObjective {
        FitObjective::new(
            &single_step_network(),
            &[curve()],
            ModelSubset::new(vec![3]).unwrap(),
            SolverConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn evaluate_is_deterministic() {
        let objective = objective();
        assert_eq!(objective.dim(), 4);
        let candidate = [18.0, 80_000.0, 0.0, 1.0];
        let a = objective.evaluate(&candidate);
        let b = objective.evaluate(&candidate);
        assert!(a.is_finite());
        assert_eq!(a, b);
    }

    #[test]
    fn serialized_copy_evaluates_identically() {
        let objective = objective();
        let json = serde_json::to_string(&objective).unwrap();
        let copy: FitObjective = serde_json::from_str(&json).unwrap();
        assert_eq!(objective, copy);

        let candidate = [17.0, 90_000.0, 0.0, 0.8];
        assert_eq!(objective.evaluate(&candidate), copy.evaluate(&candidate));
    }

    #[test]
    fn integration_breakdown_returns_penalty() {
        let objective = objective();
        // ln_a at the exponent clamp makes the flux overflow; the solver
        // reports a failure and the objective folds it into the penalty.
        let candidate = [700.0, 0.0, 0.0, 1.0];
        assert_eq!(objective.evaluate(&candidate), PENALTY_MSE);
    }

    #[test]
    fn good_parameters_score_better_than_bad() {
        // Targets generated from the true parameters; the true candidate
        // must beat a far-off one.
        let network = single_step_network();
        let models = ModelSubset::new(vec![3]).unwrap();
        let curves = crate::data::generate_curves(
            &network,
            &crate::data::SyntheticConfig {
                betas: vec![5.0],
                t_start: 400.0,
                t_end: 640.0,
                samples_per_curve: 60,
                noise_sigma: 0.0,
                seed: 1,
            },
        )
        .unwrap();
        let objective =
            FitObjective::new(&network, &curves, models, SolverConfig::default()).unwrap();

        let truth = objective.evaluate(&[18.0, 80_000.0, 0.0, 1.0]);
        let off = objective.evaluate(&[14.0, 120_000.0, 0.0, 1.0]);
        assert!(
            truth < off,
            "true parameters should score better: {truth} vs {off}"
        );
        assert!(truth < 1e-3, "true parameters should fit well: {truth}");
    }
}
