//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they
//! can be:
//!
//! - used in-memory during fitting
//! - shipped across a process boundary together with the fit objective
//! - exported by the surrounding application for later comparisons
//!
//! `ReactionNetwork`, `ExperimentCurve` and the configuration structs are
//! built once per run and immutable thereafter; candidate vectors are
//! transient per generation member.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{MODEL_COUNT, ModelSubset};

/// One edge of the species graph: `source → target` under a kinetic model
/// with Arrhenius parameters.
///
/// Immutable for an evaluated candidate; the optimizer produces new
/// parameter sets rather than mutating reactions in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub source: usize,
    pub target: usize,
    /// Index into the kinetic model catalog.
    pub model: usize,
    /// Natural log of the Arrhenius pre-exponential factor.
    pub ln_a: f64,
    /// Activation energy in J/mol.
    pub ea: f64,
    /// Contribution weight of this reaction's flux, in [0, 1].
    pub contribution: f64,
}

/// An ordered reaction list plus the species count.
///
/// Invariant (checked by [`ReactionNetwork::new`]): every species is
/// reachable from the root species (index 0) along reaction edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionNetwork {
    species_count: usize,
    reactions: Vec<Reaction>,
}

impl ReactionNetwork {
    /// Build and validate a reaction network.
    pub fn new(species_count: usize, reactions: Vec<Reaction>) -> Result<Self, EngineError> {
        if species_count < 2 {
            return Err(EngineError::Network(
                "a network needs at least two species".into(),
            ));
        }
        if reactions.is_empty() {
            return Err(EngineError::Network("reaction list is empty".into()));
        }
        for (i, r) in reactions.iter().enumerate() {
            if r.source >= species_count || r.target >= species_count {
                return Err(EngineError::Network(format!(
                    "reaction {i}: species index out of range (species_count={species_count})"
                )));
            }
            if r.source == r.target {
                return Err(EngineError::Network(format!(
                    "reaction {i}: source and target are the same species"
                )));
            }
            if r.model >= MODEL_COUNT {
                return Err(EngineError::Network(format!(
                    "reaction {i}: model index {} out of range (0..{MODEL_COUNT})",
                    r.model
                )));
            }
            if !(r.ln_a.is_finite() && r.ea.is_finite()) {
                return Err(EngineError::Network(format!(
                    "reaction {i}: non-finite Arrhenius parameters"
                )));
            }
            if !(r.contribution.is_finite() && (0.0..=1.0).contains(&r.contribution)) {
                return Err(EngineError::Network(format!(
                    "reaction {i}: contribution {} outside [0, 1]",
                    r.contribution
                )));
            }
        }

        // Every species must be reachable from the root along directed edges.
        let mut reachable = vec![false; species_count];
        reachable[0] = true;
        let mut frontier = vec![0usize];
        while let Some(s) = frontier.pop() {
            for r in &reactions {
                if r.source == s && !reachable[r.target] {
                    reachable[r.target] = true;
                    frontier.push(r.target);
                }
            }
        }
        if let Some(orphan) = reachable.iter().position(|&seen| !seen) {
            return Err(EngineError::Network(format!(
                "species {orphan} is not reachable from the root species"
            )));
        }

        Ok(Self {
            species_count,
            reactions,
        })
    }

    pub fn species_count(&self) -> usize {
        self.species_count
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    /// Species with no outgoing reaction. The simulated conversion signal is
    /// the sum of their states.
    pub fn terminal_species(&self) -> Vec<usize> {
        (0..self.species_count)
            .filter(|&s| self.reactions.iter().all(|r| r.source != s))
            .collect()
    }
}

/// One experimental conversion curve recorded at a fixed heating rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentCurve {
    heating_rate: f64,
    temperatures: Vec<f64>,
    conversions: Vec<f64>,
}

impl ExperimentCurve {
    /// Build and validate an experiment curve.
    ///
    /// Temperatures must be strictly increasing and finite; the conversion
    /// series must have the same length; at least two samples are required.
    pub fn new(
        heating_rate: f64,
        temperatures: Vec<f64>,
        conversions: Vec<f64>,
    ) -> Result<Self, EngineError> {
        if !(heating_rate.is_finite() && heating_rate > 0.0) {
            return Err(EngineError::Curve(format!(
                "heating rate must be positive, got {heating_rate}"
            )));
        }
        if temperatures.len() < 2 {
            return Err(EngineError::Curve("need at least two samples".into()));
        }
        if temperatures.len() != conversions.len() {
            return Err(EngineError::Curve(format!(
                "temperature/conversion length mismatch: {} vs {}",
                temperatures.len(),
                conversions.len()
            )));
        }
        if temperatures.iter().any(|t| !t.is_finite()) || conversions.iter().any(|c| !c.is_finite())
        {
            return Err(EngineError::Curve("non-finite sample".into()));
        }
        if temperatures.windows(2).any(|w| w[1] <= w[0]) {
            return Err(EngineError::Curve(
                "temperatures must be strictly increasing".into(),
            ));
        }
        Ok(Self {
            heating_rate,
            temperatures,
            conversions,
        })
    }

    pub fn heating_rate(&self) -> f64 {
        self.heating_rate
    }

    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }

    pub fn conversions(&self) -> &[f64] {
        &self.conversions
    }
}

/// Integration method selection.
///
/// `Auto` runs the adaptive explicit method and falls back to the
/// linearized-implicit branch when the explicit method thrashes; the forced
/// variants exist for calibration and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverMethod {
    #[default]
    Auto,
    Explicit,
    Stiff,
}

/// Solver configuration, immutable for a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub method: SolverMethod,
    /// Relative tolerance. The loose default trades ≤2% fit-error deviation
    /// for roughly an order of magnitude of speed during exploration;
    /// tighten for refinement.
    pub rtol: f64,
    /// Absolute tolerance.
    pub atol: f64,
    /// Per-evaluation wall-clock budget in milliseconds; 0 disables it.
    pub timeout_ms: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: SolverMethod::Auto,
            rtol: 1e-2,
            atol: 1e-4,
            timeout_ms: 200,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.rtol.is_finite() && self.rtol > 0.0) {
            return Err(EngineError::Config(format!(
                "rtol must be positive, got {}",
                self.rtol
            )));
        }
        if !(self.atol.is_finite() && self.atol > 0.0) {
            return Err(EngineError::Config(format!(
                "atol must be positive, got {}",
                self.atol
            )));
        }
        Ok(())
    }
}

/// Differential evolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeStrategy {
    /// Mutate around the current best member.
    #[default]
    Best1Bin,
    /// Mutate around a random member.
    Rand1Bin,
}

/// Worker pool sizing for parallel objective evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerCount {
    /// Use all available cores.
    #[default]
    All,
    /// Use a fixed number of workers.
    Fixed(usize),
}

impl WorkerCount {
    /// Resolve to a concrete thread count (0 lets the pool pick the default,
    /// which is all available cores).
    pub fn resolve(self) -> usize {
        match self {
            WorkerCount::All => 0,
            WorkerCount::Fixed(n) => n.max(1),
        }
    }
}

/// Optimizer configuration, immutable for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub strategy: DeStrategy,
    /// Population size; at least 5 so the mutation operators can always draw
    /// distinct members.
    pub population_size: usize,
    pub max_generations: usize,
    /// Mutation factor F, in (0, 2].
    pub mutation: f64,
    /// Recombination (crossover) probability CR, in [0, 1].
    pub recombination: f64,
    /// Convergence tolerance: converged when
    /// `std(fitness) <= tol · |mean(fitness)|`.
    pub tol: f64,
    pub seed: u64,
    pub workers: WorkerCount,
    /// Enabled kinetic models; the candidate model dimension ranges over
    /// positions in this subset.
    pub models: ModelSubset,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: DeStrategy::Best1Bin,
            population_size: 50,
            max_generations: 300,
            mutation: 0.7,
            recombination: 0.9,
            tol: 0.01,
            seed: 0,
            workers: WorkerCount::All,
            models: ModelSubset::all(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.population_size < 5 {
            return Err(EngineError::Config(format!(
                "population size must be at least 5, got {}",
                self.population_size
            )));
        }
        if self.max_generations == 0 {
            return Err(EngineError::Config("max_generations must be >= 1".into()));
        }
        if !(self.mutation.is_finite() && self.mutation > 0.0 && self.mutation <= 2.0) {
            return Err(EngineError::Config(format!(
                "mutation factor must be in (0, 2], got {}",
                self.mutation
            )));
        }
        if !(self.recombination.is_finite() && (0.0..=1.0).contains(&self.recombination)) {
            return Err(EngineError::Config(format!(
                "recombination must be in [0, 1], got {}",
                self.recombination
            )));
        }
        if !(self.tol.is_finite() && self.tol >= 0.0) {
            return Err(EngineError::Config(format!(
                "tol must be non-negative, got {}",
                self.tol
            )));
        }
        Ok(())
    }
}

/// Search bounds for one reaction's parameters.
///
/// Degenerate bounds (`min == max`) pin a parameter. The model dimension is
/// not bounded here; it ranges over the enabled-subset positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReactionBounds {
    pub ln_a: (f64, f64),
    pub ea: (f64, f64),
    pub contribution: (f64, f64),
}

/// Per-reaction search bounds for the whole network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub per_reaction: Vec<ReactionBounds>,
}

impl Bounds {
    /// Same bounds for every reaction.
    pub fn uniform(n_reactions: usize, bounds: ReactionBounds) -> Self {
        Self {
            per_reaction: vec![bounds; n_reactions],
        }
    }

    pub fn validate(&self, network: &ReactionNetwork) -> Result<(), EngineError> {
        if self.per_reaction.len() != network.reactions().len() {
            return Err(EngineError::Config(format!(
                "bounds cover {} reactions but the network has {}",
                self.per_reaction.len(),
                network.reactions().len()
            )));
        }
        for (i, b) in self.per_reaction.iter().enumerate() {
            for (name, (lo, hi)) in [("ln_a", b.ln_a), ("ea", b.ea), ("contribution", b.contribution)]
            {
                if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                    return Err(EngineError::Config(format!(
                        "reaction {i}: invalid {name} bounds ({lo}, {hi})"
                    )));
                }
            }
            if b.ea.0 < 0.0 {
                return Err(EngineError::Config(format!(
                    "reaction {i}: activation energy lower bound must be non-negative"
                )));
            }
            if b.contribution.0 < 0.0 || b.contribution.1 > 1.0 {
                return Err(EngineError::Config(format!(
                    "reaction {i}: contribution bounds must lie in [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Flatten into lower/upper arrays matching the candidate layout
    /// `[ln_a, ea, model_pos, contribution]` per reaction.
    pub fn to_arrays(&self, models: &ModelSubset) -> (Vec<f64>, Vec<f64>) {
        let model_hi = (models.len() - 1) as f64;
        let mut lower = Vec::with_capacity(4 * self.per_reaction.len());
        let mut upper = Vec::with_capacity(4 * self.per_reaction.len());
        for b in &self.per_reaction {
            lower.extend_from_slice(&[b.ln_a.0, b.ea.0, 0.0, b.contribution.0]);
            upper.extend_from_slice(&[b.ln_a.1, b.ea.1, model_hi, b.contribution.1]);
        }
        (lower, upper)
    }
}

/// Decoded per-reaction parameters of one candidate vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReactionParams {
    pub ln_a: f64,
    pub ea: f64,
    pub model: usize,
    pub contribution: f64,
}

/// Decode a flat candidate vector into per-reaction parameters.
///
/// The continuous model field is rounded to the nearest enabled-subset
/// position and clamped (no wraparound); the contribution is clipped to
/// [0, 1].
///
/// # Panics
/// Panics if the candidate length is not a multiple of 4. The optimizer
/// always produces vectors sized from the bounds arrays.
pub fn decode_candidate(candidate: &[f64], models: &ModelSubset) -> Vec<ReactionParams> {
    assert!(
        candidate.len() % 4 == 0,
        "candidate length {} is not a multiple of 4",
        candidate.len()
    );
    candidate
        .chunks_exact(4)
        .map(|c| ReactionParams {
            ln_a: c[0],
            ea: c[1],
            model: models.nearest(c[2]),
            contribution: c[3].clamp(0.0, 1.0),
        })
        .collect()
}

/// Why an optimization run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    /// Population fitness spread fell below the tolerance.
    Converged,
    /// Generation budget exhausted.
    MaxGenerations,
    /// The shared cancellation flag was observed at a generation boundary.
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::Converged => "converged",
            TerminationReason::MaxGenerations => "max generations",
            TerminationReason::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-generation snapshot handed to the monitoring callback.
///
/// Borrows the driver's population; the callback must not block the
/// optimizer loop, so anything long-running should copy what it needs and
/// return.
#[derive(Debug)]
pub struct GenerationReport<'a> {
    /// 1-based generation number.
    pub generation: usize,
    pub best_index: usize,
    pub best_mse: f64,
    pub best: &'a [f64],
    pub population: &'a [Vec<f64>],
    pub fitness: &'a [f64],
}

/// Owned best-candidate notification published after each generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationBest {
    pub generation: usize,
    pub candidate: Vec<f64>,
    pub mse: f64,
}

/// Terminal result of an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Best raw candidate vector.
    pub best: Vec<f64>,
    /// The same candidate decoded into per-reaction parameters.
    pub params: Vec<ReactionParams>,
    pub mse: f64,
    /// Evolved generations completed (0 if only the initial population was
    /// evaluated).
    pub generations: usize,
    pub evaluations: usize,
    pub reason: TerminationReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(source: usize, target: usize) -> Reaction {
        Reaction {
            source,
            target,
            model: 3,
            ln_a: 18.0,
            ea: 80_000.0,
            contribution: 1.0,
        }
    }

    #[test]
    fn network_accepts_chain() {
        let net = ReactionNetwork::new(3, vec![reaction(0, 1), reaction(1, 2)]).unwrap();
        assert_eq!(net.terminal_species(), vec![2]);
    }

    #[test]
    fn network_rejects_unreachable_species() {
        let err = ReactionNetwork::new(3, vec![reaction(0, 1)]).unwrap_err();
        assert!(matches!(err, EngineError::Network(_)), "got {err:?}");
    }

    #[test]
    fn network_rejects_self_loop() {
        assert!(ReactionNetwork::new(2, vec![reaction(0, 0)]).is_err());
    }

    #[test]
    fn branched_network_has_two_terminals() {
        let net = ReactionNetwork::new(3, vec![reaction(0, 1), reaction(0, 2)]).unwrap();
        assert_eq!(net.terminal_species(), vec![1, 2]);
    }

    #[test]
    fn curve_rejects_non_monotonic_temperatures() {
        let err = ExperimentCurve::new(5.0, vec![300.0, 300.0, 310.0], vec![0.0, 0.1, 0.2]);
        assert!(err.is_err());
    }

    #[test]
    fn curve_rejects_length_mismatch() {
        assert!(ExperimentCurve::new(5.0, vec![300.0, 310.0], vec![0.0]).is_err());
    }

    #[test]
    fn decode_rounds_model_and_clips_contribution() {
        let models = ModelSubset::new(vec![3, 10]).unwrap();
        let params = decode_candidate(&[18.0, 80e3, 0.7, 1.4], &models);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].model, 10);
        assert!((params[0].contribution - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bounds_arrays_follow_candidate_layout() {
        let models = ModelSubset::new(vec![3, 10, 27]).unwrap();
        let bounds = Bounds::uniform(
            2,
            ReactionBounds {
                ln_a: (10.0, 30.0),
                ea: (50e3, 200e3),
                contribution: (0.2, 1.0),
            },
        );
        let (lo, hi) = bounds.to_arrays(&models);
        assert_eq!(lo.len(), 8);
        assert_eq!(hi[2], 2.0);
        assert_eq!(lo[3], 0.2);
        assert_eq!(hi[4], 30.0);
    }

    #[test]
    fn optimizer_config_default_is_valid() {
        OptimizerConfig::default().validate().unwrap();
        SolverConfig::default().validate().unwrap();
    }

    #[test]
    fn optimizer_config_rejects_bad_ranges() {
        let mut config = OptimizerConfig::default();
        config.population_size = 3;
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::default();
        config.mutation = 2.5;
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::default();
        config.recombination = -0.1;
        assert!(config.validate().is_err());
    }
}
