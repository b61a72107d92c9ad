//! Top-level run orchestration.
//!
//! This module is the engine's external surface:
//!
//! - [`optimize`] runs the whole pipeline synchronously
//!   (validate → build objective → preflight transport → evolve)
//! - [`start_optimization`] does the same on a background thread and
//!   returns a [`RunHandle`] for cancellation, progress polling and the
//!   per-generation best-candidate event stream
//!
//! Setup-time failures (bad configuration, a malformed network or curve,
//! an objective that does not survive the serialization round trip) are
//! returned before any generation starts. Per-candidate numerical failures
//! never appear here; they are absorbed into penalty scores inside the
//! objective.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::domain::{
    Bounds, ExperimentCurve, GenerationBest, OptimizerConfig, ReactionNetwork, RunOutcome,
    SolverConfig,
};
use crate::error::EngineError;
use crate::fit::{CancelToken, DeResult, FitObjective, differential_evolution};

/// A running optimization.
///
/// The cancellation flag and the best-so-far snapshot are shared with the
/// driver thread; the terminal result is retrieved with [`RunHandle::join`].
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancelToken,
    best: Arc<Mutex<Option<GenerationBest>>>,
    events: Receiver<GenerationBest>,
    handle: thread::JoinHandle<Result<RunOutcome, EngineError>>,
}

impl RunHandle {
    /// Request cancellation. Guarantees only that no further generation
    /// starts; an in-flight generation finishes its evaluations.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Best candidate so far: `(candidate, mse, generation)`. `None` until
    /// the first generation completes.
    pub fn best(&self) -> Option<(Vec<f64>, f64, usize)> {
        let guard = self.best.lock().ok()?;
        guard
            .as_ref()
            .map(|b| (b.candidate.clone(), b.mse, b.generation))
    }

    /// Per-generation best-candidate notifications. Sends are non-blocking
    /// on the driver side; a slow consumer only buffers, never stalls the
    /// optimizer.
    pub fn events(&self) -> &Receiver<GenerationBest> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to end and return the terminal result.
    pub fn join(self) -> Result<RunOutcome, EngineError> {
        self.handle
            .join()
            .map_err(|_| EngineError::Run("optimizer thread panicked".into()))?
    }
}

/// Validate all inputs, build the objective, and preflight its transport
/// contract.
fn prepare(
    network: &ReactionNetwork,
    curves: &[ExperimentCurve],
    bounds: &Bounds,
    solver_config: SolverConfig,
    optimizer_config: &OptimizerConfig,
) -> Result<(FitObjective, Vec<f64>, Vec<f64>), EngineError> {
    solver_config.validate()?;
    optimizer_config.validate()?;
    bounds.validate(network)?;

    let objective = FitObjective::new(
        network,
        curves,
        optimizer_config.models.clone(),
        solver_config,
    )?;

    // Transport preflight: the objective must reconstruct identically from
    // its serialized form, or workers in another process would evaluate a
    // different function. A defect here is a configuration problem, so it
    // is fatal now rather than a mystery later.
    let json = serde_json::to_string(&objective)
        .map_err(|e| EngineError::Serialization(e.to_string()))?;
    let copy: FitObjective =
        serde_json::from_str(&json).map_err(|e| EngineError::Serialization(e.to_string()))?;
    if copy != objective {
        return Err(EngineError::Serialization(
            "objective did not survive a serialization round trip".into(),
        ));
    }

    let (lower, upper) = bounds.to_arrays(&optimizer_config.models);
    Ok((objective, lower, upper))
}

fn run_driver<M>(
    objective: &FitObjective,
    lower: &[f64],
    upper: &[f64],
    config: &OptimizerConfig,
    cancel: &CancelToken,
    monitor: M,
) -> Result<DeResult, EngineError>
where
    M: FnMut(&crate::domain::GenerationReport) + Send,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.resolve())
        .build()
        .map_err(|e| EngineError::Run(format!("failed to build worker pool: {e}")))?;
    pool.install(|| differential_evolution(objective, lower, upper, config, cancel, monitor))
}

fn outcome(objective: &FitObjective, result: DeResult) -> RunOutcome {
    RunOutcome {
        params: objective.decode(&result.best),
        best: result.best,
        mse: result.best_mse,
        generations: result.generations,
        evaluations: result.evaluations,
        reason: result.reason,
    }
}

/// Run an optimization synchronously on a dedicated worker pool.
///
/// `monitor` receives a borrowed snapshot after every generation; pass
/// `|_| {}` when no progress reporting is needed.
pub fn optimize<M>(
    network: &ReactionNetwork,
    curves: &[ExperimentCurve],
    bounds: &Bounds,
    solver_config: SolverConfig,
    optimizer_config: &OptimizerConfig,
    cancel: &CancelToken,
    monitor: M,
) -> Result<RunOutcome, EngineError>
where
    M: FnMut(&crate::domain::GenerationReport) + Send,
{
    let (objective, lower, upper) = prepare(network, curves, bounds, solver_config, optimizer_config)?;
    let result = run_driver(&objective, &lower, &upper, optimizer_config, cancel, monitor)?;
    Ok(outcome(&objective, result))
}

/// Start an optimization on a background thread.
///
/// All validation and the serialization preflight happen synchronously, so
/// a returned handle means the run is actually evolving.
pub fn start_optimization(
    network: &ReactionNetwork,
    curves: &[ExperimentCurve],
    bounds: &Bounds,
    solver_config: SolverConfig,
    optimizer_config: OptimizerConfig,
) -> Result<RunHandle, EngineError> {
    let (objective, lower, upper) = prepare(network, curves, bounds, solver_config, &optimizer_config)?;

    let cancel = CancelToken::new();
    let best: Arc<Mutex<Option<GenerationBest>>> = Arc::new(Mutex::new(None));
    let (tx, rx) = mpsc::channel();

    let driver_cancel = cancel.clone();
    let driver_best = Arc::clone(&best);
    let handle = thread::spawn(move || -> Result<RunOutcome, EngineError> {
        let result = run_driver(
            &objective,
            &lower,
            &upper,
            &optimizer_config,
            &driver_cancel,
            |report| {
                let snapshot = GenerationBest {
                    generation: report.generation,
                    candidate: report.best.to_vec(),
                    mse: report.best_mse,
                };
                if let Ok(mut guard) = driver_best.lock() {
                    *guard = Some(snapshot.clone());
                }
                // A dropped receiver is fine; progress reporting is
                // best-effort.
                let _ = tx.send(snapshot);
            },
        )?;
        Ok(outcome(&objective, result))
    });

    Ok(RunHandle {
        cancel,
        best,
        events: rx,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SyntheticConfig, generate_curves};
    use crate::domain::{DeStrategy, Reaction, ReactionBounds, TerminationReason, WorkerCount};
    use crate::models::ModelSubset;

    // Ground truth chosen so the two steps overlap in temperature; the
    // measured signal (final-product formation) then constrains both
    // reactions' Arrhenius parameters.
    const LN_A: [f64; 2] = [18.0, 19.0];
    const EA: [f64; 2] = [80_000.0, 90_000.0];

    /// A → B → C, both steps first order (model F1 = index 3).
    fn chain() -> ReactionNetwork {
        ReactionNetwork::new(
            3,
            vec![
                Reaction {
                    source: 0,
                    target: 1,
                    model: 3,
                    ln_a: LN_A[0],
                    ea: EA[0],
                    contribution: 1.0,
                },
                Reaction {
                    source: 1,
                    target: 2,
                    model: 3,
                    ln_a: LN_A[1],
                    ea: EA[1],
                    contribution: 1.0,
                },
            ],
        )
        .unwrap()
    }

    fn chain_curves() -> Vec<ExperimentCurve> {
        generate_curves(
            &chain(),
            &SyntheticConfig {
                betas: vec![3.0, 5.0, 10.0],
                t_start: 360.0,
                t_end: 800.0,
                samples_per_curve: 120,
                noise_sigma: 0.002,
                seed: 29,
            },
        )
        .unwrap()
    }

    fn chain_bounds() -> Bounds {
        // Model index and contribution are pinned; the search runs over the
        // Arrhenius parameters of both reactions.
        Bounds::uniform(
            2,
            ReactionBounds {
                ln_a: (12.0, 26.0),
                ea: (50_000.0, 180_000.0),
                contribution: (1.0, 1.0),
            },
        )
    }

    fn chain_optimizer(seed: u64) -> OptimizerConfig {
        OptimizerConfig {
            strategy: DeStrategy::Best1Bin,
            population_size: 40,
            max_generations: 300,
            mutation: 0.7,
            recombination: 0.9,
            tol: 0.0,
            seed,
            workers: WorkerCount::All,
            models: ModelSubset::new(vec![3]).unwrap(),
        }
    }

    #[test]
    fn end_to_end_recovers_chain_parameters() {
        let network = chain();
        let curves = chain_curves();
        let outcome = optimize(
            &network,
            &curves,
            &chain_bounds(),
            SolverConfig::default(),
            &chain_optimizer(101),
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();

        assert!(outcome.mse < 1e-3, "final MSE {} too high", outcome.mse);
        for (i, params) in outcome.params.iter().enumerate() {
            let rel = (params.ea - EA[i]).abs() / EA[i];
            assert!(
                rel < 0.10,
                "reaction {i}: Ea {} deviates {:.1}% from {}",
                params.ea,
                rel * 100.0,
                EA[i]
            );
            assert_eq!(params.model, 3);
        }
    }

    #[test]
    fn background_run_reports_progress_and_cancels() {
        let network = chain();
        let curves = chain_curves();
        let mut config = chain_optimizer(7);
        // A budget far beyond what can finish before the cancel below.
        config.max_generations = 100_000;

        let handle = start_optimization(
            &network,
            &curves,
            &chain_bounds(),
            SolverConfig::default(),
            config,
        )
        .unwrap();

        // Wait for the first generation, then cancel.
        let first = handle.events().recv().expect("first generation event");
        assert_eq!(first.generation, 1);
        handle.cancel();

        let (candidate, mse, generation) = handle.best().expect("best after first generation");
        assert_eq!(candidate.len(), 8);
        assert!(mse.is_finite());
        assert!(generation >= 1);

        let outcome = handle.join().unwrap();
        assert_eq!(outcome.reason, TerminationReason::Cancelled);
        assert!(outcome.generations >= 1);
        assert!(outcome.generations < 100_000);
    }

    #[test]
    fn mismatched_bounds_fail_before_spawn() {
        let network = chain();
        let curves = chain_curves();
        let bounds = Bounds::uniform(
            1, // network has two reactions
            ReactionBounds {
                ln_a: (12.0, 26.0),
                ea: (50_000.0, 180_000.0),
                contribution: (1.0, 1.0),
            },
        );
        let err = start_optimization(
            &network,
            &curves,
            &bounds,
            SolverConfig::default(),
            chain_optimizer(1),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)), "got {err:?}");
    }

    #[test]
    fn empty_curve_set_is_rejected() {
        let err = optimize(
            &chain(),
            &[],
            &chain_bounds(),
            SolverConfig::default(),
            &chain_optimizer(1),
            &CancelToken::new(),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Curve(_)), "got {err:?}");
    }
}
