//! Differential evolution with deferred population updates.
//!
//! Generation flow: build every trial vector from the *frozen* parent
//! population, score all trials in parallel, then apply replacements in one
//! pass. The deferred policy is what makes parallel evaluation correct: no
//! trial can observe a mid-generation replacement, so a seeded run produces
//! the same generation sequence whether it is evaluated on one worker or
//! sixteen.
//!
//! All randomness is drawn sequentially on the driver thread from a seeded
//! RNG; the parallel region is a pure map over trial vectors. Cancellation
//! is a shared flag observed at generation boundaries only; in-flight
//! evaluations are never interrupted, the engine merely guarantees that no
//! further generation starts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::domain::{DeStrategy, GenerationReport, OptimizerConfig, TerminationReason};
use crate::error::EngineError;
use crate::fit::Objective;

/// Shared cancellation flag.
///
/// Owned by the driver's caller, polled by the driver between generations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a differential evolution run.
#[derive(Debug, Clone)]
pub struct DeResult {
    pub best: Vec<f64>,
    pub best_mse: f64,
    /// Evolved generations completed.
    pub generations: usize,
    pub evaluations: usize,
    pub reason: TerminationReason,
}

/// Run differential evolution over `objective` within `[lower, upper]`.
///
/// The monitor callback runs after every generation with a borrowed
/// snapshot of the population; it must not block the loop.
pub fn differential_evolution<O, M>(
    objective: &O,
    lower: &[f64],
    upper: &[f64],
    config: &OptimizerConfig,
    cancel: &CancelToken,
    mut monitor: M,
) -> Result<DeResult, EngineError>
where
    O: Objective,
    M: FnMut(&GenerationReport),
{
    config.validate()?;
    validate_bounds(lower, upper)?;

    let np = config.population_size;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut population = latin_hypercube(&mut rng, lower, upper, np);
    let mut fitness: Vec<f64> = population
        .par_iter()
        .map(|x| objective.evaluate(x))
        .collect();
    let mut evaluations = np;
    let mut best_index = argmin(&fitness);

    let mut generations = 0;
    let mut reason = TerminationReason::MaxGenerations;

    for generation in 1..=config.max_generations {
        // Cancellation is observed here and only here: between generations.
        if cancel.is_cancelled() {
            reason = TerminationReason::Cancelled;
            break;
        }

        // All trials are derived from the frozen parent population.
        let trials: Vec<Vec<f64>> = (0..np)
            .map(|i| {
                make_trial(
                    &mut rng,
                    &population,
                    i,
                    best_index,
                    lower,
                    upper,
                    config.strategy,
                    config.mutation,
                    config.recombination,
                )
            })
            .collect();

        let trial_fitness: Vec<f64> = trials.par_iter().map(|x| objective.evaluate(x)).collect();
        evaluations += np;

        // Deferred update: replacements applied only after the whole
        // generation is scored.
        for (i, (trial, score)) in trials.into_iter().zip(trial_fitness).enumerate() {
            if score <= fitness[i] {
                population[i] = trial;
                fitness[i] = score;
            }
        }
        best_index = argmin(&fitness);
        generations = generation;

        monitor(&GenerationReport {
            generation,
            best_index,
            best_mse: fitness[best_index],
            best: &population[best_index],
            population: &population,
            fitness: &fitness,
        });

        if converged(&fitness, config.tol) {
            reason = TerminationReason::Converged;
            break;
        }
    }

    Ok(DeResult {
        best: population[best_index].clone(),
        best_mse: fitness[best_index],
        generations,
        evaluations,
        reason,
    })
}

fn validate_bounds(lower: &[f64], upper: &[f64]) -> Result<(), EngineError> {
    if lower.is_empty() || lower.len() != upper.len() {
        return Err(EngineError::Config(format!(
            "bounds arrays must be non-empty and equal length, got {} and {}",
            lower.len(),
            upper.len()
        )));
    }
    for (d, (&lo, &hi)) in lower.iter().zip(upper.iter()).enumerate() {
        if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
            return Err(EngineError::Config(format!(
                "dimension {d}: invalid bounds ({lo}, {hi})"
            )));
        }
    }
    Ok(())
}

/// Seeded Latin hypercube initialization: each dimension is stratified into
/// `np` bins and the bins are shuffled independently per dimension.
fn latin_hypercube(rng: &mut StdRng, lower: &[f64], upper: &[f64], np: usize) -> Vec<Vec<f64>> {
    let dim = lower.len();
    let mut population = vec![vec![0.0; dim]; np];
    let mut strata: Vec<usize> = (0..np).collect();
    for d in 0..dim {
        strata.shuffle(rng);
        for (i, member) in population.iter_mut().enumerate() {
            let u: f64 = rng.r#gen();
            let frac = (strata[i] as f64 + u) / np as f64;
            member[d] = lower[d] + frac * (upper[d] - lower[d]);
        }
    }
    population
}

fn make_trial(
    rng: &mut StdRng,
    population: &[Vec<f64>],
    i: usize,
    best_index: usize,
    lower: &[f64],
    upper: &[f64],
    strategy: DeStrategy,
    mutation: f64,
    recombination: f64,
) -> Vec<f64> {
    let np = population.len();
    let dim = lower.len();

    let (base_index, a_index, b_index) = match strategy {
        DeStrategy::Best1Bin => {
            let [a, b] = sample_distinct::<2>(rng, np, i);
            (best_index, a, b)
        }
        DeStrategy::Rand1Bin => {
            let [a, b, base] = sample_distinct::<3>(rng, np, i);
            (base, a, b)
        }
    };
    let (base, a, b) = (
        &population[base_index],
        &population[a_index],
        &population[b_index],
    );
    let parent = &population[i];

    // Binomial crossover with one guaranteed mutant dimension.
    let forced = rng.gen_range(0..dim);
    let mut trial = Vec::with_capacity(dim);
    for d in 0..dim {
        let take_mutant = rng.r#gen::<f64>() < recombination || d == forced;
        let value = if take_mutant {
            base[d] + mutation * (a[d] - b[d])
        } else {
            parent[d]
        };
        trial.push(value.clamp(lower[d], upper[d]));
    }
    trial
}

/// Draw `K` distinct population indices, all different from `exclude`.
fn sample_distinct<const K: usize>(rng: &mut StdRng, np: usize, exclude: usize) -> [usize; K] {
    let mut out = [0usize; K];
    let mut count = 0;
    while count < K {
        let j = rng.gen_range(0..np);
        if j != exclude && !out[..count].contains(&j) {
            out[count] = j;
            count += 1;
        }
    }
    out
}

fn argmin(fitness: &[f64]) -> usize {
    let mut best = 0;
    for (i, &f) in fitness.iter().enumerate().skip(1) {
        if f < fitness[best] {
            best = i;
        }
    }
    best
}

/// Converged when the population fitness spread collapses:
/// `std(fitness) <= tol · |mean(fitness)|`.
fn converged(fitness: &[f64], tol: f64) -> bool {
    let n = fitness.len() as f64;
    let mean = fitness.iter().sum::<f64>() / n;
    if !mean.is_finite() {
        return false;
    }
    let var = fitness.iter().map(|f| (f - mean) * (f - mean)).sum::<f64>() / n;
    var.sqrt() <= tol * mean.abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelSubset;

    struct Sphere;

    impl Objective for Sphere {
        fn evaluate(&self, candidate: &[f64]) -> f64 {
            candidate.iter().map(|x| x * x).sum()
        }
    }

    fn config(seed: u64) -> OptimizerConfig {
        OptimizerConfig {
            population_size: 20,
            max_generations: 150,
            tol: 0.0,
            seed,
            models: ModelSubset::new(vec![3]).unwrap(),
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn minimizes_sphere() {
        let lower = vec![-5.0; 4];
        let upper = vec![5.0; 4];
        let result = differential_evolution(
            &Sphere,
            &lower,
            &upper,
            &config(7),
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        assert!(result.best_mse < 1e-2, "best_mse={}", result.best_mse);
        assert_eq!(result.reason, TerminationReason::MaxGenerations);
        assert_eq!(result.evaluations, 20 * 151);
    }

    #[test]
    fn rand1bin_also_minimizes() {
        let mut config = config(11);
        config.strategy = DeStrategy::Rand1Bin;
        let lower = vec![-5.0; 3];
        let upper = vec![5.0; 3];
        let result =
            differential_evolution(&Sphere, &lower, &upper, &config, &CancelToken::new(), |_| {})
                .unwrap();
        assert!(result.best_mse < 1e-1, "best_mse={}", result.best_mse);
    }

    #[test]
    fn seeded_run_is_identical_across_worker_counts() {
        let lower = vec![-3.0; 5];
        let upper = vec![3.0; 5];

        let run_with = |threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap();
            let mut history = Vec::new();
            let result = pool.install(|| {
                differential_evolution(
                    &Sphere,
                    &lower,
                    &upper,
                    &config(42),
                    &CancelToken::new(),
                    |report| history.push((report.generation, report.best.to_vec(), report.best_mse)),
                )
            })
            .unwrap();
            (history, result.best, result.best_mse)
        };

        let (history_serial, best_serial, mse_serial) = run_with(1);
        let (history_parallel, best_parallel, mse_parallel) = run_with(4);
        assert_eq!(history_serial, history_parallel);
        assert_eq!(best_serial, best_parallel);
        assert_eq!(mse_serial, mse_parallel);
    }

    #[test]
    fn cancel_between_generations_stops_the_run() {
        let lower = vec![-5.0; 4];
        let upper = vec![5.0; 4];
        let cancel = CancelToken::new();
        let cancel_from_monitor = cancel.clone();
        let mut last_seen = 0;
        let result = differential_evolution(
            &Sphere,
            &lower,
            &upper,
            &config(3),
            &cancel,
            |report| {
                last_seen = report.generation;
                if report.generation == 2 {
                    cancel_from_monitor.cancel();
                }
            },
        )
        .unwrap();
        assert_eq!(result.reason, TerminationReason::Cancelled);
        assert_eq!(result.generations, 2, "no generation past the cancel point");
        assert_eq!(last_seen, 2);
    }

    #[test]
    fn pinned_dimension_stays_pinned() {
        let lower = vec![-5.0, 1.25, -5.0];
        let upper = vec![5.0, 1.25, 5.0];
        let result = differential_evolution(
            &Sphere,
            &lower,
            &upper,
            &config(9),
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(result.best[1], 1.25);
    }

    #[test]
    fn uniform_fitness_converges_immediately() {
        struct Flat;
        impl Objective for Flat {
            fn evaluate(&self, _candidate: &[f64]) -> f64 {
                1.0
            }
        }
        let mut config = config(5);
        config.tol = 0.01;
        let result = differential_evolution(
            &Flat,
            &[0.0, 0.0],
            &[1.0, 1.0],
            &config,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(result.reason, TerminationReason::Converged);
        assert_eq!(result.generations, 1);
    }
}
