//! Step-synchronous evaluation of an ensemble of walkers.
//!
//! The ensemble move itself lives outside this crate. Per step it hands over
//! the proposed positions of every walker, gets back one log posterior per
//! walker and stores the accepted positions in [`Samples`].

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    evaluator::{Evaluator, LogpError},
    settings::McmcSettings,
};

/// Random source of `walker` at `step`. Streams never overlap between
/// walkers or steps of the same seed.
pub fn walker_rng(seed: u64, step: usize, walker: usize) -> ChaCha8Rng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    key[8..16].copy_from_slice(&(step as u64).to_le_bytes());
    let mut rng = ChaCha8Rng::from_seed(key);
    rng.set_stream(walker as u64);
    rng
}

/// Evaluates the log posterior of many walkers in parallel.
///
/// Every rayon task works on its own clone of the evaluator, so map buffers
/// and running sums are never shared between walkers.
#[derive(Debug, Clone)]
pub struct Ensemble {
    evaluator: Evaluator,
    n_walkers: usize,
    seed: u64,
}

impl Ensemble {
    pub fn new(evaluator: Evaluator, settings: &McmcSettings) -> Self {
        Self {
            evaluator,
            n_walkers: settings.n_walkers,
            seed: settings.seed,
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    /// Starting positions drawn from the prior, one row per walker.
    pub fn initial_positions(&self) -> Result<Array2<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let positions = self
            .evaluator
            .model()
            .mcmc_walker_initial_positions(self.evaluator.prior(), self.n_walkers, &mut rng)
            .context("Could not draw initial walker positions")?;
        Ok(positions)
    }

    /// Log posterior of every row of `positions` at step `step`.
    ///
    /// Recoverable failures reject the walker's proposal with `-inf`, any
    /// other failure aborts the whole step.
    pub fn evaluate_step(&self, step: usize, positions: ArrayView2<f64>) -> Result<Vec<f64>> {
        let (n_walkers, n_params) = positions.dim();
        if n_params != self.evaluator.n_params() {
            bail!(
                "Walker positions have {} columns, model `{}` takes {} parameters",
                n_params,
                self.evaluator.model().label(),
                self.evaluator.n_params()
            );
        }

        (0..n_walkers)
            .into_par_iter()
            .map_init(
                || self.evaluator.clone(),
                |evaluator, walker| {
                    let position = positions.row(walker).to_vec();
                    let mut rng = walker_rng(self.seed, step, walker);
                    match evaluator.evaluate(&position, &mut rng) {
                        Ok(value) => Ok(value),
                        Err(err) if err.is_recoverable() => {
                            log::debug!("Walker {} rejected at step {}: {}", walker, step, err);
                            Ok(f64::NEG_INFINITY)
                        }
                        Err(err) => Err(err).with_context(|| {
                            format!("Evaluation of walker {} failed at step {}", walker, step)
                        }),
                    }
                },
            )
            .collect()
    }
}

/// Chain positions and log posteriors, filled one step at a time.
#[derive(Debug, Clone)]
pub struct Samples {
    chain: Array3<f64>,
    ln_prob: Array2<f64>,
    n_recorded: usize,
}

impl Samples {
    pub fn new(n_steps: usize, n_walkers: usize, n_params: usize) -> Self {
        Self {
            chain: Array3::zeros((n_steps, n_walkers, n_params)),
            ln_prob: Array2::from_elem((n_steps, n_walkers), f64::NEG_INFINITY),
            n_recorded: 0,
        }
    }

    /// Storage for a full run of `settings` over the parameters of the
    /// evaluator's model.
    pub fn for_run(settings: &McmcSettings, evaluator: &Evaluator) -> Self {
        Self::new(settings.n_steps, settings.n_walkers, evaluator.n_params())
    }

    /// Stores the positions and log posteriors of the next step.
    pub fn record_step(&mut self, positions: ArrayView2<f64>, ln_prob: &[f64]) -> Result<()> {
        let (n_steps, n_walkers, n_params) = self.chain.dim();
        if self.n_recorded == n_steps {
            bail!("All {} steps have already been recorded", n_steps);
        }
        if positions.dim() != (n_walkers, n_params) || ln_prob.len() != n_walkers {
            bail!(
                "Expected {} walkers with {} parameters, got positions {:?} and {} log posteriors",
                n_walkers,
                n_params,
                positions.dim(),
                ln_prob.len()
            );
        }
        let step = self.n_recorded;
        self.chain
            .index_axis_mut(ndarray::Axis(0), step)
            .assign(&positions);
        self.ln_prob
            .row_mut(step)
            .iter_mut()
            .zip(ln_prob)
            .for_each(|(out, &value)| *out = value);
        self.n_recorded += 1;
        Ok(())
    }

    /// Positions, shape `(n_steps, n_walkers, n_params)`.
    pub fn chain(&self) -> &Array3<f64> {
        &self.chain
    }

    /// Log posteriors, shape `(n_steps, n_walkers)`.
    pub fn ln_prob(&self) -> &Array2<f64> {
        &self.ln_prob
    }

    pub fn n_recorded(&self) -> usize {
        self.n_recorded
    }

    pub fn is_complete(&self) -> bool {
        self.n_recorded == self.chain.dim().0
    }
}
