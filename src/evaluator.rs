//! The log posterior handed to the sampler.
//!
//! An [`Evaluator`] owns everything one evaluation mutates: the grid with its
//! map buffer and the observables with their running sums. Concurrent
//! evaluations therefore need one evaluator each (see [`crate::ensemble`]).

use std::{fmt::Debug, sync::Arc};

use rand::Rng;
use thiserror::Error;

use crate::{
    grid::{Grid, GridError},
    likelihood::{chi_squared, chi_squared_cov, scaled_covariance},
    model::{Model, ModelError},
    observable::{Observable, ObservableError},
    prior::PriorSpec,
    settings::{LikelihoodMode, McmcSettings, ObservableKind, SettingsError},
};

/// Errors from a log density evaluation.
pub trait LogpError: std::error::Error {
    /// Recoverable errors reject the proposal, unrecoverable ones should stop
    /// sampling.
    fn is_recoverable(&self) -> bool;
}

/// A log density as consumed by an external sampler.
pub trait LogDensity {
    type LogpError: Debug + Send + LogpError + 'static;

    fn ln_prob(&mut self, position: &[f64]) -> Result<f64, Self::LogpError>;
    fn dim(&self) -> usize;
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Observable(#[from] ObservableError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("No data was set for observable `{0}`")]
    MissingData(&'static str),
    #[error("Observable `{0}` is not part of this evaluator")]
    NotConfigured(&'static str),
    #[error("`{observable}` data has {found} bins but the model gives {expected}")]
    DataLength {
        observable: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Reference covariance describes {expected} bins but the observables have {found}")]
    CovarianceSize { expected: usize, found: usize },
}

impl LogpError for EvaluationError {
    fn is_recoverable(&self) -> bool {
        match self {
            EvaluationError::Observable(err) => err.is_recoverable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    grid: Grid,
    model: Model,
    observables: Vec<Observable>,
    prior: PriorSpec,
    likelihood: Arc<LikelihoodMode>,
    n_realizations: usize,
    n_patches: f64,
}

impl Evaluator {
    pub fn new(
        grid: Grid,
        model: Model,
        prior: PriorSpec,
        settings: &McmcSettings,
    ) -> Result<Self, EvaluationError> {
        settings.validate()?;
        model.check_prior(&prior)?;
        let observables = settings
            .observables
            .iter()
            .map(|&kind| Observable::new(kind, &grid, settings))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "Evaluator for `{}` with observables [{}], {} realizations, {} likelihood",
            model.label(),
            observables.iter().map(|o| o.label()).collect::<Vec<_>>().join(", "),
            settings.n_realizations,
            settings.likelihood.name()
        );
        Ok(Self {
            grid,
            model,
            observables,
            prior,
            likelihood: Arc::new(settings.likelihood.clone()),
            n_realizations: settings.n_realizations,
            n_patches: settings.n_patches,
        })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn prior(&self) -> &PriorSpec {
        &self.prior
    }

    pub fn observables(&self) -> &[Observable] {
        &self.observables
    }

    pub fn n_params(&self) -> usize {
        self.model.n_params()
    }

    pub fn observable(&self, kind: ObservableKind) -> Option<&Observable> {
        self.observables.iter().find(|o| o.kind() == kind)
    }

    /// Sets the observed data of the observable of `kind`.
    pub fn set_data(&mut self, kind: ObservableKind, data: Vec<f64>) -> Result<(), EvaluationError> {
        let observable = self
            .observables
            .iter_mut()
            .find(|o| o.kind() == kind)
            .ok_or(EvaluationError::NotConfigured(kind.label()))?;
        observable.set_data(data)?;
        Ok(())
    }

    /// Uses the mean of `n_realizations` forward simulations at `params` as
    /// the observed data of every observable.
    pub fn simulate_data<R: Rng + ?Sized>(
        &mut self,
        params: &[f64],
        n_realizations: usize,
        rng: &mut R,
    ) -> Result<(), EvaluationError> {
        let n_realizations = n_realizations.max(1);
        self.run_realizations(params, n_realizations, rng)?;
        for observable in self.observables.iter_mut() {
            let mean = observable.mean().to_vec();
            observable.set_data(mean)?;
        }
        Ok(())
    }

    /// Simulates `n_realizations` maps and leaves the averaged statistics in
    /// the observables.
    fn run_realizations<R: Rng + ?Sized>(
        &mut self,
        params: &[f64],
        n_realizations: usize,
        rng: &mut R,
    ) -> Result<(), EvaluationError> {
        let (sigma_x, sigma_y) = self.grid.beam();
        self.observables.iter_mut().for_each(Observable::reset);
        for realization in 0..n_realizations {
            let signal = self.model.generate_map(params, &self.grid, rng)?;
            let map = self.grid.smooth(&signal, sigma_x, sigma_y) + self.grid.generate_noise_map(rng);
            self.grid.set_map(map)?;
            self.grid.demean_map();
            for observable in self.observables.iter_mut() {
                observable.compute(&self.grid)?;
                observable.add_to_running_sum();
            }
            log::trace!("Finished realization {} of {}", realization + 1, n_realizations);
        }
        for observable in self.observables.iter_mut() {
            observable.finalize_mean(n_realizations);
        }
        Ok(())
    }

    /// Log prior plus log likelihood at `params`.
    ///
    /// Returns `-inf` without simulating anything if the prior vanishes, and
    /// `-inf` if the likelihood is not finite. A degenerate intensity binning
    /// is returned as a recoverable error.
    pub fn evaluate<R: Rng + ?Sized>(
        &mut self,
        params: &[f64],
        rng: &mut R,
    ) -> Result<f64, EvaluationError> {
        self.model.check_params(params)?;
        let ln_prior = self.model.ln_prior(params, &self.prior);
        if !ln_prior.is_finite() {
            log::debug!("Proposal {:?} outside the prior support", params);
            return Ok(f64::NEG_INFINITY);
        }

        self.check_data()?;
        self.run_realizations(params, self.n_realizations, rng)?;

        let ln_likelihood = self.ln_likelihood()?;
        if !ln_likelihood.is_finite() {
            log::debug!("Non-finite likelihood at {:?}", params);
            return Ok(f64::NEG_INFINITY);
        }
        Ok(ln_prior + ln_likelihood)
    }

    fn check_data(&self) -> Result<(), EvaluationError> {
        match self.observables.iter().find(|o| o.data().is_none()) {
            Some(observable) => Err(EvaluationError::MissingData(observable.label())),
            None => Ok(()),
        }
    }

    fn ln_likelihood(&self) -> Result<f64, EvaluationError> {
        for observable in &self.observables {
            let found = observable.data().map_or(0, <[f64]>::len);
            let expected = observable.mean().len();
            if found != expected {
                return Err(EvaluationError::DataLength {
                    observable: observable.label(),
                    expected,
                    found,
                });
            }
        }
        let data = |o: &Observable| o.data().unwrap_or_default().to_vec();

        match self.likelihood.as_ref() {
            LikelihoodMode::ChiSquared => Ok(self
                .observables
                .iter()
                .map(|o| {
                    let variance: Vec<f64> =
                        o.independent_var().iter().map(|v| v / self.n_patches).collect();
                    chi_squared(&data(o), o.mean(), &variance)
                })
                .sum()),
            LikelihoodMode::ChiSquaredCov {
                cov_mat_0,
                ind_var_0,
            } => {
                let observed: Vec<f64> = self.observables.iter().flat_map(data).collect();
                let mean: Vec<f64> = self
                    .observables
                    .iter()
                    .flat_map(|o| o.mean().iter().copied())
                    .collect();
                let ind_var: Vec<f64> = self
                    .observables
                    .iter()
                    .flat_map(|o| o.independent_var().iter().copied())
                    .collect();
                let expected = ind_var_0.len();
                if observed.len() != expected || mean.len() != expected {
                    return Err(EvaluationError::CovarianceSize {
                        expected,
                        found: mean.len(),
                    });
                }
                let cov = scaled_covariance(cov_mat_0, &ind_var, ind_var_0, self.n_patches);
                Ok(chi_squared_cov(&observed, &mean, &cov))
            }
        }
    }

    /// Binds a random source, giving a [`LogDensity`] that turns recoverable
    /// errors into rejected proposals.
    pub fn with_rng<R: Rng>(self, rng: R) -> LnProb<R> {
        LnProb {
            evaluator: self,
            rng,
        }
    }
}

/// An [`Evaluator`] together with the random source for its realizations.
#[derive(Debug, Clone)]
pub struct LnProb<R: Rng> {
    evaluator: Evaluator,
    rng: R,
}

impl<R: Rng> LnProb<R> {
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn into_inner(self) -> (Evaluator, R) {
        (self.evaluator, self.rng)
    }
}

impl<R: Rng> LogDensity for LnProb<R> {
    type LogpError = EvaluationError;

    fn ln_prob(&mut self, position: &[f64]) -> Result<f64, EvaluationError> {
        match self.evaluator.evaluate(position, &mut self.rng) {
            Err(err) if err.is_recoverable() => {
                log::debug!("Rejecting proposal {:?}: {}", position, err);
                Ok(f64::NEG_INFINITY)
            }
            result => result,
        }
    }

    fn dim(&self) -> usize {
        self.evaluator.n_params()
    }
}
