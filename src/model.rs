//! Astrophysical models that turn a parameter vector into a synthetic map.
//!
//! Every family is a variant of [`Model`]. All variants share the same
//! capabilities: draw a map for a parameter vector, evaluate the log prior
//! without drawing anything, and propose starting positions for walkers.

use std::sync::Arc;

use ndarray::{Array2, Array3};
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use thiserror::Error;

use crate::{
    grid::Grid,
    halo::{paint, HaloCatalogue, LuminosityRelation},
    math::{fft3, ifft3_real},
    prior::{PriorError, PriorSpec},
};

/// Redraws allowed per parameter before giving up on an initial position.
const MAX_INIT_ATTEMPTS: usize = 1000;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model `{model}` takes {expected} parameters, got {found}")]
    WrongParameterCount {
        model: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Could not draw parameter {index} of `{model}` inside its support from the prior")]
    NoValidInitialPosition { model: &'static str, index: usize },
    #[error("Halo catalogue columns have inconsistent lengths")]
    InconsistentCatalogue,
    #[error("Model `{0}` needs a star formation rate for every halo")]
    MissingStarFormation(&'static str),
    #[error(transparent)]
    Prior(#[from] PriorError),
}

/// Luminosity model painted from a halo catalogue.
#[derive(Debug, Clone)]
pub struct LuminosityHalo {
    relation: LuminosityRelation,
    halos: Arc<HaloCatalogue>,
    temperature_per_luminosity: f64,
}

impl LuminosityHalo {
    /// `temperature_per_luminosity` converts a luminosity density (per voxel
    /// volume) into map intensity units.
    pub fn new(
        relation: LuminosityRelation,
        halos: Arc<HaloCatalogue>,
        temperature_per_luminosity: f64,
    ) -> Result<Self, ModelError> {
        if !halos.is_consistent() {
            return Err(ModelError::InconsistentCatalogue);
        }
        if relation == LuminosityRelation::Li && halos.sfr.is_none() {
            return Err(ModelError::MissingStarFormation(relation.label()));
        }
        Ok(Self {
            relation,
            halos,
            temperature_per_luminosity,
        })
    }

    pub fn relation(&self) -> LuminosityRelation {
        self.relation
    }

    pub fn halos(&self) -> &HaloCatalogue {
        &self.halos
    }
}

#[derive(Debug, Clone)]
pub enum Model {
    /// Gaussian white noise, parameters `[sigma_T]`.
    WhiteNoise,
    /// Gaussian random field with `P(k) = A k^-alpha`, parameters `[A, alpha]`.
    PowerLaw,
    LuminosityHalo(LuminosityHalo),
}

impl Model {
    pub fn label(&self) -> &'static str {
        match self {
            Model::WhiteNoise => "wn_ps",
            Model::PowerLaw => "pl_ps",
            Model::LuminosityHalo(lum) => lum.relation.label(),
        }
    }

    pub fn n_params(&self) -> usize {
        match self {
            Model::WhiteNoise => 1,
            Model::PowerLaw => 2,
            Model::LuminosityHalo(lum) => lum.relation.n_params(),
        }
    }

    pub fn check_params(&self, params: &[f64]) -> Result<(), ModelError> {
        if params.len() != self.n_params() {
            return Err(ModelError::WrongParameterCount {
                model: self.label(),
                expected: self.n_params(),
                found: params.len(),
            });
        }
        Ok(())
    }

    pub fn check_prior(&self, prior: &PriorSpec) -> Result<(), ModelError> {
        if prior.len() != self.n_params() {
            return Err(PriorError::WrongLength {
                model: self.label(),
                expected: self.n_params(),
                found: prior.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Hard support of parameter `index`, independent of the prior.
    pub fn in_support(&self, index: usize, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match (self, index) {
            (Model::WhiteNoise, 0) => value > 0.,
            (Model::PowerLaw, 0) => value > 0.,
            (Model::LuminosityHalo(lum), _) => lum.relation.in_support(index, value),
            _ => true,
        }
    }

    /// Log prior density, `-inf` outside the hard support. Cheap: no map is
    /// generated.
    pub fn ln_prior(&self, params: &[f64], prior: &PriorSpec) -> f64 {
        if params.len() != self.n_params()
            || !params
                .iter()
                .enumerate()
                .all(|(index, &value)| self.in_support(index, value))
        {
            return f64::NEG_INFINITY;
        }
        prior.ln_density(params)
    }

    /// One stochastic map for `params`. Deterministic for a given state of
    /// `rng`.
    pub fn generate_map<R: Rng + ?Sized>(
        &self,
        params: &[f64],
        grid: &Grid,
        rng: &mut R,
    ) -> Result<Array3<f64>, ModelError> {
        self.check_params(params)?;
        let map = match self {
            Model::WhiteNoise => {
                let sigma_t = params[0];
                match Normal::new(0., sigma_t) {
                    Ok(normal) => Array3::from_shape_simple_fn(grid.shape(), || normal.sample(rng)),
                    Err(_) => Array3::from_elem(grid.shape(), f64::NAN),
                }
            }
            Model::PowerLaw => power_law_field(params[0], params[1], grid, rng),
            Model::LuminosityHalo(lum) => {
                let luminosities = lum.relation.luminosities(params, &lum.halos, rng);
                paint(grid, &lum.halos, &luminosities, lum.temperature_per_luminosity)
            }
        };
        Ok(map)
    }

    /// Draws `n_walkers` starting points from the prior, redrawing each
    /// coordinate that falls outside the hard support.
    pub fn mcmc_walker_initial_positions<R: Rng + ?Sized>(
        &self,
        prior: &PriorSpec,
        n_walkers: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>, ModelError> {
        self.check_prior(prior)?;
        let mut positions = Array2::zeros((n_walkers, self.n_params()));
        for mut walker in positions.rows_mut() {
            for (index, (value, gaussian)) in walker.iter_mut().zip(prior.iter()).enumerate() {
                *value = (0..MAX_INIT_ATTEMPTS)
                    .map(|_| gaussian.sample(rng))
                    .find(|&draw| self.in_support(index, draw))
                    .ok_or(ModelError::NoValidInitialPosition {
                        model: self.label(),
                        index,
                    })?;
            }
        }
        Ok(positions)
    }
}

/// Gaussian random field whose power, measured with the estimator of
/// [`crate::observable::PowerSpectrum`], is `amplitude * k^-alpha`.
fn power_law_field<R: Rng + ?Sized>(
    amplitude: f64,
    alpha: f64,
    grid: &Grid,
    rng: &mut R,
) -> Array3<f64> {
    let white = Array3::from_shape_simple_fn(grid.shape(), || {
        let draw: f64 = StandardNormal.sample(rng);
        draw
    });
    let mut spectrum = fft3(&white);
    let [kx, ky, kz] = grid.k_axes();
    let n = grid.n_voxels() as f64;
    let volume = grid.volume();
    spectrum.indexed_iter_mut().for_each(|((i, j, l), mode)| {
        let k = (kx[i] * kx[i] + ky[j] * ky[j] + kz[l] * kz[l]).sqrt();
        if k > 0. {
            *mode *= (n * amplitude * k.powf(-alpha) / volume).sqrt();
        } else {
            *mode *= 0.;
        }
    });
    ifft3_real(spectrum)
}
