use rand::Rng;
use rand_distr::Distribution;
use statrs::distribution::{Continuous, Normal};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PriorError {
    #[error("Prior {index} needs a finite mean and positive standard deviation, got ({mean}, {std})")]
    InvalidGaussian { index: usize, mean: f64, std: f64 },
    #[error("Model `{model}` has {expected} parameters but the prior describes {found}")]
    WrongLength {
        model: &'static str,
        expected: usize,
        found: usize,
    },
}

/// Independent normal prior on one parameter.
#[derive(Debug, Clone)]
pub struct GaussianPrior {
    mean: f64,
    std: f64,
    density: Normal,
    draws: rand_distr::Normal<f64>,
}

impl GaussianPrior {
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        self.std
    }

    pub fn ln_pdf(&self, x: f64) -> f64 {
        self.density.ln_pdf(x)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.draws.sample(rng)
    }
}

/// Priors of all parameters of one model, indexed like the parameter vector.
#[derive(Debug, Clone)]
pub struct PriorSpec {
    priors: Vec<GaussianPrior>,
}

impl PriorSpec {
    /// One Gaussian per `[mean, std]` pair.
    pub fn gaussian(params: &[[f64; 2]]) -> Result<PriorSpec, PriorError> {
        let priors = params
            .iter()
            .enumerate()
            .map(|(index, &[mean, std])| {
                if !(mean.is_finite() && std.is_finite() && std > 0.) {
                    return Err(PriorError::InvalidGaussian { index, mean, std });
                }
                let density = Normal::new(mean, std)
                    .map_err(|_| PriorError::InvalidGaussian { index, mean, std })?;
                let draws = rand_distr::Normal::new(mean, std)
                    .map_err(|_| PriorError::InvalidGaussian { index, mean, std })?;
                Ok(GaussianPrior {
                    mean,
                    std,
                    density,
                    draws,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PriorSpec { priors })
    }

    pub fn len(&self) -> usize {
        self.priors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GaussianPrior> {
        self.priors.iter()
    }

    /// Sum of the independent normal log densities. Extra parameters beyond
    /// the prior (or missing ones) make the density undefined.
    pub fn ln_density(&self, params: &[f64]) -> f64 {
        if params.len() != self.priors.len() {
            return f64::NEG_INFINITY;
        }
        self.priors
            .iter()
            .zip(params)
            .map(|(prior, &x)| prior.ln_pdf(x))
            .sum()
    }
}
