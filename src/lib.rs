//! Forward-model likelihood for intensity-mapping MCMC.
//!
//! A parameter vector is turned into synthetic intensity maps, the maps are
//! reduced to summary statistics averaged over stochastic realizations, and
//! the statistics are compared to data through a Gaussian likelihood. The
//! sampler driving the walkers is not part of this crate; it consumes the
//! posterior through [`LogDensity`] or [`Ensemble::evaluate_step`].
//!
//! ```
//! use lim_mcmc::{Evaluator, ExperimentSettings, Grid, LogDensity, McmcSettings, Model,
//!     ObservableKind, PriorSpec};
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! let grid = Grid::new(&ExperimentSettings::cube(8, 1.)).unwrap();
//! let settings = McmcSettings {
//!     observables: vec![ObservableKind::PowerSpectrum],
//!     ..Default::default()
//! };
//! let prior = PriorSpec::gaussian(&[[5., 3.]]).unwrap();
//! let mut evaluator = Evaluator::new(grid, Model::WhiteNoise, prior, &settings).unwrap();
//! let mut rng = ChaCha8Rng::seed_from_u64(42);
//! evaluator.simulate_data(&[8.3], 10, &mut rng).unwrap();
//!
//! let mut lnprob = evaluator.with_rng(rng);
//! assert!(lnprob.ln_prob(&[8.3]).unwrap().is_finite());
//! assert_eq!(lnprob.ln_prob(&[-1.]).unwrap(), f64::NEG_INFINITY);
//! ```

pub mod ensemble;
pub mod evaluator;
pub mod grid;
pub mod halo;
pub mod likelihood;
pub(crate) mod math;
pub mod model;
pub mod observable;
pub mod prior;
pub mod settings;

pub use ensemble::{walker_rng, Ensemble, Samples};
pub use evaluator::{EvaluationError, Evaluator, LnProb, LogDensity, LogpError};
pub use grid::{Grid, GridError};
pub use halo::{HaloCatalogue, LuminosityRelation};
pub use likelihood::{chi_squared, chi_squared_cov, scaled_covariance};
pub use model::{LuminosityHalo, Model, ModelError};
pub use observable::{Observable, ObservableError, PowerSpectrum, VoxelIntensityDistribution};
pub use prior::{GaussianPrior, PriorError, PriorSpec};
pub use settings::{
    logspace, ExperimentSettings, LikelihoodMode, McmcSettings, ObservableKind, SettingsError,
};
