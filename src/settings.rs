//! Experiment and inference configuration.
//!
//! Both settings structs are plain values: they are built once, validated,
//! and then passed by reference into the grid, model, observable and
//! evaluator constructors. Nothing reads configuration from global state.

use std::str::FromStr;

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::math::linspace;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("Unknown likelihood `{0}`, expected `chi_squared` or `chi_squared_cov`")]
    UnknownLikelihood(String),
    #[error("Unknown observable `{0}`, expected `ps` or `vid`")]
    UnknownObservable(String),
    #[error("Invalid setting `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl SettingsError {
    fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        SettingsError::Invalid {
            name,
            reason: reason.into(),
        }
    }
}

/// Instrument and survey geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSettings {
    /// Voxel bin edges along the first map axis.
    pub x: Vec<f64>,
    /// Voxel bin edges along the second map axis.
    pub y: Vec<f64>,
    /// Voxel bin edges along the third (frequency / redshift) axis.
    pub z: Vec<f64>,
    /// Standard deviation of the white instrument noise per voxel.
    pub sigma_noise: f64,
    /// Beam width along the first axis, in voxels.
    pub sigma_x: f64,
    /// Beam width along the second axis, in voxels.
    pub sigma_y: f64,
    /// Truncation of the beam kernel in standard deviations.
    pub n_sigma: f64,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            x: linspace(0., 10., 11),
            y: linspace(0., 10., 11),
            z: linspace(0., 10., 11),
            sigma_noise: 0.,
            sigma_x: 0.,
            sigma_y: 0.,
            n_sigma: 5.,
        }
    }
}

impl ExperimentSettings {
    /// A cube of `n` voxels of side `size` along every axis.
    pub fn cube(n: usize, size: f64) -> Self {
        let edges = linspace(0., n as f64 * size, n + 1);
        Self {
            x: edges.clone(),
            y: edges.clone(),
            z: edges,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        for (name, value) in [
            ("sigma_noise", self.sigma_noise),
            ("sigma_x", self.sigma_x),
            ("sigma_y", self.sigma_y),
        ] {
            if !(value.is_finite() && value >= 0.) {
                return Err(SettingsError::invalid(
                    name,
                    format!("must be finite and non-negative, got {value}"),
                ));
            }
        }
        if !(self.n_sigma.is_finite() && self.n_sigma > 0.) {
            return Err(SettingsError::invalid(
                "n_sigma",
                format!("must be finite and positive, got {}", self.n_sigma),
            ));
        }
        Ok(())
    }
}

/// How the averaged observables are compared with the data.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LikelihoodMode {
    /// Independent bins, variance from the per-bin independent variance.
    #[default]
    ChiSquared,
    /// Full covariance. `cov_mat_0` was estimated for per-bin variances
    /// `ind_var_0` and is rescaled to the current variances on every call.
    ChiSquaredCov {
        cov_mat_0: Array2<f64>,
        ind_var_0: Array1<f64>,
    },
}

impl LikelihoodMode {
    pub fn name(&self) -> &'static str {
        match self {
            LikelihoodMode::ChiSquared => "chi_squared",
            LikelihoodMode::ChiSquaredCov { .. } => "chi_squared_cov",
        }
    }
}

/// Parses the diagonal mode only; the covariance mode needs its reference
/// matrix and has to be built directly.
impl FromStr for LikelihoodMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chi_squared" => Ok(LikelihoodMode::ChiSquared),
            "chi_squared_cov" => Err(SettingsError::invalid(
                "likelihood",
                "chi_squared_cov requires cov_mat_0 and ind_var_0",
            )),
            other => Err(SettingsError::UnknownLikelihood(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservableKind {
    PowerSpectrum,
    VoxelIntensityDistribution,
}

impl ObservableKind {
    pub fn label(&self) -> &'static str {
        match self {
            ObservableKind::PowerSpectrum => "ps",
            ObservableKind::VoxelIntensityDistribution => "vid",
        }
    }
}

impl FromStr for ObservableKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ps" => Ok(ObservableKind::PowerSpectrum),
            "vid" => Ok(ObservableKind::VoxelIntensityDistribution),
            other => Err(SettingsError::UnknownObservable(other.to_string())),
        }
    }
}

/// Settings of one inference run.
#[derive(Debug, Clone, PartialEq)]
pub struct McmcSettings {
    pub n_walkers: usize,
    pub n_steps: usize,
    /// Independent forward-model simulations averaged per evaluation.
    pub n_realizations: usize,
    pub likelihood: LikelihoodMode,
    /// Effective number of independent patches; divides every variance.
    pub n_patches: f64,
    /// Wavenumber bin edges of the power spectrum. Derived from the grid if
    /// `None`.
    pub ps_kbins: Option<Vec<f64>>,
    /// Intensity bin edges of the voxel intensity distribution. Derived from
    /// each map if `None`.
    pub vid_tbins: Option<Vec<f64>>,
    pub observables: Vec<ObservableKind>,
    pub seed: u64,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            n_walkers: 10,
            n_steps: 300,
            n_realizations: 1,
            likelihood: LikelihoodMode::ChiSquared,
            n_patches: 1.,
            ps_kbins: Some(logspace(-1.5, -0.1, 10)),
            vid_tbins: Some(logspace(1., 2., 10)),
            observables: vec![
                ObservableKind::PowerSpectrum,
                ObservableKind::VoxelIntensityDistribution,
            ],
            seed: 42,
        }
    }
}

impl McmcSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.n_walkers == 0 {
            return Err(SettingsError::invalid("n_walkers", "must be positive"));
        }
        if self.n_realizations == 0 {
            return Err(SettingsError::invalid("n_realizations", "must be positive"));
        }
        if !(self.n_patches.is_finite() && self.n_patches > 0.) {
            return Err(SettingsError::invalid(
                "n_patches",
                format!("must be finite and positive, got {}", self.n_patches),
            ));
        }
        if self.observables.is_empty() {
            return Err(SettingsError::invalid("observables", "at least one is required"));
        }
        if let LikelihoodMode::ChiSquaredCov {
            cov_mat_0,
            ind_var_0,
        } = &self.likelihood
        {
            let n = ind_var_0.len();
            if cov_mat_0.dim() != (n, n) {
                return Err(SettingsError::invalid(
                    "cov_mat_0",
                    format!(
                        "shape {:?} does not match {} reference variances",
                        cov_mat_0.dim(),
                        n
                    ),
                ));
            }
            if ind_var_0.iter().any(|v| !(v.is_finite() && *v > 0.)) {
                return Err(SettingsError::invalid(
                    "ind_var_0",
                    "reference variances must be finite and positive",
                ));
            }
        }
        Ok(())
    }
}

/// `num` values spaced evenly on a log scale from `10^start` to `10^stop`.
pub fn logspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    Array1::logspace(10., start, stop, num).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_names() {
        assert_eq!("ps".parse::<ObservableKind>(), Ok(ObservableKind::PowerSpectrum));
        assert_eq!(
            "vid".parse::<ObservableKind>(),
            Ok(ObservableKind::VoxelIntensityDistribution)
        );
        assert!("lum".parse::<ObservableKind>().is_err());
        assert_eq!(
            "chi_squared".parse::<LikelihoodMode>(),
            Ok(LikelihoodMode::ChiSquared)
        );
        assert!("chi_squared_cov".parse::<LikelihoodMode>().is_err());
    }

    #[test]
    fn logspace_decades() {
        let edges = logspace(1., 2., 3);
        assert_eq!(edges.len(), 3);
        approx::assert_relative_eq!(edges[0], 10., max_relative = 1e-12);
        approx::assert_relative_eq!(edges[1], 10f64.sqrt() * 10., max_relative = 1e-12);
        approx::assert_relative_eq!(edges[2], 100., max_relative = 1e-12);
    }

    #[test]
    fn defaults_are_valid() {
        ExperimentSettings::default().validate().unwrap();
        McmcSettings::default().validate().unwrap();
    }

    #[test]
    fn covariance_shape_checked() {
        let settings = McmcSettings {
            likelihood: LikelihoodMode::ChiSquaredCov {
                cov_mat_0: Array2::eye(3),
                ind_var_0: Array1::ones(2),
            },
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid { name: "cov_mat_0", .. })
        ));
    }

    #[test]
    fn negative_noise_rejected() {
        let settings = ExperimentSettings {
            sigma_noise: -1.,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
