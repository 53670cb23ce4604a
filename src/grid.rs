//! Voxel grid geometry and the map buffer that lives on it.

use ndarray::Array3;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::{
    math::{convolve_axis_same, fftfreq, fftshift, gaussian_kernel, valid_edges},
    settings::{ExperimentSettings, SettingsError},
};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum GridError {
    #[error("Axis `{axis}` needs at least two finite, strictly increasing edges, got {len}")]
    MalformedAxis { axis: &'static str, len: usize },
    #[error("Map of shape {found:?} does not fit a grid of shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// A regular 3D voxel grid together with its current map.
///
/// The map buffer is owned by the grid and overwritten once per forward-model
/// realization. Concurrent evaluations each work on their own clone.
#[derive(Debug, Clone)]
pub struct Grid {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    n_x: usize,
    n_y: usize,
    n_z: usize,
    dx: f64,
    dy: f64,
    dz: f64,
    volume: f64,
    vox_vol: f64,
    fx: Vec<f64>,
    fy: Vec<f64>,
    fz: Vec<f64>,
    sigma_noise: f64,
    sigma_x: f64,
    sigma_y: f64,
    n_sigma: f64,
    map: Array3<f64>,
}

fn check_axis(axis: &'static str, edges: &[f64]) -> Result<(), GridError> {
    if valid_edges(edges) {
        Ok(())
    } else {
        Err(GridError::MalformedAxis {
            axis,
            len: edges.len(),
        })
    }
}

fn span(edges: &[f64]) -> f64 {
    edges[edges.len() - 1] - edges[0]
}

impl Grid {
    pub fn new(settings: &ExperimentSettings) -> Result<Grid, GridError> {
        settings.validate()?;
        check_axis("x", &settings.x)?;
        check_axis("y", &settings.y)?;
        check_axis("z", &settings.z)?;

        let x = settings.x.clone();
        let y = settings.y.clone();
        let z = settings.z.clone();
        let (n_x, n_y, n_z) = (x.len() - 1, y.len() - 1, z.len() - 1);
        let (dx, dy, dz) = (x[1] - x[0], y[1] - y[0], z[1] - z[0]);
        let volume = span(&x) * span(&y) * span(&z);
        let vox_vol = volume / (n_x * n_y * n_z) as f64;

        log::debug!(
            "Grid {}x{}x{} with voxel volume {:.4e} and total volume {:.4e}",
            n_x,
            n_y,
            n_z,
            vox_vol,
            volume
        );

        Ok(Grid {
            fx: fftshift(&fftfreq(n_x, dx)),
            fy: fftshift(&fftfreq(n_y, dy)),
            fz: fftshift(&fftfreq(n_z, dz)),
            x,
            y,
            z,
            n_x,
            n_y,
            n_z,
            dx,
            dy,
            dz,
            volume,
            vox_vol,
            sigma_noise: settings.sigma_noise,
            sigma_x: settings.sigma_x,
            sigma_y: settings.sigma_y,
            n_sigma: settings.n_sigma,
            map: Array3::zeros((n_x, n_y, n_z)),
        })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_x, self.n_y, self.n_z)
    }

    pub fn n_voxels(&self) -> usize {
        self.n_x * self.n_y * self.n_z
    }

    pub fn edges(&self) -> (&[f64], &[f64], &[f64]) {
        (&self.x, &self.y, &self.z)
    }

    pub fn spacing(&self) -> (f64, f64, f64) {
        (self.dx, self.dy, self.dz)
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn vox_vol(&self) -> f64 {
        self.vox_vol
    }

    /// Centred (shifted) Fourier frequency axes.
    pub fn frequencies(&self) -> (&[f64], &[f64], &[f64]) {
        (&self.fx, &self.fy, &self.fz)
    }

    /// Angular wavenumbers `2π fftfreq(n, d)` along each axis in FFT order.
    pub fn k_axes(&self) -> [Vec<f64>; 3] {
        let two_pi = 2. * std::f64::consts::PI;
        [
            (self.n_x, self.dx),
            (self.n_y, self.dy),
            (self.n_z, self.dz),
        ]
        .map(|(n, d)| fftfreq(n, d).into_iter().map(|f| f * two_pi).collect())
    }

    pub fn beam(&self) -> (f64, f64) {
        (self.sigma_x, self.sigma_y)
    }

    pub fn map(&self) -> &Array3<f64> {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut Array3<f64> {
        &mut self.map
    }

    pub fn set_map(&mut self, map: Array3<f64>) -> Result<(), GridError> {
        if map.dim() != self.shape() {
            return Err(GridError::ShapeMismatch {
                expected: self.shape(),
                found: map.dim(),
            });
        }
        self.map = map;
        Ok(())
    }

    /// Subtracts the spatial mean of the current map from every voxel.
    pub fn demean_map(&mut self) {
        if let Some(mean) = self.map.mean() {
            self.map -= mean;
        }
    }

    /// Fresh white-noise realization with the configured per-voxel standard
    /// deviation.
    pub fn generate_noise_map<R: Rng + ?Sized>(&self, rng: &mut R) -> Array3<f64> {
        match Normal::new(0., self.sigma_noise) {
            Ok(normal) if self.sigma_noise > 0. => {
                Array3::from_shape_simple_fn(self.shape(), || normal.sample(&mut *rng))
            }
            _ => Array3::zeros(self.shape()),
        }
    }

    /// Convolves `map` with a normalized 2D Gaussian beam (widths in voxels
    /// along the first two axes), applied independently to every slice of the
    /// third axis. The output has the same shape as the input.
    pub fn smooth(&self, map: &Array3<f64>, sigma_x: f64, sigma_y: f64) -> Array3<f64> {
        let kernel_x = gaussian_kernel(sigma_x, self.n_sigma);
        let kernel_y = gaussian_kernel(sigma_y, self.n_sigma);
        let smoothed = convolve_axis_same(map, &kernel_x, 0);
        convolve_axis_same(&smoothed, &kernel_y, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn settings() -> ExperimentSettings {
        ExperimentSettings {
            x: vec![0., 2., 4., 6., 8.],
            y: vec![0., 1., 2.],
            z: vec![1., 1.5, 2., 2.5],
            sigma_noise: 2.,
            ..Default::default()
        }
    }

    #[test]
    fn derived_geometry() {
        let grid = Grid::new(&settings()).unwrap();
        assert_eq!(grid.shape(), (4, 2, 3));
        assert_eq!(grid.spacing(), (2., 1., 0.5));
        assert_abs_diff_eq!(grid.volume(), 8. * 2. * 1.5);
        assert_abs_diff_eq!(grid.vox_vol(), 24. / 24.);
        let (fx, _, fz) = grid.frequencies();
        assert_eq!(fx, &[-0.25, -0.125, 0., 0.125]);
        assert_eq!(fz.len(), 3);
        assert_eq!(grid.map().dim(), (4, 2, 3));
    }

    #[test]
    fn malformed_axes_fail() {
        let mut bad = settings();
        bad.x = vec![0.];
        assert!(matches!(
            Grid::new(&bad),
            Err(GridError::MalformedAxis { axis: "x", len: 1 })
        ));

        let mut bad = settings();
        bad.y = vec![0., 2., 1.];
        assert!(matches!(
            Grid::new(&bad),
            Err(GridError::MalformedAxis { axis: "y", .. })
        ));

        let mut bad = settings();
        bad.z = vec![0., f64::NAN];
        assert!(Grid::new(&bad).is_err());
    }

    #[test]
    fn noise_statistics() {
        let grid = Grid::new(&ExperimentSettings {
            sigma_noise: 3.,
            ..ExperimentSettings::cube(20, 1.)
        })
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let noise = grid.generate_noise_map(&mut rng);
        assert_eq!(noise.dim(), (20, 20, 20));
        let mean = noise.mean().unwrap();
        let var = noise.mapv(|v| (v - mean).powi(2)).mean().unwrap();
        assert!(mean.abs() < 0.2);
        assert!((var.sqrt() - 3.).abs() < 0.15);
        // The grid's own buffer is untouched.
        assert_eq!(grid.map().sum(), 0.);
    }

    #[test]
    fn zero_noise_is_zero() {
        let grid = Grid::new(&ExperimentSettings::cube(3, 1.)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(grid.generate_noise_map(&mut rng).sum(), 0.);
    }

    #[test]
    fn smoothing_preserves_shape_and_interior_mass() {
        let grid = Grid::new(&ExperimentSettings::cube(15, 1.)).unwrap();
        let mut map = Array3::zeros(grid.shape());
        map[[7, 7, 3]] = 1.;
        let smoothed = grid.smooth(&map, 1., 1.5);
        assert_eq!(smoothed.dim(), map.dim());
        assert_abs_diff_eq!(smoothed.sum(), 1., epsilon = 1e-10);
        assert!(smoothed[[7, 7, 3]] < 1.);
        assert_abs_diff_eq!(smoothed[[6, 7, 3]], smoothed[[8, 7, 3]], epsilon = 1e-15);
        // Slices along the third axis are independent.
        assert_eq!(smoothed[[7, 7, 2]], 0.);
        let unchanged = grid.smooth(&map, 0., 0.);
        assert_eq!(unchanged, map);
    }

    #[test]
    fn demean() {
        let mut grid = Grid::new(&ExperimentSettings::cube(2, 1.)).unwrap();
        grid.map_mut().fill(3.);
        grid.map_mut()[[0, 0, 0]] = 11.;
        grid.demean_map();
        assert_abs_diff_eq!(grid.map().sum(), 0., epsilon = 1e-12);
        assert!(grid
            .set_map(Array3::zeros((3, 2, 2)))
            .is_err());
    }
}
