//! Halo catalogues and the halo-luminosity models painted from them.
//!
//! Catalogues are built in memory by the caller; reading them from disk is
//! not part of this crate.

use ndarray::Array3;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{grid::Grid, math::bin_index};

/// CO luminosity in solar units per unit of `L'_CO` (K km/s pc^2).
const LCO_PRIME_TO_LSUN: f64 = 4.9e-5;

/// Halo positions, masses and redshifts.
#[derive(Debug, Clone, Default)]
pub struct HaloCatalogue {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    /// Halo mass in solar masses.
    pub mass: Vec<f64>,
    /// Observed redshift.
    pub redshift: Vec<f64>,
    /// Mean star formation rate per halo in solar masses per year. Only the
    /// `Lco_Li` model needs it.
    pub sfr: Option<Vec<f64>>,
}

impl HaloCatalogue {
    pub fn len(&self) -> usize {
        self.mass.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mass.is_empty()
    }

    pub(crate) fn is_consistent(&self) -> bool {
        let n = self.len();
        self.x.len() == n
            && self.y.len() == n
            && self.z.len() == n
            && self.redshift.len() == n
            && self.sfr.as_ref().map_or(true, |s| s.len() == n)
    }

    pub fn with_sfr(mut self, sfr: Vec<f64>) -> Self {
        self.sfr = Some(sfr);
        self
    }

    /// Right ascension and declination in degrees of halo `i`, for a field
    /// of view centred on the third axis.
    pub fn sky_position(&self, i: usize) -> (f64, f64) {
        let chi = (self.x[i].powi(2) + self.y[i].powi(2) + self.z[i].powi(2)).sqrt();
        let ra = (-self.x[i]).atan2(self.z[i]).to_degrees();
        let dec = if chi > 0. {
            (self.y[i] / chi).asin().to_degrees()
        } else {
            0.
        };
        (ra, dec)
    }

    /// Keeps halos heavier than `min_mass`, inside the redshift window
    /// `[z_min, z_max]` and inside a field of view of `fov` degrees.
    pub fn cull(&self, min_mass: f64, (z_min, z_max): (f64, f64), (fov_x, fov_y): (f64, f64)) -> Self {
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| {
                let (ra, dec) = self.sky_position(i);
                self.mass[i] > min_mass
                    && self.redshift[i] >= z_min
                    && self.redshift[i] <= z_max
                    && ra.abs() <= fov_x / 2.
                    && dec.abs() <= fov_y / 2.
            })
            .collect();
        let pick = |values: &[f64]| keep.iter().map(|&i| values[i]).collect::<Vec<_>>();
        let culled = HaloCatalogue {
            x: pick(&self.x),
            y: pick(&self.y),
            z: pick(&self.z),
            mass: pick(&self.mass),
            redshift: pick(&self.redshift),
            sfr: self.sfr.as_deref().map(pick),
        };
        log::debug!("{} of {} halos remain after cuts", culled.len(), self.len());
        culled
    }
}

/// Mass-to-luminosity relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuminosityRelation {
    /// `L = 10^A M`, parameters `[A]`.
    Linear,
    /// Star-formation based CO model, parameters
    /// `[log10 delta_MF, alpha, beta, sigma_SFR, sigma_Lco]`.
    Li,
}

impl LuminosityRelation {
    pub fn n_params(&self) -> usize {
        match self {
            LuminosityRelation::Linear => 1,
            LuminosityRelation::Li => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LuminosityRelation::Linear => "Lco_Pullen",
            LuminosityRelation::Li => "Lco_Li",
        }
    }

    pub(crate) fn in_support(&self, index: usize, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match (self, index) {
            (LuminosityRelation::Li, 1) => value > 0.,
            (LuminosityRelation::Li, 3 | 4) => value >= 0.,
            _ => true,
        }
    }

    /// Luminosity of every halo for one stochastic draw of the scatter.
    pub(crate) fn luminosities<R: Rng + ?Sized>(
        &self,
        params: &[f64],
        halos: &HaloCatalogue,
        rng: &mut R,
    ) -> Vec<f64> {
        match self {
            LuminosityRelation::Linear => {
                let ratio = 10f64.powf(params[0]);
                halos.mass.iter().map(|m| ratio * m).collect()
            }
            LuminosityRelation::Li => {
                let [log_delta_mf, alpha, beta, sigma_sfr, sigma_lco] =
                    [params[0], params[1], params[2], params[3], params[4]];
                let sfr_scatter = log_normal_dex(sigma_sfr);
                let lco_scatter = log_normal_dex(sigma_lco);
                let delta_mf = 10f64.powf(log_delta_mf);
                let Some(sfr) = halos.sfr.as_deref() else {
                    return vec![0.; halos.len()];
                };
                sfr.iter()
                    .map(|&mean_sfr| {
                        if !(mean_sfr > 0.) {
                            return 0.;
                        }
                        let sfr = mean_sfr * scatter(&sfr_scatter, rng);
                        let l_ir = sfr * 1e10 / delta_mf;
                        let log_lco_prime = (l_ir.log10() - beta) / alpha;
                        let lco_prime = 10f64.powf(log_lco_prime) * scatter(&lco_scatter, rng);
                        LCO_PRIME_TO_LSUN * lco_prime
                    })
                    .collect()
            }
        }
    }
}

fn log_normal_dex(sigma: f64) -> Option<Normal<f64>> {
    if sigma > 0. {
        Normal::new(0., sigma).ok()
    } else {
        None
    }
}

fn scatter<R: Rng + ?Sized>(dist: &Option<Normal<f64>>, rng: &mut R) -> f64 {
    match dist {
        Some(normal) => 10f64.powf(normal.sample(rng)),
        None => 1.,
    }
}

/// Bins halo luminosities onto the grid and converts the per-voxel sum to an
/// intensity.
pub(crate) fn paint(
    grid: &Grid,
    halos: &HaloCatalogue,
    luminosities: &[f64],
    temperature_per_luminosity: f64,
) -> Array3<f64> {
    let (x_edges, y_edges, z_edges) = grid.edges();
    let mut map = Array3::zeros(grid.shape());
    for (i, &lum) in luminosities.iter().enumerate() {
        let voxel = (
            bin_index(x_edges, halos.x[i]),
            bin_index(y_edges, halos.y[i]),
            bin_index(z_edges, halos.z[i]),
        );
        if let (Some(ix), Some(iy), Some(iz)) = voxel {
            map[[ix, iy, iz]] += lum;
        }
    }
    let scale = temperature_per_luminosity / grid.vox_vol();
    map.mapv_inplace(|v| v * scale);
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ExperimentSettings;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn catalogue() -> HaloCatalogue {
        HaloCatalogue {
            x: vec![0.5, 0.5, 3.5, -1.],
            y: vec![0.5, 0.5, 2.5, 0.5],
            z: vec![1.5, 1.5, 3.9, 1.5],
            mass: vec![1e10, 3e10, 1e12, 1e11],
            redshift: vec![2.8, 2.9, 3.1, 2.9],
            sfr: None,
        }
    }

    #[test]
    fn linear_luminosities_are_painted() {
        let grid = Grid::new(&ExperimentSettings::cube(4, 1.)).unwrap();
        let halos = catalogue();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let lum = LuminosityRelation::Linear.luminosities(&[-6.], &halos, &mut rng);
        assert_relative_eq!(lum[2], 1e6);
        let map = paint(&grid, &halos, &lum, 2.);
        assert_relative_eq!(map[[0, 0, 1]], 2. * 4e4);
        assert_relative_eq!(map[[3, 2, 3]], 2. * 1e6);
        // The halo at x = -1 lies outside the grid.
        assert_relative_eq!(map.sum(), 2. * (4e4 + 1e6));
    }

    #[test]
    fn li_without_scatter_is_deterministic() {
        let halos = catalogue().with_sfr(vec![1., 10., 0., 1.]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let params = [0., 1.37, -1.74, 0., 0.];
        let lum = LuminosityRelation::Li.luminosities(&params, &halos, &mut rng);
        let expected = LCO_PRIME_TO_LSUN * 10f64.powf((10f64 - -1.74) / 1.37);
        assert_relative_eq!(lum[0], expected, max_relative = 1e-12);
        assert_eq!(lum[2], 0.);
        assert!(lum[1] > lum[0]);
    }

    #[test]
    fn li_support() {
        let li = LuminosityRelation::Li;
        assert!(li.in_support(1, 1.17));
        assert!(!li.in_support(1, 0.));
        assert!(!li.in_support(3, -0.1));
        assert!(li.in_support(2, -20.));
        assert!(!LuminosityRelation::Linear.in_support(0, f64::NAN));
    }

    #[test]
    fn cull_by_mass_redshift_and_field() {
        let halos = catalogue().with_sfr(vec![1., 2., 3., 4.]);
        let culled = halos.cull(2e10, (2.85, 3.0), (80., 80.));
        assert_eq!(culled.mass, vec![3e10, 1e11]);
        assert_eq!(culled.sfr, Some(vec![2., 4.]));
        let narrow = halos.cull(0., (0., 10.), (1., 1.));
        assert!(narrow.is_empty());
    }
}
