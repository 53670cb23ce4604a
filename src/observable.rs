//! Summary statistics of a map and their accumulation over realizations.

use itertools::{iproduct, izip};
use thiserror::Error;

use crate::{
    grid::Grid,
    math::{bin_centers, fft3, histogram, linspace, valid_edges},
    settings::{McmcSettings, ObservableKind},
};

/// Upper bound on the number of intensity bins derived from a map.
pub const MAX_AUTO_INTENSITY_BINS: usize = 1 << 16;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObservableError {
    /// The bin edges are empty, non-finite or not strictly increasing. This
    /// can depend on the map (auto-derived intensity bins), so callers should
    /// treat it as a rejected proposal rather than a fatal error.
    #[error("Degenerate `{observable}` binning: {reason}")]
    DegenerateBinning {
        observable: &'static str,
        reason: String,
    },
    #[error("`{observable}` has no bin edges yet; give explicit edges or simulate the data")]
    UnknownBinning { observable: &'static str },
    #[error("`{observable}` data has {found} bins, expected {expected}")]
    WrongDataLength {
        observable: &'static str,
        expected: usize,
        found: usize,
    },
}

impl ObservableError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ObservableError::DegenerateBinning { .. })
    }
}

/// Running sum of per-bin values over realizations and the resulting mean.
#[derive(Debug, Clone, Default)]
struct RunningSum {
    sum: Vec<f64>,
    count: usize,
    mean: Vec<f64>,
}

impl RunningSum {
    fn reset(&mut self) {
        self.sum.clear();
        self.mean.clear();
        self.count = 0;
    }

    fn add(&mut self, values: &[f64]) {
        if self.sum.is_empty() {
            self.sum.extend_from_slice(values);
        } else {
            self.sum
                .iter_mut()
                .zip(values)
                .for_each(|(s, v)| *s += v);
        }
        self.count += 1;
    }

    fn finalize(&mut self, n_realizations: usize) {
        let n = n_realizations as f64;
        self.mean = self.sum.iter().map(|s| s / n).collect();
    }
}

/// Spherically averaged 3D power spectrum.
#[derive(Debug, Clone)]
pub struct PowerSpectrum {
    edges: Vec<f64>,
    k: Vec<f64>,
    values: Vec<f64>,
    n_modes: Vec<u64>,
    data: Option<Vec<f64>>,
    running: RunningSum,
    independent_var: Vec<f64>,
}

impl PowerSpectrum {
    /// Uses `k_bins` as shell edges, or derives them from the grid: shells
    /// of width `dk`, the finest per-axis wavenumber spacing, centred on
    /// `dk, 2dk, ...` up to the largest wavenumber. Derived shells without
    /// any mode are merged into their neighbour.
    pub fn new(grid: &Grid, k_bins: Option<&[f64]>) -> Result<Self, ObservableError> {
        let edges = match k_bins {
            Some(edges) => edges.to_vec(),
            None => {
                let edges = Self::auto_edges(grid);
                let counts = mode_counts(grid, &edges);
                merge_empty_shells(&edges, &counts)
            }
        };
        if !valid_edges(&edges) {
            return Err(ObservableError::DegenerateBinning {
                observable: "ps",
                reason: format!("{} k edges are not strictly increasing", edges.len()),
            });
        }
        let n_bins = edges.len() - 1;
        Ok(Self {
            k: bin_centers(&edges),
            n_modes: mode_counts(grid, &edges),
            edges,
            values: vec![0.; n_bins],
            data: None,
            running: RunningSum::default(),
            independent_var: vec![],
        })
    }

    fn auto_edges(grid: &Grid) -> Vec<f64> {
        let axes = grid.k_axes();
        let dk = axes
            .iter()
            .filter(|k| k.len() > 1)
            .map(|k| (k[1] - k[0]).abs())
            .fold(f64::INFINITY, f64::min);
        let k_max = axes
            .iter()
            .flat_map(|k| k.iter().map(|v| v.abs()))
            .fold(0f64, f64::max);
        if !(dk.is_finite() && dk > 0.) {
            return vec![];
        }
        let n = (k_max / dk - 0.5).ceil().max(1.) as usize;
        linspace(0.5 * dk, (n as f64 + 0.5) * dk, n + 1)
    }

    /// Power of the grid's current map: `|FFT(map) / N|^2 * volume`, averaged
    /// over all modes with `k > 0` in each shell. Shells without modes keep
    /// zero power.
    pub fn compute(&mut self, grid: &Grid) {
        let [kx, ky, kz] = grid.k_axes();
        let n = grid.n_voxels() as f64;
        let volume = grid.volume();
        let spectrum = fft3(grid.map());
        let modes = spectrum.indexed_iter().filter_map(|((i, j, l), mode)| {
            let k = (kx[i] * kx[i] + ky[j] * ky[j] + kz[l] * kz[l]).sqrt();
            (k > 0.).then(|| (k, (*mode / n).norm_sqr() * volume))
        });
        let (mut power, n_modes) = histogram(modes, &self.edges);
        for (p, &count) in power.iter_mut().zip(&n_modes) {
            if count > 0 {
                *p /= count as f64;
            }
        }
        self.values = power;
        self.n_modes = n_modes;
    }

    pub fn k(&self) -> &[f64] {
        &self.k
    }

    pub fn n_modes(&self) -> &[u64] {
        &self.n_modes
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    fn update_independent_var(&mut self) {
        self.independent_var = izip!(&self.running.mean, &self.n_modes)
            .map(|(&mean, &count)| {
                if count > 0 {
                    mean * mean / count as f64
                } else {
                    f64::INFINITY
                }
            })
            .collect();
    }
}

/// Number of `k > 0` modes of the grid in each shell.
fn mode_counts(grid: &Grid, edges: &[f64]) -> Vec<u64> {
    let [kx, ky, kz] = grid.k_axes();
    let magnitudes = iproduct!(&kx, &ky, &kz)
        .map(|(x, y, z)| (x * x + y * y + z * z).sqrt())
        .filter(|&k| k > 0.)
        .map(|k| (k, 1.));
    histogram(magnitudes, edges).1
}

/// Drops the upper edge of every empty shell so it joins the next one.
/// Empty shells at the top are dropped entirely.
fn merge_empty_shells(edges: &[f64], counts: &[u64]) -> Vec<f64> {
    let Some(&first) = edges.first() else {
        return vec![];
    };
    let mut merged = vec![first];
    let mut pending = 0;
    for (&upper, &count) in edges[1..].iter().zip(counts) {
        pending += count;
        if pending > 0 {
            merged.push(upper);
            pending = 0;
        }
    }
    merged
}

/// Histogram of voxel intensities.
#[derive(Debug, Clone)]
pub struct VoxelIntensityDistribution {
    edges: Option<Vec<f64>>,
    t: Vec<f64>,
    values: Vec<f64>,
    data: Option<Vec<f64>>,
    running: RunningSum,
    independent_var: Vec<f64>,
}

impl VoxelIntensityDistribution {
    /// Uses `t_bins` as intensity edges. Without them the edges are derived
    /// from the first map computed and kept for every later map, so that
    /// realizations and data share one binning.
    pub fn new(t_bins: Option<&[f64]>) -> Result<Self, ObservableError> {
        let edges = match t_bins {
            Some(edges) => {
                check_vid_edges(edges)?;
                Some(edges.to_vec())
            }
            None => None,
        };
        Ok(Self {
            t: edges.as_deref().map(bin_centers).unwrap_or_default(),
            values: vec![],
            edges,
            data: None,
            running: RunningSum::default(),
            independent_var: vec![],
        })
    }

    /// `floor(max) + 1` edges spread evenly over `[min, max]` of the map.
    fn auto_edges(grid: &Grid) -> Result<Vec<f64>, ObservableError> {
        let map = grid.map();
        let min = map.iter().copied().fold(f64::INFINITY, f64::min);
        let max = map.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let num = (max + 1.).floor();
        if !(num.is_finite() && num >= 0.) {
            return Ok(vec![]);
        }
        if num > (MAX_AUTO_INTENSITY_BINS + 1) as f64 {
            log::warn!("Map maximum {:e} asks for {:e} intensity edges", max, num);
            return Err(ObservableError::DegenerateBinning {
                observable: "vid",
                reason: format!(
                    "map maximum {:e} needs more than {} auto-derived bins",
                    max, MAX_AUTO_INTENSITY_BINS
                ),
            });
        }
        Ok(linspace(min, max, num as usize))
    }

    pub fn compute(&mut self, grid: &Grid) -> Result<(), ObservableError> {
        if self.edges.is_none() {
            let edges = Self::auto_edges(grid)?;
            check_vid_edges(&edges)?;
            log::debug!("Derived {} intensity bins from the map", edges.len() - 1);
            self.t = bin_centers(&edges);
            self.edges = Some(edges);
        }
        let Some(edges) = self.edges.as_deref() else {
            return Err(ObservableError::DegenerateBinning {
                observable: "vid",
                reason: "no intensity edges".to_string(),
            });
        };
        let (_, counts) = histogram(grid.map().iter().map(|&v| (v, 1.)), edges);
        self.values = counts.into_iter().map(|c| c as f64).collect();
        Ok(())
    }

    pub fn t(&self) -> &[f64] {
        &self.t
    }

    pub fn edges(&self) -> Option<&[f64]> {
        self.edges.as_deref()
    }

    fn update_independent_var(&mut self) {
        self.independent_var = self.running.mean.clone();
    }
}

fn check_vid_edges(edges: &[f64]) -> Result<(), ObservableError> {
    if valid_edges(edges) {
        Ok(())
    } else {
        log::warn!("Degenerate intensity binning with {} edges", edges.len());
        Err(ObservableError::DegenerateBinning {
            observable: "vid",
            reason: format!(
                "{} intensity edges are empty, non-finite or not strictly increasing",
                edges.len()
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub enum Observable {
    PowerSpectrum(PowerSpectrum),
    VoxelIntensityDistribution(VoxelIntensityDistribution),
}

impl Observable {
    /// Builds the observable of `kind` with the bin edges from `settings`.
    pub fn new(
        kind: ObservableKind,
        grid: &Grid,
        settings: &McmcSettings,
    ) -> Result<Self, ObservableError> {
        Ok(match kind {
            ObservableKind::PowerSpectrum => {
                Observable::PowerSpectrum(PowerSpectrum::new(grid, settings.ps_kbins.as_deref())?)
            }
            ObservableKind::VoxelIntensityDistribution => Observable::VoxelIntensityDistribution(
                VoxelIntensityDistribution::new(settings.vid_tbins.as_deref())?,
            ),
        })
    }

    pub fn kind(&self) -> ObservableKind {
        match self {
            Observable::PowerSpectrum(_) => ObservableKind::PowerSpectrum,
            Observable::VoxelIntensityDistribution(_) => ObservableKind::VoxelIntensityDistribution,
        }
    }

    pub fn label(&self) -> &'static str {
        self.kind().label()
    }

    /// Computes the statistic of the grid's current map.
    pub fn compute(&mut self, grid: &Grid) -> Result<(), ObservableError> {
        match self {
            Observable::PowerSpectrum(ps) => {
                ps.compute(grid);
                Ok(())
            }
            Observable::VoxelIntensityDistribution(vid) => vid.compute(grid),
        }
    }

    /// Statistic of the last computed map.
    pub fn values(&self) -> &[f64] {
        match self {
            Observable::PowerSpectrum(ps) => &ps.values,
            Observable::VoxelIntensityDistribution(vid) => &vid.values,
        }
    }

    /// Bin centres (wavenumber or intensity).
    pub fn centers(&self) -> &[f64] {
        match self {
            Observable::PowerSpectrum(ps) => &ps.k,
            Observable::VoxelIntensityDistribution(vid) => &vid.t,
        }
    }

    fn running(&self) -> &RunningSum {
        match self {
            Observable::PowerSpectrum(ps) => &ps.running,
            Observable::VoxelIntensityDistribution(vid) => &vid.running,
        }
    }

    fn running_mut(&mut self) -> &mut RunningSum {
        match self {
            Observable::PowerSpectrum(ps) => &mut ps.running,
            Observable::VoxelIntensityDistribution(vid) => &mut vid.running,
        }
    }

    /// Clears the running sum and mean before a new evaluation.
    pub fn reset(&mut self) {
        self.running_mut().reset();
    }

    pub fn add_to_running_sum(&mut self) {
        let values = self.values().to_vec();
        self.running_mut().add(&values);
    }

    /// Divides the running sum by the number of realizations and updates the
    /// independent per-bin variance from the new mean.
    pub fn finalize_mean(&mut self, n_realizations: usize) {
        self.running_mut().finalize(n_realizations);
        match self {
            Observable::PowerSpectrum(ps) => ps.update_independent_var(),
            Observable::VoxelIntensityDistribution(vid) => vid.update_independent_var(),
        }
    }

    pub fn n_accumulated(&self) -> usize {
        self.running().count
    }

    pub fn mean(&self) -> &[f64] {
        &self.running().mean
    }

    /// Variance of each bin assuming independent bins: `mean^2 / n_modes`
    /// for the power spectrum, Poisson `mean` counts for the VID.
    pub fn independent_var(&self) -> &[f64] {
        match self {
            Observable::PowerSpectrum(ps) => &ps.independent_var,
            Observable::VoxelIntensityDistribution(vid) => &vid.independent_var,
        }
    }

    pub fn data(&self) -> Option<&[f64]> {
        match self {
            Observable::PowerSpectrum(ps) => ps.data.as_deref(),
            Observable::VoxelIntensityDistribution(vid) => vid.data.as_deref(),
        }
    }

    /// Sets the observed statistic. Its length must match the binning, so
    /// auto-derived intensity bins have to be fixed first by a compute.
    pub fn set_data(&mut self, data: Vec<f64>) -> Result<(), ObservableError> {
        let unbinned =
            matches!(self, Observable::VoxelIntensityDistribution(vid) if vid.edges.is_none());
        if unbinned {
            return Err(ObservableError::UnknownBinning {
                observable: self.label(),
            });
        }
        let expected = self.centers().len();
        if data.len() != expected {
            return Err(ObservableError::WrongDataLength {
                observable: self.label(),
                expected,
                found: data.len(),
            });
        }
        match self {
            Observable::PowerSpectrum(ps) => ps.data = Some(data),
            Observable::VoxelIntensityDistribution(vid) => vid.data = Some(data),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ExperimentSettings;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn grid(n: usize) -> Grid {
        Grid::new(&ExperimentSettings::cube(n, 1.)).unwrap()
    }

    #[test]
    fn constant_map_has_no_power() {
        let mut grid = grid(8);
        grid.map_mut().fill(4.2);
        grid.demean_map();
        let mut ps = PowerSpectrum::new(&grid, None).unwrap();
        ps.compute(&grid);
        assert!(ps.values.iter().all(|p| p.abs() < 1e-20));
        assert!(ps.n_modes().iter().sum::<u64>() > 0);
    }

    #[test]
    fn sinusoid_power_lands_in_its_shell() {
        let n = 16;
        let mut grid = grid(n);
        let k0 = 2. * std::f64::consts::PI * 3. / n as f64;
        *grid.map_mut() = Array3::from_shape_fn((n, n, n), |(i, _, _)| (k0 * i as f64).cos());
        let dk = 2. * std::f64::consts::PI / n as f64;
        let shells: Vec<f64> = (0..10).map(|i| (i as f64 + 0.5) * dk).collect();
        let mut ps = PowerSpectrum::new(&grid, Some(&shells)).unwrap();
        ps.compute(&grid);
        let edges = ps.edges().to_vec();
        let target = edges.windows(2).position(|w| w[0] <= k0 && k0 < w[1]).unwrap();
        let (argmax, _) = ps
            .values
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, &p)| if p > best.1 { (i, p) } else { best });
        assert_eq!(argmax, target);
        let total: f64 = izip!(&ps.values, ps.n_modes())
            .map(|(p, &c)| p * c as f64)
            .sum();
        let in_target = ps.values[target] * ps.n_modes()[target] as f64;
        assert_abs_diff_eq!(in_target / total, 1., epsilon = 1e-9);
        // Parseval: each of the two +-k0 modes carries 1/4 of the squared amplitude.
        assert_abs_diff_eq!(in_target, 2. * 0.25 * grid.volume(), epsilon = 1e-6);
    }

    #[test]
    fn auto_k_edges_cover_the_grid() {
        let grid = grid(10);
        let ps = PowerSpectrum::new(&grid, None).unwrap();
        let dk = 2. * std::f64::consts::PI / 10.;
        // Shells centred on dk .. 5dk, the last one holding the Nyquist modes.
        assert_eq!(ps.edges().len(), 6);
        assert_abs_diff_eq!(ps.edges()[0], dk / 2., epsilon = 1e-12);
        assert_abs_diff_eq!(ps.k()[0], dk, epsilon = 1e-12);
        assert!(ps.n_modes().iter().all(|&count| count > 0));
        assert_eq!(ps.n_modes()[0], 6 + 12);
    }

    #[test]
    fn auto_k_edges_of_two_voxel_axes() {
        let grid = grid(2);
        let ps = PowerSpectrum::new(&grid, None).unwrap();
        let pi = std::f64::consts::PI;
        assert_eq!(ps.edges().len(), 2);
        assert_abs_diff_eq!(ps.edges()[0], pi / 2., epsilon = 1e-12);
        // Axis and face-diagonal modes; the body diagonal lies above 1.5 pi.
        assert_eq!(ps.n_modes(), &[6]);

        // The finest spacing wins when axes differ.
        let mixed = Grid::new(&ExperimentSettings {
            x: linspace(0., 2., 3),
            ..ExperimentSettings::cube(8, 1.)
        })
        .unwrap();
        let ps = PowerSpectrum::new(&mixed, None).unwrap();
        assert_abs_diff_eq!(ps.k()[0], 2. * pi / 8., epsilon = 1e-12);
        assert!(ps.n_modes().iter().all(|&count| count > 0));
    }

    #[test]
    fn merging_empty_shells() {
        assert_eq!(
            merge_empty_shells(&[0., 1., 2., 3., 4.], &[0, 2, 0, 0]),
            vec![0., 2.]
        );
        assert_eq!(
            merge_empty_shells(&[0., 1., 2., 3.], &[1, 0, 3]),
            vec![0., 1., 3.]
        );
        assert_eq!(merge_empty_shells(&[0., 1.], &[0]), vec![0.]);
    }

    #[test]
    fn empty_shells_keep_zero() {
        let mut grid = grid(4);
        grid.map_mut()[[1, 2, 3]] = 1.;
        let mut ps = PowerSpectrum::new(&grid, Some(&[0., 1e-3, 2e-3, 100.])).unwrap();
        ps.compute(&grid);
        assert_eq!(&ps.n_modes()[..2], &[0, 0]);
        assert_eq!(&ps.values[..2], &[0., 0.]);
        assert!(ps.values[2] > 0.);
    }

    #[test]
    fn vid_auto_edges() {
        let mut grid = grid(3);
        *grid.map_mut() = Array3::from_shape_fn((3, 3, 3), |(i, j, k)| (i + j + k) as f64);
        let mut vid = VoxelIntensityDistribution::new(None).unwrap();
        vid.compute(&grid).unwrap();
        // max = 6: 7 edges over [0, 6].
        assert_eq!(vid.edges().unwrap().len(), 7);
        assert_eq!(vid.values.iter().sum::<f64>(), 27.);
        assert_eq!(vid.values[0], 1.);
    }

    #[test]
    fn vid_degenerate_binning_is_an_error() {
        let mut grid = grid(3);
        grid.map_mut().fill(-2.);
        let mut vid = VoxelIntensityDistribution::new(None).unwrap();
        let err = vid.compute(&grid).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, ObservableError::DegenerateBinning { observable: "vid", .. }));
        assert!(vid.edges().is_none());

        grid.map_mut().fill(5.);
        assert!(vid.compute(&grid).is_err());

        assert!(VoxelIntensityDistribution::new(Some(&[1., 1.])).is_err());
        assert!(VoxelIntensityDistribution::new(Some(&[])).is_err());
        assert!(PowerSpectrum::new(&grid, Some(&[0.3, 0.2])).is_err());
    }

    #[test]
    fn vid_huge_maximum_is_rejected_without_allocating() {
        let mut grid = grid(3);
        grid.map_mut()[[1, 1, 1]] = 1e19;
        let mut vid = VoxelIntensityDistribution::new(None).unwrap();
        let err = vid.compute(&grid).unwrap_err();
        assert!(err.is_recoverable());
        assert!(vid.edges().is_none());

        grid.map_mut()[[1, 1, 1]] = MAX_AUTO_INTENSITY_BINS as f64 - 1.;
        vid.compute(&grid).unwrap();
        assert_eq!(vid.edges().unwrap().len(), MAX_AUTO_INTENSITY_BINS);
    }

    #[test]
    fn vid_data_needs_fixed_edges() {
        let mut grid = grid(3);
        let mut obs = Observable::VoxelIntensityDistribution(
            VoxelIntensityDistribution::new(None).unwrap(),
        );
        assert_eq!(
            obs.set_data(vec![1., 2., 3.]),
            Err(ObservableError::UnknownBinning { observable: "vid" })
        );
        assert!(obs.data().is_none());

        *grid.map_mut() = Array3::from_shape_fn((3, 3, 3), |(i, j, k)| (i + j + k) as f64);
        obs.compute(&grid).unwrap();
        assert!(matches!(
            obs.set_data(vec![1., 2., 3.]),
            Err(ObservableError::WrongDataLength { expected: 6, .. })
        ));
        obs.set_data(vec![1.; 6]).unwrap();
    }

    #[test]
    fn accumulation_protocol() {
        let mut grid = grid(4);
        let mut obs = Observable::VoxelIntensityDistribution(
            VoxelIntensityDistribution::new(Some(&[-1., 0.5, 2.])).unwrap(),
        );
        obs.reset();
        grid.map_mut().fill(0.);
        obs.compute(&grid).unwrap();
        obs.add_to_running_sum();
        grid.map_mut().fill(1.);
        obs.compute(&grid).unwrap();
        obs.add_to_running_sum();
        obs.finalize_mean(2);
        assert_eq!(obs.n_accumulated(), 2);
        assert_eq!(obs.mean(), &[32., 32.]);
        assert_eq!(obs.independent_var(), &[32., 32.]);

        obs.reset();
        assert!(obs.mean().is_empty());
        assert_eq!(obs.n_accumulated(), 0);
    }

    #[test]
    fn data_length_checked() {
        let grid = grid(4);
        let mut obs = Observable::new(ObservableKind::PowerSpectrum, &grid, &McmcSettings {
            ps_kbins: None,
            ..Default::default()
        })
        .unwrap();
        let n = obs.centers().len();
        assert!(obs.set_data(vec![0.; n + 1]).is_err());
        obs.set_data(vec![1.; n]).unwrap();
        assert_eq!(obs.data().unwrap().len(), n);
    }

    proptest! {
        #[test]
        fn vid_is_complete(values in prop::collection::vec(-5f64..5f64, 27)) {
            let mut grid = grid(3);
            *grid.map_mut() = Array3::from_shape_vec((3, 3, 3), values).unwrap();
            let mut vid = VoxelIntensityDistribution::new(Some(&linspace(-5., 5., 9))).unwrap();
            vid.compute(&grid).unwrap();
            prop_assert_eq!(vid.values.iter().sum::<f64>(), 27.);
        }
    }
}
