//! Numeric helpers shared by the grid, the models and the observables.

use ndarray::{Array1, Array3, Axis};
use rustfft::{num_complex::Complex64, FftDirection, FftPlanner};

/// Sample frequencies of a discrete Fourier transform of length `n` with
/// sample spacing `d`, in the usual unshifted order
/// `[0, 1, ..., n/2 - 1, -n/2, ..., -1] / (d * n)`.
pub(crate) fn fftfreq(n: usize, d: f64) -> Vec<f64> {
    let scale = 1. / (d * n as f64);
    let positive = (n - 1) / 2 + 1;
    (0..n)
        .map(|i| {
            if i < positive {
                i as f64 * scale
            } else {
                -((n - i) as f64) * scale
            }
        })
        .collect()
}

/// Moves the zero-frequency entry to the centre of the spectrum.
pub(crate) fn fftshift(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.rotate_right(values.len() / 2);
    out
}

/// `num` evenly spaced values over `[start, stop]`, both ends included.
/// The last value is exactly `stop`, so it can close a histogram.
pub(crate) fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    let mut out = Array1::linspace(start, stop, num).to_vec();
    if num > 1 {
        out[num - 1] = stop;
    }
    out
}

/// True if the edges describe at least one bin and are finite and strictly
/// increasing.
pub(crate) fn valid_edges(edges: &[f64]) -> bool {
    edges.len() >= 2
        && edges.iter().all(|e| e.is_finite())
        && edges.windows(2).all(|w| w[0] < w[1])
}

/// Bin index of `value`, with half-open bins `[e_i, e_{i+1})` except for the
/// last one which also includes its right edge. Values outside the edges
/// (and NaN) fall in no bin.
#[inline]
pub(crate) fn bin_index(edges: &[f64], value: f64) -> Option<usize> {
    let n_bins = edges.len().checked_sub(1)?;
    if n_bins == 0 || !(value >= edges[0]) || !(value <= edges[n_bins]) {
        return None;
    }
    if value == edges[n_bins] {
        return Some(n_bins - 1);
    }
    Some(edges.partition_point(|&e| e <= value) - 1)
}

/// Weighted histogram. Returns `(weight sums, counts)` per bin.
pub(crate) fn histogram<I>(samples: I, edges: &[f64]) -> (Vec<f64>, Vec<u64>)
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let n_bins = edges.len().saturating_sub(1);
    let mut sums = vec![0f64; n_bins];
    let mut counts = vec![0u64; n_bins];
    for (value, weight) in samples {
        if let Some(idx) = bin_index(edges, value) {
            sums[idx] += weight;
            counts[idx] += 1;
        }
    }
    (sums, counts)
}

pub(crate) fn bin_centers(edges: &[f64]) -> Vec<f64> {
    edges.windows(2).map(|w| (w[0] + w[1]) / 2.).collect()
}

/// Unnormalized forward (or inverse) 3D DFT, computed in place one axis at a
/// time.
pub(crate) fn fft3_in_place(data: &mut Array3<Complex64>, direction: FftDirection) {
    let mut planner = FftPlanner::<f64>::new();
    for axis in 0..3 {
        let len = data.len_of(Axis(axis));
        if len < 2 {
            continue;
        }
        let fft = planner.plan_fft(len, direction);
        let mut buffer = vec![Complex64::new(0., 0.); len];
        let mut scratch = vec![Complex64::new(0., 0.); fft.get_inplace_scratch_len()];
        for mut lane in data.lanes_mut(Axis(axis)) {
            buffer
                .iter_mut()
                .zip(lane.iter())
                .for_each(|(b, &v)| *b = v);
            fft.process_with_scratch(&mut buffer, &mut scratch);
            lane.iter_mut()
                .zip(buffer.iter())
                .for_each(|(v, &b)| *v = b);
        }
    }
}

pub(crate) fn fft3(map: &Array3<f64>) -> Array3<Complex64> {
    let mut out = map.mapv(|v| Complex64::new(v, 0.));
    fft3_in_place(&mut out, FftDirection::Forward);
    out
}

/// Real part of the normalized inverse 3D DFT.
pub(crate) fn ifft3_real(mut spectrum: Array3<Complex64>) -> Array3<f64> {
    let n = spectrum.len() as f64;
    fft3_in_place(&mut spectrum, FftDirection::Inverse);
    spectrum.mapv(|c| c.re / n)
}

/// Normalized 1D Gaussian kernel truncated at `n_sigma` standard deviations.
/// The half width is `floor(n_sigma * sigma)` voxels. A non-positive width
/// gives the identity kernel.
pub(crate) fn gaussian_kernel(sigma: f64, n_sigma: f64) -> Vec<f64> {
    if !(sigma > 0.) {
        return vec![1.];
    }
    let half = (n_sigma * sigma).floor() as i64;
    let weights: Vec<f64> = (-half..=half)
        .map(|i| {
            let x = i as f64;
            (-(x * x) / (2. * sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Zero-padded convolution along one axis keeping the input shape. `kernel`
/// must have odd length and is centred on each output voxel.
pub(crate) fn convolve_axis_same(map: &Array3<f64>, kernel: &[f64], axis: usize) -> Array3<f64> {
    if kernel.len() <= 1 {
        let scale = kernel.first().copied().unwrap_or(1.);
        return map.mapv(|v| v * scale);
    }
    let half = (kernel.len() / 2) as isize;
    let mut out = Array3::<f64>::zeros(map.raw_dim());
    for (lane_in, mut lane_out) in map
        .lanes(Axis(axis))
        .into_iter()
        .zip(out.lanes_mut(Axis(axis)))
    {
        let n = lane_in.len() as isize;
        for i in 0..n {
            let mut acc = 0.;
            for (k, &w) in kernel.iter().enumerate() {
                let j = i + k as isize - half;
                if (0..n).contains(&j) {
                    acc += w * lane_in[j as usize];
                }
            }
            lane_out[i as usize] = acc;
        }
    }
    out
}
