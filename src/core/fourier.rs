//! Discrete Fourier helpers on ndarray arrays.
//!
//! Conventions follow the usual numerical-Python layout: forward transforms are
//! unnormalised, inverse transforms carry the `1/N` factor, and `fftshift`
//! moves the zero-frequency bin from index 0 to index `n / 2`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_complex::Complex64;
use num_traits::Zero;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

/// Inverse 1D transform of a real sequence, normalised by `1/N`
pub fn ifft_real(input: ArrayView1<f64>) -> Array1<Complex64> {
    let n = input.len();
    if n == 0 {
        return Array1::zeros(0);
    }

    let mut buffer: Vec<Complex64> = input.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_inverse(n).process(&mut buffer);

    let norm = 1.0 / n as f64;
    Array1::from_iter(buffer.into_iter().map(|v| v * norm))
}

/// Forward 2D transform (rows then columns), unnormalised
pub fn fft2(input: ArrayView2<Complex64>) -> Array2<Complex64> {
    transform_2d(input, FftDirection::Forward)
}

/// Inverse 2D transform, normalised by `1/(rows*cols)`
pub fn ifft2(input: ArrayView2<Complex64>) -> Array2<Complex64> {
    let mut out = transform_2d(input, FftDirection::Inverse);
    let count = out.len();
    if count > 0 {
        let norm = 1.0 / count as f64;
        out.mapv_inplace(|v| v * norm);
    }
    out
}

fn transform_2d(input: ArrayView2<Complex64>, direction: FftDirection) -> Array2<Complex64> {
    let (rows, cols) = input.dim();
    let mut data = input.to_owned();
    if rows == 0 || cols == 0 {
        return data;
    }

    let mut planner = FftPlanner::<f64>::new();
    let row_fft = planner.plan_fft(cols, direction);
    let col_fft = planner.plan_fft(rows, direction);

    transform_lanes(&mut data, Axis(1), &row_fft);
    transform_lanes(&mut data, Axis(0), &col_fft);

    data
}

/// Apply `fft` to every lane of `data` running along `axis`
fn transform_lanes(data: &mut Array2<Complex64>, axis: Axis, fft: &Arc<dyn Fft<f64>>) {
    let mut buffer = vec![Complex64::zero(); data.len_of(axis)];

    for mut lane in data.lanes_mut(axis) {
        for (b, v) in buffer.iter_mut().zip(lane.iter()) {
            *b = *v;
        }
        fft.process(&mut buffer);
        for (v, b) in lane.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }
}

/// Move the zero-frequency bin to the centre (`n / 2`)
pub fn fftshift<T: Clone>(input: ArrayView1<T>) -> Array1<T> {
    let n = input.len();
    Array1::from_shape_fn(n, |k| input[(k + n - n / 2) % n].clone())
}

/// Undo [`fftshift`]
pub fn ifftshift<T: Clone>(input: ArrayView1<T>) -> Array1<T> {
    let n = input.len();
    Array1::from_shape_fn(n, |k| input[(k + n / 2) % n].clone())
}

/// [`fftshift`] along both axes
pub fn fftshift2<T: Clone>(input: ArrayView2<T>) -> Array2<T> {
    let (rows, cols) = input.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        input[[(i + rows - rows / 2) % rows, (j + cols - cols / 2) % cols]].clone()
    })
}

/// [`ifftshift`] along both axes
pub fn ifftshift2<T: Clone>(input: ArrayView2<T>) -> Array2<T> {
    let (rows, cols) = input.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        input[[(i + rows / 2) % rows, (j + cols / 2) % cols]].clone()
    })
}

/// Integer frequency indices in shifted order: `-(n/2) ..= n - n/2 - 1`
pub fn centered_frequencies(n: usize) -> Array1<f64> {
    let half = (n / 2) as f64;
    Array1::from_shape_fn(n, |k| k as f64 - half)
}

/// Shifted inverse spectrum of a projection
pub fn projection_spectrum(projection: ArrayView1<f64>) -> Array1<Complex64> {
    fftshift(ifft_real(projection).view())
}
