use crate::core::fourier::{centered_frequencies, fft2, fftshift2, ifft2, ifftshift2};
use crate::types::{DpcError, DpcResult, GradientMap, Image};
use ndarray::{s, Array2, ArrayView2, Zip};
use num_complex::Complex64;
use num_traits::Zero;
use std::f64::consts::PI;

/// Check the x/y weighting factor lies in `[0, 1]`
pub(crate) fn validate_weight(weight: f64) -> DpcResult<()> {
    if (0.0..=1.0).contains(&weight) {
        Ok(())
    } else {
        Err(DpcError::InvalidConfiguration(format!(
            "Weighting factor w = {} must lie within [0, 1]",
            weight
        )))
    }
}

/// Integrates two gradient maps into a phase image by a weighted
/// least-squares solve in the Fourier domain
#[derive(Debug, Clone, Copy)]
pub struct PhaseReconstructor {
    padding: usize,
    weight: f64,
}

impl PhaseReconstructor {
    /// `padding` adds `padding` copies of the map size of zeros on every side;
    /// `weight` is the trust placed in the y gradient (x gets `1 - weight`)
    pub fn new(padding: usize, weight: f64) -> DpcResult<Self> {
        validate_weight(weight)?;
        Ok(Self { padding, weight })
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Reconstruct the phase from `gx`, `gy` sampled at steps `dx`, `dy`.
    ///
    /// The zero-frequency term is undetermined and set to zero, so the result
    /// is defined up to an additive constant.
    pub fn reconstruct(
        &self,
        gx: ArrayView2<f64>,
        gy: ArrayView2<f64>,
        dx: f64,
        dy: f64,
    ) -> DpcResult<Image> {
        if gx.dim() != gy.dim() {
            return Err(DpcError::ShapeMismatch(format!(
                "Gradient maps differ in shape: gx {:?}, gy {:?}",
                gx.dim(),
                gy.dim()
            )));
        }

        let (rows, cols) = gx.dim();
        if rows == 0 || cols == 0 {
            return Err(DpcError::InvalidConfiguration(
                "Cannot reconstruct an empty gradient map".to_string(),
            ));
        }

        let pad = 2 * self.padding + 1;
        let (pad_rows, pad_cols) = (rows * pad, cols * pad);
        let (row0, col0) = (self.padding * rows, self.padding * cols);

        log::debug!(
            "Reconstructing {}x{} phase on a {}x{} padded grid (w = {})",
            rows,
            cols,
            pad_rows,
            pad_cols,
            self.weight
        );

        let mut gx_padded = Array2::<Complex64>::zeros((pad_rows, pad_cols));
        let mut gy_padded = Array2::<Complex64>::zeros((pad_rows, pad_cols));
        gx_padded
            .slice_mut(s![row0..row0 + rows, col0..col0 + cols])
            .zip_mut_with(&gx, |out, &v| *out = Complex64::new(v, 0.0));
        gy_padded
            .slice_mut(s![row0..row0 + rows, col0..col0 + cols])
            .zip_mut_with(&gy, |out, &v| *out = Complex64::new(v, 0.0));

        let tx = fftshift2(fft2(gx_padded.view()).view());
        let ty = fftshift2(fft2(gy_padded.view()).view());

        let kappa_x = centered_frequencies(pad_cols) * (2.0 * PI / (pad_cols as f64 * dx));
        let kappa_y = centered_frequencies(pad_rows) * (2.0 * PI / (pad_rows as f64 * dy));

        let wx = 1.0 - self.weight;
        let wy = self.weight;
        let minus_i = Complex64::new(0.0, -1.0);

        let mut combined = Array2::<Complex64>::zeros((pad_rows, pad_cols));
        Zip::indexed(&mut combined)
            .and(&tx)
            .and(&ty)
            .for_each(|(r, c), out, &tx_v, &ty_v| {
                let kx = kappa_x[c];
                let ky = kappa_y[r];
                let divisor = kx * kx * wx + ky * ky * wy;
                *out = if divisor == 0.0 {
                    Complex64::zero()
                } else {
                    minus_i * (tx_v * (kx * wx) + ty_v * (ky * wy)) / divisor
                };
            });

        let phase = ifft2(ifftshift2(combined.view()).view());
        Ok(phase.slice(s![row0..row0 + rows, col0..col0 + cols]).mapv(|v| v.re))
    }
}

/// Reconstruct a phase image from x/y gradient maps
pub fn recon(
    gx: &GradientMap,
    gy: &GradientMap,
    dx: f64,
    dy: f64,
    padding: usize,
    weight: f64,
) -> DpcResult<Image> {
    PhaseReconstructor::new(padding, weight)?.reconstruct(gx.view(), gy.view(), dx, dy)
}
