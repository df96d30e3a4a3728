use crate::core::fitting::{ResidualModel, SpectralFitter};
use crate::core::fourier::projection_spectrum;
use crate::core::optimize::{MinimizeOptions, Solver};
use crate::core::reconstruct::{validate_weight, PhaseReconstructor};
use crate::core::reduction::ImageReducer;
use crate::types::{
    BadPixelSet, DpcError, DpcResult, FitResult, GradientMap, Image, RegionOfInterest, Spectrum,
};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::Arc;

/// hc in keV·µm
const KEV_MICRON: f64 = 12.4e-4;

/// X-ray wavelength in µm for a photon energy in keV
pub fn wavelength_from_energy(energy_kev: f64) -> f64 {
    KEV_MICRON / energy_kev
}

/// DPC run parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpcParams {
    /// Starting (amplitude, phase gradient) for every fit
    pub start_point: [f64; 2],
    /// Detector pixel size (x, y) in µm
    pub pixel_size: (f64, f64),
    /// Focus to detector distance in µm
    pub focus_to_detector: f64,
    /// Scan step in x (µm)
    pub dx: f64,
    /// Scan step in y (µm)
    pub dy: f64,
    /// Photon energy in keV
    pub energy: f64,
    /// Zero-padding factor for the reconstruction
    pub padding: usize,
    /// Trust in the y gradient, `1 - weight` in the x gradient
    pub weight: f64,
    pub solver: Solver,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub roi: Option<RegionOfInterest>,
    pub bad_pixels: Option<BadPixelSet>,
    /// Negate the x gradient before reconstruction
    pub invert: bool,
    /// Convert fitted gradients to physical units
    pub scale: bool,
}

impl Default for DpcParams {
    fn default() -> Self {
        let fit = MinimizeOptions::default();
        Self {
            start_point: [1.0, 0.0],
            pixel_size: (55.0, 55.0),     // 55 µm pixel detector
            focus_to_detector: 1.46e6,    // 1.46 m
            dx: 0.1,
            dy: 0.1,
            energy: 19.5,
            padding: 0,
            weight: 0.5,
            solver: Solver::default(),
            tolerance: fit.tolerance,
            max_iterations: fit.max_iterations,
            roi: None,
            bad_pixels: None,
            invert: true,
            scale: true,
        }
    }
}

impl DpcParams {
    /// Check the parameters before any image is read
    pub fn validate(&self) -> DpcResult<()> {
        validate_weight(self.weight)?;

        if self.scale && self.pixel_size.0 != self.pixel_size.1 {
            return Err(DpcError::InvalidConfiguration(format!(
                "Scaling requires square detector pixels, got {} x {}",
                self.pixel_size.0, self.pixel_size.1
            )));
        }

        Ok(())
    }

    pub fn minimize_options(&self) -> MinimizeOptions {
        MinimizeOptions {
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
        }
    }
}

/// Per-axis fit maps over the scan grid, before scaling or inversion
#[derive(Debug, Clone)]
pub struct GradientMaps {
    pub gx: GradientMap,
    pub gy: GradientMap,
    pub ax: GradientMap,
    pub ay: GradientMap,
    /// Reference spectrum lengths along x and y
    pub spectrum_lengths: (usize, usize),
}

impl GradientMaps {
    fn zeros(rows: usize, cols: usize, spectrum_lengths: (usize, usize)) -> Self {
        Self {
            gx: Array2::zeros((rows, cols)),
            gy: Array2::zeros((rows, cols)),
            ax: Array2::zeros((rows, cols)),
            ay: Array2::zeros((rows, cols)),
            spectrum_lengths,
        }
    }

    fn store(&mut self, i: usize, j: usize, x: FitResult, y: FitResult) {
        self.gx[[i, j]] = x.phase_gradient;
        self.gy[[i, j]] = y.phase_gradient;
        self.ax[[i, j]] = x.amplitude;
        self.ay[[i, j]] = y.amplitude;
    }
}

/// Final DPC products
#[derive(Debug, Clone)]
pub struct DpcOutput {
    pub phase: Image,
    /// Mean of the x and y amplitude estimates
    pub amplitude: GradientMap,
}

/// Reference spectrum for one axis with its residual model
struct AxisReference {
    spectrum: Spectrum,
    model: Arc<ResidualModel>,
}

/// Runs the full DPC pipeline over a scan
pub struct PhaseGradientScanner {
    params: DpcParams,
    reducer: ImageReducer,
    fitter: SpectralFitter,
}

impl PhaseGradientScanner {
    pub fn new(params: DpcParams) -> DpcResult<Self> {
        params.validate()?;

        let reducer = ImageReducer::with_mask(params.roi, params.bad_pixels.clone());
        let fitter = SpectralFitter::new(params.solver, params.minimize_options());

        Ok(Self {
            params,
            reducer,
            fitter,
        })
    }

    pub fn params(&self) -> &DpcParams {
        &self.params
    }

    /// Number of residual models built so far (one per distinct spectrum length)
    pub fn cached_models(&self) -> usize {
        self.fitter.cached_models()
    }

    /// Fit every scan position and assemble the raw gradient and amplitude maps.
    ///
    /// Exactly `rows * cols` images are pulled from `images`, in row-major scan
    /// order.
    pub fn scan_gradients<I>(
        &mut self,
        reference: ArrayView2<f64>,
        images: I,
        rows: usize,
        cols: usize,
    ) -> DpcResult<GradientMaps>
    where
        I: IntoIterator<Item = Image>,
    {
        let positions = rows.checked_mul(cols).filter(|&n| n > 0).ok_or_else(|| {
            DpcError::InvalidConfiguration(format!("Invalid scan grid {}x{}", rows, cols))
        })?;

        log::info!(
            "Fitting {}x{} scan positions with {} (tol {:e}, max {} iterations)",
            rows,
            cols,
            self.params.solver,
            self.params.tolerance,
            self.params.max_iterations
        );

        let (ref_x, ref_y) = self.reducer.reduce(reference)?;
        let x_ref = AxisReference {
            spectrum: projection_spectrum(ref_x.view()),
            model: self.fitter.residual_model(ref_x.len()),
        };
        let y_ref = AxisReference {
            spectrum: projection_spectrum(ref_y.view()),
            model: self.fitter.residual_model(ref_y.len()),
        };
        log::debug!("Reference spectra: x {} samples, y {} samples", ref_x.len(), ref_y.len());

        let mut maps = GradientMaps::zeros(rows, cols, (ref_x.len(), ref_y.len()));
        let mut source = images.into_iter().take(positions).enumerate();
        let batch_size = Self::batch_size();
        let mut consumed = 0;

        loop {
            let batch: Vec<(usize, Image)> = source.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            consumed += batch.len();

            for (i, j, x_fit, y_fit) in self.fit_batch(batch, &x_ref, &y_ref, cols)? {
                maps.store(i, j, x_fit, y_fit);
            }
            log::debug!("Fitted {}/{} scan positions", consumed, positions);
        }

        if consumed < positions {
            return Err(DpcError::InvalidConfiguration(format!(
                "Image sequence ended after {} of {} scan positions",
                consumed, positions
            )));
        }

        Ok(maps)
    }

    /// Run the full pipeline: fit, scale, invert, then integrate the gradients
    pub fn run<I>(
        &mut self,
        reference: ArrayView2<f64>,
        images: I,
        rows: usize,
        cols: usize,
    ) -> DpcResult<DpcOutput>
    where
        I: IntoIterator<Item = Image>,
    {
        let mut maps = self.scan_gradients(reference, images, rows, cols)?;

        if self.params.scale {
            let lambda = wavelength_from_energy(self.params.energy);
            let pixel = self.params.pixel_size.0;
            let (len_x, len_y) = maps.spectrum_lengths;
            let factor = pixel / (lambda * self.params.focus_to_detector);
            log::debug!("Scaling gradients (wavelength {:.4e} µm)", lambda);
            maps.gx *= len_x as f64 * factor;
            maps.gy *= len_y as f64 * factor;
        }

        if self.params.invert {
            maps.gx.mapv_inplace(|v| -v);
        }

        let reconstructor = PhaseReconstructor::new(self.params.padding, self.params.weight)?;
        let phase = reconstructor.reconstruct(
            maps.gx.view(),
            maps.gy.view(),
            self.params.dx,
            self.params.dy,
        )?;
        let amplitude = (&maps.ax + &maps.ay) / 2.0;

        log::info!("DPC reconstruction complete: {}x{} phase image", rows, cols);

        Ok(DpcOutput { phase, amplitude })
    }

    /// Reduce one diffraction pattern and fit both axes
    fn fit_position(
        &self,
        index: usize,
        image: &Image,
        x_ref: &AxisReference,
        y_ref: &AxisReference,
    ) -> DpcResult<(FitResult, FitResult)> {
        let (line_x, line_y) = self.reducer.reduce(image.view())?;

        if line_x.len() != x_ref.spectrum.len() || line_y.len() != y_ref.spectrum.len() {
            return Err(DpcError::ShapeMismatch(format!(
                "Scan position {} reduces to {}x{} projections, reference has {}x{}",
                index,
                line_x.len(),
                line_y.len(),
                x_ref.spectrum.len(),
                y_ref.spectrum.len()
            )));
        }

        let fx = projection_spectrum(line_x.view());
        let fy = projection_spectrum(line_y.view());
        let start = self.params.start_point;

        let x_fit = self.fitter.fit(&x_ref.model, &x_ref.spectrum, &fx, start)?;
        let y_fit = self.fitter.fit(&y_ref.model, &y_ref.spectrum, &fy, start)?;
        Ok((x_fit, y_fit))
    }

    #[cfg(feature = "parallel")]
    fn batch_size() -> usize {
        rayon::current_num_threads() * 4
    }

    #[cfg(not(feature = "parallel"))]
    fn batch_size() -> usize {
        1
    }

    /// Fit a batch of scan positions in parallel using Rayon
    #[cfg(feature = "parallel")]
    fn fit_batch(
        &self,
        batch: Vec<(usize, Image)>,
        x_ref: &AxisReference,
        y_ref: &AxisReference,
        cols: usize,
    ) -> DpcResult<Vec<(usize, usize, FitResult, FitResult)>> {
        use rayon::prelude::*;

        batch
            .into_par_iter()
            .map(|(index, image)| {
                let (x_fit, y_fit) = self.fit_position(index, &image, x_ref, y_ref)?;
                Ok((index / cols, index % cols, x_fit, y_fit))
            })
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn fit_batch(
        &self,
        batch: Vec<(usize, Image)>,
        x_ref: &AxisReference,
        y_ref: &AxisReference,
        cols: usize,
    ) -> DpcResult<Vec<(usize, usize, FitResult, FitResult)>> {
        batch
            .into_iter()
            .map(|(index, image)| {
                let (x_fit, y_fit) = self.fit_position(index, &image, x_ref, y_ref)?;
                Ok((index / cols, index % cols, x_fit, y_fit))
            })
            .collect()
    }
}

/// Lazily unwrap a fallible frame source.
///
/// Yields frames until the first `Err`, which is parked in `failure` and ends
/// the sequence. Nothing is pulled ahead of the scanner.
pub fn frames_until_error<'a, I, E>(
    frames: I,
    failure: &'a Cell<Option<E>>,
) -> impl Iterator<Item = Image> + 'a
where
    I: IntoIterator<Item = Result<Image, E>>,
    I::IntoIter: 'a,
{
    frames.into_iter().map_while(move |frame| match frame {
        Ok(image) => Some(image),
        Err(err) => {
            failure.set(Some(err));
            None
        }
    })
}

/// Run a complete DPC calculation over `rows x cols` scan positions
pub fn dpc_runner<I>(
    reference: ArrayView2<f64>,
    images: I,
    rows: usize,
    cols: usize,
    params: DpcParams,
) -> DpcResult<DpcOutput>
where
    I: IntoIterator<Item = Image>,
{
    PhaseGradientScanner::new(params)?.run(reference, images, rows, cols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::cell::Cell;

    fn unscaled() -> DpcParams {
        DpcParams {
            scale: false,
            invert: false,
            ..DpcParams::default()
        }
    }

    fn spot(rows: usize, cols: usize) -> Image {
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let dr = r as f64 - rows as f64 / 2.0;
            let dc = c as f64 - cols as f64 / 2.0;
            (-(dr * dr + dc * dc) / 4.0).exp()
        })
    }

    #[test]
    fn test_wavelength() {
        assert_relative_eq!(wavelength_from_energy(12.4), 1e-4, epsilon = 1e-15);
    }

    #[test]
    fn test_identical_frame_gives_flat_result() {
        let reference = spot(4, 4);
        let output = dpc_runner(reference.view(), vec![reference.clone()], 1, 1, unscaled()).unwrap();

        assert_eq!(output.phase.dim(), (1, 1));
        assert_relative_eq!(output.phase[[0, 0]], 0.0, epsilon = 1e-12);
        assert_relative_eq!(output.amplitude[[0, 0]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_identical_frames_fit_unit_amplitude_zero_gradient() {
        let reference = spot(4, 4);
        let mut scanner = PhaseGradientScanner::new(unscaled()).unwrap();
        let maps = scanner
            .scan_gradients(reference.view(), vec![reference.clone(); 4], 2, 2)
            .unwrap();

        for map in [&maps.gx, &maps.gy] {
            assert!(map.iter().all(|v| v.abs() < 1e-6));
        }
        for map in [&maps.ax, &maps.ay] {
            assert!(map.iter().all(|v| (v - 1.0).abs() < 1e-6));
        }
        assert_eq!(maps.spectrum_lengths, (4, 4));
    }

    #[test]
    fn test_consumes_exactly_scan_size() {
        let reference = spot(5, 5);
        let pulled = Cell::new(0usize);
        let images = std::iter::repeat_with(|| {
            pulled.set(pulled.get() + 1);
            reference.clone()
        });

        dpc_runner(reference.view(), images, 2, 3, unscaled()).unwrap();
        assert_eq!(pulled.get(), 6);
    }

    #[test]
    fn test_short_sequence_rejected() {
        let reference = spot(4, 4);
        let result = dpc_runner(reference.view(), vec![reference.clone(); 3], 2, 2, unscaled());
        assert!(matches!(result, Err(DpcError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_mismatched_frame_rejected() {
        let reference = spot(4, 4);
        let result = dpc_runner(reference.view(), vec![spot(4, 5)], 1, 1, unscaled());
        assert!(matches!(result, Err(DpcError::ShapeMismatch(_))));
    }

    #[test]
    fn test_non_square_pixels_rejected_when_scaling() {
        let params = DpcParams {
            pixel_size: (55.0, 75.0),
            ..DpcParams::default()
        };
        assert!(matches!(
            PhaseGradientScanner::new(params.clone()),
            Err(DpcError::InvalidConfiguration(_))
        ));

        let unscaled = DpcParams {
            scale: false,
            ..params
        };
        assert!(PhaseGradientScanner::new(unscaled).is_ok());
    }

    #[test]
    fn test_weight_checked_before_images_pulled() {
        let reference = spot(4, 4);
        let pulled = Cell::new(0usize);
        let images = std::iter::repeat_with(|| {
            pulled.set(pulled.get() + 1);
            reference.clone()
        });
        let params = DpcParams {
            weight: 1.2,
            ..unscaled()
        };

        let result = dpc_runner(reference.view(), images, 2, 2, params);
        assert!(matches!(result, Err(DpcError::InvalidConfiguration(_))));
        assert_eq!(pulled.get(), 0);
    }

    #[test]
    fn test_fallible_frames_pulled_lazily() {
        let reference = spot(5, 5);
        let pulled = Cell::new(0usize);
        let images = std::iter::repeat_with(|| {
            pulled.set(pulled.get() + 1);
            Ok::<Image, String>(reference.clone())
        });
        let failure = Cell::new(None);

        dpc_runner(reference.view(), frames_until_error(images, &failure), 2, 2, unscaled())
            .unwrap();
        assert_eq!(pulled.get(), 4);
        assert!(failure.take().is_none());
    }

    #[test]
    fn test_failed_frame_stops_scan() {
        let reference = spot(4, 4);
        let pulled = Cell::new(0usize);
        let images = std::iter::repeat_with(|| {
            pulled.set(pulled.get() + 1);
            if pulled.get() == 3 {
                Err("frame 3 unreadable".to_string())
            } else {
                Ok(reference.clone())
            }
        });
        let failure = Cell::new(None);

        let result =
            dpc_runner(reference.view(), frames_until_error(images, &failure), 2, 2, unscaled());
        assert!(matches!(result, Err(DpcError::InvalidConfiguration(_))));
        assert_eq!(pulled.get(), 3);
        assert_eq!(failure.take().as_deref(), Some("frame 3 unreadable"));
    }

    #[test]
    fn test_models_built_once_per_length() {
        let reference = spot(6, 6);
        let mut scanner = PhaseGradientScanner::new(unscaled()).unwrap();
        scanner
            .scan_gradients(reference.view(), vec![reference.clone(); 4], 2, 2)
            .unwrap();
        // square frame: both axes share one model
        assert_eq!(scanner.cached_models(), 1);
    }
}
