use crate::core::optimize::{minimize, MinimizeOptions, Objective, Solver};
use crate::types::{DpcError, DpcResult, FitResult, Spectrum};
use ndarray::{array, Array1};
use num_complex::Complex64;
use std::collections::HashMap;
use std::sync::Arc;

/// Residual of a scaled, linearly phase-ramped reference spectrum.
///
/// The model predicts `target = reference * amplitude * exp(i * gradient * s)`
/// where `s` is the centred frequency support of the spectrum length.
#[derive(Debug, Clone)]
pub struct ResidualModel {
    support: Array1<f64>,
}

impl ResidualModel {
    /// Build the model for spectra of `length` samples
    pub fn new(length: usize) -> Self {
        // integer grid matching the shifted spectrum index: k - floor(L/2)
        let centre = (length / 2) as f64;
        let support = Array1::from_shape_fn(length, |k| k as f64 - centre);
        Self { support }
    }

    pub fn len(&self) -> usize {
        self.support.len()
    }

    pub fn is_empty(&self) -> bool {
        self.support.is_empty()
    }

    /// Real frequency support `s`; the model multiplies it by `i`
    pub fn support(&self) -> &Array1<f64> {
        &self.support
    }

    /// Model spectrum for the given amplitude and phase gradient
    pub fn forward(&self, reference: &Spectrum, amplitude: f64, phase_gradient: f64) -> Spectrum {
        Array1::from_shape_fn(self.len(), |k| {
            reference[k] * amplitude * Complex64::from_polar(1.0, phase_gradient * self.support[k])
        })
    }

    /// Sum of squared magnitudes of `target - model(v)`
    pub fn residual(&self, v: &Array1<f64>, reference: &Spectrum, target: &Spectrum) -> f64 {
        let (amplitude, gradient) = (v[0], v[1]);
        self.support
            .iter()
            .zip(reference.iter().zip(target.iter()))
            .map(|(&s, (&r, &t))| (t - r * amplitude * Complex64::from_polar(1.0, gradient * s)).norm_sqr())
            .sum()
    }

    /// Analytic gradient of [`ResidualModel::residual`] with respect to `v`
    pub fn residual_gradient(
        &self,
        v: &Array1<f64>,
        reference: &Spectrum,
        target: &Spectrum,
    ) -> Array1<f64> {
        let (amplitude, gradient) = (v[0], v[1]);
        let mut d_amplitude = 0.0;
        let mut d_gradient = 0.0;

        for (&s, (&r, &t)) in self.support.iter().zip(reference.iter().zip(target.iter())) {
            let ramped = r * Complex64::from_polar(1.0, gradient * s);
            let diff_conj = (t - ramped * amplitude).conj();
            d_amplitude += (diff_conj * ramped).re;
            d_gradient += (diff_conj * Complex64::new(0.0, s) * ramped).re;
        }

        array![-2.0 * d_amplitude, -2.0 * amplitude * d_gradient]
    }
}

/// Residual models keyed by spectrum length, each built once
#[derive(Debug, Default)]
pub struct ResidualModelCache {
    models: HashMap<usize, Arc<ResidualModel>>,
}

impl ResidualModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared model for `length`, building it on first request
    pub fn get_or_build(&mut self, length: usize) -> Arc<ResidualModel> {
        self.models
            .entry(length)
            .or_insert_with(|| {
                log::debug!("Building residual model for spectrum length {}", length);
                Arc::new(ResidualModel::new(length))
            })
            .clone()
    }

    /// Number of distinct lengths built so far
    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// One fitting problem: a model bound to its reference and target spectra
struct SpectrumPair<'a> {
    model: &'a ResidualModel,
    reference: &'a Spectrum,
    target: &'a Spectrum,
}

impl Objective for SpectrumPair<'_> {
    fn value(&self, x: &Array1<f64>) -> f64 {
        self.model.residual(x, self.reference, self.target)
    }

    fn gradient(&self, x: &Array1<f64>) -> Array1<f64> {
        self.model.residual_gradient(x, self.reference, self.target)
    }
}

/// Fit amplitude and phase gradient of `target` against `reference`.
///
/// Non-convergence is reported as a warning; the solver's final point is
/// returned either way.
pub fn dpc_fit(
    model: &ResidualModel,
    reference: &Spectrum,
    target: &Spectrum,
    start_point: [f64; 2],
    solver: Solver,
    options: &MinimizeOptions,
) -> DpcResult<FitResult> {
    if reference.len() != model.len() || target.len() != model.len() {
        return Err(DpcError::ShapeMismatch(format!(
            "Residual model of length {} cannot fit reference of length {} against target of length {}",
            model.len(),
            reference.len(),
            target.len()
        )));
    }

    let problem = SpectrumPair {
        model,
        reference,
        target,
    };
    let result = minimize(&problem, &array![start_point[0], start_point[1]], solver, options);

    if !result.converged {
        log::warn!(
            "{} fit did not converge after {} iterations (residual {:.3e})",
            solver,
            result.iterations,
            result.fun
        );
    }

    Ok(FitResult {
        amplitude: result.x[0],
        phase_gradient: result.x[1],
    })
}

/// Spectral fitter owning its solver settings and residual model cache
#[derive(Debug)]
pub struct SpectralFitter {
    solver: Solver,
    options: MinimizeOptions,
    cache: ResidualModelCache,
}

impl SpectralFitter {
    pub fn new(solver: Solver, options: MinimizeOptions) -> Self {
        Self {
            solver,
            options,
            cache: ResidualModelCache::new(),
        }
    }

    /// Fitter using Nelder-Mead with default tolerance and iteration limit
    pub fn standard() -> Self {
        Self::new(Solver::default(), MinimizeOptions::default())
    }

    pub fn solver(&self) -> Solver {
        self.solver
    }

    pub fn options(&self) -> &MinimizeOptions {
        &self.options
    }

    /// Residual model for spectra of `length` samples
    pub fn residual_model(&mut self, length: usize) -> Arc<ResidualModel> {
        self.cache.get_or_build(length)
    }

    pub fn cached_models(&self) -> usize {
        self.cache.len()
    }

    /// Fit using this fitter's solver settings
    pub fn fit(
        &self,
        model: &ResidualModel,
        reference: &Spectrum,
        target: &Spectrum,
        start_point: [f64; 2],
    ) -> DpcResult<FitResult> {
        dpc_fit(model, reference, target, start_point, self.solver, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Spectrum of a Gaussian beam profile, concentrated around zero frequency
    fn beam_spectrum(model: &ResidualModel) -> Spectrum {
        model
            .support()
            .mapv(|s| Complex64::from_polar((-s * s / 8.0).exp(), 0.3 * s))
    }

    #[test]
    fn test_support_is_centred() {
        assert_eq!(ResidualModel::new(5).support(), &array![-2.0, -1.0, 0.0, 1.0, 2.0]);
        assert_eq!(ResidualModel::new(4).support(), &array![-2.0, -1.0, 0.0, 1.0]);
        assert_eq!(
            ResidualModel::new(6).support(),
            &crate::core::fourier::centered_frequencies(6)
        );
    }

    #[test]
    fn test_residual_zero_at_truth() {
        let model = ResidualModel::new(9);
        let reference = beam_spectrum(&model);
        let target = model.forward(&reference, 0.7, -0.2);

        assert_relative_eq!(model.residual(&array![0.7, -0.2], &reference, &target), 0.0, epsilon = 1e-24);
        assert!(model.residual(&array![0.8, -0.2], &reference, &target) > 0.0);
    }

    #[test]
    fn test_analytic_gradient_matches_finite_difference() {
        let model = ResidualModel::new(11);
        let reference = beam_spectrum(&model);
        let target = model.forward(&reference, 1.3, 0.15);
        let problem = SpectrumPair {
            model: &model,
            reference: &reference,
            target: &target,
        };

        struct Numeric<'a>(&'a SpectrumPair<'a>);
        impl Objective for Numeric<'_> {
            fn value(&self, x: &Array1<f64>) -> f64 {
                self.0.value(x)
            }
        }

        let point = array![0.9, 0.02];
        let analytic = problem.gradient(&point);
        let numeric = Numeric(&problem).gradient(&point);
        assert_relative_eq!(analytic[0], numeric[0], epsilon = 1e-6, max_relative = 1e-5);
        assert_relative_eq!(analytic[1], numeric[1], epsilon = 1e-6, max_relative = 1e-5);
    }

    #[test]
    fn test_cache_builds_once_per_length() {
        let mut cache = ResidualModelCache::new();
        let a = cache.get_or_build(16);
        let b = cache.get_or_build(16);
        let c = cache.get_or_build(12);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.len(), 12);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_every_solver_recovers_truth_from_truth() {
        let model = ResidualModel::new(15);
        let reference = beam_spectrum(&model);
        let (amplitude, gradient) = (1.2, 0.1);
        let target = model.forward(&reference, amplitude, gradient);

        for solver in Solver::ALL {
            let fit = dpc_fit(
                &model,
                &reference,
                &target,
                [amplitude, gradient],
                solver,
                &MinimizeOptions::default(),
            )
            .unwrap();
            assert!((fit.amplitude - amplitude).abs() < 1e-3, "{}: {:?}", solver, fit);
            assert!((fit.phase_gradient - gradient).abs() < 1e-3, "{}: {:?}", solver, fit);
        }
    }

    #[test]
    fn test_local_solvers_recover_truth_from_nearby_start() {
        let model = ResidualModel::new(15);
        let reference = beam_spectrum(&model);
        let target = model.forward(&reference, 0.8, 0.05);
        let options = MinimizeOptions {
            tolerance: 1e-10,
            max_iterations: 2000,
        };

        for solver in [
            Solver::NelderMead,
            Solver::Powell,
            Solver::ConjugateGradient,
            Solver::Bfgs,
            Solver::LBfgsB,
            Solver::Slsqp,
        ] {
            let fit = dpc_fit(&model, &reference, &target, [1.0, 0.0], solver, &options).unwrap();
            assert!((fit.amplitude - 0.8).abs() < 1e-3, "{}: {:?}", solver, fit);
            assert!((fit.phase_gradient - 0.05).abs() < 1e-3, "{}: {:?}", solver, fit);
        }
    }

    #[test]
    fn test_even_length_shift_fits_without_bias() {
        use crate::core::fourier::projection_spectrum;
        use std::f64::consts::PI;

        for length in [8usize, 16] {
            let profile = Array1::from_shape_fn(length, |k| {
                let d = k as f64 - length as f64 / 2.0;
                (-d * d / 3.0).exp()
            });
            // circular shift by one sample
            let shifted = Array1::from_shape_fn(length, |k| profile[(k + length - 1) % length]);

            let model = ResidualModel::new(length);
            let reference = projection_spectrum(profile.view());
            let target = projection_spectrum(shifted.view());
            let options = MinimizeOptions {
                tolerance: 1e-10,
                max_iterations: 2000,
            };
            let fit = dpc_fit(&model, &reference, &target, [1.0, 0.0], Solver::NelderMead, &options)
                .unwrap();

            let expected = 2.0 * PI / length as f64;
            assert!((fit.phase_gradient - expected).abs() < 1e-4, "L={}: {:?}", length, fit);
            assert!((fit.amplitude - 1.0).abs() < 1e-4, "L={}: {:?}", length, fit);
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut fitter = SpectralFitter::standard();
        let model = fitter.residual_model(8);
        let reference = Spectrum::zeros(8);
        let target = Spectrum::zeros(7);

        let result = fitter.fit(&model, &reference, &target, [1.0, 0.0]);
        assert!(matches!(result, Err(DpcError::ShapeMismatch(_))));
        assert_eq!(fitter.cached_models(), 1);
    }
}
