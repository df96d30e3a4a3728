//! Python bindings

use crate::core::scanner::{dpc_runner as run_dpc, frames_until_error, DpcParams};
use crate::core::{image_reduction as reduce_image, recon as reconstruct_phase, Solver};
use crate::types::{BadPixelSet, DpcError, Image, RegionOfInterest};
use numpy::{PyReadonlyArray2, ToPyArray};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use std::cell::Cell;

impl From<DpcError> for PyErr {
    fn from(err: DpcError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

/// Convert PyReadonlyArray2 to ndarray Array2
fn numpy_to_array2(arr: PyReadonlyArray2<f64>) -> Image {
    arr.as_array().to_owned()
}

fn to_roi(roi: Option<(usize, usize, usize, usize)>) -> Option<RegionOfInterest> {
    roi.map(|(r, c, rows, cols)| RegionOfInterest::new(r, c, rows, cols))
}

fn to_bad_pixels(bad_pixels: Option<Vec<(usize, usize)>>) -> Option<BadPixelSet> {
    bad_pixels.map(|pixels| pixels.into_iter().collect())
}

/// Sum a diffraction pattern along x and y
#[pyfunction]
#[pyo3(signature = (im, roi=None, bad_pixels=None))]
fn image_reduction(
    py: Python,
    im: PyReadonlyArray2<f64>,
    roi: Option<(usize, usize, usize, usize)>,
    bad_pixels: Option<Vec<(usize, usize)>>,
) -> PyResult<(PyObject, PyObject)> {
    let image = numpy_to_array2(im);
    let bad_pixels = to_bad_pixels(bad_pixels);
    let (x_line, y_line) = reduce_image(image.view(), to_roi(roi), bad_pixels.as_ref())?;

    Ok((x_line.to_pyarray(py).into(), y_line.to_pyarray(py).into()))
}

/// Reconstruct the final phase image from gradient maps
#[pyfunction]
#[pyo3(signature = (gx, gy, dx, dy, padding=0, w=0.5))]
fn recon(
    py: Python,
    gx: PyReadonlyArray2<f64>,
    gy: PyReadonlyArray2<f64>,
    dx: f64,
    dy: f64,
    padding: usize,
    w: f64,
) -> PyResult<PyObject> {
    let gx = numpy_to_array2(gx);
    let gy = numpy_to_array2(gy);
    let phase = reconstruct_phase(&gx, &gy, dx, dy, padding, w)?;

    Ok(phase.to_pyarray(py).into())
}

/// Run the whole DPC calculation, returning (phase, amplitude)
#[pyfunction]
#[pyo3(signature = (
    reference, image_sequence, start_point, pixel_size, focus_to_det, rows, cols, dx, dy,
    energy, padding=0, w=0.5, solver="Nelder-Mead", roi=None, bad_pixels=None,
    invert=true, scale=true
))]
#[allow(clippy::too_many_arguments)]
fn dpc_runner(
    py: Python,
    reference: PyReadonlyArray2<f64>,
    image_sequence: &PyAny,
    start_point: (f64, f64),
    pixel_size: (f64, f64),
    focus_to_det: f64,
    rows: usize,
    cols: usize,
    dx: f64,
    dy: f64,
    energy: f64,
    padding: usize,
    w: f64,
    solver: &str,
    roi: Option<(usize, usize, usize, usize)>,
    bad_pixels: Option<Vec<(usize, usize)>>,
    invert: bool,
    scale: bool,
) -> PyResult<(PyObject, PyObject)> {
    let params = DpcParams {
        start_point: [start_point.0, start_point.1],
        pixel_size,
        focus_to_detector: focus_to_det,
        dx,
        dy,
        energy,
        padding,
        weight: w,
        solver: solver.parse::<Solver>()?,
        roi: to_roi(roi),
        bad_pixels: to_bad_pixels(bad_pixels),
        invert,
        scale,
        ..DpcParams::default()
    };
    params.validate()?;

    let reference = numpy_to_array2(reference);
    let failure = Cell::new(None);
    let frames = image_sequence.iter()?.map(|item| -> PyResult<Image> {
        let frame: PyReadonlyArray2<f64> = item?.extract()?;
        Ok(numpy_to_array2(frame))
    });

    let result = run_dpc(reference.view(), frames_until_error(frames, &failure), rows, cols, params);
    if let Some(err) = failure.take() {
        return Err(err);
    }
    let output = result?;

    Ok((
        output.phase.to_pyarray(py).into(),
        output.amplitude.to_pyarray(py).into(),
    ))
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(image_reduction, m)?)?;
    m.add_function(wrap_pyfunction!(recon, m)?)?;
    m.add_function(wrap_pyfunction!(dpc_runner, m)?)?;
    m.add(
        "SOLVERS",
        Solver::ALL.iter().map(|s| s.name()).collect::<Vec<_>>(),
    )?;
    Ok(())
}
