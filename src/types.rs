use ndarray::{Array1, Array2};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Real-valued detector frame or scan-grid map (rows x cols)
pub type Image = Array2<f64>;

/// Row-sum or column-sum of an image
pub type Projection = Array1<f64>;

/// Inverse-transformed projection with the zero frequency at the centre
pub type Spectrum = Array1<Complex64>;

/// One value per scan position (scan rows x scan cols)
pub type GradientMap = Array2<f64>;

/// Rectangular detector window, in full-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub origin_row: usize,
    pub origin_col: usize,
    pub num_rows: usize,
    pub num_cols: usize,
}

impl RegionOfInterest {
    pub fn new(origin_row: usize, origin_col: usize, num_rows: usize, num_cols: usize) -> Self {
        Self {
            origin_row,
            origin_col,
            num_rows,
            num_cols,
        }
    }

    /// Check that the window is non-empty and fits inside a `(height, width)` image
    pub fn validate(&self, height: usize, width: usize) -> DpcResult<()> {
        if self.num_rows == 0 || self.num_cols == 0 {
            return Err(DpcError::InvalidRegion(format!(
                "ROI {}x{} is empty",
                self.num_rows, self.num_cols
            )));
        }

        let row_end = self.origin_row.checked_add(self.num_rows);
        let col_end = self.origin_col.checked_add(self.num_cols);
        match (row_end, col_end) {
            (Some(r), Some(c)) if r <= height && c <= width => Ok(()),
            _ => Err(DpcError::InvalidRegion(format!(
                "ROI at ({}, {}) of size {}x{} exceeds image bounds {}x{}",
                self.origin_row, self.origin_col, self.num_rows, self.num_cols, height, width
            ))),
        }
    }
}

/// Detector pixels forced to zero before reduction, as (row, col)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadPixelSet {
    pixels: BTreeSet<(usize, usize)>,
}

impl BadPixelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, row: usize, col: usize) -> bool {
        self.pixels.insert((row, col))
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(usize, usize)> {
        self.pixels.iter()
    }
}

impl FromIterator<(usize, usize)> for BadPixelSet {
    fn from_iter<I: IntoIterator<Item = (usize, usize)>>(iter: I) -> Self {
        Self {
            pixels: iter.into_iter().collect(),
        }
    }
}

/// Fitted parameters for one axis at one scan position
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FitResult {
    pub amplitude: f64,
    pub phase_gradient: f64,
}

/// Error types for DPC processing
#[derive(Debug, thiserror::Error)]
pub enum DpcError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

/// Result type for DPC operations
pub type DpcResult<T> = Result<T, DpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let errors = [
            DpcError::InvalidConfiguration("w".into()),
            DpcError::InvalidRegion("roi".into()),
            DpcError::ShapeMismatch("gx".into()),
        ];
        for err in &errors {
            let prefix = match err {
                DpcError::InvalidConfiguration(_) => "Invalid configuration: ",
                DpcError::InvalidRegion(_) => "Invalid region: ",
                DpcError::ShapeMismatch(_) => "Shape mismatch: ",
            };
            assert!(err.to_string().starts_with(prefix), "{}", err);
        }
    }

    #[test]
    fn test_roi_inside_bounds() {
        let roi = RegionOfInterest::new(1, 2, 3, 4);
        assert!(roi.validate(4, 6).is_ok());
        assert!(roi.validate(3, 6).is_err());
        assert!(roi.validate(4, 5).is_err());
    }

    #[test]
    fn test_roi_empty_rejected() {
        let roi = RegionOfInterest::new(0, 0, 0, 2);
        assert!(matches!(roi.validate(4, 4), Err(DpcError::InvalidRegion(_))));
    }

    #[test]
    fn test_roi_overflow_rejected() {
        let roi = RegionOfInterest::new(usize::MAX, 0, 2, 2);
        assert!(roi.validate(4, 4).is_err());
    }

    #[test]
    fn test_bad_pixels_deduplicated() {
        let set: BadPixelSet = vec![(1, 5), (2, 6), (1, 5)].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
