use crate::types::{BadPixelSet, DpcError, DpcResult, Image, Projection, RegionOfInterest};
use ndarray::{s, ArrayView2, Axis};

/// Collapses detector frames into their two axis projections
#[derive(Debug, Clone, Default)]
pub struct ImageReducer {
    roi: Option<RegionOfInterest>,
    bad_pixels: Option<BadPixelSet>,
}

impl ImageReducer {
    /// Reducer over the full frame with no masked pixels
    pub fn new() -> Self {
        Self::default()
    }

    /// Reducer with an optional ROI and bad-pixel mask
    pub fn with_mask(roi: Option<RegionOfInterest>, bad_pixels: Option<BadPixelSet>) -> Self {
        Self { roi, bad_pixels }
    }

    /// Reduce a frame to `(x_line, y_line)`.
    ///
    /// `x_line` sums over rows (length = column count), `y_line` sums over
    /// columns (length = row count). Bad pixels are given in full-frame
    /// coordinates and are zeroed on a private copy before cropping.
    pub fn reduce(&self, image: ArrayView2<f64>) -> DpcResult<(Projection, Projection)> {
        let (height, width) = image.dim();

        if let Some(roi) = &self.roi {
            roi.validate(height, width)?;
        }

        let mut frame: Image = image.to_owned();

        if let Some(bad_pixels) = &self.bad_pixels {
            for &(row, col) in bad_pixels.iter() {
                if row >= height || col >= width {
                    return Err(DpcError::InvalidRegion(format!(
                        "Bad pixel ({}, {}) outside image bounds {}x{}",
                        row, col, height, width
                    )));
                }
                frame[[row, col]] = 0.0;
            }
        }

        let window = match &self.roi {
            Some(roi) => frame.slice(s![
                roi.origin_row..roi.origin_row + roi.num_rows,
                roi.origin_col..roi.origin_col + roi.num_cols
            ]),
            None => frame.view(),
        };

        let x_line = window.sum_axis(Axis(0));
        let y_line = window.sum_axis(Axis(1));

        Ok((x_line, y_line))
    }
}

/// Reduce a frame with an optional ROI and bad-pixel mask
pub fn image_reduction(
    image: ArrayView2<f64>,
    roi: Option<RegionOfInterest>,
    bad_pixels: Option<&BadPixelSet>,
) -> DpcResult<(Projection, Projection)> {
    ImageReducer::with_mask(roi, bad_pixels.cloned()).reduce(image)
}
