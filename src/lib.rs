//! dpc-phase: Differential Phase Contrast imaging
//!
//! Reconstructs the phase of a sample scanned by a coherent beam. Each
//! diffraction pattern is compared with a reference pattern to fit the local
//! phase gradient along x and y, and the two gradient maps are integrated into
//! a single phase image by a Fourier-space least-squares solve.

pub mod types;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    BadPixelSet, DpcError, DpcResult, FitResult, GradientMap, Image, Projection,
    RegionOfInterest, Spectrum,
};

pub use crate::core::{
    dpc_fit, dpc_runner, image_reduction, recon, DpcOutput, DpcParams, GradientMaps,
    ImageReducer, MinimizeOptions, PhaseGradientScanner, PhaseReconstructor, ResidualModel,
    Solver, SpectralFitter,
};
