//! Core DPC processing modules

pub mod reduction;
pub mod fourier;
pub mod optimize;
pub mod fitting;
pub mod reconstruct;
pub mod scanner;

// Re-export main types
pub use reduction::{ImageReducer, image_reduction};
pub use optimize::{minimize, MinimizeOptions, Objective, OptimizeResult, Solver};
pub use fitting::{dpc_fit, ResidualModel, ResidualModelCache, SpectralFitter};
pub use reconstruct::{recon, PhaseReconstructor};
pub use scanner::{
    dpc_runner, wavelength_from_energy, DpcOutput, DpcParams, GradientMaps, PhaseGradientScanner,
};
