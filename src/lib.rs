//! Recursive Nearest Agglomeration (ReNA) for 4-D brain-imaging volumes.
//!
//! ReNA clusters spatially adjacent voxels with similar signals and replaces
//! each cluster by its mean signal, turning a `(samples × voxels)` problem
//! into a `(samples × clusters)` one.

pub mod data;
pub mod error;
pub mod memory;
pub mod rena;

pub use data::masker::VolumeMasker;
pub use data::model::{Mask3D, SampleMatrix, Volume4D};
pub use error::{RenaError, Result};
pub use memory::Memory;
pub use rena::{ReNA, ReNAConfig, ReNAModel};
