/// Data layer: volumes, masks, loading, and masking.
///
/// Architecture:
/// ```text
///  .parquet / .json / .csv          synthetic
///        │                              │
///        ▼                              ▼
///   ┌──────────┐                 ┌────────────┐
///   │  loader   │  voxel table → │  Volume4D  │  (nx, ny, nz, samples)
///   └──────────┘                 └────────────┘
///                                       │
///                                       ▼
///                                ┌────────────┐
///                                │   masker   │  Mask3D → SampleMatrix
///                                └────────────┘
/// ```

pub mod loader;
pub mod masker;
pub mod model;
pub mod synthetic;
