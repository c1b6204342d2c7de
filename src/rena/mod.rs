/// ReNA clustering: lattice graph, recursive agglomeration, estimator.
///
/// ```text
///   SampleMatrix + Mask3D
///          │
///          ▼
///   ┌─────────────┐
///   │    graph     │  6-connectivity, squared-distance weights
///   └─────────────┘
///          │
///          ▼
///   ┌───────────────┐
///   │ agglomeration  │  nearest-neighbour grouping, repeated
///   └───────────────┘
///          │
///          ▼
///   ┌─────────────┐
///   │  estimator   │  fit / transform / inverse_transform
///   └─────────────┘
/// ```

pub mod agglomeration;
pub mod estimator;
pub mod graph;

pub use estimator::{ReNA, ReNAConfig, ReNAModel};
