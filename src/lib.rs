//! Density-based (SIMP) topology optimization of a solid given as a triangle
//! surface, with point markers for supports and loads.
//!
//! The pipeline is three calls: [`prepare`] voxelizes the solid and maps the
//! markers onto grid nodes, [`optimize`] runs the SIMP / Optimality Criteria
//! loop, and [`extract_surface`] turns the final densities back into a
//! binary STL surface.

pub mod addressing;
pub mod boundary;
pub mod config;
pub mod containment;
pub mod datatypes;
pub mod element;
pub mod error;
pub mod filter;
pub mod isosurface;
pub mod mesher;
pub mod optimizer;
pub mod post_processor;
pub mod progress;
pub mod solver;
pub mod stl;

pub use config::{OptimizationParams, SolverSettings};
pub use datatypes::{
    FixedSupport, GridBounds, GridResolution, LoadVector, PreparedProblem, SurfaceMesh,
};
pub use error::{AbyssError, AbyssResult};
pub use mesher::prepare;
pub use optimizer::{optimize, OptimizationOutcome, SimpParameters};
pub use post_processor::{extract_mesh, extract_surface};
pub use progress::{ProgressEvent, ProgressLog, ProgressSink, ProgressUpdate, RunStatus};
pub use solver::LinearSolverKind;
