//! Problem assembly and optimization for `bundle-rs`.
//!
//! The assembler turns a control network, camera state and configuration
//! into a backend-independent residual schedule; the schedule compiles into
//! the solver backend's problem and is walked directly whenever canonical
//! residual vectors are needed for analysis or outlier filtering.

pub mod assembler;
pub mod factors;
pub mod intrinsics;
pub mod robust;
pub mod schedule;
pub mod solver;

pub use assembler::{
    assemble, camera_key, point_key, AssemblerConfig, Assembly, TerrainObservation,
};
pub use intrinsics::{IntrinsicsState, GROUP_CENTER, GROUP_DISTORTION, GROUP_FOCAL};
pub use robust::RobustKernel;
pub use schedule::{FactorData, ResidualEntry, ResidualKind, ResidualSchedule};
pub use solver::{solve, SolveOptions, SolveReport};
