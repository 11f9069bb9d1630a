//! Thin wrapper around the Levenberg-Marquardt backend.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use ba_core::Real;
use log::info;
use nalgebra::DVector;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::LevenbergMarquardtOptimizer;

/// User-facing solver options mapped onto the backend's optimizer settings.
#[derive(Debug, Clone)]
pub struct SolveOptions {
    pub max_iterations: usize,
    /// Mapped onto the backend's relative error-decrease threshold.
    pub parameter_tolerance: Real,
    pub verbosity: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            parameter_tolerance: 1e-8,
            verbosity: 0,
        }
    }
}

/// Outcome of one solve.
#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    pub converged: bool,
    pub hit_iteration_cap: bool,
}

/// Run the optimizer and return the refined parameter state.
///
/// `max_iterations == 0` short-circuits the backend entirely: the initial
/// state is returned untouched and the report notes the iteration cap.
pub fn solve(
    problem: &Problem,
    initial: HashMap<String, DVector<Real>>,
    opts: &SolveOptions,
) -> Result<(HashMap<String, DVector<Real>>, SolveReport)> {
    if opts.max_iterations == 0 {
        info!("reached maximum number of iterations (0); keeping the initial solution");
        return Ok((
            initial,
            SolveReport {
                converged: false,
                hit_iteration_cap: true,
            },
        ));
    }

    let options = OptimizerOptions {
        max_iteration: opts.max_iterations,
        verbosity_level: opts.verbosity,
        min_rel_error_decrease_threshold: opts.parameter_tolerance,
        ..OptimizerOptions::default()
    };

    let optimizer = LevenbergMarquardtOptimizer::default();
    let solution = optimizer
        .optimize(problem, &initial, Some(options))
        .ok_or_else(|| anyhow!("the solver failed to produce a solution"))?;

    info!("solver finished after at most {} iterations", opts.max_iterations);
    Ok((
        solution,
        SolveReport {
            converged: true,
            hit_iteration_cap: false,
        },
    ))
}
