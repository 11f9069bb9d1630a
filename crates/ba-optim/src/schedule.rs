//! Backend-independent residual schedule.
//!
//! The assembler materializes the problem as an ordered list of tagged
//! residual entries. The same list is compiled into the solver backend's
//! problem and walked directly (in plain `f64`) whenever a canonical flat
//! residual vector is needed, so the analyzer and the outlier filter decode
//! exactly the rows the schedule defines, in the order it defines them.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use ba_core::Real;
use nalgebra::DVector;
use tiny_solver::factors::Factor;

use crate::factors::{
    CameraPriorFactor, DisparityFactor, GcpLlhFactor, GcpXyzFactor, PosePriorFactor,
    ReprojectionFactor,
};
use crate::robust::RobustKernel;

/// What a residual entry measures, in schedule order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualKind {
    Reprojection { camera: usize, point: usize },
    TerrainDisparity { left: usize, right: usize, terrain: usize },
    GcpPosition { point: usize },
    CameraPrior { camera: usize },
    PosePrior { camera: usize },
}

/// Concrete factor payload for an entry.
#[derive(Debug, Clone)]
pub enum FactorData {
    Reprojection(ReprojectionFactor),
    Disparity(DisparityFactor),
    GcpXyz(GcpXyzFactor),
    GcpLlh(GcpLlhFactor),
    CameraPrior(CameraPriorFactor),
    PosePrior(PosePriorFactor),
}

impl FactorData {
    /// Residual dimension of this factor.
    pub fn dim(&self) -> usize {
        match self {
            FactorData::Reprojection(_) | FactorData::Disparity(_) => 2,
            FactorData::GcpXyz(_) | FactorData::GcpLlh(_) => 3,
            FactorData::CameraPrior(_) | FactorData::PosePrior(_) => 6,
        }
    }

    /// Evaluate the residual in plain `f64`.
    pub fn evaluate(&self, params: &[DVector<Real>]) -> DVector<Real> {
        match self {
            FactorData::Reprojection(f) => f.residual_func(params),
            FactorData::Disparity(f) => f.residual_func(params),
            FactorData::GcpXyz(f) => f.residual_func(params),
            FactorData::GcpLlh(f) => f.residual_func(params),
            FactorData::CameraPrior(f) => f.residual_func(params),
            FactorData::PosePrior(f) => f.residual_func(params),
        }
    }
}

/// One residual block: its tag, parameter block keys and factor payload.
#[derive(Debug, Clone)]
pub struct ResidualEntry {
    pub kind: ResidualKind,
    pub params: Vec<String>,
    pub factor: FactorData,
    /// Whether the configured robust kernel applies to this entry.
    pub robust: bool,
}

impl ResidualEntry {
    pub fn dim(&self) -> usize {
        self.factor.dim()
    }
}

/// The full ordered schedule plus the configured kernel.
#[derive(Debug, Clone, Default)]
pub struct ResidualSchedule {
    pub entries: Vec<ResidualEntry>,
    pub kernel: RobustKernel,
}

impl ResidualSchedule {
    /// Total length of the flat residual vector.
    pub fn total_dim(&self) -> usize {
        self.entries.iter().map(|e| e.dim()).sum()
    }

    /// Evaluate the flat residual vector for a parameter state, in schedule
    /// order. With `apply_loss`, robust entries are scaled so each block's
    /// squared norm equals `rho` of the raw squared norm.
    pub fn evaluate(
        &self,
        state: &HashMap<String, DVector<Real>>,
        apply_loss: bool,
    ) -> Result<Vec<Real>> {
        let mut flat = Vec::with_capacity(self.total_dim());
        for entry in &self.entries {
            let params: Vec<DVector<Real>> = entry
                .params
                .iter()
                .map(|key| {
                    state
                        .get(key)
                        .cloned()
                        .ok_or_else(|| anyhow!("parameter block {} missing from state", key))
                })
                .collect::<Result<_>>()?;

            let r = entry.factor.evaluate(&params);
            let mut block: Vec<Real> = r.iter().copied().collect();
            if apply_loss && entry.robust {
                self.kernel.correct_residuals(&mut block);
            }
            flat.extend_from_slice(&block);
        }
        Ok(flat)
    }
}
