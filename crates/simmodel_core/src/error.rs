use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::formula::FormulaId;
use crate::quantity::QuantityId;
use crate::solvers::IntegratorError;

/// Failures surfaced by model finalization and simulation runs.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// A formula could not be bound or evaluated (unresolved alias, missing ODE index, ...).
    #[error("Formula {formula_id}: {message}")]
    Configuration { formula_id: FormulaId, message: String },

    #[error("Switch {switch_id}: {message}")]
    Switch { switch_id: i64, message: String },

    #[error("Quantity {quantity_id}: {message}")]
    Quantity {
        quantity_id: QuantityId,
        message: String,
    },

    #[error("Invalid simulation options: {0}")]
    Options(String),

    #[error("Invalid output schema: {0}")]
    Schedule(String),

    #[error("Simulation is not finalized")]
    NotFinalized,

    /// An integrator failure promoted to an error because warnings stop the run.
    #[error("Error solving ODE at time t={time}: {message}")]
    Solver {
        time: f64,
        message: String,
        /// Set for convergence and error-test failures, which a tolerance reduction may cure.
        reducible: bool,
    },

    #[error(
        "Solver failed at t={time} and tolerances cannot be reduced further (AbsTol={abs_tol:e}, RelTol={rel_tol:e})"
    )]
    ToleranceFloorReached {
        time: f64,
        abs_tol: f64,
        rel_tol: f64,
    },

    #[error("System could not be solved: RHS is not finite (t={time})")]
    InfiniteRhs { time: f64 },

    #[error("Negative values detected at t={time}: {}", .names.join(", "))]
    NegativeValue { time: f64, names: Vec<String> },

    #[error("Simulation execution time limit of {limit} s exceeded at t={time}")]
    TimeLimitExceeded { limit: f64, time: f64 },

    #[error(transparent)]
    Integrator(#[from] IntegratorError),
}

impl SimulationError {
    pub fn configuration(formula_id: FormulaId, message: impl Into<String>) -> Self {
        SimulationError::Configuration {
            formula_id,
            message: message.into(),
        }
    }

    /// True for failures a rerun with tighter tolerances can plausibly cure.
    pub fn is_tolerance_reducible(&self) -> bool {
        matches!(self, SimulationError::Solver { reducible: true, .. })
    }

    pub fn time(&self) -> Option<f64> {
        match self {
            SimulationError::Solver { time, .. }
            | SimulationError::ToleranceFloorReached { time, .. }
            | SimulationError::InfiniteRhs { time }
            | SimulationError::NegativeValue { time, .. }
            | SimulationError::TimeLimitExceeded { time, .. } => Some(*time),
            SimulationError::Integrator(err) => Some(err.time()),
            _ => None,
        }
    }
}

pub type Result<T, E = SimulationError> = std::result::Result<T, E>;

/// A recoverable solver problem recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverWarning {
    pub time: f64,
    pub message: String,
}

impl SolverWarning {
    pub fn new(time: f64, message: impl Into<String>) -> Self {
        Self {
            time,
            message: message.into(),
        }
    }
}
