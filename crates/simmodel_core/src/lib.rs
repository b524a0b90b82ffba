//! The `simmodel_core` crate is the simulation engine for hybrid ODE models: species
//! driven by right-hand side formulas, parameters and observers defined by formulas, and
//! switches that change values or formulas when their conditions hold.
//!
//! Key components:
//! - **Formula**: expression trees with evaluation, analytic Jacobians, symbolic
//!   derivatives, simplification and code emission.
//! - **Quantity**: parameters, species and observers, the value sources formulas read.
//! - **Switch**: condition-triggered assignments applied between integration steps.
//! - **Solvers**: a variable-order BDF integrator with dense or banded Newton matrices
//!   and forward sensitivities.
//! - **Simulation**: finalization of a model and the solve loop over the output schedule.
pub mod bandwidth;
pub mod error;
pub mod formula;
pub mod linalg;
pub mod options;
pub mod output;
pub mod quantity;
pub mod schedule;
mod sensitivity;
pub mod simulation;
pub mod solvers;
pub mod switch;
mod system;
pub mod traits;

pub use error::{Result, SimulationError, SolverWarning};
pub use formula::{Formula, ScaleFactorMode};
pub use options::{SimulationOptions, SolverProperties};
pub use output::{QuantityValues, SimulationOutput};
pub use quantity::{Observer, Parameter, Species};
pub use schedule::{OutputInterval, OutputSchema};
pub use simulation::{CancellationToken, Simulation};
pub use switch::{FormulaChange, Switch};
