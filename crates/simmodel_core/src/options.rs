//! Per-run configuration.
//!
//! Both structs are plain data with public fields so that a host layer can read and
//! write them directly; `Default` carries the documented defaults.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Smallest absolute tolerance reachable by automatic tolerance reduction.
pub const MIN_ABS_TOL: f64 = 1e-12;
/// Smallest relative tolerance reachable by automatic tolerance reduction.
pub const MIN_REL_TOL: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationOptions {
    /// Promote integrator warnings to fatal errors.
    pub stop_on_warnings: bool,
    /// Retry the whole run with tolerances divided by 10 after a convergence failure.
    pub auto_reduce_tolerances: bool,
    /// Fail when a species that may not go negative drops below `-abs_tol`.
    pub check_negative_values: bool,
    /// Use a banded iteration matrix after bandwidth-reducing reordering.
    pub use_banded_solver: bool,
    pub show_progress: bool,
    /// Wall-clock limit in seconds, 0 for none.
    pub execution_time_limit: f64,
    /// Collapse user output times that are equal in single precision.
    pub use_float_comparison_in_output_times: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            stop_on_warnings: true,
            auto_reduce_tolerances: true,
            check_negative_values: true,
            use_banded_solver: false,
            show_progress: false,
            execution_time_limit: 0.0,
            use_float_comparison_in_output_times: true,
        }
    }
}

impl SimulationOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.execution_time_limit >= 0.0) {
            bail!("execution_time_limit must be non-negative.");
        }
        Ok(())
    }
}

/// Settings of the stiff integrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverProperties {
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Initial step size, 0 to estimate it.
    pub h0: f64,
    pub h_min: f64,
    /// Largest step size, 0 for unlimited.
    pub h_max: f64,
    /// Maximum number of internal steps between two output times.
    pub mx_step: usize,
    /// Use the analytic Jacobian instead of finite differences.
    pub use_jacobian: bool,
}

impl Default for SolverProperties {
    fn default() -> Self {
        Self {
            abs_tol: 1e-10,
            rel_tol: 1e-5,
            h0: 0.0,
            h_min: 0.0,
            h_max: 0.0,
            mx_step: 100_000,
            use_jacobian: true,
        }
    }
}

impl SolverProperties {
    pub fn validate(&self) -> Result<()> {
        if !(self.abs_tol > 0.0) {
            bail!("abs_tol must be positive.");
        }
        if !(self.rel_tol > 0.0) {
            bail!("rel_tol must be positive.");
        }
        if !(self.h0 >= 0.0) {
            bail!("h0 must be non-negative.");
        }
        if !(self.h_min >= 0.0) {
            bail!("h_min must be non-negative.");
        }
        if !(self.h_max >= 0.0) {
            bail!("h_max must be non-negative.");
        }
        if self.h_max > 0.0 && self.h_min > self.h_max {
            bail!("h_min must not exceed h_max.");
        }
        if self.mx_step == 0 {
            bail!("mx_step must be greater than zero.");
        }
        Ok(())
    }

    /// Tolerances one reduction step further, or `None` when both are at their floors.
    pub fn reduced_tolerances(&self) -> Option<(f64, f64)> {
        if self.abs_tol <= MIN_ABS_TOL && self.rel_tol <= MIN_REL_TOL {
            return None;
        }
        Some((
            (self.abs_tol / 10.0).max(MIN_ABS_TOL),
            (self.rel_tol / 10.0).max(MIN_REL_TOL),
        ))
    }
}
