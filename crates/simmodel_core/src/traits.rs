use anyhow::{bail, Result};

use crate::linalg::JacobianMatrix;

/// An ODE system `y' = f(t, y)` the stiff integrator can advance, optionally augmented
/// with forward sensitivity channels.
pub trait OdeSystem {
    /// Number of primary state variables.
    fn dimension(&self) -> usize;

    /// Number of sensitivity parameters; each adds `dimension()` channels.
    fn sensitivity_count(&self) -> usize {
        0
    }

    /// Evaluates the right-hand side.
    /// y: current (scaled) state
    /// ydot: buffer receiving dy/dt
    fn rhs(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> Result<()>;

    /// Whether `jacobian` supplies an analytic Jacobian; otherwise finite differences are used.
    fn has_jacobian(&self) -> bool {
        false
    }

    /// Accumulates df/dy into `jac`, which arrives cleared.
    fn jacobian(&mut self, _t: f64, _y: &[f64], _jac: &mut dyn JacobianMatrix) -> Result<()> {
        bail!("Analytic Jacobian is not available.");
    }

    /// Evaluates the right-hand sides of all sensitivity channels.
    /// sens: `sensitivity_count()` blocks of `dimension()` values, parameter-major
    /// sdot: buffer of the same layout
    fn sensitivity_rhs(
        &mut self,
        _t: f64,
        _y: &[f64],
        _sens: &[f64],
        _sdot: &mut [f64],
    ) -> Result<()> {
        bail!("Sensitivity right-hand side is not available.");
    }
}
