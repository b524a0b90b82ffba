//! Adapter presenting the species right-hand sides to the integrator in scaled
//! coordinates `u_i = v_i / sf_i`.

use log::warn;

use crate::error::{SimulationError, SolverWarning};
use crate::formula::ScaleFactorMode;
use crate::linalg::{JacobianMatrix, JacobianTimesVector};
use crate::quantity::Quantities;
use crate::sensitivity::SensitivityCache;
use crate::traits::OdeSystem;

/// Number of non-finite right-hand side entries reported as warnings.
const REPORTED_NON_FINITE: usize = 10;
/// Number of non-finite right-hand side entries after which the system is unsolvable.
const MAX_NON_FINITE: usize = 1000;

/// Counts non-finite right-hand side values over a run.
#[derive(Debug, Default)]
pub(crate) struct RhsGuard {
    non_finite: usize,
    since_checkpoint: usize,
    pub(crate) warnings: Vec<SolverWarning>,
}

impl RhsGuard {
    fn record(&mut self, name: &str, time: f64) -> anyhow::Result<()> {
        self.non_finite += 1;
        self.since_checkpoint += 1;
        if self.non_finite <= REPORTED_NON_FINITE {
            let message = format!("Right hand side of {name} is not finite at t={time}");
            warn!("{message}");
            self.warnings.push(SolverWarning::new(time, message));
        }
        if self.non_finite > MAX_NON_FINITE {
            return Err(SimulationError::InfiniteRhs { time }.into());
        }
        Ok(())
    }

    /// Whether non-finite values were seen since the last call.
    pub(crate) fn take_checkpoint(&mut self) -> bool {
        let seen = self.since_checkpoint > 0;
        self.since_checkpoint = 0;
        seen
    }
}

pub(crate) struct ModelSystem<'a> {
    quantities: &'a Quantities,
    /// Species slot of every ODE index.
    ode_species: &'a [usize],
    sensitivity: &'a SensitivityCache,
    guard: &'a mut RhsGuard,
}

impl<'a> ModelSystem<'a> {
    pub(crate) fn new(
        quantities: &'a Quantities,
        ode_species: &'a [usize],
        sensitivity: &'a SensitivityCache,
        guard: &'a mut RhsGuard,
    ) -> Self {
        Self {
            quantities,
            ode_species,
            sensitivity,
            guard,
        }
    }
}

impl OdeSystem for ModelSystem<'_> {
    fn dimension(&self) -> usize {
        self.ode_species.len()
    }

    fn sensitivity_count(&self) -> usize {
        self.sensitivity.parameter_count()
    }

    fn rhs(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> anyhow::Result<()> {
        for (i, &slot) in self.ode_species.iter().enumerate() {
            let species = &self.quantities.species[slot];
            let mut rate = 0.0;
            for term in species.rhs() {
                rate += term.evaluate(self.quantities, y, t, ScaleFactorMode::Use)?;
            }
            ydot[i] = rate / species.scale_factor();
            if !ydot[i].is_finite() {
                self.guard.record(&species.core.full_name(), t)?;
            }
        }
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(&mut self, t: f64, y: &[f64], jac: &mut dyn JacobianMatrix) -> anyhow::Result<()> {
        for (i, &slot) in self.ode_species.iter().enumerate() {
            let species = &self.quantities.species[slot];
            let multiplier = 1.0 / species.scale_factor();
            for term in species.rhs() {
                term.accumulate_jacobian(self.quantities, jac, y, t, i, multiplier)?;
            }
        }
        Ok(())
    }

    fn sensitivity_rhs(
        &mut self,
        t: f64,
        y: &[f64],
        sens: &[f64],
        sdot: &mut [f64],
    ) -> anyhow::Result<()> {
        let n = self.ode_species.len();
        if n == 0 {
            return Ok(());
        }
        for (parameter, (block, out)) in sens.chunks(n).zip(sdot.chunks_mut(n)).enumerate() {
            out.iter_mut().for_each(|v| *v = 0.0);
            {
                let mut product = JacobianTimesVector {
                    vector: block,
                    out: &mut *out,
                };
                self.jacobian(t, y, &mut product)?;
            }
            for (i, &slot) in self.ode_species.iter().enumerate() {
                let species = &self.quantities.species[slot];
                out[i] += self
                    .sensitivity
                    .rhs_parameter_derivative(parameter, i, self.quantities, y, t)?
                    / species.scale_factor();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{Formula, VariableRef};
    use crate::quantity::Species;
    use nalgebra::DMatrix;

    fn scaled_model() -> (Quantities, Vec<usize>) {
        let mut quantities = Quantities::default();
        let mut a = Species::new(1, "A", 1.0);
        a.set_scale_factor(10.0).unwrap();
        a.ode_index = Some(0);
        // dA/dt = -2 A
        a.add_rhs(Formula::product(vec![
            Formula::constant(-2.0),
            Formula::variable(VariableRef::bound("A", 0, 10.0)),
        ]));
        quantities.species.push(a);
        let mut b = Species::new(2, "B", 0.0);
        b.ode_index = Some(1);
        b.add_rhs(Formula::div(
            Formula::constant(1.0),
            Formula::variable(VariableRef::bound("B", 1, 1.0)),
        ));
        quantities.species.push(b);
        (quantities, vec![0, 1])
    }

    #[test]
    fn rhs_and_jacobian_work_in_scaled_coordinates() {
        let (quantities, ode_species) = scaled_model();
        let cache = SensitivityCache::default();
        let mut guard = RhsGuard::default();
        let mut system = ModelSystem::new(&quantities, &ode_species, &cache, &mut guard);

        let mut ydot = [0.0; 2];
        system.rhs(0.0, &[0.5, 2.0], &mut ydot).unwrap();
        // v = 5, dv/dt = -10, du/dt = -1
        assert_eq!(ydot[0], -1.0);
        assert_eq!(ydot[1], 0.5);

        let mut jac = DMatrix::zeros(2, 2);
        system.jacobian(0.0, &[0.5, 2.0], &mut jac).unwrap();
        assert_eq!(jac[(0, 0)], -2.0);
        assert_eq!(jac[(1, 1)], -0.25);
    }

    #[test]
    fn non_finite_rhs_is_reported_then_fatal() {
        let (quantities, ode_species) = scaled_model();
        let cache = SensitivityCache::default();
        let mut guard = RhsGuard::default();
        {
            let mut system = ModelSystem::new(&quantities, &ode_species, &cache, &mut guard);
            let mut ydot = [0.0; 2];
            for _ in 0..MAX_NON_FINITE {
                system.rhs(1.5, &[0.5, 0.0], &mut ydot).unwrap();
            }
            let err = system
                .rhs(1.5, &[0.5, 0.0], &mut ydot)
                .expect_err("past the limit");
            let simulation_error = err.downcast::<SimulationError>().unwrap();
            assert!(matches!(simulation_error, SimulationError::InfiniteRhs { time } if time == 1.5));
        }
        assert_eq!(guard.warnings.len(), REPORTED_NON_FINITE);
        assert!(guard.warnings[0].message.contains("B"));
        assert!(guard.take_checkpoint());
        assert!(!guard.take_checkpoint());
    }
}
