//! Discrete events: a condition formula and an ordered list of formula changes applied
//! when the condition becomes true at a scheduled time point.

use std::collections::BTreeSet;

use log::debug;

use crate::error::{Result, SimulationError};
use crate::formula::{Formula, Node, ScaleFactorMode};
use crate::quantity::{Quantities, QuantityId};

/// Quantity a [`FormulaChange`] writes to, by slot in the quantity tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchTarget {
    Species(usize),
    Parameter(usize),
}

/// Result of evaluating a switch at one time point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    NotFired,
    /// `restart` is set when any change altered the state or a governing formula.
    Fired { restart: bool },
}

impl SwitchOutcome {
    pub fn fired(self) -> bool {
        matches!(self, SwitchOutcome::Fired { .. })
    }

    pub fn requires_restart(self) -> bool {
        matches!(self, SwitchOutcome::Fired { restart: true })
    }
}

/// Replacement of a quantity's value or governing formula.
#[derive(Debug, Clone)]
pub struct FormulaChange {
    pub quantity_id: QuantityId,
    /// Apply the value of the new formula at firing time instead of the formula itself.
    pub use_as_value: bool,
    formula: Formula,
    target: Option<SwitchTarget>,
    species_ode_index: Option<usize>,
    species_scale_factor: f64,
}

impl FormulaChange {
    pub fn new(quantity_id: QuantityId, formula: Formula, use_as_value: bool) -> Self {
        Self {
            quantity_id,
            use_as_value,
            formula,
            target: None,
            species_ode_index: None,
            species_scale_factor: 1.0,
        }
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    pub(crate) fn formula_mut(&mut self) -> &mut Formula {
        &mut self.formula
    }

    pub fn target(&self) -> Option<SwitchTarget> {
        self.target
    }

    pub(crate) fn bind(&mut self, target: SwitchTarget) {
        self.target = Some(target);
    }

    /// Caches the ODE index and scale factor of a species target.
    pub(crate) fn refresh_species_index(&mut self, quantities: &Quantities) {
        if let Some(SwitchTarget::Species(slot)) = self.target {
            if let Some(species) = quantities.species.get(slot) {
                self.species_ode_index = species.ode_index();
                self.species_scale_factor = species.scale_factor();
            }
        }
        self.formula.update_indices_of_referenced_variables(quantities);
    }

    pub(crate) fn species_ode_index(&self) -> Option<usize> {
        self.species_ode_index
    }

    /// Applies the change; returns whether the state or a governing formula changed.
    fn apply(
        &self,
        switch_id: i64,
        quantities: &mut Quantities,
        y: &mut [f64],
        time: f64,
    ) -> Result<bool> {
        let target = self.target.ok_or_else(|| SimulationError::Switch {
            switch_id,
            message: format!("Target quantity {} is not bound", self.quantity_id),
        })?;

        match target {
            SwitchTarget::Species(_) => {
                // species state only changes by value assignment
                let index = self.species_ode_index.ok_or_else(|| SimulationError::Switch {
                    switch_id,
                    message: format!("Species {} changed by switch has no ODE index", self.quantity_id),
                })?;
                let value = self.formula.evaluate(quantities, y, time, ScaleFactorMode::Use)?
                    / self.species_scale_factor;
                let slot = y.get_mut(index).ok_or_else(|| SimulationError::Switch {
                    switch_id,
                    message: format!("ODE index {index} out of range"),
                })?;
                if *slot == value {
                    return Ok(false);
                }
                *slot = value;
                Ok(true)
            }
            SwitchTarget::Parameter(slot) => {
                if self.use_as_value {
                    let value = self.formula.evaluate(quantities, y, time, ScaleFactorMode::Use)?;
                    let parameter = quantities.parameters.get_mut(slot).ok_or_else(|| {
                        SimulationError::Switch {
                            switch_id,
                            message: format!("Parameter slot {slot} out of range"),
                        }
                    })?;
                    parameter.core.set_constant_value(value);
                    return Ok(true);
                }
                let parameter = quantities.parameters.get_mut(slot).ok_or_else(|| {
                    SimulationError::Switch {
                        switch_id,
                        message: format!("Parameter slot {slot} out of range"),
                    }
                })?;
                if parameter.core.is_formula_equal_to(self.formula.id()) {
                    return Ok(false);
                }
                parameter.core.set_formula(self.formula.clone());
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Switch {
    pub id: i64,
    /// Fire at most once per run.
    pub fires_once: bool,
    condition: Formula,
    changes: Vec<FormulaChange>,
    was_fired: bool,
}

impl Switch {
    pub fn new(id: i64, condition: Formula, fires_once: bool) -> Self {
        Self {
            id,
            fires_once,
            condition,
            changes: Vec::new(),
            was_fired: false,
        }
    }

    pub fn with_change(mut self, change: FormulaChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn add_change(&mut self, change: FormulaChange) {
        self.changes.push(change);
    }

    pub fn condition(&self) -> &Formula {
        &self.condition
    }

    pub(crate) fn condition_mut(&mut self) -> &mut Formula {
        &mut self.condition
    }

    pub fn changes(&self) -> &[FormulaChange] {
        &self.changes
    }

    pub(crate) fn changes_mut(&mut self) -> &mut [FormulaChange] {
        &mut self.changes
    }

    pub fn was_fired(&self) -> bool {
        self.was_fired
    }

    /// Re-arms the switch for a new run.
    pub fn reset(&mut self) {
        self.was_fired = false;
    }

    /// A condition `Time OP expr` (either side) whose other operand reads no state,
    /// so that its firing times are known before the run.
    pub fn is_explicit(&self, quantities: &Quantities) -> bool {
        match self.condition.node() {
            Node::Relational(_, a, b) => {
                (a.is_time() && b.uses_no_state(quantities))
                    || (b.is_time() && a.uses_no_state(quantities))
            }
            _ => false,
        }
    }

    pub fn switch_time_points(&self, quantities: &Quantities) -> Vec<f64> {
        self.condition.switch_time_points(quantities)
    }

    /// ODE indices read or written by the assignments of this switch.
    pub fn append_used_variables(&self, used: &mut BTreeSet<usize>, quantities: &Quantities) {
        if self.condition.is_zero(quantities) {
            return;
        }
        let none = BTreeSet::new();
        for change in &self.changes {
            if let Some(index) = change.species_ode_index {
                used.insert(index);
            }
            change.formula.append_used_variables(used, &none, quantities);
        }
    }

    /// Evaluates the condition and, if it holds exactly and the switch is armed, applies
    /// every change in order.
    pub fn perform(
        &mut self,
        quantities: &mut Quantities,
        y: &mut [f64],
        time: f64,
    ) -> Result<SwitchOutcome> {
        if self.fires_once && self.was_fired {
            return Ok(SwitchOutcome::NotFired);
        }
        let condition = self
            .condition
            .evaluate(quantities, y, time, ScaleFactorMode::Use)?;
        if condition != 1.0 {
            return Ok(SwitchOutcome::NotFired);
        }
        self.was_fired = true;

        let mut restart = false;
        for change in &self.changes {
            restart |= change.apply(self.id, quantities, y, time)?;
        }
        debug!(
            "Switch {} fired at t={} ({} change(s), restart: {})",
            self.id,
            time,
            self.changes.len(),
            restart
        );
        Ok(SwitchOutcome::Fired { restart })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{RelationalOp, VariableRef};
    use crate::quantity::{Parameter, Species};

    fn quantities() -> Quantities {
        let mut quantities = Quantities::default();
        quantities.parameters.push(Parameter::new(1, "k", 1.0));
        let mut species = Species::new(10, "A", 1.0);
        species.add_rhs(Formula::constant(0.0));
        species.ode_index = Some(0);
        species.set_scale_factor(2.0).unwrap();
        quantities.species.push(species);
        quantities
    }

    fn time_switch(at: f64, fires_once: bool) -> Switch {
        Switch::new(
            5,
            Formula::relational(RelationalOp::Ge, Formula::time(), Formula::constant(at)),
            fires_once,
        )
    }

    #[test]
    fn species_change_writes_scaled_value_once() {
        let mut q = quantities();
        let mut change = FormulaChange::new(10, Formula::constant(8.0), true);
        change.bind(SwitchTarget::Species(0));
        change.refresh_species_index(&q);
        let mut switch = time_switch(2.0, true).with_change(change);

        let mut y = [1.0];
        assert_eq!(switch.perform(&mut q, &mut y, 1.0).unwrap(), SwitchOutcome::NotFired);
        assert_eq!(
            switch.perform(&mut q, &mut y, 2.0).unwrap(),
            SwitchOutcome::Fired { restart: true }
        );
        assert_eq!(y[0], 4.0);

        y[0] = 0.5;
        assert_eq!(switch.perform(&mut q, &mut y, 3.0).unwrap(), SwitchOutcome::NotFired);
        assert_eq!(y[0], 0.5);

        switch.reset();
        assert!(!switch.was_fired());
    }

    #[test]
    fn unchanged_value_does_not_request_restart() {
        let mut q = quantities();
        let mut change = FormulaChange::new(10, Formula::constant(2.0), true);
        change.bind(SwitchTarget::Species(0));
        change.refresh_species_index(&q);
        let mut switch = time_switch(0.0, false).with_change(change);
        let mut y = [1.0];
        assert_eq!(
            switch.perform(&mut q, &mut y, 0.0).unwrap(),
            SwitchOutcome::Fired { restart: false }
        );
    }

    #[test]
    fn parameter_changes_install_value_or_formula() {
        let mut q = quantities();
        let mut as_value = FormulaChange::new(
            1,
            Formula::variable(VariableRef::bound("A", 0, 2.0)),
            true,
        );
        as_value.bind(SwitchTarget::Parameter(0));
        let mut switch = time_switch(1.0, false).with_change(as_value);
        let mut y = [3.0];
        assert!(switch.perform(&mut q, &mut y, 1.0).unwrap().requires_restart());
        assert_eq!(q.parameters[0].core.value(), 6.0);
        assert!(q.parameters[0].core.formula().is_none());

        let mut replacement = Formula::time();
        replacement.set_id(77);
        let mut as_formula = FormulaChange::new(1, replacement, false);
        as_formula.bind(SwitchTarget::Parameter(0));
        let mut switch = time_switch(1.0, false).with_change(as_formula);
        assert!(switch.perform(&mut q, &mut y, 1.0).unwrap().requires_restart());
        assert!(q.parameters[0].core.is_formula_equal_to(77));
        assert_eq!(
            switch.perform(&mut q, &mut y, 2.0).unwrap(),
            SwitchOutcome::Fired { restart: false }
        );
    }

    #[test]
    fn nan_condition_never_fires() {
        let mut q = quantities();
        let mut switch = Switch::new(
            1,
            Formula::relational(RelationalOp::Ge, Formula::constant(f64::NAN), Formula::time()),
            false,
        );
        let mut y = [0.0];
        assert!(!switch.perform(&mut q, &mut y, 1.0).unwrap().fired());
    }

    #[test]
    fn explicit_switches_compare_time_with_state_free_expressions() {
        let q = quantities();
        assert!(time_switch(3.0, true).is_explicit(&q));
        assert_eq!(time_switch(3.0, true).switch_time_points(&q), vec![3.0]);

        let state_dependent = Switch::new(
            2,
            Formula::relational(
                RelationalOp::Gt,
                Formula::variable(VariableRef::bound("A", 0, 1.0)),
                Formula::time(),
            ),
            false,
        );
        assert!(!state_dependent.is_explicit(&q));
    }

    #[test]
    fn unbound_target_is_a_switch_error() {
        let mut q = quantities();
        let mut switch =
            time_switch(0.0, false).with_change(FormulaChange::new(99, Formula::constant(1.0), true));
        let err = switch.perform(&mut q, &mut [0.0], 0.0).expect_err("unbound");
        assert!(err.to_string().contains("Switch 5"));
    }
}
