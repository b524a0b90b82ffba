//! Parameters, species and observers: the named value sources formulas refer to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};
use crate::formula::{Formula, FormulaId, ScaleFactorMode};

pub type QuantityId = i64;

/// Quantity id reported for the independent variable by dependency extraction.
pub const TIME_QUANTITY_ID: QuantityId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantityKind {
    Parameter,
    Species,
    Observer,
}

/// What a [`QuantityReference`] is bound to. Slots index the tables in [`Quantities`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefTarget {
    Unresolved,
    Time,
    Parameter(usize),
    Species {
        slot: usize,
        ode_index: Option<usize>,
        scale_factor: f64,
    },
    Observer(usize),
}

/// Non-owning link from a formula leaf to a quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantityReference {
    pub alias: String,
    /// Explicit target id set by a loader; otherwise the alias is looked up by name.
    pub quantity_id: Option<QuantityId>,
    pub(crate) target: RefTarget,
}

impl QuantityReference {
    pub fn unresolved(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            quantity_id: None,
            target: RefTarget::Unresolved,
        }
    }

    pub fn with_id(alias: impl Into<String>, quantity_id: QuantityId) -> Self {
        Self {
            alias: alias.into(),
            quantity_id: Some(quantity_id),
            target: RefTarget::Unresolved,
        }
    }

    pub fn target(&self) -> RefTarget {
        self.target
    }

    pub fn is_time(&self) -> bool {
        matches!(self.target, RefTarget::Time)
    }
}

/// State shared by every quantity kind.
#[derive(Debug, Clone)]
pub struct QuantityCore {
    pub id: QuantityId,
    pub entity_id: String,
    pub name: String,
    pub container_path: String,
    pub is_persistable: bool,
    /// Not varied between runs; only fixed quantities fold permanently.
    pub is_fixed: bool,
    pub(crate) is_changed_by_switch: bool,
    value: f64,
    original_value: f64,
    formula: Option<Formula>,
    original_formula: Option<Formula>,
    pub(crate) values: Vec<f64>,
    pub(crate) sensitivities: BTreeMap<QuantityId, Vec<f64>>,
}

impl QuantityCore {
    pub fn new(id: QuantityId, name: impl Into<String>) -> Self {
        Self {
            id,
            entity_id: String::new(),
            name: name.into(),
            container_path: String::new(),
            is_persistable: true,
            is_fixed: true,
            is_changed_by_switch: false,
            value: 0.0,
            original_value: 0.0,
            formula: None,
            original_formula: None,
            values: Vec::new(),
            sensitivities: BTreeMap::new(),
        }
    }

    pub fn full_name(&self) -> String {
        if self.container_path.is_empty() {
            self.name.clone()
        } else {
            format!("{}|{}", self.container_path, self.name)
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn formula(&self) -> Option<&Formula> {
        self.formula.as_ref()
    }

    pub fn is_changed_by_switch(&self) -> bool {
        self.is_changed_by_switch
    }

    /// Replaces value and formula permanently (survives run resets).
    pub fn set_initial_value(&mut self, value: f64) {
        self.value = value;
        self.original_value = value;
        self.formula = None;
        self.original_formula = None;
    }

    /// Installs a defining formula permanently.
    pub fn set_initial_formula(&mut self, formula: Formula) {
        self.original_formula = Some(formula.clone());
        self.formula = Some(formula);
    }

    /// Fixes the value for the rest of the current run.
    pub fn set_constant_value(&mut self, value: f64) {
        self.formula = None;
        self.value = value;
    }

    /// Swaps the governing formula for the rest of the current run.
    pub(crate) fn set_formula(&mut self, formula: Formula) {
        self.formula = Some(formula);
    }

    pub(crate) fn take_formula(&mut self) -> Option<Formula> {
        self.formula.take()
    }

    pub(crate) fn formula_mut(&mut self) -> Option<&mut Formula> {
        self.formula.as_mut()
    }

    pub(crate) fn original_formula_mut(&mut self) -> Option<&mut Formula> {
        self.original_formula.as_mut()
    }

    /// True when the installed formula has the given id.
    pub fn is_formula_equal_to(&self, formula_id: FormulaId) -> bool {
        self.formula
            .as_ref()
            .map(|f| f.id() == formula_id)
            .unwrap_or(false)
    }

    /// Restores the value and formula loaded before the first run.
    pub fn reset_state(&mut self) {
        self.value = self.original_value;
        self.formula = self.original_formula.clone();
        self.values.clear();
        self.sensitivities.clear();
    }

    pub fn is_constant(&self, for_current_run_only: bool) -> bool {
        if for_current_run_only {
            return self.formula.is_none() && !self.is_changed_by_switch;
        }
        self.formula.is_none() && self.is_fixed && !self.is_changed_by_switch
    }

    /// Makes a folded value permanent when it does not depend on the current run.
    pub(crate) fn commit_simplified(&mut self, value: f64, for_current_run_only: bool) {
        self.value = value;
        self.formula = None;
        if !for_current_run_only {
            self.original_value = value;
            self.original_formula = None;
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn sensitivity_values(&self, parameter_id: QuantityId) -> Option<&[f64]> {
        self.sensitivities.get(&parameter_id).map(|v| v.as_slice())
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub core: QuantityCore,
    pub can_be_varied: bool,
    pub calculate_sensitivity: bool,
}

impl Parameter {
    pub fn new(id: QuantityId, name: impl Into<String>, value: f64) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.set_initial_value(value);
        core.is_persistable = false;
        Self {
            core,
            can_be_varied: true,
            calculate_sensitivity: false,
        }
    }

    pub fn with_formula(id: QuantityId, name: impl Into<String>, formula: Formula) -> Self {
        let mut parameter = Parameter::new(id, name, 0.0);
        parameter.core.set_initial_formula(formula);
        parameter
    }

    /// Sensitivity parameters never fold into constants.
    pub fn is_constant(&self, for_current_run_only: bool) -> bool {
        self.core.is_constant(for_current_run_only) && !self.calculate_sensitivity
    }

    pub fn is_table(&self) -> bool {
        self.core.formula().map(Formula::is_table).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Species {
    pub core: QuantityCore,
    pub negative_values_allowed: bool,
    scale_factor: f64,
    pub(crate) ode_index: Option<usize>,
    pub(crate) rhs: Vec<Formula>,
}

impl Species {
    pub fn new(id: QuantityId, name: impl Into<String>, initial_value: f64) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.set_initial_value(initial_value);
        Self {
            core,
            negative_values_allowed: false,
            scale_factor: 1.0,
            ode_index: None,
            rhs: Vec::new(),
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn set_scale_factor(&mut self, scale_factor: f64) -> Result<()> {
        if !(scale_factor > 0.0) || !scale_factor.is_finite() {
            return Err(SimulationError::Quantity {
                quantity_id: self.core.id,
                message: format!("Scale factor must be > 0 (got {scale_factor})"),
            });
        }
        self.scale_factor = scale_factor;
        Ok(())
    }

    pub fn ode_index(&self) -> Option<usize> {
        self.ode_index
    }

    pub fn rhs(&self) -> &[Formula] {
        &self.rhs
    }

    pub fn add_rhs(&mut self, formula: Formula) {
        self.rhs.push(formula);
    }

    /// No right-hand side and never written by a switch.
    pub fn is_constant_during_calculation(&self) -> bool {
        self.rhs.is_empty() && !self.core.is_changed_by_switch
    }

    pub fn is_constant(&self, for_current_run_only: bool) -> bool {
        self.core.is_constant(for_current_run_only) && self.is_constant_during_calculation()
    }
}

#[derive(Debug, Clone)]
pub struct Observer {
    pub core: QuantityCore,
}

impl Observer {
    pub fn new(id: QuantityId, name: impl Into<String>, formula: Formula) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.set_initial_formula(formula);
        Self { core }
    }
}

/// The quantity tables every formula operation reads through.
#[derive(Debug, Clone, Default)]
pub struct Quantities {
    pub parameters: Vec<Parameter>,
    pub species: Vec<Species>,
    pub observers: Vec<Observer>,
}

impl Quantities {
    pub fn core(&self, kind: QuantityKind, slot: usize) -> &QuantityCore {
        match kind {
            QuantityKind::Parameter => &self.parameters[slot].core,
            QuantityKind::Species => &self.species[slot].core,
            QuantityKind::Observer => &self.observers[slot].core,
        }
    }

    /// Current value of a referenced quantity.
    pub fn value_of(
        &self,
        reference: &QuantityReference,
        formula_id: FormulaId,
        y: &[f64],
        time: f64,
        mode: ScaleFactorMode,
    ) -> Result<f64> {
        match reference.target {
            RefTarget::Unresolved => Err(SimulationError::configuration(
                formula_id,
                format!("Reference '{}' is not resolved", reference.alias),
            )),
            RefTarget::Time => Ok(time),
            RefTarget::Parameter(slot) => {
                let parameter = self.parameter(slot, formula_id)?;
                match parameter.core.formula() {
                    Some(formula) => formula.evaluate(self, y, time, mode),
                    None => Ok(parameter.core.value()),
                }
            }
            RefTarget::Species {
                slot,
                ode_index,
                scale_factor,
            } => {
                let species = self.species.get(slot).ok_or_else(|| {
                    SimulationError::configuration(formula_id, "Species slot out of range")
                })?;
                match ode_index {
                    Some(index) if !species.is_constant_during_calculation() => {
                        let value = read_state(y, index, formula_id)?;
                        Ok(match mode {
                            ScaleFactorMode::Use => value * scale_factor,
                            ScaleFactorMode::Ignore => value,
                        })
                    }
                    _ => match species.core.formula() {
                        Some(formula) => formula.evaluate(self, y, time, ScaleFactorMode::Ignore),
                        None => Ok(species.core.value()),
                    },
                }
            }
            RefTarget::Observer(slot) => {
                let observer = self.observers.get(slot).ok_or_else(|| {
                    SimulationError::configuration(formula_id, "Observer slot out of range")
                })?;
                match observer.core.formula() {
                    Some(formula) => formula.evaluate(self, y, time, mode),
                    None => Ok(observer.core.value()),
                }
            }
        }
    }

    /// Whether a referenced quantity is constant (globally or for the current run).
    pub fn is_constant(&self, reference: &QuantityReference, for_current_run_only: bool) -> bool {
        match reference.target {
            RefTarget::Unresolved | RefTarget::Time => false,
            RefTarget::Parameter(slot) => self
                .parameters
                .get(slot)
                .map(|p| p.is_constant(for_current_run_only))
                .unwrap_or(false),
            RefTarget::Species { slot, .. } => self
                .species
                .get(slot)
                .map(|s| s.is_constant(for_current_run_only))
                .unwrap_or(false),
            RefTarget::Observer(slot) => self
                .observers
                .get(slot)
                .map(|o| o.core.is_constant(for_current_run_only))
                .unwrap_or(false),
        }
    }

    pub(crate) fn parameter(&self, slot: usize, formula_id: FormulaId) -> Result<&Parameter> {
        self.parameters.get(slot).ok_or_else(|| {
            SimulationError::configuration(formula_id, "Parameter slot out of range")
        })
    }
}

pub(crate) fn read_state(y: &[f64], index: usize, formula_id: FormulaId) -> Result<f64> {
    y.get(index).copied().ok_or_else(|| {
        SimulationError::configuration(
            formula_id,
            format!("State index {index} is not available (state has {} entries)", y.len()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_state_restores_loaded_formula_and_value() {
        let mut core = QuantityCore::new(3, "k");
        core.set_initial_value(2.0);
        core.set_constant_value(5.0);
        core.values.push(1.0);
        assert_eq!(core.value(), 5.0);
        core.reset_state();
        assert_eq!(core.value(), 2.0);
        assert!(core.values().is_empty());

        core.set_initial_formula(Formula::constant(4.0));
        core.set_constant_value(1.0);
        assert!(core.formula().is_none());
        core.reset_state();
        assert_eq!(core.formula().and_then(Formula::as_constant), Some(4.0));
    }

    #[test]
    fn constness_respects_fixed_and_switch_flags() {
        let mut parameter = Parameter::new(1, "p", 1.0);
        assert!(parameter.is_constant(false));
        parameter.core.is_fixed = false;
        assert!(!parameter.is_constant(false));
        assert!(parameter.is_constant(true));
        parameter.core.is_changed_by_switch = true;
        assert!(!parameter.is_constant(true));

        let mut sensitive = Parameter::new(2, "q", 1.0);
        sensitive.calculate_sensitivity = true;
        assert!(!sensitive.is_constant(true));
    }

    #[test]
    fn species_scale_factor_must_be_positive() {
        let mut species = Species::new(10, "A", 1.0);
        let err = species.set_scale_factor(0.0).expect_err("zero scale factor");
        assert!(err.to_string().contains("Scale factor must be > 0"));
        species.set_scale_factor(2.0).unwrap();
        assert_eq!(species.scale_factor(), 2.0);
    }

    #[test]
    fn species_reads_scaled_state_through_reference() {
        let mut quantities = Quantities::default();
        let mut species = Species::new(10, "A", 1.0);
        species.add_rhs(Formula::constant(1.0));
        quantities.species.push(species);
        let reference = QuantityReference {
            alias: "A".into(),
            quantity_id: Some(10),
            target: RefTarget::Species {
                slot: 0,
                ode_index: Some(0),
                scale_factor: 4.0,
            },
        };
        let y = [0.5];
        let used = quantities
            .value_of(&reference, 1, &y, 0.0, ScaleFactorMode::Use)
            .unwrap();
        let ignored = quantities
            .value_of(&reference, 1, &y, 0.0, ScaleFactorMode::Ignore)
            .unwrap();
        assert_eq!(used, 2.0);
        assert_eq!(ignored, 0.5);
    }

    #[test]
    fn unresolved_reference_names_formula() {
        let quantities = Quantities::default();
        let reference = QuantityReference::unresolved("k1");
        let err = quantities
            .value_of(&reference, 77, &[], 0.0, ScaleFactorMode::Use)
            .expect_err("unresolved");
        let message = err.to_string();
        assert!(message.contains("Formula 77"));
        assert!(message.contains("k1"));
    }
}
