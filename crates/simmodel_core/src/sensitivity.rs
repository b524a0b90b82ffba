//! Cached symbolic derivatives for forward sensitivity analysis.
//!
//! For every sensitivity parameter `p` the cache holds `∂f_i/∂p` of each ODE species'
//! right-hand side, and for observers `∂obs/∂y_j` and `∂obs/∂p`. All derivatives are
//! simplified for the current run, so the cache must be rebuilt whenever a run starts
//! or a switch replaces a governing formula.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::formula::{DerivativeTarget, Formula, ScaleFactorMode};
use crate::quantity::{Quantities, QuantityId};

#[derive(Debug, Clone, Default)]
pub(crate) struct SensitivityCache {
    /// Ids of the sensitivity parameters, in channel order.
    parameter_ids: Vec<QuantityId>,
    /// `[parameter][ode_index]`, `None` when the derivative is zero.
    rhs_derivatives: Vec<Vec<Option<Formula>>>,
    /// `[observer]` list of `(ode_index, ∂obs/∂y_j)`.
    observer_state_derivatives: Vec<Vec<(usize, Formula)>>,
    /// `[parameter][observer]`.
    observer_parameter_derivatives: Vec<Vec<Option<Formula>>>,
}

fn nonzero(formula: Formula, quantities: &Quantities) -> Option<Formula> {
    let simplified = formula.simplify(true, quantities);
    (!simplified.is_zero(quantities)).then_some(simplified)
}

impl SensitivityCache {
    /// Builds the derivatives for `parameter_ids` over the species listed in ODE order.
    pub(crate) fn build(
        quantities: &Quantities,
        ode_species: &[usize],
        parameter_ids: &[QuantityId],
    ) -> Result<Self> {
        if parameter_ids.is_empty() {
            return Ok(Self::default());
        }

        let mut rhs_derivatives = Vec::with_capacity(parameter_ids.len());
        let mut observer_parameter_derivatives = Vec::with_capacity(parameter_ids.len());
        for &id in parameter_ids {
            let target = DerivativeTarget::Parameter(id);
            let mut per_species = Vec::with_capacity(ode_species.len());
            for &slot in ode_species {
                let mut terms = Vec::new();
                for term in quantities.species[slot].rhs() {
                    terms.push(term.symbolic_derivative(target, quantities)?);
                }
                per_species.push(nonzero(Formula::sum(terms), quantities));
            }
            rhs_derivatives.push(per_species);

            let mut per_observer = Vec::with_capacity(quantities.observers.len());
            for observer in &quantities.observers {
                per_observer.push(match observer.core.formula() {
                    Some(formula) => {
                        nonzero(formula.symbolic_derivative(target, quantities)?, quantities)
                    }
                    None => None,
                });
            }
            observer_parameter_derivatives.push(per_observer);
        }

        let none = BTreeSet::new();
        let mut observer_state_derivatives = Vec::with_capacity(quantities.observers.len());
        for observer in &quantities.observers {
            let mut derivatives = Vec::new();
            if let Some(formula) = observer.core.formula() {
                let mut used = BTreeSet::new();
                formula.append_used_variables(&mut used, &none, quantities);
                for index in used {
                    let derivative =
                        formula.symbolic_derivative(DerivativeTarget::Variable(index), quantities)?;
                    if let Some(derivative) = nonzero(derivative, quantities) {
                        derivatives.push((index, derivative));
                    }
                }
            }
            observer_state_derivatives.push(derivatives);
        }

        Ok(Self {
            parameter_ids: parameter_ids.to_vec(),
            rhs_derivatives,
            observer_state_derivatives,
            observer_parameter_derivatives,
        })
    }

    pub(crate) fn parameter_count(&self) -> usize {
        self.parameter_ids.len()
    }

    pub(crate) fn parameter_ids(&self) -> &[QuantityId] {
        &self.parameter_ids
    }

    /// `∂f_i/∂p` in real units; zero when the right-hand side does not depend on `p`.
    pub(crate) fn rhs_parameter_derivative(
        &self,
        parameter: usize,
        ode_index: usize,
        quantities: &Quantities,
        y: &[f64],
        time: f64,
    ) -> Result<f64> {
        match &self.rhs_derivatives[parameter][ode_index] {
            Some(formula) => formula.evaluate(quantities, y, time, ScaleFactorMode::Use),
            None => Ok(0.0),
        }
    }

    /// Total sensitivity of an observer: `Σ_j ∂obs/∂y_j s_j + ∂obs/∂p`, with `sens`
    /// the scaled state sensitivities of this parameter.
    pub(crate) fn observer_sensitivity(
        &self,
        observer: usize,
        parameter: usize,
        quantities: &Quantities,
        y: &[f64],
        time: f64,
        sens: &[f64],
    ) -> Result<f64> {
        let mut total = match &self.observer_parameter_derivatives[parameter][observer] {
            Some(formula) => formula.evaluate(quantities, y, time, ScaleFactorMode::Use)?,
            None => 0.0,
        };
        for (index, derivative) in &self.observer_state_derivatives[observer] {
            let weight = sens.get(*index).copied().unwrap_or(0.0);
            if weight != 0.0 {
                total += derivative.evaluate(quantities, y, time, ScaleFactorMode::Use)? * weight;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::VariableRef;
    use crate::quantity::{Observer, Parameter, QuantityReference, RefTarget, Species};
    use approx::assert_relative_eq;

    fn k_ref() -> Formula {
        Formula::new(crate::formula::Node::Parameter(QuantityReference {
            alias: "k".into(),
            quantity_id: Some(5),
            target: RefTarget::Parameter(0),
        }))
    }

    fn decay_model() -> Quantities {
        let mut quantities = Quantities::default();
        let mut k = Parameter::new(5, "k", 0.5);
        k.calculate_sensitivity = true;
        quantities.parameters.push(k);
        let mut species = Species::new(10, "A", 2.0);
        species.ode_index = Some(0);
        let y = Formula::variable(VariableRef::bound("A", 0, 1.0));
        species.add_rhs(Formula::product(vec![
            Formula::constant(-1.0),
            k_ref(),
            y.clone(),
        ]));
        quantities.species.push(species);
        quantities.observers.push(Observer::new(
            20,
            "twice_A_times_k",
            Formula::product(vec![Formula::constant(2.0), y, k_ref()]),
        ));
        quantities
    }

    #[test]
    fn rhs_derivative_with_respect_to_rate_constant() {
        let quantities = decay_model();
        let cache = SensitivityCache::build(&quantities, &[0], &[5]).unwrap();
        assert_eq!(cache.parameter_count(), 1);
        let value = cache
            .rhs_parameter_derivative(0, 0, &quantities, &[3.0], 0.0)
            .unwrap();
        assert_relative_eq!(value, -3.0);
    }

    #[test]
    fn observer_sensitivity_combines_state_and_parameter_terms() {
        let quantities = decay_model();
        let cache = SensitivityCache::build(&quantities, &[0], &[5]).unwrap();
        // d(2 A k)/dk = 2 k dA/dk + 2 A
        let value = cache
            .observer_sensitivity(0, 0, &quantities, &[3.0], 0.0, &[-4.0])
            .unwrap();
        assert_relative_eq!(value, 2.0 * 0.5 * -4.0 + 2.0 * 3.0);
    }

    #[test]
    fn no_parameters_gives_empty_cache() {
        let quantities = decay_model();
        let cache = SensitivityCache::build(&quantities, &[0], &[]).unwrap();
        assert_eq!(cache.parameter_count(), 0);
        assert!(cache.parameter_ids().is_empty());
    }
}
