use std::collections::BTreeSet;

use super::{Formula, Node, ScaleFactorMode, VariableRef};
use crate::error::{Result, SimulationError};
use crate::quantity::{Quantities, QuantityId, QuantityReference, RefTarget, TIME_QUANTITY_ID};

impl VariableRef {
    fn refresh(&mut self, quantities: &Quantities) {
        if let Some(species) = self.species.and_then(|slot| quantities.species.get(slot)) {
            self.ode_index = species.ode_index();
            self.scale_factor = species.scale_factor();
        }
    }
}

impl QuantityReference {
    fn refresh(&mut self, quantities: &Quantities) {
        if let RefTarget::Species { slot, .. } = self.target {
            if let Some(species) = quantities.species.get(slot) {
                self.target = RefTarget::Species {
                    slot,
                    ode_index: species.ode_index(),
                    scale_factor: species.scale_factor(),
                };
            }
        }
    }
}

/// A bound reference turned into a direct state read when the target is integrated.
fn state_read(alias: &str, target: RefTarget) -> Option<VariableRef> {
    match target {
        RefTarget::Species {
            slot,
            ode_index: Some(index),
            scale_factor,
        } => Some(VariableRef {
            alias: alias.to_string(),
            species: Some(slot),
            ode_index: Some(index),
            scale_factor,
        }),
        _ => None,
    }
}

impl Formula {
    /// Collects the ODE indices this formula reads, directly or through referenced
    /// quantities. A parameter written by a switch counts as reading every variable in
    /// `switch_variables`, since its value can come from any switch assignment.
    pub fn append_used_variables(
        &self,
        used: &mut BTreeSet<usize>,
        switch_variables: &BTreeSet<usize>,
        quantities: &Quantities,
    ) {
        match &self.node {
            Node::Variable(variable) => {
                if let Some(index) = variable.ode_index {
                    used.insert(index);
                }
            }
            Node::SimpleProduct { variables, .. } => {
                used.extend(variables.iter().filter_map(|v| v.ode_index));
            }
            Node::Parameter(reference) => match reference.target {
                RefTarget::Species {
                    slot,
                    ode_index,
                    ..
                } => {
                    let species = quantities.species.get(slot);
                    match (ode_index, species) {
                        (Some(index), Some(s)) if !s.is_constant_during_calculation() => {
                            used.insert(index);
                        }
                        (_, Some(s)) => {
                            if let Some(formula) = s.core.formula() {
                                formula.append_used_variables(used, switch_variables, quantities);
                            }
                        }
                        _ => {}
                    }
                }
                RefTarget::Parameter(slot) => {
                    if let Some(parameter) = quantities.parameters.get(slot) {
                        if parameter.core.is_changed_by_switch() {
                            used.extend(switch_variables.iter().copied());
                        }
                        if let Some(formula) = parameter.core.formula() {
                            formula.append_used_variables(used, switch_variables, quantities);
                        }
                    }
                }
                RefTarget::Observer(slot) => {
                    if let Some(formula) = quantities.observers.get(slot).and_then(|o| o.core.formula()) {
                        formula.append_used_variables(used, switch_variables, quantities);
                    }
                }
                RefTarget::Unresolved | RefTarget::Time => {}
            },
            _ => self.for_each_child(&mut |child| {
                child.append_used_variables(used, switch_variables, quantities)
            }),
        }
    }

    /// Collects the ids of parameters this formula reads; time counts as
    /// [`TIME_QUANTITY_ID`].
    pub fn append_used_parameters(&self, used: &mut BTreeSet<QuantityId>, quantities: &Quantities) {
        match &self.node {
            Node::Time | Node::Table(_) => {
                used.insert(TIME_QUANTITY_ID);
            }
            Node::TableWithOffset { offset, .. } => {
                used.insert(TIME_QUANTITY_ID);
                offset.append_used_parameters(used, quantities);
            }
            Node::Parameter(reference) => match reference.target {
                RefTarget::Time => {
                    used.insert(TIME_QUANTITY_ID);
                }
                RefTarget::Parameter(slot) => {
                    if let Some(parameter) = quantities.parameters.get(slot) {
                        used.insert(parameter.core.id);
                        if let Some(formula) = parameter.core.formula() {
                            formula.append_used_parameters(used, quantities);
                        }
                    }
                }
                RefTarget::Species { slot, .. } => {
                    let formula = quantities
                        .species
                        .get(slot)
                        .filter(|s| s.is_constant_during_calculation())
                        .and_then(|s| s.core.formula());
                    if let Some(formula) = formula {
                        formula.append_used_parameters(used, quantities);
                    }
                }
                RefTarget::Observer(slot) => {
                    if let Some(formula) = quantities.observers.get(slot).and_then(|o| o.core.formula()) {
                        formula.append_used_parameters(used, quantities);
                    }
                }
                RefTarget::Unresolved => {}
            },
            _ => self.for_each_child(&mut |child| child.append_used_parameters(used, quantities)),
        }
    }

    /// Re-reads cached ODE indices and scale factors after indices were (re)assigned.
    pub fn update_indices_of_referenced_variables(&mut self, quantities: &Quantities) {
        match &mut self.node {
            Node::Variable(variable) => variable.refresh(quantities),
            Node::SimpleProduct { variables, .. } => {
                variables.iter_mut().for_each(|v| v.refresh(quantities));
            }
            Node::Parameter(reference) => reference.refresh(quantities),
            _ => self.for_each_child_mut(&mut |child| {
                child.update_indices_of_referenced_variables(quantities)
            }),
        }
    }

    /// Sets the explicit target id of every reference named `alias`.
    pub fn bind_alias(&mut self, alias: &str, quantity_id: QuantityId) {
        match &mut self.node {
            Node::Parameter(reference) if reference.alias == alias => {
                reference.quantity_id = Some(quantity_id);
                reference.target = RefTarget::Unresolved;
            }
            _ => self.for_each_child_mut(&mut |child| child.bind_alias(alias, quantity_id)),
        }
    }

    /// Binds every reference through `lookup`.
    ///
    /// References to integrated species become direct state reads; state reads of
    /// quantities that are not integrated become quantity references. Already bound
    /// state reads are left alone.
    pub fn resolve_references(
        &mut self,
        lookup: &dyn Fn(&str, Option<QuantityId>) -> Option<RefTarget>,
    ) -> Result<()> {
        let id = self.id;
        let unresolved = |alias: &str| {
            SimulationError::configuration(id, format!("Cannot resolve reference '{alias}'"))
        };

        match &mut self.node {
            Node::Parameter(reference) => {
                let target = lookup(&reference.alias, reference.quantity_id)
                    .ok_or_else(|| unresolved(&reference.alias))?;
                match state_read(&reference.alias, target) {
                    Some(variable) => self.node = Node::Variable(variable),
                    None => reference.target = target,
                }
            }
            Node::Variable(variable) => {
                if variable.ode_index.is_some() && variable.species.is_none() {
                    return Ok(());
                }
                let target =
                    lookup(&variable.alias, None).ok_or_else(|| unresolved(&variable.alias))?;
                match state_read(&variable.alias, target) {
                    Some(bound) => *variable = bound,
                    None => {
                        self.node = Node::Parameter(QuantityReference {
                            alias: variable.alias.clone(),
                            quantity_id: None,
                            target,
                        })
                    }
                }
            }
            Node::SimpleProduct { factor, variables } => {
                let mut targets = Vec::with_capacity(variables.len());
                for variable in variables.iter() {
                    if variable.ode_index.is_some() && variable.species.is_none() {
                        targets.push(None);
                        continue;
                    }
                    let target =
                        lookup(&variable.alias, None).ok_or_else(|| unresolved(&variable.alias))?;
                    targets.push(Some(target));
                }
                let all_integrated = targets
                    .iter()
                    .zip(variables.iter())
                    .all(|(t, v)| t.map(|t| state_read(&v.alias, t).is_some()).unwrap_or(true));
                if all_integrated {
                    for (variable, target) in variables.iter_mut().zip(targets) {
                        if let Some(bound) = target.and_then(|t| state_read(&variable.alias, t)) {
                            *variable = bound;
                        }
                    }
                } else {
                    // some factor is not a state variable: expand into a plain product
                    let mut factors = vec![Formula::with_id(id, Node::Constant(*factor))];
                    for (variable, target) in variables.iter().zip(targets) {
                        let node = match target {
                            None => Node::Variable(variable.clone()),
                            Some(t) => match state_read(&variable.alias, t) {
                                Some(bound) => Node::Variable(bound),
                                None => Node::Parameter(QuantityReference {
                                    alias: variable.alias.clone(),
                                    quantity_id: None,
                                    target: t,
                                }),
                            },
                        };
                        factors.push(Formula::with_id(id, node));
                    }
                    self.node = Node::Product(factors);
                }
            }
            _ => {
                let mut result = Ok(());
                self.for_each_child_mut(&mut |child| {
                    if result.is_ok() {
                        result = child.resolve_references(lookup);
                    }
                });
                result?;
            }
        }
        Ok(())
    }

    /// Whether the value can change with the state vector or with time.
    pub fn depends_on_state_or_time(&self, quantities: &Quantities) -> bool {
        self.depends_on(quantities, true)
    }

    /// True when no state variable is read, directly or through referenced quantities.
    pub fn uses_no_state(&self, quantities: &Quantities) -> bool {
        !self.depends_on(quantities, false)
    }

    fn depends_on(&self, quantities: &Quantities, include_time: bool) -> bool {
        match &self.node {
            Node::Constant(_) => false,
            Node::Time | Node::Table(_) => include_time,
            Node::TableWithOffset { offset, .. } => {
                include_time || offset.depends_on(quantities, include_time)
            }
            Node::Variable(_) => true,
            Node::SimpleProduct { variables, .. } => !variables.is_empty(),
            Node::Parameter(reference) => match reference.target {
                RefTarget::Unresolved => true,
                RefTarget::Time => include_time,
                RefTarget::Parameter(slot) => quantities
                    .parameters
                    .get(slot)
                    .and_then(|p| p.core.formula())
                    .map(|f| f.depends_on(quantities, include_time))
                    .unwrap_or(false),
                RefTarget::Species { slot, ode_index, .. } => match quantities.species.get(slot) {
                    Some(s) if ode_index.is_some() && !s.is_constant_during_calculation() => true,
                    Some(s) => s
                        .core
                        .formula()
                        .map(|f| f.depends_on(quantities, include_time))
                        .unwrap_or(false),
                    None => true,
                },
                RefTarget::Observer(slot) => quantities
                    .observers
                    .get(slot)
                    .and_then(|o| o.core.formula())
                    .map(|f| f.depends_on(quantities, include_time))
                    .unwrap_or(false),
            },
            _ => {
                let mut depends = false;
                self.for_each_child(&mut |child| {
                    depends = depends || child.depends_on(quantities, include_time);
                });
                depends
            }
        }
    }

    /// Times at which a `Time OP expr` comparison inside this condition flips, for
    /// comparisons whose other side does not change during the run.
    pub fn switch_time_points(&self, quantities: &Quantities) -> Vec<f64> {
        match &self.node {
            Node::Relational(_, a, b) => {
                let other = if a.is_time() {
                    b
                } else if b.is_time() {
                    a
                } else {
                    return Vec::new();
                };
                if other.depends_on_state_or_time(quantities) {
                    return Vec::new();
                }
                other
                    .evaluate(quantities, &[], 0.0, ScaleFactorMode::Use)
                    .ok()
                    .filter(|t| t.is_finite())
                    .into_iter()
                    .collect()
            }
            Node::Logical(_, operands) => operands
                .iter()
                .flat_map(|o| o.switch_time_points(quantities))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Restart times of every table inside this formula. A table read at a shifted time
    /// contributes its times only once the offset is a folded constant.
    pub fn restart_time_points(&self) -> Vec<f64> {
        match &self.node {
            Node::Table(table) => table.restart_times().to_vec(),
            Node::TableWithOffset { table, offset } => match offset.as_constant() {
                Some(shift) => table.restart_times().iter().map(|t| t + shift).collect(),
                None => offset.restart_time_points(),
            },
            Node::TableWithArgument { table, argument } if argument.is_time() => {
                table.restart_times().to_vec()
            }
            _ => {
                let mut times = Vec::new();
                self.for_each_child(&mut |child| times.extend(child.restart_time_points()));
                times
            }
        }
    }
}
