//! Model assembly, finalization and the solve loop.
//!
//! A [`Simulation`] is built structurally (parameters, species, observers, switches),
//! then [`Simulation::finalize`] binds every reference and prepares the ODE system.
//! [`Simulation::run`] integrates over the merged output/switch schedule and returns a
//! [`SimulationOutput`]. Runs are repeatable: every run starts from the loaded state.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::bandwidth::reverse_cuthill_mckee;
use crate::error::{Result, SimulationError, SolverWarning};
use crate::formula::{DerivativeTarget, Formula, ScaleFactorMode};
use crate::linalg::LinearSolver;
use crate::options::{SimulationOptions, SolverProperties};
use crate::output::{QuantityValues, SimulationOutput};
use crate::quantity::{
    Observer, Parameter, Quantities, QuantityCore, QuantityId, QuantityKind, RefTarget, Species,
};
use crate::schedule::{build_schedule, OutputSchema, OutputTimePoint};
use crate::sensitivity::SensitivityCache;
use crate::solvers::{BdfIntegrator, IntegratorError};
use crate::switch::{Switch, SwitchTarget};
use crate::system::{ModelSystem, RhsGuard};

/// Caller-owned flag that stops a running simulation at the next output time.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives the run progress in percent.
pub type ProgressCallback = Box<dyn FnMut(u32)>;

/// What a failed integration step turns into.
enum StepFailure {
    Fatal(SimulationError),
    Warning { message: String, reducible: bool },
}

fn classify_failure(err: IntegratorError, saw_non_finite: bool) -> StepFailure {
    let time = err.time();
    match err {
        IntegratorError::RhsFailure { time, source } => match source.downcast::<SimulationError>() {
            Ok(err) => StepFailure::Fatal(err),
            Err(source) => {
                StepFailure::Fatal(SimulationError::Integrator(IntegratorError::RhsFailure {
                    time,
                    source,
                }))
            }
        },
        _ if saw_non_finite => StepFailure::Fatal(SimulationError::InfiniteRhs { time }),
        err => StepFailure::Warning {
            message: err.to_string(),
            reducible: err.is_tolerance_reducible(),
        },
    }
}

/// Failures of integrator setup and restarts always abort the run.
fn setup_failure(err: IntegratorError, saw_non_finite: bool) -> SimulationError {
    let time = err.time();
    match classify_failure(err, saw_non_finite) {
        StepFailure::Fatal(err) => err,
        StepFailure::Warning { message, reducible } => SimulationError::Solver {
            time,
            message,
            reducible,
        },
    }
}

/// Runs `attempt` until it succeeds, dividing both tolerances by 10 after every
/// reducible failure. Returns the result, the tolerances used and whether they were
/// reduced.
pub(crate) fn with_tolerance_reduction<T>(
    mut props: SolverProperties,
    auto_reduce: bool,
    mut attempt: impl FnMut(SolverProperties) -> Result<T>,
) -> Result<(T, SolverProperties, bool)> {
    let mut reduced = false;
    loop {
        match attempt(props) {
            Ok(value) => return Ok((value, props, reduced)),
            Err(err) if auto_reduce && err.is_tolerance_reducible() => {
                let time = err.time().unwrap_or(0.0);
                let Some((abs_tol, rel_tol)) = props.reduced_tolerances() else {
                    return Err(SimulationError::ToleranceFloorReached {
                        time,
                        abs_tol: props.abs_tol,
                        rel_tol: props.rel_tol,
                    });
                };
                info!("{err}; retrying with AbsTol={abs_tol:e}, RelTol={rel_tol:e}");
                props.abs_tol = abs_tol;
                props.rel_tol = rel_tol;
                reduced = true;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Stores `value` as the next history entry, or as the only one for quantities whose
/// history is not kept.
fn record(values: &mut Vec<f64>, value: f64, persistable: bool) {
    if !persistable {
        values.clear();
    }
    values.push(value);
}

fn resolve_core(
    core: &mut QuantityCore,
    lookup: &dyn Fn(&str, Option<QuantityId>) -> Option<RefTarget>,
) -> Result<()> {
    if let Some(formula) = core.original_formula_mut() {
        formula.resolve_references(lookup)?;
    }
    if let Some(formula) = core.formula_mut() {
        formula.resolve_references(lookup)?;
    }
    Ok(())
}

fn refresh_core(core: &mut QuantityCore, snapshot: &Quantities) {
    if let Some(formula) = core.original_formula_mut() {
        formula.update_indices_of_referenced_variables(snapshot);
    }
    if let Some(formula) = core.formula_mut() {
        formula.update_indices_of_referenced_variables(snapshot);
    }
}

pub struct Simulation {
    pub options: SimulationOptions,
    pub solver_properties: SolverProperties,
    pub output_schema: OutputSchema,
    pub start_time: f64,
    quantities: Quantities,
    switches: Vec<Switch>,
    /// Species slot of every ODE index.
    ode_species: Vec<usize>,
    /// Half-bandwidths after reordering, when the banded solver is enabled.
    band: Option<(usize, usize)>,
    finalized: bool,
    cancellation: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            options: SimulationOptions::default(),
            solver_properties: SolverProperties::default(),
            output_schema: OutputSchema::default(),
            start_time: 0.0,
            quantities: Quantities::default(),
            switches: Vec::new(),
            ode_species: Vec::new(),
            band: None,
            finalized: false,
            cancellation: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn add_parameter(&mut self, parameter: Parameter) -> usize {
        self.finalized = false;
        self.quantities.parameters.push(parameter);
        self.quantities.parameters.len() - 1
    }

    pub fn add_species(&mut self, species: Species) -> usize {
        self.finalized = false;
        self.quantities.species.push(species);
        self.quantities.species.len() - 1
    }

    pub fn add_observer(&mut self, observer: Observer) -> usize {
        self.finalized = false;
        self.quantities.observers.push(observer);
        self.quantities.observers.len() - 1
    }

    pub fn add_switch(&mut self, switch: Switch) -> usize {
        self.finalized = false;
        self.switches.push(switch);
        self.switches.len() - 1
    }

    pub fn set_output_schema(&mut self, schema: OutputSchema) {
        self.output_schema = schema;
    }

    pub fn set_start_time(&mut self, start_time: f64) {
        self.start_time = start_time;
    }

    pub fn quantities(&self) -> &Quantities {
        &self.quantities
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    /// Parameter with the given id, for changing values between runs.
    pub fn parameter_mut(&mut self, id: QuantityId) -> Option<&mut Parameter> {
        self.quantities.parameters.iter_mut().find(|p| p.core.id == id)
    }

    pub fn ode_count(&self) -> usize {
        self.ode_species.len()
    }

    pub fn half_bandwidths(&self) -> Option<(usize, usize)> {
        self.band
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn set_progress_callback(&mut self, callback: impl FnMut(u32) + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// Binds switch targets and references, simplifies parameters, removes constant
    /// species from the ODE system and assigns ODE indices (bandwidth-reordered when the
    /// banded solver is enabled).
    pub fn finalize(&mut self) -> Result<()> {
        self.options
            .validate()
            .map_err(|e| SimulationError::Options(e.to_string()))?;
        self.bind_switch_targets()?;
        self.assign_ode_indices();
        self.resolve_all_references()?;
        self.refresh_indices();
        self.simplify_parameters(false);
        self.simplify_right_hand_sides();
        self.band = None;
        if self.options.use_banded_solver {
            self.reorder_for_band();
            self.refresh_indices();
        }
        self.finalized = true;
        info!(
            "Simulation finalized: {} parameters, {} species ({} integrated), {} observers, {} switches",
            self.quantities.parameters.len(),
            self.quantities.species.len(),
            self.ode_species.len(),
            self.quantities.observers.len(),
            self.switches.len()
        );
        Ok(())
    }

    fn bind_switch_targets(&mut self) -> Result<()> {
        let quantities = &mut self.quantities;
        for switch in &mut self.switches {
            let switch_id = switch.id;
            for change in switch.changes_mut() {
                let id = change.quantity_id;
                let target = if let Some(slot) =
                    quantities.species.iter().position(|s| s.core.id == id)
                {
                    quantities.species[slot].core.is_changed_by_switch = true;
                    SwitchTarget::Species(slot)
                } else if let Some(slot) =
                    quantities.parameters.iter().position(|p| p.core.id == id)
                {
                    quantities.parameters[slot].core.is_changed_by_switch = true;
                    SwitchTarget::Parameter(slot)
                } else {
                    return Err(SimulationError::Switch {
                        switch_id,
                        message: format!("Target quantity {id} not found"),
                    });
                };
                change.bind(target);
            }
        }
        Ok(())
    }

    fn assign_ode_indices(&mut self) {
        self.ode_species.clear();
        for (slot, species) in self.quantities.species.iter_mut().enumerate() {
            if species.is_constant_during_calculation() {
                species.ode_index = None;
            } else {
                species.ode_index = Some(self.ode_species.len());
                self.ode_species.push(slot);
            }
        }
    }

    /// Name, path and id lookup tables; the first quantity registered under a key wins.
    fn reference_tables(
        &self,
    ) -> (HashMap<String, RefTarget>, HashMap<QuantityId, RefTarget>) {
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        let mut insert = |core: &QuantityCore, target: RefTarget| {
            by_id.entry(core.id).or_insert(target);
            by_name.entry(core.full_name()).or_insert(target);
            by_name.entry(core.name.clone()).or_insert(target);
        };
        for (slot, parameter) in self.quantities.parameters.iter().enumerate() {
            insert(&parameter.core, RefTarget::Parameter(slot));
        }
        for (slot, species) in self.quantities.species.iter().enumerate() {
            insert(
                &species.core,
                RefTarget::Species {
                    slot,
                    ode_index: species.ode_index,
                    scale_factor: species.scale_factor(),
                },
            );
        }
        for (slot, observer) in self.quantities.observers.iter().enumerate() {
            insert(&observer.core, RefTarget::Observer(slot));
        }
        by_name.entry("Time".to_string()).or_insert(RefTarget::Time);
        (by_name, by_id)
    }

    fn resolve_all_references(&mut self) -> Result<()> {
        let (by_name, by_id) = self.reference_tables();
        let lookup = |alias: &str, id: Option<QuantityId>| match id {
            Some(id) => by_id.get(&id).copied(),
            None => by_name.get(alias).copied(),
        };

        for parameter in &mut self.quantities.parameters {
            resolve_core(&mut parameter.core, &lookup)?;
        }
        for species in &mut self.quantities.species {
            resolve_core(&mut species.core, &lookup)?;
            for term in &mut species.rhs {
                term.resolve_references(&lookup)?;
            }
        }
        for observer in &mut self.quantities.observers {
            resolve_core(&mut observer.core, &lookup)?;
        }
        for switch in &mut self.switches {
            switch.condition_mut().resolve_references(&lookup)?;
            for change in switch.changes_mut() {
                change.formula_mut().resolve_references(&lookup)?;
            }
        }
        Ok(())
    }

    /// Re-reads cached ODE indices and scale factors into every formula.
    fn refresh_indices(&mut self) {
        let snapshot = self.quantities.clone();
        for parameter in &mut self.quantities.parameters {
            refresh_core(&mut parameter.core, &snapshot);
        }
        for species in &mut self.quantities.species {
            refresh_core(&mut species.core, &snapshot);
            for term in &mut species.rhs {
                term.update_indices_of_referenced_variables(&snapshot);
            }
        }
        for observer in &mut self.quantities.observers {
            refresh_core(&mut observer.core, &snapshot);
        }
        for switch in &mut self.switches {
            switch
                .condition_mut()
                .update_indices_of_referenced_variables(&snapshot);
            for change in switch.changes_mut() {
                change.refresh_species_index(&snapshot);
                change
                    .formula_mut()
                    .update_indices_of_referenced_variables(&snapshot);
            }
        }
    }

    /// Folds parameter formulas into constants until nothing changes. Permanent folding
    /// (`for_current_run_only == false`) only touches fixed parameters.
    fn simplify_parameters(&mut self, for_current_run_only: bool) {
        loop {
            let mut folded = false;
            for slot in 0..self.quantities.parameters.len() {
                let parameter = &self.quantities.parameters[slot];
                if parameter.calculate_sensitivity
                    || parameter.core.is_changed_by_switch()
                    || (!for_current_run_only && !parameter.core.is_fixed)
                {
                    continue;
                }
                let Some(formula) = self.quantities.parameters[slot].core.formula().cloned()
                else {
                    continue;
                };
                let simplified = formula.simplify(for_current_run_only, &self.quantities);
                let core = &mut self.quantities.parameters[slot].core;
                match simplified.as_constant() {
                    Some(value) => {
                        core.commit_simplified(value, for_current_run_only);
                        folded = true;
                    }
                    None => core.set_formula(simplified),
                }
            }
            if !folded {
                break;
            }
        }
    }

    fn simplify_right_hand_sides(&mut self) {
        for slot in 0..self.quantities.species.len() {
            let simplified: Vec<Formula> = self.quantities.species[slot]
                .rhs
                .iter()
                .cloned()
                .map(|term| term.simplify(false, &self.quantities))
                .collect();
            self.quantities.species[slot].rhs = simplified;
        }
    }

    /// Reverse Cuthill–McKee over the right-hand side dependencies, including the
    /// variables switches read or write.
    fn reorder_for_band(&mut self) {
        let quantities = &self.quantities;
        let mut switch_variables = BTreeSet::new();
        for switch in &self.switches {
            switch.append_used_variables(&mut switch_variables, quantities);
        }

        let mut entries = Vec::new();
        for (row, &slot) in self.ode_species.iter().enumerate() {
            entries.push((row, row));
            let mut used = BTreeSet::new();
            for term in quantities.species[slot].rhs() {
                term.append_used_variables(&mut used, &switch_variables, quantities);
            }
            entries.extend(used.into_iter().map(|col| (row, col)));
        }

        let reordering = reverse_cuthill_mckee(self.ode_species.len(), &entries);
        let old_order = std::mem::take(&mut self.ode_species);
        for (old, &slot) in old_order.iter().enumerate() {
            self.quantities.species[slot].ode_index = Some(reordering.new_index[old]);
        }
        self.ode_species = reordering.order.iter().map(|&old| old_order[old]).collect();
        debug!(
            "Bandwidth reordering: lower={}, upper={}",
            reordering.lower, reordering.upper
        );
        self.band = Some((reordering.lower, reordering.upper));
    }

    /// Runs the simulation, retrying with reduced tolerances when allowed.
    pub fn run(&mut self) -> Result<SimulationOutput> {
        if !self.finalized {
            return Err(SimulationError::NotFinalized);
        }
        self.options
            .validate()
            .map_err(|e| SimulationError::Options(e.to_string()))?;
        self.solver_properties
            .validate()
            .map_err(|e| SimulationError::Options(e.to_string()))?;

        let started = Instant::now();
        info!(
            "Simulation started: {} ODE variables, AbsTol={:e}, RelTol={:e}",
            self.ode_species.len(),
            self.solver_properties.abs_tol,
            self.solver_properties.rel_tol
        );
        let auto_reduce = self.options.auto_reduce_tolerances;
        let (mut output, props, reduced) =
            with_tolerance_reduction(self.solver_properties, auto_reduce, |props| {
                self.solve_once(props, started)
            })?;
        output.tolerance_was_reduced = reduced;
        info!(
            "Simulation finished: {} output times, {} warnings, {:.3} s",
            output.times.len(),
            output.warnings.len(),
            started.elapsed().as_secs_f64()
        );
        if reduced {
            info!(
                "Tolerances were reduced to AbsTol={:e}, RelTol={:e}",
                props.abs_tol, props.rel_tol
            );
        }
        Ok(output)
    }

    fn reset_run_state(&mut self) {
        for parameter in &mut self.quantities.parameters {
            parameter.core.reset_state();
        }
        for species in &mut self.quantities.species {
            species.core.reset_state();
        }
        for observer in &mut self.quantities.observers {
            observer.core.reset_state();
        }
        for switch in &mut self.switches {
            switch.reset();
        }
    }

    fn schedule(&self) -> Result<Vec<OutputTimePoint>> {
        let quantities = &self.quantities;
        let user = self.output_schema.all_time_points()?;
        let mut switch_times = Vec::new();
        for switch in &self.switches {
            switch_times.extend(switch.switch_time_points(quantities));
        }
        let mut restart_times = Vec::new();
        for parameter in &quantities.parameters {
            if let Some(formula) = parameter.core.formula() {
                restart_times.extend(formula.restart_time_points());
            }
        }
        for species in &quantities.species {
            for term in species.rhs() {
                restart_times.extend(term.restart_time_points());
            }
        }
        build_schedule(
            &user,
            &switch_times,
            &restart_times,
            self.start_time,
            self.options.use_float_comparison_in_output_times,
        )
    }

    fn sensitivity_parameter_ids(&self) -> Vec<QuantityId> {
        self.quantities
            .parameters
            .iter()
            .filter(|p| p.calculate_sensitivity)
            .map(|p| p.core.id)
            .collect()
    }

    fn linear_solver(&self) -> LinearSolver {
        let n = self.ode_species.len();
        match (self.options.use_banded_solver, self.band) {
            (true, Some((lower, upper))) => LinearSolver::banded(n, lower, upper),
            _ => LinearSolver::dense(n),
        }
    }

    /// Scaled initial state. Initial formulas may refer to other species, so they are
    /// evaluated in repeated passes until the values settle.
    fn initial_state(&self) -> Result<Vec<f64>> {
        let quantities = &self.quantities;
        let mut values: Vec<f64> = self
            .ode_species
            .iter()
            .map(|&slot| quantities.species[slot].core.value())
            .collect();
        let with_formula: Vec<usize> = self
            .ode_species
            .iter()
            .enumerate()
            .filter(|&(_, &slot)| quantities.species[slot].core.formula().is_some())
            .map(|(index, _)| index)
            .collect();

        for _ in 0..=with_formula.len() {
            let mut changed = false;
            for &index in &with_formula {
                let species = &quantities.species[self.ode_species[index]];
                let Some(formula) = species.core.formula() else {
                    continue;
                };
                let value =
                    formula.evaluate(quantities, &values, self.start_time, ScaleFactorMode::Ignore)?;
                if value.to_bits() != values[index].to_bits() {
                    values[index] = value;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Ok(values
            .iter()
            .zip(&self.ode_species)
            .map(|(value, &slot)| value / quantities.species[slot].scale_factor())
            .collect())
    }

    /// Scaled initial sensitivities: derivatives of initial formulas, zero otherwise.
    fn initial_sensitivities(&self, parameter_ids: &[QuantityId], y: &[f64]) -> Result<Vec<f64>> {
        let n = self.ode_species.len();
        let mut sensitivities = vec![0.0; n * parameter_ids.len()];
        for (k, &id) in parameter_ids.iter().enumerate() {
            for (index, &slot) in self.ode_species.iter().enumerate() {
                let species = &self.quantities.species[slot];
                if let Some(formula) = species.core.formula() {
                    let derivative = formula
                        .symbolic_derivative(DerivativeTarget::Parameter(id), &self.quantities)?;
                    sensitivities[k * n + index] = derivative.evaluate(
                        &self.quantities,
                        y,
                        self.start_time,
                        ScaleFactorMode::Use,
                    )? / species.scale_factor();
                }
            }
        }
        Ok(sensitivities)
    }

    /// Applies switches until none fires; a switch fires at most once per call.
    /// Returns whether any fired and whether the integrator must restart.
    fn perform_switches(&mut self, y: &mut [f64], time: f64) -> Result<(bool, bool)> {
        let mut fired_now = vec![false; self.switches.len()];
        let mut any_fired = false;
        let mut restart = false;
        let passes = self.switches.len() + 1;
        for _ in 0..passes {
            let mut fired_in_pass = false;
            for (index, switch) in self.switches.iter_mut().enumerate() {
                if fired_now[index] {
                    continue;
                }
                let outcome = switch.perform(&mut self.quantities, y, time)?;
                if outcome.fired() {
                    fired_now[index] = true;
                    fired_in_pass = true;
                    restart |= outcome.requires_restart();
                }
            }
            if !fired_in_pass {
                return Ok((any_fired, restart));
            }
            any_fired = true;
        }
        warn!("Switches kept firing at t={time} after {passes} passes");
        Ok((any_fired, restart))
    }

    /// Stores species, observer and sensitivity values of one output time.
    fn store_solution(
        &mut self,
        y: &[f64],
        sensitivities: &[f64],
        time: f64,
        abs_tol: f64,
        cache: &SensitivityCache,
    ) -> Result<()> {
        let n = self.ode_species.len();
        let floored: Vec<f64> = y
            .iter()
            .map(|&u| if u < 0.0 && u > -abs_tol { 0.0 } else { u })
            .collect();

        let quantities = &self.quantities;
        let mut observer_values = Vec::with_capacity(quantities.observers.len());
        let mut observer_sensitivities = Vec::with_capacity(quantities.observers.len());
        for (slot, observer) in quantities.observers.iter().enumerate() {
            observer_values.push(match observer.core.formula() {
                Some(formula) => {
                    formula.evaluate(quantities, &floored, time, ScaleFactorMode::Use)?
                }
                None => observer.core.value(),
            });
            let mut per_parameter = Vec::with_capacity(cache.parameter_count());
            for k in 0..cache.parameter_count() {
                per_parameter.push(cache.observer_sensitivity(
                    slot,
                    k,
                    quantities,
                    &floored,
                    time,
                    &sensitivities[k * n..(k + 1) * n],
                )?);
            }
            observer_sensitivities.push(per_parameter);
        }
        let mut parameter_values = Vec::new();
        for (slot, parameter) in quantities.parameters.iter().enumerate() {
            if parameter.core.is_persistable {
                let value = match parameter.core.formula() {
                    Some(formula) => {
                        formula.evaluate(quantities, &floored, time, ScaleFactorMode::Use)?
                    }
                    None => parameter.core.value(),
                };
                parameter_values.push((slot, value));
            }
        }

        for (slot, value) in parameter_values {
            self.quantities.parameters[slot].core.values.push(value);
        }
        let parameter_ids = cache.parameter_ids().to_vec();
        for (index, &slot) in self.ode_species.iter().enumerate() {
            let species = &mut self.quantities.species[slot];
            let persistable = species.core.is_persistable;
            let scale_factor = species.scale_factor();
            record(&mut species.core.values, floored[index], persistable);
            for (k, id) in parameter_ids.iter().enumerate() {
                let value = sensitivities[k * n + index] * scale_factor;
                record(
                    species.core.sensitivities.entry(*id).or_default(),
                    value,
                    persistable,
                );
            }
        }
        for ((observer, value), per_parameter) in self
            .quantities
            .observers
            .iter_mut()
            .zip(observer_values)
            .zip(observer_sensitivities)
        {
            let persistable = observer.core.is_persistable;
            record(&mut observer.core.values, value, persistable);
            for (id, sensitivity) in parameter_ids.iter().zip(per_parameter) {
                record(
                    observer.core.sensitivities.entry(*id).or_default(),
                    sensitivity,
                    persistable,
                );
            }
        }

        if self.options.check_negative_values {
            let names: Vec<String> = self
                .ode_species
                .iter()
                .zip(&floored)
                .filter(|&(&slot, &u)| {
                    !self.quantities.species[slot].negative_values_allowed && u < -abs_tol
                })
                .map(|(&slot, _)| self.quantities.species[slot].core.full_name())
                .collect();
            if !names.is_empty() {
                return Err(SimulationError::NegativeValue { time, names });
            }
        }
        Ok(())
    }

    /// Rescales the stored species values and collapses run-constant quantities to a
    /// single value.
    fn finish_values(&mut self, abs_tol: f64, y: &[f64], time: f64) -> Result<()> {
        for &slot in &self.ode_species {
            let species = &mut self.quantities.species[slot];
            let scale_factor = species.scale_factor();
            for value in &mut species.core.values {
                *value = if value.abs() <= abs_tol {
                    0.0
                } else {
                    *value * scale_factor
                };
            }
        }

        let mut constants = Vec::new();
        for (slot, species) in self.quantities.species.iter().enumerate() {
            if species.ode_index.is_none() {
                let value = match species.core.formula() {
                    Some(formula) => {
                        formula.evaluate(&self.quantities, y, time, ScaleFactorMode::Ignore)?
                    }
                    None => species.core.value(),
                };
                constants.push((QuantityKind::Species, slot, value));
            }
        }
        for (slot, parameter) in self.quantities.parameters.iter().enumerate() {
            let constant = !parameter.core.is_changed_by_switch()
                && parameter
                    .core
                    .formula()
                    .map(|f| f.is_constant(&self.quantities, true))
                    .unwrap_or(true);
            if parameter.core.is_persistable && constant {
                if let Some(&value) = parameter.core.values().last() {
                    constants.push((QuantityKind::Parameter, slot, value));
                }
            }
        }
        for (slot, observer) in self.quantities.observers.iter().enumerate() {
            let constant = observer
                .core
                .formula()
                .map(|f| f.is_constant(&self.quantities, true))
                .unwrap_or(true);
            if constant {
                if let Some(&value) = observer.core.values().last() {
                    constants.push((QuantityKind::Observer, slot, value));
                }
            }
        }

        for (kind, slot, value) in constants {
            let core = match kind {
                QuantityKind::Parameter => &mut self.quantities.parameters[slot].core,
                QuantityKind::Species => &mut self.quantities.species[slot].core,
                QuantityKind::Observer => &mut self.quantities.observers[slot].core,
            };
            core.values = vec![value];
        }
        Ok(())
    }

    fn collect_quantities(&self) -> Vec<QuantityValues> {
        let quantities = &self.quantities;
        let parameters = quantities
            .parameters
            .iter()
            .map(|p| (&p.core, QuantityKind::Parameter));
        let species = quantities
            .species
            .iter()
            .map(|s| (&s.core, QuantityKind::Species));
        let observers = quantities
            .observers
            .iter()
            .map(|o| (&o.core, QuantityKind::Observer));
        parameters
            .chain(species)
            .chain(observers)
            .filter(|(core, _)| core.is_persistable)
            .map(|(core, kind)| QuantityValues::from_core(core, kind))
            .collect()
    }

    fn check_time_limit(&self, started: Instant, time: f64) -> Result<()> {
        let limit = self.options.execution_time_limit;
        if limit > 0.0 && started.elapsed().as_secs_f64() > limit {
            return Err(SimulationError::TimeLimitExceeded { limit, time });
        }
        Ok(())
    }

    fn solve_once(&mut self, props: SolverProperties, started: Instant) -> Result<SimulationOutput> {
        self.reset_run_state();
        self.simplify_parameters(true);

        let start = self.start_time;
        let schedule = self.schedule()?;
        let n = self.ode_species.len();
        let parameter_ids = self.sensitivity_parameter_ids();

        let mut y = self.initial_state()?;
        let mut sensitivities = self.initial_sensitivities(&parameter_ids, &y)?;
        let mut cache = SensitivityCache::build(&self.quantities, &self.ode_species, &parameter_ids)?;
        let mut times = vec![start];
        self.store_solution(&y, &sensitivities, start, props.abs_tol, &cache)?;

        let (fired, _) = self.perform_switches(&mut y, start)?;
        if fired {
            cache = SensitivityCache::build(&self.quantities, &self.ode_species, &parameter_ids)?;
        }

        let mut guard = RhsGuard::default();
        let mut warnings = Vec::new();
        let mut integrator = if n > 0 {
            let result = {
                let mut system =
                    ModelSystem::new(&self.quantities, &self.ode_species, &cache, &mut guard);
                BdfIntegrator::new(
                    &mut system,
                    self.linear_solver(),
                    props,
                    start,
                    &y,
                    &sensitivities,
                )
            };
            Some(result.map_err(|e| setup_failure(e, guard.take_checkpoint()))?)
        } else {
            None
        };

        let total = schedule.len();
        let mut cancelled = false;
        let mut time = start;
        for (index, point) in schedule.iter().enumerate() {
            self.check_time_limit(started, time)?;
            if self.cancellation.is_cancelled() {
                info!("Simulation cancelled at t={time}");
                cancelled = true;
                break;
            }
            if self.options.show_progress {
                let percent = (index * 100 / total) as u32;
                debug!("Progress {percent}% (t={time})");
                if let Some(callback) = self.progress.as_mut() {
                    callback(percent);
                }
            }

            time = point.time;
            if let Some(integrator) = integrator.as_mut() {
                let result = {
                    let mut system =
                        ModelSystem::new(&self.quantities, &self.ode_species, &cache, &mut guard);
                    integrator.step_to(&mut system, point.time)
                };
                if let Err(err) = result {
                    match classify_failure(err, guard.take_checkpoint()) {
                        StepFailure::Fatal(err) => return Err(err),
                        StepFailure::Warning { message, reducible } => {
                            if self.options.stop_on_warnings {
                                return Err(SimulationError::Solver {
                                    time: point.time,
                                    message,
                                    reducible,
                                });
                            }
                            let message =
                                format!("Error solving ODE at time t={}: {message}", point.time);
                            warn!("{message}");
                            warnings.push(SolverWarning::new(point.time, message));
                            // continue from wherever the integrator got to
                            let at = integrator.time();
                            let state = integrator.state().to_vec();
                            let sens = integrator.sensitivities().to_vec();
                            let result = {
                                let mut system = ModelSystem::new(
                                    &self.quantities,
                                    &self.ode_species,
                                    &cache,
                                    &mut guard,
                                );
                                integrator.reinit(&mut system, at, &state, &sens)
                            };
                            result.map_err(|e| setup_failure(e, guard.take_checkpoint()))?;
                        }
                    }
                }
                guard.take_checkpoint();
                y.copy_from_slice(integrator.state());
                sensitivities.copy_from_slice(integrator.sensitivities());
                time = integrator.time();
            }

            if point.save_system_solution {
                self.store_solution(&y, &sensitivities, time, props.abs_tol, &cache)?;
                times.push(time);
            }

            let (fired, restart) = self.perform_switches(&mut y, time)?;
            if fired {
                cache =
                    SensitivityCache::build(&self.quantities, &self.ode_species, &parameter_ids)?;
            }
            if fired || restart || point.restart_system {
                if let Some(integrator) = integrator.as_mut() {
                    debug!("Restarting integrator at t={time}");
                    let result = {
                        let mut system = ModelSystem::new(
                            &self.quantities,
                            &self.ode_species,
                            &cache,
                            &mut guard,
                        );
                        integrator.reinit(&mut system, time, &y, &sensitivities)
                    };
                    result.map_err(|e| setup_failure(e, guard.take_checkpoint()))?;
                }
            }
        }

        self.finish_values(props.abs_tol, &y, time)?;
        warnings.extend(guard.warnings);
        Ok(SimulationOutput {
            times,
            quantities: self.collect_quantities(),
            warnings,
            tolerance_was_reduced: false,
            used_abs_tol: props.abs_tol,
            used_rel_tol: props.rel_tol,
            cancelled,
        })
    }
}
