use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SolverWarning;
use crate::quantity::{QuantityCore, QuantityId, QuantityKind};

/// Stored values of one persistable quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityValues {
    pub id: QuantityId,
    pub entity_id: String,
    pub name: String,
    /// Container path joined with the name, `|`-separated.
    pub path: String,
    pub kind: QuantityKind,
    /// One value per output time, or a single value for quantities constant during the run.
    pub values: Vec<f64>,
    /// Sensitivity values per sensitivity parameter id, one per output time.
    pub sensitivities: BTreeMap<QuantityId, Vec<f64>>,
}

impl QuantityValues {
    pub(crate) fn from_core(core: &QuantityCore, kind: QuantityKind) -> Self {
        Self {
            id: core.id,
            entity_id: core.entity_id.clone(),
            name: core.name.clone(),
            path: core.full_name(),
            kind,
            values: core.values().to_vec(),
            sensitivities: core.sensitivities.clone(),
        }
    }

    pub fn is_constant(&self) -> bool {
        self.values.len() == 1
    }

    /// Value at output index `index`; constant quantities answer every index.
    pub fn value_at(&self, index: usize) -> Option<f64> {
        if self.is_constant() {
            return self.values.first().copied();
        }
        self.values.get(index).copied()
    }

    pub fn sensitivity(&self, parameter_id: QuantityId) -> Option<&[f64]> {
        self.sensitivities.get(&parameter_id).map(|v| v.as_slice())
    }
}

/// Result of one simulation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    /// Times of the stored solutions.
    pub times: Vec<f64>,
    pub quantities: Vec<QuantityValues>,
    pub warnings: Vec<SolverWarning>,
    pub tolerance_was_reduced: bool,
    pub used_abs_tol: f64,
    pub used_rel_tol: f64,
    /// The run stopped early on request; values cover the times reached.
    pub cancelled: bool,
}

impl SimulationOutput {
    /// Looks a quantity up by path first, then by plain name.
    pub fn quantity(&self, path_or_name: &str) -> Option<&QuantityValues> {
        self.quantities
            .iter()
            .find(|q| q.path == path_or_name)
            .or_else(|| self.quantities.iter().find(|q| q.name == path_or_name))
    }

    pub fn quantity_by_id(&self, id: QuantityId) -> Option<&QuantityValues> {
        self.quantities.iter().find(|q| q.id == id)
    }
}
