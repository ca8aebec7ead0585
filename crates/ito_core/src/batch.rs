//! Batch of sampled state values and shock draws.
//!
//! A batch is built whole (by the sampler, a feed or a simulation step) and is
//! never edited afterwards; every expression evaluation reads from one.

use crate::error::{EngineError, Result};
use crate::expr::{Shock, Var};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    size: usize,
    /// Indexed by variable. `None` for variables that were not sampled or fed.
    values: Vec<Option<Vec<f64>>>,
    /// Indexed by shock. Each entry holds `size` draws.
    shocks: Vec<Vec<f64>>,
}

impl Batch {
    /// A batch with no elements. Shocks are present but empty.
    pub fn empty(variables: usize, shocks: usize) -> Self {
        Self {
            size: 0,
            values: vec![None; variables],
            shocks: vec![Vec::new(); shocks],
        }
    }

    /// Assembles a batch, checking that every column has `size` entries.
    pub(crate) fn from_parts(
        size: usize,
        values: Vec<Option<Vec<f64>>>,
        shocks: Vec<Vec<f64>>,
    ) -> Result<Self> {
        for (i, column) in values.iter().enumerate() {
            if let Some(column) = column {
                if column.len() != size {
                    return Err(EngineError::Config(format!(
                        "variable x{i} has {} values, expected {size}",
                        column.len()
                    )));
                }
            }
        }
        for (k, column) in shocks.iter().enumerate() {
            if column.len() != size {
                return Err(EngineError::Config(format!(
                    "shock dZ{k} has {} draws, expected {size}",
                    column.len()
                )));
            }
        }
        Ok(Self {
            size,
            values,
            shocks,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn values(&self, var: Var) -> Option<&[f64]> {
        self.values.get(var.index())?.as_deref()
    }

    pub fn shock(&self, shock: Shock) -> Option<&[f64]> {
        self.shocks.get(shock.index()).map(Vec::as_slice)
    }

    /// Variables that carry values in this batch.
    pub fn sampled(&self) -> impl Iterator<Item = Var> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, column)| column.is_some())
            .map(|(i, _)| Var(i))
    }

    /// Values of all variables at one element, NaN where a variable has none.
    pub(crate) fn variable_row(&self, element: usize) -> Vec<f64> {
        self.values
            .iter()
            .map(|column| {
                column
                    .as_ref()
                    .and_then(|c| c.get(element).copied())
                    .unwrap_or(f64::NAN)
            })
            .collect()
    }

    pub(crate) fn shock_row(&self, element: usize) -> Vec<f64> {
        self.shocks
            .iter()
            .map(|column| column.get(element).copied().unwrap_or(f64::NAN))
            .collect()
    }
}
