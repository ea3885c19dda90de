//! # Definition Variables
//!
//! A definition variable copies a per-row data value into one or more model
//! matrix cells before that row's likelihood is computed. The tracker caches
//! the last value written for each variable and only touches the destination
//! matrices when the data value changes, compared with exact equality.
//!
//! `apply` mutates matrices in place, so each concurrently evaluated row range
//! needs its own state replica and its own tracker.

use crate::data::DataId;
use crate::state::{CellLocation, FitError, OptimizationState};

/// Where a definition variable comes from and where its value goes.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionVariable {
    pub source: DataId,
    pub column: usize,
    pub destinations: Vec<CellLocation>,
}

impl DefinitionVariable {
    pub fn new(source: DataId, column: usize, destinations: Vec<CellLocation>) -> Self {
        Self {
            source,
            column,
            destinations,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DefinitionVarTracker {
    lineage: u64,
    vars: Vec<DefinitionVariable>,
    cached: Vec<f64>,
}

impl DefinitionVarTracker {
    /// Validates every variable against `state` and binds the tracker to its
    /// lineage. Caches start out unset.
    pub fn new(state: &OptimizationState, vars: Vec<DefinitionVariable>) -> Result<Self, FitError> {
        for var in &vars {
            let table = state.data(var.source)?;
            if var.column >= table.cols() {
                return Err(FitError::InvalidConfig(format!(
                    "definition variable column {} is outside data '{}' with {} columns",
                    var.column,
                    table.name,
                    table.cols()
                )));
            }
            for dest in &var.destinations {
                let matrix = state.store().matrix(dest.matrix)?;
                if matrix.get(dest.row, dest.col).is_none() {
                    let (rows, cols) = matrix.values().dim();
                    return Err(crate::matrix::ModelError::CellOutOfRange {
                        matrix: matrix.name.clone(),
                        row: dest.row,
                        col: dest.col,
                        rows,
                        cols,
                    }
                    .into());
                }
            }
        }
        let cached = vec![f64::NAN; vars.len()];
        Ok(Self {
            lineage: state.lineage(),
            vars,
            cached,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn vars(&self) -> &[DefinitionVariable] {
        &self.vars
    }

    /// Forgets every cached value so the next `apply` writes all destinations.
    pub fn reset(&mut self) {
        self.cached.iter_mut().for_each(|v| *v = f64::NAN);
    }

    /// A copy of this tracker with unset caches.
    pub fn fresh(&self) -> Self {
        let mut copy = self.clone();
        copy.reset();
        copy
    }

    /// Populates `row` of `data` into every destination whose value changed.
    /// Returns the number of variables that were written.
    pub fn apply(
        &mut self,
        state: &mut OptimizationState,
        data: DataId,
        row: usize,
    ) -> Result<usize, FitError> {
        if state.lineage() != self.lineage {
            return Err(FitError::ForeignState);
        }
        let table = std::sync::Arc::clone(state.data(data)?);
        let mut filled = 0;

        for (var, cached) in self.vars.iter().zip(self.cached.iter_mut()) {
            if var.source != data {
                return Err(FitError::WrongDataSource {
                    expected: data.0,
                    found: var.source.0,
                });
            }
            let value = table.double_element(row, var.column);
            if value.is_nan() {
                return Err(FitError::NaDefinitionVariable {
                    column: table.column_name(var.column).to_string(),
                    row,
                });
            }
            if value == *cached {
                continue;
            }
            *cached = value;
            filled += 1;

            for dest in &var.destinations {
                log::trace!(
                    "Populating column {} (value {:.2}) into matrix {} at [{},{}]",
                    var.column,
                    value,
                    dest.matrix.0,
                    dest.row,
                    dest.col
                );
                state
                    .store_mut()
                    .set_cell(dest.matrix, dest.row, dest.col, value)?;
            }
        }
        Ok(filled)
    }
}
