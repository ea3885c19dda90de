//! # Optimization State
//!
//! The explicit context threaded through every fit-function call. It owns the
//! model registries (matrices, algebras, data tables, free variables,
//! constraints), the status code and message the host reads after each call,
//! the row and evaluation counters, and the last saved optimum.
//!
//! A state may own child replicas for parallel row evaluation. A replica owns
//! its own copy of every matrix and algebra, shares the immutable data tables
//! and free-variable table with its parent through `Arc`, and belongs to the
//! same lineage so definition-variable trackers built against the parent may
//! write into it.

use crate::data::{DataId, DataTable};
use crate::matrix::{Algebra, AlgebraId, EntityRef, Matrix, MatrixId, ModelError, ModelStore};
use ahash::AHashMap;
use ndarray::ArrayView2;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Longest status message kept on a state, in bytes.
pub const MAX_STATUS_LEN: usize = 249;

/// Status code for fatal, run-aborting errors.
pub const STATUS_ERROR: i32 = -1;

/// Status code for warnings that leave the fit value usable.
pub const STATUS_WARNING: i32 = 1;

static NEXT_LINEAGE: AtomicU64 = AtomicU64::new(1);

/// Fit-time failures. Every variant is fatal for the current evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("No data table with index {0} exists in this state.")]
    UnknownData(usize),

    #[error("NA value for definition variable '{column}' in data row {row}; missing definition variables are not supported.")]
    NaDefinitionVariable { column: String, row: usize },

    #[error("Internal error: definition variable population into incorrect data source (expected {expected}, found {found}).")]
    WrongDataSource { expected: usize, found: usize },

    #[error("Internal error: definition variable destination belongs to a different optimization state.")]
    ForeignState,

    #[error("Thresholds in column {column} of '{matrix}' are not strictly increasing at threshold {index}.")]
    ThresholdsNotIncreasing {
        matrix: String,
        column: usize,
        index: usize,
    },

    #[error("Ordinal column '{column}' has category {category} in data row {row}, but only {thresholds} thresholds are defined.")]
    CategoryOutOfRange {
        column: String,
        row: usize,
        category: u32,
        thresholds: usize,
    },

    #[error("Expected covariance matrix is not positive-definite in data row {row}.")]
    NotPositiveDefinite { row: usize },

    #[error("Multivariate normal integration failed in data row {row}: {reason}")]
    Integration { row: usize, reason: String },

    #[error("{what} must be {expected}, found {found}.")]
    Shape {
        what: String,
        expected: String,
        found: String,
    },

    #[error("{fit}: gradient must have row or column names")]
    MissingGradientNames { fit: String },

    #[error("{fit}: Hessian must be square (instead of {rows}x{cols})")]
    HessianNotSquare {
        fit: String,
        rows: usize,
        cols: usize,
    },

    #[error("{fit}: Hessian must have row and column names")]
    MissingHessianNames { fit: String },

    #[error("{fit}: Hessian must have identical row and column names (mismatch at {position})")]
    HessianNameMismatch { fit: String, position: usize },

    #[error("{fit}: derivatives non-conformable (gradient is size {size} and Hessian is {rows}x{cols})")]
    DerivativesNonConformable {
        fit: String,
        size: usize,
        rows: usize,
        cols: usize,
    },

    #[error("{fit}: Hessian and gradient must have identical names (mismatch at {position})")]
    GradientHessianNameMismatch { fit: String, position: usize },

    #[error("Invalid fit function configuration: {0}")]
    InvalidConfig(String),
}

impl FitError {
    /// Integer status code reported to the host for this error.
    pub fn status_code(&self) -> i32 {
        STATUS_ERROR
    }
}

/// Status reported to the host: 0 means no issue, negative is fatal,
/// positive is a warning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    pub fn new(code: i32, message: &str) -> Self {
        Self {
            code,
            message: truncate_message(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn is_error(&self) -> bool {
        self.code < 0
    }

    pub fn is_warning(&self) -> bool {
        self.code > 0
    }
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_STATUS_LEN {
        return message.to_string();
    }
    let mut end = MAX_STATUS_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// A matrix cell written by a free variable or a definition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLocation {
    pub matrix: MatrixId,
    pub row: usize,
    pub col: usize,
}

#[derive(Debug, Clone)]
pub struct FreeVariable {
    pub name: String,
    pub lbound: f64,
    pub ubound: f64,
    pub locations: Vec<CellLocation>,
}

impl FreeVariable {
    pub fn new(name: impl Into<String>, locations: Vec<CellLocation>) -> Self {
        Self {
            name: name.into(),
            lbound: f64::NEG_INFINITY,
            ubound: f64::INFINITY,
            locations,
        }
    }

    pub fn with_bounds(mut self, lbound: f64, ubound: f64) -> Self {
        self.lbound = lbound;
        self.ubound = ubound;
        self
    }
}

/// An ordered free-variable table. A variable's global index is its position.
#[derive(Debug, Clone, Default)]
pub struct FreeVarGroup {
    pub id: u32,
    vars: Vec<FreeVariable>,
    index: AHashMap<String, usize>,
}

impl FreeVarGroup {
    pub fn new(id: u32, vars: Vec<FreeVariable>) -> Self {
        let index = vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.name.clone(), i))
            .collect();
        Self { id, vars, index }
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn vars(&self) -> &[FreeVariable] {
        &self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Less,
    Equal,
    Greater,
}

#[derive(Debug, Clone)]
pub struct Constraint {
    pub name: String,
    pub relation: Relation,
    pub algebra: AlgebraId,
}

#[derive(Debug, Clone)]
pub struct SavedOptimum {
    pub values: Vec<f64>,
    pub minimum: f64,
    pub status: Status,
}

pub struct OptimizationState {
    lineage: u64,
    replica: Option<usize>,
    store: ModelStore,
    data: Vec<Arc<DataTable>>,
    free_vars: Arc<FreeVarGroup>,
    constraints: Vec<Constraint>,
    status: Status,
    current_row: usize,
    compute_count: u64,
    optimum: Option<SavedOptimum>,
    workers: usize,
    children: Vec<OptimizationState>,
}

impl Default for OptimizationState {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationState {
    pub fn new() -> Self {
        Self {
            lineage: NEXT_LINEAGE.fetch_add(1, Ordering::Relaxed),
            replica: None,
            store: ModelStore::default(),
            data: Vec::new(),
            free_vars: Arc::new(FreeVarGroup::default()),
            constraints: Vec::new(),
            status: Status::default(),
            current_row: 0,
            compute_count: 0,
            optimum: None,
            workers: 1,
            children: Vec::new(),
        }
    }

    /// Identifier shared by a state and all of its replicas.
    pub fn lineage(&self) -> u64 {
        self.lineage
    }

    /// Index of this replica among its parent's children, `None` for a parent.
    pub fn replica_index(&self) -> Option<usize> {
        self.replica
    }

    pub fn add_matrix(&mut self, matrix: Matrix) -> MatrixId {
        self.store.add_matrix(matrix)
    }

    pub fn add_algebra(&mut self, algebra: Algebra) -> Result<AlgebraId, ModelError> {
        self.store.add_algebra(algebra)
    }

    pub fn add_data(&mut self, table: DataTable) -> DataId {
        self.data.push(Arc::new(table));
        DataId(self.data.len() - 1)
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn set_free_var_group(&mut self, group: FreeVarGroup) {
        self.free_vars = Arc::new(group);
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ModelStore {
        &mut self.store
    }

    pub fn data(&self, id: DataId) -> Result<&Arc<DataTable>, FitError> {
        self.data.get(id.0).ok_or(FitError::UnknownData(id.0))
    }

    pub fn data_id(&self, name: &str) -> Option<DataId> {
        self.data.iter().position(|d| d.name == name).map(DataId)
    }

    pub fn free_vars(&self) -> &Arc<FreeVarGroup> {
        &self.free_vars
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn recompute(&mut self, entity: EntityRef) -> Result<(), ModelError> {
        self.store.recompute(entity)
    }

    pub fn values(&self, entity: EntityRef) -> Result<ArrayView2<'_, f64>, ModelError> {
        self.store.values(entity)
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Records a status. Fatal codes always overwrite; warnings never replace
    /// a recorded error.
    pub fn raise_error(&mut self, code: i32, message: &str) {
        if code > 0 && self.status.is_error() {
            return;
        }
        self.status = Status::new(code, message);
    }

    pub fn record_error(&mut self, err: &FitError) {
        log::error!("{err}");
        self.raise_error(err.status_code(), &err.to_string());
    }

    pub fn raise_warning(&mut self, message: &str) {
        log::warn!("{message}");
        self.raise_error(STATUS_WARNING, message);
    }

    pub fn clear_status(&mut self) {
        self.status = Status::default();
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn next_row(&mut self) {
        self.current_row += 1;
    }

    pub fn current_row(&self) -> usize {
        self.current_row
    }

    /// Starts a new evaluation: bumps the compute count, rewinds the row
    /// counter and clears whatever status the previous evaluation left.
    pub fn next_evaluation(&mut self) {
        self.compute_count += 1;
        self.current_row = 0;
        self.status = Status::default();
    }

    pub fn compute_count(&self) -> u64 {
        self.compute_count
    }

    /// Number of replicas used for row-parallel evaluation. 1 means serial.
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn set_workers(&mut self, workers: usize) {
        self.workers = workers.max(1);
    }

    /// Writes each free-parameter value into all of its locations. Values
    /// outside the variable's bounds are clamped.
    pub fn set_free_values(&mut self, values: &[f64]) -> Result<(), FitError> {
        let group = Arc::clone(&self.free_vars);
        if values.len() != group.len() {
            return Err(FitError::Shape {
                what: "free parameter vector".to_string(),
                expected: format!("length {}", group.len()),
                found: format!("length {}", values.len()),
            });
        }
        for (var, &value) in group.vars().iter().zip(values) {
            let clamped = value.clamp(var.lbound, var.ubound);
            if clamped != value {
                log::warn!(
                    "Free parameter '{}' value {} clamped to [{}, {}]",
                    var.name,
                    value,
                    var.lbound,
                    var.ubound
                );
            }
            for loc in &var.locations {
                self.store.set_cell(loc.matrix, loc.row, loc.col, clamped)?;
            }
        }
        Ok(())
    }

    /// Current free-parameter values, read from each variable's first location.
    pub fn free_values(&self) -> Result<Vec<f64>, FitError> {
        self.free_vars
            .vars()
            .iter()
            .map(|var| -> Result<f64, FitError> {
                match var.locations.first() {
                    Some(loc) => Ok(self
                        .store
                        .matrix(loc.matrix)?
                        .get(loc.row, loc.col)
                        .unwrap_or(f64::NAN)),
                    None => Ok(f64::NAN),
                }
            })
            .collect()
    }

    pub fn save_optimum(&mut self, values: &[f64], minimum: f64) {
        self.optimum = Some(SavedOptimum {
            values: values.to_vec(),
            minimum,
            status: self.status.clone(),
        });
    }

    pub fn optimum(&self) -> Option<&SavedOptimum> {
        self.optimum.as_ref()
    }

    /// Recomputes every constraint algebra and returns its flattened values.
    pub fn evaluate_constraints(&mut self) -> Result<Vec<(Relation, Vec<f64>)>, FitError> {
        let constraints = self.constraints.clone();
        constraints
            .iter()
            .map(|c| -> Result<(Relation, Vec<f64>), FitError> {
                let entity = EntityRef::Algebra(c.algebra);
                self.store.recompute(entity)?;
                Ok((c.relation, self.store.values(entity)?.iter().copied().collect()))
            })
            .collect()
    }

    fn replicate(&self, index: usize) -> Self {
        Self {
            lineage: self.lineage,
            replica: Some(index),
            store: self.store.clone(),
            data: self.data.clone(),
            free_vars: Arc::clone(&self.free_vars),
            constraints: self.constraints.clone(),
            status: Status::default(),
            current_row: self.current_row,
            compute_count: self.compute_count,
            optimum: None,
            workers: 1,
            children: Vec::new(),
        }
    }

    /// Brings a replica up to date with its parent's matrices, algebras and
    /// data tables and clears its status.
    fn refresh_from(&mut self, parent: &OptimizationState) {
        self.store.refresh_from(&parent.store);
        self.data.clone_from(&parent.data);
        self.free_vars = Arc::clone(&parent.free_vars);
        self.constraints.clone_from(&parent.constraints);
        self.status = Status::default();
        self.current_row = parent.current_row;
        self.compute_count = parent.compute_count;
    }

    /// Hands out `count` refreshed replicas. They must be given back with
    /// [`OptimizationState::restore_children`].
    pub(crate) fn take_children(&mut self, count: usize) -> Vec<OptimizationState> {
        let mut children = std::mem::take(&mut self.children);
        children.truncate(count);
        for child in &mut children {
            child.refresh_from(self);
        }
        while children.len() < count {
            let index = children.len();
            children.push(self.replicate(index));
        }
        children
    }

    pub(crate) fn restore_children(&mut self, children: Vec<OptimizationState>) {
        self.children = children;
    }

    pub fn children(&self) -> &[OptimizationState] {
        &self.children
    }

    /// Drops every replica, e.g. at the end of a run.
    pub fn destroy_children(&mut self) {
        self.children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::AlgebraExpr;
    use ndarray::array;

    fn state_with_free_diagonal() -> (OptimizationState, MatrixId) {
        let mut state = OptimizationState::new();
        let s = state.add_matrix(Matrix::new("S", array![[1.0, 0.0], [0.0, 1.0]]));
        state.set_free_var_group(FreeVarGroup::new(
            0,
            vec![
                FreeVariable::new(
                    "var",
                    vec![
                        CellLocation { matrix: s, row: 0, col: 0 },
                        CellLocation { matrix: s, row: 1, col: 1 },
                    ],
                )
                .with_bounds(0.0, 10.0),
            ],
        ));
        (state, s)
    }

    #[test]
    fn free_values_write_every_location_and_clamp() {
        let (mut state, s) = state_with_free_diagonal();
        state.set_free_values(&[2.5]).unwrap();
        assert_eq!(state.store().matrix(s).unwrap().values(), array![[2.5, 0.0], [0.0, 2.5]]);

        state.set_free_values(&[-3.0]).unwrap();
        assert_eq!(state.free_values().unwrap(), vec![0.0]);

        assert!(matches!(
            state.set_free_values(&[1.0, 2.0]),
            Err(FitError::Shape { .. })
        ));
    }

    #[test]
    fn warnings_never_replace_errors() {
        let mut state = OptimizationState::new();
        state.raise_warning("asymmetric");
        assert!(state.status().is_warning());

        state.raise_error(STATUS_ERROR, "boom");
        state.raise_warning("asymmetric again");
        assert_eq!(state.status().code, STATUS_ERROR);
        assert_eq!(state.status().message, "boom");
    }

    #[test]
    fn long_messages_are_truncated() {
        let mut state = OptimizationState::new();
        state.raise_error(STATUS_ERROR, &"x".repeat(400));
        assert_eq!(state.status().message.len(), MAX_STATUS_LEN);
    }

    #[test]
    fn next_evaluation_starts_from_a_clean_status() {
        let mut state = OptimizationState::new();
        state.next_row();
        state.raise_error(STATUS_ERROR, "previous iteration failed");
        state.next_evaluation();
        assert!(state.status().is_ok());
        assert_eq!(state.current_row(), 0);
        assert_eq!(state.compute_count(), 1);
    }

    #[test]
    fn replicas_share_lineage_and_follow_parent_values() {
        let (mut state, s) = state_with_free_diagonal();
        let cov = state
            .add_algebra(Algebra::new("cov", AlgebraExpr::Matrix(s)))
            .unwrap();

        let children = state.take_children(2);
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.lineage() == state.lineage()));
        assert_eq!(children[1].replica_index(), Some(1));
        state.restore_children(children);

        state.set_free_values(&[4.0]).unwrap();
        state.recompute(EntityRef::Algebra(cov)).unwrap();
        let mut children = state.take_children(2);
        assert!(!children[0].store().is_dirty(EntityRef::Algebra(cov)).unwrap());
        assert_eq!(children[0].values(EntityRef::Algebra(cov)).unwrap()[(1, 1)], 4.0);

        children[0].store_mut().set_cell(s, 0, 0, 9.0).unwrap();
        assert_eq!(state.store().matrix(s).unwrap().get(0, 0), Some(4.0));
        state.restore_children(children);
    }

    #[test]
    fn replicas_pick_up_entities_registered_after_they_were_made() {
        let (mut state, s) = state_with_free_diagonal();
        let children = state.take_children(2);
        state.restore_children(children);

        let mut table = DataTable::new("late");
        table.push_numeric("x", vec![1.0, 2.0]).unwrap();
        let data = state.add_data(table);
        let diagonal = state
            .add_algebra(Algebra::new(
                "diag",
                AlgebraExpr::Diag2Vec(Box::new(AlgebraExpr::Matrix(s))),
            ))
            .unwrap();

        let mut children = state.take_children(2);
        for child in &mut children {
            assert_eq!(child.data(data).unwrap().rows(), 2);
            child.recompute(EntityRef::Algebra(diagonal)).unwrap();
            assert_eq!(
                child.values(EntityRef::Algebra(diagonal)).unwrap().to_owned(),
                array![[1.0], [1.0]]
            );
        }
        state.restore_children(children);
    }

    #[test]
    fn constraints_evaluate_their_algebras() {
        let (mut state, s) = state_with_free_diagonal();
        let diag = state
            .add_algebra(Algebra::new(
                "diag",
                AlgebraExpr::Diag2Vec(Box::new(AlgebraExpr::Matrix(s))),
            ))
            .unwrap();
        state.add_constraint(Constraint {
            name: "positive".to_string(),
            relation: Relation::Greater,
            algebra: diag,
        });
        let values = state.evaluate_constraints().unwrap();
        assert_eq!(values, vec![(Relation::Greater, vec![1.0, 1.0])]);
    }
}
