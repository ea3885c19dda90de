//! # Model Matrices and Algebras
//!
//! The fit functions in this crate read model-implied covariances, means and
//! thresholds out of a registry of named matrices and recomputable algebras.
//! The registry tracks staleness: writing a matrix cell dirties every algebra
//! that depends on that matrix, directly or through another algebra, and
//! `recompute` re-evaluates an algebra only when it is dirty.
//!
//! Algebras may only reference matrices and algebras registered before them,
//! so the dependency graph is acyclic by construction.

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Position of a matrix in its state's matrix list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixId(pub usize);

/// Position of an algebra in its state's algebra list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgebraId(pub usize);

/// Anything that can stand in for a model quantity: a plain matrix or an algebra.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Matrix(MatrixId),
    Algebra(AlgebraId),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("No matrix with index {0} exists in this state.")]
    UnknownMatrix(usize),

    #[error("No algebra with index {0} exists in this state.")]
    UnknownAlgebra(usize),

    #[error("Algebra '{algebra}' references algebra {referenced}, which is not registered before it.")]
    ForwardReference { algebra: String, referenced: usize },

    #[error("Operands of '{op}' are non-conformable: {left:?} and {right:?}.")]
    NonConformable {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("Operand of '{op}' must be {expected}, got a {rows}x{cols} matrix.")]
    BadOperandShape {
        op: &'static str,
        expected: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("Cell [{row},{col}] is outside matrix '{matrix}' of size {rows}x{cols}.")]
    CellOutOfRange {
        matrix: String,
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Matrix '{name}' has {found} {axis} names but {expected} {axis}s.")]
    DimnameCount {
        name: String,
        axis: &'static str,
        expected: usize,
        found: usize,
    },
}

/// A named, dense model matrix. Cells are written through the owning
/// [`ModelStore`] so that dependent algebras are dirtied.
#[derive(Debug, Clone)]
pub struct Matrix {
    pub name: String,
    values: Array2<f64>,
    row_names: Vec<String>,
    col_names: Vec<String>,
    version: u64,
}

impl Matrix {
    pub fn new(name: impl Into<String>, values: Array2<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            row_names: Vec::new(),
            col_names: Vec::new(),
            version: 0,
        }
    }

    /// Attaches row and column names. Either list may be empty.
    pub fn with_dimnames(
        mut self,
        row_names: Vec<String>,
        col_names: Vec<String>,
    ) -> Result<Self, ModelError> {
        check_dimnames(&self.name, self.values.dim(), &row_names, &col_names)?;
        self.row_names = row_names;
        self.col_names = col_names;
        Ok(self)
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.values.get((row, col)).copied()
    }

    /// Number of writes performed on this matrix since it was created.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    pub fn col_names(&self) -> &[String] {
        &self.col_names
    }
}

/// Expression tree evaluated by an algebra.
#[derive(Debug, Clone, PartialEq)]
pub enum AlgebraExpr {
    Matrix(MatrixId),
    Algebra(AlgebraId),
    Constant(Array2<f64>),
    Add(Box<AlgebraExpr>, Box<AlgebraExpr>),
    Subtract(Box<AlgebraExpr>, Box<AlgebraExpr>),
    /// Matrix product.
    Multiply(Box<AlgebraExpr>, Box<AlgebraExpr>),
    Transpose(Box<AlgebraExpr>),
    Scale(f64, Box<AlgebraExpr>),
    /// Vector to diagonal matrix.
    Vec2Diag(Box<AlgebraExpr>),
    /// Diagonal of a square matrix as a column vector.
    Diag2Vec(Box<AlgebraExpr>),
}

impl AlgebraExpr {
    /// Name of the top-level operation.
    pub fn op_name(&self) -> &'static str {
        match self {
            AlgebraExpr::Matrix(_) | AlgebraExpr::Algebra(_) => "ref",
            AlgebraExpr::Constant(_) => "constant",
            AlgebraExpr::Add(..) => "add",
            AlgebraExpr::Subtract(..) => "subtract",
            AlgebraExpr::Multiply(..) => "multiply",
            AlgebraExpr::Transpose(_) => "transpose",
            AlgebraExpr::Scale(..) => "scale",
            AlgebraExpr::Vec2Diag(_) => "vec2diag",
            AlgebraExpr::Diag2Vec(_) => "diag2vec",
        }
    }

    fn visit_refs(&self, matrices: &mut Vec<MatrixId>, algebras: &mut Vec<AlgebraId>) {
        match self {
            AlgebraExpr::Matrix(id) => matrices.push(*id),
            AlgebraExpr::Algebra(id) => algebras.push(*id),
            AlgebraExpr::Constant(_) => {}
            AlgebraExpr::Add(a, b) | AlgebraExpr::Subtract(a, b) | AlgebraExpr::Multiply(a, b) => {
                a.visit_refs(matrices, algebras);
                b.visit_refs(matrices, algebras);
            }
            AlgebraExpr::Transpose(a)
            | AlgebraExpr::Scale(_, a)
            | AlgebraExpr::Vec2Diag(a)
            | AlgebraExpr::Diag2Vec(a) => a.visit_refs(matrices, algebras),
        }
    }
}

/// A named, recomputable matrix-valued expression.
#[derive(Debug, Clone)]
pub struct Algebra {
    pub name: String,
    expr: AlgebraExpr,
    row_names: Vec<String>,
    col_names: Vec<String>,
    algebra_refs: Vec<AlgebraId>,
    /// Every matrix this algebra depends on, directly or transitively.
    matrix_deps: Vec<MatrixId>,
    cached: Array2<f64>,
    dirty: bool,
}

impl Algebra {
    pub fn new(name: impl Into<String>, expr: AlgebraExpr) -> Self {
        Self {
            name: name.into(),
            expr,
            row_names: Vec::new(),
            col_names: Vec::new(),
            algebra_refs: Vec::new(),
            matrix_deps: Vec::new(),
            cached: Array2::zeros((0, 0)),
            dirty: true,
        }
    }

    /// Row and column names of the result. Checked against the result shape
    /// on every recompute.
    pub fn with_dimnames(mut self, row_names: Vec<String>, col_names: Vec<String>) -> Self {
        self.row_names = row_names;
        self.col_names = col_names;
        self
    }

    pub fn expr(&self) -> &AlgebraExpr {
        &self.expr
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Matrices and algebras of one optimization state.
#[derive(Debug, Clone, Default)]
pub struct ModelStore {
    matrices: Vec<Matrix>,
    algebras: Vec<Algebra>,
}

impl ModelStore {
    pub fn add_matrix(&mut self, matrix: Matrix) -> MatrixId {
        self.matrices.push(matrix);
        MatrixId(self.matrices.len() - 1)
    }

    pub fn add_algebra(&mut self, mut algebra: Algebra) -> Result<AlgebraId, ModelError> {
        let mut matrices = Vec::new();
        let mut algebras = Vec::new();
        algebra.expr.visit_refs(&mut matrices, &mut algebras);

        for id in &matrices {
            self.matrix(*id)?;
        }
        for id in &algebras {
            if id.0 >= self.algebras.len() {
                return Err(ModelError::ForwardReference {
                    algebra: algebra.name.clone(),
                    referenced: id.0,
                });
            }
            matrices.extend(self.algebras[id.0].matrix_deps.iter().copied());
        }
        matrices.sort_unstable_by_key(|m| m.0);
        matrices.dedup();
        algebras.sort_unstable_by_key(|a| a.0);
        algebras.dedup();

        algebra.matrix_deps = matrices;
        algebra.algebra_refs = algebras;
        algebra.dirty = true;
        self.algebras.push(algebra);
        Ok(AlgebraId(self.algebras.len() - 1))
    }

    pub fn matrix(&self, id: MatrixId) -> Result<&Matrix, ModelError> {
        self.matrices
            .get(id.0)
            .ok_or(ModelError::UnknownMatrix(id.0))
    }

    pub fn algebra(&self, id: AlgebraId) -> Result<&Algebra, ModelError> {
        self.algebras
            .get(id.0)
            .ok_or(ModelError::UnknownAlgebra(id.0))
    }

    pub fn matrices(&self) -> &[Matrix] {
        &self.matrices
    }

    pub fn algebras(&self) -> &[Algebra] {
        &self.algebras
    }

    pub fn matrix_id(&self, name: &str) -> Option<MatrixId> {
        self.matrices
            .iter()
            .position(|m| m.name == name)
            .map(MatrixId)
    }

    pub fn algebra_id(&self, name: &str) -> Option<AlgebraId> {
        self.algebras
            .iter()
            .position(|a| a.name == name)
            .map(AlgebraId)
    }

    /// Looks a name up among matrices first, then algebras.
    pub fn entity(&self, name: &str) -> Option<EntityRef> {
        self.matrix_id(name)
            .map(EntityRef::Matrix)
            .or_else(|| self.algebra_id(name).map(EntityRef::Algebra))
    }

    /// Writes one cell and dirties every algebra depending on the matrix.
    pub fn set_cell(
        &mut self,
        id: MatrixId,
        row: usize,
        col: usize,
        value: f64,
    ) -> Result<(), ModelError> {
        let matrix = self
            .matrices
            .get_mut(id.0)
            .ok_or(ModelError::UnknownMatrix(id.0))?;
        let (rows, cols) = matrix.values.dim();
        match matrix.values.get_mut((row, col)) {
            Some(cell) => *cell = value,
            None => {
                return Err(ModelError::CellOutOfRange {
                    matrix: matrix.name.clone(),
                    row,
                    col,
                    rows,
                    cols,
                });
            }
        }
        matrix.version += 1;
        self.mark_dirty(id);
        Ok(())
    }

    /// Marks every algebra depending on `id` as stale.
    pub fn mark_dirty(&mut self, id: MatrixId) {
        for algebra in &mut self.algebras {
            if algebra.matrix_deps.binary_search_by_key(&id.0, |m| m.0).is_ok() {
                algebra.dirty = true;
            }
        }
    }

    pub fn is_dirty(&self, entity: EntityRef) -> Result<bool, ModelError> {
        match entity {
            EntityRef::Matrix(id) => self.matrix(id).map(|_| false),
            EntityRef::Algebra(id) => self.algebra(id).map(|a| a.dirty),
        }
    }

    /// Brings `entity` up to date. A no-op for matrices and clean algebras.
    pub fn recompute(&mut self, entity: EntityRef) -> Result<(), ModelError> {
        match entity {
            EntityRef::Matrix(id) => self.matrix(id).map(|_| ()),
            EntityRef::Algebra(id) => self.recompute_algebra(id),
        }
    }

    fn recompute_algebra(&mut self, id: AlgebraId) -> Result<(), ModelError> {
        let algebra = self.algebra(id)?;
        if !algebra.dirty {
            return Ok(());
        }
        let refs = algebra.algebra_refs.clone();
        for dep in refs {
            self.recompute_algebra(dep)?;
        }

        let algebra = &self.algebras[id.0];
        let value = self.evaluate(&algebra.expr)?;
        check_dimnames(&algebra.name, value.dim(), &algebra.row_names, &algebra.col_names)?;

        let algebra = &mut self.algebras[id.0];
        algebra.cached = value;
        algebra.dirty = false;
        log::trace!("Recomputed algebra '{}'", algebra.name);
        Ok(())
    }

    /// Current value of `entity`. Algebras report their last computed value.
    pub fn values(&self, entity: EntityRef) -> Result<ArrayView2<'_, f64>, ModelError> {
        match entity {
            EntityRef::Matrix(id) => self.matrix(id).map(|m| m.values.view()),
            EntityRef::Algebra(id) => self.algebra(id).map(|a| a.cached.view()),
        }
    }

    pub fn name(&self, entity: EntityRef) -> Result<&str, ModelError> {
        match entity {
            EntityRef::Matrix(id) => self.matrix(id).map(|m| m.name.as_str()),
            EntityRef::Algebra(id) => self.algebra(id).map(|a| a.name.as_str()),
        }
    }

    pub fn dimnames(&self, entity: EntityRef) -> Result<(&[String], &[String]), ModelError> {
        match entity {
            EntityRef::Matrix(id) => self
                .matrix(id)
                .map(|m| (m.row_names.as_slice(), m.col_names.as_slice())),
            EntityRef::Algebra(id) => self
                .algebra(id)
                .map(|a| (a.row_names.as_slice(), a.col_names.as_slice())),
        }
    }

    /// Top-level operation of an algebra; `None` for plain matrices.
    pub fn op_name(&self, entity: EntityRef) -> Result<Option<&'static str>, ModelError> {
        match entity {
            EntityRef::Matrix(id) => self.matrix(id).map(|_| None),
            EntityRef::Algebra(id) => self.algebra(id).map(|a| Some(a.expr.op_name())),
        }
    }

    /// Copies current values and staleness from `other`, the store this one
    /// was cloned from. Algebras registered there since are cloned in whole.
    pub fn refresh_from(&mut self, other: &ModelStore) {
        self.matrices.clone_from(&other.matrices);
        self.algebras.truncate(other.algebras.len());
        for (mine, theirs) in self.algebras.iter_mut().zip(&other.algebras) {
            mine.cached.clone_from(&theirs.cached);
            mine.dirty = theirs.dirty;
        }
        let known = self.algebras.len();
        self.algebras.extend_from_slice(&other.algebras[known..]);
    }

    fn evaluate(&self, expr: &AlgebraExpr) -> Result<Array2<f64>, ModelError> {
        Ok(match expr {
            AlgebraExpr::Matrix(id) => self.matrix(*id)?.values.clone(),
            AlgebraExpr::Algebra(id) => self.algebra(*id)?.cached.clone(),
            AlgebraExpr::Constant(values) => values.clone(),
            AlgebraExpr::Add(a, b) => {
                let (a, b) = (self.evaluate(a)?, self.evaluate(b)?);
                same_shape("add", &a, &b)?;
                a + b
            }
            AlgebraExpr::Subtract(a, b) => {
                let (a, b) = (self.evaluate(a)?, self.evaluate(b)?);
                same_shape("subtract", &a, &b)?;
                a - b
            }
            AlgebraExpr::Multiply(a, b) => {
                let (a, b) = (self.evaluate(a)?, self.evaluate(b)?);
                if a.ncols() != b.nrows() {
                    return Err(ModelError::NonConformable {
                        op: "multiply",
                        left: a.dim(),
                        right: b.dim(),
                    });
                }
                a.dot(&b)
            }
            AlgebraExpr::Transpose(a) => self.evaluate(a)?.reversed_axes(),
            AlgebraExpr::Scale(factor, a) => self.evaluate(a)? * *factor,
            AlgebraExpr::Vec2Diag(a) => {
                let a = self.evaluate(a)?;
                if a.nrows() != 1 && a.ncols() != 1 {
                    return Err(ModelError::BadOperandShape {
                        op: "vec2diag",
                        expected: "a row or column vector",
                        rows: a.nrows(),
                        cols: a.ncols(),
                    });
                }
                let n = a.len();
                let mut out = Array2::zeros((n, n));
                for (i, v) in a.iter().enumerate() {
                    out[(i, i)] = *v;
                }
                out
            }
            AlgebraExpr::Diag2Vec(a) => {
                let a = self.evaluate(a)?;
                if a.nrows() != a.ncols() {
                    return Err(ModelError::BadOperandShape {
                        op: "diag2vec",
                        expected: "a square matrix",
                        rows: a.nrows(),
                        cols: a.ncols(),
                    });
                }
                let n = a.nrows();
                Array2::from_shape_fn((n, 1), |(i, _)| a[(i, i)])
            }
        })
    }
}

fn same_shape(op: &'static str, a: &Array2<f64>, b: &Array2<f64>) -> Result<(), ModelError> {
    if a.dim() != b.dim() {
        return Err(ModelError::NonConformable {
            op,
            left: a.dim(),
            right: b.dim(),
        });
    }
    Ok(())
}

fn check_dimnames(
    name: &str,
    (rows, cols): (usize, usize),
    row_names: &[String],
    col_names: &[String],
) -> Result<(), ModelError> {
    if !row_names.is_empty() && row_names.len() != rows {
        return Err(ModelError::DimnameCount {
            name: name.to_string(),
            axis: "row",
            expected: rows,
            found: row_names.len(),
        });
    }
    if !col_names.is_empty() && col_names.len() != cols {
        return Err(ModelError::DimnameCount {
            name: name.to_string(),
            axis: "column",
            expected: cols,
            found: col_names.len(),
        });
    }
    Ok(())
}
