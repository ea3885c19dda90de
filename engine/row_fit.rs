//! # Row/Reduce Fit Function
//!
//! Evaluates a row algebra once per data row, stacks the first row of each
//! result into a row-results matrix and reduces that matrix with a second
//! algebra. Element `[0,0]` of the reduction is the fit value.
//!
//! Evaluation is serial. Without definition variables every row sees the
//! same model, so the row algebra is computed once and copied into all rows.

use crate::context::{FitContext, FitFunction, Want};
use crate::data::DataId;
use crate::defvars::{DefinitionVarTracker, DefinitionVariable};
use crate::matrix::{EntityRef, MatrixId};
use crate::state::{FitError, OptimizationState};
use ndarray::Array1;

#[derive(Debug, Clone)]
pub struct RowFitSpec {
    pub name: String,
    pub data: DataId,
    pub row_algebra: EntityRef,
    /// Receives one row per data row; must have as many rows as the data.
    pub row_results: MatrixId,
    pub reduce_algebra: EntityRef,
    pub definition_vars: Vec<DefinitionVariable>,
}

impl RowFitSpec {
    pub fn new(
        name: impl Into<String>,
        data: DataId,
        row_algebra: EntityRef,
        row_results: MatrixId,
        reduce_algebra: EntityRef,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            row_algebra,
            row_results,
            reduce_algebra,
            definition_vars: Vec::new(),
        }
    }

    pub fn with_definition_vars(mut self, vars: Vec<DefinitionVariable>) -> Self {
        self.definition_vars = vars;
        self
    }
}

pub struct RowFitFunction {
    name: String,
    data: DataId,
    row_algebra: EntityRef,
    row_results: MatrixId,
    reduce_algebra: EntityRef,
    tracker: DefinitionVarTracker,
    fit: f64,
}

impl RowFitFunction {
    pub fn new(state: &OptimizationState, spec: RowFitSpec) -> Result<Self, FitError> {
        state.data(spec.data)?;
        state.store().name(spec.row_algebra)?;
        state.store().matrix(spec.row_results)?;
        state.store().name(spec.reduce_algebra)?;
        let tracker = DefinitionVarTracker::new(state, spec.definition_vars)?;
        log::info!(
            "{}: row/reduce fit with {} definition variables",
            spec.name,
            tracker.len()
        );
        Ok(Self {
            name: spec.name,
            data: spec.data,
            row_algebra: spec.row_algebra,
            row_results: spec.row_results,
            reduce_algebra: spec.reduce_algebra,
            tracker,
            fit: f64::NAN,
        })
    }

    /// Recomputes the row algebra and returns its first row.
    fn row_values(
        &self,
        state: &mut OptimizationState,
        width: usize,
    ) -> Result<Array1<f64>, FitError> {
        state.recompute(self.row_algebra)?;
        let values = state.values(self.row_algebra)?;
        if values.nrows() == 0 || values.ncols() != width {
            return Err(FitError::Shape {
                what: format!("row algebra '{}'", state.store().name(self.row_algebra)?),
                expected: format!("at least one row of {width} columns"),
                found: format!("{}x{}", values.nrows(), values.ncols()),
            });
        }
        Ok(values.row(0).to_owned())
    }

    fn copy_into_row(
        &self,
        state: &mut OptimizationState,
        row: usize,
        values: &Array1<f64>,
    ) -> Result<(), FitError> {
        for (col, &value) in values.iter().enumerate() {
            state
                .store_mut()
                .set_cell(self.row_results, row, col, value)?;
        }
        Ok(())
    }
}

impl FitFunction for RowFitFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(
        &mut self,
        state: &mut OptimizationState,
        want: Want,
        _: &mut FitContext,
    ) -> Result<(), FitError> {
        if !want.wants_fit() {
            return Ok(());
        }
        self.fit = f64::NAN;

        let n_rows = state.data(self.data)?.rows();
        let results = state.store().matrix(self.row_results)?;
        let (rows, width) = results.values().dim();
        if rows != n_rows {
            return Err(FitError::Shape {
                what: format!("row results '{}'", results.name),
                expected: format!("{n_rows} rows"),
                found: format!("{rows} rows"),
            });
        }

        if self.tracker.is_empty() {
            log::debug!("{}: precalculating row algebra for all rows", self.name);
            let values = self.row_values(state, width)?;
            for row in 0..n_rows {
                self.copy_into_row(state, row, &values)?;
            }
        } else {
            let mut tracker = self.tracker.fresh();
            for row in 0..n_rows {
                tracker.apply(state, self.data, row)?;
                state.next_row();
                let values = self.row_values(state, width)?;
                self.copy_into_row(state, row, &values)?;
            }
        }
        state.store_mut().mark_dirty(self.row_results);

        state.recompute(self.reduce_algebra)?;
        let reduced = state.values(self.reduce_algebra)?;
        self.fit = match reduced.get((0, 0)) {
            Some(&value) => value,
            None => {
                let name = state.store().name(self.reduce_algebra)?;
                return Err(FitError::Shape {
                    what: format!("reduce algebra '{name}'"),
                    expected: "at least 1x1".to_string(),
                    found: "0x0".to_string(),
                });
            }
        };
        log::debug!("{}: reduced fit is {}", self.name, self.fit);
        Ok(())
    }

    fn fit_value(&self) -> f64 {
        self.fit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InfoMethod;
    use crate::data::DataTable;
    use crate::matrix::{Algebra, AlgebraExpr, Matrix};
    use crate::state::CellLocation;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    struct Setup {
        state: OptimizationState,
        data: DataId,
        x: MatrixId,
        row: EntityRef,
        results: MatrixId,
        reduce: EntityRef,
    }

    /// Row algebra `x * b`, reduced to the sum of squares of the row results.
    fn setup(xs: Vec<f64>) -> Setup {
        let mut state = OptimizationState::new();
        let n = xs.len();
        let mut table = DataTable::new("obs");
        table.push_numeric("x", xs).unwrap();
        let data = state.add_data(table);
        let x = state.add_matrix(Matrix::new("X", array![[0.0]]));
        let b = state.add_matrix(Matrix::new("B", array![[3.0]]));
        let results = state.add_matrix(Matrix::new("R", Array2::zeros((n, 1))));
        let row = state
            .add_algebra(Algebra::new(
                "xb",
                AlgebraExpr::Multiply(
                    Box::new(AlgebraExpr::Matrix(x)),
                    Box::new(AlgebraExpr::Matrix(b)),
                ),
            ))
            .unwrap();
        let reduce = state
            .add_algebra(Algebra::new(
                "ss",
                AlgebraExpr::Multiply(
                    Box::new(AlgebraExpr::Transpose(Box::new(AlgebraExpr::Matrix(results)))),
                    Box::new(AlgebraExpr::Matrix(results)),
                ),
            ))
            .unwrap();
        Setup {
            state,
            data,
            x,
            row: EntityRef::Algebra(row),
            results,
            reduce: EntityRef::Algebra(reduce),
        }
    }

    fn run(state: &mut OptimizationState, fit: &mut RowFitFunction) -> bool {
        let mut fc = FitContext::for_state(state, InfoMethod::Hessian);
        fit.evaluate(state, Want::FIT, &mut fc)
    }

    #[test]
    fn definition_variables_drive_each_row() {
        let mut s = setup(vec![1.0, 2.0, -1.0]);
        let var = DefinitionVariable::new(
            s.data,
            0,
            vec![CellLocation { matrix: s.x, row: 0, col: 0 }],
        );
        let spec = RowFitSpec::new("rows", s.data, s.row, s.results, s.reduce)
            .with_definition_vars(vec![var]);
        let mut fit = RowFitFunction::new(&s.state, spec).unwrap();

        assert!(run(&mut s.state, &mut fit));
        assert_abs_diff_eq!(fit.fit_value(), 9.0 + 36.0 + 9.0, epsilon = 1e-12);
        let results = s.state.store().matrix(s.results).unwrap().values().to_owned();
        assert_eq!(results, array![[3.0], [6.0], [-3.0]]);
        assert_eq!(s.state.current_row(), 3);
    }

    #[test]
    fn without_definition_variables_every_row_is_identical() {
        let mut s = setup(vec![1.0, 2.0]);
        s.state.store_mut().set_cell(s.x, 0, 0, 2.0).unwrap();
        let spec = RowFitSpec::new("rows", s.data, s.row, s.results, s.reduce);
        let mut fit = RowFitFunction::new(&s.state, spec).unwrap();

        assert!(run(&mut s.state, &mut fit));
        assert_abs_diff_eq!(fit.fit_value(), 72.0, epsilon = 1e-12);
        assert_eq!(s.state.current_row(), 0);
        assert_eq!(fit.final_results()[0].label, "fit");
    }

    #[test]
    fn missing_definition_value_is_fatal() {
        let mut s = setup(vec![1.0, f64::NAN, 2.0]);
        let var = DefinitionVariable::new(
            s.data,
            0,
            vec![CellLocation { matrix: s.x, row: 0, col: 0 }],
        );
        let spec = RowFitSpec::new("rows", s.data, s.row, s.results, s.reduce)
            .with_definition_vars(vec![var]);
        let mut fit = RowFitFunction::new(&s.state, spec).unwrap();

        assert!(!run(&mut s.state, &mut fit));
        assert!(s.state.status().is_error());
        assert!(fit.fit_value().is_nan());
        let results = s.state.store().matrix(s.results).unwrap().values().to_owned();
        assert_eq!(results, array![[3.0], [0.0], [0.0]]);
    }

    #[test]
    fn row_results_must_match_the_data() {
        let mut s = setup(vec![1.0, 2.0]);
        let short = s.state.add_matrix(Matrix::new("short", Array2::zeros((1, 1))));
        let spec = RowFitSpec::new("rows", s.data, s.row, short, s.reduce);
        let mut fit = RowFitFunction::new(&s.state, spec).unwrap();

        assert!(!run(&mut s.state, &mut fit));
        assert!(s.state.status().message.contains("row results 'short'"));
    }
}
