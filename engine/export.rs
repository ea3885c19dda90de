//! Final results and whole-state export. Everything here is plain serde data
//! so the binary can write it as TOML.

use crate::context::FitFunction;
use crate::matrix::EntityRef;
use crate::state::{FitError, OptimizationState};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// A labeled, row-major block of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub label: String,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
}

impl ResultEntry {
    pub fn scalar(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            rows: 1,
            cols: 1,
            values: vec![value],
        }
    }

    pub fn column(label: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            label: label.into(),
            rows: values.len(),
            cols: 1,
            values,
        }
    }

    pub fn matrix(label: impl Into<String>, values: ArrayView2<f64>) -> Self {
        let (rows, cols) = values.dim();
        Self {
            label: label.into(),
            rows,
            cols,
            values: values.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedEntity {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub row_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub col_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedFit {
    pub name: String,
    pub results: Vec<ResultEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<ResultEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedState {
    pub status_code: i32,
    pub status_message: String,
    pub evaluations: u64,
    pub free_parameters: Vec<String>,
    pub free_values: Vec<f64>,
    pub matrices: Vec<ExportedEntity>,
    pub algebras: Vec<ExportedEntity>,
    pub fits: Vec<ExportedFit>,
}

/// Recomputes every matrix and algebra and copies out their values together
/// with the status and the results of `fits`.
pub fn export_state(
    state: &mut OptimizationState,
    fits: &[&dyn FitFunction],
) -> Result<ExportedState, FitError> {
    let matrix_count = state.store().matrices().len();
    let algebra_count = state.store().algebras().len();
    let entities: Vec<EntityRef> = (0..matrix_count)
        .map(|i| EntityRef::Matrix(crate::matrix::MatrixId(i)))
        .chain((0..algebra_count).map(|i| EntityRef::Algebra(crate::matrix::AlgebraId(i))))
        .collect();

    let mut matrices = Vec::with_capacity(matrix_count);
    let mut algebras = Vec::with_capacity(algebra_count);
    for entity in entities {
        state.recompute(entity)?;
        let store = state.store();
        let values = store.values(entity)?;
        let (row_names, col_names) = store.dimnames(entity)?;
        let exported = ExportedEntity {
            name: store.name(entity)?.to_string(),
            rows: values.nrows(),
            cols: values.ncols(),
            values: values.iter().copied().collect(),
            row_names: row_names.to_vec(),
            col_names: col_names.to_vec(),
        };
        match entity {
            EntityRef::Matrix(_) => matrices.push(exported),
            EntityRef::Algebra(_) => algebras.push(exported),
        }
    }
    log::debug!(
        "Exported {} matrices and {} algebras",
        matrices.len(),
        algebras.len()
    );

    Ok(ExportedState {
        status_code: state.status().code,
        status_message: state.status().message.clone(),
        evaluations: state.compute_count(),
        free_parameters: state
            .free_vars()
            .vars()
            .iter()
            .map(|v| v.name.clone())
            .collect(),
        free_values: state.free_values()?,
        matrices,
        algebras,
        fits: fits
            .iter()
            .map(|fit| ExportedFit {
                name: fit.name().to_string(),
                results: fit.final_results(),
                attributes: fit.attributes(),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Algebra, AlgebraExpr, Matrix};
    use crate::state::{CellLocation, FreeVarGroup, FreeVariable};
    use ndarray::array;

    #[test]
    fn export_recomputes_stale_algebras() {
        let mut state = OptimizationState::new();
        let a = state.add_matrix(Matrix::new("A", array![[1.0, 2.0], [3.0, 4.0]]));
        state
            .add_algebra(Algebra::new(
                "At",
                AlgebraExpr::Transpose(Box::new(AlgebraExpr::Matrix(a))),
            ))
            .unwrap();
        state.set_free_var_group(FreeVarGroup::new(
            0,
            vec![FreeVariable::new(
                "a11",
                vec![CellLocation { matrix: a, row: 0, col: 0 }],
            )],
        ));
        state.set_free_values(&[7.0]).unwrap();

        let exported = export_state(&mut state, &[]).unwrap();
        assert_eq!(exported.free_parameters, vec!["a11".to_string()]);
        assert_eq!(exported.free_values, vec![7.0]);
        assert_eq!(exported.algebras[0].name, "At");
        assert_eq!(exported.algebras[0].values, vec![7.0, 3.0, 2.0, 4.0]);
        assert_eq!(exported.matrices[0].rows, 2);

        let text = toml::to_string(&exported).unwrap();
        assert!(text.contains("At"));
    }
}
