//! # Model Files
//!
//! A TOML description of a complete model: matrices, algebras, free
//! parameters, constraints, one CSV data table and one fit function. Loading
//! a file produces a ready-to-evaluate [`OptimizationState`] together with
//! the fit function.
//!
//! Algebra expressions are inline tables tagged by `op`, for example
//! `{ op = "multiply", left = { op = "ref", name = "L" }, right = { op = "transpose", arg = { op = "ref", name = "L" } } }`.
//! A `ref` names a matrix or an earlier algebra.
//!
//! Data paths are resolved relative to the model file. Numeric cells that are
//! empty or `NA` are missing; ordinal cells hold 0-based category codes.

use crate::config::EngineConfig;
use crate::context::FitFunction;
use crate::data::{DataError, DataId, DataTable};
use crate::defvars::DefinitionVariable;
use crate::derivatives::AlgebraFitFunction;
use crate::fiml::{FimlFitFunction, FimlSpec, ThresholdColumn};
use crate::matrix::{Algebra, AlgebraExpr, EntityRef, Matrix, ModelError};
use crate::row_fit::{RowFitFunction, RowFitSpec};
use crate::state::{
    CellLocation, Constraint, FitError, FreeVarGroup, FreeVariable, OptimizationState, Relation,
};
use csv::ReaderBuilder;
use ndarray::Array2;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelFileError {
    #[error("Failed to read model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to read CSV data: {0}")]
    CsvError(#[from] csv::Error),
    #[error("No {kind} named '{name}' is defined.")]
    UnknownName { kind: &'static str, name: String },
    #[error("Matrix '{0}' has rows of different lengths.")]
    RaggedMatrix(String),
    #[error("Column '{column}' row {row} holds '{value}', which is not a valid {expected}.")]
    BadValue {
        column: String,
        row: usize,
        value: String,
        expected: &'static str,
    },
    #[error("Constraint '{name}' has relation '{relation}'; expected '<', '=' or '>'.")]
    BadRelation { name: String, relation: String },
    #[error("The fit function needs a [data] section.")]
    MissingData,
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Fit(#[from] FitError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelFile {
    #[serde(default)]
    pub matrix: Vec<MatrixSpec>,
    #[serde(default)]
    pub algebra: Vec<AlgebraSpec>,
    #[serde(default)]
    pub parameter: Vec<ParameterSpec>,
    #[serde(default)]
    pub constraint: Vec<ConstraintSpec>,
    pub data: Option<DataSpec>,
    pub fit: FitSpecFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatrixSpec {
    pub name: String,
    pub values: Vec<Vec<f64>>,
    #[serde(default)]
    pub row_names: Vec<String>,
    #[serde(default)]
    pub col_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlgebraSpec {
    pub name: String,
    pub expr: ExprSpec,
    #[serde(default)]
    pub row_names: Vec<String>,
    #[serde(default)]
    pub col_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ExprSpec {
    Ref { name: String },
    Constant { values: Vec<Vec<f64>> },
    Add { left: Box<ExprSpec>, right: Box<ExprSpec> },
    Subtract { left: Box<ExprSpec>, right: Box<ExprSpec> },
    Multiply { left: Box<ExprSpec>, right: Box<ExprSpec> },
    Transpose { arg: Box<ExprSpec> },
    Scale { factor: f64, arg: Box<ExprSpec> },
    Vec2diag { arg: Box<ExprSpec> },
    Diag2vec { arg: Box<ExprSpec> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CellSpec {
    pub matrix: String,
    pub row: usize,
    pub col: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub lbound: Option<f64>,
    pub ubound: Option<f64>,
    /// Starting value; the first cell's current value when absent.
    pub start: Option<f64>,
    pub cells: Vec<CellSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstraintSpec {
    pub name: String,
    pub algebra: String,
    pub relation: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSpec {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub ordinal: Vec<OrdinalSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrdinalSpec {
    pub column: String,
    pub levels: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefinitionSpec {
    pub column: String,
    pub cells: Vec<CellSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdSpec {
    pub variable: String,
    pub matrix: String,
    pub column: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FitSpecFile {
    Fiml {
        name: String,
        covariance: String,
        means: Option<String>,
        columns: Vec<String>,
        #[serde(default)]
        thresholds: Vec<ThresholdSpec>,
        #[serde(default)]
        definition: Vec<DefinitionSpec>,
    },
    Algebra {
        name: String,
        algebra: Option<String>,
        gradient: Option<String>,
        hessian: Option<String>,
    },
    Row {
        name: String,
        row_algebra: String,
        row_results: String,
        reduce_algebra: String,
        #[serde(default)]
        definition: Vec<DefinitionSpec>,
    },
}

/// A state and its fit function, ready for evaluation.
pub struct LoadedModel {
    pub state: OptimizationState,
    pub fit: Box<dyn FitFunction>,
}

impl ModelFile {
    pub fn parse(text: &str) -> Result<Self, ModelFileError> {
        Ok(toml::from_str(text)?)
    }
}

/// Reads and builds the model at `path`.
pub fn load_model(
    path: impl AsRef<Path>,
    config: &EngineConfig,
) -> Result<LoadedModel, ModelFileError> {
    let path = path.as_ref();
    let file = ModelFile::parse(&fs::read_to_string(path)?)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    build_model(file, base, config)
}

/// Builds a model from an already parsed file. Relative data paths are
/// resolved against `base`.
pub fn build_model(
    file: ModelFile,
    base: &Path,
    config: &EngineConfig,
) -> Result<LoadedModel, ModelFileError> {
    let mut state = OptimizationState::new();
    state.set_workers(config.workers);

    for spec in &file.matrix {
        let values = dense(&spec.name, &spec.values)?;
        let matrix = Matrix::new(spec.name.clone(), values)
            .with_dimnames(spec.row_names.clone(), spec.col_names.clone())?;
        state.add_matrix(matrix);
    }
    for spec in &file.algebra {
        let expr = expression(&state, &spec.expr)?;
        let algebra = Algebra::new(spec.name.clone(), expr)
            .with_dimnames(spec.row_names.clone(), spec.col_names.clone());
        state.add_algebra(algebra)?;
    }

    let vars = file
        .parameter
        .iter()
        .map(|p| -> Result<FreeVariable, ModelFileError> {
            let cells = p
                .cells
                .iter()
                .map(|c| cell(&state, c))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FreeVariable::new(p.name.clone(), cells).with_bounds(
                p.lbound.unwrap_or(f64::NEG_INFINITY),
                p.ubound.unwrap_or(f64::INFINITY),
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;
    state.set_free_var_group(FreeVarGroup::new(1, vars));
    let mut start = state.free_values()?;
    for (value, p) in start.iter_mut().zip(&file.parameter) {
        if let Some(s) = p.start {
            *value = s;
        }
    }
    state.set_free_values(&start)?;

    for spec in &file.constraint {
        let relation = match spec.relation.trim() {
            "<" => Relation::Less,
            "=" | "==" => Relation::Equal,
            ">" => Relation::Greater,
            other => {
                return Err(ModelFileError::BadRelation {
                    name: spec.name.clone(),
                    relation: other.to_string(),
                });
            }
        };
        let algebra = state
            .store()
            .algebra_id(&spec.algebra)
            .ok_or_else(|| unknown("algebra", &spec.algebra))?;
        state.add_constraint(Constraint {
            name: spec.name.clone(),
            relation,
            algebra,
        });
    }

    let data = match &file.data {
        Some(spec) => {
            let path = if spec.path.is_absolute() {
                spec.path.clone()
            } else {
                base.join(&spec.path)
            };
            let table = read_table(&spec.name, &path, &spec.ordinal)?;
            log::info!(
                "Loaded data '{}' with {} rows and {} columns",
                table.name,
                table.rows(),
                table.cols()
            );
            Some(state.add_data(table))
        }
        None => None,
    };

    let fit = build_fit(&state, file.fit, data, config)?;
    Ok(LoadedModel { state, fit })
}

fn build_fit(
    state: &OptimizationState,
    spec: FitSpecFile,
    data: Option<DataId>,
    config: &EngineConfig,
) -> Result<Box<dyn FitFunction>, ModelFileError> {
    Ok(match spec {
        FitSpecFile::Fiml {
            name,
            covariance,
            means,
            columns,
            thresholds,
            definition,
        } => {
            let data = data.ok_or(ModelFileError::MissingData)?;
            let table = state.data(data)?;
            let data_columns = columns
                .iter()
                .map(|c| table.column_index(c).ok_or_else(|| unknown("data column", c)))
                .collect::<Result<Vec<_>, _>>()?;

            let mut threshold_columns = Vec::new();
            if !thresholds.is_empty() {
                threshold_columns = vec![ThresholdColumn::continuous(); columns.len()];
                for t in &thresholds {
                    let v = columns
                        .iter()
                        .position(|c| *c == t.variable)
                        .ok_or_else(|| unknown("model variable", &t.variable))?;
                    threshold_columns[v] =
                        ThresholdColumn::ordinal(entity(state, &t.matrix)?, t.column, t.count);
                }
            }

            let mut spec = FimlSpec::new(name, data, entity(state, &covariance)?, data_columns)
                .with_thresholds(threshold_columns)
                .with_definition_vars(definition_vars(state, data, &definition)?)
                .row_likelihoods(config.return_row_likelihoods);
            if let Some(means) = means {
                spec = spec.with_means(entity(state, &means)?);
            }
            Box::new(
                FimlFitFunction::new(state, spec)?
                    .with_integrator(Arc::new(config.integrator())),
            )
        }
        FitSpecFile::Algebra {
            name,
            algebra,
            gradient,
            hessian,
        } => {
            let algebra = algebra.map(|a| entity(state, &a)).transpose()?;
            let mut fit = AlgebraFitFunction::new(name, algebra).verbose(config.verbose);
            if let Some(gradient) = gradient {
                fit = fit.with_gradient(entity(state, &gradient)?);
            }
            if let Some(hessian) = hessian {
                fit = fit.with_hessian(entity(state, &hessian)?);
            }
            Box::new(fit)
        }
        FitSpecFile::Row {
            name,
            row_algebra,
            row_results,
            reduce_algebra,
            definition,
        } => {
            let data = data.ok_or(ModelFileError::MissingData)?;
            let results = state
                .store()
                .matrix_id(&row_results)
                .ok_or_else(|| unknown("matrix", &row_results))?;
            let spec = RowFitSpec::new(
                name,
                data,
                entity(state, &row_algebra)?,
                results,
                entity(state, &reduce_algebra)?,
            )
            .with_definition_vars(definition_vars(state, data, &definition)?);
            Box::new(RowFitFunction::new(state, spec)?)
        }
    })
}

fn unknown(kind: &'static str, name: &str) -> ModelFileError {
    ModelFileError::UnknownName {
        kind,
        name: name.to_string(),
    }
}

fn entity(state: &OptimizationState, name: &str) -> Result<EntityRef, ModelFileError> {
    state
        .store()
        .entity(name)
        .ok_or_else(|| unknown("matrix or algebra", name))
}

fn cell(state: &OptimizationState, spec: &CellSpec) -> Result<CellLocation, ModelFileError> {
    let matrix = state
        .store()
        .matrix_id(&spec.matrix)
        .ok_or_else(|| unknown("matrix", &spec.matrix))?;
    Ok(CellLocation {
        matrix,
        row: spec.row,
        col: spec.col,
    })
}

fn definition_vars(
    state: &OptimizationState,
    data: DataId,
    specs: &[DefinitionSpec],
) -> Result<Vec<DefinitionVariable>, ModelFileError> {
    let table = state.data(data)?;
    specs
        .iter()
        .map(|d| -> Result<DefinitionVariable, ModelFileError> {
            let column = table
                .column_index(&d.column)
                .ok_or_else(|| unknown("data column", &d.column))?;
            let cells = d
                .cells
                .iter()
                .map(|c| cell(state, c))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DefinitionVariable::new(data, column, cells))
        })
        .collect()
}

fn dense(name: &str, rows: &[Vec<f64>]) -> Result<Array2<f64>, ModelFileError> {
    let ncols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != ncols) {
        return Err(ModelFileError::RaggedMatrix(name.to_string()));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), ncols), flat)
        .map_err(|_| ModelFileError::RaggedMatrix(name.to_string()))
}

fn expression(state: &OptimizationState, spec: &ExprSpec) -> Result<AlgebraExpr, ModelFileError> {
    let boxed = |e: &ExprSpec| expression(state, e).map(Box::new);
    Ok(match spec {
        ExprSpec::Ref { name } => match entity(state, name)? {
            EntityRef::Matrix(id) => AlgebraExpr::Matrix(id),
            EntityRef::Algebra(id) => AlgebraExpr::Algebra(id),
        },
        ExprSpec::Constant { values } => AlgebraExpr::Constant(dense("constant", values)?),
        ExprSpec::Add { left, right } => AlgebraExpr::Add(boxed(left)?, boxed(right)?),
        ExprSpec::Subtract { left, right } => AlgebraExpr::Subtract(boxed(left)?, boxed(right)?),
        ExprSpec::Multiply { left, right } => AlgebraExpr::Multiply(boxed(left)?, boxed(right)?),
        ExprSpec::Transpose { arg } => AlgebraExpr::Transpose(boxed(arg)?),
        ExprSpec::Scale { factor, arg } => AlgebraExpr::Scale(*factor, boxed(arg)?),
        ExprSpec::Vec2diag { arg } => AlgebraExpr::Vec2Diag(boxed(arg)?),
        ExprSpec::Diag2vec { arg } => AlgebraExpr::Diag2Vec(boxed(arg)?),
    })
}

fn is_missing_cell(field: &str) -> bool {
    field.is_empty() || field.eq_ignore_ascii_case("na")
}

/// Reads a headed CSV file. Columns listed in `ordinal` become ordinal
/// columns; every other column is numeric.
fn read_table(
    name: &str,
    path: &Path,
    ordinal: &[OrdinalSpec],
) -> Result<DataTable, ModelFileError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    for spec in ordinal {
        if !headers.contains(&spec.column) {
            return Err(unknown("data column", &spec.column));
        }
    }

    let mut fields: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record?;
        for (column, field) in fields.iter_mut().zip(record.iter()) {
            column.push(field.trim().to_string());
        }
    }

    let mut table = DataTable::new(name);
    for (header, column) in headers.iter().zip(fields) {
        match ordinal.iter().find(|o| o.column == *header) {
            Some(spec) => {
                let codes = column
                    .iter()
                    .enumerate()
                    .map(|(row, f)| {
                        if is_missing_cell(f) {
                            return Ok(None);
                        }
                        f.parse::<u32>().map(Some).map_err(|_| ModelFileError::BadValue {
                            column: header.clone(),
                            row,
                            value: f.clone(),
                            expected: "category code",
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                table.push_ordinal(header.clone(), spec.levels, codes)?;
            }
            None => {
                let values = column
                    .iter()
                    .enumerate()
                    .map(|(row, f)| {
                        if is_missing_cell(f) {
                            return Ok(f64::NAN);
                        }
                        f.parse::<f64>().map_err(|_| ModelFileError::BadValue {
                            column: header.clone(),
                            row,
                            value: f.clone(),
                            expected: "number",
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                table.push_numeric(header.clone(), values)?;
            }
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FitContext, InfoMethod, Want};
    use std::io::Write;

    const MODEL: &str = r#"
[[matrix]]
name = "L"
values = [[1.0, 0.0], [0.5, 1.0]]

[[algebra]]
name = "cov"
expr = { op = "multiply", left = { op = "ref", name = "L" }, right = { op = "transpose", arg = { op = "ref", name = "L" } } }

[[parameter]]
name = "l21"
cells = [{ matrix = "L", row = 1, col = 0 }]
start = 0.25
lbound = -1.0
ubound = 1.0

[[constraint]]
name = "positive"
algebra = "cov"
relation = ">"

[data]
name = "obs"
path = "obs.csv"

[fit]
type = "fiml"
name = "fiml"
covariance = "cov"
columns = ["x", "y"]
"#;

    #[test]
    fn loads_and_evaluates_a_fiml_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut csv = fs::File::create(dir.path().join("obs.csv")).unwrap();
        writeln!(csv, "x,y\n0.5,1.0\nNA,-0.5\n1.5,").unwrap();
        let model_path = dir.path().join("model.toml");
        fs::write(&model_path, MODEL).unwrap();

        let config = EngineConfig {
            workers: 1,
            ..EngineConfig::default()
        };
        let LoadedModel { mut state, mut fit } = load_model(&model_path, &config).unwrap();
        assert_eq!(state.free_values().unwrap(), vec![0.25]);
        assert_eq!(state.constraints().len(), 1);
        assert!(state.data(DataId(0)).unwrap().is_missing(1, 0));

        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);
        assert!(fit.evaluate(&mut state, Want::FIT, &mut fc));
        assert!(fit.fit_value().is_finite());
    }

    #[test]
    fn unknown_references_are_named() {
        let text = MODEL.replace("name = \"L\" }, right", "name = \"Q\" }, right");
        let file = ModelFile::parse(&text).unwrap();
        let err = match build_model(file, Path::new("."), &EngineConfig::default()) {
            Err(err) => err,
            Ok(_) => panic!("model with a dangling reference was accepted"),
        };
        assert!(err.to_string().contains("'Q'"));
    }

    #[test]
    fn ragged_matrices_are_rejected() {
        assert!(matches!(
            dense("M", &[vec![1.0, 2.0], vec![3.0]]),
            Err(ModelFileError::RaggedMatrix(_))
        ));
        assert_eq!(dense("E", &[]).unwrap().dim(), (0, 0));
    }
}
