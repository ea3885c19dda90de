//! # Full-Information Maximum Likelihood
//!
//! Row-wise multivariate normal likelihood of a data table under a model's
//! expected covariance, means and (for ordinal variables) thresholds. Missing
//! values are handled per row by restricting the distribution to the
//! observed variables.
//!
//! Three variants are selected from the threshold layout:
//!
//! - Continuous: every variable is numeric; each row contributes a
//!   multivariate normal log-density.
//! - Ordinal: every variable is thresholded; each row contributes the log
//!   of a rectangle probability over the standardized latent normal.
//! - Joint: both kinds; the ordinal block is conditioned on the row's
//!   continuous values and the two terms add on the log scale.
//!
//! When no definition variables are registered the moments are resolved
//! once per evaluation and shared by every worker. Otherwise each worker
//! resolves them again whenever a definition variable changes value.
//!
//! Each row's slot holds ln L_i. The fit value is `-2 * sum(ln L_i)`, summed
//! in ascending row order whatever the worker count.

mod rows;

use crate::context::{FitContext, FitFunction, Want};
use crate::data::DataId;
use crate::defvars::{DefinitionVarTracker, DefinitionVariable};
use crate::export::ResultEntry;
use crate::matrix::EntityRef;
use crate::mvn::{GenzIntegrator, RectangleIntegrator};
use crate::partition::{evaluate_partitioned, reduce_ordered};
use crate::state::{FitError, OptimizationState};
use ndarray::{Array1, Array2};
use std::fmt;
use std::sync::Arc;

/// Links one model variable to its threshold column. A column with zero
/// thresholds is continuous.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdColumn {
    pub matrix: Option<EntityRef>,
    pub column: usize,
    pub count: usize,
}

impl ThresholdColumn {
    pub fn continuous() -> Self {
        Self {
            matrix: None,
            column: 0,
            count: 0,
        }
    }

    pub fn ordinal(matrix: EntityRef, column: usize, count: usize) -> Self {
        Self {
            matrix: Some(matrix),
            column,
            count,
        }
    }

    pub fn is_ordinal(&self) -> bool {
        self.count > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FimlVariant {
    Continuous,
    Ordinal,
    Joint,
}

impl fmt::Display for FimlVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FimlVariant::Continuous => "continuous",
            FimlVariant::Ordinal => "ordinal",
            FimlVariant::Joint => "joint ordinal/continuous",
        })
    }
}

/// Configuration of a FIML fit function.
#[derive(Debug, Clone)]
pub struct FimlSpec {
    pub name: String,
    pub data: DataId,
    pub covariance: EntityRef,
    pub means: Option<EntityRef>,
    /// Data column of each model variable, in covariance order.
    pub data_columns: Vec<usize>,
    /// One entry per model variable. Empty means all continuous.
    pub thresholds: Vec<ThresholdColumn>,
    pub definition_vars: Vec<DefinitionVariable>,
    pub return_row_likelihoods: bool,
}

impl FimlSpec {
    pub fn new(
        name: impl Into<String>,
        data: DataId,
        covariance: EntityRef,
        data_columns: Vec<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            data,
            covariance,
            means: None,
            data_columns,
            thresholds: Vec::new(),
            definition_vars: Vec::new(),
            return_row_likelihoods: false,
        }
    }

    pub fn with_means(mut self, means: EntityRef) -> Self {
        self.means = Some(means);
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<ThresholdColumn>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_definition_vars(mut self, vars: Vec<DefinitionVariable>) -> Self {
        self.definition_vars = vars;
        self
    }

    pub fn row_likelihoods(mut self, enabled: bool) -> Self {
        self.return_row_likelihoods = enabled;
        self
    }
}

/// Immutable part of a FIML fit function, shared by every worker.
struct FimlModel {
    data: DataId,
    covariance: EntityRef,
    means: Option<EntityRef>,
    columns: Vec<usize>,
    thresholds: Vec<ThresholdColumn>,
    variant: FimlVariant,
    tracker: DefinitionVarTracker,
    integrator: Arc<dyn RectangleIntegrator>,
}

pub struct FimlFitFunction {
    name: String,
    model: FimlModel,
    return_row_likelihoods: bool,
    row_log_likelihoods: Vec<f64>,
    fit: f64,
    expected_cov: Array2<f64>,
    expected_means: Array1<f64>,
}

impl FimlFitFunction {
    /// Validates `spec` against `state` and selects the variant.
    pub fn new(state: &OptimizationState, spec: FimlSpec) -> Result<Self, FitError> {
        let table = state.data(spec.data)?;
        let n = spec.data_columns.len();
        if n == 0 {
            return Err(FitError::InvalidConfig(format!(
                "{}: FIML needs at least one model variable",
                spec.name
            )));
        }

        let thresholds = if spec.thresholds.is_empty() {
            vec![ThresholdColumn::continuous(); n]
        } else if spec.thresholds.len() == n {
            spec.thresholds
        } else {
            return Err(FitError::InvalidConfig(format!(
                "{}: {} threshold columns for {} model variables",
                spec.name,
                spec.thresholds.len(),
                n
            )));
        };

        for (v, (&col, threshold)) in spec.data_columns.iter().zip(&thresholds).enumerate() {
            if col >= table.cols() {
                return Err(FitError::InvalidConfig(format!(
                    "{}: model variable {v} maps to column {col}, but data '{}' has {} columns",
                    spec.name,
                    table.name,
                    table.cols()
                )));
            }
            if threshold.is_ordinal() {
                let Some(matrix) = threshold.matrix else {
                    return Err(FitError::InvalidConfig(format!(
                        "{}: model variable {v} has {} thresholds but no threshold matrix",
                        spec.name, threshold.count
                    )));
                };
                state.store().name(matrix)?;
                if !table.is_factor(col) {
                    return Err(FitError::InvalidConfig(format!(
                        "{}: column '{}' has thresholds but is not ordinal",
                        spec.name,
                        table.column_name(col)
                    )));
                }
            } else if table.is_factor(col) {
                return Err(FitError::InvalidConfig(format!(
                    "{}: ordinal column '{}' has no thresholds",
                    spec.name,
                    table.column_name(col)
                )));
            }
        }

        state.store().name(spec.covariance)?;
        if let Some(means) = spec.means {
            state.store().name(means)?;
        }

        let ordinal = thresholds.iter().filter(|t| t.is_ordinal()).count();
        let variant = match (ordinal, n - ordinal) {
            (0, _) => FimlVariant::Continuous,
            (_, 0) => FimlVariant::Ordinal,
            _ => FimlVariant::Joint,
        };
        let tracker = DefinitionVarTracker::new(state, spec.definition_vars)?;
        log::info!(
            "{}: {} FIML over {} variables and {} rows ({} definition variables)",
            spec.name,
            variant,
            n,
            table.rows(),
            tracker.len()
        );
        let rows = table.rows();

        Ok(Self {
            name: spec.name,
            model: FimlModel {
                data: spec.data,
                covariance: spec.covariance,
                means: spec.means,
                columns: spec.data_columns,
                thresholds,
                variant,
                tracker,
                integrator: Arc::new(GenzIntegrator::default()),
            },
            return_row_likelihoods: spec.return_row_likelihoods,
            row_log_likelihoods: vec![0.0; rows],
            fit: f64::NAN,
            expected_cov: Array2::zeros((0, 0)),
            expected_means: Array1::zeros(0),
        })
    }

    /// Replaces the rectangle-probability backend.
    pub fn with_integrator(mut self, integrator: Arc<dyn RectangleIntegrator>) -> Self {
        self.model.integrator = integrator;
        self
    }

    pub fn variant(&self) -> FimlVariant {
        self.model.variant
    }

    pub fn has_definition_vars(&self) -> bool {
        !self.model.tracker.is_empty()
    }

    /// ln L_i of every row from the last evaluation.
    pub fn row_log_likelihoods(&self) -> &[f64] {
        &self.row_log_likelihoods
    }

    /// -2 times the ordered sum of the per-row log-likelihoods.
    pub fn minus_two_log_likelihood(&self) -> f64 {
        -2.0 * reduce_ordered(&self.row_log_likelihoods)
    }

    /// The designated output: the 1x1 fit value, or in per-row mode a column
    /// of per-row log-likelihoods.
    pub fn output(&self) -> Array2<f64> {
        if self.return_row_likelihoods {
            Array2::from_shape_fn((self.row_log_likelihoods.len(), 1), |(r, _)| {
                self.row_log_likelihoods[r]
            })
        } else {
            Array2::from_elem((1, 1), self.fit)
        }
    }

    fn capture_expected(&mut self, state: &mut OptimizationState) -> Result<(), FitError> {
        state.recompute(self.model.covariance)?;
        self.expected_cov = state.values(self.model.covariance)?.to_owned();
        self.expected_means = match self.model.means {
            Some(means) => {
                state.recompute(means)?;
                state.values(means)?.iter().copied().collect()
            }
            None => Array1::zeros(0),
        };
        Ok(())
    }
}

impl FitFunction for FimlFitFunction {
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

        let n_rows = state.data(self.model.data)?.rows();
        let shared = if self.model.tracker.is_empty() {
            log::debug!("{}: precalculating moments for all rows", self.name);
            Some(self.model.snapshot(state)?)
        } else {
            None
        };

        let mut slots = std::mem::take(&mut self.row_log_likelihoods);
        slots.resize(n_rows, 0.0);
        let model = &self.model;
        let outcome = evaluate_partitioned(state, n_rows, &mut slots, |replica, rows, out| {
            model.evaluate_rows(replica, rows, out, shared.as_ref())
        });
        self.row_log_likelihoods = slots;
        if !outcome? {
            return Ok(());
        }

        self.capture_expected(state)?;
        if !self.return_row_likelihoods {
            self.fit = self.minus_two_log_likelihood();
            log::debug!("{}: -2 log-likelihood is {:.3}", self.name, self.fit);
        }
        Ok(())
    }

    fn fit_value(&self) -> f64 {
        self.fit
    }

    fn final_results(&self) -> Vec<ResultEntry> {
        let mut results = vec![ResultEntry::scalar(
            "Minus2LogLikelihood",
            self.minus_two_log_likelihood(),
        )];
        if self.return_row_likelihoods {
            results.push(ResultEntry::column(
                "rowLogLikelihoods",
                self.row_log_likelihoods.clone(),
            ));
        }
        results
    }

    fn attributes(&self) -> Vec<ResultEntry> {
        vec![
            ResultEntry::matrix("expCov", self.expected_cov.view()),
            ResultEntry::column("expMean", self.expected_means.to_vec()),
            ResultEntry::column("rowLogLikelihoods", self.row_log_likelihoods.clone()),
        ]
    }
}
