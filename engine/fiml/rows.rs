//! Model moments snapshots and the per-row log-likelihoods of the three
//! FIML variants.

use super::{FimlModel, FimlVariant, ThresholdColumn};
use crate::data::DataTable;
use crate::matrix::EntityRef;
use crate::mvn::{
    IntegrationError, log_density_from_cholesky, lower_cholesky, solve_lower_matrix,
};
use crate::state::{FitError, OptimizationState};
use crate::subset::{SubsetView, VectorSubset};
use ndarray::{Array1, Array2, ArrayView1};
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;

/// Expected covariance, means and thresholds resolved from the model at one
/// point in time. Shared read-only across workers when nothing varies by row.
#[derive(Debug, Clone)]
pub(super) struct Moments {
    pub cov: Array2<f64>,
    pub means: Array1<f64>,
    /// Thresholds of each model variable; `None` for continuous variables.
    pub thresholds: Vec<Option<Array1<f64>>>,
    /// Cholesky factor of `cov`, kept for complete continuous rows. `None`
    /// when not computed or when `cov` is not positive-definite.
    pub full_chol: Option<Array2<f64>>,
    /// Standard deviations and correlation matrix of `cov` (ordinal variant).
    pub standardized: Option<(Array1<f64>, Array2<f64>)>,
}

fn standardize(cov: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let sd = cov.diag().mapv(f64::sqrt);
    let corr = Array2::from_shape_fn(cov.dim(), |(i, j)| cov[(i, j)] / (sd[i] * sd[j]));
    (sd, corr)
}

fn not_positive(s: f64) -> bool {
    s.is_nan() || s <= 0.0
}

impl FimlModel {
    /// Recomputes the covariance, means and threshold algebras and copies
    /// them out of `state`.
    pub(super) fn snapshot(&self, state: &mut OptimizationState) -> Result<Moments, FitError> {
        let n = self.columns.len();

        state.recompute(self.covariance)?;
        let cov = state.values(self.covariance)?.to_owned();
        if cov.dim() != (n, n) {
            return Err(FitError::Shape {
                what: format!("expected covariance '{}'", state.store().name(self.covariance)?),
                expected: format!("{n}x{n}"),
                found: format!("{}x{}", cov.nrows(), cov.ncols()),
            });
        }

        let means = match self.means {
            Some(entity) => {
                state.recompute(entity)?;
                let values = state.values(entity)?;
                if values.len() != n {
                    return Err(FitError::Shape {
                        what: format!("expected means '{}'", state.store().name(entity)?),
                        expected: format!("a vector of length {n}"),
                        found: format!("{}x{}", values.nrows(), values.ncols()),
                    });
                }
                values.iter().copied().collect()
            }
            None => Array1::zeros(n),
        };

        let mut thresholds = Vec::with_capacity(n);
        for column in &self.thresholds {
            thresholds.push(match column.matrix {
                Some(entity) if column.is_ordinal() => {
                    Some(threshold_values(state, entity, column)?)
                }
                _ => None,
            });
        }

        let full_chol = match self.variant {
            FimlVariant::Continuous => lower_cholesky(&cov),
            _ => None,
        };
        let standardized = match self.variant {
            FimlVariant::Ordinal => Some(standardize(&cov)),
            _ => None,
        };

        Ok(Moments {
            cov,
            means,
            thresholds,
            full_chol,
            standardized,
        })
    }

    /// Evaluates `rows` into `out`, one slot per row. Stops at the first
    /// failing row, leaving that slot and every later one untouched.
    pub(super) fn evaluate_rows(
        &self,
        state: &mut OptimizationState,
        rows: Range<usize>,
        out: &mut [f64],
        shared: Option<&Moments>,
    ) -> Result<(), FitError> {
        let table = Arc::clone(state.data(self.data)?);
        let mut tracker = self.tracker.fresh();
        let mut local: Option<Moments> = None;
        log::trace!("Evaluating rows {}..{}", rows.start, rows.end);

        for (slot, row) in out.iter_mut().zip(rows) {
            if !tracker.is_empty()
                && (tracker.apply(state, self.data, row)? > 0 || local.is_none())
            {
                local = Some(self.snapshot(state)?);
            }
            let moments = local.as_ref().or(shared).ok_or_else(|| {
                FitError::InvalidConfig("model moments were not computed".to_string())
            })?;
            *slot = self.row_log_likelihood(moments, &table, row)?;
            state.next_row();
        }
        Ok(())
    }

    pub(super) fn row_log_likelihood(
        &self,
        moments: &Moments,
        table: &DataTable,
        row: usize,
    ) -> Result<f64, FitError> {
        match self.variant {
            FimlVariant::Continuous => self.continuous_row(moments, table, row),
            FimlVariant::Ordinal => self.ordinal_row(moments, table, row),
            FimlVariant::Joint => self.joint_row(moments, table, row),
        }
    }

    fn continuous_row(&self, m: &Moments, table: &DataTable, row: usize) -> Result<f64, FitError> {
        let observed: Vec<usize> = (0..self.columns.len())
            .filter(|&v| !table.is_missing(row, self.columns[v]))
            .collect();
        if observed.is_empty() {
            return Ok(0.0);
        }

        let mu = VectorSubset::new(m.means.view(), &observed);
        let residual: Array1<f64> = observed
            .iter()
            .enumerate()
            .map(|(i, &v)| table.double_element(row, self.columns[v]) - mu.get(i))
            .collect();

        let view = SubsetView::square(m.cov.view(), &observed);
        let subset;
        let l = if view.is_full() {
            m.full_chol
                .as_ref()
                .ok_or(FitError::NotPositiveDefinite { row })?
        } else {
            subset = lower_cholesky(&view.to_owned()).ok_or(FitError::NotPositiveDefinite { row })?;
            &subset
        };
        log_density_from_cholesky(l, residual.view())
            .map(|(ll, _)| ll)
            .ok_or(FitError::NotPositiveDefinite { row })
    }

    fn ordinal_row(&self, m: &Moments, table: &DataTable, row: usize) -> Result<f64, FitError> {
        let (sd, corr) = m.standardized.as_ref().ok_or_else(|| {
            FitError::InvalidConfig("ordinal moments were not standardized".to_string())
        })?;

        let mut observed = Vec::new();
        let mut lower = Vec::new();
        let mut upper = Vec::new();
        for v in 0..self.columns.len() {
            let Some(code) = table.int_element(row, self.columns[v]) else {
                continue;
            };
            if not_positive(sd[v]) {
                return Err(FitError::NotPositiveDefinite { row });
            }
            let (lo, hi) = self.category_bounds(m, table, row, v, code)?;
            observed.push(v);
            lower.push((lo - m.means[v]) / sd[v]);
            upper.push((hi - m.means[v]) / sd[v]);
        }
        if observed.is_empty() {
            return Ok(0.0);
        }

        let corr = SubsetView::square(corr.view(), &observed).to_owned();
        Ok(self.integrate(row, &corr, &lower, &upper)?.ln())
    }

    /// Continuous density times the probability of the ordinal categories
    /// conditional on the observed continuous values.
    fn joint_row(&self, m: &Moments, table: &DataTable, row: usize) -> Result<f64, FitError> {
        let mut cont = Vec::new();
        let mut ord = Vec::new();
        let mut codes = Vec::new();
        for v in 0..self.columns.len() {
            let col = self.columns[v];
            if self.thresholds[v].is_ordinal() {
                if let Some(code) = table.int_element(row, col) {
                    ord.push(v);
                    codes.push(code);
                }
            } else if !table.is_missing(row, col) {
                cont.push(v);
            }
        }

        let mut ll = 0.0;
        let mut l_c = Array2::zeros((0, 0));
        let mut z = Array1::zeros(0);
        if !cont.is_empty() {
            l_c = lower_cholesky(&SubsetView::square(m.cov.view(), &cont).to_owned())
                .ok_or(FitError::NotPositiveDefinite { row })?;
            let mu = VectorSubset::new(m.means.view(), &cont);
            let residual: Array1<f64> = cont
                .iter()
                .enumerate()
                .map(|(i, &v)| table.double_element(row, self.columns[v]) - mu.get(i))
                .collect();
            let (ll_c, whitened) = log_density_from_cholesky(&l_c, residual.view())
                .ok_or(FitError::NotPositiveDefinite { row })?;
            ll = ll_c;
            z = whitened;
        }
        if ord.is_empty() {
            return Ok(ll);
        }

        let mut cond_cov = SubsetView::square(m.cov.view(), &ord).to_owned();
        let mut cond_mean = VectorSubset::new(m.means.view(), &ord).to_owned();
        if !cont.is_empty() {
            let cross = SubsetView::block(m.cov.view(), &cont, &ord).to_owned();
            let y = solve_lower_matrix(&l_c, &cross)
                .ok_or(FitError::NotPositiveDefinite { row })?;
            cond_cov = cond_cov - y.t().dot(&y);
            cond_mean = cond_mean + y.t().dot(&z);
        }

        let (sd, corr) = standardize(&cond_cov);
        if sd.iter().any(|&s| not_positive(s)) {
            return Err(FitError::NotPositiveDefinite { row });
        }
        let mut lower = Vec::with_capacity(ord.len());
        let mut upper = Vec::with_capacity(ord.len());
        for (k, (&v, &code)) in ord.iter().zip(&codes).enumerate() {
            let (lo, hi) = self.category_bounds(m, table, row, v, code)?;
            lower.push((lo - cond_mean[k]) / sd[k]);
            upper.push((hi - cond_mean[k]) / sd[k]);
        }
        Ok(ll + self.integrate(row, &corr, &lower, &upper)?.ln())
    }

    /// Raw threshold interval of category `code` of model variable `v`.
    fn category_bounds(
        &self,
        m: &Moments,
        table: &DataTable,
        row: usize,
        v: usize,
        code: u32,
    ) -> Result<(f64, f64), FitError> {
        let t = m.thresholds[v].as_ref().ok_or_else(|| {
            FitError::InvalidConfig(format!("model variable {v} has no thresholds"))
        })?;
        let c = code as usize;
        if c > t.len() {
            return Err(FitError::CategoryOutOfRange {
                column: table.column_name(self.columns[v]).to_string(),
                row,
                category: code,
                thresholds: t.len(),
            });
        }
        let lower = if c == 0 { f64::NEG_INFINITY } else { t[c - 1] };
        let upper = if c == t.len() { f64::INFINITY } else { t[c] };
        Ok((lower, upper))
    }

    fn integrate(
        &self,
        row: usize,
        corr: &Array2<f64>,
        lower: &[f64],
        upper: &[f64],
    ) -> Result<f64, FitError> {
        self.integrator
            .probability(corr.view(), ArrayView1::from(lower), ArrayView1::from(upper))
            .map_err(|err| match err {
                IntegrationError::NotPositiveDefinite => FitError::NotPositiveDefinite { row },
                other => FitError::Integration {
                    row,
                    reason: other.to_string(),
                },
            })
    }
}

/// The first `count` entries of the threshold column, checked to be
/// strictly increasing.
fn threshold_values(
    state: &mut OptimizationState,
    entity: EntityRef,
    column: &ThresholdColumn,
) -> Result<Array1<f64>, FitError> {
    state.recompute(entity)?;
    let name = state.store().name(entity)?.to_string();
    let values = state.values(entity)?;
    let (rows, cols) = values.dim();
    if column.column >= cols || column.count > rows {
        return Err(FitError::Shape {
            what: format!("threshold matrix '{name}'"),
            expected: format!(
                "at least {} rows and {} columns",
                column.count,
                column.column + 1
            ),
            found: format!("{rows}x{cols}"),
        });
    }
    let t: Vec<f64> = values
        .column(column.column)
        .iter()
        .take(column.count)
        .copied()
        .collect();
    for (pos, window) in t.windows(2).enumerate() {
        if window[1].partial_cmp(&window[0]) != Some(Ordering::Greater) {
            return Err(FitError::ThresholdsNotIncreasing {
                matrix: name,
                column: column.column,
                index: pos + 1,
            });
        }
    }
    Ok(Array1::from(t))
}
