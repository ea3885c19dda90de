//! # Fit Context
//!
//! Per-iteration sink for derivative information. Fit functions add their
//! gradient contributions into [`FitContext::grad`], accumulate meat-type
//! information into an upper-triangular accumulator, and queue
//! [`HessianBlock`]s. The context sums overlapping blocks only when the
//! optimizer asks for the dense information matrix.

use crate::export::ResultEntry;
use crate::state::{FitError, FreeVarGroup, OptimizationState};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use std::sync::Arc;

/// Set of computations requested from a fit function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Want(u32);

impl Want {
    pub const NONE: Want = Want(0);
    pub const FIT: Want = Want(1);
    pub const INITIAL_FIT: Want = Want(1 << 1);
    pub const PREOPTIMIZE: Want = Want(1 << 2);
    pub const GRADIENT: Want = Want(1 << 3);
    pub const HESSIAN: Want = Want(1 << 4);
    pub const IHESSIAN: Want = Want(1 << 5);
    pub const INFO: Want = Want(1 << 6);

    /// True if any bit of `other` is requested.
    #[inline]
    pub fn contains(self, other: Want) -> bool {
        self.0 & other.0 != 0
    }

    /// True when the scalar fit value must be produced.
    #[inline]
    pub fn wants_fit(self) -> bool {
        self.contains(Want::FIT | Want::INITIAL_FIT | Want::PREOPTIMIZE)
    }
}

impl BitOr for Want {
    type Output = Want;

    fn bitor(self, rhs: Want) -> Want {
        Want(self.0 | rhs.0)
    }
}

/// How the information matrix is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoMethod {
    #[default]
    Hessian,
    Meat,
}

impl fmt::Display for InfoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InfoMethod::Hessian => "hessian",
            InfoMethod::Meat => "meat",
        })
    }
}

impl FromStr for InfoMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hessian" => Ok(InfoMethod::Hessian),
            "meat" => Ok(InfoMethod::Meat),
            other => Err(format!("unknown information method '{other}'")),
        }
    }
}

/// Second-derivative contribution over a subset of free parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct HessianBlock {
    /// Global free-parameter indices, in block order.
    pub vars: Vec<usize>,
    /// Symmetric `vars.len()` square matrix.
    pub mat: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct FitContext {
    var_group: Arc<FreeVarGroup>,
    info_method: InfoMethod,
    pub grad: Array1<f64>,
    info_b: Array2<f64>,
    blocks: Vec<HessianBlock>,
}

impl FitContext {
    pub fn new(var_group: Arc<FreeVarGroup>, info_method: InfoMethod) -> Self {
        let p = var_group.len();
        Self {
            var_group,
            info_method,
            grad: Array1::zeros(p),
            info_b: Array2::zeros((p, p)),
            blocks: Vec::new(),
        }
    }

    /// A context over the state's current free-variable group.
    pub fn for_state(state: &OptimizationState, info_method: InfoMethod) -> Self {
        Self::new(Arc::clone(state.free_vars()), info_method)
    }

    pub fn var_group(&self) -> &Arc<FreeVarGroup> {
        &self.var_group
    }

    pub fn info_method(&self) -> InfoMethod {
        self.info_method
    }

    pub fn num_params(&self) -> usize {
        self.var_group.len()
    }

    pub fn queue(&mut self, block: HessianBlock) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[HessianBlock] {
        &self.blocks
    }

    /// Adds `weight * v v'` into the upper triangle of the meat accumulator.
    pub fn add_sym_outer_product(&mut self, weight: f64, v: &Array1<f64>) {
        let p = v.len().min(self.num_params());
        for d1 in 0..p {
            for d2 in 0..=d1 {
                self.info_b[(d2, d1)] += weight * v[d1] * v[d2];
            }
        }
    }

    /// Raw meat accumulator. Only the upper triangle is populated.
    pub fn meat(&self) -> &Array2<f64> {
        &self.info_b
    }

    /// The meat accumulator with its upper triangle mirrored to the lower.
    pub fn meat_information(&self) -> Array2<f64> {
        let mut full = self.info_b.clone();
        let p = full.nrows();
        for c in 0..p {
            for r in 0..c {
                full[(c, r)] = full[(r, c)];
            }
        }
        full
    }

    /// Sums every queued block into a dense symmetric matrix. Overlapping
    /// blocks add.
    pub fn assemble_information(&self) -> Array2<f64> {
        let p = self.num_params();
        let mut info = Array2::zeros((p, p));
        for block in &self.blocks {
            for (i, &vi) in block.vars.iter().enumerate() {
                for (j, &vj) in block.vars.iter().enumerate() {
                    info[(vi, vj)] += block.mat[(i, j)];
                }
            }
        }
        info
    }

    /// Zeroes the gradient and meat accumulator and drops queued blocks.
    pub fn clear(&mut self) {
        self.grad.fill(0.0);
        self.info_b.fill(0.0);
        self.blocks.clear();
    }
}

/// A fit function evaluated once per optimizer iteration.
pub trait FitFunction {
    fn name(&self) -> &str;

    /// Performs the requested computations. Errors abort the evaluation.
    fn compute(
        &mut self,
        state: &mut OptimizationState,
        want: Want,
        fc: &mut FitContext,
    ) -> Result<(), FitError>;

    /// Scalar fit value from the last successful computation.
    fn fit_value(&self) -> f64;

    /// Labeled results reported to the host once fitting is done.
    fn final_results(&self) -> Vec<ResultEntry> {
        vec![ResultEntry::scalar("fit", self.fit_value())]
    }

    /// Extra labeled quantities attached to the fit function's exported value.
    fn attributes(&self) -> Vec<ResultEntry> {
        Vec::new()
    }

    /// Runs [`FitFunction::compute`] and records any error into the state's
    /// status. Returns whether the evaluation produced a usable result.
    fn evaluate(&mut self, state: &mut OptimizationState, want: Want, fc: &mut FitContext) -> bool {
        match self.compute(state, want, fc) {
            Ok(()) => !state.status().is_error(),
            Err(err) => {
                state.record_error(&err);
                false
            }
        }
    }
}
