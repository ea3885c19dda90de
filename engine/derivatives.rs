//! # Algebra Fit Function and Derivative Mapping
//!
//! A fit function whose value is element `[0,0]` of an algebra, optionally
//! accompanied by gradient and Hessian algebras. Those derivative algebras
//! are indexed by their own row/column names; the mapper resolves each name
//! against the active free-variable group once per group and caches the
//! result, then scatters derivative values into the [`FitContext`] on every
//! evaluation.
//!
//! Hessian algebras whose top-level operation is `vec2diag` are treated as
//! diagonal-only: one 1x1 block is queued per mapped parameter instead of a
//! single dense block.

use crate::context::{FitContext, FitFunction, HessianBlock, InfoMethod, Want};
use crate::export::ResultEntry;
use crate::matrix::EntityRef;
use crate::state::{FitError, FreeVarGroup, OptimizationState};
use ndarray::{Array1, Array2};

pub struct AlgebraFitFunction {
    name: String,
    algebra: Option<EntityRef>,
    gradient: Option<EntityRef>,
    hessian: Option<EntityRef>,
    verbose: bool,
    var_group: Option<u32>,
    grad_map: Vec<Option<usize>>,
    num_deriv: usize,
    vec2diag: bool,
    fit: f64,
}

impl AlgebraFitFunction {
    pub fn new(name: impl Into<String>, algebra: Option<EntityRef>) -> Self {
        Self {
            name: name.into(),
            algebra,
            gradient: None,
            hessian: None,
            verbose: false,
            var_group: None,
            grad_map: Vec::new(),
            num_deriv: 0,
            vec2diag: false,
            fit: f64::NAN,
        }
    }

    pub fn with_gradient(mut self, gradient: EntityRef) -> Self {
        self.gradient = Some(gradient);
        self
    }

    pub fn with_hessian(mut self, hessian: EntityRef) -> Self {
        self.hessian = Some(hessian);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Global free-parameter index for each derivative name, `None` when the
    /// name is not a free parameter.
    pub fn grad_map(&self) -> &[Option<usize>] {
        &self.grad_map
    }

    /// Number of mapped derivative entries.
    pub fn num_deriv(&self) -> usize {
        self.num_deriv
    }

    pub fn is_diagonal_only(&self) -> bool {
        self.vec2diag
    }

    /// Validates the derivative algebras and resolves their names against
    /// `group`. Does nothing when the map was already built for `group`.
    pub fn rebuild_map(
        &mut self,
        state: &mut OptimizationState,
        group: &FreeVarGroup,
    ) -> Result<(), FitError> {
        if self.var_group == Some(group.id) {
            return Ok(());
        }
        if self.verbose {
            log::debug!(
                "{}: rebuild parameter map for var group {}",
                self.name,
                group.id
            );
        }
        self.num_deriv = 0;
        self.grad_map.clear();
        self.vec2diag = false;

        let mut gradient_names: Option<Vec<String>> = None;
        if let Some(gradient) = self.gradient {
            state.recompute(gradient)?;
            let store = state.store();
            let (rows, cols) = store.values(gradient)?.dim();
            let (row_names, col_names) = store.dimnames(gradient)?;
            if row_names.len().max(col_names.len()) != rows.max(cols) {
                return Err(FitError::MissingGradientNames {
                    fit: self.name.clone(),
                });
            }
            let names = if row_names.is_empty() { col_names } else { row_names };
            gradient_names = Some(names.to_vec());
        }

        let mut hessian_names: Option<Vec<String>> = None;
        if let Some(hessian) = self.hessian {
            state.recompute(hessian)?;
            let store = state.store();
            let (rows, cols) = store.values(hessian)?.dim();
            if rows != cols {
                return Err(FitError::HessianNotSquare {
                    fit: self.name.clone(),
                    rows,
                    cols,
                });
            }
            let (row_names, col_names) = store.dimnames(hessian)?;
            if row_names.len() != rows || col_names.len() != rows {
                return Err(FitError::MissingHessianNames {
                    fit: self.name.clone(),
                });
            }
            if let Some(hx) = (0..rows).find(|&hx| row_names[hx] != col_names[hx]) {
                return Err(FitError::HessianNameMismatch {
                    fit: self.name.clone(),
                    position: hx + 1,
                });
            }
            self.vec2diag = store.op_name(hessian)? == Some("vec2diag");

            if let (Some(gradient), Some(gnames)) = (self.gradient, gradient_names.as_ref()) {
                // Both the gradient's values and its names must line up with
                // the Hessian's rows.
                let size = store.values(gradient)?.len();
                for size in [size, gnames.len()] {
                    if rows != size {
                        return Err(FitError::DerivativesNonConformable {
                            fit: self.name.clone(),
                            size,
                            rows,
                            cols,
                        });
                    }
                }
                if let Some(hx) = (0..rows).find(|&hx| col_names[hx] != gnames[hx]) {
                    return Err(FitError::GradientHessianNameMismatch {
                        fit: self.name.clone(),
                        position: hx + 1,
                    });
                }
            }
            hessian_names = Some(row_names.to_vec());
        }

        let Some(names) = gradient_names.or(hessian_names) else {
            self.var_group = Some(group.id);
            return Ok(());
        };

        self.grad_map = names
            .iter()
            .map(|name| {
                let to = group.lookup(name);
                if self.verbose {
                    log::debug!(
                        "{}: name '{}' mapped to free parameter {:?}",
                        self.name,
                        name,
                        to
                    );
                }
                to
            })
            .collect();
        self.num_deriv = self.grad_map.iter().filter(|m| m.is_some()).count();
        self.var_group = Some(group.id);
        Ok(())
    }

    fn queue_standard_block(
        &self,
        state: &mut OptimizationState,
        hessian: EntityRef,
        fc: &mut FitContext,
    ) -> Result<(), FitError> {
        let mapped: Vec<(usize, usize)> = self
            .grad_map
            .iter()
            .enumerate()
            .filter_map(|(h, to)| to.map(|to| (h, to)))
            .collect();
        let n = mapped.len();
        let mut mat = Array2::zeros((n, n));
        let mut asymmetric = Vec::new();
        {
            let values = state.values(hessian)?;
            for (d1, &(h1, _)) in mapped.iter().enumerate() {
                for (d2, &(h2, _)) in mapped.iter().enumerate().take(d1 + 1) {
                    let value = if h1 == h2 {
                        values[(h2, h1)]
                    } else {
                        let upper = values[(h2, h1)];
                        let lower = values[(h1, h2)];
                        if upper != lower {
                            asymmetric.push((h2, h1));
                        }
                        lower
                    };
                    mat[(d2, d1)] = value;
                    mat[(d1, d2)] = value;
                }
            }
        }
        if !asymmetric.is_empty() {
            let hessian_name = state.store().name(hessian)?.to_string();
            for (r, c) in asymmetric {
                state.raise_warning(&format!(
                    "{}: Hessian algebra '{}' is not symmetric at [{},{}]",
                    self.name,
                    hessian_name,
                    r + 1,
                    c + 1
                ));
            }
        }
        fc.queue(HessianBlock {
            vars: mapped.iter().map(|&(_, to)| to).collect(),
            mat,
        });
        Ok(())
    }

    fn queue_diagonal_blocks(
        &self,
        state: &OptimizationState,
        hessian: EntityRef,
        fc: &mut FitContext,
    ) -> Result<(), FitError> {
        let values = state.values(hessian)?;
        for (h, to) in self.grad_map.iter().enumerate() {
            if let Some(to) = *to {
                fc.queue(HessianBlock {
                    vars: vec![to],
                    mat: Array2::from_elem((1, 1), values[(h, h)]),
                });
            }
        }
        Ok(())
    }
}

impl FitFunction for AlgebraFitFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(
        &mut self,
        state: &mut OptimizationState,
        want: Want,
        fc: &mut FitContext,
    ) -> Result<(), FitError> {
        let group = std::sync::Arc::clone(fc.var_group());
        self.rebuild_map(state, &group)?;

        if want.wants_fit() {
            self.fit = match self.algebra {
                Some(algebra) => {
                    state.recompute(algebra)?;
                    state.values(algebra)?.iter().next().copied().unwrap_or(f64::NAN)
                }
                None => 0.0,
            };
        }

        if self.grad_map.is_empty() {
            return Ok(());
        }

        if let Some(gradient) = self.gradient {
            state.recompute(gradient)?;
            let values: Vec<f64> = state.values(gradient)?.iter().copied().collect();
            if want.contains(Want::GRADIENT) {
                for (v, to) in self.grad_map.iter().enumerate() {
                    if let Some(to) = *to {
                        fc.grad[to] += values[v];
                    }
                }
            }
            if want.contains(Want::INFO) && fc.info_method() == InfoMethod::Meat {
                let mut dense = Array1::zeros(group.len());
                for (v, to) in self.grad_map.iter().enumerate() {
                    if let Some(to) = *to {
                        dense[to] += values[v];
                    }
                }
                fc.add_sym_outer_product(1.0, &dense);
            }
        }

        if let Some(hessian) = self.hessian {
            let wants_hessian = want.contains(Want::HESSIAN | Want::IHESSIAN)
                || (want.contains(Want::INFO) && fc.info_method() == InfoMethod::Hessian);
            if wants_hessian {
                state.recompute(hessian)?;
                if self.vec2diag {
                    self.queue_diagonal_blocks(state, hessian, fc)?;
                } else {
                    self.queue_standard_block(state, hessian, fc)?;
                }
            }
        }
        Ok(())
    }

    fn fit_value(&self) -> f64 {
        self.fit
    }

    fn final_results(&self) -> Vec<ResultEntry> {
        vec![ResultEntry::scalar("fit", self.fit)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Algebra, AlgebraExpr, Matrix, MatrixId};
    use crate::state::{CellLocation, FreeVariable};
    use ndarray::array;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// State with free parameters named `free`, all pointing at a scratch cell.
    fn state_with_free(free: &[&str]) -> OptimizationState {
        let mut state = OptimizationState::new();
        let scratch = state.add_matrix(Matrix::new("scratch", Array2::zeros((1, 1))));
        let vars = free
            .iter()
            .map(|name| {
                FreeVariable::new(
                    *name,
                    vec![CellLocation {
                        matrix: scratch,
                        row: 0,
                        col: 0,
                    }],
                )
            })
            .collect();
        state.set_free_var_group(FreeVarGroup::new(7, vars));
        state
    }

    fn named_matrix(state: &mut OptimizationState, name: &str, values: Array2<f64>, rn: &[&str], cn: &[&str]) -> MatrixId {
        state.add_matrix(
            Matrix::new(name, values)
                .with_dimnames(names(rn), names(cn))
                .unwrap(),
        )
    }

    #[test]
    fn gradient_names_map_to_free_parameters() {
        let mut state = state_with_free(&["a", "c"]);
        let g = named_matrix(&mut state, "g", array![[1.0], [2.0], [3.0]], &["a", "b", "c"], &[]);
        let mut fit = AlgebraFitFunction::new("fit", None).with_gradient(EntityRef::Matrix(g));
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);

        fit.compute(&mut state, Want::FIT | Want::GRADIENT, &mut fc).unwrap();
        assert_eq!(fit.grad_map(), &[Some(0), None, Some(1)]);
        assert_eq!(fit.num_deriv(), 2);
        assert_eq!(fit.fit_value(), 0.0);
        assert_eq!(fc.grad, array![1.0, 3.0]);

        fit.compute(&mut state, Want::GRADIENT, &mut fc).unwrap();
        assert_eq!(fc.grad, array![2.0, 6.0]);
    }

    #[test]
    fn fit_value_reads_the_first_algebra_element() {
        let mut state = state_with_free(&[]);
        let m = state.add_matrix(Matrix::new("m", array![[2.5, 1.0]]));
        let alg = state
            .add_algebra(Algebra::new("twice", AlgebraExpr::Scale(2.0, Box::new(AlgebraExpr::Matrix(m)))))
            .unwrap();
        let mut fit = AlgebraFitFunction::new("fit", Some(EntityRef::Algebra(alg)));
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);
        assert!(fit.evaluate(&mut state, Want::FIT, &mut fc));
        assert_eq!(fit.fit_value(), 5.0);
        assert_eq!(fit.final_results(), vec![ResultEntry::scalar("fit", 5.0)]);
    }

    fn hessian_fit(h10: f64) -> (OptimizationState, AlgebraFitFunction) {
        let mut state = state_with_free(&["x", "y"]);
        let h = named_matrix(&mut state, "H", array![[1.0, 3.0], [h10, 2.0]], &["x", "y"], &["x", "y"]);
        let fit = AlgebraFitFunction::new("fit", None).with_hessian(EntityRef::Matrix(h));
        (state, fit)
    }

    #[test]
    fn symmetric_hessian_queues_one_block_without_warning() {
        let (mut state, mut fit) = hessian_fit(3.0);
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);
        fit.compute(&mut state, Want::HESSIAN, &mut fc).unwrap();

        assert!(state.status().is_ok());
        assert_eq!(fc.blocks().len(), 1);
        assert_eq!(fc.blocks()[0].vars, vec![0, 1]);
        assert_eq!(fc.blocks()[0].mat, array![[1.0, 3.0], [3.0, 2.0]]);
    }

    #[test]
    fn asymmetric_hessian_warns_and_uses_lower_triangle() {
        let (mut state, mut fit) = hessian_fit(5.0);
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);
        assert!(fit.evaluate(&mut state, Want::INFO, &mut fc));

        assert!(state.status().is_warning());
        assert!(state.status().message.contains("not symmetric at [1,2]"));
        assert_eq!(fc.blocks()[0].mat[(0, 1)], 5.0);
        assert_eq!(fc.blocks()[0].mat[(1, 0)], 5.0);
    }

    #[test]
    fn vec2diag_hessian_queues_one_block_per_parameter() {
        let mut state = state_with_free(&["a", "b", "c"]);
        let d = named_matrix(&mut state, "d", array![[4.0], [5.0], [6.0]], &["a", "b", "c"], &[]);
        let diag = state
            .add_algebra(
                Algebra::new("H", AlgebraExpr::Vec2Diag(Box::new(AlgebraExpr::Matrix(d))))
                    .with_dimnames(names(&["a", "b", "c"]), names(&["a", "b", "c"])),
            )
            .unwrap();
        let dense = state
            .add_algebra(
                Algebra::new("Hfull", AlgebraExpr::Algebra(diag))
                    .with_dimnames(names(&["a", "b", "c"]), names(&["a", "b", "c"])),
            )
            .unwrap();

        let mut diagonal = AlgebraFitFunction::new("diag", None).with_hessian(EntityRef::Algebra(diag));
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);
        diagonal.compute(&mut state, Want::HESSIAN, &mut fc).unwrap();
        assert!(diagonal.is_diagonal_only());
        assert_eq!(fc.blocks().len(), 3);
        for (i, block) in fc.blocks().iter().enumerate() {
            assert_eq!(block.vars, vec![i]);
            assert_eq!(block.mat, array![[4.0 + i as f64]]);
        }

        let mut standard = AlgebraFitFunction::new("full", None).with_hessian(EntityRef::Algebra(dense));
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);
        standard.compute(&mut state, Want::HESSIAN, &mut fc).unwrap();
        assert!(!standard.is_diagonal_only());
        assert_eq!(fc.blocks().len(), 1);
        assert_eq!(fc.blocks()[0].mat.dim(), (3, 3));
        assert_eq!(fc.assemble_information().diag().to_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn meat_information_is_the_gradient_outer_product() {
        let mut state = state_with_free(&["a", "b"]);
        let g = named_matrix(&mut state, "g", array![[2.0, 3.0]], &[], &["b", "a"]);
        let mut fit = AlgebraFitFunction::new("fit", None).with_gradient(EntityRef::Matrix(g));
        let mut fc = FitContext::for_state(&state, InfoMethod::Meat);
        fit.compute(&mut state, Want::INFO, &mut fc).unwrap();
        assert_eq!(fc.meat(), &array![[9.0, 6.0], [0.0, 4.0]]);
        assert_eq!(fc.grad, array![0.0, 0.0]);
    }

    #[test]
    fn invalid_derivative_algebras_are_fatal() {
        let mut state = state_with_free(&["a"]);
        let unnamed = state.add_matrix(Matrix::new("g", array![[1.0], [2.0]]));
        let mut fit = AlgebraFitFunction::new("f", None).with_gradient(EntityRef::Matrix(unnamed));
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);
        assert!(!fit.evaluate(&mut state, Want::GRADIENT, &mut fc));
        assert!(state.status().is_error());
        assert_eq!(state.status().message, "f: gradient must have row or column names");

        let rect = named_matrix(&mut state, "h", Array2::zeros((2, 3)), &["a", "b"], &["a", "b", "c"]);
        let mut fit = AlgebraFitFunction::new("f", None).with_hessian(EntityRef::Matrix(rect));
        let err = fit.compute(&mut state, Want::HESSIAN, &mut fc).unwrap_err();
        assert!(matches!(err, FitError::HessianNotSquare { rows: 2, cols: 3, .. }));

        let swapped = named_matrix(&mut state, "h2", Array2::zeros((2, 2)), &["a", "b"], &["b", "a"]);
        let mut fit = AlgebraFitFunction::new("f", None).with_hessian(EntityRef::Matrix(swapped));
        let err = fit.compute(&mut state, Want::HESSIAN, &mut fc).unwrap_err();
        assert!(matches!(err, FitError::HessianNameMismatch { position: 1, .. }));

        let g = named_matrix(&mut state, "g2", array![[1.0], [2.0]], &["a", "b"], &[]);
        let h = named_matrix(&mut state, "h3", Array2::zeros((2, 2)), &["b", "a"], &["b", "a"]);
        let mut fit = AlgebraFitFunction::new("f", None)
            .with_gradient(EntityRef::Matrix(g))
            .with_hessian(EntityRef::Matrix(h));
        let err = fit.compute(&mut state, Want::HESSIAN, &mut fc).unwrap_err();
        assert!(matches!(err, FitError::GradientHessianNameMismatch { position: 1, .. }));

        let small = named_matrix(&mut state, "h4", Array2::zeros((1, 1)), &["a"], &["a"]);
        let mut fit = AlgebraFitFunction::new("f", None)
            .with_gradient(EntityRef::Matrix(g))
            .with_hessian(EntityRef::Matrix(small));
        let err = fit.compute(&mut state, Want::HESSIAN, &mut fc).unwrap_err();
        assert!(matches!(err, FitError::DerivativesNonConformable { size: 2, rows: 1, .. }));
    }

    #[test]
    fn gradient_names_must_cover_every_hessian_row() {
        let params = ["p0", "p1", "p2", "p3", "p4", "p5"];
        let mut state = state_with_free(&params);
        let g = named_matrix(&mut state, "g", Array2::ones((3, 2)), &["p0", "p1", "p2"], &[]);
        let h = named_matrix(&mut state, "h", Array2::eye(6), &params, &params);
        let mut fit = AlgebraFitFunction::new("f", None)
            .with_gradient(EntityRef::Matrix(g))
            .with_hessian(EntityRef::Matrix(h));
        let mut fc = FitContext::for_state(&state, InfoMethod::Hessian);

        let err = fit.compute(&mut state, Want::HESSIAN, &mut fc).unwrap_err();
        assert!(matches!(
            err,
            FitError::DerivativesNonConformable { size: 3, rows: 6, cols: 6, .. }
        ));
        assert!(fc.blocks().is_empty());
    }

    #[test]
    fn map_is_cached_per_var_group() {
        let mut state = state_with_free(&["a"]);
        let g = named_matrix(&mut state, "g", array![[1.0]], &["a"], &[]);
        let mut fit = AlgebraFitFunction::new("f", None).with_gradient(EntityRef::Matrix(g));
        let group = FreeVarGroup::new(1, vec![FreeVariable::new("a", Vec::new())]);
        fit.rebuild_map(&mut state, &group).unwrap();
        assert_eq!(fit.grad_map(), &[Some(0)]);

        let other = FreeVarGroup::new(1, vec![FreeVariable::new("z", Vec::new())]);
        fit.rebuild_map(&mut state, &other).unwrap();
        assert_eq!(fit.grad_map(), &[Some(0)]);

        let renumbered = FreeVarGroup::new(2, vec![FreeVariable::new("z", Vec::new())]);
        fit.rebuild_map(&mut state, &renumbered).unwrap();
        assert_eq!(fit.grad_map(), &[None]);
        assert_eq!(fit.num_deriv(), 0);
    }
}
