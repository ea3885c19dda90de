//! Index-based views over model moments restricted to the variables observed
//! in a data row. A view borrows the full matrix and an index list; it never
//! owns a second copy until `to_owned` is called.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Rows `row_index` by columns `col_index` of a borrowed matrix.
#[derive(Debug, Clone, Copy)]
pub struct SubsetView<'a> {
    base: ArrayView2<'a, f64>,
    row_index: &'a [usize],
    col_index: &'a [usize],
}

impl<'a> SubsetView<'a> {
    /// The principal submatrix on `index`.
    pub fn square(base: ArrayView2<'a, f64>, index: &'a [usize]) -> Self {
        Self::block(base, index, index)
    }

    pub fn block(base: ArrayView2<'a, f64>, row_index: &'a [usize], col_index: &'a [usize]) -> Self {
        Self {
            base,
            row_index,
            col_index,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.row_index.len(), self.col_index.len())
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.base[(self.row_index[i], self.col_index[j])]
    }

    /// True when the view covers the whole base matrix in order.
    pub fn is_full(&self) -> bool {
        let (rows, cols) = self.base.dim();
        self.row_index.len() == rows
            && self.col_index.len() == cols
            && self.row_index.iter().enumerate().all(|(i, &r)| i == r)
            && self.col_index.iter().enumerate().all(|(j, &c)| j == c)
    }

    pub fn to_owned(&self) -> Array2<f64> {
        Array2::from_shape_fn(self.dim(), |(i, j)| self.get(i, j))
    }
}

/// Entries `index` of a borrowed vector.
#[derive(Debug, Clone, Copy)]
pub struct VectorSubset<'a> {
    base: ArrayView1<'a, f64>,
    index: &'a [usize],
}

impl<'a> VectorSubset<'a> {
    pub fn new(base: ArrayView1<'a, f64>, index: &'a [usize]) -> Self {
        Self { base, index }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> f64 {
        self.base[self.index[i]]
    }

    pub fn to_owned(&self) -> Array1<f64> {
        Array1::from_shape_fn(self.len(), |i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn square_subset_selects_observed_variables() {
        let cov = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let observed = [0, 2];
        let view = SubsetView::square(cov.view(), &observed);
        assert_eq!(view.dim(), (2, 2));
        assert!(!view.is_full());
        assert_eq!(view.to_owned(), array![[4.0, 0.5], [0.5, 2.0]]);

        let all = [0, 1, 2];
        assert!(SubsetView::square(cov.view(), &all).is_full());
    }

    #[test]
    fn block_subset_reads_cross_covariances() {
        let cov = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let rows = [1];
        let cols = [0, 2];
        let view = SubsetView::block(cov.view(), &rows, &cols);
        assert_eq!(view.to_owned(), array![[1.0, 0.2]]);

        let means = array![1.0, 2.0, 3.0];
        let idx = [2, 0];
        assert_eq!(VectorSubset::new(means.view(), &idx).to_owned(), array![3.0, 1.0]);
    }
}
