//! # Data Tables
//!
//! Column-oriented observed data. Numeric columns carry `f64` values with
//! `NaN` standing for "not available"; ordinal columns carry 0-based category
//! codes with `None` for missing. Accessors expose the column type so the fit
//! functions can tell continuous from thresholded variables.

use thiserror::Error;

/// Position of a data table in its state's data list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId(pub usize);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Column '{column}' has {found} rows but the table has {expected}.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("Column '{column}' row {row} holds category {code}, but the column has only {levels} levels.")]
    CodeOutOfRange {
        column: String,
        row: usize,
        code: u32,
        levels: usize,
    },

    #[error("Column '{0}' appears more than once.")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone)]
pub enum Column {
    Numeric(Vec<f64>),
    Ordinal { levels: usize, codes: Vec<Option<u32>> },
}

impl Column {
    fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Ordinal { codes, .. } => codes.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataTable {
    pub name: String,
    column_names: Vec<String>,
    columns: Vec<Column>,
    rows: Option<usize>,
}

impl DataTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_names: Vec::new(),
            columns: Vec::new(),
            rows: None,
        }
    }

    pub fn push_numeric(
        &mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<usize, DataError> {
        self.push(name.into(), Column::Numeric(values))
    }

    pub fn push_ordinal(
        &mut self,
        name: impl Into<String>,
        levels: usize,
        codes: Vec<Option<u32>>,
    ) -> Result<usize, DataError> {
        let name = name.into();
        if let Some((row, code)) = codes
            .iter()
            .enumerate()
            .find_map(|(row, c)| c.filter(|&c| c as usize >= levels).map(|c| (row, c)))
        {
            return Err(DataError::CodeOutOfRange {
                column: name,
                row,
                code,
                levels,
            });
        }
        self.push(name, Column::Ordinal { levels, codes })
    }

    fn push(&mut self, name: String, column: Column) -> Result<usize, DataError> {
        if self.column_names.contains(&name) {
            return Err(DataError::DuplicateColumn(name));
        }
        let len = column.len();
        match self.rows {
            Some(expected) if expected != len => {
                return Err(DataError::LengthMismatch {
                    column: name,
                    expected,
                    found: len,
                });
            }
            _ => self.rows = Some(len),
        }
        self.column_names.push(name);
        self.columns.push(column);
        Ok(self.columns.len() - 1)
    }

    pub fn rows(&self) -> usize {
        self.rows.unwrap_or(0)
    }

    pub fn cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }

    pub fn column_name(&self, col: usize) -> &str {
        self.column_names.get(col).map(String::as_str).unwrap_or("?")
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn is_factor(&self, col: usize) -> bool {
        matches!(self.columns.get(col), Some(Column::Ordinal { .. }))
    }

    /// Number of levels of an ordinal column, `None` for numeric columns.
    pub fn levels(&self, col: usize) -> Option<usize> {
        match self.columns.get(col) {
            Some(Column::Ordinal { levels, .. }) => Some(*levels),
            _ => None,
        }
    }

    /// Value as `f64`; category codes are converted, missing values are `NaN`.
    pub fn double_element(&self, row: usize, col: usize) -> f64 {
        match self.columns.get(col) {
            Some(Column::Numeric(values)) => values.get(row).copied().unwrap_or(f64::NAN),
            Some(Column::Ordinal { codes, .. }) => codes
                .get(row)
                .copied()
                .flatten()
                .map_or(f64::NAN, f64::from),
            None => f64::NAN,
        }
    }

    /// Category code of an ordinal cell; `None` when missing or numeric.
    pub fn int_element(&self, row: usize, col: usize) -> Option<u32> {
        match self.columns.get(col) {
            Some(Column::Ordinal { codes, .. }) => codes.get(row).copied().flatten(),
            _ => None,
        }
    }

    pub fn is_missing(&self, row: usize, col: usize) -> bool {
        self.double_element(row, col).is_nan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_columns_report_types_and_missingness() {
        let mut table = DataTable::new("obs");
        let x = table.push_numeric("x", vec![1.5, f64::NAN, 3.0]).unwrap();
        let y = table
            .push_ordinal("y", 3, vec![Some(0), Some(2), None])
            .unwrap();

        assert_eq!(table.rows(), 3);
        assert!(!table.is_factor(x));
        assert!(table.is_factor(y));
        assert_eq!(table.levels(y), Some(3));
        assert!(table.is_missing(1, x));
        assert!(table.is_missing(2, y));
        assert_eq!(table.double_element(1, y), 2.0);
        assert_eq!(table.int_element(0, y), Some(0));
        assert_eq!(table.int_element(0, x), None);
    }

    #[test]
    fn ragged_and_invalid_columns_are_rejected() {
        let mut table = DataTable::new("obs");
        table.push_numeric("x", vec![1.0, 2.0]).unwrap();

        let err = table.push_numeric("z", vec![1.0]).unwrap_err();
        assert!(matches!(err, DataError::LengthMismatch { expected: 2, found: 1, .. }));

        let err = table.push_ordinal("y", 2, vec![Some(0), Some(2)]).unwrap_err();
        assert!(matches!(err, DataError::CodeOutOfRange { row: 1, code: 2, .. }));

        let err = table.push_numeric("x", vec![0.0, 0.0]).unwrap_err();
        assert_eq!(err, DataError::DuplicateColumn("x".to_string()));
    }
}
