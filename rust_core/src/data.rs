use crate::error::{Error, Result};

/// Declared type of a data column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Real-valued.
    Continuous,
    /// Integer-coded categories in `0..cardinality`.
    Discrete { cardinality: usize },
}

impl ColumnType {
    pub fn is_discrete(&self) -> bool {
        matches!(self, ColumnType::Discrete { .. })
    }
}

/// A two-dimensional table of numeric values, row-major, with one type tag
/// per column. Immutable once constructed; fitting routines only ever read
/// it for the duration of a single call.
#[derive(Debug, Clone)]
pub struct DataMatrix {
    values: Vec<f64>,
    n_rows: usize,
    n_cols: usize,
    column_types: Vec<ColumnType>,
}

impl DataMatrix {
    /// Build a matrix from a flat row-major buffer, validating shape,
    /// finiteness, and discrete-column coding up front so no invalid
    /// numeric state can reach a fitting routine.
    pub fn new(
        values: Vec<f64>,
        n_rows: usize,
        n_cols: usize,
        column_types: Vec<ColumnType>,
    ) -> Result<Self> {
        if values.len() != n_rows * n_cols {
            return Err(Error::ShapeMismatch(format!(
                "buffer holds {} values, expected {} ({} rows x {} cols)",
                values.len(),
                n_rows * n_cols,
                n_rows,
                n_cols
            )));
        }
        if column_types.len() != n_cols {
            return Err(Error::ShapeMismatch(format!(
                "{} column types for {} columns",
                column_types.len(),
                n_cols
            )));
        }

        for (i, v) in values.iter().enumerate() {
            if !v.is_finite() {
                return Err(Error::InvalidParameter(format!(
                    "non-finite value at row {}, column {}",
                    i / n_cols,
                    i % n_cols
                )));
            }
        }

        for (c, ty) in column_types.iter().enumerate() {
            if let ColumnType::Discrete { cardinality } = ty {
                if *cardinality == 0 {
                    return Err(Error::InvalidParameter(format!(
                        "column {} declared discrete with cardinality 0",
                        c
                    )));
                }
                for r in 0..n_rows {
                    let v = values[r * n_cols + c];
                    if v < 0.0 || v.fract() != 0.0 || v >= *cardinality as f64 {
                        return Err(Error::InvalidParameter(format!(
                            "column {} is discrete with cardinality {}, but row {} holds {}",
                            c, cardinality, r, v
                        )));
                    }
                }
            }
        }

        Ok(Self {
            values,
            n_rows,
            n_cols,
            column_types,
        })
    }

    /// All-continuous convenience constructor.
    pub fn continuous(values: Vec<f64>, n_rows: usize, n_cols: usize) -> Result<Self> {
        Self::new(values, n_rows, n_cols, vec![ColumnType::Continuous; n_cols])
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.n_cols..(row + 1) * self.n_cols]
    }

    /// Copy out a single column.
    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.n_rows).map(|r| self.get(r, col)).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks(self.n_cols.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_access() {
        let m = DataMatrix::continuous(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        assert_eq!(m.get(0, 2), 3.0);
        assert_eq!(m.get(1, 0), 4.0);
        assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(m.column(1), vec![2.0, 5.0]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let err = DataMatrix::continuous(vec![1.0, 2.0, 3.0], 2, 2).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_non_finite_rejected() {
        let err = DataMatrix::continuous(vec![1.0, f64::NAN], 1, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_discrete_coding_validated() {
        let types = vec![ColumnType::Discrete { cardinality: 3 }];
        assert!(DataMatrix::new(vec![0.0, 2.0, 1.0], 3, 1, types.clone()).is_ok());

        let err = DataMatrix::new(vec![0.0, 3.0], 2, 1, types.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        let err = DataMatrix::new(vec![0.5], 1, 1, types.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        let err = DataMatrix::new(vec![-1.0], 1, 1, types).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }
}
