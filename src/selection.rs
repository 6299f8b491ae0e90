//! Row-selection operators `C(S)`.

use nalgebra::DMatrix;

use crate::{PlacementError, Result};

/// The `|S| × n` operator whose rows are the standard basis vectors `e_i`,
/// `i ∈ S`, in ascending order.
///
/// Only the sorted index list is stored; the dense matrix is built on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SelectionMatrix {
    indices: Vec<usize>,
    n: usize,
}

impl SelectionMatrix {
    /// Build `C(S)` for `indices ⊆ {0, …, n-1}`.
    ///
    /// Order and duplicates in `indices` are irrelevant.
    pub fn new<I>(indices: I, n: usize) -> Result<Self>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut indices: Vec<usize> = indices.into_iter().collect();
        if let Some(&index) = indices.iter().find(|&&i| i >= n) {
            return Err(PlacementError::IndexOutOfRange { index, n });
        }
        indices.sort_unstable();
        indices.dedup();
        Ok(Self { indices, n })
    }

    /// Selection of every candidate location (`C = I_n`).
    pub fn full(n: usize) -> Self {
        Self {
            indices: (0..n).collect(),
            n,
        }
    }

    /// Selected indices, ascending.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of candidate locations `n`.
    pub fn candidates(&self) -> usize {
        self.n
    }

    /// Number of selected locations `|S|`.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether no location is selected.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Whether location `index` is in `S`.
    pub fn contains(&self, index: usize) -> bool {
        self.indices.binary_search(&index).is_ok()
    }

    /// Indices not in `S`, ascending.
    pub fn complement(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.n - self.indices.len());
        let mut selected = self.indices.iter().peekable();
        for i in 0..self.n {
            if selected.peek() == Some(&&i) {
                selected.next();
            } else {
                out.push(i);
            }
        }
        out
    }

    /// 0/1 indicator of length `n`.
    pub fn indicator(&self) -> Vec<f64> {
        let mut h = vec![0.0; self.n];
        for &i in &self.indices {
            h[i] = 1.0;
        }
        h
    }

    /// The dense `|S| × n` matrix.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        let mut c = DMatrix::zeros(self.indices.len(), self.n);
        for (row, &i) in self.indices.iter().enumerate() {
            c[(row, i)] = 1.0;
        }
        c
    }

    /// `C(S) · a` for an `n`-row matrix, without materializing `C(S)`.
    pub fn select_rows(&self, a: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if a.nrows() != self.n {
            return Err(PlacementError::config(
                "matrix",
                format!("{} rows, selection expects {}", a.nrows(), self.n),
            ));
        }
        Ok(a.select_rows(self.indices.iter()))
    }
}
