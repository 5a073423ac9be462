//! Fixed-shape dense matrix backed by one contiguous row-major buffer.
//!
//! Biases are stored as `1 × n` matrices so every parameter tensor shares
//! one type, one optimizer and one gradient layout.

use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Matrix { rows, cols, data: vec![0.0; rows * cols] }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Matrix { rows, cols, data }
    }

    /// Build from a row-major buffer. Panics when the length does not match.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols, "buffer length does not match {rows}x{cols}");
        Matrix { rows, cols, data }
    }

    pub fn zeros_like(other: &Matrix) -> Self {
        Matrix::zeros(other.rows, other.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// `x (1×rows) @ self (rows×cols) + bias (1×cols)`.
    pub fn affine(&self, x: &[f64], bias: &Matrix) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.rows);
        debug_assert_eq!(bias.shape(), (1, self.cols));
        let mut out = bias.data.clone();
        for (i, &xi) in x.iter().enumerate() {
            for (o, &w) in out.iter_mut().zip(self.row(i)) {
                *o += xi * w;
            }
        }
        out
    }

    /// `self (rows×cols) @ delta (cols)`, i.e. propagation through Wᵀ.
    pub fn mul_transposed(&self, delta: &[f64]) -> Vec<f64> {
        debug_assert_eq!(delta.len(), self.cols);
        (0..self.rows)
            .map(|i| self.row(i).iter().zip(delta).map(|(w, d)| w * d).sum())
            .collect()
    }

    /// `self += outer(a, b)`.
    pub fn add_outer(&mut self, a: &[f64], b: &[f64]) {
        debug_assert_eq!((a.len(), b.len()), self.shape());
        for (i, &ai) in a.iter().enumerate() {
            let row = &mut self.data[i * self.cols..(i + 1) * self.cols];
            for (g, &bj) in row.iter_mut().zip(b) {
                *g += ai * bj;
            }
        }
    }

    /// Elementwise `self += other`, treating both as flat buffers.
    pub fn add_assign_slice(&mut self, other: &[f64]) {
        assert_eq!(self.data.len(), other.len(), "slice length mismatch");
        for (s, o) in self.data.iter_mut().zip(other) {
            *s += o;
        }
    }

    pub fn scale(&mut self, k: f64) {
        for v in &mut self.data {
            *v *= k;
        }
    }

    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    pub fn mean_abs(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|v| v.abs()).sum::<f64>() / self.data.len() as f64
    }

    pub fn to_nested(&self) -> Vec<Vec<f64>> {
        (0..self.rows).map(|r| self.row(r).to_vec()).collect()
    }

    /// Inverse of [`Matrix::to_nested`]. Rejects ragged input.
    pub fn from_nested(rows: &[Vec<f64>]) -> anyhow::Result<Self> {
        let cols = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            anyhow::ensure!(row.len() == cols, "row {i} has {} columns, expected {cols}", row.len());
            data.extend_from_slice(row);
        }
        Ok(Matrix { rows: rows.len(), cols, data })
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        debug_assert!(r < self.rows && c < self.cols);
        &self.data[r * self.cols + c]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        debug_assert!(r < self.rows && c < self.cols);
        &mut self.data[r * self.cols + c]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_matches_manual() {
        // 2 inputs → 3 outputs
        let w = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = Matrix::from_vec(1, 3, vec![0.5, 0.0, -0.5]);
        let out = w.affine(&[1.0, -1.0], &b);
        assert_eq!(out, vec![1.0 - 4.0 + 0.5, 2.0 - 5.0, 3.0 - 6.0 - 0.5]);
    }

    #[test]
    fn test_mul_transposed() {
        let w = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(w.mul_transposed(&[1.0, 0.0, 1.0]), vec![4.0, 10.0]);
    }

    #[test]
    fn test_add_outer_and_index() {
        let mut g = Matrix::zeros(2, 2);
        g.add_outer(&[1.0, 2.0], &[3.0, 4.0]);
        assert_eq!(g[(1, 0)], 6.0);
        assert_eq!(g[(0, 1)], 4.0);
    }

    #[test]
    fn test_nested_rejects_ragged() {
        assert!(Matrix::from_nested(&[vec![1.0, 2.0], vec![3.0]]).is_err());
        let m = Matrix::from_nested(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.to_nested(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }
}
