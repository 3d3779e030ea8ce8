use crate::dtype::Float;
use crate::error::ForestError;
use crate::shape::Shape;

use serde::{Deserialize, Serialize};
use std::fmt;

/// A row-major (C-order) N-dimensional array.
///
/// This is the boundary type: `Forest::fit`/`Forest::predict` accept and
/// return `Tensor`s per the array conventions in the spec. Internally the
/// tree crate repacks `X` into a column-major, feature-contiguous layout
/// (see `forest_tree::provider`) — `Tensor` itself stays a plain flat
/// buffer plus shape, the same shape `oxidize-ml-core::Tensor` takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct Tensor<T: Float> {
    data: Vec<T>,
    shape: Shape,
}

impl<T: Float> Tensor<T> {
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> Result<Self, ForestError> {
        let s = Shape::new(shape);
        if data.len() != s.numel() {
            return Err(ForestError::Shape(format!(
                "expected {} elements for shape {s}, got {}",
                s.numel(),
                data.len()
            )));
        }
        Ok(Tensor { data, shape: s })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let s = Shape::new(shape);
        Tensor { data: vec![T::ZERO; s.numel()], shape: s }
    }

    pub fn full(shape: Vec<usize>, value: T) -> Self {
        let s = Shape::new(shape);
        Tensor { data: vec![value; s.numel()], shape: s }
    }

    /// 1-D tensor from a slice.
    pub fn from_slice(data: &[T]) -> Self {
        Tensor { data: data.to_vec(), shape: Shape::new(vec![data.len()]) }
    }

    /// 2-D tensor from row-major nested rows.
    pub fn from_vec2d(data: &[Vec<T>]) -> Result<Self, ForestError> {
        if data.is_empty() {
            return Ok(Tensor { data: vec![], shape: Shape::new(vec![0, 0]) });
        }
        let rows = data.len();
        let cols = data[0].len();
        for row in data {
            if row.len() != cols {
                return Err(ForestError::Shape(
                    "all rows must have the same number of columns".into(),
                ));
            }
        }
        let flat: Vec<T> = data.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::new(flat, vec![rows, cols])
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.shape.to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Multi-dimensional indexing: compute flat offset from indices.
    pub fn get(&self, indices: &[usize]) -> Result<T, ForestError> {
        Ok(self.data[self.offset(indices)?])
    }

    pub fn set(&mut self, indices: &[usize], value: T) -> Result<(), ForestError> {
        let offset = self.offset(indices)?;
        self.data[offset] = value;
        Ok(())
    }

    fn offset(&self, indices: &[usize]) -> Result<usize, ForestError> {
        let strides = self.shape.strides();
        if indices.len() != self.ndim() {
            return Err(ForestError::Shape(format!(
                "expected {} indices, got {}",
                self.ndim(),
                indices.len()
            )));
        }
        let mut offset = 0;
        for (i, &idx) in indices.iter().enumerate() {
            let dim_size = self.shape.dim(i)?;
            if idx >= dim_size {
                return Err(ForestError::Shape(format!(
                    "index {idx} out of bounds for axis {i} with size {dim_size}"
                )));
            }
            offset += idx * strides[i];
        }
        Ok(offset)
    }

    /// Extract a row from a 2D tensor.
    pub fn row(&self, i: usize) -> Result<Tensor<T>, ForestError> {
        if self.ndim() != 2 {
            return Err(ForestError::Shape("row() requires a 2D tensor".into()));
        }
        let cols = self.shape.dim(1)?;
        let start = i * cols;
        let end = start + cols;
        if end > self.data.len() {
            return Err(ForestError::Shape(format!("row index {i} out of bounds")));
        }
        Ok(Tensor { data: self.data[start..end].to_vec(), shape: Shape::new(vec![cols]) })
    }
}

impl<T: Float> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor{}{:?}", self.shape, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_and_index() {
        let t: Tensor<f64> = Tensor::from_vec2d(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(t.get(&[1, 0]).unwrap(), 3.0);
        assert_eq!(t.row(0).unwrap().data(), &[1.0, 2.0]);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let err = Tensor::new(vec![1.0f64, 2.0, 3.0], vec![2, 2]);
        assert!(err.is_err());
    }
}
