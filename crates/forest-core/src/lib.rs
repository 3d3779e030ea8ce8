//! Numeric primitives shared by the decision-forest crates: the `Float`
//! element-type trait, a small row-major `Tensor` used at API boundaries,
//! and the domain error type.

pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;

pub use dtype::Float;
pub use error::{ForestError, ForestResult};
pub use shape::Shape;
pub use tensor::Tensor;
