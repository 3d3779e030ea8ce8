//! Decision-forest training and inference: impurity measures, split
//! search, per-node deciders, leaf builders, the tree growth loop, the
//! per-tree thread pool, and the forest that ties them together.

pub mod decider;
pub mod forest;
pub mod impurity;
pub mod leaf;
pub mod pool;
pub mod provider;
pub mod threshold;
pub mod tree;

pub use decider::*;
pub use forest::*;
pub use impurity::*;
pub use leaf::*;
pub use pool::*;
pub use provider::*;
pub use threshold::*;
pub use tree::*;
