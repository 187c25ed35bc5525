//! The category tree and the leaf-path mask derived from it.

pub mod mask;
pub mod tree;

pub use mask::{MaskBuilder, MaskMatrix, PathWeighting};
pub use tree::{CategoryNode, Edge, NodeId, Tree};
