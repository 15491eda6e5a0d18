//! TRACERY execution tree.
//!
//! Traces are partitioned into a tree of nodes, each owning one contiguous
//! slice of a flat trace; concatenating the slices along a root-to-node path
//! reproduces the flat trace a from-scratch replay of that node would
//! observe. Nodes persist as flat key-value attributes and the parent/child
//! index is derived from the `parent_id` attribute alone.

#![warn(clippy::all)]

pub mod builder;
pub mod node;
pub mod repo;
pub mod store;

pub use builder::TreeBuilder;
pub use node::{Node, ATTRIBUTES};
pub use repo::NodeRepository;
pub use store::{KvStore, MemoryKv, RedbKv};
