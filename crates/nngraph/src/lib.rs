//! In-memory operator-graph IR for a tensor compiler.
//!
//! A [`Module`] owns the uniqued tensor types, the persistent [`Variable`]s
//! shared across graphs, and a set of [`Function`]s, each holding an ordered
//! arena of operator [`Node`]s. Graphs are grown through a [`GraphBuilder`],
//! which performs shape/type inference per operator, allocates auxiliary
//! Variables where a layer needs them, and appends fully-typed nodes.
//! Structural invariants (unique names, no dangling edges, kind-local
//! well-formedness) are checked after the fact by the verifier.

pub mod graph;
pub mod tensor;
pub mod types;

pub use graph::builder::{GraphBuilder, TopKValues};
pub use graph::function::{Function, FunctionId};
pub use graph::module::Module;
pub use graph::node::{Node, NodeId, NodeKind, NodeValue, Origin};
pub use graph::variable::{TrainKind, VarId, Variable, Visibility};
pub use graph::verify::VerifyError;
pub use tensor::Tensor;
pub use types::{ElemKind, QuantParams, Type, TypeArena, TypeHandle};
