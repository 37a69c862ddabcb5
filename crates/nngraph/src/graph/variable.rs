//! Module-owned persistent tensors shared across functions.

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;
use crate::types::TypeHandle;

/// Index of a Variable inside its Module's slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarId(pub(crate) u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Classifies whether a Variable is externally observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    /// Model inputs/outputs; visible to the embedding application.
    Public,
    /// Internal learnable or derived state.
    Private,
}

/// Initialization policy applied to a Variable's payload at creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrainKind {
    /// Leave the payload as allocated (zeros).
    None,
    /// Fan-in-scaled uniform initialization.
    Xavier { fan_in: f32 },
    /// Fill the payload with one constant.
    Broadcast { value: f32 },
}

/// A persistent tensor owned by a Module and referenced, never duplicated,
/// by the node graphs of its functions.
#[derive(Debug)]
pub struct Variable {
    name: String,
    ty: TypeHandle,
    visibility: Visibility,
    train: TrainKind,
    payload: Tensor,
}

impl Variable {
    pub(crate) fn new(
        name: String,
        ty: TypeHandle,
        visibility: Visibility,
        train: TrainKind,
        payload: Tensor,
    ) -> Self {
        Variable {
            name,
            ty,
            visibility,
            train,
            payload,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the variable. Callers own module-wide name uniqueness; the
    /// verifier is the backstop for collisions.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn train_kind(&self) -> TrainKind {
        self.train
    }

    pub fn payload(&self) -> &Tensor {
        &self.payload
    }

    /// Payload mutation is visible to every Function referencing this
    /// Variable; there is no copy-on-write.
    pub fn payload_mut(&mut self) -> &mut Tensor {
        &mut self.payload
    }
}
