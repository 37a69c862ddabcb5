//! Tensor types and the arena that uniques them.
//!
//! Every distinct tensor type is stored exactly once in a [`TypeArena`]; the
//! rest of the crate passes around copyable [`TypeHandle`]s, so type equality
//! is handle equality everywhere outside this module.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Enumerates the scalar element kinds a tensor type can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemKind {
    /// 32-bit IEEE-754 float, the default compute kind.
    Float,
    /// 16-bit float for reduced-precision storage.
    Float16,
    /// 8-bit quantized integer; the owning type carries scale and offset.
    Int8Q,
    /// 32-bit quantized integer, used for quantized accumulators.
    Int32Q,
    /// Unsigned index kind produced by ops that select positions (e.g. TopK).
    Index,
}

impl ElemKind {
    /// Returns `true` for kinds whose types carry quantization parameters.
    pub fn is_quantized(self) -> bool {
        matches!(self, ElemKind::Int8Q | ElemKind::Int32Q)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            ElemKind::Float => 4,
            ElemKind::Float16 => 2,
            ElemKind::Int8Q => 1,
            ElemKind::Int32Q => 4,
            ElemKind::Index => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElemKind::Float => "float",
            ElemKind::Float16 => "float16",
            ElemKind::Int8Q => "i8q",
            ElemKind::Int32Q => "i32q",
            ElemKind::Index => "index",
        }
    }
}

/// Scale and zero-offset attached to quantized element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub offset: i32,
}

/// An immutable tensor type: element kind, dimensions, and (for quantized
/// kinds) the quantization parameters. Two types are equal iff all three
/// match exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    elem: ElemKind,
    dims: Vec<usize>,
    quant: Option<QuantParams>,
}

impl Type {
    /// Constructs a non-quantized type.
    pub fn new(elem: ElemKind, dims: impl Into<Vec<usize>>) -> Self {
        assert!(
            !elem.is_quantized(),
            "quantized element kinds require scale and offset"
        );
        Type {
            elem,
            dims: dims.into(),
            quant: None,
        }
    }

    /// Constructs a quantized type with the given scale and zero-offset.
    pub fn quantized(
        elem: ElemKind,
        dims: impl Into<Vec<usize>>,
        scale: f32,
        offset: i32,
    ) -> Self {
        assert!(
            elem.is_quantized(),
            "scale and offset are only valid on quantized element kinds"
        );
        Type {
            elem,
            dims: dims.into(),
            quant: Some(QuantParams { scale, offset }),
        }
    }

    /// The canonical empty type: zero-rank, no payload semantics.
    pub fn void() -> Self {
        Type {
            elem: ElemKind::Float,
            dims: Vec::new(),
            quant: None,
        }
    }

    pub fn elem(&self) -> ElemKind {
        self.elem
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total element count implied by the dimensions.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn quant(&self) -> Option<QuantParams> {
        self.quant
    }

    pub fn is_quantized(&self) -> bool {
        self.quant.is_some()
    }

    pub fn is_void(&self) -> bool {
        self.dims.is_empty()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<", self.elem.name())?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, " x ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, ">")?;
        if let Some(q) = self.quant {
            write!(f, "[s={}, o={}]", q.scale, q.offset)?;
        }
        Ok(())
    }
}

/// Stable reference to a type stored in a [`TypeArena`].
///
/// Handles returned for structurally-equal types are identical, so `==` on
/// handles is the cheap form of type equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeHandle(u32);

/// Append-only storage deduplicating types by structural equality.
///
/// The number of distinct types in a graph is small relative to its node
/// count, so uniquing uses a linear scan and buys handle-identity equality
/// for every later comparison.
#[derive(Debug, Default)]
pub struct TypeArena {
    types: Vec<Type>,
}

impl TypeArena {
    pub fn new() -> Self {
        TypeArena::default()
    }

    /// Returns the handle of a type structurally equal to `ty`, inserting it
    /// on first sight.
    pub fn unique_type(&mut self, ty: Type) -> TypeHandle {
        for (idx, existing) in self.types.iter().enumerate() {
            if *existing == ty {
                return TypeHandle(idx as u32);
            }
        }
        let handle = TypeHandle(self.types.len() as u32);
        self.types.push(ty);
        handle
    }

    /// Uniques a type with the element kind (and quantization parameters) of
    /// `handle` but new dimensions.
    pub fn unique_type_with_new_shape(
        &mut self,
        handle: TypeHandle,
        dims: impl Into<Vec<usize>>,
    ) -> TypeHandle {
        let base = self.get(handle);
        let ty = match base.quant() {
            Some(q) => Type::quantized(base.elem(), dims, q.scale, q.offset),
            None => Type::new(base.elem(), dims),
        };
        self.unique_type(ty)
    }

    /// Handle of the canonical void type.
    pub fn void_type(&mut self) -> TypeHandle {
        self.unique_type(Type::void())
    }

    /// Resolves a handle. Handles are never invalidated, so a miss is an
    /// internal invariant break.
    pub fn get(&self, handle: TypeHandle) -> &Type {
        &self.types[handle.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
