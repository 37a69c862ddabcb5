//! Module: the single owner of types, variables, and functions.

use std::fmt;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::graph::builder::GraphBuilder;
use crate::graph::function::{Function, FunctionId};
use crate::graph::node::{Node, NodeValue, Origin};
use crate::graph::variable::{TrainKind, VarId, Variable, Visibility};
use crate::graph::verify::{self, VerifyError};
use crate::tensor::Tensor;
use crate::types::{ElemKind, Type, TypeArena, TypeHandle};

/// Default seed for Variable initialization; fixed so freshly built modules
/// are reproducible unless the caller opts into another seed.
const DEFAULT_INIT_SEED: u64 = 0x5eed_cafe;

/// Owns the type arena, the Variables shared across graphs, the Functions,
/// and the name-uniquing counter.
///
/// A Module and its Functions are mutated only by the thread driving
/// construction; there is no internal synchronization.
pub struct Module {
    types: TypeArena,
    vars: Vec<Option<Variable>>,
    functions: Vec<Option<Function>>,
    unique_idx: usize,
    rng: StdRng,
}

impl Module {
    pub fn new() -> Self {
        Module::with_seed(DEFAULT_INIT_SEED)
    }

    /// Creates a Module whose Variable initialization draws from a specific
    /// seed.
    pub fn with_seed(seed: u64) -> Self {
        Module {
            types: TypeArena::new(),
            vars: Vec::new(),
            functions: Vec::new(),
            unique_idx: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    // --- types ---

    pub fn types(&self) -> &TypeArena {
        &self.types
    }

    pub fn unique_type(&mut self, ty: Type) -> TypeHandle {
        self.types.unique_type(ty)
    }

    pub fn unique_type_with_new_shape(
        &mut self,
        handle: TypeHandle,
        dims: impl Into<Vec<usize>>,
    ) -> TypeHandle {
        self.types.unique_type_with_new_shape(handle, dims)
    }

    pub fn void_type(&mut self) -> TypeHandle {
        self.types.void_type()
    }

    /// Resolves a type handle.
    pub fn ty(&self, handle: TypeHandle) -> &Type {
        self.types.get(handle)
    }

    // --- naming ---

    /// Forms a unique name from `name` by stripping everything from the
    /// first `"__"` and appending `"__<counter>"`.
    ///
    /// `"__"` is the only uniquing delimiter: caller-supplied prefixes must
    /// not contain it, and auto-generated suffixes are only ever appended
    /// after it.
    pub fn unique_name(&mut self, name: &str) -> String {
        let base = match name.find("__") {
            Some(pos) => &name[..pos],
            None => name,
        };
        let unique = format!("{base}__{}", self.unique_idx);
        self.unique_idx += 1;
        unique
    }

    // --- functions ---

    /// Creates and registers an empty Function. The name must be unused.
    pub fn create_function(&mut self, name: &str) -> Result<FunctionId> {
        if self.get_function(name).is_some() {
            bail!("a function named '{name}' already exists in this module");
        }
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Some(Function::new(name.to_string())));
        Ok(id)
    }

    pub fn get_function(&self, name: &str) -> Option<FunctionId> {
        self.functions()
            .find(|(_, f)| f.name() == name)
            .map(|(id, _)| id)
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.index()).and_then(Option::as_ref)
    }

    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Live functions in creation order.
    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|f| (FunctionId(idx as u32), f)))
    }

    /// Destroys a Function and all Nodes it owns. Module-owned Variables
    /// are not affected.
    pub fn erase_function(&mut self, id: FunctionId) -> Result<Function> {
        let Some(slot) = self.functions.get_mut(id.index()) else {
            bail!("function id {} is not part of this module", id.0);
        };
        match slot.take() {
            Some(f) => Ok(f),
            None => bail!("function id {} was already erased", id.0),
        }
    }

    // --- variables ---

    /// Creates a Variable of an already-uniqued type, applies its
    /// initialization policy, and registers it under a uniqued name.
    pub fn create_variable(
        &mut self,
        ty: TypeHandle,
        name: &str,
        visibility: Visibility,
        train: TrainKind,
    ) -> VarId {
        let dims = self.types.get(ty).dims().to_vec();
        let payload = match train {
            TrainKind::None => Tensor::zeros(dims),
            TrainKind::Xavier { fan_in } => Tensor::xavier(dims, fan_in, &mut self.rng),
            TrainKind::Broadcast { value } => Tensor::splat(dims, value),
        };
        let name = self.unique_name(name);
        let id = VarId(self.vars.len() as u32);
        self.vars
            .push(Some(Variable::new(name, ty, visibility, train, payload)));
        id
    }

    /// Creates a Variable from an element kind and dimensions.
    pub fn create_variable_of(
        &mut self,
        elem: ElemKind,
        dims: impl Into<Vec<usize>>,
        name: &str,
        visibility: Visibility,
        train: TrainKind,
    ) -> VarId {
        let ty = self.unique_type(Type::new(elem, dims));
        self.create_variable(ty, name, visibility, train)
    }

    /// Creates a Variable of a quantized type.
    pub fn create_quantized_variable(
        &mut self,
        elem: ElemKind,
        dims: impl Into<Vec<usize>>,
        scale: f32,
        offset: i32,
        name: &str,
        visibility: Visibility,
        train: TrainKind,
    ) -> VarId {
        let ty = self.unique_type(Type::quantized(elem, dims, scale, offset));
        self.create_variable(ty, name, visibility, train)
    }

    pub fn variable(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.index()).and_then(Option::as_ref)
    }

    pub fn variable_mut(&mut self, id: VarId) -> Option<&mut Variable> {
        self.vars.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Live variables in creation order.
    pub fn variables(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.vars
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|v| (VarId(idx as u32), v)))
    }

    pub fn get_variable_by_name(&self, name: &str) -> Option<VarId> {
        self.variables()
            .find(|(_, v)| v.name() == name)
            .map(|(id, _)| id)
    }

    /// Removes and destroys a Variable.
    ///
    /// This does not scan Functions for remaining references to the
    /// Variable; a stale edge is detected by the verifier.
    pub fn erase_variable(&mut self, id: VarId) -> Result<Variable> {
        let Some(slot) = self.vars.get_mut(id.index()) else {
            bail!("variable id {} is not part of this module", id.0);
        };
        match slot.take() {
            Some(v) => Ok(v),
            None => bail!("variable id {} was already erased", id.0),
        }
    }

    /// Erases the producer behind `target` from `func`'s graph. Variable
    /// origins delegate to [`Module::erase_variable`] since Variables are
    /// never stored in a Function's own node list.
    pub fn erase_node(&mut self, func: FunctionId, target: Origin) -> Result<()> {
        match target {
            Origin::Var(id) => {
                self.erase_variable(id)?;
            }
            Origin::Node(id) => {
                let Some(function) = self.function_mut(func) else {
                    bail!("function id {} is not part of this module", func.0);
                };
                function.erase_node(id)?;
            }
        }
        Ok(())
    }

    // --- construction, verification, rendering ---

    /// Returns a node builder appending into `func`.
    ///
    /// Panics if `func` has been erased; holding a builder for a dead
    /// function is an internal invariant break, not a recoverable state.
    pub fn builder(&mut self, func: FunctionId) -> GraphBuilder<'_> {
        assert!(
            self.function(func).is_some(),
            "cannot build into an erased function"
        );
        GraphBuilder::new(self, func)
    }

    /// Verifies every live Function against this Module.
    pub fn verify(&self) -> Result<(), VerifyError> {
        for (id, _) in self.functions() {
            verify::verify_function(self, id)?;
        }
        Ok(())
    }

    /// Type carried by an edge endpoint of `func`'s graph, or `None` when
    /// the producer has been erased or never existed.
    pub fn value_type(&self, func: FunctionId, value: NodeValue) -> Option<&Type> {
        let function = self.function(func)?;
        let handle = match value.origin {
            Origin::Node(id) => function.node(id)?.results().get(value.result).copied()?,
            Origin::Var(id) => {
                if value.result != 0 {
                    return None;
                }
                self.variable(id)?.ty()
            }
        };
        Some(self.ty(handle))
    }

    /// Renders one Function's ordered node list; the traversal an external
    /// renderer consumes.
    pub fn display_function(&self, func: FunctionId) -> Option<FunctionDump<'_>> {
        self.function(func)
            .map(|function| FunctionDump {
                module: self,
                function,
            })
    }

    /// Describes the producer behind an edge, e.g. `%conv__3.0`.
    pub(crate) fn value_desc(&self, function: &Function, value: NodeValue) -> String {
        let name = match value.origin {
            Origin::Node(id) => function
                .node(id)
                .map(|n| n.name().to_string())
                .unwrap_or_else(|| format!("<erased node {}>", id.0)),
            Origin::Var(id) => self
                .variable(id)
                .map(|v| v.name().to_string())
                .unwrap_or_else(|| format!("<erased var {}>", id.0)),
        };
        format!("%{name}.{}", value.result)
    }

    pub(crate) fn node_desc(&self, function: &Function, node: &Node) -> String {
        let inputs = node
            .inputs()
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                format!("{}={}", node.input_name(idx), self.value_desc(function, *value))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let results = node
            .results()
            .iter()
            .map(|handle| self.ty(*handle).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if results.is_empty() {
            format!("%{} = {}({inputs})", node.name(), node.kind_name())
        } else {
            format!("%{} = {}({inputs}) -> {results}", node.name(), node.kind_name())
        }
    }
}

impl Default for Module {
    fn default() -> Self {
        Module::new()
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {{")?;
        for (_, var) in self.variables() {
            let vis = match var.visibility() {
                Visibility::Public => "public",
                Visibility::Private => "private",
            };
            writeln!(f, "  %{} : {} {}", var.name(), self.ty(var.ty()), vis)?;
        }
        for (_, function) in self.functions() {
            writeln!(
                f,
                "  func @{} ({} nodes)",
                function.name(),
                function.num_nodes()
            )?;
        }
        write!(f, "}}")
    }
}

/// Ordered structural dump of one Function; see
/// [`Module::display_function`].
pub struct FunctionDump<'a> {
    module: &'a Module,
    function: &'a Function,
}

impl fmt::Display for FunctionDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func @{} {{", self.function.name())?;
        for (_, node) in self.function.nodes() {
            writeln!(f, "  {}", self.module.node_desc(self.function, node))?;
        }
        write!(f, "}}")
    }
}
