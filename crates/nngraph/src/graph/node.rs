//! Operator nodes and the typed edges between them.
//!
//! [`NodeKind`] is a closed sum type over every operator the compiler knows.
//! All kind-generic behavior (operand lists, slot names, destruction) is an
//! exhaustive match with no fallback arm, so adding an operator fails to
//! compile until every site handles it.

use serde::{Deserialize, Serialize};

use crate::graph::variable::VarId;
use crate::types::TypeHandle;

/// Index of a Node inside its Function's slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The producer behind an edge: either a Node in the same Function or a
/// Variable in the owning Module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    Node(NodeId),
    Var(VarId),
}

/// A typed edge endpoint: one specific result slot of one producer.
/// Never owns the entity it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeValue {
    pub origin: Origin,
    pub result: usize,
}

impl NodeValue {
    pub fn new(origin: Origin, result: usize) -> Self {
        NodeValue { origin, result }
    }

    /// First result of a node.
    pub fn node(id: NodeId) -> Self {
        NodeValue::new(Origin::Node(id), 0)
    }

    /// A Variable's single output.
    pub fn var(id: VarId) -> Self {
        NodeValue::new(Origin::Var(id), 0)
    }
}

impl From<VarId> for NodeValue {
    fn from(id: VarId) -> Self {
        NodeValue::var(id)
    }
}

impl From<NodeId> for NodeValue {
    fn from(id: NodeId) -> Self {
        NodeValue::node(id)
    }
}

/// Kind tag plus kind-specific operands and parameters. Parameters are
/// immutable after construction; operands are rewired only by the cloner
/// and by callers preparing an erasure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Convolution {
        input: NodeValue,
        filter: NodeValue,
        bias: NodeValue,
        kernel: usize,
        stride: usize,
        pad: usize,
        depth: usize,
    },
    PoolMax {
        input: NodeValue,
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    PoolAvg {
        input: NodeValue,
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    FullyConnected {
        input: NodeValue,
        weights: NodeValue,
        bias: NodeValue,
    },
    Relu {
        input: NodeValue,
    },
    Sigmoid {
        input: NodeValue,
    },
    Tanh {
        input: NodeValue,
    },
    SoftMax {
        input: NodeValue,
        selected: NodeValue,
    },
    CrossEntropyLoss {
        input: NodeValue,
        labels: NodeValue,
    },
    Regression {
        input: NodeValue,
        expected: NodeValue,
    },
    Reshape {
        input: NodeValue,
        dims: Vec<usize>,
    },
    Transpose {
        input: NodeValue,
        shuffle: Vec<usize>,
    },
    Broadcast {
        input: NodeValue,
        shape: Vec<usize>,
        axis: usize,
    },
    Concat {
        inputs: Vec<NodeValue>,
        axis: usize,
    },
    Slice {
        input: NodeValue,
        begin: Vec<usize>,
    },
    BatchNormalization {
        input: NodeValue,
        gamma: NodeValue,
        beta: NodeValue,
        mean: NodeValue,
        variance: NodeValue,
        channel_idx: usize,
        epsilon: f32,
        momentum: f32,
    },
    LocalResponseNormalization {
        input: NodeValue,
        scale: NodeValue,
        half_window: usize,
        alpha: f32,
        beta: f32,
        k: f32,
    },
    Add {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    Mul {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    Sub {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    Div {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    Max {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    Min {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    CmpLte {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    Pow {
        base: NodeValue,
        exponent: f32,
    },
    Select {
        cond: NodeValue,
        lhs: NodeValue,
        rhs: NodeValue,
    },
    Splat {
        value: f32,
    },
    MatMul {
        lhs: NodeValue,
        rhs: NodeValue,
    },
    BatchedReduceAdd {
        batch: NodeValue,
    },
    BatchedAdd {
        batch: NodeValue,
        sample: NodeValue,
    },
    Save {
        input: NodeValue,
        dest: NodeValue,
    },
    QuantizationProfile {
        input: NodeValue,
        histogram: NodeValue,
        computation_info: NodeValue,
        profiled_name: String,
    },
    TopK {
        input: NodeValue,
        k: usize,
    },
    Gather {
        data: NodeValue,
        indices: NodeValue,
    },
    Quantize {
        input: NodeValue,
    },
    Dequantize {
        input: NodeValue,
    },
    RescaleQuantized {
        input: NodeValue,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Convolution { .. } => "Convolution",
            NodeKind::PoolMax { .. } => "PoolMax",
            NodeKind::PoolAvg { .. } => "PoolAvg",
            NodeKind::FullyConnected { .. } => "FullyConnected",
            NodeKind::Relu { .. } => "Relu",
            NodeKind::Sigmoid { .. } => "Sigmoid",
            NodeKind::Tanh { .. } => "Tanh",
            NodeKind::SoftMax { .. } => "SoftMax",
            NodeKind::CrossEntropyLoss { .. } => "CrossEntropyLoss",
            NodeKind::Regression { .. } => "Regression",
            NodeKind::Reshape { .. } => "Reshape",
            NodeKind::Transpose { .. } => "Transpose",
            NodeKind::Broadcast { .. } => "Broadcast",
            NodeKind::Concat { .. } => "Concat",
            NodeKind::Slice { .. } => "Slice",
            NodeKind::BatchNormalization { .. } => "BatchNormalization",
            NodeKind::LocalResponseNormalization { .. } => "LocalResponseNormalization",
            NodeKind::Add { .. } => "Add",
            NodeKind::Mul { .. } => "Mul",
            NodeKind::Sub { .. } => "Sub",
            NodeKind::Div { .. } => "Div",
            NodeKind::Max { .. } => "Max",
            NodeKind::Min { .. } => "Min",
            NodeKind::CmpLte { .. } => "CmpLTE",
            NodeKind::Pow { .. } => "Pow",
            NodeKind::Select { .. } => "Select",
            NodeKind::Splat { .. } => "Splat",
            NodeKind::MatMul { .. } => "MatMul",
            NodeKind::BatchedReduceAdd { .. } => "BatchedReduceAdd",
            NodeKind::BatchedAdd { .. } => "BatchedAdd",
            NodeKind::Save { .. } => "Save",
            NodeKind::QuantizationProfile { .. } => "QuantizationProfile",
            NodeKind::TopK { .. } => "TopK",
            NodeKind::Gather { .. } => "Gather",
            NodeKind::Quantize { .. } => "Quantize",
            NodeKind::Dequantize { .. } => "Dequantize",
            NodeKind::RescaleQuantized { .. } => "RescaleQuantized",
        }
    }
}

/// One operator instance: kind, unique name, and result types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    name: String,
    kind: NodeKind,
    results: Vec<TypeHandle>,
}

impl Node {
    pub(crate) fn new(name: String, kind: NodeKind, results: Vec<TypeHandle>) -> Self {
        Node {
            name,
            kind,
            results,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the node. Callers own the per-Function uniqueness of names;
    /// the verifier is the backstop for collisions.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Result types in slot order.
    pub fn results(&self) -> &[TypeHandle] {
        &self.results
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn result_name(&self, idx: usize) -> &'static str {
        match &self.kind {
            NodeKind::TopK { .. } => match idx {
                0 => "values",
                1 => "indices",
                _ => "result",
            },
            _ => "result",
        }
    }

    /// Ordered list of input edges.
    pub fn inputs(&self) -> Vec<NodeValue> {
        match &self.kind {
            NodeKind::Convolution {
                input,
                filter,
                bias,
                ..
            } => vec![*input, *filter, *bias],
            NodeKind::PoolMax { input, .. } => vec![*input],
            NodeKind::PoolAvg { input, .. } => vec![*input],
            NodeKind::FullyConnected {
                input,
                weights,
                bias,
            } => vec![*input, *weights, *bias],
            NodeKind::Relu { input } => vec![*input],
            NodeKind::Sigmoid { input } => vec![*input],
            NodeKind::Tanh { input } => vec![*input],
            NodeKind::SoftMax { input, selected } => vec![*input, *selected],
            NodeKind::CrossEntropyLoss { input, labels } => vec![*input, *labels],
            NodeKind::Regression { input, expected } => vec![*input, *expected],
            NodeKind::Reshape { input, .. } => vec![*input],
            NodeKind::Transpose { input, .. } => vec![*input],
            NodeKind::Broadcast { input, .. } => vec![*input],
            NodeKind::Concat { inputs, .. } => inputs.clone(),
            NodeKind::Slice { input, .. } => vec![*input],
            NodeKind::BatchNormalization {
                input,
                gamma,
                beta,
                mean,
                variance,
                ..
            } => vec![*input, *gamma, *beta, *mean, *variance],
            NodeKind::LocalResponseNormalization { input, scale, .. } => vec![*input, *scale],
            NodeKind::Add { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::Mul { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::Sub { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::Div { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::Max { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::Min { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::CmpLte { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::Pow { base, .. } => vec![*base],
            NodeKind::Select { cond, lhs, rhs } => vec![*cond, *lhs, *rhs],
            NodeKind::Splat { .. } => Vec::new(),
            NodeKind::MatMul { lhs, rhs } => vec![*lhs, *rhs],
            NodeKind::BatchedReduceAdd { batch } => vec![*batch],
            NodeKind::BatchedAdd { batch, sample } => vec![*batch, *sample],
            NodeKind::Save { input, dest } => vec![*input, *dest],
            NodeKind::QuantizationProfile {
                input,
                histogram,
                computation_info,
                ..
            } => vec![*input, *histogram, *computation_info],
            NodeKind::TopK { input, .. } => vec![*input],
            NodeKind::Gather { data, indices } => vec![*data, *indices],
            NodeKind::Quantize { input } => vec![*input],
            NodeKind::Dequantize { input } => vec![*input],
            NodeKind::RescaleQuantized { input } => vec![*input],
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs().len()
    }

    /// Name of the `idx`-th input slot.
    pub fn input_name(&self, idx: usize) -> String {
        let names: &[&str] = match &self.kind {
            NodeKind::Convolution { .. } => &["input", "filter", "bias"],
            NodeKind::PoolMax { .. } | NodeKind::PoolAvg { .. } => &["input"],
            NodeKind::FullyConnected { .. } => &["input", "weights", "bias"],
            NodeKind::Relu { .. } | NodeKind::Sigmoid { .. } | NodeKind::Tanh { .. } => &["input"],
            NodeKind::SoftMax { .. } => &["input", "selected"],
            NodeKind::CrossEntropyLoss { .. } => &["input", "labels"],
            NodeKind::Regression { .. } => &["input", "expected"],
            NodeKind::Reshape { .. }
            | NodeKind::Transpose { .. }
            | NodeKind::Broadcast { .. }
            | NodeKind::Slice { .. } => &["input"],
            NodeKind::Concat { .. } => return format!("inputs.{idx}"),
            NodeKind::BatchNormalization { .. } => {
                &["input", "gamma", "beta", "mean", "variance"]
            }
            NodeKind::LocalResponseNormalization { .. } => &["input", "scale"],
            NodeKind::Add { .. }
            | NodeKind::Mul { .. }
            | NodeKind::Sub { .. }
            | NodeKind::Div { .. }
            | NodeKind::Max { .. }
            | NodeKind::Min { .. }
            | NodeKind::CmpLte { .. }
            | NodeKind::MatMul { .. } => &["LHS", "RHS"],
            NodeKind::Pow { .. } => &["base"],
            NodeKind::Select { .. } => &["cond", "LHS", "RHS"],
            NodeKind::Splat { .. } => &[],
            NodeKind::BatchedReduceAdd { .. } => &["batch"],
            NodeKind::BatchedAdd { .. } => &["batch", "sample"],
            NodeKind::Save { .. } => &["input", "output"],
            NodeKind::QuantizationProfile { .. } => &["input", "histogram", "computationInfo"],
            NodeKind::TopK { .. } => &["input"],
            NodeKind::Gather { .. } => &["data", "indices"],
            NodeKind::Quantize { .. }
            | NodeKind::Dequantize { .. }
            | NodeKind::RescaleQuantized { .. } => &["input"],
        };
        names.get(idx).map(|s| (*s).to_string()).unwrap_or_default()
    }

    /// Mutable references to every input edge, in slot order. Used by the
    /// cloner to remap producers and by callers rewiring a graph before an
    /// erasure.
    pub fn inputs_mut(&mut self) -> Vec<&mut NodeValue> {
        match &mut self.kind {
            NodeKind::Convolution {
                input,
                filter,
                bias,
                ..
            } => vec![input, filter, bias],
            NodeKind::PoolMax { input, .. } => vec![input],
            NodeKind::PoolAvg { input, .. } => vec![input],
            NodeKind::FullyConnected {
                input,
                weights,
                bias,
            } => vec![input, weights, bias],
            NodeKind::Relu { input } => vec![input],
            NodeKind::Sigmoid { input } => vec![input],
            NodeKind::Tanh { input } => vec![input],
            NodeKind::SoftMax { input, selected } => vec![input, selected],
            NodeKind::CrossEntropyLoss { input, labels } => vec![input, labels],
            NodeKind::Regression { input, expected } => vec![input, expected],
            NodeKind::Reshape { input, .. } => vec![input],
            NodeKind::Transpose { input, .. } => vec![input],
            NodeKind::Broadcast { input, .. } => vec![input],
            NodeKind::Concat { inputs, .. } => inputs.iter_mut().collect(),
            NodeKind::Slice { input, .. } => vec![input],
            NodeKind::BatchNormalization {
                input,
                gamma,
                beta,
                mean,
                variance,
                ..
            } => vec![input, gamma, beta, mean, variance],
            NodeKind::LocalResponseNormalization { input, scale, .. } => vec![input, scale],
            NodeKind::Add { lhs, rhs } => vec![lhs, rhs],
            NodeKind::Mul { lhs, rhs } => vec![lhs, rhs],
            NodeKind::Sub { lhs, rhs } => vec![lhs, rhs],
            NodeKind::Div { lhs, rhs } => vec![lhs, rhs],
            NodeKind::Max { lhs, rhs } => vec![lhs, rhs],
            NodeKind::Min { lhs, rhs } => vec![lhs, rhs],
            NodeKind::CmpLte { lhs, rhs } => vec![lhs, rhs],
            NodeKind::Pow { base, .. } => vec![base],
            NodeKind::Select { cond, lhs, rhs } => vec![cond, lhs, rhs],
            NodeKind::Splat { .. } => Vec::new(),
            NodeKind::MatMul { lhs, rhs } => vec![lhs, rhs],
            NodeKind::BatchedReduceAdd { batch } => vec![batch],
            NodeKind::BatchedAdd { batch, sample } => vec![batch, sample],
            NodeKind::Save { input, dest } => vec![input, dest],
            NodeKind::QuantizationProfile {
                input,
                histogram,
                computation_info,
                ..
            } => vec![input, histogram, computation_info],
            NodeKind::TopK { input, .. } => vec![input],
            NodeKind::Gather { data, indices } => vec![data, indices],
            NodeKind::Quantize { input } => vec![input],
            NodeKind::Dequantize { input } => vec![input],
            NodeKind::RescaleQuantized { input } => vec![input],
        }
    }
}
