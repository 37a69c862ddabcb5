//! Node builders: one constructor per operator kind.
//!
//! Every builder validates its preconditions before touching the graph,
//! computes the output type(s) through the module's type arena, allocates
//! auxiliary Variables where the layer needs them, appends the node, and
//! returns a typed edge handle. Builders never mutate their inputs; a
//! failed precondition returns `Err` with the graph unchanged.

use anyhow::{anyhow, bail, ensure, Result};

use crate::graph::function::FunctionId;
use crate::graph::module::Module;
use crate::graph::node::{Node, NodeId, NodeKind, NodeValue, Origin};
use crate::graph::variable::{TrainKind, VarId, Visibility};
use crate::types::{ElemKind, Type, TypeHandle};

/// Bias constant used when a layer auto-allocates its bias Variable.
const DEFAULT_BIAS: f32 = 0.1;

/// Bucket count of the histogram Variable backing a quantization profile.
const HISTOGRAM_BUCKETS: usize = 2000;

/// The two result edges of a TopK node.
#[derive(Debug, Clone, Copy)]
pub struct TopKValues {
    pub values: NodeValue,
    pub indices: NodeValue,
}

/// Appends typed operator nodes into one Function of a Module.
pub struct GraphBuilder<'m> {
    module: &'m mut Module,
    func: FunctionId,
}

/// Generates the elementwise binary builders; they share one contract
/// (operand shapes equal, result takes the LHS type).
macro_rules! arithmetic_builder {
    ($(($fn_name:ident, $variant:ident)),* $(,)?) => {
        $(
            pub fn $fn_name(
                &mut self,
                name: &str,
                lhs: NodeValue,
                rhs: NodeValue,
            ) -> Result<NodeValue> {
                let lhs_dims = self.dims(lhs)?;
                let rhs_dims = self.dims(rhs)?;
                ensure!(
                    lhs_dims == rhs_dims,
                    "{} operands must share a shape: {:?} vs {:?}",
                    stringify!($variant),
                    lhs_dims,
                    rhs_dims
                );
                let ty = self.value_type_handle(lhs)?;
                let id = self.add_node(name, NodeKind::$variant { lhs, rhs }, vec![ty]);
                Ok(NodeValue::node(id))
            }
        )*
    };
}

impl<'m> GraphBuilder<'m> {
    pub(crate) fn new(module: &'m mut Module, func: FunctionId) -> Self {
        GraphBuilder { module, func }
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    pub fn func(&self) -> FunctionId {
        self.func
    }

    // --- edge resolution ---

    /// Type handle carried by an edge endpoint.
    pub fn value_type_handle(&self, value: NodeValue) -> Result<TypeHandle> {
        match value.origin {
            Origin::Node(id) => {
                let function = self
                    .module
                    .function(self.func)
                    .expect("builder function is live");
                let node = function.node(id).ok_or_else(|| {
                    anyhow!("value references node id {} which is not in the function", id.index())
                })?;
                node.results().get(value.result).copied().ok_or_else(|| {
                    anyhow!(
                        "result slot {} is out of range for node '{}'",
                        value.result,
                        node.name()
                    )
                })
            }
            Origin::Var(id) => {
                ensure!(
                    value.result == 0,
                    "variables carry a single result, got slot {}",
                    value.result
                );
                self.module
                    .variable(id)
                    .map(|v| v.ty())
                    .ok_or_else(|| {
                        anyhow!("value references variable id {} which is not in the module", id.index())
                    })
            }
        }
    }

    fn value_type(&self, value: NodeValue) -> Result<&Type> {
        let handle = self.value_type_handle(value)?;
        Ok(self.module.ty(handle))
    }

    fn dims(&self, value: NodeValue) -> Result<Vec<usize>> {
        Ok(self.value_type(value)?.dims().to_vec())
    }

    fn elem(&self, value: NodeValue) -> Result<ElemKind> {
        Ok(self.value_type(value)?.elem())
    }

    /// Name of the entity producing `value`, for diagnostics and profiling.
    fn producer_name(&self, value: NodeValue) -> Result<String> {
        match value.origin {
            Origin::Node(id) => {
                let function = self
                    .module
                    .function(self.func)
                    .expect("builder function is live");
                function
                    .node(id)
                    .map(|n| n.name().to_string())
                    .ok_or_else(|| anyhow!("value references an erased node"))
            }
            Origin::Var(id) => self
                .module
                .variable(id)
                .map(|v| v.name().to_string())
                .ok_or_else(|| anyhow!("value references an erased variable")),
        }
    }

    fn add_node(&mut self, name: &str, kind: NodeKind, results: Vec<TypeHandle>) -> NodeId {
        let name = self.module.unique_name(name);
        self.module
            .function_mut(self.func)
            .expect("builder function is live")
            .add_node(Node::new(name, kind, results))
    }

    // --- convolution and pooling ---

    /// Convolution with auto-allocated filter and bias Variables.
    pub fn create_conv(
        &mut self,
        name: &str,
        input: NodeValue,
        depth: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<NodeValue> {
        let idim = ShapeNhwc::from_dims(&self.dims(input)?)?;
        ensure!(stride > 0, "convolution stride must be positive");
        ensure!(
            idim.h >= kernel && idim.w >= kernel,
            "convolution input ({} x {}) is smaller than the {kernel}x{kernel} kernel",
            idim.h,
            idim.w
        );
        let (out_h, out_w) = conv_output_dims(idim.h, idim.w, kernel, stride, pad);

        let fan_in = (kernel * kernel * idim.c) as f32;
        let filter = self.module.create_variable_of(
            ElemKind::Float,
            vec![depth, kernel, kernel, idim.c],
            "filter",
            Visibility::Private,
            TrainKind::Xavier { fan_in },
        );
        let bias = self.module.create_variable_of(
            ElemKind::Float,
            vec![depth],
            "bias",
            Visibility::Private,
            TrainKind::Broadcast {
                value: DEFAULT_BIAS,
            },
        );

        let out_ty = self
            .module
            .unique_type(Type::new(ElemKind::Float, vec![idim.n, out_h, out_w, depth]));
        let id = self.add_node(
            name,
            NodeKind::Convolution {
                input,
                filter: filter.into(),
                bias: bias.into(),
                kernel,
                stride,
                pad,
                depth,
            },
            vec![out_ty],
        );
        Ok(NodeValue::node(id))
    }

    /// Convolution over caller-provided filter and bias with an explicit
    /// output type.
    #[allow(clippy::too_many_arguments)]
    pub fn create_conv_with(
        &mut self,
        name: &str,
        input: NodeValue,
        filter: NodeValue,
        bias: NodeValue,
        out_ty: TypeHandle,
        depth: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<NodeValue> {
        let idim = ShapeNhwc::from_dims(&self.dims(input)?)?;
        ensure!(stride > 0, "convolution stride must be positive");
        ensure!(
            idim.h >= kernel && idim.w >= kernel,
            "convolution input ({} x {}) is smaller than the {kernel}x{kernel} kernel",
            idim.h,
            idim.w
        );
        let filter_dims = self.dims(filter)?;
        ensure!(
            filter_dims == [depth, kernel, kernel, idim.c],
            "filter dims {filter_dims:?} do not match [depth, kernel, kernel, channels] = \
             [{depth}, {kernel}, {kernel}, {}]",
            idim.c
        );
        let bias_elems = self.value_type(bias)?.num_elements();
        ensure!(
            bias_elems == depth,
            "bias holds {bias_elems} elements but the convolution depth is {depth}"
        );
        let id = self.add_node(
            name,
            NodeKind::Convolution {
                input,
                filter,
                bias,
                kernel,
                stride,
                pad,
                depth,
            },
            vec![out_ty],
        );
        Ok(NodeValue::node(id))
    }

    pub fn create_pool_max(
        &mut self,
        name: &str,
        input: NodeValue,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<NodeValue> {
        self.create_pool(name, input, kernel, stride, pad, true)
    }

    pub fn create_pool_avg(
        &mut self,
        name: &str,
        input: NodeValue,
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<NodeValue> {
        self.create_pool(name, input, kernel, stride, pad, false)
    }

    fn create_pool(
        &mut self,
        name: &str,
        input: NodeValue,
        kernel: usize,
        stride: usize,
        pad: usize,
        max: bool,
    ) -> Result<NodeValue> {
        let idim = ShapeNhwc::from_dims(&self.dims(input)?)?;
        ensure!(stride > 0, "pooling stride must be positive");
        ensure!(
            idim.h >= kernel && idim.w >= kernel,
            "pooling input ({} x {}) is smaller than the {kernel}x{kernel} kernel",
            idim.h,
            idim.w
        );
        let (out_h, out_w) = conv_output_dims(idim.h, idim.w, kernel, stride, pad);
        let in_ty = self.value_type_handle(input)?;
        let out_ty = self
            .module
            .unique_type_with_new_shape(in_ty, vec![idim.n, out_h, out_w, idim.c]);
        let kind = if max {
            NodeKind::PoolMax {
                input,
                kernel,
                stride,
                pad,
            }
        } else {
            NodeKind::PoolAvg {
                input,
                kernel,
                stride,
                pad,
            }
        };
        let id = self.add_node(name, kind, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    // --- fully connected ---

    /// Fully-connected layer with auto-allocated weights and bias. The
    /// input's trailing dimensions are flattened into the fan-in.
    pub fn create_fully_connected(
        &mut self,
        name: &str,
        input: NodeValue,
        out_depth: usize,
    ) -> Result<NodeValue> {
        let elem = self.elem(input)?;
        ensure!(
            !elem.is_quantized(),
            "fully-connected auto-allocation requires a non-quantized input"
        );
        let (batch, flat) = flatten_cdr(&self.dims(input)?)?;

        let weights = self.module.create_variable_of(
            elem,
            vec![flat, out_depth],
            "weights",
            Visibility::Private,
            TrainKind::Xavier {
                fan_in: flat as f32,
            },
        );
        let bias = self.module.create_variable_of(
            elem,
            vec![out_depth],
            "bias",
            Visibility::Private,
            TrainKind::Broadcast {
                value: DEFAULT_BIAS,
            },
        );

        let out_ty = self.module.unique_type(Type::new(elem, vec![batch, out_depth]));
        let id = self.add_node(
            name,
            NodeKind::FullyConnected {
                input,
                weights: weights.into(),
                bias: bias.into(),
            },
            vec![out_ty],
        );
        Ok(NodeValue::node(id))
    }

    /// Fully-connected layer over caller-provided weights and bias.
    pub fn create_fully_connected_with(
        &mut self,
        name: &str,
        input: NodeValue,
        weights: NodeValue,
        bias: NodeValue,
    ) -> Result<NodeValue> {
        let in_dims = self.dims(input)?;
        let (batch, flat) = flatten_cdr(&in_dims)?;
        let weight_dims = self.dims(weights)?;
        ensure!(
            weight_dims.len() == 2,
            "fully-connected weights must be rank 2, got {:?}",
            weight_dims
        );
        ensure!(
            weight_dims[0] == flat,
            "weight rows ({}) must match the flattened input trailing size ({flat})",
            weight_dims[0]
        );
        let out_depth = self.value_type(bias)?.num_elements();
        ensure!(
            weight_dims[1] == out_depth,
            "weight columns ({}) must match the bias size ({out_depth})",
            weight_dims[1]
        );
        let in_ty = self.value_type_handle(input)?;
        let out_ty = self
            .module
            .unique_type_with_new_shape(in_ty, vec![batch, out_depth]);
        let id = self.add_node(
            name,
            NodeKind::FullyConnected {
                input,
                weights,
                bias,
            },
            vec![out_ty],
        );
        Ok(NodeValue::node(id))
    }

    // --- activations and losses ---

    pub fn create_relu(&mut self, name: &str, input: NodeValue) -> Result<NodeValue> {
        let ty = self.value_type_handle(input)?;
        let id = self.add_node(name, NodeKind::Relu { input }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    pub fn create_sigmoid(&mut self, name: &str, input: NodeValue) -> Result<NodeValue> {
        let ty = self.value_type_handle(input)?;
        let id = self.add_node(name, NodeKind::Sigmoid { input }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    pub fn create_tanh(&mut self, name: &str, input: NodeValue) -> Result<NodeValue> {
        let ty = self.value_type_handle(input)?;
        let id = self.add_node(name, NodeKind::Tanh { input }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    pub fn create_softmax(
        &mut self,
        name: &str,
        input: NodeValue,
        selected: NodeValue,
    ) -> Result<NodeValue> {
        let ty = self.value_type_handle(input)?;
        self.value_type_handle(selected)?;
        let id = self.add_node(name, NodeKind::SoftMax { input, selected }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    pub fn create_cross_entropy_loss(
        &mut self,
        name: &str,
        input: NodeValue,
        labels: NodeValue,
    ) -> Result<NodeValue> {
        let in_ty = self.value_type_handle(input)?;
        self.value_type_handle(labels)?;
        let out_ty = self.module.unique_type_with_new_shape(in_ty, vec![1]);
        let id = self.add_node(name, NodeKind::CrossEntropyLoss { input, labels }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    pub fn create_regression(
        &mut self,
        name: &str,
        input: NodeValue,
        expected: NodeValue,
    ) -> Result<NodeValue> {
        let in_dims = self.dims(input)?;
        let exp_dims = self.dims(expected)?;
        ensure!(
            in_dims == exp_dims,
            "regression operands must share a shape: {in_dims:?} vs {exp_dims:?}"
        );
        let ty = self.value_type_handle(input)?;
        let id = self.add_node(name, NodeKind::Regression { input, expected }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    // --- shape operations ---

    /// Retypes the input to new dimensions with the same element count.
    pub fn create_reshape(
        &mut self,
        name: &str,
        input: NodeValue,
        dims: impl Into<Vec<usize>>,
    ) -> Result<NodeValue> {
        let dims = dims.into();
        let in_ty = self.value_type(input)?;
        let in_elems = in_ty.num_elements();
        let out_elems: usize = dims.iter().product();
        ensure!(
            in_elems == out_elems,
            "reshape must preserve the element count ({in_elems} vs {out_elems})"
        );
        let in_handle = self.value_type_handle(input)?;
        let out_ty = self.module.unique_type_with_new_shape(in_handle, dims.clone());
        let id = self.add_node(name, NodeKind::Reshape { input, dims }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    /// Reorders the input's axes; `shuffle` must be a permutation of them.
    pub fn create_transpose(
        &mut self,
        name: &str,
        input: NodeValue,
        shuffle: impl Into<Vec<usize>>,
    ) -> Result<NodeValue> {
        let shuffle = shuffle.into();
        let in_dims = self.dims(input)?;
        ensure!(
            shuffle.len() == in_dims.len(),
            "shuffle length {} must equal the input rank {}",
            shuffle.len(),
            in_dims.len()
        );
        let mut seen = vec![false; in_dims.len()];
        for &axis in &shuffle {
            ensure!(axis < in_dims.len(), "shuffle axis {axis} is out of range");
            ensure!(!seen[axis], "shuffle repeats axis {axis}");
            seen[axis] = true;
        }
        let out_dims: Vec<usize> = shuffle.iter().map(|&axis| in_dims[axis]).collect();
        let in_handle = self.value_type_handle(input)?;
        let out_ty = self.module.unique_type_with_new_shape(in_handle, out_dims);
        let id = self.add_node(name, NodeKind::Transpose { input, shuffle }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    /// Broadcasts the input into `shape`, aligning its first axis with
    /// `axis` of the target.
    pub fn create_broadcast(
        &mut self,
        name: &str,
        input: NodeValue,
        shape: impl Into<Vec<usize>>,
        axis: usize,
    ) -> Result<NodeValue> {
        let shape = shape.into();
        let in_dims = self.dims(input)?;
        ensure!(
            axis + in_dims.len() <= shape.len(),
            "broadcast axis {axis} places a rank-{} input outside a rank-{} target",
            in_dims.len(),
            shape.len()
        );
        for (offset, &dim) in in_dims.iter().enumerate() {
            let target = shape[axis + offset];
            ensure!(
                dim == target || dim == 1,
                "broadcast dim mismatch at input axis {offset}: {dim} vs {target}"
            );
        }
        let elem = self.elem(input)?;
        ensure!(
            !elem.is_quantized(),
            "broadcast of quantized tensors is not supported"
        );
        let out_ty = self.module.unique_type(Type::new(elem, shape.clone()));
        let id = self.add_node(name, NodeKind::Broadcast { input, shape, axis }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    /// Concatenates the inputs along `axis`; every other dimension must
    /// agree across all of them.
    pub fn create_concat(
        &mut self,
        name: &str,
        inputs: &[NodeValue],
        axis: usize,
    ) -> Result<NodeValue> {
        ensure!(!inputs.is_empty(), "concat requires at least one input");
        let first_dims = self.dims(inputs[0])?;
        let first_elem = self.elem(inputs[0])?;
        ensure!(
            axis < first_dims.len(),
            "concat axis {axis} is out of range for rank {}",
            first_dims.len()
        );
        let mut out_dims = first_dims.clone();
        out_dims[axis] = 0;
        for &value in inputs {
            let dims = self.dims(value)?;
            ensure!(
                self.elem(value)? == first_elem,
                "concat inputs must share an element kind"
            );
            ensure!(
                same_dims_except(&dims, &first_dims, axis),
                "concat input shape {dims:?} differs from {first_dims:?} outside axis {axis}"
            );
            out_dims[axis] += dims[axis];
        }
        let first_handle = self.value_type_handle(inputs[0])?;
        let out_ty = self.module.unique_type_with_new_shape(first_handle, out_dims);
        let id = self.add_node(
            name,
            NodeKind::Concat {
                inputs: inputs.to_vec(),
                axis,
            },
            vec![out_ty],
        );
        Ok(NodeValue::node(id))
    }

    /// Extracts the half-open window `begin[i]..end[i]` on every axis.
    pub fn create_slice(
        &mut self,
        name: &str,
        input: NodeValue,
        begin: impl Into<Vec<usize>>,
        end: impl Into<Vec<usize>>,
    ) -> Result<NodeValue> {
        let begin = begin.into();
        let end = end.into();
        let in_dims = self.dims(input)?;
        ensure!(
            begin.len() == end.len(),
            "slice begin and end ranks differ ({} vs {})",
            begin.len(),
            end.len()
        );
        ensure!(
            begin.len() == in_dims.len(),
            "slice rank {} must match the input rank {}",
            begin.len(),
            in_dims.len()
        );
        let mut out_dims = Vec::with_capacity(in_dims.len());
        for axis in 0..in_dims.len() {
            ensure!(
                begin[axis] < end[axis],
                "slice window is empty on axis {axis} ({}..{})",
                begin[axis],
                end[axis]
            );
            ensure!(
                end[axis] <= in_dims[axis],
                "slice end {} exceeds dimension {} on axis {axis}",
                end[axis],
                in_dims[axis]
            );
            out_dims.push(end[axis] - begin[axis]);
        }
        let in_handle = self.value_type_handle(input)?;
        let out_ty = self.module.unique_type_with_new_shape(in_handle, out_dims);
        let id = self.add_node(name, NodeKind::Slice { input, begin }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    // --- normalization ---

    /// Batch normalization with auto-allocated per-channel gamma/beta and
    /// running mean/variance Variables.
    pub fn create_batch_normalization(
        &mut self,
        name: &str,
        input: NodeValue,
        channel_idx: usize,
        epsilon: f32,
        momentum: f32,
    ) -> Result<NodeValue> {
        let in_dims = self.dims(input)?;
        ensure!(
            channel_idx < in_dims.len(),
            "channel axis {channel_idx} is out of range for rank {}",
            in_dims.len()
        );
        let channels = in_dims[channel_idx];

        let beta = self.module.create_variable_of(
            ElemKind::Float,
            vec![channels],
            "beta",
            Visibility::Private,
            TrainKind::Broadcast { value: 0.0 },
        );
        let gamma = self.module.create_variable_of(
            ElemKind::Float,
            vec![channels],
            "gamma",
            Visibility::Private,
            TrainKind::Broadcast { value: 1.0 },
        );
        let mean = self.module.create_variable_of(
            ElemKind::Float,
            vec![channels],
            "mean",
            Visibility::Private,
            TrainKind::None,
        );
        let variance = self.module.create_variable_of(
            ElemKind::Float,
            vec![channels],
            "variance",
            Visibility::Private,
            TrainKind::None,
        );

        self.create_batch_normalization_with(
            name,
            input,
            gamma.into(),
            beta.into(),
            mean.into(),
            variance.into(),
            channel_idx,
            epsilon,
            momentum,
        )
    }

    /// Batch normalization over caller-provided per-channel Variables.
    #[allow(clippy::too_many_arguments)]
    pub fn create_batch_normalization_with(
        &mut self,
        name: &str,
        input: NodeValue,
        gamma: NodeValue,
        beta: NodeValue,
        mean: NodeValue,
        variance: NodeValue,
        channel_idx: usize,
        epsilon: f32,
        momentum: f32,
    ) -> Result<NodeValue> {
        let in_dims = self.dims(input)?;
        ensure!(
            channel_idx < in_dims.len(),
            "channel axis {channel_idx} is out of range for rank {}",
            in_dims.len()
        );
        let channels = in_dims[channel_idx];
        for (slot, value) in [
            ("gamma", gamma),
            ("beta", beta),
            ("mean", mean),
            ("variance", variance),
        ] {
            let elems = self.value_type(value)?.num_elements();
            ensure!(
                elems == channels,
                "{slot} holds {elems} elements but the channel axis has {channels}"
            );
        }
        let ty = self.value_type_handle(input)?;
        let id = self.add_node(
            name,
            NodeKind::BatchNormalization {
                input,
                gamma,
                beta,
                mean,
                variance,
                channel_idx,
                epsilon,
                momentum,
            },
            vec![ty],
        );
        Ok(NodeValue::node(id))
    }

    /// Local response normalization across channels; allocates the
    /// per-channel scale Variable the backward pass reads.
    pub fn create_local_response_normalization(
        &mut self,
        name: &str,
        input: NodeValue,
        half_window: usize,
        alpha: f32,
        beta: f32,
        k: f32,
    ) -> Result<NodeValue> {
        let in_dims = self.dims(input)?;
        ensure!(
            !in_dims.is_empty(),
            "local response normalization requires a ranked input"
        );
        let channels = *in_dims.last().expect("rank checked above");
        let scale = self.module.create_variable_of(
            ElemKind::Float,
            vec![channels],
            "scale",
            Visibility::Private,
            TrainKind::None,
        );
        let ty = self.value_type_handle(input)?;
        let id = self.add_node(
            name,
            NodeKind::LocalResponseNormalization {
                input,
                scale: scale.into(),
                half_window,
                alpha,
                beta,
                k,
            },
            vec![ty],
        );
        Ok(NodeValue::node(id))
    }

    // --- elementwise arithmetic ---

    arithmetic_builder!(
        (create_add, Add),
        (create_mul, Mul),
        (create_sub, Sub),
        (create_div, Div),
        (create_max, Max),
        (create_min, Min),
        (create_cmp_lte, CmpLte),
    );

    pub fn create_pow(&mut self, name: &str, base: NodeValue, exponent: f32) -> Result<NodeValue> {
        let ty = self.value_type_handle(base)?;
        let id = self.add_node(name, NodeKind::Pow { base, exponent }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    pub fn create_select(
        &mut self,
        name: &str,
        cond: NodeValue,
        lhs: NodeValue,
        rhs: NodeValue,
    ) -> Result<NodeValue> {
        let lhs_dims = self.dims(lhs)?;
        let rhs_dims = self.dims(rhs)?;
        let cond_dims = self.dims(cond)?;
        ensure!(
            lhs_dims == rhs_dims,
            "select branches must share a shape: {lhs_dims:?} vs {rhs_dims:?}"
        );
        ensure!(
            cond_dims == rhs_dims,
            "select condition shape {cond_dims:?} must match the branches {rhs_dims:?}"
        );
        let ty = self.value_type_handle(lhs)?;
        let id = self.add_node(name, NodeKind::Select { cond, lhs, rhs }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    /// Materializes a tensor of `ty` filled with one constant.
    pub fn create_splat(&mut self, name: &str, ty: TypeHandle, value: f32) -> Result<NodeValue> {
        let id = self.add_node(name, NodeKind::Splat { value }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    // --- linear algebra and batch ops ---

    pub fn create_matmul(
        &mut self,
        name: &str,
        lhs: NodeValue,
        rhs: NodeValue,
    ) -> Result<NodeValue> {
        let lhs_ty = self.value_type(lhs)?;
        let (lhs_elem, lhs_dims) = (lhs_ty.elem(), lhs_ty.dims().to_vec());
        let rhs_ty = self.value_type(rhs)?;
        let (rhs_elem, rhs_dims) = (rhs_ty.elem(), rhs_ty.dims().to_vec());
        ensure!(
            lhs_elem == rhs_elem,
            "matmul operands must share an element kind"
        );
        ensure!(
            lhs_dims.len() == 2 && rhs_dims.len() == 2,
            "matmul operands must be rank 2, got {lhs_dims:?} and {rhs_dims:?}"
        );
        ensure!(
            lhs_dims[1] == rhs_dims[0],
            "matmul inner dimensions differ ({} vs {})",
            lhs_dims[1],
            rhs_dims[0]
        );
        let lhs_handle = self.value_type_handle(lhs)?;
        let out_ty = self
            .module
            .unique_type_with_new_shape(lhs_handle, vec![lhs_dims[0], rhs_dims[1]]);
        let id = self.add_node(name, NodeKind::MatMul { lhs, rhs }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    /// Sums away the leading batch axis.
    pub fn create_batched_reduce_add(
        &mut self,
        name: &str,
        batch: NodeValue,
    ) -> Result<NodeValue> {
        let dims = self.dims(batch)?;
        ensure!(!dims.is_empty(), "batched reduce requires a ranked input");
        let handle = self.value_type_handle(batch)?;
        let out_ty = self
            .module
            .unique_type_with_new_shape(handle, dims[1..].to_vec());
        let id = self.add_node(name, NodeKind::BatchedReduceAdd { batch }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    /// Adds `sample` to every slice of `batch` along the leading axis.
    pub fn create_batched_add(
        &mut self,
        name: &str,
        batch: NodeValue,
        sample: NodeValue,
    ) -> Result<NodeValue> {
        let batch_dims = self.dims(batch)?;
        let sample_dims = self.dims(sample)?;
        ensure!(
            batch_dims.len() >= 2,
            "batched add requires a batch of rank >= 2"
        );
        ensure!(
            batch_dims[1..] == sample_dims[..],
            "sample shape {sample_dims:?} must match one batch slice {:?}",
            &batch_dims[1..]
        );
        let ty = self.value_type_handle(batch)?;
        let id = self.add_node(name, NodeKind::BatchedAdd { batch, sample }, vec![ty]);
        Ok(NodeValue::node(id))
    }

    // --- outputs and profiling ---

    /// Routes `input` into a fresh Public Variable named after `name` and
    /// returns that Variable.
    pub fn create_save(&mut self, name: &str, input: NodeValue) -> Result<VarId> {
        let ty = self.value_type_handle(input)?;
        let dest = self
            .module
            .create_variable(ty, name, Visibility::Public, TrainKind::None);
        let node_name = format!("_save_{name}");
        self.add_node(
            &node_name,
            NodeKind::Save {
                input,
                dest: dest.into(),
            },
            Vec::new(),
        );
        Ok(dest)
    }

    /// Routes `input` into an existing Variable.
    pub fn create_save_to(
        &mut self,
        name: &str,
        input: NodeValue,
        dest: VarId,
    ) -> Result<NodeId> {
        let in_ty = self.value_type_handle(input)?;
        let dest_ty = self
            .module
            .variable(dest)
            .map(|v| v.ty())
            .ok_or_else(|| anyhow!("save destination variable is not in the module"))?;
        ensure!(
            in_ty == dest_ty,
            "save destination type does not match the input type"
        );
        Ok(self.add_node(
            name,
            NodeKind::Save {
                input,
                dest: dest.into(),
            },
            Vec::new(),
        ))
    }

    /// Attaches a histogram-collecting profile node to `input`, allocating
    /// its backing Variables.
    pub fn create_quantization_profile(
        &mut self,
        name: &str,
        input: NodeValue,
    ) -> Result<NodeId> {
        ensure!(
            self.elem(input)? == ElemKind::Float,
            "quantization profiles observe float tensors"
        );
        let profiled_name = self.producer_name(input)?;
        let histogram = self.module.create_variable_of(
            ElemKind::Float,
            vec![HISTOGRAM_BUCKETS],
            "histogram",
            Visibility::Private,
            TrainKind::None,
        );
        // Min seen so far on the first position, max on the second.
        let computation_info = self.module.create_variable_of(
            ElemKind::Float,
            vec![2],
            "computationInfo",
            Visibility::Private,
            TrainKind::None,
        );
        Ok(self.add_node(
            name,
            NodeKind::QuantizationProfile {
                input,
                histogram: histogram.into(),
                computation_info: computation_info.into(),
                profiled_name,
            },
            Vec::new(),
        ))
    }

    // --- selection and indexing ---

    /// Keeps the `k` largest entries along the trailing axis, producing a
    /// value tensor and an index tensor of the same shape.
    pub fn create_topk(&mut self, name: &str, input: NodeValue, k: usize) -> Result<TopKValues> {
        let dims = self.dims(input)?;
        ensure!(!dims.is_empty(), "top-k requires a ranked input");
        let last = *dims.last().expect("rank checked above");
        ensure!(
            k > 0 && k <= last,
            "top-k of {k} is invalid for a trailing dimension of {last}"
        );
        let mut out_dims = dims;
        *out_dims.last_mut().expect("rank checked above") = k;

        let in_handle = self.value_type_handle(input)?;
        let values_ty = self
            .module
            .unique_type_with_new_shape(in_handle, out_dims.clone());
        let indices_ty = self.module.unique_type(Type::new(ElemKind::Index, out_dims));
        let id = self.add_node(name, NodeKind::TopK { input, k }, vec![values_ty, indices_ty]);
        Ok(TopKValues {
            values: NodeValue::new(Origin::Node(id), 0),
            indices: NodeValue::new(Origin::Node(id), 1),
        })
    }

    /// Gathers slices of `data` addressed by `indices`:
    /// `indices.dims ++ data.dims[1..]`.
    pub fn create_gather(
        &mut self,
        name: &str,
        data: NodeValue,
        indices: NodeValue,
    ) -> Result<NodeValue> {
        let data_dims = self.dims(data)?;
        ensure!(!data_dims.is_empty(), "gather requires a ranked data input");
        ensure!(
            self.elem(indices)? == ElemKind::Index,
            "gather indices must be of the index kind"
        );
        let mut out_dims = self.dims(indices)?;
        out_dims.extend_from_slice(&data_dims[1..]);
        let data_handle = self.value_type_handle(data)?;
        let out_ty = self.module.unique_type_with_new_shape(data_handle, out_dims);
        let id = self.add_node(name, NodeKind::Gather { data, indices }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    // --- quantization ---

    /// Converts a float tensor into the quantized type `out_ty`.
    pub fn create_quantize(
        &mut self,
        name: &str,
        input: NodeValue,
        out_ty: TypeHandle,
    ) -> Result<NodeValue> {
        ensure!(
            self.elem(input)? == ElemKind::Float,
            "quantize input must be a plain float tensor"
        );
        let out = self.module.ty(out_ty);
        ensure!(
            out.elem() == ElemKind::Int8Q,
            "quantize output must be an 8-bit quantized type"
        );
        let out_dims = out.dims().to_vec();
        let in_dims = self.dims(input)?;
        ensure!(
            in_dims == out_dims,
            "quantize must preserve the shape ({in_dims:?} vs {out_dims:?})"
        );
        let id = self.add_node(name, NodeKind::Quantize { input }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    /// Converts a quantized tensor back to floats.
    pub fn create_dequantize(&mut self, name: &str, input: NodeValue) -> Result<NodeValue> {
        ensure!(
            self.elem(input)? == ElemKind::Int8Q,
            "dequantize input must be an 8-bit quantized tensor"
        );
        let dims = self.dims(input)?;
        let out_ty = self.module.unique_type(Type::new(ElemKind::Float, dims));
        let id = self.add_node(name, NodeKind::Dequantize { input }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }

    /// Re-expresses a quantized tensor under the scale and offset of
    /// `out_ty` without changing its shape.
    pub fn create_rescale_quantized(
        &mut self,
        name: &str,
        input: NodeValue,
        out_ty: TypeHandle,
    ) -> Result<NodeValue> {
        ensure!(
            self.elem(input)? == ElemKind::Int8Q,
            "rescale input must be an 8-bit quantized tensor"
        );
        let out = self.module.ty(out_ty);
        ensure!(
            out.elem() == ElemKind::Int8Q,
            "rescale output must be an 8-bit quantized type"
        );
        let out_dims = out.dims().to_vec();
        let in_dims = self.dims(input)?;
        ensure!(
            in_dims == out_dims,
            "rescale must preserve the shape ({in_dims:?} vs {out_dims:?})"
        );
        let id = self.add_node(name, NodeKind::RescaleQuantized { input }, vec![out_ty]);
        Ok(NodeValue::node(id))
    }
}

/// NHWC view over a rank-4 dimension list.
pub(crate) struct ShapeNhwc {
    pub n: usize,
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

impl ShapeNhwc {
    pub(crate) fn from_dims(dims: &[usize]) -> Result<Self> {
        if let [n, h, w, c] = *dims {
            Ok(ShapeNhwc { n, h, w, c })
        } else {
            bail!("expected an NHWC tensor of rank 4, got {dims:?}")
        }
    }
}

/// Spatial output extent of a convolution-style window:
/// `floor((dim + 2*pad - kernel) / stride) + 1` per axis.
pub(crate) fn conv_output_dims(
    h: usize,
    w: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> (usize, usize) {
    let out_h = (h + 2 * pad - kernel) / stride + 1;
    let out_w = (w + 2 * pad - kernel) / stride + 1;
    (out_h, out_w)
}

/// Splits dims into (leading, product-of-trailing).
pub(crate) fn flatten_cdr(dims: &[usize]) -> Result<(usize, usize)> {
    match dims.split_first() {
        Some((first, rest)) if !rest.is_empty() => Ok((*first, rest.iter().product())),
        _ => bail!("expected a tensor of rank >= 2, got {dims:?}"),
    }
}

/// True when `a` and `b` agree on every dimension except `axis`.
pub(crate) fn same_dims_except(a: &[usize], b: &[usize], axis: usize) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .enumerate()
            .all(|(idx, (x, y))| idx == axis || x == y)
}
