//! Post-hoc structural verification of a Function against its Module.
//!
//! Verification is a development-time invariant check, not input
//! validation: any violation means a bug in the code that mutated the
//! graph. Checks run in a fixed order and stop at the first violation,
//! reporting the conflicting entities.

use std::collections::HashMap;

use thiserror::Error;

use crate::graph::function::{Function, FunctionId};
use crate::graph::module::Module;
use crate::graph::node::{Node, NodeKind, NodeValue, Origin};
use crate::graph::variable::Visibility;
use crate::types::{ElemKind, TypeHandle};

/// A structural invariant violation, carrying the entities in conflict.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(
        "variable name '{name}' conflicts with a previous definition: \
         {second} vs {first}"
    )]
    DuplicateVariableName {
        name: String,
        first: String,
        second: String,
    },
    #[error(
        "node name '{name}' in function '{function}' conflicts with a \
         previous definition: {second} vs {first}"
    )]
    DuplicateNodeName {
        function: String,
        name: String,
        first: String,
        second: String,
    },
    #[error(
        "input '{slot}' of node '{node}' in function '{function}' references \
         an entity that is part of neither the function nor its module"
    )]
    DanglingEdge {
        function: String,
        node: String,
        slot: String,
    },
    #[error("node '{node}' in function '{function}' is malformed: {reason}")]
    MalformedNode {
        function: String,
        node: String,
        reason: String,
    },
}

/// Verifies one Function and the Variables of its owning Module.
///
/// Order: (1) Variable names unique in the Module, (2) Node names unique in
/// the Function, (3) every input edge resolves to a live Node of the same
/// Function or a live Variable of the Module, (4) kind-local
/// well-formedness of every Node.
pub fn verify_function(module: &Module, func: FunctionId) -> Result<(), VerifyError> {
    let Some(function) = module.function(func) else {
        return Ok(());
    };

    // (1) and (2) share one namespace, so a node shadowing a variable is
    // also rejected.
    let mut names: HashMap<&str, String> = HashMap::new();
    for (_, var) in module.variables() {
        let vis = match var.visibility() {
            Visibility::Public => "public",
            Visibility::Private => "private",
        };
        let desc = format!("%{} : {} {}", var.name(), module.ty(var.ty()), vis);
        if let Some(first) = names.insert(var.name(), desc.clone()) {
            return Err(VerifyError::DuplicateVariableName {
                name: var.name().to_string(),
                first,
                second: desc,
            });
        }
    }
    for (_, node) in function.nodes() {
        let desc = module.node_desc(function, node);
        if let Some(first) = names.insert(node.name(), desc.clone()) {
            return Err(VerifyError::DuplicateNodeName {
                function: function.name().to_string(),
                name: node.name().to_string(),
                first,
                second: desc,
            });
        }
    }

    // (3) every edge resolves inside this function/module pair.
    for (_, node) in function.nodes() {
        for (idx, value) in node.inputs().iter().enumerate() {
            if resolve_handle(module, function, *value).is_none() {
                return Err(VerifyError::DanglingEdge {
                    function: function.name().to_string(),
                    node: node.name().to_string(),
                    slot: node.input_name(idx),
                });
            }
        }
    }

    // (4) kind-local well-formedness.
    for (_, node) in function.nodes() {
        if let Err(reason) = verify_node(module, function, node) {
            return Err(VerifyError::MalformedNode {
                function: function.name().to_string(),
                node: node.name().to_string(),
                reason,
            });
        }
    }

    Ok(())
}

/// Resolves the type handle behind an edge, or `None` if the producer is
/// missing or the result slot is out of range.
fn resolve_handle(module: &Module, function: &Function, value: NodeValue) -> Option<TypeHandle> {
    match value.origin {
        Origin::Node(id) => function.node(id)?.results().get(value.result).copied(),
        Origin::Var(id) => {
            if value.result != 0 {
                return None;
            }
            module.variable(id).map(|v| v.ty())
        }
    }
}

fn dims_of(module: &Module, function: &Function, value: NodeValue) -> Option<Vec<usize>> {
    let handle = resolve_handle(module, function, value)?;
    Some(module.ty(handle).dims().to_vec())
}

fn elem_of(module: &Module, function: &Function, value: NodeValue) -> Option<ElemKind> {
    let handle = resolve_handle(module, function, value)?;
    Some(module.ty(handle).elem())
}

/// Kind-local checks. Edges were resolved by check (3), so an unresolvable
/// operand here is simply skipped. The match is exhaustive: a new operator
/// kind must state its local invariants before this compiles.
fn verify_node(module: &Module, function: &Function, node: &Node) -> Result<(), String> {
    macro_rules! get {
        ($expr:expr) => {
            match $expr {
                Some(v) => v,
                None => return Ok(()),
            }
        };
    }

    let result_dims = |idx: usize| -> Option<Vec<usize>> {
        node.results()
            .get(idx)
            .map(|h| module.ty(*h).dims().to_vec())
    };
    let check = |cond: bool, reason: String| -> Result<(), String> {
        if cond {
            Ok(())
        } else {
            Err(reason)
        }
    };

    match node.kind() {
        NodeKind::Convolution {
            input,
            filter,
            bias,
            kernel,
            stride,
            pad,
            depth,
        } => {
            let in_dims = get!(dims_of(module, function, *input));
            check(in_dims.len() == 4, format!("conv input must be NHWC, got {in_dims:?}"))?;
            let (n, h, w, c) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
            let filter_dims = get!(dims_of(module, function, *filter));
            check(
                filter_dims == [*depth, *kernel, *kernel, c],
                format!("conv filter dims {filter_dims:?} disagree with the node parameters"),
            )?;
            let bias_dims = get!(dims_of(module, function, *bias));
            check(
                bias_dims.iter().product::<usize>() == *depth,
                format!("conv bias size {bias_dims:?} disagrees with depth {depth}"),
            )?;
            check(
                *stride > 0 && h + 2 * pad >= *kernel && w + 2 * pad >= *kernel,
                format!("conv window {kernel}x{kernel} does not fit a {h}x{w} input"),
            )?;
            let out_h = (h + 2 * pad - kernel) / stride + 1;
            let out_w = (w + 2 * pad - kernel) / stride + 1;
            let out = get!(result_dims(0));
            check(
                out == [n, out_h, out_w, *depth],
                format!("conv result dims {out:?} disagree with the inferred [{n}, {out_h}, {out_w}, {depth}]"),
            )
        }
        NodeKind::PoolMax {
            input,
            kernel,
            stride,
            pad,
        }
        | NodeKind::PoolAvg {
            input,
            kernel,
            stride,
            pad,
        } => {
            let in_dims = get!(dims_of(module, function, *input));
            check(in_dims.len() == 4, format!("pool input must be NHWC, got {in_dims:?}"))?;
            let (n, h, w, c) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
            check(
                *stride > 0 && h + 2 * pad >= *kernel && w + 2 * pad >= *kernel,
                format!("pool window {kernel}x{kernel} does not fit a {h}x{w} input"),
            )?;
            let out_h = (h + 2 * pad - kernel) / stride + 1;
            let out_w = (w + 2 * pad - kernel) / stride + 1;
            let out = get!(result_dims(0));
            check(
                out == [n, out_h, out_w, c],
                format!("pool result dims {out:?} disagree with the inferred [{n}, {out_h}, {out_w}, {c}]"),
            )
        }
        NodeKind::FullyConnected {
            input,
            weights,
            bias,
        } => {
            let in_dims = get!(dims_of(module, function, *input));
            check(in_dims.len() >= 2, format!("fc input must have rank >= 2, got {in_dims:?}"))?;
            let flat: usize = in_dims[1..].iter().product();
            let weight_dims = get!(dims_of(module, function, *weights));
            check(
                weight_dims.len() == 2 && weight_dims[0] == flat,
                format!("fc weights {weight_dims:?} disagree with the flattened input size {flat}"),
            )?;
            let bias_dims = get!(dims_of(module, function, *bias));
            let out_depth = bias_dims.iter().product::<usize>();
            check(
                weight_dims[1] == out_depth,
                format!("fc weights {weight_dims:?} disagree with the bias size {out_depth}"),
            )?;
            let out = get!(result_dims(0));
            check(
                out == [in_dims[0], out_depth],
                format!("fc result dims {out:?} disagree with [{}, {out_depth}]", in_dims[0]),
            )
        }
        NodeKind::Relu { input }
        | NodeKind::Sigmoid { input }
        | NodeKind::Tanh { input }
        | NodeKind::SoftMax { input, .. } => {
            let in_handle = get!(resolve_handle(module, function, *input));
            check(
                node.results().first() == Some(&in_handle),
                "activation must preserve the input type".to_string(),
            )
        }
        NodeKind::CrossEntropyLoss { .. } => {
            let out = get!(result_dims(0));
            check(out == [1], format!("loss result must be [1], got {out:?}"))
        }
        NodeKind::Regression { input, expected } => {
            let in_dims = get!(dims_of(module, function, *input));
            let exp_dims = get!(dims_of(module, function, *expected));
            check(
                in_dims == exp_dims,
                format!("regression operand shapes differ: {in_dims:?} vs {exp_dims:?}"),
            )
        }
        NodeKind::Reshape { input, dims } => {
            let in_dims = get!(dims_of(module, function, *input));
            let out = get!(result_dims(0));
            check(&out == dims, format!("reshape result dims {out:?} disagree with {dims:?}"))?;
            check(
                in_dims.iter().product::<usize>() == out.iter().product::<usize>(),
                format!("reshape changes the element count: {in_dims:?} vs {out:?}"),
            )
        }
        NodeKind::Transpose { input, shuffle } => {
            let in_dims = get!(dims_of(module, function, *input));
            let mut seen = vec![false; in_dims.len()];
            for &axis in shuffle {
                if axis >= in_dims.len() || seen[axis] {
                    return Err(format!("shuffle {shuffle:?} is not a permutation"));
                }
                seen[axis] = true;
            }
            let expect: Vec<usize> = shuffle.iter().map(|&a| in_dims[a]).collect();
            let out = get!(result_dims(0));
            check(
                out == expect,
                format!("transpose result dims {out:?} disagree with {expect:?}"),
            )
        }
        NodeKind::Broadcast { input, shape, axis } => {
            let in_dims = get!(dims_of(module, function, *input));
            check(
                axis + in_dims.len() <= shape.len(),
                format!("broadcast axis {axis} is out of range for target {shape:?}"),
            )?;
            let out = get!(result_dims(0));
            check(
                &out == shape,
                format!("broadcast result dims {out:?} disagree with {shape:?}"),
            )
        }
        NodeKind::Concat { inputs, axis } => {
            if inputs.is_empty() {
                return Err("concat has no inputs".to_string());
            }
            let first = get!(dims_of(module, function, inputs[0]));
            check(*axis < first.len(), format!("concat axis {axis} out of range"))?;
            let mut sum = 0;
            for value in inputs {
                let dims = get!(dims_of(module, function, *value));
                check(
                    dims.len() == first.len()
                        && dims
                            .iter()
                            .zip(first.iter())
                            .enumerate()
                            .all(|(i, (a, b))| i == *axis || a == b),
                    format!("concat operand {dims:?} disagrees with {first:?} outside axis {axis}"),
                )?;
                sum += dims[*axis];
            }
            let mut expect = first;
            expect[*axis] = sum;
            let out = get!(result_dims(0));
            check(
                out == expect,
                format!("concat result dims {out:?} disagree with {expect:?}"),
            )
        }
        NodeKind::Slice { input, begin } => {
            let in_dims = get!(dims_of(module, function, *input));
            let out = get!(result_dims(0));
            check(
                begin.len() == in_dims.len() && out.len() == in_dims.len(),
                format!("slice ranks disagree: begin {begin:?}, input {in_dims:?}"),
            )?;
            check(
                begin
                    .iter()
                    .zip(out.iter())
                    .zip(in_dims.iter())
                    .all(|((b, o), d)| b + o <= *d),
                format!("slice window {begin:?}+{out:?} exceeds the input {in_dims:?}"),
            )
        }
        NodeKind::BatchNormalization {
            input,
            gamma,
            beta,
            mean,
            variance,
            channel_idx,
            ..
        } => {
            let in_dims = get!(dims_of(module, function, *input));
            check(
                *channel_idx < in_dims.len(),
                format!("channel axis {channel_idx} out of range for {in_dims:?}"),
            )?;
            let channels = in_dims[*channel_idx];
            for (slot, value) in [
                ("gamma", gamma),
                ("beta", beta),
                ("mean", mean),
                ("variance", variance),
            ] {
                let dims = get!(dims_of(module, function, *value));
                check(
                    dims.iter().product::<usize>() == channels,
                    format!("{slot} size {dims:?} disagrees with {channels} channels"),
                )?;
            }
            let in_handle = get!(resolve_handle(module, function, *input));
            check(
                node.results().first() == Some(&in_handle),
                "batch normalization must preserve the input type".to_string(),
            )
        }
        NodeKind::LocalResponseNormalization { input, scale, .. } => {
            let in_dims = get!(dims_of(module, function, *input));
            let channels = *get!(in_dims.last());
            let scale_dims = get!(dims_of(module, function, *scale));
            check(
                scale_dims.iter().product::<usize>() == channels,
                format!("scale size {scale_dims:?} disagrees with {channels} channels"),
            )?;
            let in_handle = get!(resolve_handle(module, function, *input));
            check(
                node.results().first() == Some(&in_handle),
                "local response normalization must preserve the input type".to_string(),
            )
        }
        NodeKind::Add { lhs, rhs }
        | NodeKind::Mul { lhs, rhs }
        | NodeKind::Sub { lhs, rhs }
        | NodeKind::Div { lhs, rhs }
        | NodeKind::Max { lhs, rhs }
        | NodeKind::Min { lhs, rhs }
        | NodeKind::CmpLte { lhs, rhs } => {
            let lhs_dims = get!(dims_of(module, function, *lhs));
            let rhs_dims = get!(dims_of(module, function, *rhs));
            check(
                lhs_dims == rhs_dims,
                format!("operand shapes differ: {lhs_dims:?} vs {rhs_dims:?}"),
            )?;
            let out = get!(result_dims(0));
            check(
                out == lhs_dims,
                format!("result dims {out:?} disagree with the operands {lhs_dims:?}"),
            )
        }
        NodeKind::Pow { base, .. } => {
            let base_handle = get!(resolve_handle(module, function, *base));
            check(
                node.results().first() == Some(&base_handle),
                "pow must preserve the base type".to_string(),
            )
        }
        NodeKind::Select { cond, lhs, rhs } => {
            let lhs_dims = get!(dims_of(module, function, *lhs));
            let rhs_dims = get!(dims_of(module, function, *rhs));
            let cond_dims = get!(dims_of(module, function, *cond));
            check(
                lhs_dims == rhs_dims && cond_dims == rhs_dims,
                format!("select shapes differ: cond {cond_dims:?}, {lhs_dims:?} vs {rhs_dims:?}"),
            )
        }
        NodeKind::Splat { .. } => check(
            node.num_results() == 1,
            "splat must carry exactly one result".to_string(),
        ),
        NodeKind::MatMul { lhs, rhs } => {
            let lhs_dims = get!(dims_of(module, function, *lhs));
            let rhs_dims = get!(dims_of(module, function, *rhs));
            check(
                lhs_dims.len() == 2 && rhs_dims.len() == 2 && lhs_dims[1] == rhs_dims[0],
                format!("matmul operands disagree: {lhs_dims:?} x {rhs_dims:?}"),
            )?;
            let out = get!(result_dims(0));
            check(
                out == [lhs_dims[0], rhs_dims[1]],
                format!("matmul result dims {out:?} disagree with [{}, {}]", lhs_dims[0], rhs_dims[1]),
            )
        }
        NodeKind::BatchedReduceAdd { batch } => {
            let batch_dims = get!(dims_of(module, function, *batch));
            let out = get!(result_dims(0));
            check(
                !batch_dims.is_empty() && out == batch_dims[1..],
                format!("reduce result dims {out:?} disagree with the batch {batch_dims:?}"),
            )
        }
        NodeKind::BatchedAdd { batch, sample } => {
            let batch_dims = get!(dims_of(module, function, *batch));
            let sample_dims = get!(dims_of(module, function, *sample));
            check(
                batch_dims.len() >= 2 && batch_dims[1..] == sample_dims[..],
                format!("sample {sample_dims:?} disagrees with one batch slice of {batch_dims:?}"),
            )
        }
        NodeKind::Save { input, dest } => {
            check(
                matches!(dest.origin, Origin::Var(_)),
                "save destination must be a variable".to_string(),
            )?;
            let in_handle = get!(resolve_handle(module, function, *input));
            let dest_handle = get!(resolve_handle(module, function, *dest));
            check(
                in_handle == dest_handle,
                "save destination type disagrees with the input type".to_string(),
            )
        }
        NodeKind::QuantizationProfile { input, .. } => {
            let elem = get!(elem_of(module, function, *input));
            check(
                elem == ElemKind::Float,
                format!("profiles observe float tensors, got {}", elem.name()),
            )
        }
        NodeKind::TopK { input, k } => {
            let in_dims = get!(dims_of(module, function, *input));
            let last = *get!(in_dims.last());
            check(*k <= last, format!("k={k} exceeds the trailing dimension {last}"))?;
            let mut expect = in_dims;
            *expect.last_mut().expect("rank checked above") = *k;
            let values = get!(result_dims(0));
            let indices = get!(result_dims(1));
            check(
                values == expect && indices == expect,
                format!("top-k results {values:?}/{indices:?} disagree with {expect:?}"),
            )?;
            let indices_handle = get!(node.results().get(1));
            check(
                module.ty(*indices_handle).elem() == ElemKind::Index,
                "top-k indices must be of the index kind".to_string(),
            )
        }
        NodeKind::Gather { data, indices } => {
            let data_dims = get!(dims_of(module, function, *data));
            let mut expect = get!(dims_of(module, function, *indices));
            if data_dims.is_empty() {
                return Err("gather data must be ranked".to_string());
            }
            expect.extend_from_slice(&data_dims[1..]);
            let out = get!(result_dims(0));
            check(
                out == expect,
                format!("gather result dims {out:?} disagree with {expect:?}"),
            )
        }
        NodeKind::Quantize { input } => {
            let in_ty = get!(resolve_handle(module, function, *input));
            let out_ty = get!(node.results().first());
            let (in_ty, out_ty) = (module.ty(in_ty), module.ty(*out_ty));
            check(
                in_ty.elem() == ElemKind::Float && out_ty.elem() == ElemKind::Int8Q,
                "quantize must map float to i8q".to_string(),
            )?;
            check(
                in_ty.dims() == out_ty.dims(),
                "quantize must preserve the shape".to_string(),
            )
        }
        NodeKind::Dequantize { input } => {
            let in_ty = get!(resolve_handle(module, function, *input));
            let out_ty = get!(node.results().first());
            let (in_ty, out_ty) = (module.ty(in_ty), module.ty(*out_ty));
            check(
                in_ty.elem() == ElemKind::Int8Q && out_ty.elem() == ElemKind::Float,
                "dequantize must map i8q to float".to_string(),
            )?;
            check(
                in_ty.dims() == out_ty.dims(),
                "dequantize must preserve the shape".to_string(),
            )
        }
        NodeKind::RescaleQuantized { input } => {
            let in_ty = get!(resolve_handle(module, function, *input));
            let out_ty = get!(node.results().first());
            let (in_ty, out_ty) = (module.ty(in_ty), module.ty(*out_ty));
            check(
                in_ty.elem() == ElemKind::Int8Q && out_ty.elem() == ElemKind::Int8Q,
                "rescale must stay in i8q".to_string(),
            )?;
            check(
                in_ty.dims() == out_ty.dims(),
                "rescale must preserve the shape".to_string(),
            )
        }
    }
}
