use nngraph::{
    ElemKind, Module, NodeValue, TrainKind, Type, VarId, Visibility,
};

fn float_var(module: &mut Module, dims: &[usize], name: &str) -> VarId {
    module.create_variable_of(
        ElemKind::Float,
        dims.to_vec(),
        name,
        Visibility::Public,
        TrainKind::None,
    )
}

#[test]
fn conv_infers_the_spatial_output_shape() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[1, 32, 32, 3], "input");

    let mut gb = module.builder(f);
    let conv = gb
        .create_conv("conv", NodeValue::var(x), 16, 5, 1, 0)
        .expect("valid convolution");
    drop(gb);

    let out = module.value_type(f, conv).unwrap();
    assert_eq!(out.dims(), &[1, 28, 28, 16]);
    assert_eq!(out.elem(), ElemKind::Float);
    module.verify().expect("builder output verifies");
}

#[test]
fn conv_allocates_filter_and_bias_variables() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[1, 32, 32, 3], "input");

    let mut gb = module.builder(f);
    gb.create_conv("conv", NodeValue::var(x), 16, 5, 1, 0)
        .expect("valid convolution");
    drop(gb);

    let (_, filter) = module
        .variables()
        .find(|(_, v)| v.name().starts_with("filter"))
        .expect("conv allocates a filter");
    assert_eq!(module.ty(filter.ty()).dims(), &[16, 5, 5, 3]);
    assert_eq!(filter.visibility(), Visibility::Private);
    assert_eq!(filter.train_kind(), TrainKind::Xavier { fan_in: 75.0 });
    let bound = (3.0f32 / 75.0).sqrt();
    assert!(filter.payload().data().iter().all(|v| v.abs() <= bound));

    let (_, bias) = module
        .variables()
        .find(|(_, v)| v.name().starts_with("bias"))
        .expect("conv allocates a bias");
    assert_eq!(module.ty(bias.ty()).dims(), &[16]);
    assert_eq!(bias.train_kind(), TrainKind::Broadcast { value: 0.1 });
    assert!(bias.payload().data().iter().all(|v| (v - 0.1).abs() < 1e-6));
}

#[test]
fn conv_rejects_a_kernel_larger_than_the_input() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[1, 4, 4, 3], "input");
    let mut gb = module.builder(f);
    assert!(gb.create_conv("conv", NodeValue::var(x), 8, 5, 1, 0).is_err());
}

#[test]
fn pooling_keeps_channels_and_shrinks_spatial_dims() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 28, 28, 16], "input");

    let mut gb = module.builder(f);
    let pool = gb
        .create_pool_max("pool", NodeValue::var(x), 2, 2, 0)
        .expect("valid pooling");
    let avg = gb
        .create_pool_avg("pool_avg", pool, 2, 2, 0)
        .expect("pool output feeds pooling");
    drop(gb);

    assert_eq!(module.value_type(f, pool).unwrap().dims(), &[2, 14, 14, 16]);
    assert_eq!(module.value_type(f, avg).unwrap().dims(), &[2, 7, 7, 16]);
    module.verify().expect("builder output verifies");
}

#[test]
fn fully_connected_flattens_trailing_dims_and_allocates_parameters() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 5, 2], "input");

    let mut gb = module.builder(f);
    let fc = gb
        .create_fully_connected("fc", NodeValue::var(x), 4)
        .expect("valid fully connected");
    drop(gb);

    assert_eq!(module.value_type(f, fc).unwrap().dims(), &[2, 4]);
    let (_, weights) = module
        .variables()
        .find(|(_, v)| v.name().starts_with("weights"))
        .expect("fc allocates weights");
    assert_eq!(module.ty(weights.ty()).dims(), &[10, 4]);
    assert_eq!(weights.train_kind(), TrainKind::Xavier { fan_in: 10.0 });
    module.verify().expect("builder output verifies");
}

#[test]
fn fully_connected_with_checks_the_weight_rows() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 10], "input");
    let w_bad = float_var(&mut module, &[9, 4], "w");
    let w_ok = float_var(&mut module, &[10, 4], "w");
    let b = float_var(&mut module, &[4], "b");

    let mut gb = module.builder(f);
    assert!(gb
        .create_fully_connected_with("fc", NodeValue::var(x), w_bad.into(), b.into())
        .is_err());
    let fc = gb
        .create_fully_connected_with("fc", NodeValue::var(x), w_ok.into(), b.into())
        .expect("matching weights");
    drop(gb);
    assert_eq!(module.value_type(f, fc).unwrap().dims(), &[2, 4]);
}

#[test]
fn slice_produces_the_window_extent() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[4, 4], "input");

    let mut gb = module.builder(f);
    let s = gb
        .create_slice("slice", NodeValue::var(x), vec![1, 1], vec![3, 3])
        .expect("in-range slice");
    assert!(gb
        .create_slice("slice", NodeValue::var(x), vec![1, 1], vec![3, 5])
        .is_err());
    assert!(gb
        .create_slice("slice", NodeValue::var(x), vec![2, 2], vec![2, 3])
        .is_err());
    drop(gb);

    assert_eq!(module.value_type(f, s).unwrap().dims(), &[2, 2]);
    module.verify().expect("builder output verifies");
}

#[test]
fn concat_sums_the_chosen_axis() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let a = float_var(&mut module, &[2, 3], "a");
    let b = float_var(&mut module, &[2, 3], "b");
    let c = float_var(&mut module, &[2, 4], "c");

    let mut gb = module.builder(f);
    let rows = gb
        .create_concat("cat", &[a.into(), b.into()], 0)
        .expect("matching shapes");
    let cols = gb
        .create_concat("cat", &[a.into(), b.into()], 1)
        .expect("matching shapes");
    assert!(gb.create_concat("cat", &[a.into(), c.into()], 0).is_err());
    drop(gb);

    assert_eq!(module.value_type(f, rows).unwrap().dims(), &[4, 3]);
    assert_eq!(module.value_type(f, cols).unwrap().dims(), &[2, 6]);
}

#[test]
fn matmul_takes_rows_by_columns() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let a = float_var(&mut module, &[2, 5], "a");
    let b = float_var(&mut module, &[5, 7], "b");
    let c = float_var(&mut module, &[6, 7], "c");

    let mut gb = module.builder(f);
    let mm = gb
        .create_matmul("mm", a.into(), b.into())
        .expect("inner dims match");
    assert!(gb.create_matmul("mm", a.into(), c.into()).is_err());
    drop(gb);

    assert_eq!(module.value_type(f, mm).unwrap().dims(), &[2, 7]);
    module.verify().expect("builder output verifies");
}

#[test]
fn transpose_reorders_axes_and_rejects_non_permutations() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 3, 4], "x");

    let mut gb = module.builder(f);
    let t = gb
        .create_transpose("t", NodeValue::var(x), vec![2, 0, 1])
        .expect("valid shuffle");
    assert!(gb
        .create_transpose("t", NodeValue::var(x), vec![0, 0, 1])
        .is_err());
    drop(gb);

    assert_eq!(module.value_type(f, t).unwrap().dims(), &[4, 2, 3]);
}

#[test]
fn reshape_preserves_the_element_count() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 6], "x");

    let mut gb = module.builder(f);
    let r = gb
        .create_reshape("r", NodeValue::var(x), vec![3, 4])
        .expect("same element count");
    assert!(gb.create_reshape("r", NodeValue::var(x), vec![3, 5]).is_err());
    drop(gb);

    assert_eq!(module.value_type(f, r).unwrap().dims(), &[3, 4]);
}

#[test]
fn topk_replaces_the_trailing_dim_and_yields_index_positions() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 10], "x");

    let mut gb = module.builder(f);
    let topk = gb.create_topk("topk", NodeValue::var(x), 3).expect("k fits");
    assert!(gb.create_topk("topk", NodeValue::var(x), 11).is_err());
    drop(gb);

    let values = module.value_type(f, topk.values).unwrap();
    let indices = module.value_type(f, topk.indices).unwrap();
    assert_eq!(values.dims(), &[2, 3]);
    assert_eq!(indices.dims(), &[2, 3]);
    assert_eq!(values.elem(), ElemKind::Float);
    assert_eq!(indices.elem(), ElemKind::Index);
    module.verify().expect("builder output verifies");
}

#[test]
fn gather_prepends_the_index_shape() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let data = float_var(&mut module, &[4, 6], "data");
    let indices = module.create_variable_of(
        ElemKind::Index,
        vec![2, 3],
        "idx",
        Visibility::Public,
        TrainKind::None,
    );

    let mut gb = module.builder(f);
    let g = gb
        .create_gather("g", data.into(), indices.into())
        .expect("index input");
    assert!(gb.create_gather("g", data.into(), data.into()).is_err());
    drop(gb);

    assert_eq!(module.value_type(f, g).unwrap().dims(), &[2, 3, 6]);
}

#[test]
fn quantization_transitions_element_kinds_without_reshaping() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 2], "x");
    let q_ty = module.unique_type(Type::quantized(ElemKind::Int8Q, vec![2, 2], 0.5, 0));
    let r_ty = module.unique_type(Type::quantized(ElemKind::Int8Q, vec![2, 2], 0.25, 1));

    let mut gb = module.builder(f);
    let q = gb
        .create_quantize("q", NodeValue::var(x), q_ty)
        .expect("float to i8q");
    let rescaled = gb
        .create_rescale_quantized("rs", q, r_ty)
        .expect("i8q to i8q");
    let back = gb.create_dequantize("dq", rescaled).expect("i8q to float");
    // Quantizing an already-quantized tensor is malformed.
    assert!(gb.create_quantize("q", q, q_ty).is_err());
    drop(gb);

    assert_eq!(module.value_type(f, q).unwrap().elem(), ElemKind::Int8Q);
    assert_eq!(
        module.value_type(f, rescaled).unwrap().quant().unwrap().scale,
        0.25
    );
    let back_ty = module.value_type(f, back).unwrap();
    assert_eq!(back_ty.elem(), ElemKind::Float);
    assert_eq!(back_ty.dims(), &[2, 2]);
    module.verify().expect("builder output verifies");
}

#[test]
fn batch_normalization_allocates_per_channel_parameters() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[1, 10, 10, 3], "x");

    let mut gb = module.builder(f);
    let bn = gb
        .create_batch_normalization("bn", NodeValue::var(x), 3, 1e-5, 0.9)
        .expect("valid channel axis");
    assert!(gb
        .create_batch_normalization("bn", NodeValue::var(x), 7, 1e-5, 0.9)
        .is_err());
    drop(gb);

    assert_eq!(module.value_type(f, bn).unwrap().dims(), &[1, 10, 10, 3]);
    for prefix in ["beta", "gamma", "mean", "variance"] {
        let (_, var) = module
            .variables()
            .find(|(_, v)| v.name().starts_with(prefix))
            .unwrap_or_else(|| panic!("batch normalization allocates {prefix}"));
        assert_eq!(module.ty(var.ty()).dims(), &[3]);
        assert_eq!(var.visibility(), Visibility::Private);
    }
    let (_, gamma) = module
        .variables()
        .find(|(_, v)| v.name().starts_with("gamma"))
        .unwrap();
    assert!(gamma.payload().data().iter().all(|v| (v - 1.0).abs() < 1e-6));
    module.verify().expect("builder output verifies");
}

#[test]
fn elementwise_arithmetic_requires_matching_shapes() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let a = float_var(&mut module, &[2, 3], "a");
    let b = float_var(&mut module, &[2, 3], "b");
    let c = float_var(&mut module, &[3, 2], "c");

    let mut gb = module.builder(f);
    let sum = gb.create_add("sum", a.into(), b.into()).expect("same shape");
    let prod = gb.create_mul("prod", sum, b.into()).expect("same shape");
    assert!(gb.create_sub("diff", a.into(), c.into()).is_err());
    let cmp = gb
        .create_cmp_lte("cmp", prod, b.into())
        .expect("same shape");
    drop(gb);

    assert_eq!(module.value_type(f, cmp).unwrap().dims(), &[2, 3]);
    module.verify().expect("builder output verifies");
}

#[test]
fn save_routes_into_a_public_variable() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[2, 2], "x");

    let mut gb = module.builder(f);
    let relu = gb.create_relu("relu", NodeValue::var(x)).expect("unary op");
    let out = gb.create_save("out", relu).expect("save allocates its target");
    drop(gb);

    let dest = module.variable(out).expect("destination variable exists");
    assert_eq!(dest.visibility(), Visibility::Public);
    assert_eq!(module.ty(dest.ty()).dims(), &[2, 2]);
    let (_, save_node) = module
        .function(f)
        .unwrap()
        .nodes()
        .find(|(_, n)| n.kind_name() == "Save")
        .expect("a save node was appended");
    assert!(save_node.name().starts_with("_save_out"));
    module.verify().expect("builder output verifies");
}

#[test]
fn batched_ops_follow_the_leading_axis() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let batch = float_var(&mut module, &[8, 3, 3], "batch");
    let sample = float_var(&mut module, &[3, 3], "sample");

    let mut gb = module.builder(f);
    let reduced = gb
        .create_batched_reduce_add("sum", NodeValue::var(batch))
        .expect("ranked batch");
    let shifted = gb
        .create_batched_add("shift", batch.into(), sample.into())
        .expect("sample matches a slice");
    assert!(gb
        .create_batched_add("shift", sample.into(), batch.into())
        .is_err());
    drop(gb);

    assert_eq!(module.value_type(f, reduced).unwrap().dims(), &[3, 3]);
    assert_eq!(module.value_type(f, shifted).unwrap().dims(), &[8, 3, 3]);
}

#[test]
fn local_response_normalization_preserves_shape_and_allocates_scale() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = float_var(&mut module, &[1, 8, 8, 4], "x");

    let mut gb = module.builder(f);
    let lrn = gb
        .create_local_response_normalization("lrn", NodeValue::var(x), 2, 1e-4, 0.75, 2.0)
        .expect("ranked input");
    drop(gb);

    assert_eq!(module.value_type(f, lrn).unwrap().dims(), &[1, 8, 8, 4]);
    let (_, scale) = module
        .variables()
        .find(|(_, v)| v.name().starts_with("scale"))
        .expect("lrn allocates its scale");
    assert_eq!(module.ty(scale.ty()).dims(), &[4]);
    module.verify().expect("builder output verifies");
}
