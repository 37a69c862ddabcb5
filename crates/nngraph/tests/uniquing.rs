use std::collections::HashSet;

use nngraph::{ElemKind, Module, NodeValue, TrainKind, Type, Visibility};

#[test]
fn unique_type_returns_identical_handles_for_equal_types() {
    let mut module = Module::new();
    let a = module.unique_type(Type::new(ElemKind::Float, vec![1, 32, 32, 3]));
    let b = module.unique_type(Type::new(ElemKind::Float, vec![1, 32, 32, 3]));
    let c = module.unique_type(Type::new(ElemKind::Float, vec![1, 32, 32, 4]));
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn unique_type_with_new_shape_keeps_quantization() {
    let mut module = Module::new();
    let q = module.unique_type(Type::quantized(ElemKind::Int8Q, vec![8, 8], 0.5, -2));
    let reshaped = module.unique_type_with_new_shape(q, vec![64]);
    let ty = module.ty(reshaped);
    assert_eq!(ty.elem(), ElemKind::Int8Q);
    assert_eq!(ty.dims(), &[64]);
    let quant = ty.quant().expect("quantized type keeps its parameters");
    assert_eq!(quant.scale, 0.5);
    assert_eq!(quant.offset, -2);
}

#[test]
fn void_type_is_canonical() {
    let mut module = Module::new();
    let a = module.void_type();
    let b = module.void_type();
    assert_eq!(a, b);
    assert!(module.ty(a).is_void());
}

#[test]
fn unique_name_never_repeats() {
    let mut module = Module::new();
    let mut seen = HashSet::new();
    for prefix in ["conv", "conv", "bias", "conv__7", "bias__7__x", "a"] {
        let name = module.unique_name(prefix);
        assert!(seen.insert(name.clone()), "name '{name}' repeated");
    }
}

#[test]
fn unique_name_strips_from_the_first_delimiter() {
    let mut module = Module::new();
    let first = module.unique_name("relu__4__tail");
    assert!(first.starts_with("relu__"));
    assert!(!first.contains("tail"));
    // Re-uniquing the produced name keeps the original stem.
    let second = module.unique_name(&first);
    assert!(second.starts_with("relu__"));
    assert_ne!(first, second);
}

#[test]
fn function_names_are_unique_within_a_module() {
    let mut module = Module::new();
    let main = module.create_function("main").expect("fresh name");
    assert!(module.create_function("main").is_err());
    assert_eq!(module.get_function("main"), Some(main));
    assert_eq!(module.get_function("other"), None);
}

#[test]
fn variables_get_uniqued_names() {
    let mut module = Module::new();
    let a = module.create_variable_of(
        ElemKind::Float,
        vec![4],
        "weights",
        Visibility::Private,
        TrainKind::None,
    );
    let b = module.create_variable_of(
        ElemKind::Float,
        vec![4],
        "weights",
        Visibility::Private,
        TrainKind::None,
    );
    let name_a = module.variable(a).unwrap().name().to_string();
    let name_b = module.variable(b).unwrap().name().to_string();
    assert_ne!(name_a, name_b);
    assert_eq!(module.get_variable_by_name(&name_a), Some(a));
}

#[test]
fn broadcast_init_fills_the_payload() {
    let mut module = Module::new();
    let v = module.create_variable_of(
        ElemKind::Float,
        vec![2, 3],
        "bias",
        Visibility::Private,
        TrainKind::Broadcast { value: 0.1 },
    );
    let payload = module.variable(v).unwrap().payload();
    assert_eq!(payload.len(), 6);
    assert!(payload.data().iter().all(|x| (x - 0.1).abs() < 1e-6));
}

#[test]
fn xavier_init_is_deterministic_per_seed() {
    let mut a = Module::with_seed(11);
    let mut b = Module::with_seed(11);
    let make = |module: &mut Module| {
        let v = module.create_variable_of(
            ElemKind::Float,
            vec![3, 3],
            "w",
            Visibility::Private,
            TrainKind::Xavier { fan_in: 9.0 },
        );
        module.variable(v).unwrap().payload().data().to_vec()
    };
    assert_eq!(make(&mut a), make(&mut b));
}

#[test]
fn ir_value_types_round_trip_through_serde() {
    let ty = Type::quantized(ElemKind::Int8Q, vec![2, 2], 0.25, 3);
    let json = serde_json::to_string(&ty).expect("serialize type");
    let back: Type = serde_json::from_str(&json).expect("deserialize type");
    assert_eq!(ty, back);

    let mut module = Module::new();
    let v = module.create_variable_of(
        ElemKind::Float,
        vec![1],
        "x",
        Visibility::Public,
        TrainKind::None,
    );
    let value = NodeValue::var(v);
    let json = serde_json::to_string(&value).expect("serialize edge");
    let back: NodeValue = serde_json::from_str(&json).expect("deserialize edge");
    assert_eq!(value, back);
}
