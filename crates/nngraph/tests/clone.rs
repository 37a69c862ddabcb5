use std::collections::HashMap;

use nngraph::{ElemKind, Module, NodeValue, Origin, TrainKind, VarId, Visibility};

fn build_net(module: &mut Module) -> (nngraph::FunctionId, VarId) {
    let f = module.create_function("main").unwrap();
    let x = module.create_variable_of(
        ElemKind::Float,
        vec![1, 8, 8, 3],
        "input",
        Visibility::Public,
        TrainKind::None,
    );
    let mut gb = module.builder(f);
    let conv = gb.create_conv("conv", NodeValue::var(x), 4, 3, 1, 0).unwrap();
    let relu = gb.create_relu("relu", conv).unwrap();
    gb.create_save("out", relu).unwrap();
    (f, x)
}

#[test]
fn clone_preserves_node_count_and_structure() {
    let mut module = Module::new();
    let (f, _) = build_net(&mut module);

    let mut mapping = HashMap::new();
    let clone = module
        .clone_function(f, "main_clone", Some(&mut mapping))
        .expect("fresh name");

    let source = module.function(f).unwrap();
    let cloned = module.function(clone).unwrap();
    assert_eq!(source.num_nodes(), cloned.num_nodes());
    assert_eq!(mapping.len(), source.num_nodes());

    for (old_id, new_id) in &mapping {
        let old = source.node(*old_id).expect("mapped source node");
        let new = cloned.node(*new_id).expect("mapped clone node");
        assert_eq!(old.kind_name(), new.kind_name());
        assert_eq!(old.name(), new.name());
        assert_eq!(old.results(), new.results());

        // Node edges point at the mapped copy; variable edges point at the
        // very same variable.
        for (old_in, new_in) in old.inputs().iter().zip(new.inputs().iter()) {
            assert_eq!(old_in.result, new_in.result);
            match (old_in.origin, new_in.origin) {
                (Origin::Node(a), Origin::Node(b)) => assert_eq!(mapping[&a], b),
                (Origin::Var(a), Origin::Var(b)) => assert_eq!(a, b),
                (a, b) => panic!("edge origin kind changed: {a:?} vs {b:?}"),
            }
        }
    }

    module.verify().expect("source and clone verify");
}

#[test]
fn clone_shares_variables_instead_of_duplicating_them() {
    let mut module = Module::new();
    let (f, x) = build_net(&mut module);
    let vars_before = module.variables().count();

    module.clone_function(f, "main_clone", None).expect("fresh name");

    assert_eq!(module.variables().count(), vars_before);
    // Mutating the shared input payload is visible through both functions.
    module
        .variable_mut(x)
        .unwrap()
        .payload_mut()
        .fill(2.5);
    assert!(module
        .variable(x)
        .unwrap()
        .payload()
        .data()
        .iter()
        .all(|v| (v - 2.5).abs() < 1e-6));
}

#[test]
fn clone_requires_an_unused_name_and_an_empty_mapping() {
    let mut module = Module::new();
    let (f, _) = build_net(&mut module);

    assert!(module.clone_function(f, "main", None).is_err());

    let mut mapping = HashMap::new();
    module
        .clone_function(f, "first_clone", Some(&mut mapping))
        .expect("fresh name");
    assert!(
        module
            .clone_function(f, "second_clone", Some(&mut mapping))
            .is_err(),
        "a pre-populated mapping must be rejected"
    );
}

#[test]
fn clone_skips_erased_slots() {
    let mut module = Module::new();
    let f = module.create_function("main").unwrap();
    let x = module.create_variable_of(
        ElemKind::Float,
        vec![4],
        "x",
        Visibility::Public,
        TrainKind::None,
    );
    let mut gb = module.builder(f);
    let relu = gb.create_relu("relu", NodeValue::var(x)).unwrap();
    gb.create_tanh("tanh", NodeValue::var(x)).unwrap();
    drop(gb);

    module.erase_node(f, relu.origin).expect("node exists");
    let clone = module
        .clone_function(f, "main_clone", None)
        .expect("fresh name");
    assert_eq!(module.function(clone).unwrap().num_nodes(), 1);
    module.verify().expect("clone of the trimmed graph verifies");
}
