use std::collections::hash_map::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use rand::prelude::*;

use qavm::common::{Addr, InstanceId};
use qavm::dapp::LoadedDApp;
use qavm::kernel::{self, Kernel, SharedKernel};
use qavm::params::instance_key;
use qavm::persist::class::{ClassDecl, ClassRef, ClassRegistry, FieldKind};
use qavm::persist::constants::ConstantTable;
use qavm::persist::extent::Reference;
use qavm::persist::fee::NullFees;
use qavm::persist::graph::{
    resolve_in, GraphReader, GraphWriter, NodeResolver, VisitOrder,
};
use qavm::persist::object::{IdentityTable, ObjectRef, Value};
use qavm::persist::PersistError;
use qavm_tools::dummy::DummyKernel;
use qavm_tools::fixtures;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Resolves every id to one fresh object per id.
struct Session(IdentityTable);

impl NodeResolver for Session {
    fn resolve(
        &mut self, class: &ClassRef, id: InstanceId,
    ) -> Result<ObjectRef, PersistError> {
        resolve_in(&mut self.0, class, id, || ObjectRef::new(class, 0))
    }
}

fn pair_registry() -> ClassRegistry {
    ClassRegistry::from_decls(&[
        ClassDecl::new("Leaf").field("v", FieldKind::Int),
        ClassDecl::new("Pair")
            .field("tag", FieldKind::Short)
            .field("left", FieldKind::Reference)
            .field("right", FieldKind::Reference),
    ])
    .unwrap()
}

#[test]
fn test_identity_convergence() {
    init();
    let reg = pair_registry();
    let (leaf, pair) = (reg.resolve("Leaf").unwrap(), reg.resolve("Pair").unwrap());
    let shared = ObjectRef::new(&leaf, 7);
    let a = ObjectRef::new(&pair, 1);
    let b = ObjectRef::new(&pair, 2);
    a.set_field("left", Value::object(&shared)).unwrap();
    b.set_field("right", Value::object(&shared)).unwrap();

    let constants = ConstantTable::new();
    let mut w = GraphWriter::new(VisitOrder::new(), &constants);
    let ea = w.serialize_instance(&a).unwrap();
    let eb = w.serialize_instance(&b).unwrap();
    let id = match &ea.references()[0] {
        Reference::Regular { instance_id, .. } => *instance_id,
        r => panic!("unexpected {:?}", r),
    };
    assert_eq!(ea.references()[1], Reference::Null);
    assert_eq!(eb.references()[1], Reference::regular("Leaf", id));
    // the shared leaf is queued once
    assert!(w.next_queued().is_some());
    assert!(w.next_queued().is_none());

    let reader = GraphReader::new(&reg, &constants);
    let mut session = Session(IdentityTable::new());
    let da = reader.deserialize_instance(&pair, &ea, &mut session).unwrap();
    let db = reader.deserialize_instance(&pair, &eb, &mut session).unwrap();
    let (l, r) = (&da.slots[1], &db.slots[2]);
    assert!(l.as_object().unwrap().ptr_eq(r.as_object().unwrap()));
    assert_eq!(l, r);
}

#[test]
fn test_divergence_distinctness() {
    let reg = pair_registry();
    let pair = reg.resolve("Pair").unwrap();
    let a = ObjectRef::new(&pair, 1);
    let b = ObjectRef::new(&pair, 2);
    a.set_field("tag", Value::Short(10)).unwrap();
    b.set_field("tag", Value::Short(-10)).unwrap();
    let constants = ConstantTable::new();
    let mut w = GraphWriter::new(VisitOrder::new(), &constants);
    let ea = w.serialize_instance(&a).unwrap();
    let eb = w.serialize_instance(&b).unwrap();
    assert_eq!(ea.references(), eb.references());
    assert_eq!(ea.primitives().len(), eb.primitives().len());
    assert_ne!(ea.primitives(), eb.primitives());
    assert_ne!(ea.primitives()[..4], eb.primitives()[..4]);
    assert_eq!(ea.encoded_len(), eb.encoded_len());
}

#[test]
fn test_superclass_fields_stored_once() {
    let reg = fixtures::shapes().registry().unwrap();
    let circle = reg.resolve("Circle").unwrap();
    assert_eq!(circle.instance_fields().len(), 5);
    let c = ObjectRef::new(&circle, 3);
    let shape_id = circle.declared_field("Shape", "id").unwrap();
    c.set(shape_id, Value::Long(-1)).unwrap();
    c.set_field("id", Value::Int(2)).unwrap();
    c.set_field("radius", Value::Double(f64::from_bits(0x7ff8_0000_0000_0001)))
        .unwrap();

    let constants = ConstantTable::new();
    let mut w = GraphWriter::new(VisitOrder::new(), &constants);
    let e = w.serialize_instance(&c).unwrap();
    // hash code, Shape(id: long, visible: boolean), Circle(id: int, radius: double)
    assert_eq!(e.primitives().len(), 4 + (8 + 1) + (4 + 8));
    assert_eq!(e.references(), &[Reference::Null]);

    let reader = GraphReader::new(&reg, &constants);
    let data = reader
        .deserialize_instance(&circle, &e, &mut Session(IdentityTable::new()))
        .unwrap();
    assert_eq!(data.hash_code, 3);
    assert_eq!(data.slots[0], Value::Long(-1));
    assert_eq!(data.slots[2], Value::Int(2));
    // NaN payloads survive
    assert_eq!(data.slots[3], Value::Double(f64::from_bits(0x7ff8_0000_0000_0001)));
}

fn fresh(
    kernel: &SharedKernel, code: &qavm::code::DAppCode,
) -> LoadedDApp {
    LoadedDApp::new(
        Addr::from(1),
        kernel.clone(),
        code,
        ConstantTable::empty(),
        NullFees::shared(),
    )
    .unwrap()
}

fn reload(
    kernel: &SharedKernel, code: &qavm::code::DAppCode,
) -> LoadedDApp {
    let root = kernel.read().get_object_graph(&Addr::from(1)).unwrap();
    LoadedDApp::load(
        Addr::from(1),
        kernel.clone(),
        code,
        ConstantTable::empty(),
        NullFees::shared(),
        &root,
    )
    .unwrap()
}

#[test]
fn test_lazy_load() {
    init();
    let kernel = kernel::shared(DummyKernel::new());
    let code = fixtures::linked_list();
    let d = fresh(&kernel, &code);
    let mut head = Value::null();
    for i in 0..20 {
        let n = d.new_object("Node").unwrap();
        n.set_field("value", Value::Int(i)).unwrap();
        n.set_field("next", head).unwrap();
        head = Value::object(&n);
    }
    d.set_static("List", "head", head).unwrap();
    d.save().unwrap();
    drop(d);

    let d = reload(&kernel, &code);
    let head = d.get_static("List", "head").unwrap();
    let head = head.as_object().unwrap().clone();
    assert!(!head.is_loaded());
    assert_eq!(head.storage_id(), Some(1));
    let next = head.get_field("next").unwrap();
    let next = next.as_object().unwrap().clone();
    assert!(head.is_loaded());
    assert!(!next.is_loaded());
    assert_eq!(next.stub_id(), Some(2));
    assert_eq!(head.get_field("value").unwrap(), Value::Int(19));
    // loading is idempotent
    next.ensure_loaded().unwrap();
    next.ensure_loaded().unwrap();
    assert_eq!(next.get_field("value").unwrap(), Value::Int(18));

    // a record that went missing only fails when it is reached
    let third = next.get_field("next").unwrap();
    kernel
        .write()
        .put_storage(&Addr::from(1), &instance_key(3), vec![0, 0].into());
    assert!(third.as_object().unwrap().get_field("value").is_err());
}

#[test]
fn test_random_graph_roundtrip() {
    init();
    let code = qavm::code::DAppCode::new(vec![
        ClassDecl::new("N")
            .field("v", FieldKind::Long)
            .field("f", FieldKind::Float)
            .field("a", FieldKind::Reference)
            .field("b", FieldKind::Reference),
        ClassDecl::new("Root").static_field("all", FieldKind::Reference),
    ]);
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..8 {
        let kernel = kernel::shared(DummyKernel::new());
        let d = fresh(&kernel, &code);
        let n = rng.gen_range(1..60);
        let nodes: Vec<_> = (0..n).map(|_| d.new_object("N").unwrap()).collect();
        for o in nodes.iter() {
            o.set_field("v", Value::Long(rng.gen())).unwrap();
            o.set_field("f", Value::Float(f32::from_bits(rng.gen()))).unwrap();
            for f in ["a", "b"] {
                if rng.gen_bool(0.7) {
                    let t = &nodes[rng.gen_range(0..n)];
                    o.set_field(f, Value::object(t)).unwrap();
                }
            }
        }
        // only some nodes are roots, the rest have to be reached through edges
        let roots: Vec<_> = nodes.iter().filter(|_| rng.gen_bool(0.3)).collect();
        let all = d.new_array("[LN;", roots.len()).unwrap();
        for (i, r) in roots.iter().enumerate() {
            all.set_element(i, Value::object(r)).unwrap();
        }
        d.set_static("Root", "all", Value::object(&all)).unwrap();
        d.save().unwrap();

        let d2 = reload(&kernel, &code);
        let all2 = d2.get_static("Root", "all").unwrap();
        let all2 = all2.as_object().unwrap().clone();
        assert_eq!(all2.array_len().unwrap(), roots.len(), "round {}", round);

        // walk both graphs side by side; the mapping must be a bijection
        let mut map: HashMap<ObjectRef, ObjectRef> = HashMap::new();
        let mut back: HashMap<ObjectRef, ObjectRef> = HashMap::new();
        let mut queue = VecDeque::new();
        for (i, r) in roots.iter().enumerate() {
            let r2 = all2.get_element(i).unwrap();
            queue.push_back(((*r).clone(), r2.as_object().unwrap().clone()));
        }
        while let Some((x, y)) = queue.pop_front() {
            if let Some(prev) = map.get(&x) {
                assert!(prev.ptr_eq(&y));
                continue
            }
            assert!(back.insert(y.clone(), x.clone()).is_none());
            map.insert(x.clone(), y.clone());
            assert_eq!(x.hash_code().unwrap(), y.hash_code().unwrap());
            for f in ["v", "f"] {
                assert_eq!(x.get_field(f).unwrap(), y.get_field(f).unwrap());
            }
            for f in ["a", "b"] {
                match (x.get_field(f).unwrap(), y.get_field(f).unwrap()) {
                    (vx, vy) if vx.is_null() => assert!(vy.is_null()),
                    (vx, vy) => queue.push_back((
                        vx.as_object().unwrap().clone(),
                        vy.as_object().unwrap().clone(),
                    )),
                }
            }
        }
    }
}

#[test]
fn test_class_object_and_constant_references() {
    init();
    let code = fixtures::shapes();
    let kernel = kernel::shared(DummyKernel::new());
    let reg = Arc::new(code.registry().unwrap());
    let point = reg.resolve("Point").unwrap();
    let mut constants = ConstantTable::new();
    let origin = ObjectRef::new(&point, 0);
    constants.register(-1, origin.clone()).unwrap();
    let constants = Arc::new(constants);

    let d = LoadedDApp::new(
        Addr::from(1),
        kernel.clone(),
        &code,
        constants.clone(),
        NullFees::shared(),
    )
    .unwrap();
    let shapes = d.new_array("[LShape;", 2).unwrap();
    let c = d.new_object("Circle").unwrap();
    c.set_field("center", Value::object(&origin)).unwrap();
    shapes.set_element(0, Value::object(&c)).unwrap();
    d.set_static("Canvas", "shapes", Value::object(&shapes)).unwrap();
    d.set_static("Canvas", "origin", Value::class(&point)).unwrap();
    let root = d.save().unwrap();
    // the constant itself is never written
    assert!(kernel
        .read()
        .get_storage(&Addr::from(1), &instance_key(3))
        .is_none());

    let d2 = LoadedDApp::load(
        Addr::from(1),
        kernel.clone(),
        &code,
        constants,
        NullFees::shared(),
        &root,
    )
    .unwrap();
    assert_eq!(
        d2.get_static("Canvas", "origin").unwrap(),
        Value::class(&d2.class("Point").unwrap())
    );
    let shapes = d2.get_static("Canvas", "shapes").unwrap();
    let c2 = shapes.as_object().unwrap().get_element(0).unwrap();
    let center = c2.as_object().unwrap().get_field("center").unwrap();
    assert!(center.as_object().unwrap().ptr_eq(&origin));
}
