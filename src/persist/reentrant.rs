//! Reentrant calls into a contract that is already on the call stack.
//!
//! [ReentrantGraph::capture] serializes everything reachable from the class statics into heap
//! extents numbered by visit order, remembers the original objects and static slots, and hands
//! the callee a fresh graph of stubs that load from those extents. The callee can never touch
//! the caller's objects directly.
//!
//! [ReentrantGraph::commit] serializes the callee's graph back (a callee stub keeps the number of
//! the original it was made from, new objects get numbers past the captured ones), decodes every
//! record against the caller's objects, and only then writes the results into them. Metering
//! happens before anything is written, so a failed commit leaves the caller's objects as they
//! were and the graph can only be reverted. [ReentrantGraph::revert] puts the original static
//! slots back.

use std::collections::hash_map::HashMap;
use std::sync::{Arc, Weak};

use bitvec::prelude::*;
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use super::class::{ClassRef, ClassRegistry};
use super::constants::ConstantTable;
use super::extent::Extent;
use super::fee::SharedFees;
use super::graph::{
    resolve_in, GraphReader, GraphWriter, IdPolicy, NodeResolver, Visit,
    VisitOrder,
};
use super::object::{
    IdentityTable, InstanceLoader, ObjectData, ObjectRef, PersistenceToken,
    Value,
};
use super::PersistError;
use crate::common::InstanceId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Active,
    CommitFailed,
    Committed,
    Reverted,
}

pub struct ReentrantGraph {
    classes: Arc<ClassRegistry>,
    constants: Arc<ConstantTable>,
    fees: SharedFees,
    /// static slots of every class at capture, in load order
    checkpoint: Vec<Vec<Value>>,
    /// caller objects, `originals[id - 1]`
    originals: Vec<ObjectRef>,
    captured: Vec<Extent>,
    callee: Mutex<IdentityTable>,
    phase: Mutex<Phase>,
    me: Weak<ReentrantGraph>,
}

struct CalleeResolver<'a> {
    graph: &'a ReentrantGraph,
}

impl<'a> NodeResolver for CalleeResolver<'a> {
    fn resolve(
        &mut self, class: &ClassRef, id: InstanceId,
    ) -> Result<ObjectRef, PersistError> {
        if id < 1 || id as usize > self.graph.originals.len() {
            return Err(PersistError::MissingInstance(id))
        }
        let loader: Weak<dyn InstanceLoader> = self.graph.me.clone();
        let mut table = self.graph.callee.lock();
        resolve_in(&mut table, class, id, || {
            ObjectRef::heap_stub(class, PersistenceToken::new(id, loader))
        })
    }
}

/// Numbering of the callee graph on commit.
struct CommitPolicy {
    callee: HashMap<ObjectRef, InstanceId>,
    /// captured ids already queued
    visited: BitVec,
    fresh: Vec<ObjectRef>,
    fresh_ids: HashMap<ObjectRef, InstanceId>,
}

impl IdPolicy for CommitPolicy {
    fn id_for(
        &mut self, obj: &ObjectRef,
    ) -> Result<(InstanceId, Visit), PersistError> {
        if let Some(&id) = self.callee.get(obj) {
            let i = id as usize - 1;
            // a stub the callee never loaded still matches its original
            if self.visited[i] || !obj.is_loaded() {
                return Ok((id, Visit::Skip))
            }
            self.visited.set(i, true);
            return Ok((id, Visit::Enqueue))
        }
        if let Some(&id) = self.fresh_ids.get(obj) {
            return Ok((id, Visit::Skip))
        }
        self.fresh.push(obj.clone());
        let id = (self.visited.len() + self.fresh.len()) as InstanceId;
        self.fresh_ids.insert(obj.clone(), id);
        Ok((id, Visit::Enqueue))
    }
}

/// Maps commit numbering back onto caller objects.
struct CommitResolver<'a> {
    originals: &'a [ObjectRef],
    fresh: &'a [ObjectRef],
}

impl<'a> CommitResolver<'a> {
    fn target(&self, id: InstanceId) -> Result<&'a ObjectRef, PersistError> {
        let n = self.originals.len();
        let i = (id as usize).wrapping_sub(1);
        if i < n {
            Ok(&self.originals[i])
        } else {
            self.fresh
                .get(i - n)
                .ok_or(PersistError::MissingInstance(id))
        }
    }
}

impl<'a> NodeResolver for CommitResolver<'a> {
    fn resolve(
        &mut self, class: &ClassRef, id: InstanceId,
    ) -> Result<ObjectRef, PersistError> {
        let o = self.target(id)?;
        if o.class().name() != class.name() {
            return Err(PersistError::IdentityViolation(id))
        }
        Ok(o.clone())
    }
}

/// Everything a successful commit writes, decoded up front.
struct Apply {
    statics: Vec<Vec<Value>>,
    objects: Vec<(ObjectRef, ObjectData)>,
    written: usize,
}

impl ReentrantGraph {
    /// Snapshot the graph reachable from the statics of `classes` and swap the statics for a
    /// callee view made of stubs.
    pub fn capture(
        classes: &Arc<ClassRegistry>, constants: &Arc<ConstantTable>,
        fees: &SharedFees,
    ) -> Result<Arc<Self>, PersistError> {
        let order = classes.load_order();
        let checkpoint: Vec<_> = order.iter().map(|c| c.statics()).collect();
        let mut writer = GraphWriter::new(VisitOrder::new(), constants);
        let mut statics = Vec::with_capacity(order.len());
        for class in order {
            let e = writer.serialize_statics(class)?;
            fees.lock().write_static_data_to_heap(e.encoded_len())?;
            statics.push(e);
        }
        let mut captured = Vec::new();
        while let Some((id, obj)) = writer.next_queued() {
            debug_assert_eq!(id as usize, captured.len() + 1);
            let e = writer.serialize_instance(&obj)?;
            fees.lock().write_one_instance_to_heap(e.encoded_len())?;
            captured.push(e);
        }
        let originals = writer.into_policy().into_objects();
        debug!("capture: {} objects", originals.len());

        let graph = Arc::new_cyclic(|me| Self {
            classes: classes.clone(),
            constants: constants.clone(),
            fees: fees.clone(),
            checkpoint,
            originals,
            captured,
            callee: Mutex::new(IdentityTable::new()),
            phase: Mutex::new(Phase::Active),
            me: me.clone(),
        });
        let reader = GraphReader::new(classes, constants);
        let mut callee_statics = Vec::with_capacity(order.len());
        for (class, e) in order.iter().zip(statics.iter()) {
            fees.lock().read_static_data_from_heap(e.encoded_len())?;
            callee_statics.push(reader.deserialize_statics(
                class,
                e,
                &mut CalleeResolver { graph: &graph },
            )?);
        }
        for (class, values) in order.iter().zip(callee_statics) {
            class.replace_statics(values)
        }
        Ok(graph)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Number of caller objects captured.
    pub fn captured_len(&self) -> usize {
        self.originals.len()
    }

    pub fn commit(&self) -> Result<(), PersistError> {
        if self.phase() != Phase::Active {
            return Err(PersistError::InvalidState(
                "commit of a graph that is not active",
            ))
        }
        let apply = match self.prepare_commit() {
            Ok(a) => a,
            Err(e) => {
                *self.phase.lock() = Phase::CommitFailed;
                return Err(e)
            }
        };
        for (class, values) in self.classes.load_order().iter().zip(apply.statics)
        {
            class.replace_statics(values)
        }
        let (written, fresh) =
            (apply.written, apply.objects.len() - apply.written);
        for (target, data) in apply.objects {
            target.replace_data(data)
        }
        self.callee.lock().clear();
        *self.phase.lock() = Phase::Committed;
        debug!("commit: {} objects written back, {} new", written, fresh);
        Ok(())
    }

    fn prepare_commit(&self) -> Result<Apply, PersistError> {
        let n = self.originals.len();
        let callee =
            self.callee.lock().iter().map(|(id, o)| (o, id)).collect();
        let policy = CommitPolicy {
            callee,
            visited: bitvec![0; n],
            fresh: Vec::new(),
            fresh_ids: HashMap::new(),
        };
        let order = self.classes.load_order();
        let mut writer = GraphWriter::new(policy, &self.constants);
        let mut statics = Vec::with_capacity(order.len());
        for class in order {
            let e = writer.serialize_statics(class)?;
            self.fees.lock().write_static_data_to_heap(e.encoded_len())?;
            statics.push(e);
        }
        let mut records = Vec::new();
        while let Some((id, obj)) = writer.next_queued() {
            let e = writer.serialize_instance(&obj)?;
            self.fees.lock().write_one_instance_to_heap(e.encoded_len())?;
            records.push((id, e));
        }
        let policy = writer.into_policy();

        let reader = GraphReader::new(&self.classes, &self.constants);
        let mut resolver = CommitResolver {
            originals: &self.originals,
            fresh: &policy.fresh,
        };
        let mut apply = Apply {
            statics: Vec::with_capacity(order.len()),
            objects: Vec::with_capacity(records.len()),
            written: policy.visited.count_ones(),
        };
        for (class, e) in order.iter().zip(statics.iter()) {
            self.fees.lock().read_static_data_from_heap(e.encoded_len())?;
            apply
                .statics
                .push(reader.deserialize_statics(class, e, &mut resolver)?);
        }
        for (id, e) in records {
            let target = resolver.target(id)?.clone();
            self.fees.lock().read_one_instance_from_heap(e.encoded_len())?;
            let data =
                reader.deserialize_instance(target.class(), &e, &mut resolver)?;
            apply.objects.push((target, data));
        }
        Ok(apply)
    }

    /// Put the caller's static slots back. Legal while active or after a failed commit.
    pub fn revert(&self) -> Result<(), PersistError> {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Active | Phase::CommitFailed => (),
            _ => {
                return Err(PersistError::InvalidState(
                    "revert of a finished graph",
                ))
            }
        }
        for (class, values) in
            self.classes.load_order().iter().zip(self.checkpoint.iter())
        {
            class.replace_statics(values.clone())
        }
        self.callee.lock().clear();
        *phase = Phase::Reverted;
        debug!("revert: {} objects discarded", self.originals.len());
        Ok(())
    }
}

impl InstanceLoader for ReentrantGraph {
    fn load_instance(
        &self, id: InstanceId, class: &ClassRef,
    ) -> Result<ObjectData, PersistError> {
        if *self.phase.lock() != Phase::Active {
            return Err(PersistError::DetachedStub(id))
        }
        let extent = (id as usize)
            .checked_sub(1)
            .and_then(|i| self.captured.get(i))
            .ok_or(PersistError::MissingInstance(id))?;
        self.fees.lock().read_one_instance_from_heap(extent.encoded_len())?;
        let reader = GraphReader::new(&self.classes, &self.constants);
        reader.deserialize_instance(class, extent, &mut CalleeResolver { graph: self })
    }
}

/// Handle to the innermost capture of a [CheckpointStack]. It is consumed by a successful
/// commit or by a revert.
#[derive(Debug)]
pub struct Checkpoint {
    depth: usize,
}

impl Checkpoint {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// A commit that did not go through. The checkpoint comes back so that it can be reverted.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CommitFailure {
    pub checkpoint: Checkpoint,
    pub error: PersistError,
}

/// The captures of nested reentrant calls, innermost last.
pub struct CheckpointStack {
    frames: Vec<Arc<ReentrantGraph>>,
    max_depth: usize,
}

impl CheckpointStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn capture(
        &mut self, classes: &Arc<ClassRegistry>,
        constants: &Arc<ConstantTable>, fees: &SharedFees,
    ) -> Result<Checkpoint, PersistError> {
        if self.frames.len() >= self.max_depth {
            return Err(PersistError::InvalidState(
                "reentrant call depth exceeded",
            ))
        }
        let g = ReentrantGraph::capture(classes, constants, fees)?;
        self.frames.push(g);
        Ok(Checkpoint {
            depth: self.frames.len(),
        })
    }

    fn top(&self, cp: &Checkpoint) -> Result<&Arc<ReentrantGraph>, PersistError> {
        match self.frames.last() {
            Some(g) if cp.depth == self.frames.len() => Ok(g),
            _ => Err(PersistError::InvalidState(
                "checkpoint is not the innermost one",
            )),
        }
    }

    pub fn commit(&mut self, cp: Checkpoint) -> Result<(), CommitFailure> {
        let r = self.top(&cp).and_then(|g| g.commit());
        match r {
            Ok(()) => {
                self.frames.pop();
                Ok(())
            }
            Err(error) => Err(CommitFailure {
                checkpoint: cp,
                error,
            }),
        }
    }

    pub fn revert(&mut self, cp: Checkpoint) -> Result<(), PersistError> {
        self.top(&cp)?.revert()?;
        self.frames.pop();
        Ok(())
    }

    /// Revert every open capture, innermost first.
    pub fn revert_all(&mut self) -> Result<(), PersistError> {
        while let Some(g) = self.frames.pop() {
            g.revert()?
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::persist::class::{ClassDecl, FieldKind};
    use crate::persist::fee::{NullFees, ResourceExhausted, StorageFeeProcessor};

    fn registry() -> Arc<ClassRegistry> {
        Arc::new(
            ClassRegistry::from_decls(&[ClassDecl::new("Node")
                .field("value", FieldKind::Int)
                .field("next", FieldKind::Reference)
                .static_field("root", FieldKind::Reference)
                .static_field("count", FieldKind::Int)])
            .unwrap(),
        )
    }

    struct Setup {
        classes: Arc<ClassRegistry>,
        node: ClassRef,
        a: ObjectRef,
        b: ObjectRef,
    }

    fn setup() -> Setup {
        let classes = registry();
        let node = classes.resolve("Node").unwrap();
        let a = ObjectRef::new(&node, 1);
        let b = ObjectRef::new(&node, 2);
        a.set_field("value", Value::Int(1)).unwrap();
        a.set_field("next", Value::object(&b)).unwrap();
        b.set_field("value", Value::Int(2)).unwrap();
        node.set_static(node.static_field("root").unwrap(), Value::object(&a))
            .unwrap();
        node.set_static(node.static_field("count").unwrap(), Value::Int(7))
            .unwrap();
        Setup { classes, node, a, b }
    }

    /// Statics and every reachable instance, encoded in visit order.
    fn image(classes: &ClassRegistry) -> Vec<u8> {
        let constants = ConstantTable::new();
        let mut w = GraphWriter::new(VisitOrder::new(), &constants);
        let mut out = Vec::new();
        for class in classes.load_order() {
            out.extend(w.serialize_statics(class).unwrap().encode());
        }
        while let Some((_, o)) = w.next_queued() {
            out.extend(w.serialize_instance(&o).unwrap().encode());
        }
        out
    }

    fn root(node: &ClassRef) -> ObjectRef {
        node.get_static(node.static_field("root").unwrap())
            .unwrap()
            .as_object()
            .unwrap()
            .clone()
    }

    /// Callee body: bump `root.value`, splice a new node after the root, bump the counter.
    fn mutate(node: &ClassRef) -> ObjectRef {
        let r = root(node);
        assert_eq!(r.get_field("value").unwrap(), Value::Int(1));
        r.set_field("value", Value::Int(10)).unwrap();
        let c = ObjectRef::new(node, 3);
        c.set_field("value", Value::Int(3)).unwrap();
        c.set_field("next", r.get_field("next").unwrap()).unwrap();
        r.set_field("next", Value::object(&c)).unwrap();
        node.set_static(node.static_field("count").unwrap(), Value::Int(8))
            .unwrap();
        c
    }

    #[test]
    fn test_commit_writes_back_into_originals() {
        let s = setup();
        let g = ReentrantGraph::capture(
            &s.classes,
            &ConstantTable::empty(),
            &NullFees::shared(),
        )
        .unwrap();
        assert_eq!(g.captured_len(), 2);
        let stub = root(&s.node);
        assert_ne!(stub, s.a);
        assert!(!stub.is_loaded());
        let c = mutate(&s.node);
        // the caller's objects are untouched while the callee runs
        assert_eq!(s.a.get_field("value").unwrap(), Value::Int(1));

        g.commit().unwrap();
        assert_eq!(g.phase(), Phase::Committed);
        assert_eq!(root(&s.node), s.a);
        assert_eq!(s.a.get_field("value").unwrap(), Value::Int(10));
        assert_eq!(s.a.get_field("next").unwrap(), Value::object(&c));
        assert_eq!(c.get_field("next").unwrap(), Value::object(&s.b));
        assert_eq!(s.b.get_field("value").unwrap(), Value::Int(2));
        assert_eq!(
            s.node
                .get_static(s.node.static_field("count").unwrap())
                .unwrap(),
            Value::Int(8)
        );
        assert_eq!(s.a.hash_code().unwrap(), 1);
        assert!(matches!(g.commit(), Err(PersistError::InvalidState(_))));
    }

    #[test]
    fn test_revert_restores_statics() {
        let s = setup();
        let before = image(&s.classes);
        let g = ReentrantGraph::capture(
            &s.classes,
            &ConstantTable::empty(),
            &NullFees::shared(),
        )
        .unwrap();
        mutate(&s.node);
        g.revert().unwrap();
        assert_eq!(root(&s.node), s.a);
        assert_eq!(s.a.get_field("value").unwrap(), Value::Int(1));
        assert_eq!(s.a.get_field("next").unwrap(), Value::object(&s.b));
        assert_eq!(
            s.node
                .get_static(s.node.static_field("count").unwrap())
                .unwrap(),
            Value::Int(7)
        );
        assert_eq!(image(&s.classes), before);
        assert!(g.revert().is_err());
    }

    struct Tripwire(Arc<AtomicBool>);

    impl Tripwire {
        fn check(&self) -> Result<(), ResourceExhausted> {
            if self.0.load(Ordering::SeqCst) {
                Err(ResourceExhausted)
            } else {
                Ok(())
            }
        }
    }

    impl StorageFeeProcessor for Tripwire {
        fn read_static_data_from_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            Ok(())
        }
        fn write_static_data_to_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            Ok(())
        }
        fn read_one_instance_from_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            Ok(())
        }
        fn write_one_instance_to_storage(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            Ok(())
        }
        fn read_static_data_from_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            Ok(())
        }
        fn write_static_data_to_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            Ok(())
        }
        fn read_one_instance_from_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            Ok(())
        }
        fn write_one_instance_to_heap(&mut self, _: usize) -> Result<(), ResourceExhausted> {
            self.check()
        }
    }

    #[test]
    fn test_failed_commit_only_reverts() {
        let s = setup();
        let before = image(&s.classes);
        let armed = Arc::new(AtomicBool::new(false));
        let fees: SharedFees =
            Arc::new(Mutex::new(Tripwire(armed.clone())));
        let g = ReentrantGraph::capture(&s.classes, &ConstantTable::empty(), &fees)
            .unwrap();
        mutate(&s.node);
        armed.store(true, Ordering::SeqCst);
        assert!(matches!(
            g.commit(),
            Err(PersistError::ResourceExhausted(_))
        ));
        assert_eq!(g.phase(), Phase::CommitFailed);
        assert_eq!(s.a.get_field("value").unwrap(), Value::Int(1));
        assert!(matches!(g.commit(), Err(PersistError::InvalidState(_))));
        g.revert().unwrap();
        assert_eq!(root(&s.node), s.a);
        assert_eq!(
            s.node
                .get_static(s.node.static_field("count").unwrap())
                .unwrap(),
            Value::Int(7)
        );
        // same records, ids and hash codes as before the capture
        assert_eq!(image(&s.classes), before);
    }

    #[test]
    fn test_stack_is_lifo() {
        let s = setup();
        let constants = ConstantTable::empty();
        let fees = NullFees::shared();
        let mut stack = CheckpointStack::new(2);
        let outer = stack.capture(&s.classes, &constants, &fees).unwrap();
        let inner = stack.capture(&s.classes, &constants, &fees).unwrap();
        assert!(matches!(
            stack.capture(&s.classes, &constants, &fees),
            Err(PersistError::InvalidState(_))
        ));
        assert_eq!((outer.depth(), inner.depth()), (1, 2));
        let outer = match stack.commit(outer) {
            Err(CommitFailure {
                checkpoint,
                error: PersistError::InvalidState(_),
            }) => checkpoint,
            r => panic!("unexpected {:?}", r),
        };
        mutate(&s.node);
        stack.commit(inner).unwrap();
        stack.revert(outer).unwrap();
        assert_eq!(stack.depth(), 0);
        assert_eq!(root(&s.node), s.a);
        assert_eq!(s.a.get_field("value").unwrap(), Value::Int(1));
    }
}
