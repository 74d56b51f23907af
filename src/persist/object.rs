//! Heap objects. An [Instance] is either a stub (an identity plus a one-shot token that knows
//! how to fetch its fields) or loaded. Any field access on a stub loads it first, so a program
//! can not tell the two apart.

use std::collections::hash_map::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::class::{
    ClassRef, ClassShape, FieldHandle, FieldKind, FieldPopulator, FieldSlots,
};
use super::PersistError;
use crate::common::InstanceId;

/// The target of a reference: a heap instance or a class object.
#[derive(Clone)]
pub enum Node {
    Object(ObjectRef),
    Class(ClassRef),
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Node::Object(a), Node::Object(b)) => a == b,
            (Node::Class(a), Node::Class(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Object(o) => o.fmt(f),
            Node::Class(c) => write!(f, "class {}", c.name()),
        }
    }
}

/// A field value. Floats compare by bit pattern and references by identity.
#[derive(Clone, Debug)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Ref(Option<Node>),
}

impl Value {
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Boolean(_) => FieldKind::Boolean,
            Value::Byte(_) => FieldKind::Byte,
            Value::Char(_) => FieldKind::Char,
            Value::Short(_) => FieldKind::Short,
            Value::Int(_) => FieldKind::Int,
            Value::Float(_) => FieldKind::Float,
            Value::Long(_) => FieldKind::Long,
            Value::Double(_) => FieldKind::Double,
            Value::Ref(_) => FieldKind::Reference,
        }
    }

    pub fn null() -> Self {
        Value::Ref(None)
    }

    pub fn object(o: &ObjectRef) -> Self {
        Value::Ref(Some(Node::Object(o.clone())))
    }

    pub fn class(c: &ClassRef) -> Self {
        Value::Ref(Some(Node::Class(c.clone())))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Ref(Some(Node::Object(o))) => Some(o),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Ref(None))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a == b,
            (Byte(a), Byte(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Short(a), Short(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Long(a), Long(b)) => a == b,
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Ref(a), Ref(b)) => a == b,
            _ => false,
        }
    }
}

/// Loaded state of an instance: its identity hash code and its slots (declared fields in
/// hierarchy order, or array elements).
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectData {
    pub hash_code: i32,
    pub slots: Vec<Value>,
}

/// Something that can materialize the fields of a stub on demand.
pub trait InstanceLoader: Send + Sync {
    fn load_instance(
        &self, id: InstanceId, class: &ClassRef,
    ) -> Result<ObjectData, PersistError>;
}

/// Lazy-load handle carried by a stub. It refers back to its loader weakly: a stub that
/// outlives the graph it came from can no longer be loaded.
#[derive(Clone)]
pub struct PersistenceToken {
    id: InstanceId,
    loader: Weak<dyn InstanceLoader>,
}

impl PersistenceToken {
    pub fn new(id: InstanceId, loader: Weak<dyn InstanceLoader>) -> Self {
        Self { id, loader }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }
}

enum InstanceState {
    Stub(PersistenceToken),
    Loaded(ObjectData),
}

pub struct Instance {
    class: ClassRef,
    /// storage id, assigned the first time the instance is persisted
    storage_id: OnceCell<InstanceId>,
    state: Mutex<InstanceState>,
}

/// Shared handle to an [Instance]. Equality and hashing follow identity.
#[derive(Clone)]
pub struct ObjectRef(Arc<Instance>);

impl ObjectRef {
    fn wrap(inst: Instance) -> Self {
        Self(Arc::new(inst))
    }

    /// A new loaded object with every field zeroed.
    pub fn new(class: &ClassRef, hash_code: i32) -> Self {
        let slots = class
            .instance_fields()
            .iter()
            .map(|f| f.kind.zero())
            .collect();
        Self::from_data(class, ObjectData { hash_code, slots })
    }

    pub fn new_array(
        class: &ClassRef, len: usize, hash_code: i32,
    ) -> Result<Self, PersistError> {
        let kind = class.element_kind().ok_or_else(|| {
            PersistError::TypeMismatch(format!(
                "`{}` is not an array class",
                class.name()
            ))
        })?;
        Ok(Self::from_data(
            class,
            ObjectData {
                hash_code,
                slots: vec![kind.zero(); len],
            },
        ))
    }

    pub(crate) fn from_data(class: &ClassRef, data: ObjectData) -> Self {
        Self::wrap(Instance {
            class: class.clone(),
            storage_id: OnceCell::new(),
            state: Mutex::new(InstanceState::Loaded(data)),
        })
    }

    /// A stub of a persisted instance, identified by its storage id.
    pub(crate) fn stored_stub(
        class: &ClassRef, id: InstanceId, loader: Weak<dyn InstanceLoader>,
    ) -> Self {
        let s = Self::heap_stub(class, PersistenceToken::new(id, loader));
        let _ = s.storage_id.set(id);
        s
    }

    /// A stub that does not carry a storage identity of its own.
    pub(crate) fn heap_stub(class: &ClassRef, token: PersistenceToken) -> Self {
        Self::wrap(Instance {
            class: class.clone(),
            storage_id: OnceCell::new(),
            state: Mutex::new(InstanceState::Stub(token)),
        })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> Weak<Instance> {
        Arc::downgrade(&self.0)
    }

    pub fn upgrade(w: &Weak<Instance>) -> Option<Self> {
        w.upgrade().map(Self)
    }
}

impl Deref for ObjectRef {
    type Target = Instance;
    fn deref(&self) -> &Instance {
        &self.0
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:p}", self.class.name(), Arc::as_ptr(&self.0))?;
        if let Some(id) = self.storage_id.get() {
            write!(f, "#{}", id)?;
        }
        Ok(())
    }
}

impl Instance {
    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    pub fn storage_id(&self) -> Option<InstanceId> {
        self.storage_id.get().copied()
    }

    pub(crate) fn assign_storage_id(&self, id: InstanceId) -> InstanceId {
        *self.storage_id.get_or_init(|| id)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(&*self.state.lock(), InstanceState::Loaded(_))
    }

    /// Id the stub's token loads from, if the instance is still a stub.
    pub fn stub_id(&self) -> Option<InstanceId> {
        match &*self.state.lock() {
            InstanceState::Stub(t) => Some(t.id),
            InstanceState::Loaded(_) => None,
        }
    }

    /// Load the instance if it is a stub. Loading twice is a no-op.
    pub fn ensure_loaded(&self) -> Result<(), PersistError> {
        let token = match &*self.state.lock() {
            InstanceState::Loaded(_) => return Ok(()),
            InstanceState::Stub(t) => t.clone(),
        };
        // the loader may resolve references back to this instance, so the lock is not held
        let loader = token
            .loader
            .upgrade()
            .ok_or(PersistError::DetachedStub(token.id))?;
        let data = loader.load_instance(token.id, &self.class)?;
        let mut state = self.state.lock();
        if let InstanceState::Stub(_) = &*state {
            *state = InstanceState::Loaded(data)
        }
        Ok(())
    }

    /// Run `f` on the loaded state, loading first if needed.
    pub fn with_data<R>(
        &self, f: impl FnOnce(&mut ObjectData) -> R,
    ) -> Result<R, PersistError> {
        self.ensure_loaded()?;
        match &mut *self.state.lock() {
            InstanceState::Loaded(data) => Ok(f(data)),
            InstanceState::Stub(_) => {
                Err(PersistError::InvalidState("instance unloaded while in use"))
            }
        }
    }

    pub fn data(&self) -> Result<ObjectData, PersistError> {
        self.with_data(|d| d.clone())
    }

    /// Overwrite the loaded state wholesale.
    pub(crate) fn replace_data(&self, data: ObjectData) {
        *self.state.lock() = InstanceState::Loaded(data)
    }

    pub fn hash_code(&self) -> Result<i32, PersistError> {
        self.with_data(|d| d.hash_code)
    }

    pub fn get(&self, h: FieldHandle) -> Result<Value, PersistError> {
        self.with_data(|d| d.slots.get(h.slot).cloned())?.ok_or_else(|| {
            PersistError::TypeMismatch(format!(
                "slot {} of `{}`",
                h.slot,
                self.class.name()
            ))
        })
    }

    pub fn set(&self, h: FieldHandle, v: Value) -> Result<(), PersistError> {
        let class = self.class.clone();
        self.with_data(|d| {
            FieldSlots::of_instance(&class, &mut d.slots).set(h.slot, v)
        })?
    }

    pub fn get_field(&self, name: &str) -> Result<Value, PersistError> {
        self.get(self.class.field(name)?)
    }

    pub fn set_field(&self, name: &str, v: Value) -> Result<(), PersistError> {
        self.set(self.class.field(name)?, v)
    }

    pub fn array_len(&self) -> Result<usize, PersistError> {
        self.element_kind()?;
        self.with_data(|d| d.slots.len())
    }

    pub fn get_element(&self, index: usize) -> Result<Value, PersistError> {
        let kind = self.element_kind()?;
        self.get(FieldHandle { slot: index, kind })
    }

    pub fn set_element(
        &self, index: usize, v: Value,
    ) -> Result<(), PersistError> {
        let kind = self.element_kind()?;
        self.set(FieldHandle { slot: index, kind }, v)
    }

    fn element_kind(&self) -> Result<FieldKind, PersistError> {
        match self.class.shape() {
            ClassShape::Array(k) => Ok(k),
            ClassShape::Object => Err(PersistError::TypeMismatch(format!(
                "`{}` is not an array",
                self.class.name()
            ))),
        }
    }
}

/// Maps instance ids to the single live object that represents each of them. Entries are weak;
/// an id whose object was dropped may be bound again. Dead entries are swept whenever the map
/// doubles past the size it had after the last sweep.
pub struct IdentityTable {
    map: HashMap<InstanceId, Weak<Instance>>,
    sweep_at: usize,
}

const MIN_SWEEP: usize = 64;

impl Default for IdentityTable {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            sweep_at: MIN_SWEEP,
        }
    }
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, id: InstanceId, obj: &ObjectRef) {
        if self.map.len() >= self.sweep_at {
            self.map.retain(|_, w| w.strong_count() > 0);
            self.sweep_at = (self.map.len() * 2).max(MIN_SWEEP);
        }
        self.map.insert(id, obj.downgrade());
    }

    /// Entries held, including ones whose object is gone.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, id: InstanceId) -> Option<ObjectRef> {
        self.map.get(&id).and_then(ObjectRef::upgrade)
    }

    /// Bind `id` to `obj`. Binding an id that is held by a different live object fails.
    pub fn bind(
        &mut self, id: InstanceId, obj: &ObjectRef,
    ) -> Result<(), PersistError> {
        match self.get(id) {
            Some(o) if !o.ptr_eq(obj) => Err(PersistError::IdentityViolation(id)),
            _ => {
                self.insert(id, obj);
                Ok(())
            }
        }
    }

    /// The object bound to `id`, or a new one made by `make` and bound to it.
    pub fn get_or_insert_with(
        &mut self, id: InstanceId, make: impl FnOnce() -> ObjectRef,
    ) -> ObjectRef {
        if let Some(o) = self.get(id) {
            return o
        }
        let o = make();
        self.insert(id, &o);
        o
    }

    /// Live entries.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, ObjectRef)> + '_ {
        self.map
            .iter()
            .filter_map(|(id, w)| ObjectRef::upgrade(w).map(|o| (*id, o)))
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.sweep_at = MIN_SWEEP;
    }
}
