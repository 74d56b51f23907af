//! Graph codec: turns objects and class statics into [Extent]s and back.
//!
//! The writer walks fields through [FieldPopulator] in declared order and emits a reference for
//! every reference slot. How an object reached that way is numbered, and whether it is queued
//! for serialization itself, is left to an [IdPolicy]; the storage session and the reentrant
//! processor number objects differently. The reader mirrors it, handing regular references to a
//! [NodeResolver] so that each id maps to one live object.
//!
//! Instance records have the layout
//!
//! ```notrust
//! primitives := [i32 hashCode] ([i32 length])? field*
//! references := one entry per reference slot, in slot order
//! ```
//!
//! where the length is present for arrays only.

use std::collections::hash_map::HashMap;
use std::collections::VecDeque;
use std::slice;

use super::class::{
    Class, ClassRef, ClassRegistry, ClassShape, FieldKind, FieldPopulator,
    FieldSlots,
};
use super::constants::ConstantTable;
use super::extent::{Extent, Reference};
use super::object::{IdentityTable, Node, ObjectData, ObjectRef, Value};
use super::stream::{Decoder, Encoder};
use super::PersistError;
use crate::common::InstanceId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Visit {
    /// serialize the object later in this pass
    Enqueue,
    Skip,
}

pub trait IdPolicy {
    fn id_for(
        &mut self, obj: &ObjectRef,
    ) -> Result<(InstanceId, Visit), PersistError>;
}

/// Numbers objects 1, 2, 3, ... in the order they are first reached.
#[derive(Default)]
pub struct VisitOrder {
    ids: HashMap<ObjectRef, InstanceId>,
    objects: Vec<ObjectRef>,
}

impl VisitOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects in id order (`objects()[id - 1]`).
    pub fn objects(&self) -> &[ObjectRef] {
        &self.objects
    }

    pub fn into_objects(self) -> Vec<ObjectRef> {
        self.objects
    }
}

impl IdPolicy for VisitOrder {
    fn id_for(
        &mut self, obj: &ObjectRef,
    ) -> Result<(InstanceId, Visit), PersistError> {
        if let Some(id) = self.ids.get(obj) {
            return Ok((*id, Visit::Skip))
        }
        self.objects.push(obj.clone());
        let id = self.objects.len() as InstanceId;
        self.ids.insert(obj.clone(), id);
        Ok((id, Visit::Enqueue))
    }
}

pub struct GraphWriter<'a, P> {
    policy: P,
    constants: &'a ConstantTable,
    queue: VecDeque<(InstanceId, ObjectRef)>,
}

impl<'a, P: IdPolicy> GraphWriter<'a, P> {
    pub fn new(policy: P, constants: &'a ConstantTable) -> Self {
        Self {
            policy,
            constants,
            queue: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn into_policy(self) -> P {
        self.policy
    }

    /// Next object queued by a reference written so far, breadth first.
    pub fn next_queued(&mut self) -> Option<(InstanceId, ObjectRef)> {
        self.queue.pop_front()
    }

    pub fn serialize_statics(
        &mut self, class: &Class,
    ) -> Result<Extent, PersistError> {
        let mut values = class.statics();
        let fields = FieldSlots::declared(class.static_fields(), &mut values);
        let mut prims = Encoder::new();
        let mut refs = Vec::new();
        self.write_fields(&fields, &mut prims, &mut refs)?;
        Ok(Extent::new(prims.to_bytes(), refs))
    }

    /// Serialize one instance, loading it first if it is a stub.
    pub fn serialize_instance(
        &mut self, obj: &ObjectRef,
    ) -> Result<Extent, PersistError> {
        let mut data = obj.data()?;
        let class = obj.class();
        let mut prims = Encoder::new();
        prims.write_int(data.hash_code);
        if let ClassShape::Array(_) = class.shape() {
            prims.write_int(array_length(class, data.slots.len())?);
        }
        let mut refs = Vec::new();
        let fields = FieldSlots::of_instance(class, &mut data.slots);
        self.write_fields(&fields, &mut prims, &mut refs)?;
        Ok(Extent::new(prims.to_bytes(), refs))
    }

    fn write_fields(
        &mut self, fields: &dyn FieldPopulator, prims: &mut Encoder,
        refs: &mut Vec<Reference>,
    ) -> Result<(), PersistError> {
        for i in 0..fields.len() {
            match fields.get(i) {
                Value::Boolean(v) => prims.write_boolean(*v),
                Value::Byte(v) => prims.write_byte(*v),
                Value::Char(v) => prims.write_char(*v),
                Value::Short(v) => prims.write_short(*v),
                Value::Int(v) => prims.write_int(*v),
                Value::Float(v) => prims.write_float(*v),
                Value::Long(v) => prims.write_long(*v),
                Value::Double(v) => prims.write_double(*v),
                Value::Ref(r) => {
                    refs.push(self.reference_for(r)?);
                    continue
                }
            };
        }
        Ok(())
    }

    fn reference_for(
        &mut self, r: &Option<Node>,
    ) -> Result<Reference, PersistError> {
        Ok(match r {
            None => Reference::Null,
            Some(Node::Class(c)) => Reference::ClassObject(c.name().to_string()),
            Some(Node::Object(o)) => match self.constants.id_of(o) {
                Some(id) => Reference::Constant(id),
                None => {
                    let (id, visit) = self.policy.id_for(o)?;
                    if visit == Visit::Enqueue {
                        self.queue.push_back((id, o.clone()))
                    }
                    Reference::regular(o.class().name(), id)
                }
            },
        })
    }
}

/// Array length as written in the record header.
fn array_length(class: &Class, len: usize) -> Result<i32, PersistError> {
    i32::try_from(len).map_err(|_| {
        PersistError::MalformedExtent(format!(
            "`{}` of {} elements",
            class.name(),
            len
        ))
    })
}

/// Maps a regular reference to the live object for its id.
pub trait NodeResolver {
    fn resolve(
        &mut self, class: &ClassRef, id: InstanceId,
    ) -> Result<ObjectRef, PersistError>;
}

/// Resolve through an identity table, making a new object with `make` for an unseen id. An id
/// already bound to an object of another class is an identity violation.
pub fn resolve_in(
    table: &mut IdentityTable, class: &ClassRef, id: InstanceId,
    make: impl FnOnce() -> ObjectRef,
) -> Result<ObjectRef, PersistError> {
    let o = table.get_or_insert_with(id, make);
    if o.class().name() != class.name() {
        return Err(PersistError::IdentityViolation(id))
    }
    Ok(o)
}

pub struct GraphReader<'a> {
    classes: &'a ClassRegistry,
    constants: &'a ConstantTable,
}

impl<'a> GraphReader<'a> {
    pub fn new(classes: &'a ClassRegistry, constants: &'a ConstantTable) -> Self {
        Self { classes, constants }
    }

    pub fn deserialize_statics(
        &self, class: &Class, extent: &Extent, resolver: &mut dyn NodeResolver,
    ) -> Result<Vec<Value>, PersistError> {
        let mut values: Vec<Value> =
            class.static_fields().iter().map(|f| f.kind.zero()).collect();
        let mut prims = Decoder::record(extent.primitives());
        let mut refs = extent.references().iter();
        let mut fields =
            FieldSlots::declared(class.static_fields(), &mut values);
        self.read_fields(&mut fields, &mut prims, &mut refs, resolver)?;
        Self::finish(prims, refs)?;
        Ok(values)
    }

    pub fn deserialize_instance(
        &self, class: &ClassRef, extent: &Extent,
        resolver: &mut dyn NodeResolver,
    ) -> Result<ObjectData, PersistError> {
        let mut prims = Decoder::record(extent.primitives());
        let mut refs = extent.references().iter();
        let hash_code = prims.read_int()?;
        let len = match class.shape() {
            ClassShape::Object => class.instance_fields().len(),
            ClassShape::Array(kind) => {
                let len = prims.read_int()?;
                // bound the length by what the record can hold before allocating
                let fits = len >= 0 &&
                    match kind {
                        FieldKind::Reference => len as usize == refs.len(),
                        k => {
                            (len as usize).checked_mul(k.width()) ==
                                Some(prims.remaining())
                        }
                    };
                if !fits {
                    return Err(PersistError::TypeMismatch(format!(
                        "array `{}` of length {} does not match its record",
                        class.name(),
                        len
                    )))
                }
                len as usize
            }
        };
        let mut slots = match class.shape() {
            ClassShape::Array(k) => vec![k.zero(); len],
            ClassShape::Object => class
                .instance_fields()
                .iter()
                .map(|f| f.kind.zero())
                .collect(),
        };
        let mut fields = FieldSlots::of_instance(class, &mut slots);
        self.read_fields(&mut fields, &mut prims, &mut refs, resolver)?;
        Self::finish(prims, refs)?;
        Ok(ObjectData { hash_code, slots })
    }

    fn read_fields(
        &self, fields: &mut dyn FieldPopulator, prims: &mut Decoder,
        refs: &mut slice::Iter<Reference>, resolver: &mut dyn NodeResolver,
    ) -> Result<(), PersistError> {
        for i in 0..fields.len() {
            let v = match fields.kind(i) {
                FieldKind::Boolean => Value::Boolean(prims.read_boolean()?),
                FieldKind::Byte => Value::Byte(prims.read_byte()?),
                FieldKind::Char => Value::Char(prims.read_char()?),
                FieldKind::Short => Value::Short(prims.read_short()?),
                FieldKind::Int => Value::Int(prims.read_int()?),
                FieldKind::Float => Value::Float(prims.read_float()?),
                FieldKind::Long => Value::Long(prims.read_long()?),
                FieldKind::Double => Value::Double(prims.read_double()?),
                FieldKind::Reference => {
                    let r = refs.next().ok_or_else(|| {
                        PersistError::TypeMismatch(format!(
                            "no reference left for slot {}",
                            i
                        ))
                    })?;
                    Value::Ref(self.resolve(r, resolver)?)
                }
            };
            fields.set(i, v)?;
        }
        Ok(())
    }

    fn resolve(
        &self, r: &Reference, resolver: &mut dyn NodeResolver,
    ) -> Result<Option<Node>, PersistError> {
        Ok(match r {
            Reference::Null => None,
            Reference::Constant(id) => {
                Some(Node::Object(self.constants.get(*id)?))
            }
            Reference::ClassObject(name) => {
                Some(Node::Class(self.classes.resolve(name)?))
            }
            Reference::Regular {
                class_name,
                instance_id,
            } => {
                let class = self.classes.resolve(class_name)?;
                Some(Node::Object(resolver.resolve(&class, *instance_id)?))
            }
        })
    }

    fn finish(
        prims: Decoder, refs: slice::Iter<Reference>,
    ) -> Result<(), PersistError> {
        if refs.len() > 0 {
            return Err(PersistError::TypeMismatch(format!(
                "{} references left over",
                refs.len()
            )))
        }
        prims.finish()
    }
}
