//! Class layouts and the field walker.
//!
//! Every [Class] records the fields it declares *locally*. The instance layout of a class is the
//! concatenation of the local instance fields of its hierarchy, root class first, and that order
//! is part of the persisted format: a reader must walk fields in exactly the order the writer did.
//! Static fields are never inherited; each class's statics form their own record.

use std::collections::hash_map::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::object::{Node, Value};
use super::PersistError;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, FromPrimitive)]
#[repr(u8)]
pub enum FieldKind {
    Boolean = 0,
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Float = 5,
    Long = 6,
    Double = 7,
    Reference = 8,
}

impl FieldKind {
    /// Number of bytes taken in the primitive region. References live in the reference region.
    #[inline]
    pub fn width(self) -> usize {
        match self {
            FieldKind::Boolean | FieldKind::Byte => 1,
            FieldKind::Char | FieldKind::Short => 2,
            FieldKind::Int | FieldKind::Float => 4,
            FieldKind::Long | FieldKind::Double => 8,
            FieldKind::Reference => 0,
        }
    }

    pub fn descriptor(self) -> char {
        match self {
            FieldKind::Boolean => 'Z',
            FieldKind::Byte => 'B',
            FieldKind::Char => 'C',
            FieldKind::Short => 'S',
            FieldKind::Int => 'I',
            FieldKind::Float => 'F',
            FieldKind::Long => 'J',
            FieldKind::Double => 'D',
            FieldKind::Reference => 'L',
        }
    }

    fn from_primitive_descriptor(c: &str) -> Option<Self> {
        Some(match c {
            "Z" => FieldKind::Boolean,
            "B" => FieldKind::Byte,
            "C" => FieldKind::Char,
            "S" => FieldKind::Short,
            "I" => FieldKind::Int,
            "F" => FieldKind::Float,
            "J" => FieldKind::Long,
            "D" => FieldKind::Double,
            _ => return None,
        })
    }

    pub fn zero(self) -> Value {
        match self {
            FieldKind::Boolean => Value::Boolean(false),
            FieldKind::Byte => Value::Byte(0),
            FieldKind::Char => Value::Char(0),
            FieldKind::Short => Value::Short(0),
            FieldKind::Int => Value::Int(0),
            FieldKind::Float => Value::Float(0.0),
            FieldKind::Long => Value::Long(0),
            FieldKind::Double => Value::Double(0.0),
            FieldKind::Reference => Value::Ref(None),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
    pub is_static: bool,
}

/// Declaration of one contract class, in the order fields were declared.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<String>,
    pub fields: Vec<FieldDecl>,
}

impl ClassDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: None,
            fields: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            kind,
            is_static: false,
        });
        self
    }

    pub fn static_field(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            kind,
            is_static: true,
        });
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldHandle {
    pub slot: usize,
    pub kind: FieldKind,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassShape {
    Object,
    Array(FieldKind),
}

pub type ClassRef = Arc<Class>;

pub struct Class {
    name: String,
    superclass: Option<ClassRef>,
    shape: ClassShape,
    /// element class of a reference array
    element_class: Option<ClassRef>,
    /// instance fields of the whole hierarchy, root class first
    instance_fields: Vec<FieldDecl>,
    /// index of the first locally declared field in `instance_fields`
    local_start: usize,
    static_fields: Vec<FieldDecl>,
    statics: Mutex<Vec<Value>>,
}

impl Class {
    fn new(
        name: String, superclass: Option<ClassRef>, shape: ClassShape,
        element_class: Option<ClassRef>, local: Vec<FieldDecl>,
        static_fields: Vec<FieldDecl>,
    ) -> Self {
        let mut instance_fields = superclass
            .as_ref()
            .map(|s| s.instance_fields.clone())
            .unwrap_or_default();
        let local_start = instance_fields.len();
        instance_fields.extend(local);
        let statics = static_fields.iter().map(|f| f.kind.zero()).collect();
        Self {
            name,
            superclass,
            shape,
            element_class,
            instance_fields,
            local_start,
            static_fields,
            statics: Mutex::new(statics),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn superclass(&self) -> Option<&ClassRef> {
        self.superclass.as_ref()
    }

    pub fn shape(&self) -> ClassShape {
        self.shape
    }

    pub fn element_kind(&self) -> Option<FieldKind> {
        match self.shape {
            ClassShape::Array(k) => Some(k),
            ClassShape::Object => None,
        }
    }

    /// Class every element of a reference array must be an instance of.
    pub fn element_class(&self) -> Option<&ClassRef> {
        self.element_class.as_ref()
    }

    /// All instance fields in persisted order (root class first).
    pub fn instance_fields(&self) -> &[FieldDecl] {
        &self.instance_fields
    }

    /// Instance fields declared by this class itself.
    pub fn local_instance_fields(&self) -> &[FieldDecl] {
        &self.instance_fields[self.local_start..]
    }

    pub fn static_fields(&self) -> &[FieldDecl] {
        &self.static_fields
    }

    /// Byte size of an instance's primitive region, excluding the hash code header.
    pub fn instance_primitive_width(&self) -> usize {
        self.instance_fields.iter().map(|f| f.kind.width()).sum()
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        let mut c = Some(self);
        while let Some(k) = c {
            if k.name == other.name {
                return true
            }
            c = k.superclass.as_deref();
        }
        false
    }

    /// Look up an instance field by name. A field declared in a subclass hides a field of the
    /// same name declared further up the hierarchy.
    pub fn field(&self, name: &str) -> Result<FieldHandle, PersistError> {
        self.instance_fields
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| f.name == name)
            .map(|(slot, f)| FieldHandle { slot, kind: f.kind })
            .ok_or_else(|| self.unknown_field(name))
    }

    /// Look up an instance field declared by a specific class of the hierarchy.
    pub fn declared_field(
        &self, declaring: &str, name: &str,
    ) -> Result<FieldHandle, PersistError> {
        let mut c = Some(self);
        while let Some(k) = c {
            if k.name == declaring {
                return k
                    .local_instance_fields()
                    .iter()
                    .position(|f| f.name == name)
                    .map(|i| FieldHandle {
                        slot: k.local_start + i,
                        kind: k.instance_fields[k.local_start + i].kind,
                    })
                    .ok_or_else(|| k.unknown_field(name))
            }
            c = k.superclass.as_deref();
        }
        Err(PersistError::UnknownClass(declaring.to_string()))
    }

    pub fn static_field(&self, name: &str) -> Result<FieldHandle, PersistError> {
        self.static_fields
            .iter()
            .position(|f| f.name == name)
            .map(|slot| FieldHandle {
                slot,
                kind: self.static_fields[slot].kind,
            })
            .ok_or_else(|| self.unknown_field(name))
    }

    fn unknown_field(&self, name: &str) -> PersistError {
        PersistError::UnknownField {
            class: self.name.clone(),
            field: name.to_string(),
        }
    }

    pub fn get_static(&self, h: FieldHandle) -> Result<Value, PersistError> {
        self.statics.lock().get(h.slot).cloned().ok_or_else(|| {
            PersistError::TypeMismatch(format!(
                "static slot {} of `{}`",
                h.slot, self.name
            ))
        })
    }

    pub fn set_static(
        &self, h: FieldHandle, v: Value,
    ) -> Result<(), PersistError> {
        let mut statics = self.statics.lock();
        FieldSlots::declared(&self.static_fields, &mut statics).set(h.slot, v)
    }

    /// Copy of the current static slots.
    pub fn statics(&self) -> Vec<Value> {
        self.statics.lock().clone()
    }

    pub(crate) fn replace_statics(&self, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.static_fields.len());
        *self.statics.lock() = values
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.name)
    }
}

/// Access to a sequence of typed field slots. The graph codec reads and writes fields only
/// through this interface.
pub trait FieldPopulator {
    fn len(&self) -> usize;
    fn kind(&self, index: usize) -> FieldKind;
    fn get(&self, index: usize) -> &Value;
    fn set(&mut self, index: usize, value: Value) -> Result<(), PersistError>;
}

enum SlotKinds<'a> {
    Declared(&'a [FieldDecl]),
    /// array elements, with the element class of a reference array
    Uniform(FieldKind, Option<&'a Class>),
}

/// [FieldPopulator] over a slice of slots whose kinds come either from field declarations or,
/// for arrays, from the element kind.
pub struct FieldSlots<'a> {
    kinds: SlotKinds<'a>,
    values: &'a mut [Value],
}

impl<'a> FieldSlots<'a> {
    pub fn declared(fields: &'a [FieldDecl], values: &'a mut [Value]) -> Self {
        debug_assert_eq!(fields.len(), values.len());
        Self {
            kinds: SlotKinds::Declared(fields),
            values,
        }
    }

    /// Slots of one instance of `class`.
    pub fn of_instance(class: &'a Class, values: &'a mut [Value]) -> Self {
        match class.shape {
            ClassShape::Array(k) => Self {
                kinds: SlotKinds::Uniform(k, class.element_class.as_deref()),
                values,
            },
            ClassShape::Object => {
                Self::declared(&class.instance_fields, values)
            }
        }
    }
}

impl<'a> FieldPopulator for FieldSlots<'a> {
    fn len(&self) -> usize {
        self.values.len()
    }

    fn kind(&self, index: usize) -> FieldKind {
        match &self.kinds {
            SlotKinds::Declared(f) => f[index].kind,
            SlotKinds::Uniform(k, _) => *k,
        }
    }

    fn get(&self, index: usize) -> &Value {
        &self.values[index]
    }

    fn set(&mut self, index: usize, value: Value) -> Result<(), PersistError> {
        if index >= self.values.len() {
            return Err(PersistError::TypeMismatch(format!(
                "slot {} out of {} slots",
                index,
                self.values.len()
            )))
        }
        let expected = self.kind(index);
        if value.kind() != expected {
            return Err(PersistError::TypeMismatch(format!(
                "slot {} holds {:?}, got {:?}",
                index,
                expected,
                value.kind()
            )))
        }
        if let (SlotKinds::Uniform(_, Some(elem)), Value::Ref(Some(node))) =
            (&self.kinds, &value)
        {
            let fits = match node {
                Node::Object(o) => o.class().is_subclass_of(elem),
                Node::Class(_) => false,
            };
            if !fits {
                return Err(PersistError::TypeMismatch(format!(
                    "element {} of a `{}` array cannot hold {:?}",
                    index,
                    elem.name(),
                    node
                )))
            }
        }
        self.values[index] = value;
        Ok(())
    }
}

/// The classes of one contract. Classes are defined in load order (a superclass always before
/// its subclasses) and array classes are materialized on first use.
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, ClassRef>>,
    load_order: Vec<ClassRef>,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
            load_order: Vec::new(),
        }
    }

    pub fn from_decls(decls: &[ClassDecl]) -> Result<Self, PersistError> {
        let mut reg = Self::new();
        for d in decls {
            reg.define(d)?;
        }
        Ok(reg)
    }

    pub fn define(&mut self, decl: &ClassDecl) -> Result<ClassRef, PersistError> {
        if decl.name.is_empty() || decl.name.starts_with('[') {
            return Err(PersistError::UnknownClass(decl.name.clone()))
        }
        if self.classes.read().contains_key(&decl.name) {
            return Err(PersistError::DuplicateClass(decl.name.clone()))
        }
        let superclass = match &decl.superclass {
            Some(s) => Some(self.resolve(s)?),
            None => None,
        };
        let (statics, local): (Vec<_>, Vec<_>) =
            decl.fields.iter().cloned().partition(|f| f.is_static);
        let class = Arc::new(Class::new(
            decl.name.clone(),
            superclass,
            ClassShape::Object,
            None,
            local,
            statics,
        ));
        self.classes
            .write()
            .insert(decl.name.clone(), class.clone());
        self.load_order.push(class.clone());
        Ok(class)
    }

    /// Classes with statics, in the order their records are persisted.
    pub fn load_order(&self) -> &[ClassRef] {
        &self.load_order
    }

    pub fn resolve(&self, name: &str) -> Result<ClassRef, PersistError> {
        if let Some(c) = self.classes.read().get(name) {
            return Ok(c.clone())
        }
        let elem = name
            .strip_prefix('[')
            .ok_or_else(|| PersistError::UnknownClass(name.to_string()))?;
        let (kind, element) = match FieldKind::from_primitive_descriptor(elem)
        {
            Some(k) => (k, None),
            None => {
                let inner = match elem
                    .strip_prefix('L')
                    .and_then(|e| e.strip_suffix(';'))
                {
                    Some(inner) => inner,
                    None if elem.starts_with('[') => elem,
                    None => {
                        return Err(PersistError::UnknownClass(
                            name.to_string(),
                        ))
                    }
                };
                (FieldKind::Reference, Some(self.resolve(inner)?))
            }
        };
        let class = Arc::new(Class::new(
            name.to_string(),
            None,
            ClassShape::Array(kind),
            element,
            Vec::new(),
            Vec::new(),
        ));
        Ok(self
            .classes
            .write()
            .entry(name.to_string())
            .or_insert(class)
            .clone())
    }

    pub fn array_of(&self, elem: FieldKind) -> Result<ClassRef, PersistError> {
        match elem {
            FieldKind::Reference => Err(PersistError::TypeMismatch(
                "reference arrays are named by their element class".into(),
            )),
            k => self.resolve(&format!("[{}", k.descriptor())),
        }
    }

    pub fn array_of_class(
        &self, elem_class: &str,
    ) -> Result<ClassRef, PersistError> {
        if elem_class.starts_with('[') {
            self.resolve(&format!("[{}", elem_class))
        } else {
            self.resolve(&format!("[L{};", elem_class))
        }
    }
}
