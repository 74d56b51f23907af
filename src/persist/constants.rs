//! VM constants: shared objects that are never serialized. A reference to one is written as its
//! negative id and resolved through this table on the way back in.

use std::collections::hash_map::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::object::ObjectRef;
use super::PersistError;

#[derive(Default)]
pub struct ConstantTable {
    by_id: HashMap<i64, ObjectRef>,
    ids: HashMap<ObjectRef, i64>,
}

impl ConstantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with no constants, shared by everything that does not register its own.
    pub fn empty() -> Arc<Self> {
        static V: OnceCell<Arc<ConstantTable>> = OnceCell::new();
        V.get_or_init(|| Arc::new(Self::new())).clone()
    }

    pub fn register(
        &mut self, id: i64, obj: ObjectRef,
    ) -> Result<(), PersistError> {
        if id >= 0 {
            return Err(PersistError::UnknownConstant(id))
        }
        if self.by_id.contains_key(&id) || self.ids.contains_key(&obj) {
            return Err(PersistError::IdentityViolation(id))
        }
        obj.ensure_loaded()?;
        self.ids.insert(obj.clone(), id);
        self.by_id.insert(id, obj);
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<ObjectRef, PersistError> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or(PersistError::UnknownConstant(id))
    }

    pub fn id_of(&self, obj: &ObjectRef) -> Option<i64> {
        self.ids.get(obj).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
