//! A contract's object graph as it lives in kernel storage.
//!
//! The root record, stored under the reserved statics key, is
//!
//! ```notrust
//! [i64 nextInstanceId] [i32 nextHashCode] [u32 classCount] extent{classCount}
//! ```
//!
//! with one statics extent per class in load order. Every instance reachable from the statics is
//! stored as its own extent under [instance_key]. Instances are loaded lazily: restoring the
//! root record only creates stubs, and a stub reads its record the first time it is touched.

use std::collections::hash_map::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, trace};
use parking_lot::Mutex;

use super::class::{ClassRef, ClassRegistry};
use super::constants::ConstantTable;
use super::extent::Extent;
use super::fee::SharedFees;
use super::graph::{
    resolve_in, GraphReader, GraphWriter, IdPolicy, NodeResolver, Visit,
};
use super::object::{
    IdentityTable, InstanceLoader, ObjectData, ObjectRef,
};
use super::stream::{Decoder, Encoder};
use super::PersistError;
use crate::common::{Addr, Bytes, Hash, InstanceId};
use crate::kernel::SharedKernel;
use crate::params::{instance_key, FIRST_INSTANCE_ID};

struct Counters {
    next_instance_id: InstanceId,
    next_hash_code: i32,
}

pub struct StorageGraph {
    address: Addr,
    kernel: SharedKernel,
    classes: Arc<ClassRegistry>,
    constants: Arc<ConstantTable>,
    fees: SharedFees,
    identity: Mutex<IdentityTable>,
    /// digest of each instance record as last read or written
    digests: Mutex<HashMap<InstanceId, Hash>>,
    counters: Mutex<Counters>,
    me: Weak<StorageGraph>,
}

/// Numbering used when saving: persisted objects keep their id, new ones get the next free id.
/// Stubs that were never loaded can not have changed and are not visited.
struct StoragePolicy<'a> {
    counters: &'a Mutex<Counters>,
    seen: HashMap<ObjectRef, InstanceId>,
    assigned: Vec<ObjectRef>,
}

impl<'a> IdPolicy for StoragePolicy<'a> {
    fn id_for(
        &mut self, obj: &ObjectRef,
    ) -> Result<(InstanceId, Visit), PersistError> {
        if let Some(id) = self.seen.get(obj) {
            return Ok((*id, Visit::Skip))
        }
        let (id, visit) = match obj.storage_id() {
            Some(id) if !obj.is_loaded() => (id, Visit::Skip),
            Some(id) => (id, Visit::Enqueue),
            None => {
                let mut c = self.counters.lock();
                let id = obj.assign_storage_id(c.next_instance_id);
                if id == c.next_instance_id {
                    c.next_instance_id += 1;
                    self.assigned.push(obj.clone());
                }
                (id, Visit::Enqueue)
            }
        };
        self.seen.insert(obj.clone(), id);
        Ok((id, visit))
    }
}

struct StubResolver<'a> {
    graph: &'a StorageGraph,
}

impl<'a> NodeResolver for StubResolver<'a> {
    fn resolve(
        &mut self, class: &ClassRef, id: InstanceId,
    ) -> Result<ObjectRef, PersistError> {
        let loader: Weak<dyn InstanceLoader> = self.graph.me.clone();
        let mut table = self.graph.identity.lock();
        resolve_in(&mut table, class, id, || {
            ObjectRef::stored_stub(class, id, loader)
        })
    }
}

impl StorageGraph {
    pub fn new(
        address: Addr, kernel: SharedKernel, classes: Arc<ClassRegistry>,
        constants: Arc<ConstantTable>, fees: SharedFees,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            address,
            kernel,
            classes,
            constants,
            fees,
            identity: Mutex::new(IdentityTable::new()),
            digests: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters {
                next_instance_id: FIRST_INSTANCE_ID,
                next_hash_code: 1,
            }),
            me: me.clone(),
        })
    }

    pub fn address(&self) -> &Addr {
        &self.address
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    pub fn constants(&self) -> &Arc<ConstantTable> {
        &self.constants
    }

    pub fn fees(&self) -> &SharedFees {
        &self.fees
    }

    pub fn next_instance_id(&self) -> InstanceId {
        self.counters.lock().next_instance_id
    }

    /// Identity hash code for a new object.
    pub fn next_hash_code(&self) -> i32 {
        let mut c = self.counters.lock();
        let h = c.next_hash_code;
        c.next_hash_code = c.next_hash_code.wrapping_add(1);
        h
    }

    pub fn new_object(&self, class: &ClassRef) -> ObjectRef {
        ObjectRef::new(class, self.next_hash_code())
    }

    pub fn new_array(
        &self, class: &ClassRef, len: usize,
    ) -> Result<ObjectRef, PersistError> {
        ObjectRef::new_array(class, len, self.next_hash_code())
    }

    /// Restore the class statics (and the id counters) from a root record. Referenced instances
    /// come back as stubs.
    pub fn load_root(&self, root: &[u8]) -> Result<(), PersistError> {
        self.fees.lock().read_static_data_from_storage(root.len())?;
        let mut d = Decoder::new(root);
        let next_instance_id = d.read_long()?;
        let next_hash_code = d.read_int()?;
        let count = d.read_u32()? as usize;
        let order = self.classes.load_order();
        if count != order.len() || next_instance_id < FIRST_INSTANCE_ID {
            return Err(PersistError::MalformedExtent(format!(
                "root record of {} classes (next id {}) for a contract of {}",
                count,
                next_instance_id,
                order.len()
            )))
        }
        let reader = GraphReader::new(&self.classes, &self.constants);
        let mut statics = Vec::with_capacity(count);
        for class in order {
            let extent = Extent::decode_from(&mut d)?;
            let values = reader.deserialize_statics(
                class,
                &extent,
                &mut StubResolver { graph: self },
            )?;
            statics.push(values);
        }
        d.finish()?;
        for (class, values) in order.iter().zip(statics) {
            class.replace_statics(values)
        }
        *self.counters.lock() = Counters {
            next_instance_id,
            next_hash_code,
        };
        debug!(
            "{}: restored {} classes, next instance id {}",
            self.address, count, next_instance_id
        );
        Ok(())
    }

    /// Persist everything reachable from the class statics and return the new root record.
    ///
    /// All records are serialized and metered before the first write reaches the kernel, so a
    /// save that runs out of energy leaves storage untouched. Records whose bytes did not change
    /// since they were read or last written are not written again.
    pub fn save(&self) -> Result<Bytes, PersistError> {
        let policy = StoragePolicy {
            counters: &self.counters,
            seen: HashMap::new(),
            assigned: Vec::new(),
        };
        let mut writer = GraphWriter::new(policy, &self.constants);
        let mut root = Encoder::new();
        let mut statics = Vec::new();
        for class in self.classes.load_order() {
            statics.push(writer.serialize_statics(class)?);
        }
        let mut staged = Vec::new();
        while let Some((id, obj)) = writer.next_queued() {
            let bytes = writer.serialize_instance(&obj)?.encode();
            let digest = Hash::hash(&bytes);
            if self.digests.lock().get(&id) == Some(&digest) {
                continue
            }
            self.fees.lock().write_one_instance_to_storage(bytes.len())?;
            staged.push((id, bytes, digest));
        }
        {
            let c = self.counters.lock();
            root.write_long(c.next_instance_id)
                .write_int(c.next_hash_code)
                .write_u32(statics.len() as u32);
        }
        for e in statics.iter() {
            e.encode_into(&mut root)
        }
        let root: Bytes = root.to_bytes().into();
        self.fees.lock().write_static_data_to_storage(root.len())?;

        let assigned = writer.into_policy().assigned;
        {
            let mut identity = self.identity.lock();
            for obj in assigned.iter() {
                if let Some(id) = obj.storage_id() {
                    identity.bind(id, obj)?
                }
            }
        }
        let mut kernel = self.kernel.write();
        let mut digests = self.digests.lock();
        debug!(
            "{}: saving {} records ({} new instances)",
            self.address,
            staged.len(),
            assigned.len()
        );
        for (id, bytes, digest) in staged {
            trace!("{}: write instance {} ({} bytes)", self.address, id, bytes.len());
            kernel.put_storage(&self.address, &instance_key(id), bytes.into());
            digests.insert(id, digest);
        }
        kernel.put_object_graph(&self.address, root.clone());
        Ok(root)
    }
}

impl InstanceLoader for StorageGraph {
    fn load_instance(
        &self, id: InstanceId, class: &ClassRef,
    ) -> Result<ObjectData, PersistError> {
        let bytes = self
            .kernel
            .read()
            .get_storage(&self.address, &instance_key(id))
            .ok_or(PersistError::MissingInstance(id))?;
        trace!("{}: load instance {} ({} bytes)", self.address, id, bytes.len());
        self.fees.lock().read_one_instance_from_storage(bytes.len())?;
        let extent = Extent::decode(&bytes)?;
        let reader = GraphReader::new(&self.classes, &self.constants);
        let data = reader.deserialize_instance(
            class,
            &extent,
            &mut StubResolver { graph: self },
        )?;
        self.digests.lock().insert(id, Hash::hash(&bytes));
        Ok(data)
    }
}
