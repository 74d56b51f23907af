//! One contract's classes with their statics, bound to a storage graph session.

use std::sync::Arc;

use crate::code::DAppCode;
use crate::common::{Addr, Bytes};
use crate::kernel::SharedKernel;
use crate::persist::class::{ClassRef, ClassRegistry};
use crate::persist::constants::ConstantTable;
use crate::persist::fee::SharedFees;
use crate::persist::object::{ObjectRef, Value};
use crate::persist::storage::StorageGraph;
use crate::persist::PersistError;

pub struct LoadedDApp {
    classes: Arc<ClassRegistry>,
    graph: Arc<StorageGraph>,
}

impl LoadedDApp {
    /// A contract with freshly zeroed statics, as it is right before its first save.
    pub fn new(
        address: Addr, kernel: SharedKernel, code: &DAppCode,
        constants: Arc<ConstantTable>, fees: SharedFees,
    ) -> Result<Self, PersistError> {
        let classes = Arc::new(code.registry()?);
        let graph =
            StorageGraph::new(address, kernel, classes.clone(), constants, fees);
        Ok(Self { classes, graph })
    }

    /// A deployed contract restored from its root record.
    pub fn load(
        address: Addr, kernel: SharedKernel, code: &DAppCode,
        constants: Arc<ConstantTable>, fees: SharedFees, root: &[u8],
    ) -> Result<Self, PersistError> {
        let dapp = Self::new(address, kernel, code, constants, fees)?;
        dapp.graph.load_root(root)?;
        Ok(dapp)
    }

    pub fn address(&self) -> &Addr {
        self.graph.address()
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    pub fn graph(&self) -> &Arc<StorageGraph> {
        &self.graph
    }

    pub fn constants(&self) -> &Arc<ConstantTable> {
        self.graph.constants()
    }

    pub fn fees(&self) -> &SharedFees {
        self.graph.fees()
    }

    #[inline]
    pub fn class(&self, name: &str) -> Result<ClassRef, PersistError> {
        self.classes.resolve(name)
    }

    pub fn get_static(&self, class: &str, field: &str) -> Result<Value, PersistError> {
        let c = self.class(class)?;
        let h = c.static_field(field)?;
        c.get_static(h)
    }

    pub fn set_static(
        &self, class: &str, field: &str, v: Value,
    ) -> Result<(), PersistError> {
        let c = self.class(class)?;
        let h = c.static_field(field)?;
        c.set_static(h, v)
    }

    pub fn new_object(&self, class: &str) -> Result<ObjectRef, PersistError> {
        Ok(self.graph.new_object(&self.class(class)?))
    }

    /// `class` is an array class name such as `[I` or `[LNode;`.
    pub fn new_array(
        &self, class: &str, len: usize,
    ) -> Result<ObjectRef, PersistError> {
        self.graph.new_array(&self.class(class)?, len)
    }

    /// Persist the graph and return the new root record.
    pub fn save(&self) -> Result<Bytes, PersistError> {
        self.graph.save()
    }
}
