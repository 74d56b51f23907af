//! The blockchain kernel: the key-value store and code registry that contracts persist into.

use std::collections::hash_map::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::trace;
use parking_lot::RwLock;

use crate::common::{Addr, Bytes};
use crate::params::STATICS_KEY;

/// Synchronous view of the chain state used by the executor.
pub trait Kernel: Send + Sync {
    /// Get the value stored under `key` in the storage space of `addr`.
    fn get_storage(&self, addr: &Addr, key: &[u8]) -> Option<Bytes>;
    fn put_storage(&mut self, addr: &Addr, key: &[u8], val: Bytes);
    /// Raw code as it was deployed.
    fn get_code(&self, addr: &Addr) -> Option<Bytes>;
    fn set_code(&mut self, addr: &Addr, code: Bytes);
    /// Code after transformation. `None` means it has to be derived again from the raw code.
    fn get_transformed_code(&self, addr: &Addr) -> Option<Bytes>;
    fn set_transformed_code(&mut self, addr: &Addr, code: Option<Bytes>);

    /// The root record of the contract's object graph, kept under a reserved storage key.
    fn get_object_graph(&self, addr: &Addr) -> Option<Bytes> {
        self.get_storage(addr, STATICS_KEY)
    }

    fn put_object_graph(&mut self, addr: &Addr, graph: Bytes) {
        self.put_storage(addr, STATICS_KEY, graph)
    }

    /// A storage failure seen since the last call. A read that failed looks like a missing
    /// entry, so the executor asks before trusting what it read and after publishing writes.
    fn take_fault(&self) -> Option<String> {
        None
    }
}

pub type SharedKernel = Arc<RwLock<dyn Kernel>>;

/// Wrap a kernel so it can be shared with the executor.
pub fn shared<K: Kernel + 'static>(k: K) -> SharedKernel {
    Arc::new(RwLock::new(k))
}

/// Buffers all writes of one transaction over a base kernel. Reads see the buffered writes
/// first. Nothing reaches the base until [KernelOverlay::commit].
pub struct KernelOverlay {
    base: SharedKernel,
    storage: HashMap<(Addr, Vec<u8>), Bytes>,
    code: HashMap<Addr, Bytes>,
    transformed: HashMap<Addr, Option<Bytes>>,
}

impl KernelOverlay {
    pub fn new(base: SharedKernel) -> Self {
        Self {
            base,
            storage: HashMap::new(),
            code: HashMap::new(),
            transformed: HashMap::new(),
        }
    }

    /// Number of buffered writes.
    pub fn len(&self) -> usize {
        self.storage.len() + self.code.len() + self.transformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply the buffered writes to the base kernel and start over with an empty buffer.
    pub fn commit(&mut self) {
        trace!("overlay commit: {} writes", self.len());
        let mut base = self.base.write();
        for (addr, code) in std::mem::take(&mut self.code) {
            base.set_code(&addr, code)
        }
        for (addr, code) in std::mem::take(&mut self.transformed) {
            base.set_transformed_code(&addr, code)
        }
        for ((addr, key), val) in std::mem::take(&mut self.storage) {
            base.put_storage(&addr, &key, val)
        }
    }

    /// Drop the buffered writes.
    pub fn discard(&mut self) {
        self.storage.clear();
        self.code.clear();
        self.transformed.clear();
    }
}

impl Kernel for KernelOverlay {
    fn get_storage(&self, addr: &Addr, key: &[u8]) -> Option<Bytes> {
        match self.storage.get(&(*addr, key.to_vec())) {
            Some(v) => Some(v.clone()),
            None => self.base.read().get_storage(addr, key),
        }
    }

    fn put_storage(&mut self, addr: &Addr, key: &[u8], val: Bytes) {
        self.storage.insert((*addr, key.to_vec()), val);
    }

    fn get_code(&self, addr: &Addr) -> Option<Bytes> {
        match self.code.get(addr) {
            Some(c) => Some(c.clone()),
            None => self.base.read().get_code(addr),
        }
    }

    fn set_code(&mut self, addr: &Addr, code: Bytes) {
        self.code.insert(*addr, code);
    }

    fn get_transformed_code(&self, addr: &Addr) -> Option<Bytes> {
        match self.transformed.get(addr) {
            Some(c) => c.clone(),
            None => self.base.read().get_transformed_code(addr),
        }
    }

    fn set_transformed_code(&mut self, addr: &Addr, code: Option<Bytes>) {
        self.transformed.insert(*addr, code);
    }

    fn take_fault(&self) -> Option<String> {
        self.base.read().take_fault()
    }
}

/// A kernel whose reads may have to wait on I/O. Writes are buffered by the implementation, so
/// they stay synchronous.
#[async_trait]
pub trait AsyncKernel: Send + Sync {
    async fn get_storage(&self, addr: &Addr, key: &[u8]) -> Option<Bytes>;
    async fn get_code(&self, addr: &Addr) -> Option<Bytes>;
    async fn get_transformed_code(&self, addr: &Addr) -> Option<Bytes>;
    fn put_storage(&mut self, addr: &Addr, key: &[u8], val: Bytes);
    fn set_code(&mut self, addr: &Addr, code: Bytes);
    fn set_transformed_code(&mut self, addr: &Addr, code: Option<Bytes>);
}

/// Drives an [AsyncKernel] to completion on every read.
pub struct Blocking<K>(pub K);

impl<K: AsyncKernel> Kernel for Blocking<K> {
    fn get_storage(&self, addr: &Addr, key: &[u8]) -> Option<Bytes> {
        futures::executor::block_on(self.0.get_storage(addr, key))
    }

    fn put_storage(&mut self, addr: &Addr, key: &[u8], val: Bytes) {
        self.0.put_storage(addr, key, val)
    }

    fn get_code(&self, addr: &Addr) -> Option<Bytes> {
        futures::executor::block_on(self.0.get_code(addr))
    }

    fn set_code(&mut self, addr: &Addr, code: Bytes) {
        self.0.set_code(addr, code)
    }

    fn get_transformed_code(&self, addr: &Addr) -> Option<Bytes> {
        futures::executor::block_on(self.0.get_transformed_code(addr))
    }

    fn set_transformed_code(&mut self, addr: &Addr, code: Option<Bytes>) {
        self.0.set_transformed_code(addr, code)
    }
}
