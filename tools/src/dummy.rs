use std::collections::hash_map::HashMap;

use log::info;

use qavm::common::{Addr, Bytes};
use qavm::kernel::Kernel;

use crate::key_to_str;

#[derive(Clone, Default)]
struct DummyAccount {
    storage: HashMap<Vec<u8>, Bytes>,
    code: Option<Bytes>,
    transformed: Option<Bytes>,
}

/// In-memory kernel that logs every access. Cloning it forks the whole state.
#[derive(Clone, Default)]
pub struct DummyKernel {
    accounts: HashMap<Addr, DummyAccount>,
}

impl DummyKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_account(&mut self, addr: &Addr) -> &mut DummyAccount {
        self.accounts.entry(*addr).or_default()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Addr> {
        self.accounts.keys()
    }

    pub fn storage_keys(
        &self, addr: &Addr,
    ) -> Option<impl Iterator<Item = &Vec<u8>>> {
        self.accounts.get(addr).map(|acc| acc.storage.keys())
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Kernel for DummyKernel {
    fn get_storage(&self, addr: &Addr, key: &[u8]) -> Option<Bytes> {
        info!("get_storage({}, {})", addr, key_to_str(key));
        self.accounts
            .get(addr)
            .and_then(|acc| acc.storage.get(key))
            .cloned()
    }

    fn put_storage(&mut self, addr: &Addr, key: &[u8], val: Bytes) {
        info!("put_storage({}, {}, {} bytes)", addr, key_to_str(key), val.len());
        self.get_account(addr).storage.insert(key.to_vec(), val);
    }

    fn get_code(&self, addr: &Addr) -> Option<Bytes> {
        info!("get_code({})", addr);
        self.accounts.get(addr).and_then(|acc| acc.code.clone())
    }

    fn set_code(&mut self, addr: &Addr, code: Bytes) {
        info!("set_code({}, {})", addr, code);
        self.get_account(addr).code = Some(code)
    }

    fn get_transformed_code(&self, addr: &Addr) -> Option<Bytes> {
        info!("get_transformed_code({})", addr);
        self.accounts
            .get(addr)
            .and_then(|acc| acc.transformed.clone())
    }

    fn set_transformed_code(&mut self, addr: &Addr, code: Option<Bytes>) {
        info!(
            "set_transformed_code({}, {})",
            addr,
            code.as_ref().map(|c| c.len()).unwrap_or(0)
        );
        self.get_account(addr).transformed = code
    }
}
