//! A kernel kept in RocksDB. Every entry lives under `[tag] [address] [key]`.

use std::path::Path;

use log::{error, trace};
use parking_lot::Mutex;
use rocksdb::{Options, DB};

use qavm::common::{Addr, Bytes};
use qavm::kernel::Kernel;

const TAG_STORAGE: u8 = b's';
const TAG_CODE: u8 = b'c';
const TAG_TRANSFORMED: u8 = b't';

pub struct RocksKernel {
    db: DB,
    /// first failure since the last [RocksKernel::take_error]
    error: Mutex<Option<rocksdb::Error>>,
}

fn gen_key(tag: u8, addr: &Addr, key: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(1 + 32 + key.len());
    k.push(tag);
    k.extend_from_slice(addr.as_bytes());
    k.extend_from_slice(key);
    k
}

impl RocksKernel {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rocksdb::Error> {
        Ok(Self::new(DB::open_default(path)?))
    }

    /// Open an existing database without write access. Every write through [Kernel] fails.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, rocksdb::Error> {
        Ok(Self::new(DB::open_for_read_only(&Options::default(), path, false)?))
    }

    pub fn new(db: DB) -> Self {
        Self {
            db,
            error: Mutex::new(None),
        }
    }

    pub fn db(&self) -> &DB {
        &self.db
    }

    /// Reads and writes can not fail through [Kernel], so the first failure is kept here until
    /// it is taken. The executor takes it through [Kernel::take_fault].
    pub fn take_error(&self) -> Option<rocksdb::Error> {
        self.error.lock().take()
    }

    fn record(&self, op: &str, e: rocksdb::Error) {
        error!("rocksdb {} failed: {}", op, e);
        self.error.lock().get_or_insert(e);
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        match self.db.get(key) {
            Ok(v) => v.map(Bytes::from),
            Err(e) => {
                self.record("read", e);
                None
            }
        }
    }

    fn put(&mut self, key: Vec<u8>, val: &[u8]) {
        trace!("rocksdb put 0x{} ({} bytes)", hex::encode(&key), val.len());
        if let Err(e) = self.db.put(key, val) {
            self.record("write", e)
        }
    }

    fn delete(&mut self, key: Vec<u8>) {
        if let Err(e) = self.db.delete(key) {
            self.record("delete", e)
        }
    }
}

impl Kernel for RocksKernel {
    fn get_storage(&self, addr: &Addr, key: &[u8]) -> Option<Bytes> {
        self.get(&gen_key(TAG_STORAGE, addr, key))
    }

    fn put_storage(&mut self, addr: &Addr, key: &[u8], val: Bytes) {
        self.put(gen_key(TAG_STORAGE, addr, key), &val)
    }

    fn get_code(&self, addr: &Addr) -> Option<Bytes> {
        self.get(&gen_key(TAG_CODE, addr, &[]))
    }

    fn set_code(&mut self, addr: &Addr, code: Bytes) {
        self.put(gen_key(TAG_CODE, addr, &[]), &code)
    }

    fn get_transformed_code(&self, addr: &Addr) -> Option<Bytes> {
        self.get(&gen_key(TAG_TRANSFORMED, addr, &[]))
    }

    fn set_transformed_code(&mut self, addr: &Addr, code: Option<Bytes>) {
        let key = gen_key(TAG_TRANSFORMED, addr, &[]);
        match code {
            Some(c) => self.put(key, &c),
            None => self.delete(key),
        }
    }

    fn take_fault(&self) -> Option<String> {
        self.take_error().map(|e| e.to_string())
    }
}
