use crate::common::InstanceId;

// reference descriptor discriminants (the leading i32 of each reference)
pub const REF_NULL: i32 = 0;
pub const REF_CONSTANT: i32 = -1;
pub const REF_CLASS_OBJECT: i32 = -2;

/// Storage key of the per-contract root record (class statics + next instance id).
pub const STATICS_KEY: &[u8] = b"\xffqavm.statics";
/// Instance records are stored under `INSTANCE_KEY_PREFIX || id (big-endian)`.
pub const INSTANCE_KEY_PREFIX: u8 = 0xfe;

pub const FIRST_INSTANCE_ID: InstanceId = 1;
/// Bytes taken by the identity hash code in front of every instance record.
pub const INSTANCE_HEADER_SIZE: usize = 4;

pub const TRANSFORMED_CODE_VERSION: u8 = 1;

pub const MAX_REENTRANT_DEPTH: usize = 10;

// energy charged by the default fee processor
pub const DEFAULT_ENERGY_LIMIT: u64 = 2_000_000;
pub const FEE_STORAGE_READ_BASE: u64 = 200;
pub const FEE_STORAGE_READ_BYTE: u64 = 3;
pub const FEE_STORAGE_WRITE_BASE: u64 = 1_000;
pub const FEE_STORAGE_WRITE_BYTE: u64 = 10;
pub const FEE_HEAP_BASE: u64 = 10;
pub const FEE_HEAP_BYTE: u64 = 1;

#[inline]
pub fn instance_key(id: InstanceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(INSTANCE_KEY_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}
