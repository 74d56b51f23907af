pub mod dummy;
pub mod fixtures;
pub mod rocks;

/// Short printable form of a storage key.
pub fn key_to_str(key: &[u8]) -> String {
    match key.first() {
        Some(&qavm::params::INSTANCE_KEY_PREFIX) if key.len() == 9 => {
            let mut id = [0u8; 8];
            id.copy_from_slice(&key[1..]);
            format!("instance#{}", i64::from_be_bytes(id))
        }
        _ if key == qavm::params::STATICS_KEY => "statics".into(),
        _ => format!("0x{}", hex::encode(key)),
    }
}
