use hex::ToHex;
use primitive_types::H256;
use sha3::Digest;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Identifier of a persisted instance. Positive ids are allocated per contract in strictly
/// increasing order; negative ids are reserved for the constant table.
pub type InstanceId = i64;

pub type BlockNumber = u64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Addr(H256);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct Hash(H256);

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Bytes(Vec<u8>);

// Addr

impl Addr {
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for Addr {
    fn from(bytes: [u8; 32]) -> Self {
        Self(H256(bytes))
    }
}

impl From<u64> for Addr {
    fn from(n: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Self(H256(bytes))
    }
}

impl FromStr for Addr {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.0.as_bytes().encode_hex::<String>())
    }
}

// Hash

impl Hash {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(sha3::Keccak256::digest(slice).as_slice())
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H256::from_slice(s))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Bytes

impl Bytes {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

/// Borrowed byte slice that prints as lower-case hex.
pub struct BytesRef<'a>(&'a [u8]);

impl<'a> From<&'a [u8]> for BytesRef<'a> {
    fn from(s: &'a [u8]) -> Self {
        Self(s)
    }
}

impl<'a> fmt::LowerHex for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.encode_hex::<String>())
    }
}

impl<'a> fmt::Display for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self)
    }
}

#[test]
fn test_addr_display() {
    let addr = Addr::from(0x1234);
    let s = addr.to_string();
    assert!(s.starts_with("0x"));
    assert!(s.ends_with("1234"));
    assert_eq!(Addr::from_str(&s[2..]).unwrap(), addr);
}
