//! The serialized shape of one object (or one class's statics) and its flat storage encoding:
//!
//! ```notrust
//! [u32 refCount] ref* [u32 primitiveLen] primitive bytes
//!
//! ref := [u32 0]                                   null
//!      | [u32 len > 0] [utf8 class name] [i64 id]  regular instance
//!      | [i32 -2] [u32 len] [utf8 class name]      class object
//!      | [i32 -1] [i64 constant id < 0]            VM constant
//! ```

use std::fmt;

use super::stream::{Decoder, Encoder};
use super::PersistError;
use crate::common::{BytesRef, InstanceId};
use crate::params::{REF_CLASS_OBJECT, REF_CONSTANT, REF_NULL};

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Reference {
    Null,
    Regular {
        class_name: String,
        instance_id: InstanceId,
    },
    ClassObject(String),
    Constant(i64),
}

impl Reference {
    pub fn regular(class_name: &str, instance_id: InstanceId) -> Self {
        Reference::Regular {
            class_name: class_name.to_string(),
            instance_id,
        }
    }

    fn encode_into(&self, e: &mut Encoder) {
        match self {
            Reference::Null => {
                e.write_int(REF_NULL);
            }
            Reference::Regular {
                class_name,
                instance_id,
            } => {
                debug_assert!(!class_name.is_empty());
                e.write_u32(class_name.len() as u32)
                    .write_bytes(class_name.as_bytes())
                    .write_long(*instance_id);
            }
            Reference::ClassObject(name) => {
                e.write_int(REF_CLASS_OBJECT)
                    .write_u32(name.len() as u32)
                    .write_bytes(name.as_bytes());
            }
            Reference::Constant(id) => {
                e.write_int(REF_CONSTANT).write_long(*id);
            }
        }
    }

    fn decode_from(d: &mut Decoder) -> Result<Self, PersistError> {
        let tag = d.read_int()?;
        Ok(match tag {
            REF_NULL => Reference::Null,
            REF_CONSTANT => {
                let id = d.read_long()?;
                if id >= 0 {
                    return Err(PersistError::MalformedExtent(format!(
                        "constant id {} is not negative",
                        id
                    )))
                }
                Reference::Constant(id)
            }
            REF_CLASS_OBJECT => {
                let len = d.read_u32()? as usize;
                Reference::ClassObject(read_name(d, len)?)
            }
            len if len > 0 => {
                let class_name = read_name(d, len as usize)?;
                let instance_id = d.read_long()?;
                if instance_id <= 0 {
                    return Err(PersistError::MalformedExtent(format!(
                        "instance id {} of `{}` is not positive",
                        instance_id, class_name
                    )))
                }
                Reference::Regular {
                    class_name,
                    instance_id,
                }
            }
            tag => {
                return Err(PersistError::MalformedExtent(format!(
                    "unknown reference discriminant {}",
                    tag
                )))
            }
        })
    }

    fn encoded_len(&self) -> usize {
        match self {
            Reference::Null => 4,
            Reference::Regular { class_name, .. } => 4 + class_name.len() + 8,
            Reference::ClassObject(name) => 4 + 4 + name.len(),
            Reference::Constant(_) => 4 + 8,
        }
    }
}

fn read_name(d: &mut Decoder, len: usize) -> Result<String, PersistError> {
    if len == 0 || len > d.remaining() {
        return Err(PersistError::MalformedExtent(format!(
            "class name length {} with {} bytes remaining",
            len,
            d.remaining()
        )))
    }
    String::from_utf8(d.read_bytes(len)?.to_vec()).map_err(|_| {
        PersistError::MalformedExtent("class name is not valid utf-8".into())
    })
}

/// Immutable pair of a primitive region and an ordered reference region.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    primitives: Box<[u8]>,
    references: Box<[Reference]>,
}

impl Extent {
    pub fn new(primitives: Vec<u8>, references: Vec<Reference>) -> Self {
        Self {
            primitives: primitives.into(),
            references: references.into(),
        }
    }

    pub fn primitives(&self) -> &[u8] {
        &self.primitives
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Size of the flat encoding, which is also what the fee processor is billed for.
    pub fn encoded_len(&self) -> usize {
        4 + self
            .references
            .iter()
            .map(Reference::encoded_len)
            .sum::<usize>() +
            4 +
            self.primitives.len()
    }

    pub fn encode_into(&self, e: &mut Encoder) {
        e.write_u32(self.references.len() as u32);
        for r in self.references.iter() {
            r.encode_into(e)
        }
        e.write_u32(self.primitives.len() as u32)
            .write_bytes(&self.primitives);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::with_capacity(self.encoded_len());
        self.encode_into(&mut e);
        e.to_bytes()
    }

    /// Decode one extent from the current position of a longer stream.
    pub fn decode_from(d: &mut Decoder) -> Result<Self, PersistError> {
        let nrefs = d.read_u32()? as usize;
        // every reference takes at least its 4-byte discriminant
        if nrefs.saturating_mul(4) > d.remaining() {
            return Err(PersistError::MalformedExtent(format!(
                "{} references declared with {} bytes remaining",
                nrefs,
                d.remaining()
            )))
        }
        let mut references = Vec::with_capacity(nrefs);
        for _ in 0..nrefs {
            references.push(Reference::decode_from(d)?)
        }
        let nprims = d.read_u32()? as usize;
        if nprims > d.remaining() {
            return Err(PersistError::MalformedExtent(format!(
                "{} primitive bytes declared with {} bytes remaining",
                nprims,
                d.remaining()
            )))
        }
        let primitives = d.read_bytes(nprims)?.to_vec();
        Ok(Self::new(primitives, references))
    }

    /// Decode a buffer that holds exactly one extent.
    pub fn decode(bytes: &[u8]) -> Result<Self, PersistError> {
        let mut d = Decoder::new(bytes);
        let extent = Self::decode_from(&mut d)?;
        d.finish()?;
        Ok(extent)
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extent")
            .field("primitives", &format_args!("{}", BytesRef::from(&self.primitives[..])))
            .field("references", &self.references)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Extent {
        Extent::new(
            vec![0, 0, 0, 7, 1, 2],
            vec![
                Reference::Null,
                Reference::regular("Node", 3),
                Reference::ClassObject("Node".into()),
                Reference::Constant(-5),
            ],
        )
    }

    #[test]
    fn test_flat_layout() {
        let e = Extent::new(vec![9], vec![Reference::regular("A", 2)]);
        assert_eq!(
            e.encode(),
            vec![
                0, 0, 0, 1, // refCount
                0, 0, 0, 1, b'A', 0, 0, 0, 0, 0, 0, 0, 2, // regular
                0, 0, 0, 1, 9 // primitives
            ]
        );
        let e = Extent::new(
            vec![],
            vec![
                Reference::Null,
                Reference::ClassObject("B".into()),
                Reference::Constant(-1),
            ],
        );
        assert_eq!(
            e.encode(),
            vec![
                0, 0, 0, 3, // refCount
                0, 0, 0, 0, // null
                0xff, 0xff, 0xff, 0xfe, 0, 0, 0, 1, b'B', // class object
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
                0xff, 0xff, // constant
                0, 0, 0, 0
            ]
        );
    }

    #[test]
    fn test_round_trip() {
        let e = sample();
        let bytes = e.encode();
        assert_eq!(bytes.len(), e.encoded_len());
        assert_eq!(Extent::decode(&bytes).unwrap(), e);
        assert_eq!(
            Extent::decode(&Extent::default().encode()).unwrap(),
            Extent::default()
        );
    }

    #[test]
    fn test_streamed_extents() {
        let a = sample();
        let b = Extent::new(vec![1], vec![]);
        let mut e = Encoder::new();
        a.encode_into(&mut e);
        b.encode_into(&mut e);
        let bytes = e.to_bytes();
        let mut d = Decoder::new(&bytes);
        assert_eq!(Extent::decode_from(&mut d).unwrap(), a);
        assert_eq!(Extent::decode_from(&mut d).unwrap(), b);
        d.finish().unwrap();
    }

    #[test]
    fn test_reject_oversized_lengths() {
        // primitive length beyond the buffer
        let bytes = [0, 0, 0, 0, 0, 0, 0, 9, 1, 2];
        assert!(matches!(
            Extent::decode(&bytes),
            Err(PersistError::MalformedExtent(_))
        ));
        // class name length beyond the buffer
        let bytes = [0, 0, 0, 1, 0, 0, 0, 40, b'A'];
        assert!(matches!(
            Extent::decode(&bytes),
            Err(PersistError::MalformedExtent(_))
        ));
        // absurd reference count
        let bytes = [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
        assert!(matches!(
            Extent::decode(&bytes),
            Err(PersistError::MalformedExtent(_))
        ));
    }

    #[test]
    fn test_reject_bad_descriptors() {
        let mut e = Encoder::new();
        e.write_u32(1).write_int(-7).write_u32(0);
        assert!(matches!(
            Extent::decode(&e.to_bytes()),
            Err(PersistError::MalformedExtent(_))
        ));
        let mut e = Encoder::new();
        e.write_u32(1).write_int(REF_CONSTANT).write_long(3).write_u32(0);
        assert!(matches!(
            Extent::decode(&e.to_bytes()),
            Err(PersistError::MalformedExtent(_))
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().encode();
        for cut in [1, 5, 13, bytes.len() - 1] {
            assert!(Extent::decode(&bytes[..cut]).is_err());
        }
    }
}
