//! Object graph persistence: the byte-level codecs, the class field walker, the graph codec and
//! the two graph sessions built on it ([storage::StorageGraph] for the key-value store and
//! [reentrant::ReentrantGraph] for nested calls).

use thiserror::Error;

use crate::common::InstanceId;

pub mod class;
pub mod constants;
pub mod extent;
pub mod fee;
pub mod graph;
pub mod object;
pub mod reentrant;
pub mod storage;
pub mod stream;

pub use class::{ClassDecl, ClassRef, ClassRegistry, FieldDecl, FieldKind};
pub use constants::ConstantTable;
pub use extent::{Extent, Reference};
pub use fee::{ResourceExhausted, SharedFees, StorageFeeProcessor};
pub use object::{Instance, Node, ObjectRef, Value};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("buffer underflow at offset {offset}: need {needed} bytes, {remaining} left")]
    Underflow {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("malformed extent: {0}")]
    MalformedExtent(String),
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("class `{0}` is already defined")]
    DuplicateClass(String),
    #[error("unknown constant {0}")]
    UnknownConstant(i64),
    #[error("unknown field `{field}` of `{class}`")]
    UnknownField { class: String, field: String },
    #[error("two live objects claim instance id {0}")]
    IdentityViolation(InstanceId),
    #[error("stub of instance {0} outlived its graph")]
    DetachedStub(InstanceId),
    #[error("instance {0} is missing from storage")]
    MissingInstance(InstanceId),
    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhausted),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}
