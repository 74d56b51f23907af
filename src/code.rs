//! Contract code as the executor sees it: the list of class declarations, in load order.
//!
//! Deployed (raw) code is the RLP list of class records. Transformed code is the same list,
//! validated and re-encoded, behind a one-byte version tag. Transformed code is what the kernel
//! and the execution cache keep.

use std::collections::HashSet;

use num_traits::FromPrimitive;
use rlp_derive::{RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::common::Bytes;
use crate::params::TRANSFORMED_CODE_VERSION;
use crate::persist::class::{ClassDecl, ClassRegistry, FieldDecl, FieldKind};
use crate::persist::PersistError;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("rlp: {0}")]
    Rlp(#[from] rlp::DecoderError),
    #[error("code declares no classes")]
    Empty,
    #[error("bad class name `{0}`")]
    BadClassName(String),
    #[error("class `{0}` is declared twice")]
    DuplicateClass(String),
    #[error("superclass `{superclass}` of `{class}` is not declared before it")]
    UnknownSuperclass { class: String, superclass: String },
    #[error("field `{field}` is declared twice in `{class}`")]
    DuplicateField { class: String, field: String },
    #[error("unknown field kind {0}")]
    BadFieldKind(u8),
    #[error("unsupported code version {0}")]
    Version(u8),
}

#[derive(Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
struct FieldRecord {
    name: String,
    kind: u8,
    is_static: bool,
}

#[derive(Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
struct ClassRecord {
    name: String,
    /// empty for a root class
    superclass: String,
    fields: Vec<FieldRecord>,
}

impl From<&ClassDecl> for ClassRecord {
    fn from(d: &ClassDecl) -> Self {
        Self {
            name: d.name.clone(),
            superclass: d.superclass.clone().unwrap_or_default(),
            fields: d
                .fields
                .iter()
                .map(|f| FieldRecord {
                    name: f.name.clone(),
                    kind: f.kind as u8,
                    is_static: f.is_static,
                })
                .collect(),
        }
    }
}

impl ClassRecord {
    fn into_decl(self) -> Result<ClassDecl, TransformError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for f in self.fields {
            let kind = FieldKind::from_u8(f.kind)
                .ok_or(TransformError::BadFieldKind(f.kind))?;
            fields.push(FieldDecl {
                name: f.name,
                kind,
                is_static: f.is_static,
            });
        }
        Ok(ClassDecl {
            name: self.name,
            superclass: if self.superclass.is_empty() {
                None
            } else {
                Some(self.superclass)
            },
            fields,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DAppCode {
    classes: Vec<ClassDecl>,
}

impl DAppCode {
    pub fn new(classes: Vec<ClassDecl>) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &[ClassDecl] {
        &self.classes
    }

    /// Raw (deployable) encoding.
    pub fn encode(&self) -> Vec<u8> {
        let records: Vec<ClassRecord> =
            self.classes.iter().map(ClassRecord::from).collect();
        let mut s = rlp::RlpStream::new();
        s.append_list::<ClassRecord, _>(&records);
        s.out().to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, TransformError> {
        let records: Vec<ClassRecord> = rlp::Rlp::new(raw).as_list()?;
        let classes = records
            .into_iter()
            .map(ClassRecord::into_decl)
            .collect::<Result<_, _>>()?;
        Ok(Self { classes })
    }

    pub fn to_transformed(&self) -> Bytes {
        let mut out = vec![TRANSFORMED_CODE_VERSION];
        out.extend(self.encode());
        out.into()
    }

    pub fn from_transformed(bytes: &[u8]) -> Result<Self, TransformError> {
        match bytes.first() {
            Some(&TRANSFORMED_CODE_VERSION) => Self::decode(&bytes[1..]),
            Some(v) => Err(TransformError::Version(*v)),
            None => Err(TransformError::Empty),
        }
    }

    /// Check that the classes can be loaded in the declared order.
    pub fn validate(&self) -> Result<(), TransformError> {
        if self.classes.is_empty() {
            return Err(TransformError::Empty)
        }
        let mut seen = HashSet::new();
        for c in self.classes.iter() {
            if c.name.is_empty() || c.name.starts_with('[') {
                return Err(TransformError::BadClassName(c.name.clone()))
            }
            if let Some(s) = &c.superclass {
                if !seen.contains(s.as_str()) {
                    return Err(TransformError::UnknownSuperclass {
                        class: c.name.clone(),
                        superclass: s.clone(),
                    })
                }
            }
            if !seen.insert(c.name.as_str()) {
                return Err(TransformError::DuplicateClass(c.name.clone()))
            }
            let mut fields = HashSet::new();
            for f in c.fields.iter() {
                if !fields.insert((f.is_static, f.name.as_str())) {
                    return Err(TransformError::DuplicateField {
                        class: c.name.clone(),
                        field: f.name.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<ClassRegistry, PersistError> {
        ClassRegistry::from_decls(&self.classes)
    }
}

/// Turns deployed code into the form the executor runs.
pub trait CodeTransformer: Send + Sync {
    fn transform(&self, raw: &[u8]) -> Result<Bytes, TransformError>;
}

/// Validates the class list and re-encodes it canonically.
pub struct StandardTransformer;

impl CodeTransformer for StandardTransformer {
    fn transform(&self, raw: &[u8]) -> Result<Bytes, TransformError> {
        let code = DAppCode::decode(raw)?;
        code.validate()?;
        Ok(code.to_transformed())
    }
}
