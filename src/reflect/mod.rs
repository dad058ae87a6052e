//! Compiler-generated layout metadata.
//!
//! The boundary marshaller is the only consumer: it walks these records to
//! convert host values into linear-memory bytes and back. Types are keyed
//! by name; primitives use the storage-type names (`i1`, `i8`, `i32`,
//! `double`) and arrays are keyed as `Array<element>`. The table travels
//! next to the compiled binary as a bincode sidecar.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{HastyError, HastyResult};
use crate::typing::{ClassTy, Ty, TyCtx};

pub const TYPE_BOOL: &str = "i1";
pub const TYPE_I8: &str = "i8";
pub const TYPE_INT: &str = "i32";
pub const TYPE_DOUBLE: &str = "double";

/// The reflection key for a front-end type.
pub fn type_name(ty: &Ty) -> HastyResult<String> {
    match ty {
        Ty::Int => Ok(str!(TYPE_INT)),
        Ty::Number => Ok(str!(TYPE_DOUBLE)),
        Ty::Bool => Ok(str!(TYPE_BOOL)),
        Ty::Array(el) => Ok(format!("Array<{}>", type_name(el)?)),
        Ty::Object(name) => Ok(name.clone()),
        other => Err(HastyError::ty(format!(
            "`{}` has no reflected representation",
            other
        ))),
    }
}

/// The element key of an `Array<...>` key.
pub fn element_type_name(name: &str) -> Option<&str> {
    name.strip_prefix("Array<")?.strip_suffix(">")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldReflection {
    pub name: String,
    pub type_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeReflection {
    pub primitive: bool,
    pub fields: Vec<FieldReflection>,
    /// Host-side constructor identity; used by the marshaller to reject
    /// values of the wrong class.
    pub constructor: Option<String>,
    pub type_arguments: Vec<String>,
}

impl TypeReflection {
    fn primitive() -> TypeReflection {
        TypeReflection {
            primitive: true,
            fields: vec![],
            constructor: None,
            type_arguments: vec![],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectionTable {
    types: HashMap<String, TypeReflection>,
}

impl ReflectionTable {
    pub fn new() -> ReflectionTable {
        let mut table = ReflectionTable::default();
        for name in &[TYPE_BOOL, TYPE_I8, TYPE_INT, TYPE_DOUBLE] {
            table.types.insert(str!(*name), TypeReflection::primitive());
        }
        table
    }

    /// Builds the table for every class the front-end declared, plus any
    /// array types their fields mention.
    pub fn from_tyctx(tcx: &TyCtx) -> HastyResult<ReflectionTable> {
        let mut table = ReflectionTable::new();
        for class in tcx.classes() {
            table.add_class(class)?;
        }
        Ok(table)
    }

    pub fn add_class(&mut self, class: &ClassTy) -> HastyResult {
        let fields = class
            .fields
            .iter()
            .map(|(name, ty)| {
                let type_name = type_name(ty)
                    .map_err(|e| e.in_context(format!("field `{}.{}`", class.name, name)))?;
                self.add_ty(ty)?;
                Ok(FieldReflection {
                    name: name.clone(),
                    type_name,
                })
            })
            .collect::<HastyResult<Vec<_>>>()?;
        self.types.insert(
            class.name.clone(),
            TypeReflection {
                primitive: false,
                fields,
                constructor: Some(class.name.clone()),
                type_arguments: vec![],
            },
        );
        Ok(())
    }

    /// Registers an array key for `ty` (and its element chain) if needed.
    pub fn add_ty(&mut self, ty: &Ty) -> HastyResult {
        if let Ty::Array(el) = ty {
            self.add_ty(el)?;
            let key = type_name(ty)?;
            let el_name = type_name(el)?;
            self.types.entry(key).or_insert(TypeReflection {
                primitive: false,
                fields: vec![],
                constructor: None,
                type_arguments: vec![el_name],
            });
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeReflection> {
        self.types.get(name)
    }

    pub fn is_primitive(&self, name: &str) -> bool {
        self.types.get(name).map_or(false, |t| t.primitive)
    }

    /// Storage width in bytes. Everything that is not a known primitive is
    /// held by address.
    pub fn size_of(&self, name: &str) -> u32 {
        match name {
            TYPE_BOOL | TYPE_I8 => 1,
            TYPE_DOUBLE => 8,
            _ => 4,
        }
    }

    pub fn to_bytes(&self) -> HastyResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| HastyError::runtime(format!("could not encode reflection data: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> HastyResult<ReflectionTable> {
        bincode::deserialize(bytes)
            .map_err(|e| HastyError::runtime(format!("could not decode reflection data: {}", e)))
    }
}
