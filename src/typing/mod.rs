//! Front-end type descriptors.
//!
//! The front-end (parser and type checker) is an external collaborator; it
//! hands the code generator a fully annotated tree plus this module's
//! [`TyCtx`] for symbol and class-layout queries. All types in the compiled
//! subset are fully static; `any` exists only so the mapper can reject it.

use std::collections::HashMap;
use std::fmt;

use crate::utils::join;

bitflags! {
    pub struct TypeFlags: u32 {
        const INT_LIKE     = 1 << 0;
        const NUMBER_LIKE  = 1 << 1;
        const BOOLEAN_LIKE = 1 << 2;
        const OBJECT       = 1 << 3;
        const UNDEFINED    = 1 << 4;
        const VOID         = 1 << 5;
        const ANY          = 1 << 6;
        const STRING       = 1 << 7;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Ty {
    Int,
    Number,
    Bool,
    Void,
    Undefined,
    /// The untyped escape hatch. Never compilable; kept so the mapper can
    /// fail with a useful message instead of an unreachable arm.
    Any,
    /// Only valid as the type of a directive literal.
    Str,
    Array(Box<Ty>),
    /// An instance of the named class.
    Object(String),
    Func(Vec<Ty>, Box<Ty>),
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Int => write!(f, "int"),
            Ty::Number => write!(f, "number"),
            Ty::Bool => write!(f, "boolean"),
            Ty::Void => write!(f, "void"),
            Ty::Undefined => write!(f, "undefined"),
            Ty::Any => write!(f, "any"),
            Ty::Str => write!(f, "string"),
            Ty::Array(el) => write!(f, "Array<{}>", el),
            Ty::Object(name) => write!(f, "{}", name),
            Ty::Func(params, ret) => write!(f, "({}) -> {}", join(params, ", "), ret),
        }
    }
}

impl Ty {
    pub fn flags(&self) -> TypeFlags {
        match self {
            Ty::Int => TypeFlags::INT_LIKE,
            Ty::Number => TypeFlags::NUMBER_LIKE,
            Ty::Bool => TypeFlags::BOOLEAN_LIKE,
            Ty::Void => TypeFlags::VOID,
            Ty::Undefined => TypeFlags::UNDEFINED,
            Ty::Any => TypeFlags::ANY,
            Ty::Str => TypeFlags::STRING,
            Ty::Array(_) | Ty::Object(_) | Ty::Func(..) => TypeFlags::OBJECT,
        }
    }

    pub fn is_int_like(&self) -> bool {
        self.flags().contains(TypeFlags::INT_LIKE)
    }

    pub fn is_number_like(&self) -> bool {
        self.flags().contains(TypeFlags::NUMBER_LIKE)
    }

    pub fn is_bool_like(&self) -> bool {
        self.flags().contains(TypeFlags::BOOLEAN_LIKE)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Ty::Array(_))
    }

    pub fn element_ty(&self) -> Option<&Ty> {
        match self {
            Ty::Array(el) => Some(el),
            _ => None,
        }
    }

    pub fn try_borrow_fn(&self) -> Option<(&Vec<Ty>, &Ty)> {
        match self {
            Ty::Func(params, ret) => Some((params, ret)),
            _ => None,
        }
    }
}

/// The field layout of a compiled class, in declaration order. The boundary
/// marshaller derives byte offsets from this order, so it must match the
/// layout the compiler uses when emitting the type's storage.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassTy {
    pub name: String,
    pub fields: Vec<(String, Ty)>,
}

impl ClassTy {
    pub fn new<S: Into<String>>(name: S, fields: Vec<(String, Ty)>) -> ClassTy {
        ClassTy {
            name: name.into(),
            fields,
        }
    }
}

/// The symbol-resolution and type-query surface supplied by the front-end.
#[derive(Clone, Debug, Default)]
pub struct TyCtx {
    classes: HashMap<String, ClassTy>,
    fns: HashMap<String, Ty>,
}

impl TyCtx {
    pub fn new() -> TyCtx {
        TyCtx::default()
    }

    pub fn declare_class(&mut self, class: ClassTy) {
        self.classes.insert(class.name.clone(), class);
    }

    pub fn declare_fn<S: Into<String>>(&mut self, name: S, params: Vec<Ty>, ret: Ty) {
        self.fns.insert(name.into(), Ty::Func(params, Box::new(ret)));
    }

    pub fn get_class(&self, name: &str) -> Option<&ClassTy> {
        self.classes.get(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassTy> {
        self.classes.values()
    }

    pub fn get_fn(&self, name: &str) -> Option<(&Vec<Ty>, &Ty)> {
        self.fns.get(name).and_then(|ty| ty.try_borrow_fn())
    }

    pub fn has_fn(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }
}
