//! Mapping from front-end types to IR storage types, and the linear-memory
//! layout of class instances.

use crate::errors::{HastyError, HastyResult};
use crate::lir::IrType;
use crate::typing::{ClassTy, Ty};

/// Maps a value type down to its IR storage type. Anything outside the
/// compiled subset is a hard error here, not later.
pub fn map_ty(ty: &Ty) -> HastyResult<IrType> {
    match ty {
        Ty::Int => Ok(IrType::I32),
        Ty::Number => Ok(IrType::F64),
        Ty::Bool => Ok(IrType::I1),
        Ty::Array(_) | Ty::Object(_) | Ty::Func(..) => Ok(IrType::Ptr),
        Ty::Undefined => Err(HastyError::ty(str!(
            "`undefined` has no storage representation"
        ))),
        Ty::Void => Err(HastyError::ty(str!("`void` is not a value type"))),
        Ty::Any => Err(HastyError::unsupported(str!(
            "`any` is not part of the compiled subset; annotate the value with a concrete type"
        ))),
        Ty::Str => Err(HastyError::unsupported(str!(
            "strings are not part of the compiled subset"
        ))),
    }
}

/// Maps a function return type; `void` means no result.
pub fn map_ret_ty(ty: &Ty) -> HastyResult<Option<IrType>> {
    match ty {
        Ty::Void => Ok(None),
        other => map_ty(other).map(Some),
    }
}

/// The storage type and byte offset of a field inside an instance of
/// `class`. Fields are placed in declaration order; the running offset is
/// aligned up to each field's own size before placing it, so an 8-byte
/// field never sits at a non-8-aligned offset. The boundary marshaller
/// walks the same layout from the reflection table.
pub fn field_offset(class: &ClassTy, field: &str) -> HastyResult<(IrType, u32)> {
    let mut offset = 0u32;
    for (name, ty) in &class.fields {
        let ir_ty = map_ty(ty)
            .map_err(|e| e.in_context(format!("field `{}.{}`", class.name, name)))?;
        let size = ir_ty.size();
        offset = (offset + size - 1) & !(size - 1);
        if name == field {
            return Ok((ir_ty, offset));
        }
        offset += size;
    }
    Err(HastyError::ty(format!(
        "`{}` has no field named `{}`",
        class.name, field
    )))
}

/// The element-type suffix used to name runtime array functions.
pub fn elem_suffix(ty: IrType) -> &'static str {
    match ty {
        IrType::I1 => "i1",
        IrType::I8 => "i8",
        IrType::I32 => "i32",
        IrType::F64 => "f64",
        IrType::Ptr => "ptr",
    }
}
