//! Calls into the runtime array family.
//!
//! Arrays are never laid out by generated code. Every construction, access,
//! and mutation goes through an externally linked runtime function named by
//! an operation prefix plus the element-type suffix, e.g. `array_get_f64`.
//! Multi-value operations (`push`, `unshift`, literal construction) pass
//! their elements through a stack-frame buffer: the values are stored into
//! the current frame and the runtime receives a pointer and a count.

use crate::codegen::types::{elem_suffix, map_ty};
use crate::errors::{HastyError, HastyResult};
use crate::lir::{Builder, Extern, Inst, IrType, Program, Value};
use crate::typing::Ty;

pub struct ArrayGen {
    elem: IrType,
}

impl ArrayGen {
    pub fn new(elem: IrType) -> ArrayGen {
        ArrayGen { elem }
    }

    /// Builds the generator for an `Array<T>` type.
    pub fn for_array_ty(ty: &Ty) -> HastyResult<ArrayGen> {
        match ty.element_ty() {
            Some(el) => Ok(ArrayGen::new(map_ty(el)?)),
            None => Err(HastyError::ty(format!(
                "expected an array type, found `{}`",
                ty
            ))),
        }
    }

    pub fn elem_ty(&self) -> IrType {
        self.elem
    }

    fn runtime_fn(
        &self,
        prog: &mut Program,
        op: &str,
        params: Vec<IrType>,
        ret_ty: Option<IrType>,
    ) -> String {
        let name = format!("{}_{}", op, elem_suffix(self.elem));
        prog.add_extern(Extern {
            name: name.clone(),
            params,
            ret_ty,
        });
        name
    }

    /// Stores `values` into a frame buffer and returns its address, or a
    /// null pointer when there are none.
    fn element_buffer(&self, builder: &mut Builder, values: Vec<Value>) -> Value {
        if values.is_empty() {
            return Value::NullPtr;
        }
        let stride = self.elem.size();
        let base = builder.stack_alloc(stride * values.len() as u32, stride);
        for (i, value) in values.into_iter().enumerate() {
            builder.emit(Inst::Store {
                addr: base.clone(),
                offset: stride * i as u32,
                ty: self.elem,
                value,
            });
        }
        base
    }

    /// `[a, b, c]`
    pub fn new_array(
        &self,
        builder: &mut Builder,
        prog: &mut Program,
        elements: Vec<Value>,
    ) -> Value {
        let count = elements.len() as i32;
        let buf = self.element_buffer(builder, elements);
        let name = self.runtime_fn(
            prog,
            "new_array",
            vec![IrType::I32, IrType::Ptr],
            Some(IrType::Ptr),
        );
        Value::Call {
            name,
            args: vec![Value::ConstI32(count), buf],
        }
    }

    /// `new Array(size)`; elements start zero-initialized.
    pub fn new_array_sized(&self, prog: &mut Program, size: Value) -> Value {
        let name = self.runtime_fn(
            prog,
            "new_array",
            vec![IrType::I32, IrType::Ptr],
            Some(IrType::Ptr),
        );
        Value::Call {
            name,
            args: vec![size, Value::NullPtr],
        }
    }

    pub fn get(&self, prog: &mut Program, array: Value, index: Value) -> Value {
        let name = self.runtime_fn(
            prog,
            "array_get",
            vec![IrType::Ptr, IrType::I32],
            Some(self.elem),
        );
        Value::Call {
            name,
            args: vec![array, index],
        }
    }

    pub fn set(
        &self,
        builder: &mut Builder,
        prog: &mut Program,
        array: Value,
        index: Value,
        value: Value,
    ) {
        let name = self.runtime_fn(
            prog,
            "array_set",
            vec![IrType::Ptr, IrType::I32, self.elem],
            None,
        );
        builder.emit(Inst::Eval(Value::Call {
            name,
            args: vec![array, index, value],
        }));
    }

    pub fn length(&self, prog: &mut Program, array: Value) -> Value {
        let name = self.runtime_fn(prog, "array_length", vec![IrType::Ptr], Some(IrType::I32));
        Value::Call {
            name,
            args: vec![array],
        }
    }

    pub fn set_length(
        &self,
        builder: &mut Builder,
        prog: &mut Program,
        array: Value,
        length: Value,
    ) {
        let name = self.runtime_fn(
            prog,
            "array_set_length",
            vec![IrType::Ptr, IrType::I32],
            None,
        );
        builder.emit(Inst::Eval(Value::Call {
            name,
            args: vec![array, length],
        }));
    }

    pub fn pop(&self, prog: &mut Program, array: Value) -> Value {
        let name = self.runtime_fn(prog, "array_pop", vec![IrType::Ptr], Some(self.elem));
        Value::Call {
            name,
            args: vec![array],
        }
    }

    pub fn shift(&self, prog: &mut Program, array: Value) -> Value {
        let name = self.runtime_fn(prog, "array_shift", vec![IrType::Ptr], Some(self.elem));
        Value::Call {
            name,
            args: vec![array],
        }
    }

    /// `push`/`unshift` return the new length.
    pub fn push(
        &self,
        builder: &mut Builder,
        prog: &mut Program,
        array: Value,
        values: Vec<Value>,
    ) -> Value {
        self.insert_many(builder, prog, "array_push", array, values)
    }

    pub fn unshift(
        &self,
        builder: &mut Builder,
        prog: &mut Program,
        array: Value,
        values: Vec<Value>,
    ) -> Value {
        self.insert_many(builder, prog, "array_unshift", array, values)
    }

    fn insert_many(
        &self,
        builder: &mut Builder,
        prog: &mut Program,
        op: &str,
        array: Value,
        values: Vec<Value>,
    ) -> Value {
        let count = values.len() as i32;
        let buf = self.element_buffer(builder, values);
        let name = self.runtime_fn(
            prog,
            op,
            vec![IrType::Ptr, IrType::Ptr, IrType::I32],
            Some(IrType::I32),
        );
        Value::Call {
            name,
            args: vec![array, buf, Value::ConstI32(count)],
        }
    }

    /// `fill(value)`, `fill(value, start)`, `fill(value, start, end)`; the
    /// two-argument runtime variant covers the missing-`end` forms.
    pub fn fill(
        &self,
        prog: &mut Program,
        array: Value,
        value: Value,
        start: Option<Value>,
        end: Option<Value>,
    ) -> Value {
        let start = start.unwrap_or(Value::ConstI32(0));
        match end {
            Some(end) => {
                let name = self.runtime_fn(
                    prog,
                    "array_fill_iii",
                    vec![IrType::Ptr, self.elem, IrType::I32, IrType::I32],
                    Some(IrType::Ptr),
                );
                Value::Call {
                    name,
                    args: vec![array, value, start, end],
                }
            }
            None => {
                let name = self.runtime_fn(
                    prog,
                    "array_fill_ii",
                    vec![IrType::Ptr, self.elem, IrType::I32],
                    Some(IrType::Ptr),
                );
                Value::Call {
                    name,
                    args: vec![array, value, start],
                }
            }
        }
    }

    /// Releases the array's storage. Emitted on scope exit for arrays the
    /// scope owns.
    pub fn delete(&self, builder: &mut Builder, prog: &mut Program, array: Value) {
        let name = self.runtime_fn(prog, "delete_array", vec![IrType::Ptr], None);
        builder.emit(Inst::Eval(Value::Call {
            name,
            args: vec![array],
        }));
    }
}

#[cfg(test)]
mod arrays_test {
    use super::*;

    #[test]
    fn test_suffixed_names() {
        let mut prog = Program::default();
        let arrays = ArrayGen::new(IrType::F64);
        let call = arrays.length(&mut prog, Value::Local(0));
        match call {
            Value::Call { name, .. } => assert_eq!(name, "array_length_f64"),
            other => panic!("expected a call, found {}", other),
        }
        assert_eq!(prog.externs.len(), 1);
    }

    #[test]
    fn test_literal_uses_frame_buffer() {
        let mut prog = Program::default();
        let mut builder = Builder::new("t", vec![], None, false);
        let arrays = ArrayGen::new(IrType::I32);
        let call = arrays.new_array(
            &mut builder,
            &mut prog,
            vec![Value::ConstI32(1), Value::ConstI32(2)],
        );
        match call {
            Value::Call { name, args } => {
                assert_eq!(name, "new_array_i32");
                assert_eq!(args[0], Value::ConstI32(2));
                assert_eq!(args[1], Value::StackAddr { offset: 0 });
            }
            other => panic!("expected a call, found {}", other),
        }
        let func = builder.finish();
        // Two stores into the element buffer.
        assert_eq!(func.blocks[0].insts.len(), 3);
        assert_eq!(func.frame_size, 16);
    }

    #[test]
    fn test_empty_literal_passes_null() {
        let mut prog = Program::default();
        let mut builder = Builder::new("t", vec![], None, false);
        let arrays = ArrayGen::new(IrType::I1);
        let call = arrays.new_array(&mut builder, &mut prog, vec![]);
        match call {
            Value::Call { args, .. } => assert_eq!(args[1], Value::NullPtr),
            other => panic!("expected a call, found {}", other),
        }
    }

    #[test]
    fn test_wrong_receiver_ty() {
        assert!(ArrayGen::for_array_ty(&Ty::Int).is_err());
    }
}
