//! The boundary marshaller.
//!
//! Host values live in an arena and are addressed by [`ObjRef`] handles;
//! linear-memory values are addresses. One [`ConversionScope`] spans a
//! single boundary crossing and keeps the two identity maps that make
//! shared references and cycles come out as shared addresses (and back).
//! A reference is recorded in its scope map immediately after its storage
//! is allocated, before any element or field conversion recurses, so a
//! cycle closes onto the allocation in flight instead of recursing forever.

use fnv::FnvHashMap;

use crate::errors::{HastyError, HastyResult};
use crate::loader::memory::Heap;
use crate::reflect::{ReflectionTable, TypeReflection, TYPE_BOOL, TYPE_DOUBLE, TYPE_I8};

/// Handle into the host arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Double(f64),
    Ref(ObjRef),
}

#[derive(Clone, Debug, PartialEq)]
pub enum HostObject {
    Array(Vec<HostValue>),
    Instance {
        class: String,
        fields: FnvHashMap<String, HostValue>,
    },
}

/// Arena of host-side objects. Handles are never invalidated; the arena
/// only grows for the lifetime of one loader.
#[derive(Default)]
pub struct HostHeap {
    objects: Vec<HostObject>,
}

impl HostHeap {
    pub fn new() -> HostHeap {
        HostHeap::default()
    }

    pub fn alloc(&mut self, object: HostObject) -> ObjRef {
        self.objects.push(object);
        ObjRef(self.objects.len() as u32 - 1)
    }

    pub fn get(&self, r: ObjRef) -> &HostObject {
        &self.objects[r.0 as usize]
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut HostObject {
        &mut self.objects[r.0 as usize]
    }
}

/// A raw value on the compiled side of the boundary.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WasmWord {
    I32(i32),
    F64(f64),
}

impl WasmWord {
    pub fn as_i32(&self) -> i32 {
        match self {
            WasmWord::I32(i) => *i,
            WasmWord::F64(x) => *x as i32,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            WasmWord::I32(i) => *i as f64,
            WasmWord::F64(x) => *x,
        }
    }
}

/// Identity maps for one boundary crossing.
#[derive(Default)]
pub struct ConversionScope {
    to_addr: FnvHashMap<ObjRef, u32>,
    to_ref: FnvHashMap<u32, ObjRef>,
}

impl ConversionScope {
    pub fn new() -> ConversionScope {
        ConversionScope::default()
    }
}

/// A view over a runtime array's three-word descriptor: the element-buffer
/// begin address, the one-past-the-end back address, and the length.
pub struct RuntimeArrayView {
    pub begin: u32,
    pub back: u32,
    pub length: u32,
}

impl RuntimeArrayView {
    pub fn read(heap: &Heap, ptr: u32) -> HastyResult<RuntimeArrayView> {
        Ok(RuntimeArrayView {
            begin: heap.mem.read_i32(ptr)? as u32,
            back: heap.mem.read_i32(ptr + 4)? as u32,
            length: heap.mem.read_i32(ptr + 8)? as u32,
        })
    }

    pub fn len(&self, elem_size: u32) -> u32 {
        (self.back - self.begin) / elem_size
    }

    /// Addresses of the elements `start..end`, with the source language's
    /// slice conventions: a negative start counts from the end, a start
    /// past the end is empty, and the end is clamped to the length.
    pub fn sub_range(&self, elem_size: u32, start: i32, end: Option<i32>) -> (u32, u32) {
        let len = self.len(elem_size) as i64;
        let start = if start < 0 {
            (len + start as i64).max(0)
        } else {
            start as i64
        };
        let end = match end {
            Some(e) if e < 0 => (len + e as i64).max(0),
            Some(e) => (e as i64).min(len),
            None => len,
        };
        if start >= len || end <= start {
            return (self.begin + (start.min(len) as u32) * elem_size, 0);
        }
        (
            self.begin + start as u32 * elem_size,
            (end - start) as u32,
        )
    }
}

pub struct Marshaller<'a> {
    types: &'a ReflectionTable,
    pub heap: &'a mut Heap,
    pub host: &'a mut HostHeap,
}

impl<'a> Marshaller<'a> {
    pub fn new(
        types: &'a ReflectionTable,
        heap: &'a mut Heap,
        host: &'a mut HostHeap,
    ) -> Marshaller<'a> {
        Marshaller { types, heap, host }
    }

    fn reflection(&self, type_name: &str) -> HastyResult<&'a TypeReflection> {
        self.types
            .get(type_name)
            .ok_or_else(|| HastyError::runtime(format!("unknown type `{}`", type_name)))
    }

    /// Total instance size: field sizes summed with per-field alignment.
    fn object_size(&self, ty: &TypeReflection) -> u32 {
        ty.fields.iter().fold(0, |offset, field| {
            let size = self.types.size_of(&field.type_name);
            let offset = (offset + size - 1) & !(size - 1);
            offset + size
        })
    }

    fn element_type(&self, type_name: &str, ty: &TypeReflection) -> HastyResult<String> {
        ty.type_arguments.first().cloned().ok_or_else(|| {
            HastyError::runtime(format!("`{}` has no element type", type_name))
        })
    }

    fn write_word(&mut self, addr: u32, word: WasmWord, type_name: &str) -> HastyResult {
        match type_name {
            TYPE_BOOL | TYPE_I8 => self.heap.mem.write_i8(addr, word.as_i32() as i8),
            TYPE_DOUBLE => self.heap.mem.write_f64(addr, word.as_f64()),
            _ => self.heap.mem.write_i32(addr, word.as_i32()),
        }
    }

    fn read_word(&self, addr: u32, type_name: &str) -> HastyResult<WasmWord> {
        Ok(match type_name {
            TYPE_BOOL | TYPE_I8 => WasmWord::I32(self.heap.mem.read_i8(addr)? as i32),
            TYPE_DOUBLE => WasmWord::F64(self.heap.mem.read_f64(addr)?),
            _ => WasmWord::I32(self.heap.mem.read_i32(addr)?),
        })
    }

    /// Host → compiled. Primitives pass through; references are allocated
    /// in linear memory (or resolved through the scope's identity map).
    pub fn to_compiled(
        &mut self,
        value: &HostValue,
        type_name: &str,
        scope: &mut ConversionScope,
    ) -> HastyResult<WasmWord> {
        let ty = self.reflection(type_name)?;
        if ty.primitive {
            return match (type_name, value) {
                (TYPE_BOOL, HostValue::Bool(b)) => Ok(WasmWord::I32(*b as i32)),
                (TYPE_DOUBLE, HostValue::Double(x)) => Ok(WasmWord::F64(*x)),
                (TYPE_DOUBLE, HostValue::Int(i)) => Ok(WasmWord::F64(*i as f64)),
                (_, HostValue::Int(i)) => Ok(WasmWord::I32(*i)),
                _ => Err(HastyError::runtime(format!(
                    "expected a `{}` value, found {:?}",
                    type_name, value
                ))),
            };
        }
        let r = match value {
            HostValue::Undefined => return Ok(WasmWord::I32(0)),
            HostValue::Null => {
                return Err(HastyError::runtime(str!(
                    "null values cannot cross the boundary"
                )))
            }
            HostValue::Ref(r) => *r,
            other => {
                return Err(HastyError::runtime(format!(
                    "expected a reference for `{}`, found {:?}",
                    type_name, other
                )))
            }
        };
        if let Some(&addr) = scope.to_addr.get(&r) {
            return Ok(WasmWord::I32(addr as i32));
        }
        let addr = match self.host.get(r).clone() {
            HostObject::Array(elements) => {
                self.array_to_compiled(r, &elements, type_name, ty, scope)?
            }
            HostObject::Instance { class, fields } => {
                self.instance_to_compiled(r, &class, &fields, type_name, ty, scope)?
            }
        };
        Ok(WasmWord::I32(addr as i32))
    }

    fn array_to_compiled(
        &mut self,
        r: ObjRef,
        elements: &[HostValue],
        type_name: &str,
        ty: &TypeReflection,
        scope: &mut ConversionScope,
    ) -> HastyResult<u32> {
        let elem_ty = self.element_type(type_name, ty)?;
        let elem_size = self.types.size_of(&elem_ty);
        // begin, back, length
        let ptr = self.heap.alloc(12)?;
        let begin = self.heap.alloc(elem_size * elements.len() as u32)?;
        let back = begin + elem_size * elements.len() as u32;
        self.heap.mem.write_i32(ptr, begin as i32)?;
        self.heap.mem.write_i32(ptr + 4, back as i32)?;
        self.heap.mem.write_i32(ptr + 8, elements.len() as i32)?;
        // Record before converting elements; a cycle resolves to this
        // address instead of recursing.
        scope.to_addr.insert(r, ptr);
        scope.to_ref.insert(ptr, r);
        if self.reflection(&elem_ty)?.primitive {
            // Primitive elements never allocate, so the whole buffer can be
            // encoded up front and copied in one write.
            let mut buf = Vec::with_capacity((elem_size as usize) * elements.len());
            for element in elements {
                match self.to_compiled(element, &elem_ty, scope)? {
                    WasmWord::F64(x) => buf.extend_from_slice(&x.to_le_bytes()),
                    WasmWord::I32(i) if elem_size == 1 => buf.push(i as u8),
                    WasmWord::I32(i) => buf.extend_from_slice(&i.to_le_bytes()),
                }
            }
            self.heap.mem.write_bytes(begin, &buf)?;
        } else {
            for (i, element) in elements.iter().enumerate() {
                let word = self.to_compiled(element, &elem_ty, scope)?;
                self.write_word(begin + i as u32 * elem_size, word, &elem_ty)?;
            }
        }
        Ok(ptr)
    }

    fn instance_to_compiled(
        &mut self,
        r: ObjRef,
        class: &str,
        fields: &FnvHashMap<String, HostValue>,
        type_name: &str,
        ty: &TypeReflection,
        scope: &mut ConversionScope,
    ) -> HastyResult<u32> {
        match &ty.constructor {
            Some(ctor) if ctor == class => {}
            Some(ctor) => {
                return Err(HastyError::runtime(format!(
                    "expected an instance of `{}`, found `{}` (subtyping does not cross the boundary)",
                    ctor, class
                )))
            }
            None => {
                return Err(HastyError::runtime(format!(
                    "`{}` is not constructible",
                    type_name
                )))
            }
        }
        let size = self.object_size(ty);
        let ptr = self.heap.alloc(size)?;
        scope.to_addr.insert(r, ptr);
        scope.to_ref.insert(ptr, r);

        let mut offset = 0u32;
        for field in &ty.fields {
            let field_size = self.types.size_of(&field.type_name);
            offset = (offset + field_size - 1) & !(field_size - 1);
            let value = fields
                .get(&field.name)
                .cloned()
                .unwrap_or(HostValue::Undefined);
            let word = self.to_compiled(&value, &field.type_name, scope)?;
            self.write_word(ptr + offset, word, &field.type_name)?;
            offset += field_size;
        }
        Ok(ptr)
    }

    /// Compiled → host, symmetric with [`Marshaller::to_compiled`] via the
    /// address-keyed side of the scope.
    pub fn to_host(
        &mut self,
        word: WasmWord,
        type_name: &str,
        scope: &mut ConversionScope,
    ) -> HastyResult<HostValue> {
        let ty = self.reflection(type_name)?;
        if ty.primitive {
            return Ok(match type_name {
                TYPE_BOOL => HostValue::Bool(word.as_i32() != 0),
                TYPE_DOUBLE => HostValue::Double(word.as_f64()),
                _ => HostValue::Int(word.as_i32()),
            });
        }
        let addr = word.as_i32() as u32;
        if addr == 0 {
            return Ok(HostValue::Undefined);
        }
        if let Some(&r) = scope.to_ref.get(&addr) {
            return Ok(HostValue::Ref(r));
        }
        let r = if ty.constructor.is_none() || !ty.type_arguments.is_empty() {
            self.array_to_host(addr, type_name, ty, scope)?
        } else {
            self.instance_to_host(addr, ty, scope)?
        };
        Ok(HostValue::Ref(r))
    }

    fn array_to_host(
        &mut self,
        addr: u32,
        type_name: &str,
        ty: &TypeReflection,
        scope: &mut ConversionScope,
    ) -> HastyResult<ObjRef> {
        let elem_ty = self.element_type(type_name, ty)?;
        let elem_size = self.types.size_of(&elem_ty);
        let view = RuntimeArrayView::read(self.heap, addr)?;
        let count = view.len(elem_size);

        let r = self.host.alloc(HostObject::Array(vec![]));
        scope.to_ref.insert(addr, r);
        scope.to_addr.insert(r, addr);

        let mut elements = Vec::with_capacity(count as usize);
        for i in 0..count {
            let word = self.read_word(view.begin + i * elem_size, &elem_ty)?;
            elements.push(self.to_host(word, &elem_ty, scope)?);
        }
        match self.host.get_mut(r) {
            HostObject::Array(slot) => *slot = elements,
            _ => unreachable!(),
        }
        Ok(r)
    }

    fn instance_to_host(
        &mut self,
        addr: u32,
        ty: &TypeReflection,
        scope: &mut ConversionScope,
    ) -> HastyResult<ObjRef> {
        let class = ty
            .constructor
            .clone()
            .unwrap_or_else(|| panic!("COMPILER BUG: instance type without constructor"));
        // A fresh instance; no constructor side effects run.
        let r = self.host.alloc(HostObject::Instance {
            class,
            fields: FnvHashMap::default(),
        });
        scope.to_ref.insert(addr, r);
        scope.to_addr.insert(r, addr);

        let mut offset = 0u32;
        let mut values = FnvHashMap::default();
        for field in &ty.fields {
            let field_size = self.types.size_of(&field.type_name);
            offset = (offset + field_size - 1) & !(field_size - 1);
            let word = self.read_word(addr + offset, &field.type_name)?;
            values.insert(
                field.name.clone(),
                self.to_host(word, &field.type_name, scope)?,
            );
            offset += field_size;
        }
        match self.host.get_mut(r) {
            HostObject::Instance { fields, .. } => *fields = values,
            _ => unreachable!(),
        }
        Ok(r)
    }
}

#[cfg(test)]
mod marshal_test {
    use super::*;
    use crate::loader::memory::LoaderConfig;
    use crate::typing::{ClassTy, Ty};

    fn setup() -> (ReflectionTable, Heap, HostHeap) {
        let mut types = ReflectionTable::new();
        types
            .add_class(&ClassTy::new(
                "Point",
                vec![
                    (str!("flag"), Ty::Bool),
                    (str!("x"), Ty::Number),
                    (str!("y"), Ty::Number),
                ],
            ))
            .unwrap();
        types.add_ty(&Ty::Array(Box::new(Ty::Int))).unwrap();
        types.add_ty(&Ty::Array(Box::new(Ty::Bool))).unwrap();
        types
            .add_ty(&Ty::Array(Box::new(Ty::Object(str!("Point")))))
            .unwrap();
        let heap = Heap::new(&LoaderConfig {
            total_stack: 4096,
            initial_memory: 256 * 1024,
            global_base: 1024,
            static_bump: 0,
        })
        .unwrap();
        (types, heap, HostHeap::new())
    }

    #[test]
    fn test_primitive_round_trip() {
        let (types, mut heap, mut host) = setup();
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        let w = m
            .to_compiled(&HostValue::Bool(true), "i1", &mut scope)
            .unwrap();
        assert_eq!(w, WasmWord::I32(1));
        assert_eq!(
            m.to_host(w, "i1", &mut scope).unwrap(),
            HostValue::Bool(true)
        );
    }

    #[test]
    fn test_null_is_rejected_undefined_is_zero() {
        let (types, mut heap, mut host) = setup();
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        assert!(m
            .to_compiled(&HostValue::Null, "Array<i32>", &mut scope)
            .is_err());
        assert_eq!(
            m.to_compiled(&HostValue::Undefined, "Array<i32>", &mut scope)
                .unwrap(),
            WasmWord::I32(0)
        );
        assert_eq!(
            m.to_host(WasmWord::I32(0), "Point", &mut scope).unwrap(),
            HostValue::Undefined
        );
    }

    #[test]
    fn test_double_array_bulk_encoding() {
        let (mut types, mut heap, mut host) = setup();
        types.add_ty(&Ty::Array(Box::new(Ty::Number))).unwrap();
        let array = host.alloc(HostObject::Array(vec![
            HostValue::Double(1.5),
            HostValue::Int(2),
        ]));
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        let w = m
            .to_compiled(&HostValue::Ref(array), "Array<double>", &mut scope)
            .unwrap();
        let begin = m.heap.mem.read_i32(w.as_i32() as u32).unwrap() as u32;
        assert_eq!(m.heap.mem.read_f64(begin).unwrap(), 1.5);
        // ints coerce to doubles inside a double array
        assert_eq!(m.heap.mem.read_f64(begin + 8).unwrap(), 2.0);
    }

    #[test]
    fn test_int_array_round_trip() {
        let (types, mut heap, mut host) = setup();
        let array = host.alloc(HostObject::Array(vec![
            HostValue::Int(3),
            HostValue::Int(1),
            HostValue::Int(4),
        ]));
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        let w = m
            .to_compiled(&HostValue::Ref(array), "Array<i32>", &mut scope)
            .unwrap();

        // Fresh scope, as a call return would use.
        let mut back_scope = ConversionScope::new();
        let result = m.to_host(w, "Array<i32>", &mut back_scope).unwrap();
        let r = match result {
            HostValue::Ref(r) => r,
            other => panic!("expected a reference, found {:?}", other),
        };
        assert_eq!(
            m.host.get(r),
            &HostObject::Array(vec![
                HostValue::Int(3),
                HostValue::Int(1),
                HostValue::Int(4),
            ])
        );
    }

    #[test]
    fn test_bool_array_decodes_nonzero_bytes() {
        let (types, mut heap, mut host) = setup();
        let array = host.alloc(HostObject::Array(vec![
            HostValue::Bool(true),
            HostValue::Bool(false),
        ]));
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        let w = m
            .to_compiled(&HostValue::Ref(array), "Array<i1>", &mut scope)
            .unwrap();
        // Scribble a nonzero byte over the first element; it must still
        // decode as a boolean, not a raw byte.
        let view = RuntimeArrayView::read(m.heap, match w {
            WasmWord::I32(p) => p as u32,
            _ => unreachable!(),
        })
        .unwrap();
        m.heap.mem.write_i8(view.begin, 7).unwrap();

        let mut back = ConversionScope::new();
        let result = m.to_host(w, "Array<i1>", &mut back).unwrap();
        let r = match result {
            HostValue::Ref(r) => r,
            other => panic!("expected a reference, found {:?}", other),
        };
        assert_eq!(
            m.host.get(r),
            &HostObject::Array(vec![HostValue::Bool(true), HostValue::Bool(false)])
        );
    }

    #[test]
    fn test_instance_field_alignment() {
        let (types, mut heap, mut host) = setup();
        let mut fields = FnvHashMap::default();
        fields.insert(str!("flag"), HostValue::Bool(true));
        fields.insert(str!("x"), HostValue::Double(1.5));
        fields.insert(str!("y"), HostValue::Double(-2.5));
        let point = host.alloc(HostObject::Instance {
            class: str!("Point"),
            fields,
        });
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        let w = m
            .to_compiled(&HostValue::Ref(point), "Point", &mut scope)
            .unwrap();
        let ptr = w.as_i32() as u32;
        // flag at 0, x aligned up to 8, y at 16
        assert_eq!(m.heap.mem.read_i8(ptr).unwrap(), 1);
        assert_eq!(m.heap.mem.read_f64(ptr + 8).unwrap(), 1.5);
        assert_eq!(m.heap.mem.read_f64(ptr + 16).unwrap(), -2.5);
    }

    #[test]
    fn test_constructor_identity_is_enforced() {
        let (types, mut heap, mut host) = setup();
        let other = host.alloc(HostObject::Instance {
            class: str!("Circle"),
            fields: FnvHashMap::default(),
        });
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        assert!(m
            .to_compiled(&HostValue::Ref(other), "Point", &mut scope)
            .is_err());
    }

    #[test]
    fn test_shared_reference_shares_address() {
        let (types, mut heap, mut host) = setup();
        let mut fields = FnvHashMap::default();
        fields.insert(str!("flag"), HostValue::Bool(false));
        fields.insert(str!("x"), HostValue::Double(0.0));
        fields.insert(str!("y"), HostValue::Double(0.0));
        let point = host.alloc(HostObject::Instance {
            class: str!("Point"),
            fields,
        });
        // The same point twice in one array.
        let array = host.alloc(HostObject::Array(vec![
            HostValue::Ref(point),
            HostValue::Ref(point),
        ]));
        let mut m = Marshaller::new(&types, &mut heap, &mut host);
        let mut scope = ConversionScope::new();
        let w = m
            .to_compiled(&HostValue::Ref(array), "Array<Point>", &mut scope)
            .unwrap();
        let view = RuntimeArrayView::read(m.heap, w.as_i32() as u32).unwrap();
        let first = m.heap.mem.read_i32(view.begin).unwrap();
        let second = m.heap.mem.read_i32(view.begin + 4).unwrap();
        assert_eq!(first, second);

        // And back: one shared handle, not two copies.
        let mut back = ConversionScope::new();
        let result = m.to_host(w, "Array<Point>", &mut back).unwrap();
        let r = match result {
            HostValue::Ref(r) => r,
            other => panic!("expected a reference, found {:?}", other),
        };
        match m.host.get(r) {
            HostObject::Array(elements) => assert_eq!(elements[0], elements[1]),
            other => panic!("expected an array, found {:?}", other),
        }
    }

    #[test]
    fn test_sub_range_conventions() {
        let view = RuntimeArrayView {
            begin: 100,
            back: 120,
            length: 5,
        };
        // 5 i32 elements
        assert_eq!(view.sub_range(4, 1, Some(3)), (104, 2));
        assert_eq!(view.sub_range(4, -2, None), (112, 2));
        assert_eq!(view.sub_range(4, 9, None).1, 0);
        assert_eq!(view.sub_range(4, 0, Some(99)), (100, 5));
        assert_eq!(view.sub_range(4, 3, Some(2)).1, 0);
    }
}
