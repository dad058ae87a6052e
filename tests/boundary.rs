#![cfg(test)]

use fnv::FnvHashMap;
use hasty::ast::{Expr, ExprKind, FunctionDecl, ParamDecl, Program, Stmt, DIRECTIVE};
use hasty::codegen;
use hasty::loader::marshal::{ConversionScope, HostObject, HostValue};
use hasty::loader::memory::LoaderConfig;
use hasty::loader::ModuleLoader;
use hasty::typing::{ClassTy, Ty, TyCtx};

fn small_config() -> LoaderConfig {
    LoaderConfig {
        total_stack: 8 * 1024,
        initial_memory: 512 * 1024,
        global_base: 1024,
        static_bump: 0,
    }
}

/// function first(values: Array<number>): number {
///     "use hasty";
///     return values[0];
/// }
fn first_decl() -> FunctionDecl {
    let values = Expr::new(
        ExprKind::Ident("values".to_string()),
        Ty::Array(Box::new(Ty::Number)),
    );
    FunctionDecl {
        name: "first".to_string(),
        params: vec![ParamDecl {
            name: "values".to_string(),
            ty: Ty::Array(Box::new(Ty::Number)),
        }],
        ret_ty: Ty::Number,
        body: vec![
            Stmt::Expr(Expr::new(ExprKind::Str(DIRECTIVE.to_string()), Ty::Str)),
            Stmt::Return(Some(Expr::new(
                ExprKind::Index {
                    object: Box::new(values),
                    index: Box::new(Expr::new(ExprKind::Int(0), Ty::Int)),
                },
                Ty::Number,
            ))),
        ],
        exported: true,
    }
}

fn point_class() -> ClassTy {
    ClassTy::new(
        "Point",
        vec![
            ("flag".to_string(), Ty::Bool),
            ("x".to_string(), Ty::Number),
            ("y".to_string(), Ty::Number),
        ],
    )
}

fn point(host: &mut hasty::loader::marshal::HostHeap, x: f64, y: f64) -> HostValue {
    let mut fields = FnvHashMap::default();
    fields.insert("flag".to_string(), HostValue::Bool(x < y));
    fields.insert("x".to_string(), HostValue::Double(x));
    fields.insert("y".to_string(), HostValue::Double(y));
    HostValue::Ref(host.alloc(HostObject::Instance {
        class: "Point".to_string(),
        fields,
    }))
}

#[test]
fn compiled_module_carries_a_reflection_sidecar() {
    let program = Program::new(vec![first_decl()]);
    let mut tcx = TyCtx::new();
    tcx.declare_fn("first", vec![Ty::Array(Box::new(Ty::Number))], Ty::Number);
    let compiled = codegen::compile(&program, &tcx).unwrap();

    assert!(compiled.types.get("Array<double>").is_some());
    assert!(compiled.types.get("double").is_some());
    assert_eq!(compiled.types.size_of("double"), 8);
}

#[test]
fn loader_accepts_the_compiled_binary_and_marshals_through_it() {
    let program = Program::new(vec![first_decl()]);
    let mut tcx = TyCtx::new();
    tcx.declare_fn("first", vec![Ty::Array(Box::new(Ty::Number))], Ty::Number);
    let compiled = codegen::compile(&program, &tcx).unwrap();

    let sidecar = compiled.types.to_bytes().unwrap();
    let bytes = parity_wasm::serialize(compiled.module).unwrap();
    let mut loader = ModuleLoader::with_sidecar(
        bytes,
        &sidecar,
        vec!["first".to_string()],
        small_config(),
    )
    .unwrap();

    // The array argument crosses the boundary: three doubles laid out
    // contiguously behind a descriptor.
    let array = {
        let loaded = loader.load().unwrap();
        loaded.host.alloc(HostObject::Array(vec![
            HostValue::Double(2.5),
            HostValue::Double(-1.0),
            HostValue::Double(0.0),
        ]))
    };
    let mut scope = ConversionScope::new();
    let mut m = loader.marshaller().unwrap();
    let word = m
        .to_compiled(&HostValue::Ref(array), "Array<double>", &mut scope)
        .unwrap();
    let ptr = word.as_i32() as u32;
    let begin = m.heap.mem.read_i32(ptr).unwrap() as u32;
    assert_eq!(m.heap.mem.read_i32(ptr + 8).unwrap(), 3);
    assert_eq!(m.heap.mem.read_f64(begin).unwrap(), 2.5);
    assert_eq!(m.heap.mem.read_f64(begin + 16).unwrap(), 0.0);
}

#[test]
fn round_trip_preserves_structure_and_sharing() {
    let mut types = hasty::reflect::ReflectionTable::new();
    types.add_class(&point_class()).unwrap();
    types
        .add_ty(&Ty::Array(Box::new(Ty::Object("Point".to_string()))))
        .unwrap();

    let mut heap = hasty::loader::memory::Heap::new(&small_config()).unwrap();
    let mut host = hasty::loader::marshal::HostHeap::new();
    let shared = point(&mut host, 1.0, 2.0);
    let other = point(&mut host, -3.0, 4.5);
    let array = host.alloc(HostObject::Array(vec![
        shared.clone(),
        other,
        shared.clone(),
    ]));

    let mut m = hasty::loader::marshal::Marshaller::new(&types, &mut heap, &mut host);
    let mut out = ConversionScope::new();
    let word = m
        .to_compiled(&HostValue::Ref(array), "Array<Point>", &mut out)
        .unwrap();

    let mut back = ConversionScope::new();
    let returned = m.to_host(word, "Array<Point>", &mut back).unwrap();
    let r = match returned {
        HostValue::Ref(r) => r,
        other => panic!("expected a reference, found {:?}", other),
    };
    let elements = match m.host.get(r).clone() {
        HostObject::Array(elements) => elements,
        other => panic!("expected an array, found {:?}", other),
    };
    assert_eq!(elements.len(), 3);
    // Identity survives both directions.
    assert_eq!(elements[0], elements[2]);
    assert_ne!(elements[0], elements[1]);
    // And so does structure.
    let first = match &elements[0] {
        HostValue::Ref(r) => m.host.get(*r).clone(),
        other => panic!("expected a reference, found {:?}", other),
    };
    match first {
        HostObject::Instance { class, fields } => {
            assert_eq!(class, "Point");
            assert_eq!(fields.get("x"), Some(&HostValue::Double(1.0)));
            assert_eq!(fields.get("y"), Some(&HostValue::Double(2.0)));
            assert_eq!(fields.get("flag"), Some(&HostValue::Bool(true)));
        }
        other => panic!("expected an instance, found {:?}", other),
    }
}
