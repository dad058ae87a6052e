#![cfg(test)]

use hasty::ast::{BinOp, Expr, ExprKind, FunctionDecl, Program, Stmt, DIRECTIVE};
use hasty::codegen;
use hasty::lir;
use hasty::typing::{Ty, TyCtx};
use parity_wasm::elements::{deserialize_buffer, Internal, Module};

fn expr(kind: ExprKind, ty: Ty) -> Expr {
    Expr::new(kind, ty)
}

fn int(value: i32) -> Expr {
    expr(ExprKind::Int(value), Ty::Int)
}

fn ident(name: &str, ty: Ty) -> Expr {
    expr(ExprKind::Ident(name.to_string()), ty)
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr, ty: Ty) -> Expr {
    expr(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        ty,
    )
}

fn assign(target: Expr, op: Option<BinOp>, value: Expr) -> Stmt {
    let ty = target.ty.clone();
    Stmt::Expr(expr(
        ExprKind::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        },
        ty,
    ))
}

fn postfix_incr(operand: Expr) -> Expr {
    let ty = operand.ty.clone();
    expr(
        ExprKind::Postfix {
            incr: true,
            operand: Box::new(operand),
        },
        ty,
    )
}

fn directive() -> Stmt {
    Stmt::Expr(expr(ExprKind::Str(DIRECTIVE.to_string()), Ty::Str))
}

fn var_decl(name: &str, ty: Ty, init: Expr) -> Stmt {
    Stmt::VarDecl {
        name: name.to_string(),
        ty,
        init: Some(init),
    }
}

fn ret(value: Expr) -> Stmt {
    Stmt::Return(Some(value))
}

/// function isPrime(value: int): boolean {
///     "use hasty";
///     if (value <= 1) return false;
///     for (let i = 2; i * i <= value; i++) {
///         if (value % i === 0) return false;
///     }
///     return true;
/// }
fn is_prime_decl() -> FunctionDecl {
    let value = || ident("value", Ty::Int);
    let i = || ident("i", Ty::Int);
    FunctionDecl {
        name: "isPrime".to_string(),
        params: vec![hasty::ast::ParamDecl {
            name: "value".to_string(),
            ty: Ty::Int,
        }],
        ret_ty: Ty::Bool,
        body: vec![
            directive(),
            Stmt::If {
                cond: bin(BinOp::LtEq, value(), int(1), Ty::Bool),
                then: vec![ret(expr(ExprKind::Bool(false), Ty::Bool))],
                els: vec![],
            },
            Stmt::For {
                label: None,
                init: Some(Box::new(var_decl("i", Ty::Int, int(2)))),
                cond: Some(bin(
                    BinOp::LtEq,
                    bin(BinOp::Mul, i(), i(), Ty::Int),
                    value(),
                    Ty::Bool,
                )),
                incr: Some(postfix_incr(i())),
                body: vec![Stmt::If {
                    cond: bin(
                        BinOp::EqEq,
                        bin(BinOp::Rem, value(), i(), Ty::Int),
                        int(0),
                        Ty::Bool,
                    ),
                    then: vec![ret(expr(ExprKind::Bool(false), Ty::Bool))],
                    els: vec![],
                }],
            },
            ret(expr(ExprKind::Bool(true), Ty::Bool)),
        ],
        exported: true,
    }
}

fn is_prime_tcx() -> TyCtx {
    let mut tcx = TyCtx::new();
    tcx.declare_fn("isPrime", vec![Ty::Int], Ty::Bool);
    tcx
}

fn exported_functions(module: &Module) -> Vec<String> {
    module
        .export_section()
        .map(|s| {
            s.entries()
                .iter()
                .filter(|e| matches!(e.internal(), Internal::Function(_)))
                .map(|e| e.field().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn is_prime_compiles_to_a_valid_binary() {
    let program = Program::new(vec![is_prime_decl()]);
    let compiled = codegen::compile(&program, &is_prime_tcx()).unwrap();

    let bytes = parity_wasm::serialize(compiled.module).unwrap();
    let module: Module = deserialize_buffer(&bytes).unwrap();

    let exports = exported_functions(&module);
    assert!(exports.contains(&"isPrime".to_string()));
    assert!(exports.contains(&"malloc".to_string()));
    assert!(exports.contains(&"free".to_string()));
    assert!(module.code_section().is_some());
    assert!(module.type_section().is_some());
}

#[test]
fn functions_without_the_directive_are_skipped() {
    let mut host_only = is_prime_decl();
    host_only.name = "hostOnly".to_string();
    host_only.body.remove(0);

    let program = Program::new(vec![is_prime_decl(), host_only]);
    let compiled = codegen::compile(&program, &is_prime_tcx()).unwrap();
    let exports = exported_functions(&compiled.module);
    assert!(exports.contains(&"isPrime".to_string()));
    assert!(!exports.contains(&"hostOnly".to_string()));
}

/// function sumBelowDiagonal(n: int): int {
///     "use hasty";
///     let total = 0;
///     outer: for (let i = 0; i < n; i++) {
///         for (let j = 0; j < n; j++) {
///             if (j > i) continue outer;
///             total += 1;
///         }
///     }
///     return total;
/// }
fn labeled_continue_decl() -> FunctionDecl {
    let n = || ident("n", Ty::Int);
    let i = || ident("i", Ty::Int);
    let j = || ident("j", Ty::Int);
    let total = || ident("total", Ty::Int);
    let inner = Stmt::For {
        label: None,
        init: Some(Box::new(var_decl("j", Ty::Int, int(0)))),
        cond: Some(bin(BinOp::Lt, j(), n(), Ty::Bool)),
        incr: Some(postfix_incr(j())),
        body: vec![
            Stmt::If {
                cond: bin(BinOp::Gt, j(), i(), Ty::Bool),
                then: vec![Stmt::Continue(Some("outer".to_string()))],
                els: vec![],
            },
            assign(total(), Some(BinOp::Add), int(1)),
        ],
    };
    FunctionDecl {
        name: "sumBelowDiagonal".to_string(),
        params: vec![hasty::ast::ParamDecl {
            name: "n".to_string(),
            ty: Ty::Int,
        }],
        ret_ty: Ty::Int,
        body: vec![
            directive(),
            var_decl("total", Ty::Int, int(0)),
            Stmt::For {
                label: Some("outer".to_string()),
                init: Some(Box::new(var_decl("i", Ty::Int, int(0)))),
                cond: Some(bin(BinOp::Lt, i(), n(), Ty::Bool)),
                incr: Some(postfix_incr(i())),
                body: vec![inner],
            },
            ret(total()),
        ],
        exported: true,
    }
}

#[test]
fn labeled_continue_targets_the_outer_increment_block() {
    let program = Program::new(vec![labeled_continue_decl()]);
    let mut tcx = TyCtx::new();
    tcx.declare_fn("sumBelowDiagonal", vec![Ty::Int], Ty::Int);
    let prog = codegen::compile_program(&program, &tcx).unwrap();

    let func = &prog.funcs[0];
    assert_eq!(func.loops.len(), 2);
    let outer = &func.loops[0];
    let inner = &func.loops[1];
    // Both loops have a distinct increment block.
    assert_ne!(outer.cont, outer.header);
    assert_ne!(inner.cont, inner.header);

    // `continue outer` from inside the inner body, plus the normal fall
    // through at the end of the outer body, both branch to the outer
    // increment block.
    let gotos_to_outer_cont = func
        .blocks
        .iter()
        .flat_map(|b| &b.insts)
        .filter(|inst| matches!(inst, lir::Inst::Goto(label) if *label == outer.cont))
        .count();
    assert!(gotos_to_outer_cont >= 2);

    // The unlabeled branch of the inner loop still knows only its own
    // increment block.
    let gotos_to_inner_cont = func
        .blocks
        .iter()
        .flat_map(|b| &b.insts)
        .filter(|inst| matches!(inst, lir::Inst::Goto(label) if *label == inner.cont))
        .count();
    assert!(gotos_to_inner_cont >= 1);

    // And the whole thing still lowers to a serializable binary.
    let compiled = codegen::compile(&program, &tcx).unwrap();
    parity_wasm::serialize(compiled.module).unwrap();
}

fn int_array(elements: Vec<Expr>) -> Expr {
    expr(ExprKind::Array(elements), Ty::Array(Box::new(Ty::Int)))
}

/// function pick(flag: boolean): Array<int> {
///     "use hasty";
///     let a = [1];
///     let b = [2];
///     if (flag) return a;
///     return b;
/// }
fn pick_decl() -> FunctionDecl {
    let arr_ty = || Ty::Array(Box::new(Ty::Int));
    FunctionDecl {
        name: "pick".to_string(),
        params: vec![hasty::ast::ParamDecl {
            name: "flag".to_string(),
            ty: Ty::Bool,
        }],
        ret_ty: arr_ty(),
        body: vec![
            directive(),
            var_decl("a", arr_ty(), int_array(vec![int(1)])),
            var_decl("b", arr_ty(), int_array(vec![int(2)])),
            Stmt::If {
                cond: ident("flag", Ty::Bool),
                then: vec![ret(ident("a", arr_ty()))],
                els: vec![],
            },
            ret(ident("b", arr_ty())),
        ],
        exported: true,
    }
}

#[test]
fn each_return_path_releases_the_arrays_it_leaves_behind() {
    let program = Program::new(vec![pick_decl()]);
    let mut tcx = TyCtx::new();
    tcx.declare_fn("pick", vec![Ty::Bool], Ty::Array(Box::new(Ty::Int)));
    let prog = codegen::compile_program(&program, &tcx).unwrap();

    // Returning `a` must still release `b`, and returning `b` must still
    // release `a`: one delete per path, never zero.
    let deletes = prog.funcs[0]
        .blocks
        .iter()
        .flat_map(|b| &b.insts)
        .filter(|inst| {
            matches!(
                inst,
                lir::Inst::Eval(lir::Value::Call { name, .. })
                    if name.starts_with("delete_array")
            )
        })
        .count();
    assert_eq!(deletes, 2);

    let compiled = codegen::compile(&program, &tcx).unwrap();
    parity_wasm::serialize(compiled.module).unwrap();
}

#[test]
fn function_references_are_not_values() {
    let decl = FunctionDecl {
        name: "forward".to_string(),
        params: vec![],
        ret_ty: Ty::Int,
        body: vec![directive(), ret(ident("isPrime", Ty::Int))],
        exported: true,
    };
    let mut tcx = is_prime_tcx();
    tcx.declare_fn("forward", vec![], Ty::Int);
    let err = codegen::compile_program(&Program::new(vec![decl]), &tcx).unwrap_err();
    assert!(err.to_string().contains("first-class"));
}

#[test]
fn labels_on_non_loop_statements_are_rejected() {
    let decl = FunctionDecl {
        name: "labeledBlock".to_string(),
        params: vec![],
        ret_ty: Ty::Void,
        body: vec![
            directive(),
            Stmt::Labeled("tail".to_string(), Box::new(Stmt::Block(vec![]))),
        ],
        exported: true,
    };
    let program = Program::new(vec![decl]);
    let mut tcx = TyCtx::new();
    tcx.declare_fn("labeledBlock", vec![], Ty::Void);
    let err = codegen::compile_program(&program, &tcx).unwrap_err();
    assert!(err.to_string().contains("label"));
}
