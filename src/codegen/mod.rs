//! Lowering from the annotated source tree to the low-level IR.
//!
//! One generator instance walks one function body depth-first, emitting
//! instructions through a single builder cursor. Control flow is recorded
//! structurally as it is built (loop and branch shapes), which the binary
//! backend later replays instead of rediscovering it from the block graph.
//!
//! Dispatch over node kinds is a closed match: every syntactic form the
//! subset admits is either lowered here or rejected with a source-level
//! error naming the construct.

pub mod arrays;
pub mod scope;
pub mod types;
pub mod wasm;

use std::collections::HashSet;

use fnv::FnvHashMap;
use log::debug;

use crate::ast::{BinOp, Expr, ExprKind, FunctionDecl, Program, Stmt, UnaryOp};
use crate::codegen::arrays::ArrayGen;
use crate::codegen::scope::ScopeStack;
use crate::codegen::types::{field_offset, map_ret_ty, map_ty};
use crate::errors::{HastyError, HastyResult};
use crate::lir;
use crate::lir::{Builder, Extern, IfInfo, Inst, Intrinsic, IrType, LoopInfo, Op, Param, Value};
use crate::reflect::ReflectionTable;
use crate::typing::{Ty, TyCtx};

/// A finished compilation: the binary module and the reflection sidecar the
/// loader marshals through.
pub struct CompiledModule {
    pub module: parity_wasm::elements::Module,
    pub types: ReflectionTable,
}

/// The full pipeline: IR generation, binary lowering, and a reflection
/// table covering every type reachable from the compiled signatures.
pub fn compile(program: &Program, tcx: &TyCtx) -> HastyResult<CompiledModule> {
    let prog = compile_program(program, tcx)?;
    let mut types = ReflectionTable::new();
    for decl in program.compiled_functions() {
        for param in &decl.params {
            register_reachable(&mut types, tcx, &param.ty)?;
        }
        register_reachable(&mut types, tcx, &decl.ret_ty)?;
    }
    Ok(CompiledModule {
        module: wasm::codegen(&prog),
        types,
    })
}

fn register_reachable(types: &mut ReflectionTable, tcx: &TyCtx, ty: &Ty) -> HastyResult {
    match ty {
        Ty::Array(el) => {
            types.add_ty(ty)?;
            register_reachable(types, tcx, el)
        }
        Ty::Object(name) => {
            if types.get(name).is_some() {
                return Ok(());
            }
            let class = tcx.get_class(name).ok_or_else(|| {
                HastyError::ty(format!("unknown class `{}`", name))
            })?;
            types.add_class(class)?;
            for (_, field_ty) in &class.fields {
                register_reachable(types, tcx, field_ty)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Compiles every directive-marked function of `program` into one IR
/// program. Functions without the directive stay on the host side; calls to
/// them become imports satisfied at instantiation.
pub fn compile_program(program: &Program, tcx: &TyCtx) -> HastyResult<lir::Program> {
    let compiled: HashSet<String> = program
        .compiled_functions()
        .map(|f| f.name.clone())
        .collect();
    let mut prog = lir::Program::default();
    for decl in program.compiled_functions() {
        let func = FnGen::run(tcx, &mut prog, &compiled, decl)
            .map_err(|e| e.in_context(format!("function `{}`", decl.name)))?;
        debug!("compiled `{}`: {} blocks", func.name, func.blocks.len());
        prog.funcs.push(func);
    }
    Ok(prog)
}

/// An assignable location, resolved once so that compound assignment and
/// postfix operators never re-evaluate the target expression.
enum Place {
    Local(usize),
    Field {
        addr_local: usize,
        offset: u32,
        ty: IrType,
    },
    Elem {
        arrays: ArrayGen,
        array_local: usize,
        index_local: usize,
    },
    Length {
        arrays: ArrayGen,
        array_local: usize,
    },
}

struct FnGen<'a> {
    tcx: &'a TyCtx,
    prog: &'a mut lir::Program,
    compiled: &'a HashSet<String>,
    builder: Builder,
    scopes: ScopeStack,
    ret_ty: Ty,
    /// Element type of each local that owns a runtime array.
    array_elems: FnvHashMap<usize, IrType>,
}

impl<'a> FnGen<'a> {
    fn run(
        tcx: &'a TyCtx,
        prog: &'a mut lir::Program,
        compiled: &'a HashSet<String>,
        decl: &FunctionDecl,
    ) -> HastyResult<lir::Func> {
        let params = decl
            .params
            .iter()
            .map(|p| {
                Ok(Param {
                    name: p.name.clone(),
                    ty: map_ty(&p.ty)
                        .map_err(|e| e.in_context(format!("parameter `{}`", p.name)))?,
                })
            })
            .collect::<HastyResult<Vec<_>>>()?;
        let ret = map_ret_ty(&decl.ret_ty)?;
        let builder = Builder::new(&decl.name, params, ret, decl.exported);

        let mut fgen = FnGen {
            tcx,
            prog,
            compiled,
            builder,
            scopes: ScopeStack::new(),
            ret_ty: decl.ret_ty.clone(),
            array_elems: FnvHashMap::default(),
        };
        for (i, p) in decl.params.iter().enumerate() {
            fgen.scopes.insert_var(&p.name, i);
        }
        fgen.gen_stmts(decl.body_stmts())?;
        if !fgen.builder.is_terminated() {
            let owned = fgen.scopes.all_owned();
            fgen.release(&owned);
        }
        Ok(fgen.builder.finish())
    }

    fn gen_stmts(&mut self, stmts: &[Stmt]) -> HastyResult {
        for stmt in stmts {
            if self.builder.is_terminated() {
                // Anything after a return/break/continue in this block is
                // unreachable; skip it.
                break;
            }
            self.gen_stmt(stmt)?;
        }
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> HastyResult {
        match stmt {
            Stmt::Expr(e) => {
                let value = self.gen_expr(e)?;
                // Pure leftovers (a bare local after an assignment) carry no
                // effect and need no eval.
                if !matches!(
                    value,
                    Value::Local(_)
                        | Value::ConstI32(_)
                        | Value::ConstF64(_)
                        | Value::ConstBool(_)
                        | Value::NullPtr
                ) {
                    self.builder.emit(Inst::Eval(value));
                }
                Ok(())
            }
            Stmt::VarDecl { name, ty, init } => self.gen_var_decl(name, ty, init.as_ref()),
            Stmt::Return(value) => self.gen_return(value.as_ref()),
            Stmt::If { cond, then, els } => self.gen_if(cond, then, els),
            Stmt::While { label, cond, body } => self.gen_while(label.as_deref(), cond, body),
            Stmt::For {
                label,
                init,
                cond,
                incr,
                body,
            } => self.gen_for(
                label.as_deref(),
                init.as_deref(),
                cond.as_ref(),
                incr.as_ref(),
                body,
            ),
            Stmt::Break(label) => self.gen_break(label.as_deref()),
            Stmt::Continue(label) => self.gen_continue(label.as_deref()),
            Stmt::Block(stmts) => {
                self.scopes.push();
                let result = self.gen_stmts(stmts);
                self.exit_scope();
                result
            }
            Stmt::Labeled(label, inner) => match inner.as_ref() {
                Stmt::While { cond, body, .. } => self.gen_while(Some(label), cond, body),
                Stmt::For {
                    init,
                    cond,
                    incr,
                    body,
                    ..
                } => self.gen_for(
                    Some(label),
                    init.as_deref(),
                    cond.as_ref(),
                    incr.as_ref(),
                    body,
                ),
                other => Err(HastyError::unsupported(format!(
                    "only loops can carry a label, found a labeled {}",
                    other.name()
                ))),
            },
        }
    }

    fn gen_var_decl(&mut self, name: &str, ty: &Ty, init: Option<&Expr>) -> HastyResult {
        let ir_ty =
            map_ty(ty).map_err(|e| e.in_context(format!("declaration of `{}`", name)))?;
        let local = self.builder.add_local(ir_ty);
        if let Some(init) = init {
            let value = self.gen_expr(init)?;
            let value = self.coerce(value, &init.ty, ty)?;
            self.builder.emit(Inst::SetLocal(local, value));
            if ty.is_array() && creates_fresh_array(init) {
                let elem = map_ty(ty.element_ty().unwrap_or(&Ty::Any))?;
                self.scopes.mark_owned(local);
                self.array_elems.insert(local, elem);
            }
        }
        self.scopes.insert_var(name, local);
        Ok(())
    }

    fn gen_return(&mut self, value: Option<&Expr>) -> HastyResult {
        // Returning an owned array hands it to the caller, but only on this
        // path; other exits from the scope still release it.
        let mut transferred = None;
        let mut result = match value {
            Some(e) => {
                if let ExprKind::Ident(name) = &e.kind {
                    transferred = self.scopes.lookup(name);
                }
                let v = self.gen_expr(e)?;
                Some(self.coerce(v, &e.ty, &self.ret_ty.clone())?)
            }
            None => None,
        };
        let owned: Vec<usize> = self
            .scopes
            .all_owned()
            .into_iter()
            .filter(|&l| Some(l) != transferred)
            .collect();
        if !owned.is_empty() {
            // Evaluate the result before the cleanup calls run.
            if let Some(v) = result.take() {
                let ty = map_ty(&self.ret_ty)?;
                let tmp = self.builder.add_local(ty);
                self.builder.emit(Inst::SetLocal(tmp, v));
                result = Some(Value::Local(tmp));
            }
            self.release(&owned);
        }
        self.builder.emit(Inst::Return(result));
        Ok(())
    }

    fn gen_if(&mut self, cond: &Expr, then: &[Stmt], els: &[Stmt]) -> HastyResult {
        let cond_value = self.truthy(cond)?;
        let cond_block = self.builder.current_block();
        let then_label = self.builder.new_block();
        let join = self.builder.new_block();
        let else_label = if els.is_empty() {
            join
        } else {
            self.builder.new_block()
        };
        self.builder.record_if(IfInfo {
            cond_block,
            then_label,
            else_label,
            join,
        });
        self.builder.emit(Inst::CondBr {
            cond: cond_value,
            then_label,
            else_label,
        });

        self.builder.position_at_end(then_label);
        self.scopes.push();
        self.gen_stmts(then)?;
        self.exit_scope();
        if !self.builder.is_terminated() {
            self.builder.emit(Inst::Goto(join));
        }

        if else_label != join {
            self.builder.position_at_end(else_label);
            self.scopes.push();
            self.gen_stmts(els)?;
            self.exit_scope();
            if !self.builder.is_terminated() {
                self.builder.emit(Inst::Goto(join));
            }
        }

        self.builder.position_at_end(join);
        Ok(())
    }

    fn gen_while(&mut self, label: Option<&str>, cond: &Expr, body: &[Stmt]) -> HastyResult {
        let header = self.builder.new_block();
        self.builder.emit(Inst::Goto(header));
        let exit = self.builder.new_block();
        self.builder.record_loop(LoopInfo {
            header,
            cont: header,
            exit,
        });
        self.scopes.push_loop(exit, header, label.map(String::from));

        self.builder.position_at_end(header);
        let cond_value = self.truthy(cond)?;
        let body_label = self.builder.new_block();
        self.builder.emit(Inst::CondBr {
            cond: cond_value,
            then_label: body_label,
            else_label: exit,
        });

        self.builder.position_at_end(body_label);
        self.scopes.push();
        self.gen_stmts(body)?;
        self.exit_scope();
        if !self.builder.is_terminated() {
            self.builder.emit(Inst::Goto(header));
        }

        self.scopes.pop();
        self.builder.position_at_end(exit);
        Ok(())
    }

    fn gen_for(
        &mut self,
        label: Option<&str>,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        incr: Option<&Expr>,
        body: &[Stmt],
    ) -> HastyResult {
        // The induction variable lives in its own scope covering the whole
        // loop, released only once the loop is done.
        self.scopes.push();
        if let Some(init) = init {
            self.gen_stmt(init)?;
        }

        let header = self.builder.new_block();
        self.builder.emit(Inst::Goto(header));
        let exit = self.builder.new_block();
        let cont = if incr.is_some() {
            self.builder.new_block()
        } else {
            header
        };
        self.builder.record_loop(LoopInfo { header, cont, exit });
        self.scopes.push_loop(exit, cont, label.map(String::from));

        self.builder.position_at_end(header);
        let body_label = self.builder.new_block();
        match cond {
            Some(cond) => {
                let cond_value = self.truthy(cond)?;
                self.builder.emit(Inst::CondBr {
                    cond: cond_value,
                    then_label: body_label,
                    else_label: exit,
                });
            }
            None => self.builder.emit(Inst::Goto(body_label)),
        }

        self.builder.position_at_end(body_label);
        self.scopes.push();
        self.gen_stmts(body)?;
        self.exit_scope();
        if !self.builder.is_terminated() {
            self.builder.emit(Inst::Goto(cont));
        }

        if let Some(incr) = incr {
            self.builder.position_at_end(cont);
            self.gen_stmt(&Stmt::Expr(incr.clone()))?;
            self.builder.emit(Inst::Goto(header));
        }

        self.scopes.pop();
        self.builder.position_at_end(exit);
        self.exit_scope();
        Ok(())
    }

    fn gen_break(&mut self, label: Option<&str>) -> HastyResult {
        let plan = self.scopes.resolve_break(label).ok_or_else(|| match label {
            Some(l) => HastyError::unsupported(format!("unknown label `{}`", l)),
            None => HastyError::unsupported(str!("`break` outside of a loop")),
        })?;
        self.release(&plan.released);
        self.builder.emit(Inst::Goto(plan.target));
        Ok(())
    }

    fn gen_continue(&mut self, label: Option<&str>) -> HastyResult {
        let plan = self
            .scopes
            .resolve_continue(label)
            .ok_or_else(|| match label {
                Some(l) => HastyError::unsupported(format!("unknown label `{}`", l)),
                None => HastyError::unsupported(str!("`continue` outside of a loop")),
            })?;
        self.release(&plan.released);
        self.builder.emit(Inst::Goto(plan.target));
        Ok(())
    }

    /// Pops the innermost scope and releases its arrays, unless control
    /// already left the block (a jump released them on its own path).
    fn exit_scope(&mut self) {
        let owned = self.scopes.pop();
        if !self.builder.is_terminated() {
            self.release(&owned);
        }
    }

    fn release(&mut self, locals: &[usize]) {
        for &local in locals {
            let elem = *self
                .array_elems
                .get(&local)
                .unwrap_or_else(|| panic!("COMPILER BUG: local ${} owns no array", local));
            ArrayGen::new(elem).delete(&mut self.builder, self.prog, Value::Local(local));
        }
    }

    fn gen_expr(&mut self, expr: &Expr) -> HastyResult<Value> {
        match &expr.kind {
            ExprKind::Int(i) => Ok(if expr.ty.is_number_like() {
                Value::ConstF64(*i as f64)
            } else {
                Value::ConstI32(*i)
            }),
            ExprKind::Num(x) => Ok(Value::ConstF64(*x)),
            ExprKind::Bool(b) => Ok(Value::ConstBool(*b)),
            ExprKind::Str(_) => Err(HastyError::unsupported(str!(
                "string values are not part of the compiled subset"
            ))),
            ExprKind::Ident(name) => match self.scopes.lookup(name) {
                Some(local) => Ok(Value::Local(local)),
                None if self.tcx.has_fn(name) => Err(HastyError::unsupported(format!(
                    "`{}` names a function; functions are not first-class values",
                    name
                ))),
                None => Err(HastyError::ty(format!("unknown identifier `{}`", name))),
            },
            ExprKind::Array(elements) => self.gen_array_literal(expr, elements),
            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(*op, lhs, rhs),
            ExprKind::Assign { op, target, value } => self.gen_assign(*op, target, value),
            ExprKind::Unary { op, operand } => self.gen_unary(*op, operand),
            ExprKind::Postfix { incr, operand } => self.gen_postfix(*incr, operand),
            ExprKind::Cond { cond, then, els } => self.gen_cond(expr, cond, then, els),
            ExprKind::Call { callee, args } => self.gen_call(callee, args),
            ExprKind::New { class, args } => self.gen_new(expr, class, args),
            ExprKind::Member { object, property } => self.gen_member(object, property),
            ExprKind::Index { object, index } => self.gen_index(object, index),
            ExprKind::Paren(inner) => self.gen_expr(inner),
        }
    }

    fn gen_array_literal(&mut self, expr: &Expr, elements: &[Expr]) -> HastyResult<Value> {
        let arrays = ArrayGen::for_array_ty(&expr.ty)?;
        let elem_ty = expr
            .ty
            .element_ty()
            .unwrap_or_else(|| panic!("COMPILER BUG: array literal without array type"))
            .clone();
        let values = elements
            .iter()
            .map(|e| {
                let v = self.gen_expr(e)?;
                self.coerce(v, &e.ty, &elem_ty)
            })
            .collect::<HastyResult<Vec<_>>>()?;
        Ok(arrays.new_array(&mut self.builder, self.prog, values))
    }

    fn gen_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> HastyResult<Value> {
        match op {
            BinOp::LogicAnd | BinOp::LogicOr => return self.gen_logical(op, lhs, rhs),
            _ => {}
        }
        let op_ty = self.binary_operand_ty(op, lhs, rhs)?;
        let lv = self.gen_expr(lhs)?;
        let lv = self.coerce(lv, &lhs.ty, &op_ty)?;
        let rv = self.gen_expr(rhs)?;
        let rv = self.coerce(rv, &rhs.ty, &op_ty)?;
        let ir_ty = map_ty(&op_ty)?;

        // `%` on floats has no direct instruction; it goes through an import.
        if op == BinOp::Rem && ir_ty == IrType::F64 {
            return Ok(self.extern_call(
                "fmod",
                vec![IrType::F64, IrType::F64],
                Some(IrType::F64),
                vec![lv, rv],
            ));
        }
        let op = match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div => Op::Div,
            BinOp::Rem => Op::Rem,
            BinOp::Lt => Op::Lt,
            BinOp::Gt => Op::Gt,
            BinOp::LtEq => Op::LtEq,
            BinOp::GtEq => Op::GtEq,
            BinOp::EqEq => Op::Eq,
            BinOp::NotEq => Op::Neq,
            BinOp::BitAnd => Op::BitAnd,
            BinOp::BitOr => Op::BitOr,
            BinOp::BitXor => Op::BitXor,
            BinOp::LogicAnd | BinOp::LogicOr => unreachable!(),
        };
        Ok(Value::BinOp {
            op,
            ty: ir_ty,
            lhs: Box::new(lv),
            rhs: Box::new(rv),
        })
    }

    /// The common type both operands are brought to before the operation.
    fn binary_operand_ty(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> HastyResult<Ty> {
        match op {
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                if lhs.ty.is_int_like() && rhs.ty.is_int_like() {
                    Ok(Ty::Int)
                } else {
                    Err(HastyError::ty(format!(
                        "operator `{}` requires int operands, found `{}` and `{}`",
                        op, lhs.ty, rhs.ty
                    )))
                }
            }
            _ => {
                if lhs.ty.is_number_like() || rhs.ty.is_number_like() {
                    Ok(Ty::Number)
                } else if lhs.ty.is_int_like() && rhs.ty.is_int_like() {
                    Ok(Ty::Int)
                } else if lhs.ty == rhs.ty && (op == BinOp::EqEq || op == BinOp::NotEq) {
                    // Booleans and references compare by identity.
                    Ok(lhs.ty.clone())
                } else {
                    Err(HastyError::ty(format!(
                        "operator `{}` cannot be applied to `{}` and `{}`",
                        op, lhs.ty, rhs.ty
                    )))
                }
            }
        }
    }

    /// Short-circuit `&&`/`||` via a result local and a one-armed branch.
    fn gen_logical(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> HastyResult<Value> {
        let result = self.builder.add_local(IrType::I1);
        let lv = self.truthy(lhs)?;
        let (seed, cond) = match op {
            // `a && b`: result is false unless `a` holds, then it is `b`.
            BinOp::LogicAnd => (Value::ConstBool(false), lv),
            // `a || b`: result is true unless `a` fails, then it is `b`.
            BinOp::LogicOr => (Value::ConstBool(true), Value::Eqz(Box::new(lv))),
            _ => panic!("COMPILER BUG: `{}` is not a logical operator", op),
        };
        self.builder.emit(Inst::SetLocal(result, seed));

        let cond_block = self.builder.current_block();
        let rhs_label = self.builder.new_block();
        let join = self.builder.new_block();
        self.builder.record_if(IfInfo {
            cond_block,
            then_label: rhs_label,
            else_label: join,
            join,
        });
        self.builder.emit(Inst::CondBr {
            cond,
            then_label: rhs_label,
            else_label: join,
        });

        self.builder.position_at_end(rhs_label);
        let rv = self.truthy(rhs)?;
        self.builder.emit(Inst::SetLocal(result, rv));
        self.builder.emit(Inst::Goto(join));

        self.builder.position_at_end(join);
        Ok(Value::Local(result))
    }

    fn gen_cond(
        &mut self,
        expr: &Expr,
        cond: &Expr,
        then: &Expr,
        els: &Expr,
    ) -> HastyResult<Value> {
        let result_ty = expr.ty.clone();
        let result = self.builder.add_local(map_ty(&result_ty)?);

        let cond_value = self.truthy(cond)?;
        let cond_block = self.builder.current_block();
        let then_label = self.builder.new_block();
        let join = self.builder.new_block();
        let else_label = self.builder.new_block();
        self.builder.record_if(IfInfo {
            cond_block,
            then_label,
            else_label,
            join,
        });
        self.builder.emit(Inst::CondBr {
            cond: cond_value,
            then_label,
            else_label,
        });

        self.builder.position_at_end(then_label);
        let tv = self.gen_expr(then)?;
        let tv = self.coerce(tv, &then.ty, &result_ty)?;
        self.builder.emit(Inst::SetLocal(result, tv));
        self.builder.emit(Inst::Goto(join));

        self.builder.position_at_end(else_label);
        let ev = self.gen_expr(els)?;
        let ev = self.coerce(ev, &els.ty, &result_ty)?;
        self.builder.emit(Inst::SetLocal(result, ev));
        self.builder.emit(Inst::Goto(join));

        self.builder.position_at_end(join);
        Ok(Value::Local(result))
    }

    fn gen_assign(
        &mut self,
        op: Option<BinOp>,
        target: &Expr,
        value: &Expr,
    ) -> HastyResult<Value> {
        let place = self.resolve_place(target)?;
        let stored = match op {
            None => {
                let v = self.gen_expr(value)?;
                self.coerce(v, &value.ty, &target.ty)?
            }
            Some(op) => {
                // Compound assignment loads the place once, applies the
                // operator, and stores back.
                let current = self.load_place(&place);
                let current_local = self.builder.add_local(map_ty(&target.ty)?);
                self.builder.emit(Inst::SetLocal(current_local, current));
                let op_ty = self.binary_operand_ty(op, target, value)?;
                let lv = self.coerce(Value::Local(current_local), &target.ty, &op_ty)?;
                let rv = self.gen_expr(value)?;
                let rv = self.coerce(rv, &value.ty, &op_ty)?;
                let ir_ty = map_ty(&op_ty)?;
                let combined = if op == BinOp::Rem && ir_ty == IrType::F64 {
                    self.extern_call(
                        "fmod",
                        vec![IrType::F64, IrType::F64],
                        Some(IrType::F64),
                        vec![lv, rv],
                    )
                } else {
                    Value::BinOp {
                        op: arith_op(op)?,
                        ty: ir_ty,
                        lhs: Box::new(lv),
                        rhs: Box::new(rv),
                    }
                };
                self.coerce(combined, &op_ty, &target.ty)?
            }
        };
        // Pin the stored value so the assignment's own value never re-reads
        // the place.
        let stored = Value::Local(self.pin(stored, map_ty(&target.ty)?));
        self.store_place(&place, stored.clone());
        Ok(stored)
    }

    fn gen_unary(&mut self, op: UnaryOp, operand: &Expr) -> HastyResult<Value> {
        match op {
            UnaryOp::Neg => {
                let v = self.gen_expr(operand)?;
                if operand.ty.is_number_like() {
                    Ok(Value::FNeg(Box::new(v)))
                } else if operand.ty.is_int_like() {
                    Ok(Value::BinOp {
                        op: Op::Sub,
                        ty: IrType::I32,
                        lhs: Box::new(Value::ConstI32(0)),
                        rhs: Box::new(v),
                    })
                } else {
                    Err(HastyError::ty(format!(
                        "cannot negate a value of type `{}`",
                        operand.ty
                    )))
                }
            }
            UnaryOp::Not => {
                let v = self.truthy(operand)?;
                Ok(Value::Eqz(Box::new(v)))
            }
            UnaryOp::PreIncr | UnaryOp::PreDecr => {
                let place = self.resolve_place(operand)?;
                let updated = self.step_place(&place, &operand.ty, op == UnaryOp::PreIncr)?;
                let updated = Value::Local(self.pin(updated, map_ty(&operand.ty)?));
                self.store_place(&place, updated.clone());
                Ok(updated)
            }
        }
    }

    /// `x++`/`x--` evaluate to the value before the step.
    fn gen_postfix(&mut self, incr: bool, operand: &Expr) -> HastyResult<Value> {
        let place = self.resolve_place(operand)?;
        let original = self.builder.add_local(map_ty(&operand.ty)?);
        let current = self.load_place(&place);
        self.builder.emit(Inst::SetLocal(original, current));
        let snapshot = Place::Local(original);
        let updated = self.step_place(&snapshot, &operand.ty, incr)?;
        self.store_place(&place, updated);
        Ok(Value::Local(original))
    }

    fn step_place(&mut self, place: &Place, ty: &Ty, up: bool) -> HastyResult<Value> {
        let current = self.load_place(place);
        let (ir_ty, one) = if ty.is_int_like() {
            (IrType::I32, Value::ConstI32(1))
        } else if ty.is_number_like() {
            (IrType::F64, Value::ConstF64(1.0))
        } else {
            return Err(HastyError::ty(format!(
                "`++`/`--` require a numeric operand, found `{}`",
                ty
            )));
        };
        Ok(Value::BinOp {
            op: if up { Op::Add } else { Op::Sub },
            ty: ir_ty,
            lhs: Box::new(current),
            rhs: Box::new(one),
        })
    }

    fn gen_call(&mut self, callee: &Expr, args: &[Expr]) -> HastyResult<Value> {
        match &callee.kind {
            ExprKind::Member { object, property } => {
                if let ExprKind::Ident(ns) = &object.kind {
                    if ns == "Math" && self.scopes.lookup(ns).is_none() {
                        return self.gen_math_call(property, args);
                    }
                }
                if object.ty.is_array() {
                    return self.gen_array_method(object, property, args);
                }
                Err(HastyError::unsupported(format!(
                    "method `{}` on a value of type `{}`",
                    property, object.ty
                )))
            }
            ExprKind::Ident(name) => self.gen_named_call(name, args),
            other => Err(HastyError::unsupported(format!(
                "calling the result of a {}",
                other.name()
            ))),
        }
    }

    fn gen_math_call(&mut self, fn_name: &str, args: &[Expr]) -> HastyResult<Value> {
        let values = args
            .iter()
            .map(|a| {
                let v = self.gen_expr(a)?;
                self.coerce(v, &a.ty, &Ty::Number)
            })
            .collect::<HastyResult<Vec<_>>>()?;
        match (fn_name, values.len()) {
            ("sqrt", 1) => Ok(Value::Intrinsic {
                op: Intrinsic::Sqrt,
                args: values,
            }),
            ("pow", 2) => Ok(self.extern_call(
                "pow",
                vec![IrType::F64, IrType::F64],
                Some(IrType::F64),
                values,
            )),
            ("round", 1) => Ok(self.extern_call(
                "round",
                vec![IrType::F64],
                Some(IrType::F64),
                values,
            )),
            _ => Err(HastyError::unsupported(format!(
                "Math.{} with {} argument(s)",
                fn_name,
                values.len()
            ))),
        }
    }

    fn gen_array_method(
        &mut self,
        object: &Expr,
        method: &str,
        args: &[Expr],
    ) -> HastyResult<Value> {
        let arrays = ArrayGen::for_array_ty(&object.ty)?;
        let elem_ty = object
            .ty
            .element_ty()
            .unwrap_or_else(|| panic!("COMPILER BUG: array receiver without element type"))
            .clone();
        let array = self.gen_expr(object)?;
        let elems = |fgen: &mut Self, args: &[Expr]| -> HastyResult<Vec<Value>> {
            args.iter()
                .map(|a| {
                    let v = fgen.gen_expr(a)?;
                    fgen.coerce(v, &a.ty, &elem_ty)
                })
                .collect()
        };
        match (method, args.len()) {
            ("pop", 0) => Ok(arrays.pop(self.prog, array)),
            ("shift", 0) => Ok(arrays.shift(self.prog, array)),
            ("push", _) => {
                let values = elems(self, args)?;
                Ok(arrays.push(&mut self.builder, self.prog, array, values))
            }
            ("unshift", _) => {
                let values = elems(self, args)?;
                Ok(arrays.unshift(&mut self.builder, self.prog, array, values))
            }
            ("fill", 1..=3) => {
                let value = {
                    let v = self.gen_expr(&args[0])?;
                    self.coerce(v, &args[0].ty, &elem_ty)?
                };
                let start = match args.get(1) {
                    Some(a) => {
                        let v = self.gen_expr(a)?;
                        Some(self.coerce(v, &a.ty, &Ty::Int)?)
                    }
                    None => None,
                };
                let end = match args.get(2) {
                    Some(a) => {
                        let v = self.gen_expr(a)?;
                        Some(self.coerce(v, &a.ty, &Ty::Int)?)
                    }
                    None => None,
                };
                Ok(arrays.fill(self.prog, array, value, start, end))
            }
            _ => Err(HastyError::unsupported(format!(
                "Array.{} with {} argument(s)",
                method,
                args.len()
            ))),
        }
    }

    fn gen_named_call(&mut self, name: &str, args: &[Expr]) -> HastyResult<Value> {
        let (param_tys, ret_ty) = match self.tcx.get_fn(name) {
            Some((p, r)) => (p.clone(), r.clone()),
            None => {
                return Err(HastyError::ty(format!("unknown function `{}`", name)));
            }
        };
        if param_tys.len() != args.len() {
            return Err(HastyError::ty(format!(
                "`{}` takes {} argument(s), found {}",
                name,
                param_tys.len(),
                args.len()
            )));
        }
        let values = args
            .iter()
            .zip(&param_tys)
            .map(|(a, pty)| {
                let v = self.gen_expr(a)?;
                self.coerce(v, &a.ty, pty)
            })
            .collect::<HastyResult<Vec<_>>>()?;

        if !self.compiled.contains(name) {
            // A host function; calling it crosses the boundary through an
            // import.
            let params = param_tys.iter().map(map_ty).collect::<HastyResult<Vec<_>>>()?;
            let ret = map_ret_ty(&ret_ty)?;
            return Ok(self.extern_call(name, params, ret, values));
        }
        Ok(Value::Call {
            name: name.to_string(),
            args: values,
        })
    }

    fn gen_new(&mut self, expr: &Expr, class: &str, args: &[Expr]) -> HastyResult<Value> {
        if class == "Array" {
            let arrays = ArrayGen::for_array_ty(&expr.ty)?;
            let size = match args {
                [] => Value::ConstI32(0),
                [size] => {
                    let v = self.gen_expr(size)?;
                    self.coerce(v, &size.ty, &Ty::Int)?
                }
                _ => {
                    return Err(HastyError::unsupported(str!(
                        "`new Array` with more than one argument"
                    )))
                }
            };
            return Ok(arrays.new_array_sized(self.prog, size));
        }
        Err(HastyError::unsupported(format!(
            "`new {}`: object construction happens on the host side",
            class
        )))
    }

    fn gen_member(&mut self, object: &Expr, property: &str) -> HastyResult<Value> {
        if object.ty.is_array() && property == "length" {
            let arrays = ArrayGen::for_array_ty(&object.ty)?;
            let array = self.gen_expr(object)?;
            return Ok(arrays.length(self.prog, array));
        }
        if let Ty::Object(class_name) = &object.ty {
            let class = self.tcx.get_class(class_name).ok_or_else(|| {
                HastyError::ty(format!("unknown class `{}`", class_name))
            })?;
            let (ty, offset) = field_offset(class, property)?;
            let addr = self.gen_expr(object)?;
            return Ok(Value::Load {
                addr: Box::new(addr),
                offset,
                ty,
            });
        }
        Err(HastyError::unsupported(format!(
            "property `{}` on a value of type `{}`",
            property, object.ty
        )))
    }

    fn gen_index(&mut self, object: &Expr, index: &Expr) -> HastyResult<Value> {
        let arrays = ArrayGen::for_array_ty(&object.ty)?;
        let array = self.gen_expr(object)?;
        let idx = self.gen_expr(index)?;
        let idx = self.coerce(idx, &index.ty, &Ty::Int)?;
        Ok(arrays.get(self.prog, array, idx))
    }

    fn resolve_place(&mut self, target: &Expr) -> HastyResult<Place> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let local = self.scopes.lookup(name).ok_or_else(|| {
                    HastyError::ty(format!("unknown identifier `{}`", name))
                })?;
                Ok(Place::Local(local))
            }
            ExprKind::Index { object, index } => {
                let arrays = ArrayGen::for_array_ty(&object.ty)?;
                let array = self.gen_expr(object)?;
                let array_local = self.pin(array, IrType::Ptr);
                let idx = self.gen_expr(index)?;
                let idx = self.coerce(idx, &index.ty, &Ty::Int)?;
                let index_local = self.pin(idx, IrType::I32);
                Ok(Place::Elem {
                    arrays,
                    array_local,
                    index_local,
                })
            }
            ExprKind::Member { object, property } => {
                if object.ty.is_array() && property == "length" {
                    let arrays = ArrayGen::for_array_ty(&object.ty)?;
                    let array = self.gen_expr(object)?;
                    let array_local = self.pin(array, IrType::Ptr);
                    return Ok(Place::Length {
                        arrays,
                        array_local,
                    });
                }
                if let Ty::Object(class_name) = &object.ty {
                    let class = self.tcx.get_class(class_name).ok_or_else(|| {
                        HastyError::ty(format!("unknown class `{}`", class_name))
                    })?;
                    let (ty, offset) = field_offset(class, property)?;
                    let addr = self.gen_expr(object)?;
                    let addr_local = self.pin(addr, IrType::Ptr);
                    return Ok(Place::Field {
                        addr_local,
                        offset,
                        ty,
                    });
                }
                Err(HastyError::unsupported(format!(
                    "cannot assign to property `{}` of a `{}`",
                    property, object.ty
                )))
            }
            ExprKind::Paren(inner) => self.resolve_place(inner),
            other => Err(HastyError::unsupported(format!(
                "cannot assign to a {}",
                other.name()
            ))),
        }
    }

    /// Materializes a value into a local so it can be read more than once.
    fn pin(&mut self, value: Value, ty: IrType) -> usize {
        if let Value::Local(l) = value {
            return l;
        }
        let tmp = self.builder.add_local(ty);
        self.builder.emit(Inst::SetLocal(tmp, value));
        tmp
    }

    fn load_place(&mut self, place: &Place) -> Value {
        match place {
            Place::Local(l) => Value::Local(*l),
            Place::Field {
                addr_local,
                offset,
                ty,
            } => Value::Load {
                addr: Box::new(Value::Local(*addr_local)),
                offset: *offset,
                ty: *ty,
            },
            Place::Elem {
                arrays,
                array_local,
                index_local,
            } => arrays.get(
                self.prog,
                Value::Local(*array_local),
                Value::Local(*index_local),
            ),
            Place::Length {
                arrays,
                array_local,
            } => arrays.length(self.prog, Value::Local(*array_local)),
        }
    }

    fn store_place(&mut self, place: &Place, value: Value) {
        match place {
            Place::Local(l) => self.builder.emit(Inst::SetLocal(*l, value)),
            Place::Field {
                addr_local,
                offset,
                ty,
            } => self.builder.emit(Inst::Store {
                addr: Value::Local(*addr_local),
                offset: *offset,
                ty: *ty,
                value,
            }),
            Place::Elem {
                arrays,
                array_local,
                index_local,
            } => arrays.set(
                &mut self.builder,
                self.prog,
                Value::Local(*array_local),
                Value::Local(*index_local),
                value,
            ),
            Place::Length {
                arrays,
                array_local,
            } => arrays.set_length(
                &mut self.builder,
                self.prog,
                Value::Local(*array_local),
                value,
            ),
        }
    }

    /// A boolean word for use in a branch.
    fn truthy(&mut self, expr: &Expr) -> HastyResult<Value> {
        let value = self.gen_expr(expr)?;
        if expr.ty.is_bool_like() {
            Ok(value)
        } else if expr.ty.is_int_like() {
            Ok(Value::BinOp {
                op: Op::Neq,
                ty: IrType::I32,
                lhs: Box::new(value),
                rhs: Box::new(Value::ConstI32(0)),
            })
        } else if expr.ty.is_number_like() {
            Ok(Value::BinOp {
                op: Op::Neq,
                ty: IrType::F64,
                lhs: Box::new(value),
                rhs: Box::new(Value::ConstF64(0.0)),
            })
        } else {
            Err(HastyError::ty(format!(
                "a condition must be boolean or numeric, found `{}`",
                expr.ty
            )))
        }
    }

    fn coerce(&self, value: Value, from: &Ty, to: &Ty) -> HastyResult<Value> {
        if from == to {
            return Ok(value);
        }
        match (from, to) {
            (Ty::Int, Ty::Number) => Ok(Value::Convert {
                from: IrType::I32,
                to: IrType::F64,
                value: Box::new(value),
            }),
            (Ty::Number, Ty::Int) => Ok(Value::Convert {
                from: IrType::F64,
                to: IrType::I32,
                value: Box::new(value),
            }),
            _ => {
                // Structurally identical reference types pass through.
                if map_ty(from)? == map_ty(to)? {
                    Ok(value)
                } else {
                    Err(HastyError::ty(format!(
                        "cannot convert `{}` to `{}`",
                        from, to
                    )))
                }
            }
        }
    }

    fn extern_call(
        &mut self,
        name: &str,
        params: Vec<IrType>,
        ret_ty: Option<IrType>,
        args: Vec<Value>,
    ) -> Value {
        self.prog.add_extern(Extern {
            name: name.to_string(),
            params,
            ret_ty,
        });
        Value::Call {
            name: name.to_string(),
            args,
        }
    }
}

/// Whether `init` produces an array this binding is responsible for
/// releasing: literals, `new Array`, and calls that hand their result over.
/// Method results like `fill` alias the receiver and are not fresh.
fn creates_fresh_array(init: &Expr) -> bool {
    match &init.kind {
        ExprKind::Array(_) | ExprKind::New { .. } => true,
        ExprKind::Call { callee, .. } => matches!(callee.kind, ExprKind::Ident(_)),
        ExprKind::Paren(inner) => creates_fresh_array(inner),
        _ => false,
    }
}

fn arith_op(op: BinOp) -> HastyResult<Op> {
    match op {
        BinOp::Add => Ok(Op::Add),
        BinOp::Sub => Ok(Op::Sub),
        BinOp::Mul => Ok(Op::Mul),
        BinOp::Div => Ok(Op::Div),
        BinOp::Rem => Ok(Op::Rem),
        BinOp::BitAnd => Ok(Op::BitAnd),
        BinOp::BitOr => Ok(Op::BitOr),
        BinOp::BitXor => Ok(Op::BitXor),
        other => Err(HastyError::unsupported(format!(
            "`{}=` is not an assignment operator",
            other
        ))),
    }
}
