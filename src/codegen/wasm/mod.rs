//! Lowering from the IR to a binary module.
//!
//! Control flow is rebuilt structurally from the loop and branch shapes the
//! generator recorded, instead of being rediscovered from the block graph:
//! every `goto` lands on a label that is either sequentially next or open
//! as an enclosing construct, so each one lowers to a single `br` whose
//! depth is the label's distance from the top of the open-construct stack.
//!
//! The stack zone of linear memory is managed through two globals: an
//! imported immutable `STACKTOP` (the zone's base, decided by the loader)
//! and an internal mutable stack pointer seeded from it. Functions that
//! need frame storage save the pointer into a scratch local on entry, bump
//! it, and restore it on every return.

use std::collections::HashMap;

pub use parity_wasm::elements::*;

use crate::lir;
use crate::lir::{Inst, Intrinsic, IrType, Op, Value};
use crate::utils::join;

/// Name of the imported stack-base global.
pub const STACK_BASE_GLOBAL: &str = "STACKTOP";
/// Import module every external function and global comes from.
pub const IMPORT_MODULE: &str = "env";

pub fn codegen(program: &lir::Program) -> Module {
    let mut ctx = WasmCtx::new();
    ctx.lower_program(program);
    ctx.module
}

fn i32_ty(ty: IrType) -> ValueType {
    if ty.is_word() {
        ValueType::I32
    } else {
        ValueType::F64
    }
}

fn fn_ty(params: &[IrType], ret_ty: &Option<IrType>) -> Type {
    let params = params.iter().map(|&t| i32_ty(t)).collect();
    let results = match ret_ty {
        Some(t) => vec![i32_ty(*t)],
        None => vec![],
    };
    Type::Function(FunctionType::new(params, results))
}

struct WasmCtx {
    module: Module,
    fn_types: HashMap<String, u32>,
    fn_index: HashMap<String, u32>,
    has_result: HashMap<String, bool>,
    sp_global: u32,
}

impl WasmCtx {
    fn new() -> WasmCtx {
        WasmCtx {
            module: Module::new(vec![]),
            fn_types: HashMap::new(),
            fn_index: HashMap::new(),
            has_result: HashMap::new(),
            sp_global: 0,
        }
    }

    fn get_type_ref(&mut self, params: &[IrType], ret_ty: &Option<IrType>) -> u32 {
        let key = format!(
            "({}):{}",
            join(params, ","),
            ret_ty.map_or(str!("void"), |t| t.to_string())
        );
        if let Some(&type_ref) = self.fn_types.get(&key) {
            return type_ref;
        }
        let ty = fn_ty(params, ret_ty);
        let type_ref = if let Some(sec) = self.module.type_section_mut() {
            let r = sec.types().len() as u32;
            sec.types_mut().push(ty);
            r
        } else {
            let sec = Section::Type(TypeSection::with_types(vec![ty]));
            self.module.insert_section(sec).unwrap();
            0
        };
        self.fn_types.insert(key, type_ref);
        type_ref
    }

    fn add_fn_name(&mut self, idx: u32, name: &str) {
        let name_sec = self.module.names_section_mut().unwrap();
        name_sec
            .functions_mut()
            .as_mut()
            .unwrap()
            .names_mut()
            .insert(idx, name.to_string());
    }

    fn lower_program(&mut self, program: &lir::Program) {
        // Section scaffolding; sections are inserted in id order.
        self.module
            .insert_section(Section::Export(ExportSection::with_entries(vec![])))
            .unwrap();
        self.module
            .insert_section(Section::Name(NameSection::new(
                None,
                Some(FunctionNameSubsection::default()),
                None,
            )))
            .unwrap();

        // The synthesized allocator sits on top of `sbrk` even when no
        // user code allocates.
        let mut externs = program.externs.clone();
        if !externs.iter().any(|e| e.name == "sbrk") {
            externs.push(lir::Extern {
                name: str!("sbrk"),
                params: vec![IrType::I32],
                ret_ty: Some(IrType::Ptr),
            });
        }

        // Imports: linear memory, the stack base, and every extern.
        let mut entries = vec![ImportEntry::new(
            str!(IMPORT_MODULE),
            str!("memory"),
            External::Memory(MemoryType::new(1, None)),
        )];
        entries.push(ImportEntry::new(
            str!(IMPORT_MODULE),
            str!(STACK_BASE_GLOBAL),
            External::Global(GlobalType::new(ValueType::I32, false)),
        ));
        for ext in &externs {
            let ty_idx = self.get_type_ref(&ext.params, &ext.ret_ty);
            let idx = self.fn_index.len() as u32;
            self.fn_index.insert(ext.name.clone(), idx);
            self.has_result.insert(ext.name.clone(), ext.ret_ty.is_some());
            self.add_fn_name(idx, &ext.name);
            entries.push(ImportEntry::new(
                str!(IMPORT_MODULE),
                ext.name.clone(),
                External::Function(ty_idx),
            ));
        }
        self.module
            .insert_section(Section::Import(ImportSection::with_entries(entries)))
            .unwrap();

        self.module
            .insert_section(Section::Function(FunctionSection::with_entries(vec![])))
            .unwrap();
        self.module
            .insert_section(Section::Code(CodeSection::with_bodies(vec![])))
            .unwrap();

        // The mutable stack pointer, seeded from the imported base.
        // STACKTOP is the only imported global, so its index is 0 and the
        // defined one lands at 1.
        self.sp_global = 1;
        let sp = GlobalEntry::new(
            GlobalType::new(ValueType::I32, true),
            InitExpr::new(vec![Instruction::GetGlobal(0), Instruction::End]),
        );
        self.module
            .insert_section(Section::Global(GlobalSection::with_entries(vec![sp])))
            .unwrap();

        for func in &program.funcs {
            self.has_result
                .insert(func.name.clone(), func.ret_ty.is_some());
        }

        // Declare every function before lowering any body, so calls between
        // them resolve to final indices.
        for func in &program.funcs {
            let params: Vec<IrType> = func.params.iter().map(|p| p.ty).collect();
            self.declare_fn(&func.name, &params, &func.ret_ty, func.exported);
        }
        self.declare_fn("malloc", &[IrType::I32], &Some(IrType::Ptr), true);
        self.declare_fn("free", &[IrType::Ptr], &None, true);

        for func in &program.funcs {
            let body = FnLower::new(self, func).lower();
            self.set_body(&func.name, body);
        }
        self.set_body("malloc", self.malloc_body());
        self.set_body("free", FuncBody::new(vec![], Instructions::new(vec![Instruction::End])));
    }

    fn declare_fn(&mut self, name: &str, params: &[IrType], ret_ty: &Option<IrType>, export: bool) {
        let ty_idx = self.get_type_ref(params, ret_ty);
        self.module
            .function_section_mut()
            .unwrap()
            .entries_mut()
            .push(Func::new(ty_idx));
        self.module
            .code_section_mut()
            .unwrap()
            .bodies_mut()
            .push(FuncBody::new(vec![], Instructions::new(vec![])));

        let idx = self.fn_index.len() as u32;
        self.fn_index.insert(name.to_string(), idx);
        self.add_fn_name(idx, name);
        if export {
            self.module
                .export_section_mut()
                .unwrap()
                .entries_mut()
                .push(ExportEntry::new(name.to_string(), Internal::Function(idx)));
        }
    }

    fn set_body(&mut self, name: &str, body: FuncBody) {
        let idx = *self
            .fn_index
            .get(name)
            .unwrap_or_else(|| panic!("COMPILER BUG: `{}` was never declared", name));
        let n_imports = self
            .module
            .import_section()
            .map_or(0, |s| s.functions()) as u32;
        let body_idx = (idx - n_imports) as usize;
        self.module.code_section_mut().unwrap().bodies_mut()[body_idx] = body;
    }

    /// `malloc(n)`: round up to a 16-byte boundary and bump through `sbrk`.
    fn malloc_body(&self) -> FuncBody {
        let sbrk = self.fn_index["sbrk"];
        FuncBody::new(
            vec![],
            Instructions::new(vec![
                Instruction::GetLocal(0),
                Instruction::I32Const(15),
                Instruction::I32Add,
                Instruction::I32Const(-16),
                Instruction::I32And,
                Instruction::Call(sbrk),
                Instruction::End,
            ]),
        )
    }
}

struct FnLower<'a> {
    ctx: &'a WasmCtx,
    func: &'a lir::Func,
    loop_by_header: HashMap<usize, &'a lir::LoopInfo>,
    if_by_cond: HashMap<usize, &'a lir::IfInfo>,
    /// Labels of human-facing constructs currently open, innermost last.
    /// The `br` depth of a jump target is its distance from the end.
    frames: Vec<usize>,
    /// Scratch local holding the frame pointer; last local index.
    fp_local: u32,
    insts: Vec<Instruction>,
}

impl<'a> FnLower<'a> {
    fn new(ctx: &'a WasmCtx, func: &'a lir::Func) -> FnLower<'a> {
        let loop_by_header = func.loops.iter().map(|l| (l.header, l)).collect();
        let if_by_cond = func.ifs.iter().map(|i| (i.cond_block, i)).collect();
        FnLower {
            ctx,
            func,
            loop_by_header,
            if_by_cond,
            frames: vec![],
            fp_local: func.locals.len() as u32,
            insts: vec![],
        }
    }

    fn lower(mut self) -> FuncBody {
        log::debug!("lowering `{}`", self.func.name);
        let reachable = self.func.reachable_blocks();
        if reachable.len() != self.func.blocks.len() {
            log::debug!(
                "`{}`: skipping {} dead block(s)",
                self.func.name,
                self.func.blocks.len() - reachable.len()
            );
        }

        if self.func.frame_size > 0 {
            // fp = sp; sp = fp + frame
            self.insts.push(Instruction::GetGlobal(self.ctx.sp_global));
            self.insts.push(Instruction::TeeLocal(self.fp_local));
            self.insts.push(Instruction::I32Const(self.func.frame_size as i32));
            self.insts.push(Instruction::I32Add);
            self.insts.push(Instruction::SetGlobal(self.ctx.sp_global));
        }
        self.emit_chain(0);
        self.insts.push(Instruction::End);

        let mut locals: Vec<Local> = self
            .func
            .locals
            .iter()
            .skip(self.func.params.len())
            .map(|l| Local::new(1, i32_ty(l.ty)))
            .collect();
        locals.push(Local::new(1, ValueType::I32)); // fp scratch
        FuncBody::new(locals, Instructions::new(self.insts))
    }

    fn depth_of(&self, label: usize) -> u32 {
        self.frames
            .iter()
            .rev()
            .position(|&l| l == label)
            .unwrap_or_else(|| {
                panic!(
                    "COMPILER BUG: no open construct for B{} in `{}`",
                    label, self.func.name
                )
            }) as u32
    }

    /// Emits blocks starting at `start`, following sequential gotos and
    /// descending into recorded structures, until every path has branched
    /// or returned.
    fn emit_chain(&mut self, start: usize) {
        let func = self.func;
        let mut cur = start;
        loop {
            if let Some(&li) = self.loop_by_header.get(&cur) {
                self.emit_loop(li);
                cur = li.exit;
                continue;
            }
            if let Some(&ii) = self.if_by_cond.get(&cur) {
                self.emit_if(ii);
                cur = ii.join;
                continue;
            }
            match self.emit_block_insts(&func.blocks[cur]) {
                Next::Sequential(label) => cur = label,
                Next::Done => return,
            }
        }
    }

    /// The straight-line instructions of a block plus its terminator.
    fn emit_block_insts(&mut self, block: &lir::Block) -> Next {
        let terminator = block
            .terminator()
            .unwrap_or_else(|| {
                panic!(
                    "COMPILER BUG: block B{} of `{}` has no terminator",
                    block.label, self.func.name
                )
            })
            .clone();
        for inst in &block.insts[..block.insts.len() - 1] {
            self.emit_inst(inst);
        }
        match terminator {
            Inst::Goto(label) => {
                if self.frames.contains(&label) {
                    let depth = self.depth_of(label);
                    self.insts.push(Instruction::Br(depth));
                    Next::Done
                } else {
                    Next::Sequential(label)
                }
            }
            Inst::Return(value) => {
                if let Some(v) = &value {
                    self.emit_value(v);
                }
                if self.func.frame_size > 0 {
                    self.insts.push(Instruction::GetLocal(self.fp_local));
                    self.insts.push(Instruction::SetGlobal(self.ctx.sp_global));
                }
                self.insts.push(Instruction::Return);
                Next::Done
            }
            Inst::Halt => {
                self.insts.push(Instruction::Unreachable);
                Next::Done
            }
            // A conditional branch that is not a recorded `if` is a loop's
            // exit test: the false edge leaves an open construct and the
            // true edge continues into the body.
            Inst::CondBr {
                cond,
                then_label,
                else_label,
            } => {
                if !self.frames.contains(&else_label) {
                    panic!(
                        "COMPILER BUG: stray conditional branch in B{} of `{}`",
                        block.label, self.func.name
                    );
                }
                self.emit_value(&cond);
                self.insts.push(Instruction::I32Eqz);
                let depth = self.depth_of(else_label);
                self.insts.push(Instruction::BrIf(depth));
                Next::Sequential(then_label)
            }
            _ => unreachable!(),
        }
    }

    fn emit_loop(&mut self, li: &'a lir::LoopInfo) {
        self.insts.push(Instruction::Block(BlockType::NoResult));
        self.frames.push(li.exit);
        self.insts.push(Instruction::Loop(BlockType::NoResult));
        self.frames.push(li.header);

        if li.cont != li.header {
            // A separate continue target (the `for` increment): the test
            // and body run inside one more block whose end is the
            // increment, followed by the back edge.
            self.insts.push(Instruction::Block(BlockType::NoResult));
            self.frames.push(li.cont);
            self.emit_header_chain(li.header);
            self.insts.push(Instruction::End);
            self.frames.pop();
            self.emit_chain(li.cont);
        } else {
            self.emit_header_chain(li.header);
        }

        self.insts.push(Instruction::End);
        self.frames.pop();
        self.insts.push(Instruction::End);
        self.frames.pop();
    }

    /// The chain starting at a loop's own header. The header label is
    /// already open as the loop being emitted, so the loop dispatch must
    /// not fire for it again; its condition may still open branch
    /// structures of its own.
    fn emit_header_chain(&mut self, header: usize) {
        let func = self.func;
        if let Some(&ii) = self.if_by_cond.get(&header) {
            self.emit_if(ii);
            self.emit_chain(ii.join);
            return;
        }
        match self.emit_block_insts(&func.blocks[header]) {
            Next::Sequential(label) => self.emit_chain(label),
            Next::Done => {}
        }
    }

    fn emit_if(&mut self, ii: &'a lir::IfInfo) {
        let func = self.func;
        let cond_block = &func.blocks[ii.cond_block];
        let has_else = ii.else_label != ii.join;

        self.insts.push(Instruction::Block(BlockType::NoResult));
        self.frames.push(ii.join);
        if has_else {
            self.insts.push(Instruction::Block(BlockType::NoResult));
            self.frames.push(ii.else_label);
        }

        let terminator = cond_block
            .terminator()
            .unwrap_or_else(|| panic!("COMPILER BUG: open branch block B{}", ii.cond_block))
            .clone();
        for inst in &cond_block.insts[..cond_block.insts.len() - 1] {
            self.emit_inst(inst);
        }
        match terminator {
            Inst::CondBr {
                cond, else_label, ..
            } => {
                self.emit_value(&cond);
                self.insts.push(Instruction::I32Eqz);
                let depth = self.depth_of(else_label);
                self.insts.push(Instruction::BrIf(depth));
            }
            other => panic!("COMPILER BUG: bad branch terminator `{}`", other),
        }

        self.emit_chain(ii.then_label);
        if has_else {
            self.insts.push(Instruction::End);
            self.frames.pop();
            self.emit_chain(ii.else_label);
        }
        self.insts.push(Instruction::End);
        self.frames.pop();
    }

    fn emit_inst(&mut self, inst: &Inst) {
        match inst {
            Inst::SetLocal(idx, value) => {
                self.emit_value(value);
                self.insts.push(Instruction::SetLocal(*idx as u32));
            }
            Inst::Store {
                addr,
                offset,
                ty,
                value,
            } => {
                self.emit_value(addr);
                self.emit_value(value);
                self.insts.push(match ty {
                    IrType::I1 | IrType::I8 => Instruction::I32Store8(0, *offset),
                    IrType::I32 | IrType::Ptr => Instruction::I32Store(0, *offset),
                    IrType::F64 => Instruction::F64Store(0, *offset),
                });
            }
            Inst::Eval(value) => {
                self.emit_value(value);
                if self.value_has_result(value) {
                    self.insts.push(Instruction::Drop);
                }
            }
            other => panic!("COMPILER BUG: `{}` is not a straight-line instruction", other),
        }
    }

    fn value_has_result(&self, value: &Value) -> bool {
        match value {
            Value::Call { name, .. } => *self
                .ctx
                .has_result
                .get(name)
                .unwrap_or_else(|| panic!("COMPILER BUG: unknown call target `{}`", name)),
            _ => true,
        }
    }

    fn emit_value(&mut self, value: &Value) {
        match value {
            Value::ConstI32(i) => self.insts.push(Instruction::I32Const(*i)),
            Value::ConstF64(x) => self.insts.push(Instruction::F64Const(x.to_bits())),
            Value::ConstBool(b) => self.insts.push(Instruction::I32Const(*b as i32)),
            Value::NullPtr => self.insts.push(Instruction::I32Const(0)),
            Value::Local(idx) => self.insts.push(Instruction::GetLocal(*idx as u32)),
            Value::StackAddr { offset } => {
                self.insts.push(Instruction::GetLocal(self.fp_local));
                if *offset != 0 {
                    self.insts.push(Instruction::I32Const(*offset as i32));
                    self.insts.push(Instruction::I32Add);
                }
            }
            Value::BinOp { op, ty, lhs, rhs } => {
                self.emit_value(lhs);
                self.emit_value(rhs);
                self.insts.push(select_op(*op, *ty));
            }
            Value::Eqz(inner) => {
                self.emit_value(inner);
                self.insts.push(Instruction::I32Eqz);
            }
            Value::FNeg(inner) => {
                self.emit_value(inner);
                self.insts.push(Instruction::F64Neg);
            }
            Value::Call { name, args } => {
                for arg in args {
                    self.emit_value(arg);
                }
                let idx = *self
                    .ctx
                    .fn_index
                    .get(name)
                    .unwrap_or_else(|| panic!("COMPILER BUG: unknown call target `{}`", name));
                self.insts.push(Instruction::Call(idx));
            }
            Value::Intrinsic { op, args } => {
                for arg in args {
                    self.emit_value(arg);
                }
                self.insts.push(match op {
                    Intrinsic::Sqrt => Instruction::F64Sqrt,
                });
            }
            Value::Load { addr, offset, ty } => {
                self.emit_value(addr);
                self.insts.push(match ty {
                    IrType::I1 => Instruction::I32Load8U(0, *offset),
                    IrType::I8 => Instruction::I32Load8S(0, *offset),
                    IrType::I32 | IrType::Ptr => Instruction::I32Load(0, *offset),
                    IrType::F64 => Instruction::F64Load(0, *offset),
                });
            }
            Value::Convert { from, to, value } => {
                self.emit_value(value);
                match (from, to) {
                    (IrType::I32, IrType::F64) => {
                        self.insts.push(Instruction::F64ConvertSI32)
                    }
                    (IrType::F64, IrType::I32) => self.insts.push(Instruction::I32TruncSF64),
                    (a, b) if a == b => {}
                    (a, b) => panic!("COMPILER BUG: no conversion from {} to {}", a, b),
                }
            }
        }
    }
}

enum Next {
    Sequential(usize),
    Done,
}

fn select_op(op: Op, ty: IrType) -> Instruction {
    match ty {
        IrType::F64 => match op {
            Op::Add => Instruction::F64Add,
            Op::Sub => Instruction::F64Sub,
            Op::Mul => Instruction::F64Mul,
            Op::Div => Instruction::F64Div,
            // Float comparisons are false on NaN operands, which is the
            // semantics the source language expects.
            Op::Lt => Instruction::F64Lt,
            Op::Gt => Instruction::F64Gt,
            Op::LtEq => Instruction::F64Le,
            Op::GtEq => Instruction::F64Ge,
            Op::Eq => Instruction::F64Eq,
            Op::Neq => Instruction::F64Ne,
            Op::Rem | Op::BitAnd | Op::BitOr | Op::BitXor => {
                panic!("COMPILER BUG: `{}` has no f64 instruction", op)
            }
        },
        _ => match op {
            Op::Add => Instruction::I32Add,
            Op::Sub => Instruction::I32Sub,
            Op::Mul => Instruction::I32Mul,
            Op::Div => Instruction::I32DivS,
            Op::Rem => Instruction::I32RemS,
            Op::Lt => Instruction::I32LtS,
            Op::Gt => Instruction::I32GtS,
            Op::LtEq => Instruction::I32LeS,
            Op::GtEq => Instruction::I32GeS,
            Op::Eq => Instruction::I32Eq,
            Op::Neq => Instruction::I32Ne,
            Op::BitAnd => Instruction::I32And,
            Op::BitOr => Instruction::I32Or,
            Op::BitXor => Instruction::I32Xor,
        },
    }
}

#[cfg(test)]
mod wasm_test {
    use super::*;
    use crate::lir::{Block, Builder, Extern, Func, Param, Program};

    fn one_block_fn(name: &str, ret_ty: Option<IrType>, insts: Vec<Inst>) -> Func {
        Func {
            name: name.to_string(),
            params: vec![],
            ret_ty,
            locals: vec![],
            blocks: vec![Block { label: 0, insts }],
            frame_size: 0,
            loops: vec![],
            ifs: vec![],
            exported: true,
        }
    }

    fn body_of<'m>(module: &'m Module, program_fn: usize) -> &'m FuncBody {
        &module.code_section().unwrap().bodies()[program_fn]
    }

    #[test]
    fn test_op_selection() {
        assert_eq!(select_op(Op::Div, IrType::I32), Instruction::I32DivS);
        assert_eq!(select_op(Op::Rem, IrType::I32), Instruction::I32RemS);
        assert_eq!(select_op(Op::Div, IrType::F64), Instruction::F64Div);
        assert_eq!(select_op(Op::Lt, IrType::F64), Instruction::F64Lt);
        assert_eq!(select_op(Op::Eq, IrType::Ptr), Instruction::I32Eq);
    }

    #[test]
    fn test_malloc_and_free_are_synthesized() {
        let module = codegen(&Program::default());
        let exports: Vec<&str> = module
            .export_section()
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.field())
            .collect();
        assert!(exports.contains(&"malloc"));
        assert!(exports.contains(&"free"));
        // sbrk is imported even though no user code allocated.
        let imports: Vec<&str> = module
            .import_section()
            .unwrap()
            .entries()
            .iter()
            .map(|e| e.field())
            .collect();
        assert!(imports.contains(&"sbrk"));
        assert!(imports.contains(&"memory"));
        assert!(imports.contains(&STACK_BASE_GLOBAL));
    }

    #[test]
    fn test_simple_return() {
        let mut program = Program::default();
        program.funcs.push(one_block_fn(
            "answer",
            Some(IrType::I32),
            vec![Inst::Return(Some(Value::BinOp {
                op: Op::Mul,
                ty: IrType::I32,
                lhs: Box::new(Value::ConstI32(6)),
                rhs: Box::new(Value::ConstI32(7)),
            }))],
        ));
        let module = codegen(&program);
        let body = body_of(&module, 0);
        assert_eq!(
            body.code().elements(),
            &[
                Instruction::I32Const(6),
                Instruction::I32Const(7),
                Instruction::I32Mul,
                Instruction::Return,
                Instruction::End,
            ]
        );
    }

    #[test]
    fn test_void_extern_call_is_not_dropped() {
        let mut program = Program::default();
        program.externs.push(Extern {
            name: str!("log_value"),
            params: vec![IrType::I32],
            ret_ty: None,
        });
        program.funcs.push(one_block_fn(
            "run",
            None,
            vec![
                Inst::Eval(Value::Call {
                    name: str!("log_value"),
                    args: vec![Value::ConstI32(3)],
                }),
                Inst::Return(None),
            ],
        ));
        let module = codegen(&program);
        let body = body_of(&module, 0);
        assert!(!body
            .code()
            .elements()
            .iter()
            .any(|i| matches!(i, Instruction::Drop)));
    }

    #[test]
    fn test_loop_lowering_shape() {
        // while (i < 10) { i = i + 1 }
        let mut b = Builder::new(
            "count",
            vec![Param {
                name: str!("i"),
                ty: IrType::I32,
            }],
            None,
            true,
        );
        let header = b.new_block();
        b.emit(Inst::Goto(header));
        let exit = b.new_block();
        b.record_loop(crate::lir::LoopInfo {
            header,
            cont: header,
            exit,
        });
        b.position_at_end(header);
        let body = b.new_block();
        b.emit(Inst::CondBr {
            cond: Value::BinOp {
                op: Op::Lt,
                ty: IrType::I32,
                lhs: Box::new(Value::Local(0)),
                rhs: Box::new(Value::ConstI32(10)),
            },
            then_label: body,
            else_label: exit,
        });
        b.position_at_end(body);
        b.emit(Inst::SetLocal(
            0,
            Value::BinOp {
                op: Op::Add,
                ty: IrType::I32,
                lhs: Box::new(Value::Local(0)),
                rhs: Box::new(Value::ConstI32(1)),
            },
        ));
        b.emit(Inst::Goto(header));
        b.position_at_end(exit);
        b.emit(Inst::Return(None));

        let mut program = Program::default();
        program.funcs.push(b.finish());
        let module = codegen(&program);
        let insts = body_of(&module, 0).code().elements();

        // Outer block (break target), inner loop (continue target), exit
        // test with BrIf(1), back edge Br(0).
        assert_eq!(insts[0], Instruction::Block(BlockType::NoResult));
        assert_eq!(insts[1], Instruction::Loop(BlockType::NoResult));
        assert!(insts.contains(&Instruction::BrIf(1)));
        assert!(insts.contains(&Instruction::Br(0)));
    }
}
