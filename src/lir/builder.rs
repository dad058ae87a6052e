//! Incremental construction of a [`Func`]'s block graph.
//!
//! The builder keeps a cursor block that all emits go to. Positioning the
//! cursor on a terminated block is fine (dead stretches after `return` are
//! common while walking a source tree); emitting into one is a bug in the
//! caller and panics.

use crate::lir::types::{
    Block, Func, IfInfo, Inst, IrType, Local, LoopInfo, Param, Value,
};

pub struct Builder {
    name: String,
    params: Vec<Param>,
    ret_ty: Option<IrType>,
    locals: Vec<Local>,
    blocks: Vec<Block>,
    cursor: usize,
    frame_size: u32,
    loops: Vec<LoopInfo>,
    ifs: Vec<IfInfo>,
    exported: bool,
}

impl Builder {
    pub fn new<S: Into<String>>(
        name: S,
        params: Vec<Param>,
        ret_ty: Option<IrType>,
        exported: bool,
    ) -> Builder {
        // Params double as the first locals.
        let locals = params.iter().map(|p| Local { ty: p.ty }).collect();
        Builder {
            name: name.into(),
            params,
            ret_ty,
            locals,
            blocks: vec![Block::default()],
            cursor: 0,
            frame_size: 0,
            loops: vec![],
            ifs: vec![],
            exported,
        }
    }

    pub fn ret_ty(&self) -> Option<IrType> {
        self.ret_ty
    }

    pub fn current_block(&self) -> usize {
        self.cursor
    }

    pub fn new_block(&mut self) -> usize {
        let label = self.blocks.len();
        self.blocks.push(Block {
            label,
            insts: vec![],
        });
        label
    }

    pub fn position_at_end(&mut self, label: usize) {
        if label >= self.blocks.len() {
            panic!("COMPILER BUG: positioning on unknown block B{}", label);
        }
        self.cursor = label;
    }

    pub fn is_terminated(&self) -> bool {
        self.blocks[self.cursor].is_terminated()
    }

    pub fn emit(&mut self, inst: Inst) {
        let block = &mut self.blocks[self.cursor];
        if block.is_terminated() {
            panic!(
                "COMPILER BUG: emitting `{}` into terminated block B{}",
                inst, block.label
            );
        }
        block.insts.push(inst);
    }

    pub fn add_local(&mut self, ty: IrType) -> usize {
        self.locals.push(Local { ty });
        self.locals.len() - 1
    }

    pub fn local_ty(&self, idx: usize) -> IrType {
        self.locals[idx].ty
    }

    /// Reserves `size` bytes of frame storage aligned to `align` and returns
    /// its address value.
    pub fn stack_alloc(&mut self, size: u32, align: u32) -> Value {
        let offset = (self.frame_size + align - 1) & !(align - 1);
        self.frame_size = offset + size;
        Value::StackAddr { offset }
    }

    pub fn record_loop(&mut self, info: LoopInfo) {
        self.loops.push(info);
    }

    pub fn record_if(&mut self, info: IfInfo) {
        self.ifs.push(info);
    }

    /// Seals the function. Any open block that falls off the end of a void
    /// function gets an implicit return. In a value-returning function the
    /// checker guarantees all reachable paths return, so an open block there
    /// can only be an unreachable join; it gets a trap.
    pub fn finish(mut self) -> Func {
        for block in &mut self.blocks {
            if !block.is_terminated() {
                if self.ret_ty.is_some() {
                    block.insts.push(Inst::Halt);
                } else {
                    block.insts.push(Inst::Return(None));
                }
            }
        }
        // Keep every frame 16-byte aligned so nested frames stay aligned.
        let frame_size = (self.frame_size + 15) & !15;
        Func {
            name: self.name,
            params: self.params,
            ret_ty: self.ret_ty,
            locals: self.locals,
            blocks: self.blocks,
            frame_size,
            loops: self.loops,
            ifs: self.ifs,
            exported: self.exported,
        }
    }
}
