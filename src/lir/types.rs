use std::collections::HashSet;
use std::fmt;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use crate::utils::{indent, join, map_join};

/// The storage types of the low-level IR. Front-end types are mapped down to
/// these before any instruction is emitted; nothing past this point knows
/// about classes or arrays, only about words in memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IrType {
    /// Booleans. One byte in memory, an i32 word on the stack.
    I1,
    /// Small array elements. One byte in memory, sign-extended on load.
    I8,
    I32,
    F64,
    /// Addresses and object references. An i32 word.
    Ptr,
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::I1 => write!(f, "i1"),
            IrType::I8 => write!(f, "i8"),
            IrType::I32 => write!(f, "i32"),
            IrType::F64 => write!(f, "f64"),
            IrType::Ptr => write!(f, "ptr"),
        }
    }
}

impl IrType {
    /// Size in linear memory, in bytes.
    pub fn size(&self) -> u32 {
        match self {
            IrType::I1 | IrType::I8 => 1,
            IrType::I32 | IrType::Ptr => 4,
            IrType::F64 => 8,
        }
    }

    /// Whether values of this type occupy an i32 stack slot.
    pub fn is_word(&self) -> bool {
        !matches!(self, IrType::F64)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Eq,
    Neq,
    BitAnd,
    BitOr,
    BitXor,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Rem => "rem",
            Op::Lt => "lt",
            Op::Gt => "gt",
            Op::LtEq => "le",
            Op::GtEq => "ge",
            Op::Eq => "eq",
            Op::Neq => "ne",
            Op::BitAnd => "and",
            Op::BitOr => "or",
            Op::BitXor => "xor",
        };
        write!(f, "{}", s)
    }
}

impl Op {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Op::Lt | Op::Gt | Op::LtEq | Op::GtEq | Op::Eq | Op::Neq
        )
    }
}

/// Intrinsics lowered to a dedicated instruction rather than a call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Intrinsic {
    Sqrt,
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intrinsic::Sqrt => write!(f, "sqrt"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    ConstI32(i32),
    ConstF64(f64),
    ConstBool(bool),
    NullPtr,
    Local(usize),
    /// An address inside the current function's stack frame.
    StackAddr { offset: u32 },
    BinOp {
        op: Op,
        ty: IrType,
        lhs: Box<Value>,
        rhs: Box<Value>,
    },
    /// Integer equal-to-zero; used for logical negation.
    Eqz(Box<Value>),
    FNeg(Box<Value>),
    Call {
        name: String,
        args: Vec<Value>,
    },
    Intrinsic {
        op: Intrinsic,
        args: Vec<Value>,
    },
    Load {
        addr: Box<Value>,
        offset: u32,
        ty: IrType,
    },
    Convert {
        from: IrType,
        to: IrType,
        value: Box<Value>,
    },
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::ConstI32(i) => write!(f, "{}", i),
            Value::ConstF64(x) => write!(f, "{:?}", x),
            Value::ConstBool(b) => write!(f, "{}", b),
            Value::NullPtr => write!(f, "null"),
            Value::Local(i) => write!(f, "${}", i),
            Value::StackAddr { offset } => write!(f, "frame+{}", offset),
            Value::BinOp { op, ty, lhs, rhs } => {
                write!(f, "{}.{}({}, {})", ty, op, lhs, rhs)
            }
            Value::Eqz(v) => write!(f, "eqz({})", v),
            Value::FNeg(v) => write!(f, "fneg({})", v),
            Value::Call { name, args } => write!(f, "call {}({})", name, join(args, ", ")),
            Value::Intrinsic { op, args } => write!(f, "{}({})", op, join(args, ", ")),
            Value::Load { addr, offset, ty } => {
                write!(f, "load.{} [{}+{}]", ty, addr, offset)
            }
            Value::Convert { from, to, value } => {
                write!(f, "convert.{}.{}({})", from, to, value)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    SetLocal(usize, Value),
    Store {
        addr: Value,
        offset: u32,
        ty: IrType,
        value: Value,
    },
    /// Evaluate for side effects; the result (if any) is dropped.
    Eval(Value),
    Return(Option<Value>),
    /// Trap. Only emitted into blocks control can never reach, e.g. the
    /// join after a branch whose arms both return.
    Halt,
    Goto(usize),
    CondBr {
        cond: Value,
        then_label: usize,
        else_label: usize,
    },
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::SetLocal(i, v) => write!(f, "${} = {}", i, v),
            Inst::Store {
                addr,
                offset,
                ty,
                value,
            } => write!(f, "store.{} [{}+{}] {}", ty, addr, offset, value),
            Inst::Eval(v) => write!(f, "eval {}", v),
            Inst::Return(Some(v)) => write!(f, "ret {}", v),
            Inst::Return(None) => write!(f, "ret"),
            Inst::Halt => write!(f, "halt"),
            Inst::Goto(l) => write!(f, "goto B{}", l),
            Inst::CondBr {
                cond,
                then_label,
                else_label,
            } => write!(f, "br {} ? B{} : B{}", cond, then_label, else_label),
        }
    }
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Return(_) | Inst::Halt | Inst::Goto(_) | Inst::CondBr { .. }
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub label: usize,
    pub insts: Vec<Inst>,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "B{}:\n{}",
            self.label,
            indent(map_join(&self.insts, "\n", |i| i.to_string()), 2)
        )
    }
}

impl Block {
    pub fn terminator(&self) -> Option<&Inst> {
        self.insts.last().filter(|i| i.is_terminator())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator().is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: IrType,
}

#[derive(Clone, Debug)]
pub struct Local {
    pub ty: IrType,
}

/// The structured shape of one source-level loop, recorded while its blocks
/// are built. `header` re-evaluates the condition, `cont` is where a
/// `continue` lands (the increment block of a `for`, otherwise the header),
/// and `exit` is the join after the loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopInfo {
    pub header: usize,
    pub cont: usize,
    pub exit: usize,
}

/// The structured shape of one two-way branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IfInfo {
    pub cond_block: usize,
    pub then_label: usize,
    pub else_label: usize,
    pub join: usize,
}

#[derive(Clone, Debug)]
pub struct Func {
    pub name: String,
    pub params: Vec<Param>,
    pub ret_ty: Option<IrType>,
    pub locals: Vec<Local>,
    pub blocks: Vec<Block>,
    /// Bytes of stack-frame storage the function needs, 16-byte aligned.
    pub frame_size: u32,
    pub loops: Vec<LoopInfo>,
    pub ifs: Vec<IfInfo>,
    pub exported: bool,
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ret = match &self.ret_ty {
            Some(t) => t.to_string(),
            None => str!("void"),
        };
        write!(
            f,
            "fn {}({}) -> {} {{\n{}\n}}",
            self.name,
            map_join(&self.params, ", ", |p| format!("{}: {}", p.name, p.ty)),
            ret,
            indent(map_join(&self.blocks, "\n", |b| b.to_string()), 2)
        )
    }
}

impl Func {
    /// The control-flow graph over block labels.
    pub fn cfg(&self) -> DiGraphMap<usize, ()> {
        let mut graph = DiGraphMap::new();
        for block in &self.blocks {
            graph.add_node(block.label);
        }
        for block in &self.blocks {
            match block.terminator() {
                Some(Inst::Goto(target)) => {
                    graph.add_edge(block.label, *target, ());
                }
                Some(Inst::CondBr {
                    then_label,
                    else_label,
                    ..
                }) => {
                    graph.add_edge(block.label, *then_label, ());
                    graph.add_edge(block.label, *else_label, ());
                }
                _ => {}
            }
        }
        graph
    }

    /// Labels reachable from the entry block. Blocks outside this set are
    /// dead stretches the source walk left behind (code after a `return`).
    pub fn reachable_blocks(&self) -> HashSet<usize> {
        let graph = self.cfg();
        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, 0);
        while let Some(label) = dfs.next(&graph) {
            reachable.insert(label);
        }
        reachable
    }
}

/// A function satisfied by the embedder at instantiation.
#[derive(Clone, Debug, PartialEq)]
pub struct Extern {
    pub name: String,
    pub params: Vec<IrType>,
    pub ret_ty: Option<IrType>,
}

#[derive(Clone, Debug, Default)]
pub struct Program {
    pub externs: Vec<Extern>,
    pub funcs: Vec<Func>,
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ext in &self.externs {
            let ret = match &ext.ret_ty {
                Some(t) => t.to_string(),
                None => str!("void"),
            };
            writeln!(f, "extern {}({}) -> {}", ext.name, join(&ext.params, ", "), ret)?;
        }
        write!(f, "{}", map_join(&self.funcs, "\n\n", |func| func.to_string()))
    }
}

impl Program {
    /// Registers an import, deduplicating by name. Panics if the same name
    /// is re-declared with a different signature.
    pub fn add_extern(&mut self, ext: Extern) {
        if let Some(existing) = self.externs.iter().find(|e| e.name == ext.name) {
            if *existing != ext {
                panic!(
                    "COMPILER BUG: extern `{}` re-declared with a different signature",
                    ext.name
                );
            }
            return;
        }
        self.externs.push(ext);
    }

    pub fn get_func(&self, name: &str) -> Option<&Func> {
        self.funcs.iter().find(|f| f.name == name)
    }
}
