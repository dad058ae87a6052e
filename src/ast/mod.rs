//! The annotated source tree handed to the code generator.
//!
//! Every expression node carries the type the checker resolved for it, so
//! code generation never re-infers types; it only maps them. A function
//! enters the compiled world when its body opens with the `"use hasty"`
//! directive prologue.

use std::fmt;

use crate::typing::Ty;

/// The directive prologue that marks a function for compilation.
pub const DIRECTIVE: &str = "use hasty";

#[derive(Clone, Debug, Default)]
pub struct Program {
    pub functions: Vec<FunctionDecl>,
}

impl Program {
    pub fn new(functions: Vec<FunctionDecl>) -> Program {
        Program { functions }
    }

    /// The functions whose bodies open with the directive prologue. Only
    /// these are compiled; everything else stays on the host side and is
    /// reached through the boundary.
    pub fn compiled_functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.functions.iter().filter(|f| f.is_compiled())
    }
}

#[derive(Clone, Debug)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    pub ret_ty: Ty,
    pub body: Vec<Stmt>,
    pub exported: bool,
}

impl FunctionDecl {
    pub fn is_compiled(&self) -> bool {
        match self.body.first() {
            Some(Stmt::Expr(e)) => match &e.kind {
                ExprKind::Str(s) => s == DIRECTIVE,
                _ => false,
            },
            _ => false,
        }
    }

    /// The body with the directive prologue stripped.
    pub fn body_stmts(&self) -> &[Stmt] {
        if self.is_compiled() {
            &self.body[1..]
        } else {
            &self.body
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub name: String,
    pub ty: Ty,
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Expr(Expr),
    /// `let`/`const` with an optional initializer.
    VarDecl {
        name: String,
        ty: Ty,
        init: Option<Expr>,
    },
    Return(Option<Expr>),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        els: Vec<Stmt>,
    },
    While {
        label: Option<String>,
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        label: Option<String>,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        incr: Option<Expr>,
        body: Vec<Stmt>,
    },
    Break(Option<String>),
    Continue(Option<String>),
    Block(Vec<Stmt>),
    /// A label on a non-loop statement. Accepted by the front-end grammar
    /// but rejected at code generation.
    Labeled(String, Box<Stmt>),
}

impl Stmt {
    /// Human-readable node name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Stmt::Expr(_) => "expression statement",
            Stmt::VarDecl { .. } => "variable declaration",
            Stmt::Return(_) => "return statement",
            Stmt::If { .. } => "if statement",
            Stmt::While { .. } => "while statement",
            Stmt::For { .. } => "for statement",
            Stmt::Break(_) => "break statement",
            Stmt::Continue(_) => "continue statement",
            Stmt::Block(_) => "block",
            Stmt::Labeled(..) => "labeled statement",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Ty) -> Expr {
        Expr { kind, ty }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Int(i32),
    Num(f64),
    Bool(bool),
    Str(String),
    Ident(String),
    Array(Vec<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign {
        op: Option<BinOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `x++` / `x--`; evaluates to the operand's original value.
    Postfix {
        incr: bool,
        operand: Box<Expr>,
    },
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    New {
        class: String,
        args: Vec<Expr>,
    },
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Paren(Box<Expr>),
}

impl ExprKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Int(_) | ExprKind::Num(_) => "numeric literal",
            ExprKind::Bool(_) => "boolean literal",
            ExprKind::Str(_) => "string literal",
            ExprKind::Ident(_) => "identifier",
            ExprKind::Array(_) => "array literal",
            ExprKind::Binary { .. } => "binary expression",
            ExprKind::Assign { .. } => "assignment",
            ExprKind::Unary { .. } => "unary expression",
            ExprKind::Postfix { .. } => "postfix expression",
            ExprKind::Cond { .. } => "conditional expression",
            ExprKind::Call { .. } => "call expression",
            ExprKind::New { .. } => "new expression",
            ExprKind::Member { .. } => "property access",
            ExprKind::Index { .. } => "element access",
            ExprKind::Paren(_) => "parenthesized expression",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Gt,
    LtEq,
    GtEq,
    EqEq,
    NotEq,
    BitAnd,
    BitOr,
    BitXor,
    LogicAnd,
    LogicOr,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tok = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::LtEq => "<=",
            BinOp::GtEq => ">=",
            BinOp::EqEq => "===",
            BinOp::NotEq => "!==",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::LogicAnd => "&&",
            BinOp::LogicOr => "||",
        };
        write!(f, "{}", tok)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    /// Prefix `++` / `--`; evaluates to the updated value.
    PreIncr,
    PreDecr,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tok = match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::PreIncr => "++",
            UnaryOp::PreDecr => "--",
        };
        write!(f, "{}", tok)
    }
}

#[cfg(test)]
mod ast_test {
    use super::*;

    fn directive_stmt() -> Stmt {
        Stmt::Expr(Expr::new(ExprKind::Str(str!(DIRECTIVE)), Ty::Str))
    }

    #[test]
    fn test_directive_detection() {
        let f = FunctionDecl {
            name: str!("f"),
            params: vec![],
            ret_ty: Ty::Void,
            body: vec![directive_stmt(), Stmt::Return(None)],
            exported: true,
        };
        assert!(f.is_compiled());
        assert_eq!(f.body_stmts().len(), 1);
    }

    #[test]
    fn test_plain_function_not_compiled() {
        let f = FunctionDecl {
            name: str!("g"),
            params: vec![],
            ret_ty: Ty::Void,
            body: vec![Stmt::Return(None)],
            exported: false,
        };
        assert!(!f.is_compiled());
        assert_eq!(f.body_stmts().len(), 1);
    }
}
