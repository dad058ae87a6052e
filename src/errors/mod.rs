use colored::*;
use std::fmt;

pub type HastyResult<T = ()> = Result<T, HastyError>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HastyErrorKind {
    /// A syntax node kind, operator, or operator/type combination that has
    /// no lowering in the compiled subset.
    UnsupportedSyntax,
    /// A type that cannot cross the boundary or be mapped to an IR type.
    Type,
    /// Linear memory exhaustion or an allocation past the address ceiling.
    Memory,
    /// A runtime feature the compiled module asked for but the host does
    /// not provide (exception machinery, unknown trampoline shapes).
    Runtime,
    Unknown,
}

impl fmt::Display for HastyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                HastyErrorKind::UnsupportedSyntax => "unsupported syntax",
                HastyErrorKind::Type => "type error",
                HastyErrorKind::Memory => "memory error",
                HastyErrorKind::Runtime => "runtime error",
                HastyErrorKind::Unknown => "unknown error",
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HastyError {
    pub msg: String,
    /// Enclosing constructs, innermost first (e.g. function name, node kind).
    pub context: Vec<String>,
    pub kind: HastyErrorKind,
}

impl fmt::Display for HastyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)?;
        for ctx in self.context.iter() {
            write!(f, "\n  in {}", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for HastyError {}

impl HastyError {
    pub fn new<S: Into<String>>(kind: HastyErrorKind, msg: S) -> HastyError {
        HastyError {
            msg: msg.into(),
            context: vec![],
            kind,
        }
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> HastyError {
        HastyError::new(HastyErrorKind::UnsupportedSyntax, msg)
    }

    pub fn ty<S: Into<String>>(msg: S) -> HastyError {
        HastyError::new(HastyErrorKind::Type, msg)
    }

    pub fn memory<S: Into<String>>(msg: S) -> HastyError {
        HastyError::new(HastyErrorKind::Memory, msg)
    }

    pub fn runtime<S: Into<String>>(msg: S) -> HastyError {
        HastyError::new(HastyErrorKind::Runtime, msg)
    }

    pub fn in_context<S: Into<String>>(mut self, ctx: S) -> HastyError {
        self.context.push(ctx.into());
        self
    }

    pub fn emit(self) {
        let kind = format!("{}:", self.kind);
        eprintln!("{} {}", kind.bold().red(), self.msg.bold());
        for ctx in self.context {
            eprintln!("  {} {}", "in".bold(), ctx);
        }
    }
}
