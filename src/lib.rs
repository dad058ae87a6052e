#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod macros;

pub mod ast;
pub mod codegen;
pub mod errors;
pub mod lir;
pub mod loader;
pub mod reflect;
pub mod typing;
pub mod utils;
