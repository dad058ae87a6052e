mod builder;
mod types;

pub use builder::Builder;
pub use types::*;
