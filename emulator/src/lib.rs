pub mod assembler;
pub mod constants;
pub mod dap;
pub mod parser;
pub mod runtime;

pub use self::assembler::{assemble, Assembly, DebugInfo};
