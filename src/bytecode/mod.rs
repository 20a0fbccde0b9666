//! Bytecode representation, compiler, and virtual machine.
//!
//! The bytecode VM is this core's only execution model (no tree-walking
//! fallback): compiling to a flat instruction stream and running it on an
//! explicit value stack and frame stack is what lets non-local control flow
//! (`break`/`next`/`return`) unwind without relying on the host call stack
//! (§3, §5).
//!
//! # Module structure
//!
//! - `op` - instruction set
//! - `code` - compiled code/function objects
//! - `builder` - emits bytecode during compilation, tracks stack depth
//! - `compiler` - AST to bytecode lowering
//! - `vm` - the interpreter loop

pub use builder::{CodeBuilder, JumpLabel};
pub use code::{CodeObject, FunctionObject, DOTS_ARG_IDX, MISSING_ARG_IDX};
pub use compiler::{CompileError, Compiler};
pub use op::{Opcode, TypeTag};
pub use vm::Vm;

mod builder;
mod code;
mod compiler;
mod op;
mod vm;
