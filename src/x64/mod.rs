//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - System V calling convention and stack frame layout
//! - Lowering of IR functions to machine code
//! - Emission of relocatable ELF objects

pub mod calling_convention;
pub mod compiler;
pub mod encoder;
pub mod function_codegen;

pub use calling_convention::{CCAssigner, CCAssignment, SysVAssigner};
pub use compiler::{CompiledObject, FunctionInfo, ObjectCompiler, Selection};
pub use encoder::{AsmReg, EncodingError, X64Encoder};
