//! TPDE JIT - In-process execution of a small SSA IR.
//!
//! Modules are verified, run through a short optimization pipeline, lowered to
//! relocatable x86-64 ELF objects and linked straight into executable memory.
//! An [`ExecutionSession`] publishes the exported symbols of every live module
//! so callers and other modules can find them by name.
//!
//! # Primary Usage
//!
//! ```no_run
//! use tpde_jit::{ExecutionSession, JitConfig};
//! use tpde_jit::ir::parser::parse_module;
//!
//! # fn main() -> Result<(), tpde_jit::JitError> {
//! let session = ExecutionSession::create(JitConfig::default())?;
//! let module = parse_module(
//!     "define @add(%a, %b) {\nentry:\n  %s = add %a, %b\n  ret %s\n}\n",
//!     "demo",
//!     session.context(),
//! )?;
//! session.add_module(module)?;
//!
//! let address = session.lookup("add")?;
//! let add: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(address as usize) };
//! assert_eq!(add(2, 3), 5);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Module, function and block definitions, builder and text parser
//! - [`opt`] - instcombine, reassociate, GVN and CFG simplification
//! - [`x64`] - x86-64 encoder, calling convention and object emission
//! - [`jit`] - Linker, symbol resolution, lazy stubs and the execution session
//! - [`core`] - Errors, configuration, target description and statistics

pub mod core;
pub mod ir;
pub mod jit;
pub mod opt;
pub mod x64;

pub use crate::core::{
    CompileError, CompileMode, DataLayout, JitConfig, JitError, JitResult, LinkError, OptLevel,
    SessionStats, ShadowPolicy, Symbol, TargetDescription, ThreadSafeContext,
};
pub use crate::ir::{FunctionBuilder, Linkage, Module};
pub use crate::jit::{ExecutionSession, ModuleKey, StubState};
pub use crate::opt::OptimizationStats;
