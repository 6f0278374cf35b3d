// Shared infrastructure of the JIT: error types, the interning context modules are built
// against, session configuration, host target description with its symbol mangling rules,
// and the statistics an execution session keeps. Everything here is independent of how
// code is generated or linked.

//! Core infrastructure shared by the IR, backend and JIT layers.

pub mod config;
pub mod context;
pub mod error;
pub mod stats;
pub mod target;

pub use config::{CompileMode, JitConfig, OptLevel, ShadowPolicy};
pub use context::{Symbol, ThreadSafeContext};
pub use error::{CompileError, CompileResult, JitError, JitResult, LinkError};
pub use stats::SessionStats;
pub use target::{DataLayout, TargetDescription};
