// This module defines SessionStats, the counters an execution session keeps about the work it
// has done: modules added and removed, functions compiled eagerly or on first call, generated
// code and data size, IR instructions lowered, the largest function seen, symbol lookups and
// the accumulated optimizer results. The session updates the counters under a lock and hands
// out snapshots; the Display implementation is what the command line driver prints for
// --stats.

//! Execution session statistics.

use crate::opt::OptimizationStats;
use crate::x64::compiler::FunctionInfo;
use std::fmt;

/// Execution session statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Modules successfully added.
    pub modules_added: usize,

    /// Modules removed again.
    pub modules_removed: usize,

    /// `add_module` calls that failed.
    pub failed_adds: usize,

    /// Function bodies compiled, eagerly or lazily.
    pub functions_compiled: usize,

    /// Bodies compiled on first call or by `materialize`.
    pub lazy_compilations: usize,

    /// Call-through stubs installed.
    pub stubs_installed: usize,

    /// Machine code generated (bytes).
    pub total_code_size: usize,

    /// Global data linked (bytes).
    pub total_data_size: usize,

    /// IR instructions lowered to machine code.
    pub instructions_compiled: usize,

    /// Largest function compiled (bytes).
    pub largest_function_size: usize,

    /// Name of largest function.
    pub largest_function_name: String,

    /// Successful lookups.
    pub lookups: usize,

    /// Lookups that found nothing.
    pub lookup_misses: usize,

    /// Accumulated optimizer results.
    pub optimization: OptimizationStats,
}

impl SessionStats {
    /// Account for one compiled function body.
    pub fn record_function(&mut self, info: &FunctionInfo) {
        self.functions_compiled += 1;
        self.total_code_size += info.code_size;
        self.instructions_compiled += info.ir_instructions;
        if info.code_size > self.largest_function_size {
            self.largest_function_size = info.code_size;
            self.largest_function_name = info.name.to_string();
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Execution Session Statistics:")?;
        writeln!(f, "  Modules added: {}", self.modules_added)?;
        writeln!(f, "  Modules removed: {}", self.modules_removed)?;
        writeln!(f, "  Failed adds: {}", self.failed_adds)?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Lazy compilations: {}", self.lazy_compilations)?;
        writeln!(f, "  Stubs installed: {}", self.stubs_installed)?;
        writeln!(f, "  Instructions compiled: {}", self.instructions_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Total data size: {} bytes", self.total_data_size)?;
        writeln!(f, "  Lookups: {} ({} misses)", self.lookups, self.lookup_misses)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        if self.optimization.functions > 0 {
            writeln!(f, "  Optimizer: {}", self.optimization)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;

    #[test]
    fn test_record_function_tracks_largest() {
        let ctx = ThreadSafeContext::new();
        let mut stats = SessionStats::default();
        stats.record_function(&FunctionInfo {
            name: ctx.intern("small"),
            code_size: 10,
            ir_instructions: 2,
        });
        stats.record_function(&FunctionInfo {
            name: ctx.intern("big"),
            code_size: 100,
            ir_instructions: 20,
        });
        assert_eq!(stats.functions_compiled, 2);
        assert_eq!(stats.total_code_size, 110);
        assert_eq!(stats.instructions_compiled, 22);
        assert_eq!(stats.largest_function_name, "big");

        let text = stats.to_string();
        assert!(text.contains("Functions compiled: 2"));
        assert!(text.contains("Largest function: big (100 bytes)"));
    }
}
