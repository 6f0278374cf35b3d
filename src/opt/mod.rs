// The IR optimization pipeline run on every module before code generation. Passes run in a
// fixed order over each function: instruction combining, reassociation, global value
// numbering and CFG simplification. Each pass preserves program behaviour and reports how
// many changes it made; the counts are gathered in OptimizationStats and logged at debug
// level. OptLevel::None skips the pipeline and leaves the IR exactly as submitted.

//! IR optimization passes.

pub mod cfg;
pub mod gvn;
pub mod instcombine;
pub mod reassociate;
pub mod simplify_cfg;

use crate::core::config::OptLevel;
use crate::ir::{Function, Module};
use std::fmt;
use std::ops::AddAssign;

/// A function-level transformation in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    InstCombine,
    Reassociate,
    Gvn,
    SimplifyCfg,
}

impl Pass {
    /// Pipeline order.
    pub const PIPELINE: [Pass; 4] = [
        Pass::InstCombine,
        Pass::Reassociate,
        Pass::Gvn,
        Pass::SimplifyCfg,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Pass::InstCombine => "instcombine",
            Pass::Reassociate => "reassociate",
            Pass::Gvn => "gvn",
            Pass::SimplifyCfg => "simplifycfg",
        }
    }

    /// Run on one function, returning the number of changes.
    pub fn run(self, func: &mut Function) -> usize {
        match self {
            Pass::InstCombine => instcombine::run(func),
            Pass::Reassociate => reassociate::run(func),
            Pass::Gvn => gvn::run(func),
            Pass::SimplifyCfg => simplify_cfg::run(func),
        }
    }
}

/// Changes made by one pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptimizationStats {
    pub functions: usize,
    pub instcombine: usize,
    pub reassociate: usize,
    pub gvn: usize,
    pub simplify_cfg: usize,
    /// Instructions (terminators included) before and after.
    pub instructions_before: usize,
    pub instructions_after: usize,
}

impl OptimizationStats {
    fn record(&mut self, pass: Pass, changes: usize) {
        match pass {
            Pass::InstCombine => self.instcombine += changes,
            Pass::Reassociate => self.reassociate += changes,
            Pass::Gvn => self.gvn += changes,
            Pass::SimplifyCfg => self.simplify_cfg += changes,
        }
    }

    pub fn total_changes(&self) -> usize {
        self.instcombine + self.reassociate + self.gvn + self.simplify_cfg
    }
}

impl AddAssign for OptimizationStats {
    fn add_assign(&mut self, other: Self) {
        self.functions += other.functions;
        self.instcombine += other.instcombine;
        self.reassociate += other.reassociate;
        self.gvn += other.gvn;
        self.simplify_cfg += other.simplify_cfg;
        self.instructions_before += other.instructions_before;
        self.instructions_after += other.instructions_after;
    }
}

impl fmt::Display for OptimizationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} functions, {} -> {} instructions (instcombine {}, reassociate {}, gvn {}, simplifycfg {})",
            self.functions,
            self.instructions_before,
            self.instructions_after,
            self.instcombine,
            self.reassociate,
            self.gvn,
            self.simplify_cfg
        )
    }
}

/// Run the pipeline over one function.
pub fn optimize_function(func: &mut Function, level: OptLevel) -> OptimizationStats {
    let mut stats = OptimizationStats::default();
    if level == OptLevel::None {
        return stats;
    }
    stats.functions = 1;
    stats.instructions_before = func.instruction_count();
    for pass in Pass::PIPELINE {
        let changes = pass.run(func);
        if changes > 0 {
            log::trace!("{}: {} made {changes} changes", func.name, pass.name());
        }
        stats.record(pass, changes);
    }
    stats.instructions_after = func.instruction_count();
    stats
}

/// Run the pipeline over every function of `module`.
pub fn optimize_module(module: &mut Module, level: OptLevel) -> OptimizationStats {
    let mut stats = OptimizationStats::default();
    if level == OptLevel::None {
        log::debug!("optimization disabled for module {}", module.name);
        return stats;
    }
    for func in &mut module.functions {
        stats += optimize_function(func, level);
    }
    log::debug!("optimized module {}: {stats}", module.name);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;
    use crate::ir::parser::parse_module;

    const SRC: &str = r#"
define @f(%x, %y) {
entry:
    %a = iconst 2
    %b = iconst 3
    %c = add %a, %b
    %d = add %x, %c
    %e = iconst 1
    %f = add %d, %e
    %g = add %y, %x
    %h = add %x, %y
    %i = sub %g, %h
    %t = icmp eq %a, %a
    br %t, done(%f), other(%i)
done(%r):
    %s = add %r, %i
    ret %s
other(%q):
    ret %q
}
"#;

    #[test]
    fn test_pipeline_simplifies() {
        let ctx = ThreadSafeContext::new();
        let mut module = parse_module(SRC, "m", &ctx).unwrap();
        let stats = optimize_module(&mut module, OptLevel::Default);
        module.verify().unwrap();
        assert!(stats.total_changes() > 0);
        assert!(stats.instructions_after < stats.instructions_before);
        assert_eq!(module.functions[0].blocks.len(), 1);
        assert_eq!(
            module.functions[0].to_string(),
            "define @f(%0, %1) {\nentry:\n    %2 = iconst 6\n    %3 = add %0, %2\n    %4 = add %1, %0\n    %5 = sub %4, %4\n    %6 = add %3, %5\n    ret %6\n}\n"
        );
    }

    #[test]
    fn test_opt_level_none_leaves_ir_untouched() {
        let ctx = ThreadSafeContext::new();
        let mut module = parse_module(SRC, "m", &ctx).unwrap();
        let before = module.to_string();
        let stats = optimize_module(&mut module, OptLevel::None);
        assert_eq!(stats, OptimizationStats::default());
        assert_eq!(module.to_string(), before);
    }
}
