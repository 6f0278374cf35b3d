// This module defines JitConfig, the knobs an embedder can set when creating an execution
// session: whether the optimization pipeline runs, whether functions are compiled when a
// module is added or on first call, what happens when two live modules export the same
// name, and whether the host process symbol table is searched. Settings can be given with
// builder methods or read from TPDE_JIT_* environment variables; command line flags of the
// driver override both.

//! Session configuration.

use std::env;

/// Optimization level applied before code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// Skip the pipeline; IR is compiled as submitted.
    None,
    /// instcombine, reassociate, GVN, CFG simplification.
    #[default]
    Default,
}

/// When function bodies are compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    /// Compile and link every function in `add_module`.
    #[default]
    Eager,
    /// Install call-through stubs; compile each body on its first call.
    Lazy,
}

/// Handling of an exported name that a live module already exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadowPolicy {
    /// Fail the add with `DuplicateSymbol`.
    #[default]
    Reject,
    /// Accept; lookups see the most recently added definition.
    AllowLifo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    pub opt_level: OptLevel,
    pub compile_mode: CompileMode,
    pub shadow_policy: ShadowPolicy,
    /// Fall back to the process symbol table when nothing else defines a name.
    pub search_process_symbols: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Default,
            compile_mode: CompileMode::Eager,
            shadow_policy: ShadowPolicy::Reject,
            search_process_symbols: true,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl JitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `TPDE_JIT_OPT` (`0`/`none` or `1`/`default`),
    /// `TPDE_JIT_LAZY` (boolean) and `TPDE_JIT_SHADOWING` (`reject` or `lifo`).
    /// Unrecognised values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("TPDE_JIT_OPT") {
            match value.trim().to_ascii_lowercase().as_str() {
                "0" | "none" => config.opt_level = OptLevel::None,
                "1" | "2" | "default" => config.opt_level = OptLevel::Default,
                other => log::warn!("ignoring TPDE_JIT_OPT={other}"),
            }
        }
        if let Some(value) = lookup("TPDE_JIT_LAZY") {
            match parse_flag(&value) {
                Some(true) => config.compile_mode = CompileMode::Lazy,
                Some(false) => config.compile_mode = CompileMode::Eager,
                None => log::warn!("ignoring TPDE_JIT_LAZY={value}"),
            }
        }
        if let Some(value) = lookup("TPDE_JIT_SHADOWING") {
            match value.trim().to_ascii_lowercase().as_str() {
                "reject" => config.shadow_policy = ShadowPolicy::Reject,
                "lifo" | "allow" => config.shadow_policy = ShadowPolicy::AllowLifo,
                other => log::warn!("ignoring TPDE_JIT_SHADOWING={other}"),
            }
        }
        config
    }

    pub fn with_opt_level(mut self, level: OptLevel) -> Self {
        self.opt_level = level;
        self
    }

    pub fn with_compile_mode(mut self, mode: CompileMode) -> Self {
        self.compile_mode = mode;
        self
    }

    pub fn with_shadow_policy(mut self, policy: ShadowPolicy) -> Self {
        self.shadow_policy = policy;
        self
    }

    pub fn with_process_symbols(mut self, enabled: bool) -> Self {
        self.search_process_symbols = enabled;
        self
    }

    pub fn is_lazy(&self) -> bool {
        self.compile_mode == CompileMode::Lazy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert_eq!(config.opt_level, OptLevel::Default);
        assert_eq!(config.compile_mode, CompileMode::Eager);
        assert_eq!(config.shadow_policy, ShadowPolicy::Reject);
        assert!(config.search_process_symbols);
    }

    #[test]
    fn test_environment_overrides() {
        let config = JitConfig::from_lookup(lookup_from(&[
            ("TPDE_JIT_OPT", "none"),
            ("TPDE_JIT_LAZY", "1"),
            ("TPDE_JIT_SHADOWING", "lifo"),
        ]));
        assert_eq!(config.opt_level, OptLevel::None);
        assert!(config.is_lazy());
        assert_eq!(config.shadow_policy, ShadowPolicy::AllowLifo);
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        let config = JitConfig::from_lookup(lookup_from(&[
            ("TPDE_JIT_OPT", "fast"),
            ("TPDE_JIT_LAZY", "maybe"),
        ]));
        assert_eq!(config, JitConfig::default());
    }

    #[test]
    fn test_builder_methods() {
        let config = JitConfig::new()
            .with_opt_level(OptLevel::None)
            .with_compile_mode(CompileMode::Lazy)
            .with_process_symbols(false);
        assert_eq!(config.opt_level, OptLevel::None);
        assert!(config.is_lazy());
        assert!(!config.search_process_symbols);
    }
}
