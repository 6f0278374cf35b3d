// This module defines how names become addresses while linking. SymbolResolver is the seam
// the linker calls for every symbol an object references but does not define. ModuleResolver
// is the symbol table of one linked module, internal definitions included; the session keeps
// it for the module's lifetime so bodies compiled lazily can still reach their module's
// private functions and data. HostResolver is the last tier: addresses the embedder
// registered explicitly, then the dynamic symbol table of the running process through
// libloading. ChainedResolver asks a list of resolvers in order and returns the first hit.
// All names seen here are mangled for the target.

//! Symbol resolution tiers.

use crate::core::target::DataLayout;
use hashbrown::HashMap;
use libloading::os::unix::Library;
use parking_lot::RwLock;
use std::ffi::c_void;

/// Properties of a resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolFlags {
    /// Visible outside the defining module.
    pub exported: bool,
    /// Points at code rather than data.
    pub callable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub address: u64,
    pub flags: SymbolFlags,
}

impl ResolvedSymbol {
    pub fn new(address: u64, flags: SymbolFlags) -> Self {
        Self { address, flags }
    }
}

/// Maps a mangled name to an address.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<ResolvedSymbol>;
}

impl<F> SymbolResolver for F
where
    F: Fn(&str) -> Option<ResolvedSymbol>,
{
    fn resolve(&self, name: &str) -> Option<ResolvedSymbol> {
        self(name)
    }
}

/// Symbol table of a single linked module.
#[derive(Debug, Clone, Default)]
pub struct ModuleResolver {
    symbols: HashMap<String, ResolvedSymbol>,
}

impl ModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: impl Into<String>, symbol: ResolvedSymbol) {
        self.symbols.insert(name.into(), symbol);
    }

    /// Exported definition of `name`, if any.
    pub fn exported(&self, name: &str) -> Option<ResolvedSymbol> {
        self.symbols.get(name).copied().filter(|s| s.flags.exported)
    }

    pub fn exported_names(&self) -> impl Iterator<Item = &str> {
        self.symbols
            .iter()
            .filter(|(_, s)| s.flags.exported)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for ModuleResolver {
    /// Internal definitions are visible here; this is the module's own view.
    fn resolve(&self, name: &str) -> Option<ResolvedSymbol> {
        self.symbols.get(name).copied()
    }
}

/// Host process tier: explicit absolute symbols, then the process symbol table.
pub struct HostResolver {
    layout: DataLayout,
    absolute: RwLock<HashMap<String, u64>>,
    process: Option<Library>,
}

impl HostResolver {
    pub fn new(layout: DataLayout, search_process: bool) -> Self {
        Self {
            layout,
            absolute: RwLock::new(HashMap::new()),
            process: search_process.then(Library::this),
        }
    }

    /// Register `name` (unmangled) at `address`; replaces an earlier definition.
    pub fn define_absolute(&self, name: &str, address: u64) {
        self.absolute.write().insert(self.layout.mangle(name), address);
    }

    pub fn absolute_count(&self) -> usize {
        self.absolute.read().len()
    }

    fn process_symbol(&self, name: &str) -> Option<u64> {
        let process = self.process.as_ref()?;
        // dlsym expects the C-level name without the platform prefix.
        let plain = self.layout.demangle(name);
        // SAFETY: the symbol is only read as an address, never called here.
        let symbol = unsafe { process.get::<*const c_void>(plain.as_bytes()) }.ok()?;
        let address = *symbol as u64;
        (address != 0).then_some(address)
    }
}

impl SymbolResolver for HostResolver {
    fn resolve(&self, name: &str) -> Option<ResolvedSymbol> {
        let flags = SymbolFlags {
            exported: true,
            callable: true,
        };
        if let Some(&address) = self.absolute.read().get(name) {
            return Some(ResolvedSymbol::new(address, flags));
        }
        let address = self.process_symbol(name)?;
        log::trace!("resolved {name} from the host process at {address:#x}");
        Some(ResolvedSymbol::new(address, flags))
    }
}

impl std::fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver")
            .field("absolute", &self.absolute_count())
            .field("process", &self.process.is_some())
            .finish()
    }
}

/// Tries resolvers in order.
#[derive(Default)]
pub struct ChainedResolver<'a> {
    tiers: Vec<&'a dyn SymbolResolver>,
}

impl<'a> ChainedResolver<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tier: &'a dyn SymbolResolver) -> Self {
        self.tiers.push(tier);
        self
    }
}

impl SymbolResolver for ChainedResolver<'_> {
    fn resolve(&self, name: &str) -> Option<ResolvedSymbol> {
        self.tiers.iter().find_map(|tier| tier.resolve(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::target::TargetDescription;

    fn layout() -> DataLayout {
        TargetDescription::from_triple("x86_64-unknown-linux-gnu")
            .unwrap()
            .data_layout()
    }

    #[test]
    fn test_module_resolver_visibility() {
        let mut table = ModuleResolver::new();
        let exported = SymbolFlags {
            exported: true,
            callable: true,
        };
        table.define("public", ResolvedSymbol::new(0x1000, exported));
        table.define("private", ResolvedSymbol::new(0x2000, SymbolFlags::default()));
        assert_eq!(table.exported("public").unwrap().address, 0x1000);
        assert!(table.exported("private").is_none());
        assert_eq!(table.resolve("private").unwrap().address, 0x2000);
        assert_eq!(table.exported_names().collect::<Vec<_>>(), vec!["public"]);
    }

    #[test]
    fn test_host_absolute_symbols_take_priority() {
        let host = HostResolver::new(layout(), false);
        assert!(host.resolve("my_runtime_hook").is_none());
        host.define_absolute("my_runtime_hook", 0xdead_0000);
        assert_eq!(host.resolve("my_runtime_hook").unwrap().address, 0xdead_0000);
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_host_process_symbols() {
        let host = HostResolver::new(layout(), true);
        let strlen = host.resolve("strlen").unwrap();
        assert_ne!(strlen.address, 0);
        assert!(host.resolve("definitely_not_a_symbol_in_this_process").is_none());

        let disabled = HostResolver::new(layout(), false);
        assert!(disabled.resolve("strlen").is_none());
    }

    #[test]
    fn test_chained_resolver_order() {
        let first = |name: &str| (name == "a").then(|| ResolvedSymbol::new(1, SymbolFlags::default()));
        let second = |name: &str| {
            (name == "a" || name == "b").then(|| ResolvedSymbol::new(2, SymbolFlags::default()))
        };
        let chain = ChainedResolver::new().with(&first).with(&second);
        assert_eq!(chain.resolve("a").unwrap().address, 1);
        assert_eq!(chain.resolve("b").unwrap().address, 2);
        assert!(chain.resolve("c").is_none());
    }
}
