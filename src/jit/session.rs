// This module implements ExecutionSession, the process-wide entry point of the JIT. A session
// owns the module registry, the host symbol tier, the shared interning context, statistics
// and the locks that coordinate them. add_module verifies a module, rejects exported names a
// live module already provides (unless shadowing is allowed), runs the optimization
// pipeline, compiles and links the module (or installs lazy stubs) and only then publishes
// it. Mutations are serialized by one mutex; the registry sits behind a reader/writer lock so
// lookups and lazy compiles keep running while a module is being compiled under a read
// guard, and the finished module becomes visible under a short write guard. Lookups search
// the registry most recent module first, then the host process. Removing a module unmaps
// its code and data.

//! Execution session and module registry.

use crate::core::config::{CompileMode, JitConfig, ShadowPolicy};
use crate::core::context::ThreadSafeContext;
use crate::core::error::{JitError, JitResult};
use crate::core::stats::SessionStats;
use crate::core::target::{DataLayout, TargetDescription};
use crate::ir::Module;
use crate::jit::lazy::{self, LazyArtifact, StubState};
use crate::jit::linker::{self, LinkedObject};
use crate::jit::resolver::{
    ChainedResolver, HostResolver, ModuleResolver, ResolvedSymbol, SymbolResolver,
};
use crate::opt::optimize_module;
use crate::x64::compiler::{ObjectCompiler, Selection};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle of a module added to a session. Keys are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey(u64);

impl ModuleKey {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Everything a live module owns.
pub(crate) struct ModuleEntry {
    name: String,
    /// The module's own view of its symbols, internal ones included.
    symbols: ModuleResolver,
    _objects: Vec<LinkedObject>,
    lazy: Option<LazyArtifact>,
}

#[derive(Default)]
pub(crate) struct Registry {
    modules: HashMap<ModuleKey, ModuleEntry>,
    /// Exported name to its definitions, most recent last.
    exports: HashMap<String, Vec<(ModuleKey, ResolvedSymbol)>>,
}

impl Registry {
    fn lookup(&self, name: &str) -> Option<(ModuleKey, ResolvedSymbol)> {
        self.exports.get(name)?.last().copied()
    }

    fn is_exported(&self, name: &str) -> bool {
        self.exports.get(name).is_some_and(|defs| !defs.is_empty())
    }

    fn insert(&mut self, key: ModuleKey, entry: ModuleEntry) {
        for name in entry.symbols.exported_names() {
            if let Some(symbol) = entry.symbols.exported(name) {
                self.exports
                    .entry(name.to_string())
                    .or_default()
                    .push((key, symbol));
            }
        }
        self.modules.insert(key, entry);
    }

    fn remove(&mut self, key: ModuleKey) -> Option<ModuleEntry> {
        let entry = self.modules.remove(&key)?;
        for name in entry.symbols.exported_names() {
            if let Some(defs) = self.exports.get_mut(name) {
                defs.retain(|(owner, _)| *owner != key);
                if defs.is_empty() {
                    self.exports.remove(name);
                }
            }
        }
        Some(entry)
    }
}

/// Exports of live modules, optionally hiding one module.
struct RegistryView<'a> {
    registry: &'a Registry,
    exclude: ModuleKey,
}

impl SymbolResolver for RegistryView<'_> {
    fn resolve(&self, name: &str) -> Option<ResolvedSymbol> {
        self.registry
            .exports
            .get(name)?
            .iter()
            .rev()
            .find(|(owner, _)| *owner != self.exclude)
            .map(|(_, symbol)| *symbol)
    }
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct Shared {
    pub(crate) config: JitConfig,
    target: TargetDescription,
    pub(crate) layout: DataLayout,
    context: ThreadSafeContext,
    pub(crate) compiler: ObjectCompiler,
    host: HostResolver,
    next_key: AtomicU64,
    mutation: Mutex<()>,
    registry: RwLock<Registry>,
    pub(crate) stats: Mutex<SessionStats>,
}

impl Shared {
    /// Link an object of module `key`: its own symbols first (if given), then other
    /// modules' exports, then the host.
    pub(crate) fn link_for_module(
        &self,
        key: ModuleKey,
        local: Option<&ModuleResolver>,
        bytes: &[u8],
    ) -> JitResult<LinkedObject> {
        let registry = self.registry.read();
        let view = RegistryView {
            registry: &registry,
            exclude: key,
        };
        let mut chain = ChainedResolver::new();
        if let Some(local) = local {
            chain = chain.with(local);
        }
        let chain = chain.with(&view).with(&self.host);
        Ok(linker::link(bytes, &chain)?)
    }

    /// Fail with `UndefinedSymbol` unless every external reference of `module` is
    /// provided by another live module or the host.
    pub(crate) fn check_external_references(
        &self,
        key: ModuleKey,
        module: &Module,
    ) -> JitResult<()> {
        let registry = self.registry.read();
        let view = RegistryView {
            registry: &registry,
            exclude: key,
        };
        for name in module.external_references() {
            let mangled = self.layout.mangle(&name);
            if view.resolve(&mangled).is_none() && self.host.resolve(&mangled).is_none() {
                return Err(JitError::UndefinedSymbol {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Execution session
// ============================================================================

/// Process-wide JIT context. `Send + Sync`; share it by reference or in an `Arc`.
pub struct ExecutionSession {
    shared: Arc<Shared>,
}

impl ExecutionSession {
    /// Session for the host machine.
    pub fn create(config: JitConfig) -> JitResult<Self> {
        let target = TargetDescription::detect_host()?;
        Self::create_for(target, config)
    }

    /// Session for `target`, which must be able to run in this process.
    pub fn create_for(target: TargetDescription, config: JitConfig) -> JitResult<Self> {
        if !target.is_host_compatible() {
            return Err(JitError::TargetDetection {
                reason: format!("code for {target} cannot run in this process"),
            });
        }
        let layout = target.data_layout();
        log::debug!("creating execution session for {target} ({layout}), {config:?}");
        Ok(Self {
            shared: Arc::new(Shared {
                target,
                layout,
                context: ThreadSafeContext::new(),
                compiler: ObjectCompiler::new(&target),
                host: HostResolver::new(layout, config.search_process_symbols),
                config,
                next_key: AtomicU64::new(1),
                mutation: Mutex::new(()),
                registry: RwLock::new(Registry::default()),
                stats: Mutex::new(SessionStats::default()),
            }),
        })
    }

    /// Compile, link and register `module`.
    ///
    /// On failure nothing of the module stays registered and its key is retired.
    pub fn add_module(&self, module: Module) -> JitResult<ModuleKey> {
        let shared = &self.shared;
        let key = ModuleKey(shared.next_key.fetch_add(1, Ordering::Relaxed));
        let _mutation = shared.mutation.lock();
        let name = module.name.clone();

        match self.build_entry(key, module) {
            Ok(entry) => {
                let exports = entry.symbols.exported_names().count();
                shared.registry.write().insert(key, entry);
                shared.stats.lock().modules_added += 1;
                log::debug!("added module {name} as {key} with {exports} exported symbols");
                Ok(key)
            }
            Err(err) => {
                shared.stats.lock().failed_adds += 1;
                log::debug!("adding module {name} failed: {err}");
                Err(err)
            }
        }
    }

    fn build_entry(&self, key: ModuleKey, mut module: Module) -> JitResult<ModuleEntry> {
        let shared = &self.shared;
        module.verify()?;
        if !module.context().same_context(&shared.context) {
            log::warn!("module {} was built against a different context", module.name);
        }
        self.check_duplicates(&module)?;

        let opt = optimize_module(&mut module, shared.config.opt_level);
        shared.stats.lock().optimization += opt;

        match shared.config.compile_mode {
            CompileMode::Eager => {
                let object = shared.compiler.compile(&module, Selection::Everything)?;
                let linked = shared.link_for_module(key, None, &object.bytes)?;
                {
                    let mut stats = shared.stats.lock();
                    for info in &object.functions {
                        stats.record_function(info);
                    }
                    stats.total_data_size += object.data_size;
                }
                Ok(ModuleEntry {
                    name: module.name.clone(),
                    symbols: linked.module_resolver(),
                    _objects: vec![linked],
                    lazy: None,
                })
            }
            CompileMode::Lazy => {
                let name = module.name.clone();
                let (globals, artifact) = lazy::install(shared, key, module)?;
                Ok(ModuleEntry {
                    name,
                    symbols: artifact.symbols().clone(),
                    _objects: vec![globals],
                    lazy: Some(artifact),
                })
            }
        }
    }

    fn check_duplicates(&self, module: &Module) -> JitResult<()> {
        let shared = &self.shared;
        let registry = shared.registry.read();
        for name in module.exported_symbols() {
            if !registry.is_exported(&shared.layout.mangle(&name)) {
                continue;
            }
            match shared.config.shadow_policy {
                ShadowPolicy::Reject => {
                    return Err(JitError::DuplicateSymbol {
                        name: name.to_string(),
                    })
                }
                ShadowPolicy::AllowLifo => {
                    log::debug!("module {} shadows {name}", module.name);
                }
            }
        }
        Ok(())
    }

    /// Address of the exported symbol `name`.
    pub fn lookup(&self, name: &str) -> JitResult<u64> {
        let shared = &self.shared;
        let mangled = shared.layout.mangle(name);
        let found = shared
            .registry
            .read()
            .lookup(&mangled)
            .map(|(_, symbol)| symbol)
            .or_else(|| shared.host.resolve(&mangled));
        let mut stats = shared.stats.lock();
        match found {
            Some(symbol) => {
                stats.lookups += 1;
                log::trace!("lookup {name} -> {:#x}", symbol.address);
                Ok(symbol.address)
            }
            None => {
                stats.lookup_misses += 1;
                Err(JitError::SymbolNotFound {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Compile a lazily added function now and return its body address.
    ///
    /// For eagerly compiled modules this is the same as [`lookup`](Self::lookup)
    /// restricted to JIT-defined symbols.
    pub fn materialize(&self, name: &str) -> JitResult<u64> {
        let shared = &self.shared;
        let mangled = shared.layout.mangle(name);
        let not_found = || JitError::SymbolNotFound {
            name: name.to_string(),
        };
        let (lazy, address) = {
            let registry = shared.registry.read();
            let (key, symbol) = registry.lookup(&mangled).ok_or_else(not_found)?;
            let entry = registry.modules.get(&key).ok_or(JitError::UnknownKey(key))?;
            (entry.lazy.as_ref().map(LazyArtifact::module), symbol.address)
        };
        match lazy {
            Some(module) if module.has_stub(&mangled) => module.materialize(&mangled),
            _ => Ok(address),
        }
    }

    /// Compilation state of a lazily added function; `None` when `name` has no stub.
    pub fn stub_state(&self, name: &str) -> Option<StubState> {
        let mangled = self.shared.layout.mangle(name);
        let registry = self.shared.registry.read();
        let (key, _) = registry.lookup(&mangled)?;
        registry.modules.get(&key)?.lazy.as_ref()?.module().state(&mangled)
    }

    /// Remove a module and release its memory.
    ///
    /// The module's code, stubs and data are unmapped immediately. No thread may be
    /// executing them, or about to return into them, when this is called; that
    /// includes a first call into a lazy stub that is still compiling.
    pub fn remove_module(&self, key: ModuleKey) -> JitResult<()> {
        let shared = &self.shared;
        let _mutation = shared.mutation.lock();
        let entry = shared
            .registry
            .write()
            .remove(key)
            .ok_or(JitError::UnknownKey(key))?;
        shared.stats.lock().modules_removed += 1;
        log::debug!("removed module {} ({key})", entry.name);
        drop(entry);
        Ok(())
    }

    /// Register host addresses under the given (unmangled) names.
    pub fn define_absolute_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        for (name, address) in symbols {
            log::trace!("absolute symbol {} = {address:#x}", name.as_ref());
            self.shared.host.define_absolute(name.as_ref(), address);
        }
    }

    pub fn module_count(&self) -> usize {
        self.shared.registry.read().modules.len()
    }

    pub fn contains_module(&self, key: ModuleKey) -> bool {
        self.shared.registry.read().modules.contains_key(&key)
    }

    /// Exported names of a live module, sorted.
    pub fn exported_symbols(&self, key: ModuleKey) -> JitResult<Vec<String>> {
        let registry = self.shared.registry.read();
        let entry = registry.modules.get(&key).ok_or(JitError::UnknownKey(key))?;
        let mut names: Vec<String> = entry
            .symbols
            .exported_names()
            .map(|name| self.shared.layout.demangle(name).to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.lock().clone()
    }

    pub fn data_layout(&self) -> DataLayout {
        self.shared.layout
    }

    pub fn target(&self) -> TargetDescription {
        self.shared.target
    }

    /// Context new modules should be created against.
    pub fn context(&self) -> &ThreadSafeContext {
        &self.shared.context
    }

    pub fn config(&self) -> &JitConfig {
        &self.shared.config
    }

    /// Remove every module and tear the session down.
    pub fn shutdown(self) {
        let _mutation = self.shared.mutation.lock();
        let registry = std::mem::take(&mut *self.shared.registry.write());
        log::debug!("shutting down session with {} modules", registry.modules.len());
        drop(registry);
    }
}

impl fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("target", &self.shared.target)
            .field("modules", &self.module_count())
            .field("config", &self.shared.config)
            .finish()
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;
    use crate::ir::parser::parse_module;

    fn session() -> ExecutionSession {
        ExecutionSession::create(JitConfig::default().with_process_symbols(false)).unwrap()
    }

    fn module(session: &ExecutionSession, name: &str, src: &str) -> Module {
        parse_module(src, name, session.context()).unwrap()
    }

    #[test]
    fn test_session_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ExecutionSession>();
    }

    #[test]
    fn test_keys_are_unique_and_retired_on_failure() {
        let session = session();
        let a = session
            .add_module(module(&session, "a", "define @one() {\nentry:\n  %v = iconst 1\n  ret %v\n}\n"))
            .unwrap();
        let failed = session.add_module(module(
            &session,
            "b",
            "define @two() {\nentry:\n  %v = call @nowhere()\n  ret %v\n}\n",
        ));
        assert!(matches!(failed, Err(JitError::UndefinedSymbol { ref name }) if name == "nowhere"));
        let c = session
            .add_module(module(&session, "c", "define @three() {\nentry:\n  %v = iconst 3\n  ret %v\n}\n"))
            .unwrap();
        assert!(c.as_u64() > a.as_u64() + 1);
        assert_eq!(session.module_count(), 2);
        assert_eq!(session.stats().failed_adds, 1);
        assert!(matches!(session.lookup("two"), Err(JitError::SymbolNotFound { .. })));
    }

    #[test]
    fn test_exported_symbols_and_removal() {
        let session = session();
        let key = session
            .add_module(module(
                &session,
                "m",
                "global @g = 1\ndefine @f() {\nentry:\n  %v = iconst 1\n  ret %v\n}\ndefine internal @h() {\nentry:\n  %v = iconst 2\n  ret %v\n}\n",
            ))
            .unwrap();
        assert_eq!(session.exported_symbols(key).unwrap(), vec!["f", "g"]);
        assert!(session.contains_module(key));
        session.remove_module(key).unwrap();
        assert!(!session.contains_module(key));
        assert!(matches!(session.remove_module(key), Err(JitError::UnknownKey(k)) if k == key));
        assert!(matches!(session.exported_symbols(key), Err(JitError::UnknownKey(_))));
    }

    #[test]
    fn test_registry_view_hides_excluded_module() {
        let mut registry = Registry::default();
        let flags = crate::jit::resolver::SymbolFlags {
            exported: true,
            callable: true,
        };
        let mut symbols = ModuleResolver::new();
        symbols.define("f", ResolvedSymbol::new(0x10, flags));
        registry.insert(
            ModuleKey(1),
            ModuleEntry {
                name: "a".into(),
                symbols,
                _objects: Vec::new(),
                lazy: None,
            },
        );
        let view = RegistryView {
            registry: &registry,
            exclude: ModuleKey(1),
        };
        assert!(view.resolve("f").is_none());
        let view = RegistryView {
            registry: &registry,
            exclude: ModuleKey(2),
        };
        assert_eq!(view.resolve("f").unwrap().address, 0x10);
        assert!(registry.remove(ModuleKey(1)).is_some());
        assert!(!registry.is_exported("f"));
    }
}
