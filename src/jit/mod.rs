// The runtime half of the JIT. Compiled objects are linked into page-aligned memory regions
// whose protections are flipped once relocations are applied, external references are
// resolved through a chain of symbol resolvers, and the execution session ties everything
// together behind add_module, lookup and remove_module. Lazily added modules go through
// call-through stubs that compile a function the first time it is called.

//! Linking, symbol resolution and the execution session.

mod lazy;
pub mod linker;
pub mod memory;
pub mod resolver;
pub mod session;

pub use lazy::StubState;
pub use linker::{link, LinkedObject, LinkedSymbol};
pub use memory::{MemoryError, MemoryRegion, Protection};
pub use resolver::{
    ChainedResolver, HostResolver, ModuleResolver, ResolvedSymbol, SymbolFlags, SymbolResolver,
};
pub use session::{ExecutionSession, ModuleKey};
