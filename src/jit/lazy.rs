// Lazy compilation. A lazily added module gets its global data linked right away and one
// call-through stub per function instead of a body. A stub is an indirect jump through a
// per-function slot. The slot first points at a re-entry sequence that loads the stub's
// record and jumps to a shared trampoline; the trampoline saves the argument registers,
// calls back into the session to compile the body, restores the registers and tail-jumps
// to the body. Once compiled, the slot is overwritten with the body address so later calls
// go straight through the stub. Compilation of a function happens at most once: callers
// that arrive while another thread compiles the same body block on the stub's condition
// variable until the address is published.
//
// Region layout, one mapping per module:
//
//   [ trampoline | stub 0 | re-entry 0 | stub 1 | re-entry 1 | ... ]
//
// Every piece is padded with int3 to a fixed size so addresses are known before any code
// is encoded.

//! Call-through stubs and on-demand compilation.

use crate::core::error::{CompileError, JitError, JitResult};
use crate::ir::{Linkage, Module};
use crate::jit::linker::LinkedObject;
use crate::jit::memory::{MemoryRegion, Protection};
use crate::jit::resolver::{ModuleResolver, ResolvedSymbol, SymbolFlags};
use crate::jit::session::{ModuleKey, Shared};
use crate::x64::calling_convention::SysVAssigner;
use crate::x64::compiler::Selection;
use crate::x64::encoder::{AsmReg, EncodingError, X64Encoder};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

const TRAMPOLINE_SIZE: usize = 128;
const PIECE_SIZE: usize = 32;
const STUB_STRIDE: usize = 2 * PIECE_SIZE;
const INT3: u8 = 0xcc;

type CompileCallback = extern "C" fn(*const StubRecord) -> u64;

fn stub_offset(index: usize) -> usize {
    TRAMPOLINE_SIZE + index * STUB_STRIDE
}

fn reentry_offset(index: usize) -> usize {
    stub_offset(index) + PIECE_SIZE
}

/// Compilation state of one stubbed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubState {
    Stubbed,
    Compiling,
    Compiled(u64),
}

/// Per-function bookkeeping; its address is baked into the re-entry code.
pub(crate) struct StubRecord {
    owner: Weak<LazyModule>,
    index: usize,
    /// Mangled name.
    name: String,
    state: Mutex<StubState>,
    ready: Condvar,
    /// Jump target of the stub.
    slot: AtomicU64,
}

impl StubRecord {
    fn compile(&self) -> JitResult<u64> {
        let owner = self.owner.upgrade().ok_or_else(|| JitError::SymbolNotFound {
            name: self.name.clone(),
        })?;
        owner.ensure_compiled(self)
    }
}

/// Entered from the trampoline with the record of the stub that was called.
extern "C" fn lazy_compile_entry(record: *const StubRecord) -> u64 {
    // SAFETY: the pointer comes from re-entry code that lives exactly as long as the
    // boxed record it refers to.
    let record = unsafe { &*record };
    match record.compile() {
        Ok(address) => address,
        Err(err) => {
            log::error!("lazy compilation of {} failed: {err}", record.name);
            std::process::abort();
        }
    }
}

/// A module whose function bodies are compiled on demand.
pub(crate) struct LazyModule {
    key: ModuleKey,
    session: Weak<Shared>,
    /// Optimized IR, kept for later compiles.
    module: Module,
    /// Stub addresses and linked globals.
    symbols: ModuleResolver,
    records: Vec<Box<StubRecord>>,
    bodies: Mutex<Vec<LinkedObject>>,
}

impl LazyModule {
    pub(crate) fn has_stub(&self, mangled: &str) -> bool {
        self.records.iter().any(|r| r.name == mangled)
    }

    /// Compile the body of `mangled` if needed and return its address.
    pub(crate) fn materialize(&self, mangled: &str) -> JitResult<u64> {
        let record = self
            .records
            .iter()
            .find(|r| r.name == mangled)
            .ok_or_else(|| JitError::SymbolNotFound {
                name: mangled.to_string(),
            })?;
        self.ensure_compiled(record)
    }

    pub(crate) fn state(&self, mangled: &str) -> Option<StubState> {
        self.records
            .iter()
            .find(|r| r.name == mangled)
            .map(|r| *r.state.lock())
    }

    fn ensure_compiled(&self, record: &StubRecord) -> JitResult<u64> {
        {
            let mut state = record.state.lock();
            loop {
                let current = *state;
                match current {
                    StubState::Compiled(address) => return Ok(address),
                    StubState::Compiling => record.ready.wait(&mut state),
                    StubState::Stubbed => {
                        *state = StubState::Compiling;
                        break;
                    }
                }
            }
        }

        let result = self.compile_body(record);
        let mut state = record.state.lock();
        match result {
            Ok(address) => {
                record.slot.store(address, Ordering::Release);
                *state = StubState::Compiled(address);
            }
            Err(_) => *state = StubState::Stubbed,
        }
        record.ready.notify_all();
        result
    }

    fn compile_body(&self, record: &StubRecord) -> JitResult<u64> {
        let session = self
            .session
            .upgrade()
            .ok_or(JitError::UnknownKey(self.key))?;
        let func = &self.module.functions[record.index];
        let object = session
            .compiler
            .compile(&self.module, Selection::Function(func.name.as_str()))?;
        let linked = session.link_for_module(self.key, Some(&self.symbols), &object.bytes)?;
        let address = linked
            .symbol(&record.name)
            .map(|s| s.address)
            .ok_or_else(|| JitError::SymbolNotFound {
                name: func.name.to_string(),
            })?;

        {
            let mut stats = session.stats.lock();
            for info in &object.functions {
                stats.record_function(info);
            }
            stats.lazy_compilations += 1;
        }
        log::debug!("compiled {} on demand at {address:#x}", func.name);
        self.bodies.lock().push(linked);
        Ok(address)
    }
}

/// What a lazily added module keeps alive.
pub(crate) struct LazyArtifact {
    module: Arc<LazyModule>,
    /// Trampoline, stubs and re-entry code.
    _stubs: MemoryRegion,
}

impl LazyArtifact {
    pub(crate) fn module(&self) -> Arc<LazyModule> {
        Arc::clone(&self.module)
    }

    pub(crate) fn symbols(&self) -> &ModuleResolver {
        &self.module.symbols
    }
}

// ============================================================================
// Code emission
// ============================================================================

fn encode_trampoline(ip: u64) -> Result<Vec<u8>, EncodingError> {
    let callback: CompileCallback = lazy_compile_entry;
    let mut enc = X64Encoder::new()?;
    enc.push_reg(AsmReg::RBP)?;
    enc.mov_reg_reg(AsmReg::RBP, AsmReg::RSP)?;
    for reg in SysVAssigner::GP_ARG_REGS {
        enc.push_reg(reg)?;
    }
    enc.mov_reg_reg(AsmReg::RDI, AsmReg::RAX)?;
    enc.mov_reg_imm(AsmReg::RAX, callback as usize as i64)?;
    enc.call_reg(AsmReg::RAX)?;
    enc.mov_reg_reg(AsmReg::R11, AsmReg::RAX)?;
    for reg in SysVAssigner::GP_ARG_REGS.into_iter().rev() {
        enc.pop_reg(reg)?;
    }
    enc.pop_reg(AsmReg::RBP)?;
    enc.jmp_reg(AsmReg::R11)?;
    Ok(enc.finalize(ip)?.bytes)
}

fn encode_stub(ip: u64, slot: u64) -> Result<Vec<u8>, EncodingError> {
    let mut enc = X64Encoder::new()?;
    enc.mov_reg_imm(AsmReg::R11, slot as i64)?;
    enc.jmp_mem(AsmReg::R11, 0)?;
    Ok(enc.finalize(ip)?.bytes)
}

fn encode_reentry(ip: u64, record: u64, trampoline: u64) -> Result<Vec<u8>, EncodingError> {
    let mut enc = X64Encoder::new()?;
    enc.mov_reg_imm(AsmReg::RAX, record as i64)?;
    enc.mov_reg_imm(AsmReg::R11, trampoline as i64)?;
    enc.jmp_reg(AsmReg::R11)?;
    Ok(enc.finalize(ip)?.bytes)
}

fn encoding(err: EncodingError) -> JitError {
    JitError::Compile(CompileError::Encoding(err))
}

fn place(region: &mut MemoryRegion, offset: usize, code: &[u8], limit: usize) -> JitResult<()> {
    if code.len() > limit {
        return Err(encoding(EncodingError::AssemblyError(format!(
            "stub code of {} bytes exceeds its {limit} byte slot",
            code.len()
        ))));
    }
    region.write(offset, code)?;
    Ok(())
}

/// Link the globals of `module` and install a stub for each function.
///
/// Returns the linked globals and the artifact owning stubs and IR.
pub(crate) fn install(
    shared: &Arc<Shared>,
    key: ModuleKey,
    module: Module,
) -> JitResult<(LinkedObject, LazyArtifact)> {
    shared.check_external_references(key, &module)?;

    let count = module.functions.len();
    let mut region = MemoryRegion::allocate(stub_offset(count))?;
    let base = region.base();

    let object = shared.compiler.compile(&module, Selection::GlobalsOnly)?;
    let globals = shared.link_for_module(key, None, &object.bytes)?;

    let mut symbols = globals.module_resolver();
    for (index, func) in module.functions.iter().enumerate() {
        let flags = SymbolFlags {
            exported: func.linkage == Linkage::Exported,
            callable: true,
        };
        symbols.define(
            shared.layout.mangle(&func.name),
            ResolvedSymbol::new(base + stub_offset(index) as u64, flags),
        );
    }

    let layout = shared.layout;
    let session = Arc::downgrade(shared);
    let lazy = Arc::new_cyclic(move |owner: &Weak<LazyModule>| {
        let records = module
            .functions
            .iter()
            .enumerate()
            .map(|(index, func)| {
                Box::new(StubRecord {
                    owner: owner.clone(),
                    index,
                    name: layout.mangle(&func.name),
                    state: Mutex::new(StubState::Stubbed),
                    ready: Condvar::new(),
                    slot: AtomicU64::new(base + reentry_offset(index) as u64),
                })
            })
            .collect();
        LazyModule {
            key,
            session,
            module,
            symbols,
            records,
            bodies: Mutex::new(Vec::new()),
        }
    });

    region.write(0, &vec![INT3; region.len()])?;
    let trampoline = encode_trampoline(base).map_err(encoding)?;
    place(&mut region, 0, &trampoline, TRAMPOLINE_SIZE)?;
    for (index, record) in lazy.records.iter().enumerate() {
        let stub_at = stub_offset(index);
        let reentry_at = reentry_offset(index);
        let slot = &record.slot as *const AtomicU64 as u64;
        let record_addr = &**record as *const StubRecord as u64;

        let stub = encode_stub(base + stub_at as u64, slot).map_err(encoding)?;
        place(&mut region, stub_at, &stub, PIECE_SIZE)?;
        let reentry = encode_reentry(base + reentry_at as u64, record_addr, base)
            .map_err(encoding)?;
        place(&mut region, reentry_at, &reentry, PIECE_SIZE)?;
    }
    region.protect(Protection::ReadExecute)?;

    {
        let mut stats = shared.stats.lock();
        stats.stubs_installed += count;
        stats.total_data_size += object.data_size;
    }
    log::debug!(
        "installed {count} stubs for module {} at {base:#x}",
        lazy.module.name
    );

    Ok((
        globals,
        LazyArtifact {
            module: lazy,
            _stubs: region,
        },
    ))
}
