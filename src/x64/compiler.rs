// This module turns IR into relocatable ELF object code for the host target. ObjectCompiler
// lowers the selected functions with FunctionCodegen (one bumpalo arena per function), lays
// the machine code out in .text and the global data in .data or .rodata, and defines one
// symbol per definition: exported definitions get global binding, internal ones local
// binding. Every symbol a function references through a patched immediate becomes an
// R_X86_64_64 relocation against either a symbol defined in the same object or an undefined
// symbol the linker resolves later. A selection restricts the output to the globals only or
// to a single function, which is how the lazy controller compiles bodies one at a time.
// The compiler holds no state between invocations beyond the target's data layout.

//! IR module to ELF object compilation.

use crate::core::context::Symbol;
use crate::core::error::{CompileError, CompileResult};
use crate::core::target::{DataLayout, TargetDescription};
use crate::ir::{Linkage, Module};
use crate::x64::function_codegen::FunctionCodegen;
use bumpalo::Bump;
use hashbrown::HashMap;
use object::write::{self, Object, StandardSection, SymbolId, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SymbolFlags, SymbolKind, SymbolScope,
};

/// Which definitions of a module go into the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection<'a> {
    /// All functions and globals.
    Everything,
    /// Global data only; functions are compiled later.
    GlobalsOnly,
    /// A single function and no data.
    Function(&'a str),
}

/// Per-function summary of a compiled object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: Symbol,
    pub code_size: usize,
    pub ir_instructions: usize,
}

/// Relocatable object produced by [`ObjectCompiler`].
#[derive(Debug, Clone)]
pub struct CompiledObject {
    pub bytes: Vec<u8>,
    pub functions: Vec<FunctionInfo>,
    pub code_size: usize,
    pub data_size: usize,
}

/// IR to object file compiler for one target.
#[derive(Debug, Clone)]
pub struct ObjectCompiler {
    layout: DataLayout,
}

struct Fixups {
    /// `(section offset, symbol)` in .text.
    text: Vec<(u64, Symbol)>,
}

impl ObjectCompiler {
    pub fn new(target: &TargetDescription) -> Self {
        Self {
            layout: target.data_layout(),
        }
    }

    pub fn data_layout(&self) -> &DataLayout {
        &self.layout
    }

    fn symbol(&self, name: &Symbol, kind: SymbolKind, linkage: Linkage) -> write::Symbol {
        write::Symbol {
            name: self.layout.mangle(name).into_bytes(),
            value: 0,
            size: 0,
            kind,
            scope: match linkage {
                Linkage::Exported => SymbolScope::Linkage,
                Linkage::Internal => SymbolScope::Compilation,
            },
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        }
    }

    /// Compile `selection` of `module` into an ELF relocatable object.
    pub fn compile(&self, module: &Module, selection: Selection<'_>) -> CompileResult<CompiledObject> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let mut defined: HashMap<Symbol, SymbolId> = HashMap::new();
        let mut fixups = Fixups { text: Vec::new() };
        let mut functions = Vec::new();
        let mut code_size = 0usize;
        let mut data_size = 0usize;

        if selection != Selection::GlobalsOnly {
            let text = obj.section_id(StandardSection::Text);
            let selected = module.functions.iter().filter(|f| match selection {
                Selection::Function(name) => &*f.name == name,
                _ => true,
            });
            for func in selected {
                let arena = Bump::new();
                let mut referenced: Vec<Symbol> = Vec::new();
                let code = FunctionCodegen::new(&arena, func)?.compile(|sym| {
                    referenced.push(sym.clone());
                    referenced.len() - 1
                })?;

                let offset = obj.append_section_data(text, &code.bytes, 16);
                let mut sym = self.symbol(&func.name, SymbolKind::Text, func.linkage);
                sym.value = offset;
                sym.size = code.bytes.len() as u64;
                sym.section = SymbolSection::Section(text);
                defined.insert(func.name.clone(), obj.add_symbol(sym));

                for (imm_offset, index) in code.symbol_fixups {
                    fixups.text.push((offset + imm_offset, referenced[index].clone()));
                }
                code_size += code.bytes.len();
                functions.push(FunctionInfo {
                    name: func.name.clone(),
                    code_size: code.bytes.len(),
                    ir_instructions: func.instruction_count(),
                });
            }
            if let Selection::Function(name) = selection {
                if functions.is_empty() {
                    return Err(CompileError::FunctionNotFound {
                        name: name.to_string(),
                    });
                }
            }
        }

        if !matches!(selection, Selection::Function(_)) {
            for global in &module.globals {
                let section = obj.section_id(if global.writable {
                    StandardSection::Data
                } else {
                    StandardSection::ReadOnlyData
                });
                // Zero-sized data still needs a distinct address.
                let bytes: &[u8] = if global.bytes.is_empty() { &[0] } else { &global.bytes };
                let offset = obj.append_section_data(section, bytes, 8);
                let mut sym = self.symbol(&global.name, SymbolKind::Data, global.linkage);
                sym.value = offset;
                sym.size = global.bytes.len() as u64;
                sym.section = SymbolSection::Section(section);
                defined.insert(global.name.clone(), obj.add_symbol(sym));
                data_size += bytes.len();
            }
        }

        if !fixups.text.is_empty() {
            let text = obj.section_id(StandardSection::Text);
            for (offset, target) in fixups.text {
                let symbol = match defined.get(&target) {
                    Some(&id) => id,
                    None => {
                        let mut undef = self.symbol(&target, SymbolKind::Unknown, Linkage::Exported);
                        undef.scope = SymbolScope::Unknown;
                        let id = obj.add_symbol(undef);
                        defined.insert(target.clone(), id);
                        id
                    }
                };
                obj.add_relocation(
                    text,
                    write::Relocation {
                        offset,
                        symbol,
                        addend: 0,
                        flags: RelocationFlags::Generic {
                            kind: RelocationKind::Absolute,
                            encoding: RelocationEncoding::Generic,
                            size: 64,
                        },
                    },
                )
                .map_err(|e| CompileError::ObjectWrite {
                    reason: e.to_string(),
                })?;
            }
        }

        let bytes = obj.write().map_err(|e| CompileError::ObjectWrite {
            reason: e.to_string(),
        })?;
        log::debug!(
            "compiled module {} ({selection:?}): {} functions, {code_size} code bytes, {data_size} data bytes, {} byte object",
            module.name,
            functions.len(),
            bytes.len()
        );
        Ok(CompiledObject {
            bytes,
            functions,
            code_size,
            data_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;
    use crate::ir::parser::parse_module;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    const SRC: &str = r#"
global @counter = 7
global internal const @msg = "hey\00"

define @bump() {
entry:
    %p = addr @counter
    %v = load %p
    %m = addr @msg
    %r = call @puts(%m)
    ret %v
}

define internal @helper(%x) {
entry:
    ret %x
}
"#;

    fn target() -> TargetDescription {
        TargetDescription::from_triple("x86_64-unknown-linux-gnu").unwrap()
    }

    #[test]
    fn test_object_symbols_and_relocations() {
        let ctx = ThreadSafeContext::new();
        let module = parse_module(SRC, "m", &ctx).unwrap();
        let compiled = ObjectCompiler::new(&target())
            .compile(&module, Selection::Everything)
            .unwrap();
        assert_eq!(compiled.functions.len(), 2);
        assert_eq!(compiled.data_size, 12);

        let file = object::File::parse(&*compiled.bytes).unwrap();
        let bump = file.symbol_by_name("bump").unwrap();
        assert!(bump.is_global());
        let helper = file.symbol_by_name("helper").unwrap();
        assert!(helper.is_local());
        let puts = file.symbol_by_name("puts").unwrap();
        assert!(puts.is_undefined());

        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.relocations().count(), 3);
        for (_, reloc) in text.relocations() {
            assert_eq!(reloc.kind(), RelocationKind::Absolute);
            assert_eq!(reloc.size(), 64);
        }
    }

    #[test]
    fn test_selection() {
        let ctx = ThreadSafeContext::new();
        let module = parse_module(SRC, "m", &ctx).unwrap();
        let compiler = ObjectCompiler::new(&target());

        let globals = compiler.compile(&module, Selection::GlobalsOnly).unwrap();
        assert!(globals.functions.is_empty());
        let file = object::File::parse(&*globals.bytes).unwrap();
        assert!(file.symbol_by_name("counter").is_some());
        assert!(file.symbol_by_name("bump").is_none());

        let one = compiler.compile(&module, Selection::Function("bump")).unwrap();
        assert_eq!(one.functions.len(), 1);
        assert_eq!(one.data_size, 0);
        let file = object::File::parse(&*one.bytes).unwrap();
        assert!(file.symbol_by_name("counter").unwrap().is_undefined());

        assert!(matches!(
            compiler.compile(&module, Selection::Function("nope")),
            Err(CompileError::FunctionNotFound { .. })
        ));
    }
}
