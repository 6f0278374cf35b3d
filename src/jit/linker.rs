// This module is the in-process linker for relocatable object code. It reads the object with
// the object crate, lays every allocatable section out into one of three memory regions
// (code, writable data, read-only data) respecting section alignment, copies the section
// contents in, computes the address of every defined symbol and applies relocations.
// References to symbols the object defines itself are resolved directly; everything else is
// asked of the caller's SymbolResolver, and a miss fails the link naming the symbol. Only
// absolute 64-bit and PC-relative 32-bit relocations are understood. Once relocated, the
// code region is switched to read+execute and read-only data to read-only, so the finished
// LinkedObject never holds memory that is writable and executable at once.

//! Relocating linker for in-memory objects.

use crate::core::error::LinkError;
use crate::jit::memory::{MemoryRegion, Protection};
use crate::jit::resolver::{ModuleResolver, ResolvedSymbol, SymbolFlags, SymbolResolver};
use hashbrown::HashMap;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget, SectionIndex,
    SectionKind, SymbolIndex, SymbolKind, SymbolSection,
};

// ============================================================================
// Layout
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Code = 0,
    Data = 1,
    ReadOnly = 2,
}

impl RegionKind {
    fn classify(kind: SectionKind) -> Option<Self> {
        match kind {
            SectionKind::Text => Some(RegionKind::Code),
            SectionKind::Data | SectionKind::UninitializedData => Some(RegionKind::Data),
            SectionKind::ReadOnlyData
            | SectionKind::ReadOnlyDataWithRel
            | SectionKind::ReadOnlyString => Some(RegionKind::ReadOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    region: RegionKind,
    offset: usize,
}

fn malformed(err: object::Error) -> LinkError {
    LinkError::MalformedObject {
        reason: err.to_string(),
    }
}

// ============================================================================
// Linked object
// ============================================================================

/// A symbol defined by a linked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedSymbol {
    pub address: u64,
    pub size: u64,
    pub flags: SymbolFlags,
}

/// Relocated code and data of one object, kept alive as long as its symbols are reachable.
#[derive(Debug)]
pub struct LinkedObject {
    regions: [MemoryRegion; 3],
    symbols: HashMap<String, LinkedSymbol>,
}

impl LinkedObject {
    pub fn symbol(&self, name: &str) -> Option<&LinkedSymbol> {
        self.symbols.get(name)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, &LinkedSymbol)> {
        self.symbols.iter().map(|(name, sym)| (name.as_str(), sym))
    }

    pub fn exported_symbols(&self) -> impl Iterator<Item = (&str, &LinkedSymbol)> {
        self.symbols().filter(|(_, sym)| sym.flags.exported)
    }

    pub fn code(&self) -> &MemoryRegion {
        &self.regions[RegionKind::Code as usize]
    }

    pub fn code_size(&self) -> usize {
        self.code().len()
    }

    pub fn data_size(&self) -> usize {
        self.regions[RegionKind::Data as usize].len() + self.regions[RegionKind::ReadOnly as usize].len()
    }

    /// Whether `address` falls inside memory owned by this object.
    pub fn contains(&self, address: u64) -> bool {
        self.regions.iter().any(|r| r.contains(address))
    }

    /// The object's own view of its symbols, internal definitions included.
    pub fn module_resolver(&self) -> ModuleResolver {
        let mut table = ModuleResolver::new();
        for (name, sym) in &self.symbols {
            table.define(name.clone(), ResolvedSymbol::new(sym.address, sym.flags));
        }
        table
    }
}

// ============================================================================
// Linking
// ============================================================================

/// Link `bytes` into fresh memory, resolving external references with `resolver`.
pub fn link(bytes: &[u8], resolver: &dyn SymbolResolver) -> Result<LinkedObject, LinkError> {
    let file = object::File::parse(bytes).map_err(malformed)?;
    if file.architecture() != object::Architecture::X86_64 {
        return Err(LinkError::MalformedObject {
            reason: format!("unsupported architecture {:?}", file.architecture()),
        });
    }

    let mut sizes = [0usize; 3];
    let mut placements: HashMap<SectionIndex, Placement> = HashMap::new();
    for section in file.sections() {
        let Some(region) = RegionKind::classify(section.kind()) else {
            continue;
        };
        let align = section.align().max(1) as usize;
        let offset = sizes[region as usize].next_multiple_of(align);
        sizes[region as usize] = offset + section.size() as usize;
        placements.insert(section.index(), Placement { region, offset });
    }

    let mut regions = [
        MemoryRegion::allocate(sizes[0])?,
        MemoryRegion::allocate(sizes[1])?,
        MemoryRegion::allocate(sizes[2])?,
    ];
    let base = |regions: &[MemoryRegion; 3], p: Placement| regions[p.region as usize].base() + p.offset as u64;

    for section in file.sections() {
        let Some(&placement) = placements.get(&section.index()) else {
            continue;
        };
        if section.kind() == SectionKind::UninitializedData {
            continue;
        }
        let data = section.data().map_err(malformed)?;
        regions[placement.region as usize].write(placement.offset, data)?;
    }

    // Defined symbols, by index for relocations and by name for the caller.
    let mut addresses: HashMap<SymbolIndex, u64> = HashMap::new();
    let mut symbols: HashMap<String, LinkedSymbol> = HashMap::new();
    for symbol in file.symbols() {
        let address = match symbol.section() {
            SymbolSection::Section(index) => match placements.get(&index) {
                Some(&placement) => base(&regions, placement) + symbol.address(),
                None => continue,
            },
            SymbolSection::Absolute => symbol.address(),
            _ => continue,
        };
        addresses.insert(symbol.index(), address);
        if matches!(symbol.kind(), SymbolKind::Section | SymbolKind::File) {
            continue;
        }
        let name = symbol.name().map_err(malformed)?;
        if name.is_empty() {
            continue;
        }
        symbols.insert(
            name.to_string(),
            LinkedSymbol {
                address,
                size: symbol.size(),
                flags: SymbolFlags {
                    exported: symbol.is_global(),
                    callable: symbol.kind() == SymbolKind::Text,
                },
            },
        );
    }

    let mut applied = 0usize;
    for section in file.sections() {
        let Some(&placement) = placements.get(&section.index()) else {
            continue;
        };
        let section_base = base(&regions, placement);
        for (offset, reloc) in section.relocations() {
            let (target, target_name) = match reloc.target() {
                RelocationTarget::Symbol(index) => {
                    let symbol = file.symbol_by_index(index).map_err(malformed)?;
                    let name = symbol.name().map_err(malformed)?;
                    let address = match addresses.get(&index) {
                        Some(&address) => address,
                        None => match resolver.resolve(name) {
                            Some(resolved) => resolved.address,
                            None => {
                                return Err(LinkError::UndefinedSymbol {
                                    name: name.to_string(),
                                })
                            }
                        },
                    };
                    (address, name.to_string())
                }
                RelocationTarget::Section(index) => {
                    let placement = placements.get(&index).copied().ok_or_else(|| {
                        LinkError::MalformedObject {
                            reason: format!("relocation against unallocated section {}", index.0),
                        }
                    })?;
                    (base(&regions, placement), format!("section {}", index.0))
                }
                RelocationTarget::Absolute => (0, "absolute".to_string()),
                #[allow(unreachable_patterns)]
                _ => {
                    return Err(LinkError::MalformedObject {
                        reason: format!("unknown relocation target at {offset:#x}"),
                    })
                }
            };

            let place = section_base + offset;
            let at = placement.offset + offset as usize;
            let region = &mut regions[placement.region as usize];
            match (reloc.kind(), reloc.size()) {
                (RelocationKind::Absolute, 64) => {
                    let value = target.wrapping_add_signed(reloc.addend());
                    region.write(at, &value.to_le_bytes())?;
                }
                (RelocationKind::Relative | RelocationKind::PltRelative, 32) => {
                    let value = (target as i64)
                        .wrapping_add(reloc.addend())
                        .wrapping_sub(place as i64);
                    let value = i32::try_from(value).map_err(|_| LinkError::RelocationOverflow {
                        symbol: target_name,
                        size: 32,
                    })?;
                    region.write(at, &value.to_le_bytes())?;
                }
                (kind, size) => {
                    return Err(LinkError::UnsupportedRelocation {
                        kind: format!("{kind:?}"),
                        size,
                        section: section.name().unwrap_or("?").to_string(),
                        offset,
                    })
                }
            }
            applied += 1;
        }
    }

    regions[RegionKind::Code as usize].protect(Protection::ReadExecute)?;
    regions[RegionKind::ReadOnly as usize].protect(Protection::ReadOnly)?;
    log::debug!(
        "linked object: {} code bytes at {:#x}, {} data bytes, {} symbols, {applied} relocations",
        sizes[0],
        regions[0].base(),
        sizes[1] + sizes[2],
        symbols.len()
    );

    Ok(LinkedObject { regions, symbols })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ThreadSafeContext;
    use crate::core::target::TargetDescription;
    use crate::ir::parser::parse_module;
    use crate::x64::compiler::{ObjectCompiler, Selection};
    use object::write::{self, StandardSection};
    use object::{BinaryFormat, Endianness, RelocationEncoding, RelocationFlags};

    fn compile(src: &str) -> Vec<u8> {
        let ctx = ThreadSafeContext::new();
        let module = parse_module(src, "t", &ctx).unwrap();
        let target = TargetDescription::from_triple("x86_64-unknown-linux-gnu").unwrap();
        ObjectCompiler::new(&target)
            .compile(&module, Selection::Everything)
            .unwrap()
            .bytes
    }

    fn nothing(_: &str) -> Option<ResolvedSymbol> {
        None
    }

    /// Object with one text symbol and a single relocation of the given shape.
    fn object_with_relocation(kind: RelocationKind, size: u8, target_undefined: bool) -> Vec<u8> {
        let mut obj = write::Object::new(BinaryFormat::Elf, object::Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        let offset = obj.append_section_data(text, &[0x90; 16], 16);
        let local = obj.add_symbol(write::Symbol {
            name: b"local_fn".to_vec(),
            value: offset,
            size: 16,
            kind: SymbolKind::Text,
            scope: object::SymbolScope::Linkage,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: object::SymbolFlags::None,
        });
        let symbol = if target_undefined {
            obj.add_symbol(write::Symbol {
                name: b"far_away".to_vec(),
                value: 0,
                size: 0,
                kind: SymbolKind::Unknown,
                scope: object::SymbolScope::Unknown,
                weak: false,
                section: write::SymbolSection::Undefined,
                flags: object::SymbolFlags::None,
            })
        } else {
            local
        };
        obj.add_relocation(
            text,
            write::Relocation {
                offset: 4,
                symbol,
                addend: -4,
                flags: RelocationFlags::Generic {
                    kind,
                    encoding: RelocationEncoding::Generic,
                    size,
                },
            },
        )
        .unwrap();
        obj.write().unwrap()
    }

    #[test]
    fn test_link_defines_symbols_and_protects_code() {
        let bytes = compile(
            "global @counter = 41\n\
             define @get() {\nentry:\n  %p = addr @counter\n  %v = load %p\n  ret %v\n}\n\
             define internal @hidden() {\nentry:\n  %z = iconst 0\n  ret %z\n}\n",
        );
        let linked = link(&bytes, &nothing).unwrap();
        let get = *linked.symbol("get").unwrap();
        assert!(get.flags.exported);
        assert!(get.flags.callable);
        assert!(linked.code().contains(get.address));
        assert_eq!(linked.code().protection(), Protection::ReadExecute);

        let hidden = linked.symbol("hidden").unwrap();
        assert!(!hidden.flags.exported);
        assert_eq!(linked.exported_symbols().count(), 2);

        let counter = linked.symbol("counter").unwrap();
        assert!(!counter.flags.callable);
        assert!(linked.contains(counter.address));
        let code = linked.code().read(0, linked.code_size()).unwrap();
        assert!(code.windows(8).any(|w| w == counter.address.to_le_bytes()));

        let table = linked.module_resolver();
        assert!(table.resolve("hidden").is_some());
        assert!(table.exported("hidden").is_none());
    }

    #[test]
    fn test_external_references_use_resolver() {
        let bytes = compile(
            "define @call_out(%x) {\nentry:\n  %r = call @host_fn(%x)\n  ret %r\n}\n",
        );
        let err = link(&bytes, &nothing).unwrap_err();
        assert!(matches!(err, LinkError::UndefinedSymbol { ref name } if name == "host_fn"));

        let resolver = |name: &str| {
            (name == "host_fn").then(|| ResolvedSymbol::new(0x1234_5678_9abc, SymbolFlags::default()))
        };
        let linked = link(&bytes, &resolver).unwrap();
        let code = linked.code().read(0, linked.code_size()).unwrap();
        assert!(code
            .windows(8)
            .any(|w| w == 0x1234_5678_9abcu64.to_le_bytes()));
    }

    #[test]
    fn test_pc_relative_relocation() {
        let bytes = object_with_relocation(RelocationKind::Relative, 32, false);
        let linked = link(&bytes, &nothing).unwrap();
        let target = linked.symbol("local_fn").unwrap().address;
        let base = linked.code().base();
        let value = i32::from_le_bytes(linked.code().read(4, 4).unwrap().try_into().unwrap());
        assert_eq!(value as i64, target as i64 - 4 - (base as i64 + 4));
    }

    #[test]
    fn test_pc_relative_overflow() {
        let bytes = object_with_relocation(RelocationKind::Relative, 32, true);
        let resolver = |_: &str| Some(ResolvedSymbol::new(0x10, SymbolFlags::default()));
        let err = link(&bytes, &resolver).unwrap_err();
        assert!(matches!(err, LinkError::RelocationOverflow { ref symbol, size: 32 } if symbol == "far_away"));
    }

    #[test]
    fn test_unsupported_relocation() {
        let bytes = object_with_relocation(RelocationKind::Absolute, 16, false);
        let err = link(&bytes, &nothing).unwrap_err();
        assert!(matches!(err, LinkError::UnsupportedRelocation { size: 16, .. }));
    }

    #[test]
    fn test_malformed_object() {
        assert!(matches!(
            link(b"not an object", &nothing),
            Err(LinkError::MalformedObject { .. })
        ));
    }
}
