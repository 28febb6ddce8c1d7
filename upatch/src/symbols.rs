//! Resolving symbol names to runtime addresses in the target.
//!
//! Two sources feed the per-task index: the target's own executable, read
//! from disk, and the dynamic symbol tables of every mapped library, read
//! out of the target's memory through `PT_DYNAMIC`.

use std::collections::btree_map::{BTreeMap, Entry};

use log::{debug, warn};
use upelf::components::dynamic::{parse_dynamic_table, KnownDynamicTag};
use upelf::components::section::KnownSectionType;
use upelf::components::segment::KnownSegmentType;
use upelf::components::sym::Sym;
use upelf::File;

use crate::errors::SymbolError;
use crate::memory::TargetMem;
use crate::vma::{VmaIndex, VmaKind, VmaSet};

/// A symbol known to live in the target, anchored to its group leader VMA
#[derive(Debug, Clone)]
pub struct TaskSymbol {
    pub name: String,
    pub sym: Sym,
    pub vma: VmaIndex,
}

/// Name-keyed symbol index; first writer wins, matching ELF search order
#[derive(Debug, Default)]
pub struct SymbolIndex {
    map: BTreeMap<String, TaskSymbol>,
}

impl SymbolIndex {
    pub fn insert(&mut self, symbol: TaskSymbol) {
        match self.map.entry(symbol.name.clone()) {
            Entry::Occupied(_) => {
                warn!("symbol {} already present, keeping first", symbol.name);
            }
            Entry::Vacant(slot) => {
                slot.insert(symbol);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TaskSymbol> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskSymbol> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// The runtime address of a resolved symbol.
///
/// For non-shared objects `st_value` already is the address. For a shared
/// library, find the group member whose file-offset window covers
/// `st_value` and rebase against it; libraries map several PT_LOADs at
/// different offsets, so the leader's start alone is not enough.
pub fn runtime_addr(set: &VmaSet, symbol: &TaskSymbol) -> u64 {
    let leader = set.get(symbol.vma);
    let value = symbol.sym.value.0;

    if !leader.is_shared_lib {
        return value;
    }

    let mut best = None;
    for (_, member) in set.group(symbol.vma) {
        if member.offset <= value {
            best = Some(member);
        } else {
            break;
        }
    }
    match best {
        Some(member) => member.start + (value - member.offset),
        None => leader.start + value,
    }
}

/// Wrap every defined symbol of the target's own ELF (read from disk) and
/// add it to the index, anchored at the self leader VMA.
pub fn load_self_symbols(
    index: &mut SymbolIndex,
    file: &File,
    raw: &[u8],
    self_leader: VmaIndex,
) -> Result<(), SymbolError> {
    let (symtab_idx, symtab_sh) = match file.section_with(KnownSectionType::SymTab) {
        Some(found) => found,
        None => {
            // stripped executable; dynamic symbols may still exist
            warn!("self ELF has no .symtab");
            return Ok(());
        }
    };
    let syms = file
        .read_syms(raw, symtab_idx)
        .map_err(|e| SymbolError::Parse("self".into(), e.to_string()))?;
    let strtab = file
        .strtab(raw, symtab_sh.link as usize)
        .map_err(|e| SymbolError::Parse("self".into(), e.to_string()))?;

    let mut added = 0;
    for sym in syms {
        if sym.is_undef() {
            continue;
        }
        let name = match strtab.at(sym.name as usize) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };
        index.insert(TaskSymbol {
            name,
            sym,
            vma: self_leader,
        });
        added += 1;
    }
    debug!("self ELF: {} symbols", added);
    Ok(())
}

/// Read a library's dynamic symbol table out of the target's memory and add
/// every defined symbol to the index.
pub fn load_dynamic_symbols(
    index: &mut SymbolIndex,
    set: &VmaSet,
    idx: VmaIndex,
    mem: &TargetMem,
) -> Result<(), SymbolError> {
    let vma = set.get(idx);
    let elf = match &vma.elf {
        Some(elf) => elf,
        None => return Ok(()),
    };
    let name = vma.name.clone();

    let dynamic = elf
        .phdrs
        .iter()
        .find(|ph| ph.typ.is(KnownSegmentType::Dynamic))
        .ok_or_else(|| SymbolError::NoDynamic(name.clone()))?;

    let table = mem.read_vec(
        elf.load_offset + dynamic.vaddr.0,
        dynamic.memsz.0 as usize,
    )?;
    let entries = parse_dynamic_table(&table);

    let mut symtab_addr = 0u64;
    let mut strtab_addr = 0u64;
    let mut strtab_sz = 0u64;
    for entry in &entries {
        if entry.tag.is(KnownDynamicTag::SymTab) {
            symtab_addr = entry.addr.0;
        } else if entry.tag.is(KnownDynamicTag::StrTab) {
            strtab_addr = entry.addr.0;
        } else if entry.tag.is(KnownDynamicTag::StrSz) {
            strtab_sz = entry.addr.0;
        } else if entry.tag.is(KnownDynamicTag::SymEnt) && entry.addr.0 != Sym::SIZE as u64 {
            return Err(SymbolError::BadSyment(entry.addr.0, Sym::SIZE));
        }
    }

    // the string table conventionally follows the symbol table
    let symtab_sz = match strtab_addr.checked_sub(symtab_addr) {
        Some(sz) if sz > 0 && strtab_sz > 0 => sz,
        _ => {
            warn!(
                "{}: unusable dynamic tables (symtab {:#x}, strtab {:#x}, strsz {:#x})",
                name, symtab_addr, strtab_addr, strtab_sz
            );
            return Ok(());
        }
    };

    // vdso tables are image-relative, everything else is absolute
    let symtab_addr = if vma.kind == VmaKind::Vdso {
        symtab_addr + elf.load_offset
    } else {
        symtab_addr
    };

    let buffer = mem.read_vec(symtab_addr, (symtab_sz + strtab_sz) as usize)?;
    let (symtab_raw, strtab_raw) = buffer.split_at(symtab_sz as usize);

    let leader = vma.leader;
    let mut added = 0;
    for chunk in symtab_raw.chunks_exact(Sym::SIZE) {
        let sym = match Sym::parse(chunk) {
            Ok((_, sym)) => sym,
            Err(_) => {
                return Err(SymbolError::Parse(name, "bad symbol entry".into()));
            }
        };
        if sym.is_undef() {
            continue;
        }
        let sym_name = match strtab_raw.get(sym.name as usize..) {
            Some(tail) => {
                let bytes = tail.split(|&c| c == 0).next().unwrap_or_default();
                match std::str::from_utf8(bytes) {
                    Ok(s) if !s.is_empty() => s.to_string(),
                    _ => continue,
                }
            }
            None => continue,
        };
        index.insert(TaskSymbol {
            name: sym_name,
            sym,
            vma: leader,
        });
        added += 1;
    }
    debug!("{}: {} dynamic symbols", set.get(idx).name, added);
    Ok(())
}
