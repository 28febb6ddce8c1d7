//! Staging the patch image in the target and linking it there

use log::{debug, info};
use upelf::components::meta::PatchMeta;
use upelf::components::section::KnownSectionType;
use upelf::components::sym::Sym;

use super::info::LoadInfo;
use crate::arch::native as arch;
use crate::errors::{PatchError, SymbolError};
use crate::symbols;
use crate::task::Task;

/// Copy the patch into the registry, have the target map that file
/// read-write-execute, and fill the mapping with the object's bytes.
///
/// The mapping is private: relocation writes stay local to the target and
/// never reach the staged file.
pub fn stage(task: &mut Task, load: &mut LoadInfo) -> Result<(), PatchError> {
    let registry = task.registry.as_ref().ok_or(PatchError::RegistryRequired)?;
    let staged = registry
        .stage(&load.raw)
        .map_err(|e| PatchError::Io(load.path.clone(), e))?;
    let len = load.raw.len();

    let staged_result = (|| {
        let fd = task.remote_open(&staged, libc::O_RDWR, 0)?;
        let mapped = task
            .remote_ftruncate(fd, len as u64)
            .and_then(|_| {
                task.remote_mmap(
                    0,
                    len,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE,
                    fd,
                    0,
                )
            });
        let _ = task.remote_close(fd);
        mapped
    })();

    let base = match staged_result {
        Ok(base) => base,
        Err(e) => {
            if let Some(registry) = task.registry.as_ref() {
                let _ = registry.remove(&staged);
            }
            return Err(e.into());
        }
    };

    if let Err(e) = task
        .memcpy_to(base, &load.raw)
        .map_err(PatchError::from)
        .and_then(|_| task.update_vmas().map_err(PatchError::from))
    {
        let _ = task.remote_munmap(base, len);
        if let Some(registry) = task.registry.as_ref() {
            let _ = registry.remove(&staged);
        }
        return Err(e);
    }

    info!(
        "staged {} at {:#x} in pid {}",
        staged.display(),
        base,
        task.pid
    );
    load.target_base = Some(base);
    load.staged_path = Some(staged);
    Ok(())
}

/// Symbols of the patch object with their values resolved into the
/// target's address space
pub struct ResolvedSyms {
    pub syms: Vec<Sym>,
    pub names: Vec<String>,
    pub values: Vec<u64>,
}

impl ResolvedSyms {
    /// The replacement function: the defined global function named like the
    /// patched one if present, otherwise the unique defined global function.
    pub fn replacement(&self, target_func: &str) -> Result<(usize, u64), PatchError> {
        let mut candidates = Vec::new();
        for (i, sym) in self.syms.iter().enumerate() {
            if sym.is_undef() || !sym.is_func() || !sym.is_global() {
                continue;
            }
            if self.names[i] == target_func {
                return Ok((i, self.values[i]));
            }
            candidates.push(i);
        }
        match candidates.as_slice() {
            [single] => Ok((*single, self.values[*single])),
            _ => Err(PatchError::AmbiguousReplacement),
        }
    }
}

/// Resolve every symbol of the patch object.
///
/// Defined symbols land at `base + section file offset + st_value`: the
/// image is a byte-for-byte copy of the object file, so file offsets are
/// the only geometry it has. Undefined symbols go through the task's index;
/// an unresolved one is fatal.
pub fn resolve_symbols(task: &Task, load: &LoadInfo) -> Result<ResolvedSyms, PatchError> {
    let base = load.target_base.ok_or(PatchError::NotStaged)?;
    let syms = load.file.read_syms(&load.raw, load.index.symtab)?;
    let strtab = load
        .file
        .strtab(&load.raw, load.index.strtab)
        .map_err(|e| PatchError::Elf(load.path.clone(), e))?;

    let mut names = Vec::with_capacity(syms.len());
    let mut values = Vec::with_capacity(syms.len());
    for sym in &syms {
        let name = strtab.at(sym.name as usize).unwrap_or_default().to_string();
        let value = if sym.is_undef() {
            if name.is_empty() {
                0
            } else {
                let found = task
                    .find_symbol(&name)
                    .ok_or_else(|| SymbolError::NotFound(name.clone()))?;
                let addr = symbols::runtime_addr(&task.vmas, found);
                debug!("resolved {} -> {:#x}", name, addr);
                addr
            }
        } else {
            match sym.shndx.get() {
                Some(section) => {
                    let sh = load
                        .file
                        .section_headers
                        .get(section)
                        .ok_or_else(|| SymbolError::NotFound(name.clone()))?;
                    base + sh.off.0 + sym.value.0
                }
                // SHN_ABS and friends keep their value
                None => sym.value.0,
            }
        };
        names.push(name);
        values.push(value);
    }
    Ok(ResolvedSyms {
        syms,
        names,
        values,
    })
}

/// Apply every RELA section of the object against the staged image.
///
/// The place of each relocation is `base + target section file offset +
/// r_offset`; the value computation is ISA-specific. Entries run in table
/// order within a section, sections in header order. Also pokes the
/// resolved replacement address into the image's metadata record.
pub fn apply_relocations(
    task: &mut Task,
    load: &LoadInfo,
    resolved: &ResolvedSyms,
) -> Result<(), PatchError> {
    let base = load.target_base.ok_or(PatchError::NotStaged)?;

    for (idx, sh) in load.file.section_headers.iter().enumerate() {
        if !sh.typ.is(KnownSectionType::Rela) {
            continue;
        }
        let target = load
            .file
            .section_headers
            .get(sh.info as usize)
            .filter(|t| t.typ.is(KnownSectionType::Progbits) && t.is_alloc());
        let target = match target {
            Some(t) => t,
            // debug info and friends don't exist in the image
            None => continue,
        };

        let relas = load.file.read_relas(&load.raw, idx)?;
        debug!(
            "section {:?}: {} relocations",
            load.file.section_name(sh).unwrap_or("?"),
            relas.len()
        );
        for rela in &relas {
            let s = *resolved.values.get(rela.sym as usize).ok_or_else(|| {
                PatchError::Meta(format!("relocation references symbol {} out of range", rela.sym))
            })?;
            let p = base + target.off.0 + rela.offset.0;
            let mut old = [0u8; 8];
            task.memcpy_from(p, &mut old)?;
            let bytes = arch::apply_relocation(rela.typ, s, rela.addend, p, &old)?;
            if !bytes.is_empty() {
                task.memcpy_to(p, &bytes)?;
            }
        }
    }

    // leave the resolved replacement address in the image's metadata
    if let Ok((_, replace_addr)) = resolved.replacement(&load.meta.target_func) {
        let info_sh = &load.file.section_headers[load.index.info];
        let slot = base + info_sh.off.0 + PatchMeta::REPLACE_ADDR_OFFSET as u64;
        task.memcpy_to(slot, &replace_addr.to_le_bytes())?;
    }
    Ok(())
}
