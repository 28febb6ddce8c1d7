//! Poking the branch: direct jumps, far-jump trampolines, and the patch
//! lifecycle state machine

use std::mem;

use log::{debug, info, warn};
use nix::unistd::getpid;

use super::info::{parse_load_info, LoadInfo};
use super::loader::{apply_relocations, resolve_symbols, stage};
use crate::arch::native as arch;
use crate::errors::PatchError;
use crate::memory::page_size;
use crate::registry::InstallMeta;
use crate::symbols;
use crate::task::Task;

/// Where a far-jump table entry was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    pub addr: u64,
    pub len: usize,
}

/// What one installed branch needs for reversal
#[derive(Debug, Clone)]
pub struct InstallRecord {
    pub call_site: u64,
    pub original: Vec<u8>,
    pub trampoline: Option<Trampoline>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unloaded,
    Parsed,
    Staged,
    Relocated,
    Active,
}

/// One patch through its lifecycle
#[derive(Debug)]
pub struct Patch {
    pub info: LoadInfo,
    pub state: PatchState,
    pub installs: Vec<InstallRecord>,
}

/// Redirect `call_site` to `dst`, directly when the branch reaches, through
/// a freshly placed jump-table entry otherwise.
///
/// Note on threads: only the group leader is stopped. A sibling thread
/// mid-prologue can observe a torn multi-byte write on x86-64; aarch64's
/// single aligned word is atomic. Seizing every tid is left to callers that
/// need it.
pub fn install_branch(
    task: &mut Task,
    call_site: u64,
    dst: u64,
) -> Result<InstallRecord, PatchError> {
    let mut original = vec![0u8; arch::MCOUNT_INSN_SIZE];
    task.memcpy_from(call_site, &mut original)?;

    let (branch_dst, trampoline) = if arch::branch_reachable(call_site, dst) {
        (dst, None)
    } else {
        let tramp = place_trampoline(task, call_site, dst)?;
        (tramp.addr, Some(tramp))
    };

    let insn = arch::encode_jmp(call_site, branch_dst)?;
    task.memcpy_to(call_site, &insn)?;
    debug!(
        "branch at {:#x} -> {:#x}{}",
        call_site,
        dst,
        if trampoline.is_some() { " (via trampoline)" } else { "" }
    );
    Ok(InstallRecord {
        call_site,
        original,
        trampoline,
    })
}

/// Put a jump-table entry in a gap the call site can reach.
///
/// The span comes from the address-space model; a page is mapped over it
/// (remotely for an attached target, locally when the target is this very
/// process, which cannot ptrace itself) and the entry is poked in.
fn place_trampoline(task: &mut Task, call_site: u64, dst: u64) -> Result<Trampoline, PatchError> {
    let page = page_size();
    let span = task
        .vmas
        .span_list(page)
        .into_iter()
        .find(|&gap| arch::branch_reachable(call_site, gap))
        .ok_or(PatchError::NoSpan(page as usize))?;

    let span = if task.pid == getpid() {
        let alloc = region::alloc_at(
            span as usize as *const u8,
            page as usize,
            region::Protection::READ_WRITE_EXECUTE,
        )?;
        // the allocator may have settled elsewhere; what matters is that
        // the call site reaches wherever the page actually is
        let actual = alloc.as_ptr::<u8>() as u64;
        if !arch::branch_reachable(call_site, actual) {
            return Err(PatchError::NoSpan(page as usize));
        }
        // the page must outlive us; it belongs to the patch now
        mem::forget(alloc);
        actual
    } else {
        task.remote_mmap(
            span,
            page as usize,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )?;
        task.remote_set_vma_name(span, page as usize, "ulpatch-jmp");
        span
    };

    let entry = arch::encode_jump_table_entry(dst);
    task.memcpy_to(span, &entry)?;
    task.update_vmas()?;
    debug!("trampoline at {:#x} -> {:#x}", span, dst);
    Ok(Trampoline {
        addr: span,
        len: entry.len(),
    })
}

/// Put the original bytes back and zero any trampoline entry
pub fn remove_install(task: &mut Task, record: &InstallRecord) -> Result<(), PatchError> {
    task.memcpy_to(record.call_site, &record.original)?;
    if let Some(tramp) = record.trampoline {
        task.memcpy_to(tramp.addr, &vec![0u8; tramp.len])?;
    }
    Ok(())
}

/// Load, stage, link, and activate a patch in the target.
///
/// Every failure unwinds to `Unloaded`: nothing staged survives a
/// relocation error, and a failed install restores any site already poked
/// in reverse order before the image goes away.
pub fn init_patch(task: &mut Task, obj: &std::path::Path) -> Result<Patch, PatchError> {
    let mut load = parse_load_info(obj)?;

    stage(task, &mut load)?;
    let mut patch = Patch {
        info: load,
        state: PatchState::Staged,
        installs: Vec::new(),
    };

    let link = resolve_symbols(task, &patch.info)
        .and_then(|resolved| {
            apply_relocations(task, &patch.info, &resolved)?;
            Ok(resolved)
        });
    let resolved = match link {
        Ok(resolved) => resolved,
        Err(e) => {
            unstage(task, &mut patch);
            return Err(e);
        }
    };
    patch.state = PatchState::Relocated;

    let installed = (|| {
        let target_func = patch.info.meta.target_func.clone();
        let symbol = task
            .find_symbol(&target_func)
            .ok_or_else(|| crate::errors::SymbolError::NotFound(target_func.clone()))?;
        if symbol.sym.size > 0 && (symbol.sym.size as usize) < arch::MCOUNT_INSN_SIZE {
            return Err(PatchError::FunctionTooSmall(target_func, symbol.sym.size));
        }
        let call_site = symbols::runtime_addr(&task.vmas, symbol);
        let (_, dst) = resolved.replacement(&target_func)?;
        install_branch(task, call_site, dst)
    })();

    match installed {
        Ok(record) => {
            patch.installs.push(record);
            patch.state = PatchState::Active;
        }
        Err(e) => {
            for record in patch.installs.iter().rev() {
                if let Err(restore) = remove_install(task, record) {
                    warn!("restore of {:#x} failed: {}", record.call_site, restore);
                }
            }
            patch.installs.clear();
            unstage(task, &mut patch);
            return Err(e);
        }
    }

    store_meta(task, &patch);
    info!(
        "patched {} in pid {} with {}",
        patch.info.meta.target_func,
        task.pid,
        patch.info.path.display()
    );
    Ok(patch)
}

/// Deactivate a live patch: restore every call site in reverse order, zero
/// trampolines, unmap the image, and drop the registry entry.
pub fn delete_patch(task: &mut Task, patch: &mut Patch) -> Result<(), PatchError> {
    for record in patch.installs.iter().rev() {
        remove_install(task, record)?;
    }
    patch.installs.clear();
    unstage(task, patch);
    patch.state = PatchState::Unloaded;
    info!("removed patch {}", patch.info.path.display());
    Ok(())
}

fn unstage(task: &mut Task, patch: &mut Patch) {
    if let Some(base) = patch.info.target_base.take() {
        if let Err(e) = task.remote_munmap(base, patch.info.raw.len()) {
            warn!("munmap of patch image at {:#x}: {}", base, e);
        }
        if let Err(e) = task.update_vmas() {
            warn!("maps refresh after unstage: {}", e);
        }
    }
    if let Some(staged) = patch.info.staged_path.take() {
        if let Some(registry) = task.registry.as_ref() {
            if let Err(e) = registry.remove(&staged) {
                warn!("registry cleanup of {}: {}", staged.display(), e);
            }
        }
    }
    patch.state = PatchState::Unloaded;
}

fn store_meta(task: &Task, patch: &Patch) {
    let (registry, staged) = match (task.registry.as_ref(), patch.info.staged_path.as_deref()) {
        (Some(r), Some(s)) => (r, s),
        _ => return,
    };
    let record = match patch.installs.first() {
        Some(r) => r,
        None => return,
    };
    let meta = InstallMeta {
        image_base: patch.info.target_base.unwrap_or(0),
        image_len: patch.info.raw.len(),
        call_site: record.call_site,
        original: record.original.clone(),
        trampoline: record.trampoline.map(|t| (t.addr, t.len)),
    };
    if let Err(e) = registry.store_meta(staged, &meta) {
        warn!("meta sidecar for {}: {}", staged.display(), e);
    }
}

/// Reverse an install recorded by an earlier run, using the registry
/// sidecar: restore the site, zero the trampoline, unmap the image, remove
/// the files.
pub fn delete_patch_from_meta(
    task: &mut Task,
    staged: &std::path::Path,
) -> Result<(), PatchError> {
    let meta = crate::registry::Registry::load_meta(staged)
        .map_err(|e| PatchError::Io(staged.into(), e))?;

    task.memcpy_to(meta.call_site, &meta.original)?;
    if let Some((addr, len)) = meta.trampoline {
        task.memcpy_to(addr, &vec![0u8; len])?;
    }
    task.remote_munmap(meta.image_base, meta.image_len)?;
    task.update_vmas()?;
    if let Some(registry) = task.registry.as_ref() {
        registry
            .remove(staged)
            .map_err(|e| PatchError::Io(staged.into(), e))?;
    }
    info!("reversed {} from its registry record", staged.display());
    Ok(())
}
