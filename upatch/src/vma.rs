//! The target's address-space model: `/proc/<pid>/maps` parsed, classified,
//! and indexed.
//!
//! VMAs live in a flat arena in maps order; the ordered lookup index and the
//! leader links are indices into it, never pointers. Rebuilding after a
//! remote mmap/munmap replaces the whole arena.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{debug, warn};
use upelf::components::segment::{KnownSegmentType, ProgramHeader};
use upelf::{ElfType, Header};

use crate::errors::TaskError;
use crate::memory::TargetMem;

pub type VmaIndex = usize;

/// What a mapping is, judged from its backing name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    SelfExe,
    Libc,
    LibElf,
    Heap,
    Ld,
    Stack,
    Vvar,
    Vdso,
    Vsyscall,
    LibUnknown,
    Anon,
    None,
}

impl VmaKind {
    pub fn name(self) -> &'static str {
        match self {
            VmaKind::SelfExe => "Self",
            VmaKind::Libc => "libc",
            VmaKind::LibElf => "libelf",
            VmaKind::Heap => "heap",
            VmaKind::Ld => "ld",
            VmaKind::Stack => "stack",
            VmaKind::Vvar => "vvar",
            VmaKind::Vdso => "vdso",
            VmaKind::Vsyscall => "vsyscall",
            VmaKind::LibUnknown => "lib?",
            VmaKind::Anon => "anon",
            VmaKind::None => "unknown",
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Classify a mapping by its backing-file name
pub fn classify(exe: &str, name: &str) -> VmaKind {
    let base = basename(name);
    if name == exe {
        VmaKind::SelfExe
    } else if base.starts_with("libc") || base.starts_with("libssp") {
        VmaKind::Libc
    } else if base.starts_with("libelf") {
        VmaKind::LibElf
    } else if name == "[heap]" {
        VmaKind::Heap
    } else if base.starts_with("ld-linux") {
        VmaKind::Ld
    } else if name == "[stack]" {
        VmaKind::Stack
    } else if name == "[vvar]" || name == "[vvar_vclock]" {
        VmaKind::Vvar
    } else if name == "[vdso]" {
        VmaKind::Vdso
    } else if name == "[vsyscall]" {
        VmaKind::Vsyscall
    } else if base.starts_with("lib") {
        VmaKind::LibUnknown
    } else if name.is_empty() {
        VmaKind::Anon
    } else {
        VmaKind::None
    }
}

/// The parsed header and program headers of an ELF image found in a mapping
#[derive(Debug, Clone)]
pub struct VmaElf {
    pub header: Header,
    pub phdrs: Vec<ProgramHeader>,
    /// `vma.start - min(PT_LOAD p_vaddr)`
    pub load_offset: u64,
}

/// One `[start, end)` mapping of the target
#[derive(Debug, Clone)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub prot: i32,
    pub offset: u64,
    /// `p_vaddr` of the PT_LOAD this mapping belongs to, once known
    pub voffset: u64,
    pub maj: u32,
    pub min: u32,
    pub inode: u64,
    pub name: String,
    pub kind: VmaKind,
    /// First mapping of the group sharing this backing file
    pub leader: VmaIndex,
    pub elf: Option<VmaElf>,
    pub is_shared_lib: bool,
}

impl Vma {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_exec(&self) -> bool {
        self.prot & libc::PROT_EXEC != 0
    }
}

fn perms_to_prot(perms: &str) -> i32 {
    let mut prot = 0;
    let b = perms.as_bytes();
    if b.first() == Some(&b'r') {
        prot |= libc::PROT_READ;
    }
    if b.get(1) == Some(&b'w') {
        prot |= libc::PROT_WRITE;
    }
    if b.get(2) == Some(&b'x') {
        prot |= libc::PROT_EXEC;
    }
    // the p/s flag is irrelevant here
    prot
}

fn split_field(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Parse one line of `/proc/<pid>/maps`
///
/// The fields follow the kernel's
/// `%lx-%lx %4s %lx %x:%x %d %s` layout; the name column may be absent.
pub fn parse_maps_line(line: &str) -> Result<Vma, String> {
    let (range, rest) = split_field(line);
    let (perms, rest) = split_field(rest);
    let (offset, rest) = split_field(rest);
    let (dev, rest) = split_field(rest);
    let (inode, rest) = split_field(rest);
    let name = rest.trim();

    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| format!("bad range {:?}", range))?;
    let start = u64::from_str_radix(start, 16).map_err(|e| e.to_string())?;
    let end = u64::from_str_radix(end, 16).map_err(|e| e.to_string())?;
    let offset = u64::from_str_radix(offset, 16).map_err(|e| e.to_string())?;
    let (maj, min) = dev
        .split_once(':')
        .ok_or_else(|| format!("bad device {:?}", dev))?;
    let maj = u32::from_str_radix(maj, 16).map_err(|e| e.to_string())?;
    let min = u32::from_str_radix(min, 16).map_err(|e| e.to_string())?;
    let inode: u64 = inode.parse().map_err(|_| format!("bad inode {:?}", inode))?;

    if perms.len() < 4 {
        return Err(format!("bad perms {:?}", perms));
    }

    Ok(Vma {
        start,
        end,
        perms: perms.to_string(),
        prot: perms_to_prot(perms),
        offset,
        voffset: 0,
        maj,
        min,
        inode,
        name: name.to_string(),
        kind: VmaKind::None,
        leader: 0,
        elf: None,
        is_shared_lib: false,
    })
}

/// The whole address-space model of one target
#[derive(Debug, Default)]
pub struct VmaSet {
    vmas: Vec<Vma>,
    by_start: BTreeMap<u64, VmaIndex>,
    /// First executable libc mapping, the syscall splice site
    pub libc: Option<VmaIndex>,
    pub stack: Option<VmaIndex>,
}

impl VmaSet {
    /// Parse `/proc/<pid>/maps` into a fresh set
    pub fn read(pid: i32, exe: &str) -> Result<Self, TaskError> {
        let path = PathBuf::from(format!("/proc/{}/maps", pid));
        let text =
            std::fs::read_to_string(&path).map_err(|e| TaskError::Io(path.clone(), e))?;

        let mut set = Self::default();
        for line in text.lines() {
            let mut vma =
                parse_maps_line(line).map_err(|e| TaskError::ProcParse(path.clone(), e))?;
            vma.kind = classify(exe, &vma.name);

            let idx = set.vmas.len();
            vma.leader = match set.vmas.last() {
                // mappings of one backing file appear consecutively
                Some(prev) if prev.name == vma.name => prev.leader,
                _ => idx,
            };

            if set.libc.is_none() && vma.kind == VmaKind::Libc && vma.is_exec() {
                set.libc = Some(idx);
            }
            if set.stack.is_none() && vma.kind == VmaKind::Stack {
                set.stack = Some(idx);
            }

            set.by_start.insert(vma.start, idx);
            set.vmas.push(vma);
        }
        debug!("pid {}: {} mappings", pid, set.vmas.len());
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    pub fn get(&self, idx: VmaIndex) -> &Vma {
        &self.vmas[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (VmaIndex, &Vma)> {
        self.vmas.iter().enumerate()
    }

    /// The mapping covering `addr`, if any
    pub fn find(&self, addr: u64) -> Option<VmaIndex> {
        let (_, &idx) = self.by_start.range(..=addr).next_back()?;
        self.vmas[idx].contains(addr).then_some(idx)
    }

    /// First inter-VMA gap able to hold `size` bytes
    pub fn find_span(&self, size: u64) -> Option<u64> {
        self.span_list(size).into_iter().next()
    }

    /// Gap start addresses with room for `size` bytes, in address order
    pub fn span_list(&self, size: u64) -> Vec<u64> {
        let indices: Vec<VmaIndex> = self.by_start.values().copied().collect();
        indices
            .windows(2)
            .filter_map(|w| {
                let cur = &self.vmas[w[0]];
                let next = &self.vmas[w[1]];
                (next.start.saturating_sub(cur.end) >= size).then_some(cur.end)
            })
            .collect()
    }

    /// Members of a leader's group, in maps (address) order
    pub fn group(&self, leader: VmaIndex) -> impl Iterator<Item = (VmaIndex, &Vma)> {
        self.vmas
            .iter()
            .enumerate()
            .filter(move |(_, v)| v.leader == leader)
    }

    /// Lazily attach ELF information to a mapping whose first page carries
    /// an ELF header. Quietly does nothing for mappings that cannot or need
    /// not be peeked.
    pub fn peek_elf(&mut self, idx: VmaIndex, mem: &TargetMem) -> Result<(), TaskError> {
        {
            let vma = &self.vmas[idx];
            match vma.kind {
                VmaKind::Vvar | VmaKind::Stack | VmaKind::Vsyscall => return Ok(()),
                _ => {}
            }
            if vma.elf.is_some() {
                return Ok(());
            }
        }

        let start = self.vmas[idx].start;
        let mut raw = [0u8; Header::SIZE];
        if mem.read(start, &mut raw).is_err() {
            // unreadable first page (PROT_NONE guard, device mapping)
            return Ok(());
        }
        let header = match Header::parse(&raw) {
            Ok((_, h)) => h,
            Err(_) => return Ok(()),
        };

        if header.ph_count == 0 {
            // e.g. the ld.so magic-only stub some distros map
            warn!("{}: ELF magic but no phdrs, skipped", self.vmas[idx].name);
            return Ok(());
        }

        let table = mem.read_vec(
            start + header.ph_offset.0,
            header.ph_count * ProgramHeader::SIZE,
        )?;
        let mut phdrs = Vec::with_capacity(header.ph_count);
        for chunk in table.chunks_exact(ProgramHeader::SIZE) {
            match ProgramHeader::parse(chunk) {
                Ok((_, ph)) => phdrs.push(ph),
                Err(_) => {
                    warn!("{}: bad program header, skipped", self.vmas[idx].name);
                    return Ok(());
                }
            }
        }

        let lowest = phdrs
            .iter()
            .filter(|ph| ph.typ.is(KnownSegmentType::Load))
            .map(|ph| ph.vaddr.0)
            .min();
        let lowest = match lowest {
            Some(v) => v,
            None => {
                warn!("{}: no PT_LOAD, skipped", self.vmas[idx].name);
                return Ok(());
            }
        };

        let is_shared_lib = {
            let vma = &self.vmas[idx];
            let mut shared = header.typ == ElfType::Dyn;
            if shared {
                // A PT_INTERP marks a position-independent executable, not a
                // library; libc and friends are the historical exception.
                let has_interp = phdrs.iter().any(|ph| ph.typ.is(KnownSegmentType::Interp));
                if has_interp && !interp_exception(&vma.name) {
                    shared = false;
                }
            }
            shared || matches!(vma.kind, VmaKind::Libc | VmaKind::LibUnknown)
        };

        // pin each group member to its PT_LOAD
        let leader = self.vmas[idx].leader;
        for ph in phdrs.iter().filter(|ph| ph.typ.is(KnownSegmentType::Load)) {
            let aligned = ph.vaddr.align_down(ph.align).0;
            let vaddr = ph.vaddr.0;
            for member in self
                .vmas
                .iter_mut()
                .filter(|v| v.leader == leader && v.offset == aligned)
            {
                member.voffset = vaddr;
            }
        }

        let vma = &mut self.vmas[idx];
        vma.is_shared_lib = is_shared_lib;
        vma.elf = Some(VmaElf {
            load_offset: start - lowest,
            header,
            phdrs,
        });
        debug!(
            "{}: ELF at {:#x}, load_offset {:#x}, shared={}",
            vma.name,
            start,
            vma.elf.as_ref().map(|e| e.load_offset).unwrap_or(0),
            is_shared_lib
        );
        Ok(())
    }
}

fn interp_exception(name: &str) -> bool {
    let base = basename(name);
    (base.starts_with("libc") && base.contains(".so"))
        || base.starts_with("libssp")
        || (base.starts_with("libpthread") && base.contains(".so"))
        || (base.starts_with("libdl") && base.contains(".so"))
}
