//! Shared helpers for the process-level tests
#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};

/// Fork a child that does nothing but `pause()`; the classic quiescent
/// ptrace target. The child must be reaped with [`reap`].
pub fn fork_sleeper() -> Pid {
    match unsafe { fork() }.expect("fork") {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            // only async-signal-safe calls from here on
            loop {
                unsafe { libc::pause() };
            }
        }
    }
}

pub fn reap(child: Pid) {
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
}

/// Whether this environment lets us ptrace at all; tests bail out politely
/// instead of failing on locked-down runners.
pub fn ptrace_allowed() -> bool {
    let scope = fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope")
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .unwrap_or(0);
    // scope 0/1 still allows tracing our own fork children
    scope <= 1 || nix::unistd::geteuid().is_root()
}

/// The single state of `/proc/<pid>/stat`, e.g. 'S' or 'R'
pub fn proc_state(pid: Pid) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // the comm field is parenthesized and may contain spaces
    let after = stat.rsplit(')').next()?;
    after.split_whitespace().next()?.chars().next()
}

pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("upatch-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[cfg(target_arch = "x86_64")]
mod arch_bits {
    /// `mov eax, 0xdead1234; ret`, padded; an 8-byte data slot follows
    pub const PATCH_TEXT: [u8; 16] = [
        0xb8, 0x34, 0x12, 0xad, 0xde, 0xc3, 0x90, 0x90, 0, 0, 0, 0, 0, 0, 0, 0,
    ];
    pub const ABS64_RELOC: u32 = 1; // R_X86_64_64
    pub const MACHINE: u16 = 0x3e;
}

#[cfg(target_arch = "aarch64")]
mod arch_bits {
    /// `movz w0, #0x1234; movk w0, #0xdead, lsl 16; ret`, padded
    pub const PATCH_TEXT: [u8; 16] = [
        0x80, 0x46, 0x82, 0x52, // movz
        0xa0, 0xd5, 0xbb, 0x72, // movk
        0xc0, 0x03, 0x5f, 0xd6, // ret
        0, 0, 0, 0,
    ];
    pub const ABS64_RELOC: u32 = 257; // R_AARCH64_ABS64
    pub const MACHINE: u16 = 0xb7;
}

/// The sentinel the patch body returns
pub const PATCH_SENTINEL: u32 = 0xdead_1234;
/// File offset of the relocated data slot inside .text, after the body
pub const SLOT_OFFSET: u64 = 16;

struct Section {
    name_off: u32,
    typ: u32,
    flags: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
    data: Vec<u8>,
}

/// Synthesize a relocatable patch object the loader accepts: a .text body
/// returning the sentinel, one ABS64 relocation against `extern_sym`, the
/// metadata record, and the section plumbing around them.
pub fn build_patch_object(target_func: &str, replacement: &str, extern_sym: &str) -> Vec<u8> {
    let mut text = Vec::new();
    text.extend_from_slice(&arch_bits::PATCH_TEXT);
    text.extend_from_slice(&[0u8; 8]); // slot filled by the relocation
    assert_eq!(text.len() as u64, SLOT_OFFSET + 8);

    // .strtab: \0 replacement \0 extern \0
    let mut strtab = vec![0u8];
    let replacement_off = strtab.len() as u32;
    strtab.extend_from_slice(replacement.as_bytes());
    strtab.push(0);
    let extern_off = strtab.len() as u32;
    strtab.extend_from_slice(extern_sym.as_bytes());
    strtab.push(0);

    // .symtab: null, replacement (GLOBAL FUNC in .text), extern (undef)
    let mut symtab = vec![0u8; 24];
    symtab.extend_from_slice(&sym_entry(replacement_off, 0x12, 1, 0, SLOT_OFFSET));
    symtab.extend_from_slice(&sym_entry(extern_off, 0x10, 0, 0, 0));

    // .rela.text: slot <- extern_sym + 0
    let mut rela = Vec::new();
    rela.extend_from_slice(&SLOT_OFFSET.to_le_bytes());
    rela.extend_from_slice(&arch_bits::ABS64_RELOC.to_le_bytes());
    rela.extend_from_slice(&2u32.to_le_bytes());
    rela.extend_from_slice(&0i64.to_le_bytes());

    // .upatch.info
    let mut info = Vec::new();
    info.extend_from_slice(&1u32.to_le_bytes()); // type
    info.extend_from_slice(&1u32.to_le_bytes()); // version
    info.extend_from_slice(&fixed64(target_func));
    info.extend_from_slice(&fixed64("upatch tests"));
    info.extend_from_slice(&0u64.to_le_bytes());

    let upatch_strtab = b"ulpatch\0".to_vec();

    // section name string table
    let names = [
        ".text",
        ".rela.text",
        ".symtab",
        ".strtab",
        ".upatch.info",
        ".upatch.strtab",
        ".shstrtab",
    ];
    let mut shstrtab = vec![0u8];
    let mut name_offs = Vec::new();
    for name in names {
        name_offs.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(name.as_bytes());
        shstrtab.push(0);
    }

    let sections = vec![
        Section {
            // SHT_NULL
            name_off: 0,
            typ: 0,
            flags: 0,
            link: 0,
            info: 0,
            align: 0,
            entsize: 0,
            data: Vec::new(),
        },
        Section {
            name_off: name_offs[0],
            typ: 1, // PROGBITS
            flags: 0x6, // ALLOC|EXECINSTR
            link: 0,
            info: 0,
            align: 16,
            entsize: 0,
            data: text,
        },
        Section {
            name_off: name_offs[1],
            typ: 4, // RELA
            flags: 0,
            link: 3, // .symtab
            info: 1, // .text
            align: 8,
            entsize: 24,
            data: rela,
        },
        Section {
            name_off: name_offs[2],
            typ: 2, // SYMTAB
            flags: 0,
            link: 4, // .strtab
            info: 1,
            align: 8,
            entsize: 24,
            data: symtab,
        },
        Section {
            name_off: name_offs[3],
            typ: 3, // STRTAB
            flags: 0,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
            data: strtab,
        },
        Section {
            name_off: name_offs[4],
            typ: 1,
            flags: 0,
            link: 0,
            info: 0,
            align: 8,
            entsize: 0,
            data: info,
        },
        Section {
            name_off: name_offs[5],
            typ: 3,
            flags: 0,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
            data: upatch_strtab,
        },
        Section {
            name_off: name_offs[6],
            typ: 3,
            flags: 0,
            link: 0,
            info: 0,
            align: 1,
            entsize: 0,
            data: shstrtab,
        },
    ];

    // lay the section datas out after the header
    let mut offsets = Vec::new();
    let mut cursor = 64u64;
    for section in &sections {
        let align = section.align.max(1);
        cursor = (cursor + align - 1) & !(align - 1);
        offsets.push(cursor);
        cursor += section.data.len() as u64;
    }
    let shoff = (cursor + 7) & !7;

    let mut out = Vec::new();
    // ehdr
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&1u16.to_le_bytes()); // ET_REL
    out.extend_from_slice(&arch_bits::MACHINE.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // entry
    out.extend_from_slice(&0u64.to_le_bytes()); // phoff
    out.extend_from_slice(&shoff.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // phentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // phnum
    out.extend_from_slice(&64u16.to_le_bytes()); // shentsize
    out.extend_from_slice(&(sections.len() as u16).to_le_bytes());
    out.extend_from_slice(&7u16.to_le_bytes()); // shstrndx

    // section datas
    for (section, &off) in sections.iter().zip(&offsets) {
        while (out.len() as u64) < off {
            out.push(0);
        }
        out.extend_from_slice(&section.data);
    }

    // section header table
    while (out.len() as u64) < shoff {
        out.push(0);
    }
    for (section, &off) in sections.iter().zip(&offsets) {
        out.extend_from_slice(&section.name_off.to_le_bytes());
        out.extend_from_slice(&section.typ.to_le_bytes());
        out.extend_from_slice(&section.flags.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // addr
        let off = if section.typ == 0 { 0 } else { off };
        out.extend_from_slice(&off.to_le_bytes());
        out.extend_from_slice(&(section.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&section.link.to_le_bytes());
        out.extend_from_slice(&section.info.to_le_bytes());
        out.extend_from_slice(&section.align.to_le_bytes());
        out.extend_from_slice(&section.entsize.to_le_bytes());
    }
    out
}

fn sym_entry(name: u32, info: u8, shndx: u16, value: u64, size: u64) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[..4].copy_from_slice(&name.to_le_bytes());
    out[4] = info;
    out[6..8].copy_from_slice(&shndx.to_le_bytes());
    out[8..16].copy_from_slice(&value.to_le_bytes());
    out[16..24].copy_from_slice(&size.to_le_bytes());
    out
}

fn fixed64(s: &str) -> [u8; 64] {
    let mut out = [0u8; 64];
    let n = s.len().min(63);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}
