//! aarch64: branch encodings, relocation fixups, register plumbing

use std::convert::TryFrom;
use std::io;

use derive_try_from_primitive::TryFromPrimitive;
use libc::{c_void, iovec, user_regs_struct};
use nix::errno::Errno;
use nix::unistd::Pid;

use super::EncodeError;
use crate::errors::RelocationError;

/// Call-site replacement size: every A64 instruction is four bytes
pub const MCOUNT_INSN_SIZE: usize = 4;

/// `svc #0`
pub const SYSCALL_INSN: [u8; 4] = [0x01, 0x00, 0x00, 0xd4];

/// Size of one far-jump table entry
pub const JMP_TABLE_ENTRY_SIZE: usize = 16;

const BL_OPCODE: u32 = 0x9400_0000;
const B_OPCODE: u32 = 0x1400_0000;
const NOP: u32 = 0xd503_201f;
/// `ldr x16, .+8`: loads the destination stored right after the pair
const LDR_X16_LIT8: u32 = 0x5800_0050;
/// `br x16`
const BR_X16: u32 = 0xd61f_0200;

fn imm26(ip: u64, dst: u64) -> Result<u32, EncodeError> {
    if ip % 4 != 0 {
        return Err(EncodeError::Unaligned(ip));
    }
    if dst % 4 != 0 {
        return Err(EncodeError::Unaligned(dst));
    }
    let disp = (dst as i64).wrapping_sub(ip as i64);
    // imm26 covers +/-128 MiB
    if !(-(1 << 27)..(1 << 27)).contains(&disp) {
        return Err(EncodeError::OutOfRange { ip, dst });
    }
    Ok(((disp >> 2) as u32) & 0x03ff_ffff)
}

/// Whether a `b`/`bl` at `ip` can reach `dst`
pub fn branch_reachable(ip: u64, dst: u64) -> bool {
    imm26(ip, dst).is_ok()
}

/// `bl` from `ip` to `dst`
pub fn encode_call(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    Ok((BL_OPCODE | imm26(ip, dst)?).to_le_bytes())
}

/// `b` from `ip` to `dst`
pub fn encode_jmp(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    Ok((B_OPCODE | imm26(ip, dst)?).to_le_bytes())
}

/// A call-site-sized no-op for quiescing a patched site
pub fn encode_nop() -> [u8; MCOUNT_INSN_SIZE] {
    NOP.to_le_bytes()
}

/// A self-contained, position-independent jump to an absolute 64-bit
/// destination: `ldr x16, .+8; br x16; .quad dst`.
pub fn encode_jump_table_entry(dst: u64) -> [u8; JMP_TABLE_ENTRY_SIZE] {
    let mut entry = [0u8; JMP_TABLE_ENTRY_SIZE];
    entry[..4].copy_from_slice(&LDR_X16_LIT8.to_le_bytes());
    entry[4..8].copy_from_slice(&BR_X16.to_le_bytes());
    entry[8..].copy_from_slice(&dst.to_le_bytes());
    entry
}

/// The relocation forms a patch object may carry
#[derive(Debug, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RelocationType {
    Abs64 = 257,
    AdrPrelPgHi21 = 275,
    AddAbsLo12Nc = 277,
    Jump26 = 282,
    Call26 = 283,
}

/// Compute the bytes a relocation writes at `p`, given the resolved symbol
/// value `s` and addend `a`. Instruction fixups splice their immediate into
/// the existing opcode read from `old`.
pub fn apply_relocation(
    typ: u32,
    s: u64,
    a: i64,
    p: u64,
    old: &[u8],
) -> Result<Vec<u8>, RelocationError> {
    let kind = RelocationType::try_from(typ).map_err(|_| RelocationError::Unsupported(typ))?;
    let value = (s as i64).wrapping_add(a);
    let overflow = |v: i64| RelocationError::Overflow {
        typ,
        loc: p,
        value: v as u64,
    };
    let old_insn = |old: &[u8]| -> Result<u32, RelocationError> {
        old.get(..4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .ok_or(overflow(0))
    };
    match kind {
        RelocationType::Abs64 => Ok((value as u64).to_le_bytes().to_vec()),
        RelocationType::Call26 | RelocationType::Jump26 => {
            let disp = value.wrapping_sub(p as i64);
            if !(-(1 << 27)..(1 << 27)).contains(&disp) {
                return Err(overflow(value));
            }
            let insn = old_insn(old)? & !0x03ff_ffff;
            let insn = insn | (((disp >> 2) as u32) & 0x03ff_ffff);
            Ok(insn.to_le_bytes().to_vec())
        }
        RelocationType::AdrPrelPgHi21 => {
            // page delta between the symbol and the place, split into
            // ADRP's immlo (bits 29-30) and immhi (bits 5-23)
            let delta = ((value as u64 & !0xfff) as i64).wrapping_sub((p & !0xfff) as i64) >> 12;
            if !(-(1 << 20)..(1 << 20)).contains(&delta) {
                return Err(overflow(value));
            }
            let imm = delta as u32;
            let insn = (old_insn(old)? & !((0x3 << 29) | (0x7ffff << 5)))
                | ((imm & 0x3) << 29)
                | (((imm >> 2) & 0x7ffff) << 5);
            Ok(insn.to_le_bytes().to_vec())
        }
        RelocationType::AddAbsLo12Nc => {
            let imm = (value as u64 & 0xfff) as u32;
            let insn = (old_insn(old)? & !(0xfff << 10)) | (imm << 10);
            Ok(insn.to_le_bytes().to_vec())
        }
    }
}

const NT_PRSTATUS: libc::c_int = 1;

/// The general-purpose register file
pub type Regs = user_regs_struct;

pub fn read_gprs(pid: Pid) -> Result<Regs, nix::Error> {
    let mut regs: Regs = unsafe { std::mem::zeroed() };
    let mut iov = iovec {
        iov_base: &mut regs as *mut _ as *mut c_void,
        iov_len: std::mem::size_of::<Regs>(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as usize as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(Errno::from_raw(
            io::Error::last_os_error().raw_os_error().unwrap_or(0),
        ));
    }
    Ok(regs)
}

pub fn write_gprs(pid: Pid, regs: &Regs) -> Result<(), nix::Error> {
    let mut copy = *regs;
    let mut iov = iovec {
        iov_base: &mut copy as *mut _ as *mut c_void,
        iov_len: std::mem::size_of::<Regs>(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as usize as *mut c_void,
            &mut iov as *mut _ as *mut c_void,
        )
    };
    if ret == -1 {
        return Err(Errno::from_raw(
            io::Error::last_os_error().raw_os_error().unwrap_or(0),
        ));
    }
    Ok(())
}

pub fn instruction_pointer(regs: &Regs) -> u64 {
    regs.pc
}

pub fn set_instruction_pointer(regs: &mut Regs, ip: u64) {
    regs.pc = ip;
}

/// The syscall return value register
pub fn return_value(regs: &Regs) -> u64 {
    regs.regs[0]
}

/// Load the syscall number and arguments per the kernel ABI
pub fn prepare_syscall(regs: &mut Regs, nr: u64, args: [u64; 6]) {
    regs.regs[8] = nr;
    regs.regs[..6].copy_from_slice(&args);
}
