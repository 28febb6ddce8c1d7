//! x86-64: branch encodings, relocation fixups, register plumbing

use std::convert::TryFrom;

use derive_try_from_primitive::TryFromPrimitive;
use libc::user_regs_struct;
use nix::sys::ptrace;
use nix::unistd::Pid;

use super::EncodeError;
use crate::errors::RelocationError;

/// Call-site replacement size: `call`/`jmp rel32` are five bytes
pub const MCOUNT_INSN_SIZE: usize = 5;

/// `syscall`
pub const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

/// Size of one far-jump table entry
pub const JMP_TABLE_ENTRY_SIZE: usize = 16;

const CALL_REL_OPCODE: u8 = 0xe8;
const JMP_REL_OPCODE: u8 = 0xe9;
/// `jmp *0(%rip)`: lands on the absolute destination stored right after
const JMP_INDIRECT: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];
/// Recommended five-byte `nopl 0(%rax,%rax,1)`
const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

fn rel32(ip: u64, dst: u64) -> Result<i32, EncodeError> {
    let disp = (dst as i64).wrapping_sub((ip as i64).wrapping_add(MCOUNT_INSN_SIZE as i64));
    i32::try_from(disp).map_err(|_| EncodeError::OutOfRange { ip, dst })
}

/// Whether a rel32 branch at `ip` can reach `dst`
pub fn branch_reachable(ip: u64, dst: u64) -> bool {
    rel32(ip, dst).is_ok()
}

/// `call rel32` from `ip` to `dst`
pub fn encode_call(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    let disp = rel32(ip, dst)?.to_le_bytes();
    Ok([CALL_REL_OPCODE, disp[0], disp[1], disp[2], disp[3]])
}

/// `jmp rel32` from `ip` to `dst`
pub fn encode_jmp(ip: u64, dst: u64) -> Result<[u8; MCOUNT_INSN_SIZE], EncodeError> {
    let disp = rel32(ip, dst)?.to_le_bytes();
    Ok([JMP_REL_OPCODE, disp[0], disp[1], disp[2], disp[3]])
}

/// A call-site-sized no-op for quiescing a patched site
pub fn encode_nop() -> [u8; MCOUNT_INSN_SIZE] {
    NOP5
}

/// A self-contained, position-independent jump to an absolute 64-bit
/// destination: `jmp *0(%rip)` followed by the destination, NOP-padded.
pub fn encode_jump_table_entry(dst: u64) -> [u8; JMP_TABLE_ENTRY_SIZE] {
    let mut entry = [0x90u8; JMP_TABLE_ENTRY_SIZE];
    entry[..6].copy_from_slice(&JMP_INDIRECT);
    entry[6..14].copy_from_slice(&dst.to_le_bytes());
    entry
}

/// The relocation forms a patch object may carry
#[derive(Debug, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RelocationType {
    None = 0,
    Abs64 = 1,
    Pc32 = 2,
    Plt32 = 4,
    Abs32 = 10,
    Abs32S = 11,
}

/// Compute the bytes a relocation writes at `p`, given the resolved symbol
/// value `s` and addend `a`. `_old` is unused here: every supported x86-64
/// form overwrites its slot completely.
pub fn apply_relocation(
    typ: u32,
    s: u64,
    a: i64,
    p: u64,
    _old: &[u8],
) -> Result<Vec<u8>, RelocationError> {
    let kind = RelocationType::try_from(typ).map_err(|_| RelocationError::Unsupported(typ))?;
    let value = (s as i64).wrapping_add(a);
    match kind {
        RelocationType::None => Ok(Vec::new()),
        RelocationType::Abs64 => Ok((value as u64).to_le_bytes().to_vec()),
        RelocationType::Pc32 | RelocationType::Plt32 => {
            let disp = value.wrapping_sub(p as i64);
            let disp = i32::try_from(disp).map_err(|_| RelocationError::Overflow {
                typ,
                loc: p,
                value: value as u64,
            })?;
            Ok(disp.to_le_bytes().to_vec())
        }
        RelocationType::Abs32 => {
            let v = u32::try_from(value).map_err(|_| RelocationError::Overflow {
                typ,
                loc: p,
                value: value as u64,
            })?;
            Ok(v.to_le_bytes().to_vec())
        }
        RelocationType::Abs32S => {
            let v = i32::try_from(value).map_err(|_| RelocationError::Overflow {
                typ,
                loc: p,
                value: value as u64,
            })?;
            Ok(v.to_le_bytes().to_vec())
        }
    }
}

/// The general-purpose register file
pub type Regs = user_regs_struct;

pub fn read_gprs(pid: Pid) -> Result<Regs, nix::Error> {
    ptrace::getregs(pid)
}

pub fn write_gprs(pid: Pid, regs: &Regs) -> Result<(), nix::Error> {
    ptrace::setregs(pid, *regs)
}

pub fn instruction_pointer(regs: &Regs) -> u64 {
    regs.rip
}

pub fn set_instruction_pointer(regs: &mut Regs, ip: u64) {
    regs.rip = ip;
}

/// The syscall return value register
pub fn return_value(regs: &Regs) -> u64 {
    regs.rax
}

/// Load the syscall number and arguments per the kernel ABI
pub fn prepare_syscall(regs: &mut Regs, nr: u64, args: [u64; 6]) {
    regs.rax = nr;
    regs.rdi = args[0];
    regs.rsi = args[1];
    regs.rdx = args[2];
    regs.r10 = args[3];
    regs.r8 = args[4];
    regs.r9 = args[5];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_encoding() {
        // call to the next instruction: rel32 == 0
        let insn = encode_call(0x1000, 0x1005).unwrap();
        assert_eq!(insn, [0xe8, 0, 0, 0, 0]);

        // backwards branch
        let insn = encode_jmp(0x2000, 0x1000).unwrap();
        assert_eq!(insn[0], 0xe9);
        assert_eq!(i32::from_le_bytes(insn[1..].try_into().unwrap()), -0x1005);
    }

    #[test]
    fn call_out_of_range() {
        assert_eq!(
            encode_call(0x1000, 0x1_0000_2000),
            Err(EncodeError::OutOfRange {
                ip: 0x1000,
                dst: 0x1_0000_2000
            })
        );
        assert!(branch_reachable(0x1000, 0x7fff_0000));
        assert!(!branch_reachable(0x1000, 0x2_0000_0000));
    }

    #[test]
    fn jump_table_entry_layout() {
        let entry = encode_jump_table_entry(0x1122_3344_5566_7788);
        assert_eq!(&entry[..6], &[0xff, 0x25, 0, 0, 0, 0]);
        assert_eq!(
            u64::from_le_bytes(entry[6..14].try_into().unwrap()),
            0x1122_3344_5566_7788
        );
        assert_eq!(&entry[14..], &[0x90, 0x90]);
    }

    #[test]
    fn relocation_forms() {
        // PC32: S + A - P
        let bytes = apply_relocation(2, 0x5000, -4, 0x4000, &[]).unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 0xffc);

        // 64-bit absolute
        let bytes = apply_relocation(1, 0xdead_beef_0000, 8, 0, &[]).unwrap();
        assert_eq!(
            u64::from_le_bytes(bytes.try_into().unwrap()),
            0xdead_beef_0008
        );

        // PC32 overflow is fatal
        assert!(matches!(
            apply_relocation(2, 0x7fff_ffff_f000, 0, 0x1000, &[]),
            Err(RelocationError::Overflow { .. })
        ));

        // unknown type is fatal
        assert!(matches!(
            apply_relocation(0x99, 0, 0, 0, &[]),
            Err(RelocationError::Unsupported(0x99))
        ));
    }
}
