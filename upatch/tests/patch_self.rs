//! In-process install/remove round trips: the calling process is its own
//! target, written through `/proc/self/mem`.

use std::hint::black_box;
use std::sync::Mutex;

use upatch::arch::native as arch;
use upatch::patch::{install_branch, remove_install};
use upatch::{OpenFlag, Task};

/// Serializes the tests poking at [`try_to_wake_up`]
static PATCH_LOCK: Mutex<()> = Mutex::new(());

const SENTINEL: u32 = 0xdead_1234;

#[inline(never)]
fn try_to_wake_up(mode: usize, wake_flags: usize) -> u32 {
    black_box(mode + wake_flags);
    0
}

#[inline(never)]
fn ulpatch_try_to_wake_up(_mode: usize, _wake_flags: usize) -> u32 {
    SENTINEL
}

fn open_self() -> Task {
    Task::open(std::process::id() as i32, OpenFlag::Rdwr.into()).unwrap()
}

#[test]
fn direct_jmp_install_and_restore() {
    let _guard = PATCH_LOCK.lock().unwrap();

    let call_site = try_to_wake_up as usize as u64;
    let dst = ulpatch_try_to_wake_up as usize as u64;
    assert!(
        arch::branch_reachable(call_site, dst),
        "same text section should be in direct reach"
    );

    let mut task = open_self();
    let mut original = [0u8; arch::MCOUNT_INSN_SIZE];
    task.memcpy_from(call_site, &mut original).unwrap();

    assert_eq!(black_box(try_to_wake_up(1, 1)), 0);

    let record = install_branch(&mut task, call_site, dst).unwrap();
    assert!(record.trampoline.is_none());
    assert_eq!(record.original, original);

    // the original now redirects to the replacement
    assert_eq!(black_box(try_to_wake_up(1, 1)), SENTINEL);

    remove_install(&mut task, &record).unwrap();
    assert_eq!(black_box(try_to_wake_up(1, 1)), 0);

    // byte-for-byte restore
    let mut restored = [0u8; arch::MCOUNT_INSN_SIZE];
    task.memcpy_from(call_site, &mut restored).unwrap();
    assert_eq!(restored, original);
}

#[test]
fn nop_then_restore_call_site() {
    let _guard = PATCH_LOCK.lock().unwrap();

    let call_site = try_to_wake_up as usize as u64;
    let task = open_self();

    let mut original = [0u8; arch::MCOUNT_INSN_SIZE];
    task.memcpy_from(call_site, &mut original).unwrap();

    // quiesce the prologue with the architecture's nop, then put it back;
    // the function must behave identically before and after
    assert_eq!(try_to_wake_up(2, 3), 0);
    task.memcpy_to(call_site, &arch::encode_nop()).unwrap();
    task.memcpy_to(call_site, &original).unwrap();
    assert_eq!(try_to_wake_up(2, 3), 0);
}

/// Place an RWX page more than 2 GiB away from `near`, or bail out.
fn far_rwx_page(near: u64) -> Option<(u64, region::Allocation)> {
    let page = 4096;
    let mut candidates = Vec::new();
    for k in 0..16u64 {
        candidates.push(near.wrapping_add((4 << 30) + k * (64 << 20)));
        candidates.push(near.wrapping_sub((4 << 30) + k * (64 << 20)));
    }
    for candidate in candidates {
        let candidate = candidate & !0xfff;
        if candidate < 0x10000 {
            continue;
        }
        if let Ok(alloc) = region::alloc_at(
            candidate as usize as *const u8,
            page,
            region::Protection::READ_WRITE_EXECUTE,
        ) {
            let actual = alloc.as_ptr::<u8>() as u64;
            let distance = actual.abs_diff(near);
            if distance > (2u64 << 30) + 0x1000 {
                return Some((actual, alloc));
            }
            // settled too close, try the next candidate
            drop(alloc);
        }
    }
    None
}

#[test]
fn far_jump_goes_through_trampoline() {
    let _guard = PATCH_LOCK.lock().unwrap();

    let call_site = try_to_wake_up as usize as u64;
    let replacement = ulpatch_try_to_wake_up as usize as u64;

    let (far_addr, alloc) = match far_rwx_page(call_site) {
        Some(found) => found,
        None => {
            eprintln!("no far page available in this layout, skipping");
            return;
        }
    };
    assert!(!arch::branch_reachable(call_site, far_addr));

    // the far page stands in for a patch image out of direct reach: it
    // forwards to the real replacement through its own jump-table entry
    let entry = arch::encode_jump_table_entry(replacement);
    unsafe {
        std::ptr::copy_nonoverlapping(entry.as_ptr(), far_addr as usize as *mut u8, entry.len());
    }

    // open after the page exists so the span search sees current maps
    let mut task = open_self();
    let mut original = [0u8; arch::MCOUNT_INSN_SIZE];
    task.memcpy_from(call_site, &mut original).unwrap();

    let record = install_branch(&mut task, call_site, far_addr).unwrap();
    let trampoline = record.trampoline.expect("out-of-reach install uses a trampoline");
    assert!(arch::branch_reachable(call_site, trampoline.addr));

    // call site -> trampoline -> far page -> replacement
    assert_eq!(black_box(try_to_wake_up(1, 1)), SENTINEL);

    remove_install(&mut task, &record).unwrap();
    assert_eq!(black_box(try_to_wake_up(1, 1)), 0);

    let mut restored = [0u8; arch::MCOUNT_INSN_SIZE];
    task.memcpy_from(call_site, &mut restored).unwrap();
    assert_eq!(restored, original);

    // the trampoline entry is zeroed on removal
    let mut zeroed = vec![0xffu8; trampoline.len];
    task.memcpy_from(trampoline.addr, &mut zeroed).unwrap();
    assert!(zeroed.iter().all(|&b| b == 0));

    drop(alloc);
}
