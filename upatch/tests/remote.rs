//! Process-level scenarios against a forked sleeper child

mod common;

use std::fs;
use std::io::Write;

use common::{fork_sleeper, proc_state, ptrace_allowed, reap, temp_dir};
use upatch::symbols::runtime_addr;
use upatch::{OpenFlag, Task};

#[test]
fn parse_load_info_validates_objects() {
    let dir = temp_dir("parse");
    let good = dir.join("good.o");
    fs::write(&good, common::build_patch_object("alarm", "ulp_alarm", "getpid")).unwrap();

    let info = upatch::patch::parse_load_info(&good).unwrap();
    assert_eq!(info.meta.target_func, "alarm");
    assert_eq!(info.meta.author, "upatch tests");
    assert!(info.target_base.is_none());
    let (_, text) = info.file.find_section(".text").unwrap();
    assert_eq!(text.size.0, common::SLOT_OFFSET + 8);

    // empty and truncated files are input errors, reported cleanly
    let empty = dir.join("empty.o");
    fs::write(&empty, b"").unwrap();
    assert!(matches!(
        upatch::patch::parse_load_info(&empty),
        Err(upatch::PatchError::Empty(_))
    ));

    let truncated = dir.join("short.o");
    fs::write(&truncated, &fs::read(&good).unwrap()[..40]).unwrap();
    assert!(upatch::patch::parse_load_info(&truncated).is_err());

    // an executable is not a patch object
    let not_rel = dir.join("exec.o");
    let mut bytes = fs::read(&good).unwrap();
    bytes[16] = 2; // ET_EXEC
    fs::write(&not_rel, &bytes).unwrap();
    assert!(matches!(
        upatch::patch::parse_load_info(&not_rel),
        Err(upatch::PatchError::NotRelocatable(_))
    ));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn ptrace_round_trip() {
    if !ptrace_allowed() {
        eprintln!("ptrace not permitted here, skipping");
        return;
    }
    let child = fork_sleeper();

    let mut task = Task::open(child.as_raw(), OpenFlag::Rdwr.into()).unwrap();
    task.attach().unwrap();
    task.detach().unwrap();

    // the child keeps pausing, untouched
    std::thread::sleep(std::time::Duration::from_millis(50));
    let state = proc_state(child).expect("child still has a /proc entry");
    assert!(matches!(state, 'S' | 'R'), "unexpected state {:?}", state);

    reap(child);
}

#[test]
fn remote_getpid_is_idempotent_over_state() {
    if !ptrace_allowed() {
        eprintln!("ptrace not permitted here, skipping");
        return;
    }
    let child = fork_sleeper();

    let mut task = Task::open(child.as_raw(), OpenFlag::Rdwr.into()).unwrap();
    task.attach().unwrap();

    // a side-effect-free syscall returns the target's own pid and leaves
    // its registers and splice bytes as they were
    let splice = task.libc_vma().start;
    let mut before = [0u8; 16];
    task.memcpy_from(splice, &mut before).unwrap();

    let pid = task.remote_syscall(libc::SYS_getpid, [0; 6]).unwrap();
    assert_eq!(pid, child.as_raw() as u64);

    let mut after = [0u8; 16];
    task.memcpy_from(splice, &mut after).unwrap();
    assert_eq!(before, after);

    task.detach().unwrap();
    reap(child);
}

#[test]
fn remote_mmap_munmap() {
    if !ptrace_allowed() {
        eprintln!("ptrace not permitted here, skipping");
        return;
    }
    let child = fork_sleeper();

    let mut task = Task::open(child.as_raw(), OpenFlag::Rdwr.into()).unwrap();
    task.attach().unwrap();

    let addr = task
        .remote_mmap(
            0,
            4096,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
        .unwrap();
    assert!(addr >= 0x1000);

    task.update_vmas().unwrap();
    let idx = task.vmas.find(addr).expect("new mapping is in maps");
    {
        let vma = task.vmas.get(idx);
        assert_eq!(vma.start, addr);
        assert_eq!(vma.len(), 4096);
        assert_eq!(vma.prot & libc::PROT_WRITE, libc::PROT_WRITE);
    }

    // the mapping is usable through the memory path
    task.memcpy_to(addr, b"upatch was here").unwrap();
    let mut back = [0u8; 15];
    task.memcpy_from(addr, &mut back).unwrap();
    assert_eq!(&back, b"upatch was here");

    task.remote_munmap(addr, 4096).unwrap();
    task.update_vmas().unwrap();
    assert!(task.vmas.find(addr).is_none());

    task.detach().unwrap();
    reap(child);
}

#[test]
fn remote_open_close() {
    if !ptrace_allowed() {
        eprintln!("ptrace not permitted here, skipping");
        return;
    }
    let dir = temp_dir("open");
    let path = dir.join("hostname");
    fs::File::create(&path)
        .and_then(|mut f| f.write_all(b"sleeper\n"))
        .unwrap();

    let child = fork_sleeper();
    let mut task = Task::open(child.as_raw(), OpenFlag::Rdwr.into()).unwrap();
    task.attach().unwrap();

    let fd = task.remote_open(&path, libc::O_RDONLY, 0).unwrap();
    assert!(fd >= 3, "got fd {}", fd);

    let link = fs::read_link(format!("/proc/{}/fd/{}", child, fd)).unwrap();
    assert_eq!(link, fs::canonicalize(&path).unwrap());

    task.remote_close(fd).unwrap();
    assert!(fs::read_link(format!("/proc/{}/fd/{}", child, fd)).is_err());

    // a failing remote syscall carries the target's errno
    let missing = dir.join("does-not-exist");
    let err = task.remote_open(&missing, libc::O_RDONLY, 0);
    assert!(err.is_err());

    task.detach().unwrap();
    reap(child);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn resolve_printf_in_child() {
    if !ptrace_allowed() {
        eprintln!("ptrace not permitted here, skipping");
        return;
    }
    let child = fork_sleeper();
    let task = Task::open(child.as_raw(), OpenFlag::LoadSymbols.into()).unwrap();

    let symbol = task.find_symbol("printf").expect("printf in the index");
    let addr = runtime_addr(&task.vmas, symbol);

    // the runtime address must land inside the owning library's group span
    let leader = task.vmas.get(symbol.vma);
    let group_end = task
        .vmas
        .group(symbol.vma)
        .map(|(_, v)| v.end)
        .max()
        .unwrap();
    assert!(
        leader.start <= addr && addr < group_end,
        "printf at {:#x} outside [{:#x}, {:#x})",
        addr,
        leader.start,
        group_end
    );

    // and inside an executable mapping of that same group
    let holder = task.vmas.find(addr).expect("printf is mapped");
    assert_eq!(task.vmas.get(holder).leader, symbol.vma);
    assert!(task.vmas.get(holder).is_exec());

    reap(child);
}

#[test]
fn patch_lifecycle_against_child() {
    if !ptrace_allowed() {
        eprintln!("ptrace not permitted here, skipping");
        return;
    }
    let dir = temp_dir("lifecycle");
    let obj_path = dir.join("alarm-patch.o");
    fs::write(
        &obj_path,
        common::build_patch_object("alarm", "ulp_alarm", "getpid"),
    )
    .unwrap();

    let child = fork_sleeper();
    let flags = OpenFlag::Rdwr | OpenFlag::LoadSymbols | OpenFlag::RegisterOnDisk;
    let mut task = Task::open_with_root(child.as_raw(), flags, &dir).unwrap();
    task.attach().unwrap();

    let call_site = task.symbol_addr("alarm").expect("alarm in libc");
    let mut original = [0u8; 16];
    task.memcpy_from(call_site, &mut original).unwrap();

    let mut patch = upatch::patch::init_patch(&mut task, &obj_path).unwrap();
    assert_eq!(patch.state, upatch::patch::PatchState::Active);

    // the image is mapped and carries our text
    let base = patch.info.target_base.unwrap();
    assert!(task.vmas.find(base).is_some());

    // the ABS64 slot was resolved against the target's getpid
    let getpid_addr = task.symbol_addr("getpid").unwrap();
    let text_off = patch.info.file.find_section(".text").unwrap().1.off.0;
    let mut slot = [0u8; 8];
    task.memcpy_from(base + text_off + common::SLOT_OFFSET, &mut slot)
        .unwrap();
    assert_eq!(u64::from_le_bytes(slot), getpid_addr);

    // the call site no longer starts with its original bytes
    let mut patched = [0u8; 16];
    task.memcpy_from(call_site, &mut patched).unwrap();
    assert_ne!(patched, original);

    // the registry holds the staged image and its reversal record
    let staged = patch.info.staged_path.clone().unwrap();
    assert!(staged.exists());
    assert!(upatch::registry::Registry::load_meta(&staged).is_ok());

    upatch::patch::delete_patch(&mut task, &mut patch).unwrap();
    assert_eq!(patch.state, upatch::patch::PatchState::Unloaded);

    // byte-for-byte round trip at the call site
    let mut restored = [0u8; 16];
    task.memcpy_from(call_site, &mut restored).unwrap();
    assert_eq!(restored, original);

    // image unmapped, registry entry gone
    assert!(task.vmas.find(base).is_none());
    assert!(!staged.exists());

    task.detach().unwrap();
    reap(child);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unresolved_symbol_unwinds_to_unloaded() {
    if !ptrace_allowed() {
        eprintln!("ptrace not permitted here, skipping");
        return;
    }
    let dir = temp_dir("unwind");
    let obj_path = dir.join("bad-patch.o");
    fs::write(
        &obj_path,
        common::build_patch_object("alarm", "ulp_alarm", "no_such_symbol_anywhere"),
    )
    .unwrap();

    let child = fork_sleeper();
    let flags = OpenFlag::Rdwr | OpenFlag::LoadSymbols | OpenFlag::RegisterOnDisk;
    let mut task = Task::open_with_root(child.as_raw(), flags, &dir).unwrap();
    task.attach().unwrap();

    let call_site = task.symbol_addr("alarm").unwrap();
    let mut original = [0u8; 16];
    task.memcpy_from(call_site, &mut original).unwrap();
    let maps_before = task.vmas.len();

    let err = upatch::patch::init_patch(&mut task, &obj_path);
    assert!(err.is_err());

    // no site touched, image unmapped again, registry drained
    let mut after = [0u8; 16];
    task.memcpy_from(call_site, &mut after).unwrap();
    assert_eq!(after, original);
    assert_eq!(task.vmas.len(), maps_before);
    let map_files = dir.join(child.as_raw().to_string()).join("map_files");
    assert_eq!(fs::read_dir(&map_files).unwrap().count(), 0);

    task.detach().unwrap();
    reap(child);
    let _ = fs::remove_dir_all(&dir);
}
