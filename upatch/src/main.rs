//! ultask: inspect and patch a running process.
//!
//! Thin adapter over the upatch library; flags map one-to-one onto core
//! operations.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use upatch::patch::{delete_patch_from_meta, init_patch};
use upatch::symbols::runtime_addr;
use upatch::{OpenFlag, PatchError, Task};

#[derive(Parser)]
#[command(name = "ultask", version, about = "Inspect and patch a running process")]
struct Cli {
    /// Target process id
    #[arg(short, long)]
    pid: i32,

    /// Print the target's mappings
    #[arg(long)]
    vmas: bool,

    /// Print the target's resolved symbols
    #[arg(long)]
    syms: bool,

    /// Dump memory: vma,addr=ADDR or addr=ADDR,size=SIZE (use with -o)
    #[arg(long, value_name = "OPTS")]
    dump: Option<String>,

    /// Map a file into the target: file=PATH[,ro][,noexec]
    #[arg(long, value_name = "OPTS")]
    map: Option<String>,

    /// Unmap the mapping covering ADDR
    #[arg(long, value_name = "ADDR")]
    unmap: Option<String>,

    /// Poke a jump: from=ADDR,to=ADDR
    #[arg(long, value_name = "OPTS")]
    jmp: Option<String>,

    /// Load and activate a patch object
    #[arg(long, value_name = "FILE")]
    patch: Option<PathBuf>,

    /// Reverse a staged patch by its registry path
    #[arg(long, value_name = "FILE")]
    unpatch: Option<PathBuf>,

    /// Output file for --dump
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Parse `0x…` hex or decimal
fn parse_addr(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse().map_err(|_| format!("bad address {:?}", s))
    }
}

/// Parse `NN`, `NNKB`, `NNMB`, `NNGB`
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_ascii_uppercase();
    let (digits, mult) = if let Some(d) = s.strip_suffix("GB") {
        (d, 1 << 30)
    } else if let Some(d) = s.strip_suffix("MB") {
        (d, 1 << 20)
    } else if let Some(d) = s.strip_suffix("KB") {
        (d, 1 << 10)
    } else {
        (s.as_str(), 1)
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("bad size {:?}", s))?;
    Ok(n * mult)
}

/// Split `key=value,flag,...` sub-options
fn subopts(spec: &str) -> impl Iterator<Item = (&str, Option<&str>)> {
    spec.split(',').map(|part| match part.split_once('=') {
        Some((k, v)) => (k.trim(), Some(v.trim())),
        None => (part.trim(), None),
    })
}

fn run(cli: &Cli) -> Result<(), PatchError> {
    let mutating = cli.map.is_some()
        || cli.unmap.is_some()
        || cli.jmp.is_some()
        || cli.patch.is_some()
        || cli.unpatch.is_some();

    let mut flags = OpenFlag::LoadVmas | OpenFlag::LoadVmaElfs;
    if mutating {
        flags |= OpenFlag::Rdwr;
    }
    if cli.syms || cli.patch.is_some() {
        flags |= OpenFlag::LoadSymbols;
    }
    if cli.patch.is_some() {
        flags |= OpenFlag::RegisterOnDisk;
    }

    let mut task = Task::open(cli.pid, flags)?;

    let inspecting = cli.vmas || cli.syms || cli.dump.is_some();
    if cli.vmas || (!inspecting && !mutating) {
        println!(
            "COMM: {}\nPID:  {}\nEXE:  {}",
            task.comm,
            cli.pid,
            task.exe.display()
        );
    }

    if cli.vmas {
        for (idx, vma) in task.vmas.iter() {
            println!(
                "{:>8}: {:016x}-{:016x} {} {:8x} {:4x}:{:<4x} {:8} {} {}{}",
                vma.kind.name(),
                vma.start,
                vma.end,
                vma.perms,
                vma.offset,
                vma.maj,
                vma.min,
                vma.inode,
                vma.name,
                if vma.elf.is_some() { "E" } else { " " },
                if vma.leader == idx { "L" } else { " " },
            );
        }
    }

    if cli.syms {
        for symbol in task.symbols.iter() {
            println!(
                "{:016x} {:8} {}",
                runtime_addr(&task.vmas, symbol),
                symbol.sym.size,
                symbol.name
            );
        }
    }

    if let Some(spec) = &cli.dump {
        let mut addr = None;
        let mut size = None;
        let mut whole_vma = false;
        for (key, value) in subopts(spec) {
            match (key, value) {
                ("vma", None) => whole_vma = true,
                ("addr", Some(v)) => addr = Some(parse_addr(v).map_err(PatchError::InvalidArg)?),
                ("size", Some(v)) => size = Some(parse_size(v).map_err(PatchError::InvalidArg)?),
                _ => return Err(PatchError::InvalidArg(format!("unknown --dump option {:?}", key))),
            }
        }
        let addr = addr.ok_or_else(|| PatchError::InvalidArg("--dump needs addr=".into()))?;
        let (start, len) = if whole_vma {
            let idx = task
                .vmas
                .find(addr)
                .ok_or_else(|| PatchError::InvalidArg(format!("no mapping at {:#x}", addr)))?;
            let vma = task.vmas.get(idx);
            (vma.start, vma.len() as usize)
        } else {
            let size = size.ok_or_else(|| PatchError::InvalidArg("--dump needs size=".into()))?;
            (addr, size as usize)
        };

        let mut buf = vec![0u8; len];
        task.memcpy_from(start, &mut buf)?;
        match &cli.output {
            Some(path) => {
                std::fs::write(path, &buf).map_err(|e| PatchError::Io(path.clone(), e))?
            }
            None => std::io::stdout()
                .write_all(&buf)
                .map_err(|e| PatchError::Io("<stdout>".into(), e))?,
        }
    }

    if mutating {
        task.attach()?;
    }
    let result = run_mutations(cli, &mut task);
    if task.is_attached() {
        // never leave the target ptrace-stopped, even on the error path
        let _ = task.detach();
    }
    result
}

fn run_mutations(cli: &Cli, task: &mut Task) -> Result<(), PatchError> {
    if let Some(spec) = &cli.map {
        let mut file = None;
        let mut ro = false;
        let mut noexec = false;
        for (key, value) in subopts(spec) {
            match (key, value) {
                ("file", Some(v)) => file = Some(PathBuf::from(v)),
                ("ro", None) => ro = true,
                ("noexec", None) => noexec = true,
                _ => return Err(PatchError::InvalidArg(format!("unknown --map option {:?}", key))),
            }
        }
        let file = file.ok_or_else(|| PatchError::InvalidArg("--map needs file=".into()))?;
        let len = std::fs::metadata(&file)
            .map_err(|e| PatchError::Io(file.clone(), e))?
            .len() as usize;

        let fd = task.remote_open(&file, if ro { libc::O_RDONLY } else { libc::O_RDWR }, 0)?;
        let mut prot = libc::PROT_READ;
        if !ro {
            prot |= libc::PROT_WRITE;
        }
        if !noexec {
            prot |= libc::PROT_EXEC;
        }
        let base = task.remote_mmap(0, len, prot, libc::MAP_PRIVATE, fd, 0)?;
        task.remote_close(fd)?;
        task.update_vmas()?;
        println!("mapped {} at {:#x}", file.display(), base);
    }

    if let Some(addr) = &cli.unmap {
        let addr = parse_addr(addr).map_err(PatchError::InvalidArg)?;
        let idx = task
            .vmas
            .find(addr)
            .ok_or_else(|| PatchError::InvalidArg(format!("no mapping at {:#x}", addr)))?;
        let (start, len) = {
            let vma = task.vmas.get(idx);
            (vma.start, vma.len() as usize)
        };
        task.remote_munmap(start, len)?;
        task.update_vmas()?;
        println!("unmapped {:#x}-{:#x}", start, start + len as u64);
    }

    if let Some(spec) = &cli.jmp {
        let mut from = None;
        let mut to = None;
        for (key, value) in subopts(spec) {
            match (key, value) {
                ("from", Some(v)) => from = Some(parse_addr(v).map_err(PatchError::InvalidArg)?),
                ("to", Some(v)) => to = Some(parse_addr(v).map_err(PatchError::InvalidArg)?),
                _ => return Err(PatchError::InvalidArg(format!("unknown --jmp option {:?}", key))),
            }
        }
        let from = from.ok_or_else(|| PatchError::InvalidArg("--jmp needs from=".into()))?;
        let to = to.ok_or_else(|| PatchError::InvalidArg("--jmp needs to=".into()))?;
        let record = upatch::patch::install_branch(task, from, to)?;
        println!(
            "jump installed at {:#x} (saved {} original bytes)",
            record.call_site,
            record.original.len()
        );
    }

    if let Some(obj) = &cli.patch {
        let patch = init_patch(task, obj)?;
        println!(
            "patch active: {} (staged as {})",
            patch.info.meta.target_func,
            patch
                .info
                .staged_path
                .as_deref()
                .unwrap_or(obj)
                .display()
        );
    }

    if let Some(staged) = &cli.unpatch {
        delete_patch_from_meta(task, staged)?;
        println!("patch reversed: {}", staged.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("ultask: {} (check /proc/{}/maps)", e, cli.pid);
            let code = e.errno().map(|n| (n & 0xff) as u8).unwrap_or(1);
            ExitCode::from(if code == 0 { 1 } else { code })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(parse_addr("0x1000"), Ok(0x1000));
        assert_eq!(parse_addr("0X7fff"), Ok(0x7fff));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("zz").is_err());
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("4KB"), Ok(4096));
        assert_eq!(parse_size("2MB"), Ok(2 << 20));
        assert_eq!(parse_size("1gb"), Ok(1 << 30));
        assert!(parse_size("KB").is_err());
    }

    #[test]
    fn subopt_split() {
        let opts: Vec<_> = subopts("file=/tmp/x,ro,noexec").collect();
        assert_eq!(
            opts,
            vec![
                ("file", Some("/tmp/x")),
                ("ro", None),
                ("noexec", None),
            ]
        );
    }
}
