//! The on-disk, per-pid registry of staged patches.
//!
//! Layout under the root:
//! `<root>/<pid>/comm` and `<root>/<pid>/map_files/patch-XXXXXX` (the staged
//! ELF image) with a `patch-XXXXXX.meta` sidecar recording what a later run
//! needs to reverse the install. The registry is advisory: stale directories
//! from a crashed run are harmless and get overwritten.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

pub const DEFAULT_ROOT: &str = "/tmp/ulpatch";
const COMM_FILE: &str = "comm";
const MAP_FILES_DIR: &str = "map_files";
pub const PATCH_PREFIX: &str = "patch-";
const META_SUFFIX: &str = ".meta";

/// What a later run needs to reverse an install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallMeta {
    pub image_base: u64,
    pub image_len: usize,
    pub call_site: u64,
    pub original: Vec<u8>,
    pub trampoline: Option<(u64, usize)>,
}

impl InstallMeta {
    fn to_text(&self) -> String {
        let mut out = format!(
            "image {:#x} {}\nsite {:#x} {}\n",
            self.image_base,
            self.image_len,
            self.call_site,
            hex(&self.original),
        );
        if let Some((addr, len)) = self.trampoline {
            out.push_str(&format!("trampoline {:#x} {}\n", addr, len));
        }
        out
    }

    fn from_text(text: &str) -> Option<Self> {
        let mut image = None;
        let mut site = None;
        let mut trampoline = None;
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            match fields.next()? {
                "image" => {
                    let base = parse_hex(fields.next()?)?;
                    let len = fields.next()?.parse().ok()?;
                    image = Some((base, len));
                }
                "site" => {
                    let addr = parse_hex(fields.next()?)?;
                    let original = unhex(fields.next()?)?;
                    site = Some((addr, original));
                }
                "trampoline" => {
                    let addr = parse_hex(fields.next()?)?;
                    let len = fields.next()?.parse().ok()?;
                    trampoline = Some((addr, len));
                }
                _ => return None,
            }
        }
        let (image_base, image_len) = image?;
        let (call_site, original) = site?;
        Some(Self {
            image_base,
            image_len,
            call_site,
            original,
            trampoline,
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// One target's registry directory
#[derive(Debug)]
pub struct Registry {
    pid_dir: PathBuf,
}

impl Registry {
    /// Create (or take over) the directory tree for `pid`
    pub fn create(root: &Path, pid: i32, comm: &str) -> io::Result<Self> {
        let pid_dir = root.join(pid.to_string());
        fs::create_dir_all(pid_dir.join(MAP_FILES_DIR))?;
        fs::write(pid_dir.join(COMM_FILE), comm)?;
        debug!("registry at {}", pid_dir.display());
        Ok(Self { pid_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.pid_dir
    }

    /// Write the patch image under a fresh `patch-XXXXXX` name
    pub fn stage(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let dir = self.pid_dir.join(MAP_FILES_DIR);
        for n in 0u32.. {
            let path = dir.join(format!("{}{:06}", PATCH_PREFIX, n));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    f.write_all(bytes)?;
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        unreachable!("ran out of patch names")
    }

    /// Record the reversal metadata next to a staged patch
    pub fn store_meta(&self, staged: &Path, meta: &InstallMeta) -> io::Result<()> {
        fs::write(meta_path(staged), meta.to_text())
    }

    /// Load the reversal metadata of a staged patch
    pub fn load_meta(staged: &Path) -> io::Result<InstallMeta> {
        let text = fs::read_to_string(meta_path(staged))?;
        InstallMeta::from_text(&text)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad meta record"))
    }

    /// Remove a staged patch and its sidecar
    pub fn remove(&self, staged: &Path) -> io::Result<()> {
        let _ = fs::remove_file(meta_path(staged));
        fs::remove_file(staged)
    }
}

fn meta_path(staged: &Path) -> PathBuf {
    let mut name = staged.file_name().unwrap_or_default().to_os_string();
    name.push(META_SUFFIX);
    staged.with_file_name(name)
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Leave anything still staged behind for post-mortem removal; the
        // rmdirs only succeed once the tree is empty.
        let _ = fs::remove_file(self.pid_dir.join(COMM_FILE));
        if fs::remove_dir(self.pid_dir.join(MAP_FILES_DIR)).is_err()
            || fs::remove_dir(&self.pid_dir).is_err()
        {
            warn!("registry {} left in place", self.pid_dir.display());
        }
    }
}
