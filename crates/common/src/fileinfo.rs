use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// File-type mask of a Unix mode.
pub const MODE_TYPE_MASK: u32 = 0o170000;
/// Directory bit of a Unix mode.
pub const MODE_DIR: u32 = 0o040000;

/// A portable record describing a single filesystem entry.
///
/// This is the shape every listing and stat operation returns across
/// the wire. The symlink fields are transient branch-side knowledge
/// and never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Base name of the entry.
    pub name: String,
    /// Size in bytes. For symlinks this is the resolved target's size.
    pub size: u64,
    /// Unix mode bits, including the file type.
    pub mode: u32,
    /// Modification time. Synthesised entries report the epoch.
    pub modified: SystemTime,
    /// Content checksum, empty unless the listing requested checksums
    /// (and the checksum could actually be computed).
    pub checksum: String,

    #[serde(skip)]
    pub(crate) symlink: bool,
    #[serde(skip)]
    pub(crate) symlink_target: String,
}

impl FileInfo {
    /// Build a `FileInfo` from an entry's symlink metadata, resolving
    /// symlinks so the record carries the target's size and mode.
    pub fn from_entry(dir: &Path, name: &str, meta: &fs::Metadata) -> FileInfo {
        let mut mode = meta.mode();
        let mut size = meta.size();
        let mut symlink = false;
        let mut symlink_target = String::new();

        if meta.file_type().is_symlink() {
            symlink = true;

            let full = dir.join(name);
            if let Ok(target_meta) = fs::metadata(&full) {
                mode = target_meta.mode();
                size = target_meta.size();
            }
            if let Ok(target) = fs::canonicalize(&full) {
                symlink_target = target.to_string_lossy().into_owned();
            }
        }

        FileInfo {
            name: name.to_string(),
            size,
            mode,
            modified: meta.modified().unwrap_or(UNIX_EPOCH),
            checksum: String::new(),
            symlink,
            symlink_target,
        }
    }

    /// A directory entry synthesised by the tree for a mapping component
    /// with no physical counterpart on any branch.
    pub fn pseudo_dir(name: &str) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: 0,
            mode: MODE_DIR | 0o777,
            modified: UNIX_EPOCH,
            checksum: String::new(),
            symlink: false,
            symlink_target: String::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_TYPE_MASK == MODE_DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink
    }

    /// Resolved symlink target, empty for regular entries.
    pub fn symlink_target(&self) -> &str {
        &self.symlink_target
    }

    /// Render the mode bits in `ls -l` style, e.g. `drwxr-xr-x`.
    pub fn mode_string(&self) -> String {
        let mut out = String::with_capacity(10);

        out.push(match self.mode & MODE_TYPE_MASK {
            MODE_DIR => 'd',
            0o120000 => 'l',
            _ => '-',
        });

        for shift in [6u32, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }

        out
    }
}

/// Human-readable byte size, e.g. `10 B` or `4.0 KiB`.
pub fn byte_size_string(size: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

    if size < 1024 {
        return format!("{} B", size);
    }

    let mut value = size as f64 / 1024.0;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}

/// Format a directory listing result into a human-readable string.
///
/// Paths are sorted, entries within a path are sorted by name and the
/// size column is right-aligned. Checksums are appended in brackets
/// when present.
pub fn dir_result_to_string(paths: &[String], infos: &[Vec<FileInfo>]) -> String {
    let mut order: Vec<usize> = (0..paths.len()).collect();
    order.sort_by(|&a, &b| paths[a].cmp(&paths[b]));

    let mut out = String::new();

    for (i, &idx) in order.iter().enumerate() {
        let mut fis = infos[idx].clone();
        fis.sort_by(|a, b| a.name.cmp(&b.name));

        out.push_str(&paths[idx]);
        out.push('\n');

        let sizes: Vec<String> = fis.iter().map(|fi| byte_size_string(fi.size)).collect();
        let width = sizes.iter().map(|s| s.len()).max().unwrap_or(0);

        for (fi, size) in fis.iter().zip(&sizes) {
            if fi.checksum.is_empty() {
                out.push_str(&format!(
                    "{} {:>width$} {}\n",
                    fi.mode_string(),
                    size,
                    fi.name,
                ));
            } else {
                out.push_str(&format!(
                    "{} {:>width$} {} [{}]\n",
                    fi.mode_string(),
                    size,
                    fi.name,
                    fi.checksum,
                ));
            }
        }

        if i < order.len() - 1 {
            out.push('\n');
        }
    }

    out
}
