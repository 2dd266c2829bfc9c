use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use sha2::{Digest, Sha256};

/// Chunk size used for streaming reads and writes across the network.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Process-wide pool of read buffers for the hot read/write path.
pub static READ_BUFFERS: LazyLock<BytePool> = LazyLock::new(|| BytePool::new(DEFAULT_READ_BUFFER_SIZE));

/// A pool of fixed-size byte buffers.
///
/// Buffers handed out are always `size` bytes long and zeroed on first
/// allocation only. Callers that need more than `size` bytes should
/// allocate fresh instead of growing a pooled buffer (see the read
/// handler in the branch engine).
pub struct BytePool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BytePool {
    pub fn new(size: usize) -> Self {
        BytePool {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// The fixed buffer size of this pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().unwrap().pop() {
            return buf;
        }
        vec![0; self.size]
    }

    /// Return a buffer to the pool. Buffers of a foreign size are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() == self.size {
            self.free.lock().unwrap().push(buf);
        }
    }
}

/// Convert a shell-style glob into an anchored regular expression.
///
/// `*` matches within a path component, `**` across components, `?` a
/// single character and `[...]`/`[!...]` character classes. Malformed
/// classes are passed through and surface as a standard regex error
/// when the caller compiles the pattern.
pub fn glob_to_regex(glob: &str) -> String {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push('^');

    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    re.push_str(".*");
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                // Copy the class verbatim up to and including the
                // closing bracket. An unterminated class is emitted
                // as-is and rejected by the regex compiler.
                for c2 in chars.by_ref() {
                    re.push(c2);
                    if c2 == ']' {
                        break;
                    }
                }
            }
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' => {
                re.push('\\');
                re.push(c);
            }
            _ => re.push(c),
        }
    }

    re.push('$');
    re
}

/// Size of the samples hashed by [`fast_checksum`].
const CHECKSUM_SAMPLE: usize = DEFAULT_READ_BUFFER_SIZE;

/// Compute a fast, content-based checksum of a file.
///
/// Small files are hashed in full; larger files contribute their
/// length plus samples from the head, middle and tail. Changes in
/// unsampled regions of very large files can go unnoticed, which is
/// the accepted trade-off for cheap directory scans.
pub fn fast_checksum(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let len = f.metadata()?.len();

    let mut hasher = Sha256::new();
    hasher.update(len.to_be_bytes());

    let mut buf = vec![0u8; CHECKSUM_SAMPLE];

    if len <= (CHECKSUM_SAMPLE * 3) as u64 {
        let mut all = Vec::with_capacity(len as usize);
        f.read_to_end(&mut all)?;
        hasher.update(&all);
    } else {
        for offset in [0, len / 2, len - CHECKSUM_SAMPLE as u64] {
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(&mut buf)?;
            hasher.update(&buf);
        }
    }

    let digest = hasher.finalize();
    Ok(lower_hex(&digest[..8]))
}

/// Split a tree path into its mapping components, dropping empty
/// entries so that `"///a//b"` and `"/a/b"` are equivalent.
pub fn create_mapping_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join two slash-separated tree paths, collapsing duplicate
/// separators. Either side may be empty.
pub fn join_tree_path(a: &str, b: &str) -> String {
    let a = a.trim_end_matches('/');
    let b = b.trim_start_matches('/');

    if a.is_empty() {
        if b.is_empty() {
            // Joining "/" with "" must stay "/"
            return "/".to_string();
        }
        return format!("/{}", b);
    }
    if b.is_empty() {
        return a.to_string();
    }
    format!("{}/{}", a, b)
}

/// Split a tree path into directory and file name parts. The directory
/// keeps its trailing slash so the result concatenates back.
pub fn split_dir_file(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i + 1], &path[i + 1..]),
        None => ("", path),
    }
}

/// Resolve a slash-separated relative path under a sandbox root.
///
/// The resolution is purely lexical: `.` components are dropped, `..`
/// pops, and the result must still be a descendant of `root`. Returns
/// `None` when the path escapes the root.
pub fn resolve_under(root: &Path, rpath: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();

    for comp in Path::new(rpath.trim_start_matches('/')).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    if out.starts_with(root) {
        Some(out)
    } else {
        None
    }
}

/// Lower-case hex without separators.
pub fn lower_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Upper-case hex without separators.
pub fn upper_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}
