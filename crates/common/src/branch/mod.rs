use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::config::BranchExportConfig;
use crate::fileinfo::FileInfo;
use crate::node::{Ctrl, DataHandler, ItemOp, Node, TlsIdentity};
use crate::util::{self, fast_checksum, glob_to_regex, DEFAULT_READ_BUFFER_SIZE, READ_BUFFERS};

/// Errors of the branch-side file engine.
///
/// The `Eof` and `NotExist` sentinels render to the exact texts the
/// transport recognises on the client side.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BranchError {
    #[error("EOF")]
    Eof,
    #[error("file does not exist")]
    NotExist,
    #[error("Branch {0} is read-only")]
    ReadOnly(String),
    #[error("Requested path {0} is outside of the branch")]
    OutsideBranch(String),
    #[error("read /{0}: is a directory")]
    IsDirectory(String),
    #[error("This operation requires a specific file or directory")]
    MissingOperand,
    #[error("{0}")]
    Pattern(String),
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Encode(String),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Node(#[from] crate::node::Error),
}

impl From<io::Error> for BranchError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            BranchError::NotExist
        } else {
            BranchError::Io(e.to_string())
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BranchError> {
    bincode::serialize(value).map_err(|e| BranchError::Encode(e.to_string()))
}

/// Join a slash-separated relative listing path with a child name the
/// way recursive listings report them (no leading slash is invented).
fn join_rel(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// A single exported branch: a local directory served to authorized
/// clients through the node's RPC interface.
pub struct Branch {
    inner: Arc<BranchInner>,
    node: Node,
}

struct BranchInner {
    name: String,
    /// Absolute sandbox root; every request path must resolve below it.
    root: PathBuf,
    readonly: bool,
}

impl Branch {
    /// Create a branch from its export config, bind its RPC listener
    /// and install the request handler.
    pub async fn new(
        cfg: &BranchExportConfig,
        identity: Option<TlsIdentity>,
    ) -> Result<Branch, BranchError> {
        cfg.check()?;

        let root = fs::canonicalize(&cfg.local_folder)?;

        let node = Node::new(
            &cfg.rpc_endpoint(),
            &cfg.branch_name,
            &cfg.branch_secret,
            identity,
        );
        node.start().await?;

        let inner = Arc::new(BranchInner {
            name: cfg.branch_name.clone(),
            root,
            readonly: cfg.enable_read_only,
        });
        node.set_data_handler(inner.clone());

        Ok(Branch { inner, node })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.readonly
    }

    /// Fingerprint of the branch certificate, empty without TLS.
    pub fn ssl_fingerprint(&self) -> String {
        self.node.ssl_fingerprint()
    }

    /// The bound RPC listener address.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.node.addr()
    }

    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }

    /// List directory contents matching a pattern, see [`BranchInner::dir`].
    pub fn dir(
        &self,
        spath: &str,
        pattern: &str,
        recursive: bool,
        checksums: bool,
    ) -> Result<(Vec<String>, Vec<Vec<FileInfo>>), BranchError> {
        self.inner.dir(spath, pattern, recursive, checksums)
    }

    /// Read up to `buf.len()` bytes into `buf` from the given offset.
    pub fn read_file(&self, spath: &str, buf: &mut [u8], offset: u64) -> Result<usize, BranchError> {
        self.inner.read_file(spath, buf, offset)
    }

    /// Read a complete file into the given writer.
    pub fn read_file_to_writer(
        &self,
        spath: &str,
        writer: &mut impl Write,
    ) -> Result<(), BranchError> {
        let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
        let mut offset = 0u64;

        loop {
            match self.inner.read_file(spath, &mut buf, offset) {
                Ok(n) => {
                    writer.write_all(&buf[..n])?;
                    offset += n as u64;
                }
                Err(BranchError::Eof) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write `data` into the given file at `offset`.
    pub fn write_file(&self, spath: &str, data: &[u8], offset: u64) -> Result<usize, BranchError> {
        self.inner.write_file(spath, data, offset)
    }

    /// Write a complete file from the given reader. A trailing
    /// zero-length write finalises empty files.
    pub fn write_file_from_reader(
        &self,
        spath: &str,
        reader: &mut impl Read,
    ) -> Result<(), BranchError> {
        self.inner.check_read_only()?;

        let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
        let mut offset = 0u64;

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                self.inner.write_file(spath, &[], offset)?;
                return Ok(());
            }
            self.inner.write_file(spath, &buf[..n], offset)?;
            offset += n as u64;
        }
    }

    /// Execute a file or directory operation, see [`BranchInner::item_op`].
    pub fn item_op(&self, spath: &str, op: &ItemOp) -> Result<bool, BranchError> {
        self.inner.item_op(spath, op)
    }
}

impl BranchInner {
    fn check_read_only(&self) -> Result<(), BranchError> {
        if self.readonly {
            return Err(BranchError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    /// Resolve a request path below the sandbox root. Purely lexical,
    /// so targets that do not exist yet still resolve.
    fn sub_path(&self, rpath: &str) -> Result<PathBuf, BranchError> {
        util::resolve_under(&self.root, rpath)
            .ok_or_else(|| BranchError::OutsideBranch(rpath.to_string()))
    }

    /// Remove occurrences of the sandbox root from error text so host
    /// paths do not leak to remote callers.
    fn scrub(&self, text: &str) -> String {
        text.replace(&*self.root.to_string_lossy(), "")
    }

    /// Sorted entries of one directory with their symlink metadata.
    fn list_dir(abs: &Path) -> io::Result<Vec<(String, fs::Metadata)>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(abs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = fs::symlink_metadata(entry.path())?;
            entries.push((name, meta));
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Wrap matching entries of one directory, attaching checksums to
    /// files when requested. Checksum failures leave the field empty
    /// rather than failing the listing.
    fn build_infos(
        &self,
        abs: &Path,
        entries: &[(String, fs::Metadata)],
        re: &Regex,
        checksums: bool,
    ) -> Vec<FileInfo> {
        let mut infos = Vec::new();

        for (name, meta) in entries {
            if !re.is_match(name) {
                continue;
            }

            let mut fi = FileInfo::from_entry(abs, name, meta);

            if checksums && !fi.is_dir() {
                if let Ok(sum) = fast_checksum(&abs.join(name)) {
                    fi.checksum = sum;
                }
            }

            infos.push(fi);
        }

        infos
    }

    /// List the contents of a path, matching file names against the
    /// given regular expression pattern. With `recursive` the result
    /// covers all subdirectories (traversed regardless of the pattern,
    /// in sorted order). A missing path yields an empty result.
    fn dir(
        &self,
        spath: &str,
        pattern: &str,
        recursive: bool,
        checksums: bool,
    ) -> Result<(Vec<String>, Vec<Vec<FileInfo>>), BranchError> {
        let re = Regex::new(pattern).map_err(|e| BranchError::Pattern(e.to_string()))?;

        let sub = self.sub_path(spath)?;

        let run = || -> io::Result<(Vec<String>, Vec<Vec<FileInfo>>)> {
            let mut paths = Vec::new();
            let mut infos = Vec::new();

            if !recursive {
                let entries = Self::list_dir(&sub)?;
                paths.push(spath.to_string());
                infos.push(self.build_infos(&sub, &entries, &re, checksums));
            } else {
                self.add_sub_dir(&sub, spath, &re, checksums, &mut paths, &mut infos)?;
            }

            Ok((paths, infos))
        };

        match run() {
            Ok(result) => Ok(result),
            // Ignore any not exists errors
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok((Vec::new(), Vec::new())),
            Err(e) => Err(e.into()),
        }
    }

    /// Depth-first recursive listing with sorted sibling order.
    fn add_sub_dir(
        &self,
        abs: &Path,
        rel: &str,
        re: &Regex,
        checksums: bool,
        paths: &mut Vec<String>,
        infos: &mut Vec<Vec<FileInfo>>,
    ) -> io::Result<()> {
        let entries = Self::list_dir(abs)?;

        paths.push(rel.to_string());
        infos.push(self.build_infos(abs, &entries, re, checksums));

        for (name, meta) in &entries {
            if meta.is_dir() {
                self.add_sub_dir(
                    &abs.join(name),
                    &join_rel(rel, name),
                    re,
                    checksums,
                    paths,
                    infos,
                )?;
            }
        }

        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`. An offset at or past
    /// the end of the file reports `EOF`, which terminates streaming
    /// reads on the client side.
    fn read_file(&self, spath: &str, buf: &mut [u8], offset: u64) -> Result<usize, BranchError> {
        let sub = self.sub_path(spath)?;

        let meta = fs::metadata(&sub)?;
        if meta.is_dir() {
            return Err(BranchError::IsDirectory(spath.to_string()));
        }
        if offset >= meta.len() {
            return Err(BranchError::Eof);
        }

        let mut f = fs::File::open(&sub)?;
        f.seek(SeekFrom::Start(offset))?;

        let n = buf.len().min((meta.len() - offset) as usize);
        f.read_exact(&mut buf[..n])?;

        Ok(n)
    }

    /// Write `data` at `offset`, creating the file and its parent
    /// directories when missing and zero-filling any gap between the
    /// current size and `offset`. Zero-length writes are valid and
    /// used to finalise empty files.
    fn write_file(&self, spath: &str, data: &[u8], offset: u64) -> Result<usize, BranchError> {
        self.check_read_only()?;

        let sub = self.sub_path(spath)?;

        match fs::metadata(&sub) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = sub.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut f = fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .mode(0o644)
                    .open(&sub)?;

                if offset > 0 {
                    grow_file(&mut f, offset)?;
                }
                f.write_all(data)?;
            }
            Ok(meta) => {
                let mut f = fs::OpenOptions::new().read(true).write(true).open(&sub)?;

                if meta.len() < offset {
                    f.seek(SeekFrom::Start(meta.len()))?;
                    grow_file(&mut f, offset - meta.len())?;
                } else {
                    f.seek(SeekFrom::Start(offset))?;
                }
                f.write_all(data)?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(data.len())
    }

    /// Execute a rename, delete or mkdir relative to `spath`.
    ///
    /// Operands are reduced to their final path component; a delete
    /// name containing `*` is treated as a glob over the directory's
    /// recursive contents.
    fn item_op(&self, spath: &str, op: &ItemOp) -> Result<bool, BranchError> {
        self.check_read_only()?;

        let sub = self.sub_path(spath)?;

        // Make sure we are only dealing with plain file names
        let operand = |value: &str| -> Result<String, BranchError> {
            match value.rsplit('/').next() {
                Some(name) if !name.is_empty() => Ok(name.to_string()),
                _ => Err(BranchError::MissingOperand),
            }
        };

        match op {
            ItemOp::Mkdir { name } => {
                fs::create_dir_all(sub.join(operand(name)?))?;
                Ok(true)
            }

            ItemOp::Rename { name, new_name } => {
                let from = sub.join(operand(name)?);
                let to = sub.join(operand(new_name)?);

                if fs::symlink_metadata(&from).is_err() {
                    return Err(BranchError::NotExist);
                }
                fs::rename(from, to)?;
                Ok(true)
            }

            ItemOp::Delete { name } => {
                let name = operand(name)?;

                if name.contains('*') {
                    let rex = glob_to_regex(&name);
                    let (dirs, fis) = self.dir(spath, &rex, true, false)?;

                    for (i, dir) in dirs.iter().enumerate() {
                        for fi in &fis[i] {
                            if let Ok(target) = self.sub_path(&join_rel(dir, &fi.name)) {
                                // Parents may have been removed already
                                let _ = remove_all(&target);
                            }
                        }
                    }

                    return Ok(true);
                }

                let target = sub.join(&name);
                match fs::symlink_metadata(&target) {
                    Ok(_) => {
                        remove_all(&target)?;
                        Ok(true)
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BranchError::NotExist),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn handle_read(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>, BranchError> {
        let mut buf = READ_BUFFERS.get();
        if buf.len() < size {
            // Constantly pooling bigger buffers would eventually
            // replace all default sized buffers
            buf = vec![0; size];
        }

        let result = match self.read_file(path, &mut buf[..size], offset) {
            Ok(n) => encode(&(n as u64, buf[..n].to_vec())),
            Err(e) => Err(e),
        };

        READ_BUFFERS.put(buf);
        result
    }
}

fn grow_file(f: &mut fs::File, mut remaining: u64) -> io::Result<()> {
    let zeros = [0u8; 4096];

    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        f.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }

    Ok(())
}

fn remove_all(target: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(target)?;

    if meta.is_dir() {
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    }
}

impl DataHandler for BranchInner {
    fn handle(&self, ctrl: Ctrl, data: Vec<u8>) -> Result<Vec<u8>, String> {
        let result = match ctrl {
            Ctrl::Dir {
                path,
                pattern,
                recursive,
                checksums,
            } => self
                .dir(&path, &pattern, recursive, checksums)
                .and_then(|res| encode(&res)),

            Ctrl::Read { path, offset, size } => self.handle_read(&path, offset, size as usize),

            Ctrl::Write { path, offset } => self
                .write_file(&path, &data, offset)
                .and_then(|n| encode(&(n as u64))),

            Ctrl::ItemOp { path, op } => self.item_op(&path, &op).and_then(|ok| encode(&ok)),
        };

        result.map_err(|e| self.scrub(&e.to_string()))
    }
}
