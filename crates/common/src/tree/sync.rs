use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::fileinfo::FileInfo;
use crate::node::ItemOp;
use crate::util::{join_tree_path, DEFAULT_READ_BUFFER_SIZE};

use super::{Tree, TreeError};

/// Sync operation names reported through the progress callback.
pub const SYNC_CREATE_DIRECTORY: &str = "Create directory";
pub const SYNC_COPY_FILE: &str = "Copy file";
pub const SYNC_REMOVE_DIRECTORY: &str = "Remove directory";
pub const SYNC_REMOVE_FILE: &str = "Remove file";

/// Per-file copy progress: relative path, written and total bytes,
/// current file index and file count.
pub type CopyProgress = dyn Fn(&str, u64, u64, u64, u64) + Send + Sync;

/// Sync progress: operation name, source and destination path, written
/// and total bytes, current item index and item count.
pub type SyncProgress = dyn Fn(&str, &str, &str, u64, u64, u64, u64) + Send + Sync;

/// Chunk-level progress reported by the copy pipe.
pub type ChunkProgress<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// How many chunks the copy pipe buffers between producer and consumer.
const COPY_PIPE_DEPTH: usize = 8;

impl Tree {
    /// Read a complete file into the given writer, chunk by chunk,
    /// until the branch reports end-of-file.
    pub async fn read_to_writer<W: Write>(
        &self,
        spath: &str,
        writer: &mut W,
    ) -> Result<(), TreeError> {
        let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
        let mut offset = 0u64;

        loop {
            match self.read_file(spath, &mut buf, offset).await {
                Ok(n) => {
                    writer
                        .write_all(&buf[..n])
                        .map_err(|e| TreeError::Io(e.to_string()))?;
                    offset += n as u64;
                }
                Err(e) if e.is_eof() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a complete file from the given reader. A trailing
    /// zero-length write at the final offset finalises the file, which
    /// is what makes empty files appear at all.
    pub async fn write_from_reader<R: Read>(
        &self,
        spath: &str,
        reader: &mut R,
    ) -> Result<(), TreeError> {
        let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
        let mut offset = 0u64;

        loop {
            let n = reader.read(&mut buf).map_err(|e| TreeError::Io(e.to_string()))?;
            if n == 0 {
                self.write_file(spath, &[], offset).await?;
                return Ok(());
            }

            self.write_file(spath, &buf[..n], offset).await?;
            offset += n as u64;
        }
    }

    /// Copy a single file inside the tree through a bounded in-memory
    /// pipe: a producer task streams source chunks into a channel, the
    /// consumer writes them to the destination. Closing the channel is
    /// the completion sentinel that triggers the finalising zero-length
    /// write.
    pub async fn copy_file(
        &self,
        src: &str,
        dst: &str,
        upd: Option<ChunkProgress<'_>>,
    ) -> Result<(), TreeError> {
        // Make sure the source exists; an empty file shows up as EOF
        match self.read_file(src, &mut [], 0).await {
            Ok(_) => {}
            Err(e) if e.is_eof() => {
                self.write_file(dst, &[], 0).await?;
                if let Some(upd) = upd {
                    // Report the creation of the empty file
                    upd(0);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let (tx, mut rx) = mpsc::channel::<Result<Bytes, TreeError>>(COPY_PIPE_DEPTH);

        let reader = self.clone();
        let src_path = src.to_string();

        let producer = tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_READ_BUFFER_SIZE];
            let mut offset = 0u64;

            loop {
                match reader.read_file(&src_path, &mut buf, offset).await {
                    Ok(n) => {
                        offset += n as u64;
                        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                    // Channel close is the completion sentinel
                    Err(e) if e.is_eof() => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let mut offset = 0u64;
        let mut result = Ok(());

        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(bytes) => match self.write_file(dst, &bytes, offset).await {
                    Ok(n) => {
                        offset += n as u64;
                        if let Some(upd) = upd {
                            upd(n as u64);
                        }
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                },
                // Read errors are reported before write errors
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        rx.close();
        let _ = producer.await;

        if result.is_ok() {
            self.write_file(dst, &[], offset).await?;
        }

        result
    }

    /// Copy files and directories to a destination directory.
    ///
    /// Directories are expanded into all contained files with their
    /// relative paths below the source; single files land at the root
    /// of the destination.
    pub async fn copy(
        &self,
        src: &[String],
        dst: &str,
        upd: Option<&CopyProgress>,
    ) -> Result<(), TreeError> {
        let mut rel_paths: Vec<String> = Vec::new();
        // Make sure any file is only copied once
        let mut files: HashMap<String, FileInfo> = HashMap::new();
        let mut sources: HashMap<String, String> = HashMap::new();

        for s in src {
            let s_norm = s.strip_suffix('/').unwrap_or(s);

            let fi = self.stat(s_norm).await.map_err(|e| TreeError::Stat {
                path: s.clone(),
                cause: e.to_string(),
            })?;

            if fi.is_dir() {
                // Find all files inside the directory
                let (dirs, fis) = self.dir(s_norm, "", true, false).await?;

                for (i, d) in dirs.iter().enumerate() {
                    for entry in &fis[i] {
                        if entry.is_dir() {
                            continue;
                        }

                        // The relative path below the source, rooted
                        // at the source directory's own name
                        let full = join_tree_path(d, &entry.name);
                        let rel =
                            join_tree_path(&format!("/{}", fi.name), &full[s_norm.len()..]);

                        if !files.contains_key(&rel) {
                            rel_paths.push(rel.clone());
                        }
                        files.insert(rel.clone(), entry.clone());
                        sources.insert(rel, full);
                    }
                }
            } else {
                // Single files always land at the destination root
                let rel = format!("/{}", fi.name);

                if !files.contains_key(&rel) {
                    rel_paths.push(rel.clone());
                }
                files.insert(rel.clone(), fi);
                sources.insert(rel, s_norm.to_string());
            }
        }

        let total_files = rel_paths.len() as u64;

        for (i, rel) in rel_paths.iter().enumerate() {
            let fi = &files[rel];
            let src_file = &sources[rel];
            let dst_file = join_tree_path(dst, rel);

            let current = i as u64 + 1;
            let total_size = fi.size;
            let written = AtomicU64::new(0);

            let chunk = |n: u64| {
                if let Some(upd) = upd {
                    let w = written.fetch_add(n, Ordering::SeqCst) + n;
                    upd(rel, w, total_size, current, total_files);
                }
            };

            self.copy_file(src_file, &dst_file, Some(&chunk))
                .await
                .map_err(|e| TreeError::Copy {
                    src: src_file.clone(),
                    dst: dst.to_string(),
                    cause: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// Make `dst_dir` structurally identical to `src_dir`: create
    /// missing directories, copy missing or checksum-divergent files
    /// and remove everything the source does not have.
    pub async fn sync(
        &self,
        src_dir: &str,
        dst_dir: &str,
        recursive: bool,
        upd: Option<&SyncProgress>,
    ) -> Result<(), TreeError> {
        // The source is queried exactly once. Walking it per directory
        // could loop forever when dst_dir is a subdirectory of src_dir.
        let (src_dirs, src_fis) = self.dir(src_dir, "", recursive, true).await?;

        let total_items: u64 = src_fis.iter().map(|fis| fis.len() as u64).sum();
        let mut current_item = 0u64;

        for (i, dir) in src_dirs.iter().enumerate() {
            self.sync_dir(
                src_dir,
                dst_dir,
                &rel_path(dir, src_dir),
                &src_fis[i],
                upd,
                &mut current_item,
                total_items,
            )
            .await?;
        }

        Ok(())
    }

    /// Sync a single directory level against its destination
    /// counterpart.
    #[allow(clippy::too_many_arguments)]
    async fn sync_dir(
        &self,
        src_dir: &str,
        dst_dir: &str,
        rel: &str,
        finfos: &[FileInfo],
        upd: Option<&SyncProgress>,
        current_item: &mut u64,
        total_items: u64,
    ) -> Result<(), TreeError> {
        let sdir = join_tree_path(src_dir, rel);
        let ddir = join_tree_path(dst_dir, rel);

        // See what the destination has at this level
        let (_, dst_fis) = self.dir(&ddir, "", false, true).await?;

        let mut dst_dirs: BTreeSet<String> = BTreeSet::new();
        let mut dst_files: BTreeMap<String, String> = BTreeMap::new();

        if let Some(entries) = dst_fis.first() {
            for fi in entries {
                if fi.is_dir() {
                    dst_dirs.insert(fi.name.clone());
                } else {
                    dst_files.insert(fi.name.clone(), fi.checksum.clone());
                }
            }
        }

        for fi in finfos {
            *current_item += 1;

            if fi.is_dir() {
                // Create directories which aren't there; matched names
                // are removed from the map so whatever remains can be
                // deleted afterwards
                if !dst_dirs.remove(&fi.name) {
                    if let Some(upd) = upd {
                        upd(
                            SYNC_CREATE_DIRECTORY,
                            "",
                            &join_tree_path(&ddir, &fi.name),
                            0,
                            0,
                            *current_item,
                            total_items,
                        );
                    }

                    self.item_op(
                        &ddir,
                        &ItemOp::Mkdir {
                            name: fi.name.clone(),
                        },
                    )
                    .await?;
                }
            } else {
                let needs_copy = match dst_files.remove(&fi.name) {
                    Some(sum) => sum != fi.checksum,
                    None => true,
                };

                if needs_copy {
                    let s = join_tree_path(&sdir, &fi.name);
                    let d = join_tree_path(&ddir, &fi.name);

                    let total_size = fi.size;
                    let item = *current_item;
                    let written = AtomicU64::new(0);

                    let chunk = |n: u64| {
                        if let Some(upd) = upd {
                            let w = written.fetch_add(n, Ordering::SeqCst) + n;
                            upd(SYNC_COPY_FILE, &s, &d, w, total_size, item, total_items);
                        }
                    };

                    if let Err(e) = self.copy_file(&s, &d, Some(&chunk)).await {
                        // Note at which point the sync stopped
                        if let Some(upd) = upd {
                            upd(SYNC_COPY_FILE, &s, &d, 0, fi.size, item, total_items);
                        }
                        return Err(e);
                    }
                }
            }
        }

        // Remove directories and files which are in the destination
        // but not in the source
        for name in dst_dirs {
            if let Some(upd) = upd {
                upd(
                    SYNC_REMOVE_DIRECTORY,
                    "",
                    &join_tree_path(&ddir, &name),
                    0,
                    0,
                    *current_item,
                    total_items,
                );
            }

            self.item_op(&ddir, &ItemOp::Delete { name }).await?;
        }

        for (name, _) in dst_files {
            if let Some(upd) = upd {
                upd(
                    SYNC_REMOVE_FILE,
                    "",
                    &join_tree_path(&ddir, &name),
                    0,
                    0,
                    *current_item,
                    total_items,
                );
            }

            self.item_op(&ddir, &ItemOp::Delete { name }).await?;
        }

        Ok(())
    }
}

/// Normalize `path` relative to `prefix`: both are rooted and stripped
/// of trailing slashes, and the prefix is removed.
fn rel_path(path: &str, prefix: &str) -> String {
    fn norm(p: &str) -> String {
        let mut p = if p.starts_with('/') {
            p.to_string()
        } else {
            format!("/{}", p)
        };
        if p.len() > 1 && p.ends_with('/') {
            p.pop();
        }
        p
    }

    let path = norm(path);
    let prefix = norm(prefix);

    match path.strip_prefix(&prefix) {
        Some("") => "/".to_string(),
        Some(rest) => rest.to_string(),
        None => path,
    }
}
