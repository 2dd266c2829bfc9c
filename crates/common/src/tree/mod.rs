use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::TreeConfig;
use crate::fileinfo::FileInfo;
use crate::node::{self, Client, Ctrl, ItemOp, TlsIdentity};
use crate::util::{create_mapping_path, join_tree_path, split_dir_file};

mod item;
mod sync;

pub use sync::{
    ChunkProgress, CopyProgress, SyncProgress, SYNC_COPY_FILE, SYNC_CREATE_DIRECTORY,
    SYNC_REMOVE_DIRECTORY, SYNC_REMOVE_FILE,
};

use item::TreeItem;

/// Errors of the tree client.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error(transparent)]
    Node(#[from] node::Error),

    /// Every branch applicable to the requested path refused writes.
    #[error("All applicable branches for the requested path were mounted as not writable")]
    NotWritable,

    /// A branch presented a certificate contradicting the configured pin.
    #[error("Remote branch has an unexpected fingerprint\nPresented fingerprint: {presented}\nExpected fingerprint : {expected}")]
    FingerprintMismatch { presented: String, expected: String },

    #[error("{0}")]
    Pattern(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Config(String),

    #[error("Cannot stat {path}: {cause}")]
    Stat { path: String, cause: String },

    #[error("Cannot copy {src} to {dst}: {cause}")]
    Copy {
        src: String,
        dst: String,
        cause: String,
    },
}

impl TreeError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, TreeError::Node(e) if e.is_not_exist())
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, TreeError::Node(e) if e.is_eof())
    }
}

/// A known branch: name, endpoint and pinned fingerprint. An empty
/// fingerprint means trust-on-first-use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub branch: String,
    pub rpc: String,
    pub fingerprint: String,
}

/// A requested mapping from a tree path to a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSpec {
    pub path: String,
    pub branch: String,
    #[serde(rename = "writeable")]
    pub writable: bool,
}

/// The tree-client configuration exchange document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingDocument {
    #[serde(default)]
    pub branches: Vec<BranchSpec>,
    #[serde(default)]
    pub tree: Vec<MappingSpec>,
}

/// A tree overlays several remote branches under one virtual
/// namespace.
///
/// `branches_all`/`mapping_all` are authoritative across refreshes;
/// the live mapping tree only ever contains mappings whose branch is
/// currently reachable. Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct Tree {
    inner: Arc<TreeInner>,
}

struct TreeInner {
    client: Client,
    state: RwLock<TreeState>,
}

#[derive(Default)]
struct TreeState {
    root: TreeItem,
    branches: Vec<BranchSpec>,
    branches_all: Vec<BranchSpec>,
    mapping: Vec<MappingSpec>,
    mapping_all: Vec<MappingSpec>,
}

impl Tree {
    pub fn new(cfg: &TreeConfig, identity: Option<TlsIdentity>) -> Result<Tree, TreeError> {
        cfg.check().map_err(|e| TreeError::Config(e.to_string()))?;

        Ok(Tree {
            inner: Arc::new(TreeInner {
                client: Client::new(&cfg.tree_secret, identity),
                state: RwLock::new(TreeState::default()),
            }),
        })
    }

    /// The tree's RPC client.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// The current configuration as a JSON mapping document.
    pub async fn config(&self) -> String {
        let state = self.inner.state.read().await;

        let doc = MappingDocument {
            branches: state.branches.clone(),
            tree: state.mapping.clone(),
        };

        serde_json::to_string_pretty(&doc).unwrap_or_default()
    }

    /// Apply a JSON mapping document, replacing the current
    /// configuration. Branches and mappings that cannot be applied
    /// (e.g. unreachable branches) are logged and skipped.
    pub async fn set_mapping(&self, document: &str) -> Result<(), TreeError> {
        let doc: MappingDocument =
            serde_json::from_str(document).map_err(|e| TreeError::Config(e.to_string()))?;

        self.reset(true).await;

        for b in &doc.branches {
            if let Err(e) = self.add_branch(&b.branch, &b.rpc, &b.fingerprint).await {
                tracing::warn!(branch = %b.branch, error = %e, "could not add branch from mapping document");
            }
        }
        for m in &doc.tree {
            if let Err(e) = self.add_mapping(&m.path, &m.branch, m.writable).await {
                tracing::warn!(branch = %m.branch, path = %m.path, error = %e, "could not add mapping from mapping document");
            }
        }

        Ok(())
    }

    /// All known branches, reachable or not, keyed by name.
    pub async fn known_branches(&self) -> HashMap<String, BranchSpec> {
        let state = self.inner.state.read().await;

        state
            .branches_all
            .iter()
            .map(|b| (b.branch.clone(), b.clone()))
            .collect()
    }

    /// Names and fingerprints of all currently reachable branches.
    pub fn active_branches(&self) -> (Vec<String>, Vec<String>) {
        self.inner.client.peers()
    }

    /// All known branches which are currently not reachable.
    pub async fn not_reachable_branches(&self) -> HashMap<String, BranchSpec> {
        let state = self.inner.state.read().await;

        let active: Vec<&str> = state.branches.iter().map(|b| b.branch.as_str()).collect();

        state
            .branches_all
            .iter()
            .filter(|b| !active.contains(&b.branch.as_str()))
            .map(|b| (b.branch.clone(), b.clone()))
            .collect()
    }

    /// Ping a remote branch and return its fingerprint.
    pub async fn ping_branch(&self, node: &str, rpc: &str) -> Result<String, TreeError> {
        let (_, fp) = self.inner.client.send_ping(node, rpc).await?;
        Ok(fp)
    }

    /// Reset all mounts, and with `branches` also all known branches.
    pub async fn reset(&self, branches: bool) {
        let mut state = self.inner.state.write().await;

        if branches {
            let (peers, _) = self.inner.client.peers();
            for p in peers {
                self.inner.client.remove_peer(&p);
            }

            state.branches.clear();
            state.branches_all.clear();
        }

        state.mapping.clear();
        state.mapping_all.clear();
        state.root = TreeItem::default();
    }

    /// Re-ping every known branch, move branches between the reachable
    /// and unreachable sets and rebuild the live mapping tree from the
    /// authoritative mapping list.
    pub async fn refresh(&self) {
        // Ping outside of the write lock; in-flight readers keep
        // working against the old tree meanwhile.
        let branches_all = {
            let state = self.inner.state.read().await;
            state.branches_all.clone()
        };

        let mut reachable: Vec<String> = Vec::new();
        for spec in &branches_all {
            match self.inner.client.send_ping(&spec.branch, &spec.rpc).await {
                Ok(_) => reachable.push(spec.branch.clone()),
                Err(e) => {
                    tracing::debug!(branch = %spec.branch, error = %e, "branch not reachable");
                }
            }
        }

        let mut state = self.inner.state.write().await;

        // Deregister branches that went away
        for spec in &state.branches {
            if !reachable.contains(&spec.branch) {
                tracing::info!(branch = %spec.branch, "branch no longer reachable");
                self.inner.client.remove_peer(&spec.branch);
            }
        }
        state.branches.retain(|b| reachable.contains(&b.branch));

        // Register branches that came (back) into reach
        for spec in &branches_all {
            if reachable.contains(&spec.branch) && !self.inner.client.is_registered(&spec.branch) {
                if let Err(e) =
                    self.inner
                        .client
                        .register_peer(&spec.branch, &spec.rpc, &spec.fingerprint)
                {
                    tracing::warn!(branch = %spec.branch, error = %e, "could not re-register branch");
                    continue;
                }
                tracing::info!(branch = %spec.branch, "branch reachable again");
                state.branches.push(spec.clone());
            }
        }

        // Rebuild the live mapping tree; readers never observe a
        // partially rebuilt tree since this happens under the write lock
        state.root = TreeItem::default();
        state.mapping.clear();

        let mapping_all = state.mapping_all.clone();
        for m in mapping_all {
            if self.inner.client.is_registered(&m.branch) {
                state
                    .root
                    .add_mapping(&create_mapping_path(&m.path), &m.branch, m.writable);
                state.mapping.push(m);
            }
        }
    }

    /// Add a branch to the tree. The branch is pinged first; with an
    /// empty fingerprint the observed one is adopted, a non-empty one
    /// must match what the branch presents.
    pub async fn add_branch(
        &self,
        branch_name: &str,
        rpc: &str,
        fingerprint: &str,
    ) -> Result<(), TreeError> {
        let spec = BranchSpec {
            branch: branch_name.to_string(),
            rpc: rpc.to_string(),
            fingerprint: fingerprint.to_string(),
        };

        // Every attempted branch is remembered, reachable or not
        let all_idx = {
            let mut state = self.inner.state.write().await;
            state.branches_all.push(spec.clone());
            state.branches_all.len() - 1
        };

        let (_, observed) = self.inner.client.send_ping(branch_name, rpc).await?;

        if !fingerprint.is_empty() && fingerprint != observed {
            return Err(TreeError::FingerprintMismatch {
                presented: observed,
                expected: fingerprint.to_string(),
            });
        }

        let mut state = self.inner.state.write().await;

        self.inner
            .client
            .register_peer(branch_name, rpc, &observed)?;

        // Once accepted the fingerprint is pinned; remote branches
        // never change their certificate within a network session
        let mut spec = spec;
        spec.fingerprint = observed;
        state.branches_all[all_idx].fingerprint = spec.fingerprint.clone();
        state.branches.push(spec);

        Ok(())
    }

    /// Add a mapping from a tree path to a branch. The mapping is
    /// always remembered; it only becomes live when the branch is
    /// currently reachable.
    pub async fn add_mapping(
        &self,
        dir: &str,
        branch_name: &str,
        writable: bool,
    ) -> Result<(), TreeError> {
        let mut state = self.inner.state.write().await;

        let spec = MappingSpec {
            path: dir.to_string(),
            branch: branch_name.to_string(),
            writable,
        };
        state.mapping_all.push(spec.clone());

        if !self.inner.client.is_registered(branch_name) {
            return Err(node::Error::UnknownTarget(branch_name.to_string()).into());
        }

        state
            .root
            .add_mapping(&create_mapping_path(dir), branch_name, writable);
        state.mapping.push(spec);

        Ok(())
    }

    /// Render the mapping tree, one namespace level per line.
    pub async fn tree_string(&self) -> String {
        let state = self.inner.state.read().await;

        let mut out = String::from("/: ");
        state.root.render(1, &mut out);
        out
    }

    /// List the contents of a tree path matching a pattern, merging
    /// the overlayed branches.
    ///
    /// When several branches own the same tree path, entries are
    /// deduplicated by file name and the first branch in mapping order
    /// wins. Mapping components without a physical directory are
    /// synthesised as pseudo-directories.
    pub async fn dir(
        &self,
        dir: &str,
        pattern: &str,
        recursive: bool,
        checksums: bool,
    ) -> Result<(Vec<String>, Vec<Vec<FileInfo>>), TreeError> {
        let (paths, infos, failure) = self.dir_partial(dir, pattern, recursive, checksums).await;

        match failure {
            Some(e) => Err(e),
            None => Ok((paths, infos)),
        }
    }

    /// Shared listing walk behind [`Tree::dir`] and [`Tree::stat`].
    ///
    /// The first branch error stops further requests, but whatever was
    /// merged from branches visited before it is kept and returned
    /// alongside the error, so callers can decide whether a partial
    /// result is good enough.
    async fn dir_partial(
        &self,
        dir: &str,
        pattern: &str,
        recursive: bool,
        checksums: bool,
    ) -> (Vec<String>, Vec<Vec<FileInfo>>, Option<TreeError>) {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                return (
                    Vec::new(),
                    Vec::new(),
                    Some(TreeError::Pattern(e.to_string())),
                )
            }
        };

        let state = self.inner.state.read().await;

        // Strip a trailing slash to normalize the input
        let dir = dir.strip_suffix('/').unwrap_or(dir);

        let mut visits = Vec::new();
        state
            .root
            .find_path_branches("/", &create_mapping_path(dir), recursive, &mut visits);

        let mut paths: Vec<String> = Vec::new();
        let mut infos: Vec<Vec<FileInfo>> = Vec::new();
        let mut failure: Option<TreeError> = None;

        for visit in &visits {
            for (branch, _) in &visit.branches {
                // The first error stops further requests; results
                // merged so far stay
                if failure.is_some() {
                    continue;
                }

                let payload = match self
                    .inner
                    .client
                    .send_data(
                        branch,
                        Ctrl::Dir {
                            path: visit.branch_path.join("/"),
                            pattern: pattern.to_string(),
                            recursive,
                            checksums,
                        },
                        Vec::new(),
                    )
                    .await
                {
                    Ok(payload) => payload,
                    Err(e) => {
                        failure = Some(e.into());
                        continue;
                    }
                };

                let (bdirs, bfis): (Vec<String>, Vec<Vec<FileInfo>>) =
                    match bincode::deserialize(&payload) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            failure = Some(TreeError::Decode(e.to_string()));
                            continue;
                        }
                    };

                for (i, d) in bdirs.iter().enumerate() {
                    let tree_dir = join_tree_path(&visit.tree_path, d);

                    match paths.iter().position(|p| p == &tree_dir) {
                        Some(j) => {
                            // Merge, first branch in order wins on
                            // name conflicts
                            for fi in &bfis[i] {
                                if !infos[j].iter().any(|have| have.name == fi.name) {
                                    infos[j].push(fi.clone());
                                }
                            }
                        }
                        None => {
                            paths.push(tree_dir);
                            infos.push(bfis[i].clone());
                        }
                    }
                }
            }
        }

        // Second pass over the same traversal: synthesise pseudo
        // directories for mapping components which have no physical
        // counterpart
        let mut dirs_map: HashMap<String, usize> = paths
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();

        for visit in &visits {
            if !visit.tree_path.starts_with(dir) {
                continue;
            }

            let idx = match dirs_map.get(&visit.tree_path) {
                Some(&idx) => idx,
                None => {
                    paths.push(visit.tree_path.clone());
                    infos.push(Vec::new());
                    let idx = paths.len() - 1;
                    dirs_map.insert(visit.tree_path.clone(), idx);
                    idx
                }
            };

            for child in &visit.children {
                let present = infos[idx].iter().any(|fi| &fi.name == child);

                if !present && re.is_match(child) {
                    infos[idx].push(FileInfo::pseudo_dir(child));
                }
            }
        }

        (paths, infos, failure)
    }

    /// Stat a single tree path. Directories and files alike show up as
    /// the matching entry of their parent's listing.
    ///
    /// A branch failing mid-listing does not hide an entry an earlier,
    /// healthy branch already contributed: the entry wins and the
    /// error is dropped.
    pub async fn stat(&self, item: &str) -> Result<FileInfo, TreeError> {
        let (dir, file) = split_dir_file(item);

        let (paths, infos, failure) = self.dir_partial(dir, file, false, true).await;

        if paths.len() == 1 {
            if let Some(fi) = infos[0].iter().find(|fi| fi.name == file) {
                return Ok(fi.clone());
            }
        }

        Err(failure.unwrap_or_else(|| node::Error::not_exist().into()))
    }

    /// Read up to `buf.len()` bytes at `offset` from the first branch
    /// that owns the file.
    ///
    /// Branches are tried in overlay order; not-exists from earlier
    /// branches is skipped in favour of later ones, EOF is terminal
    /// and propagated so streaming loops stop.
    pub async fn read_file(
        &self,
        spath: &str,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize, TreeError> {
        let state = self.inner.state.read().await;

        let (dir, file) = split_dir_file(spath);

        let mut visits = Vec::new();
        state
            .root
            .find_path_branches("/", &create_mapping_path(dir), false, &mut visits);

        let mut last = node::Error::not_exist();

        for visit in &visits {
            for (branch, _) in &visit.branches {
                let rpath = branch_file_path(&visit.branch_path, file);

                match self
                    .inner
                    .client
                    .send_data(
                        branch,
                        Ctrl::Read {
                            path: rpath,
                            offset,
                            size: buf.len() as u64,
                        },
                        Vec::new(),
                    )
                    .await
                {
                    Ok(payload) => {
                        let (n, bytes): (u64, Vec<u8>) = bincode::deserialize(&payload)
                            .map_err(|e| TreeError::Decode(e.to_string()))?;

                        let n = n as usize;
                        buf[..n].copy_from_slice(&bytes[..n]);
                        return Ok(n);
                    }
                    Err(e) if e.is_eof() => {
                        // EOF is terminal, the caller needs to see it
                        return Err(e.into());
                    }
                    Err(e) => last = e,
                }
            }
        }

        Err(last.into())
    }

    /// Write `data` at `offset` to every writable branch mapped at the
    /// path, in mapping order. Fails when nothing applicable accepts
    /// writes.
    pub async fn write_file(
        &self,
        spath: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, TreeError> {
        let state = self.inner.state.read().await;

        let (dir, file) = split_dir_file(spath);

        let mut visits = Vec::new();
        state
            .root
            .find_path_branches("/", &create_mapping_path(dir), false, &mut visits);

        let mut total = 0;
        let mut ignored = 0;
        let mut written = 0usize;

        for visit in &visits {
            for (branch, writable) in &visit.branches {
                total += 1;

                if !writable {
                    // Ignore all non-writable branches
                    ignored += 1;
                    continue;
                }

                let rpath = branch_file_path(&visit.branch_path, file);

                let payload = self
                    .inner
                    .client
                    .send_data(
                        branch,
                        Ctrl::Write {
                            path: rpath,
                            offset,
                        },
                        data.to_vec(),
                    )
                    .await?;

                let n: u64 = bincode::deserialize(&payload)
                    .map_err(|e| TreeError::Decode(e.to_string()))?;
                written = n as usize;
            }
        }

        if total == ignored {
            return Err(TreeError::NotWritable);
        }

        Ok(written)
    }

    /// Execute a file or directory operation on every writable branch
    /// mapped at `dir`. A name operand ending in `**` applies the
    /// operation through the whole subtree.
    ///
    /// Partial failures aggregate: all read-only means not-writable,
    /// everything applicable reporting not-exists means not-exists,
    /// and any single success yields `true`.
    pub async fn item_op(&self, dir: &str, op: &ItemOp) -> Result<bool, TreeError> {
        let state = self.inner.state.read().await;

        let recursive = op.name().ends_with("**");

        let mut visits = Vec::new();
        state
            .root
            .find_path_branches("/", &create_mapping_path(dir), recursive, &mut visits);

        let mut total = 0;
        let mut ignored = 0;
        let mut not_found = 0;
        let mut result = false;
        let mut failure: Option<node::Error> = None;

        for visit in &visits {
            for (branch, writable) in &visit.branches {
                total += 1;

                if !writable {
                    // Ignore all non-writable branches
                    ignored += 1;
                    continue;
                }
                if failure.is_some() {
                    continue;
                }

                match self
                    .inner
                    .client
                    .send_data(
                        branch,
                        Ctrl::ItemOp {
                            path: visit.branch_path.join("/"),
                            op: op.clone(),
                        },
                        Vec::new(),
                    )
                    .await
                {
                    Ok(payload) => {
                        let ok: bool = bincode::deserialize(&payload)
                            .map_err(|e| TreeError::Decode(e.to_string()))?;
                        // One positive result is enough
                        result = result || ok;
                    }
                    Err(e) if e.is_not_exist() => {
                        // Only some branches may hold the item; count
                        // and keep going
                        not_found += 1;
                    }
                    Err(e) => failure = Some(e),
                }
            }
        }

        if total == ignored {
            return Err(TreeError::NotWritable);
        }
        if total == not_found + ignored {
            return Err(node::Error::not_exist().into());
        }
        if let Some(e) = failure {
            return Err(e.into());
        }

        Ok(result)
    }
}

/// Join the remaining branch path with a file name into the path sent
/// to a branch. Branch paths have no leading slash.
fn branch_file_path(branch_path: &[String], file: &str) -> String {
    let joined = branch_path.join("/");

    if joined.is_empty() {
        file.to_string()
    } else if file.is_empty() {
        joined
    } else {
        format!("{}/{}", joined, file)
    }
}
