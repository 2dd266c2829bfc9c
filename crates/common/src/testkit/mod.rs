use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use crate::branch::Branch;
use crate::config::{BranchExportConfig, TreeConfig};
use crate::node::TlsIdentity;
use crate::tree::Tree;

/// Generate a fresh self-signed TLS identity for a test node.
pub fn generate_identity() -> TlsIdentity {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate self-signed certificate");

    TlsIdentity::from_der(cert.cert.der().to_vec(), cert.key_pair.serialize_der())
        .expect("self-signed identity is valid")
}

/// Initialise test logging. Safe to call from every test; only the
/// first call wins. Set `RUST_LOG` to see transport traffic.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A branch exporting a temporary directory on an ephemeral local
/// port, with its own self-signed identity.
pub struct TestBranch {
    pub branch: Branch,
    dir: TempDir,
}

impl TestBranch {
    pub async fn start(name: &str, secret: &str, readonly: bool) -> Result<TestBranch> {
        let dir = TempDir::new()?;

        let cfg = BranchExportConfig {
            branch_name: name.to_string(),
            branch_secret: secret.to_string(),
            enable_read_only: readonly,
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: "0".to_string(),
            local_folder: dir.path().to_string_lossy().into_owned(),
        };

        let branch = Branch::new(&cfg, Some(generate_identity())).await?;
        tracing::debug!(branch = name, rpc = %branch.addr().unwrap(), "test branch started");

        Ok(TestBranch { branch, dir })
    }

    /// The endpoint a tree can reach this branch on.
    pub fn rpc(&self) -> String {
        let addr = self.branch.addr().expect("branch is running");
        format!("127.0.0.1:{}", addr.port())
    }

    pub fn fingerprint(&self) -> String {
        self.branch.ssl_fingerprint()
    }

    /// The sandbox root on the local filesystem.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn local(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Seed a file below the sandbox root, creating parents.
    pub fn seed(&self, rel: &str, content: &[u8]) {
        let path = self.local(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directories");
        }
        fs::write(path, content).expect("seed file");
    }

    pub fn seed_dir(&self, rel: &str) {
        fs::create_dir_all(self.local(rel)).expect("seed directory");
    }

    pub async fn stop(&self) {
        self.branch.shutdown().await;
    }
}

/// A tree client with its own identity, sharing `secret` with the
/// branches it should reach.
pub fn test_tree(secret: &str) -> Tree {
    Tree::new(
        &TreeConfig {
            tree_secret: secret.to_string(),
        },
        Some(generate_identity()),
    )
    .expect("tree config is valid")
}
