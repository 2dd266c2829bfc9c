use serde::{Deserialize, Serialize};

/// Current version of the canopy protocol stack.
pub const PRODUCT_VERSION: &str = "1.1.0";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing {0} key in branch export config")]
    MissingBranchKey(&'static str),
    #[error("Missing {0} key in tree config")]
    MissingTreeKey(&'static str),
}

/// Configuration of an exported branch.
///
/// The serde names are the persisted key names, so records written by
/// existing deployments keep loading unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchExportConfig {
    /// Unique branch name in the deployment.
    #[serde(rename = "BranchName")]
    pub branch_name: String,
    /// Shared secret clients must prove knowledge of.
    #[serde(rename = "BranchSecret")]
    pub branch_secret: String,
    /// Reject all mutating operations when set.
    #[serde(rename = "EnableReadOnly")]
    pub enable_read_only: bool,
    /// Interface to bind the RPC listener on.
    #[serde(rename = "RPCHost")]
    pub rpc_host: String,
    /// Port for the RPC listener.
    #[serde(rename = "RPCPort")]
    pub rpc_port: String,
    /// Local folder which is being made available.
    #[serde(rename = "LocalFolder")]
    pub local_folder: String,
}

impl Default for BranchExportConfig {
    fn default() -> Self {
        BranchExportConfig {
            branch_name: String::new(),
            branch_secret: String::new(),
            enable_read_only: false,
            rpc_host: String::new(),
            rpc_port: "9020".to_string(),
            local_folder: "share".to_string(),
        }
    }
}

impl BranchExportConfig {
    /// Check that every required key carries a value.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.branch_name.is_empty() {
            return Err(ConfigError::MissingBranchKey("BranchName"));
        }
        if self.branch_secret.is_empty() {
            return Err(ConfigError::MissingBranchKey("BranchSecret"));
        }
        if self.rpc_port.is_empty() {
            return Err(ConfigError::MissingBranchKey("RPCPort"));
        }
        if self.local_folder.is_empty() {
            return Err(ConfigError::MissingBranchKey("LocalFolder"));
        }
        Ok(())
    }

    /// The endpoint the branch listener binds, `host:port`. An empty
    /// host binds all interfaces.
    pub fn rpc_endpoint(&self) -> String {
        if self.rpc_host.is_empty() {
            return format!("0.0.0.0:{}", self.rpc_port);
        }
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }
}

/// Configuration of a tree which imports branches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Shared secret presented to branches.
    #[serde(rename = "TreeSecret")]
    pub tree_secret: String,
}

impl TreeConfig {
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.tree_secret.is_empty() {
            return Err(ConfigError::MissingTreeKey("TreeSecret"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_config_defaults() {
        let cfg = BranchExportConfig::default();

        assert_eq!(cfg.rpc_port, "9020");
        assert_eq!(cfg.local_folder, "share");
        assert!(!cfg.enable_read_only);
        assert_eq!(
            cfg.check(),
            Err(ConfigError::MissingBranchKey("BranchName"))
        );
    }

    #[test]
    fn test_branch_config_roundtrip_uses_persisted_keys() {
        let cfg = BranchExportConfig {
            branch_name: "footest".into(),
            branch_secret: "123".into(),
            ..Default::default()
        };

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"BranchName\":\"footest\""));
        assert!(json.contains("\"EnableReadOnly\":false"));

        let back: BranchExportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.branch_name, "footest");
        assert!(back.check().is_ok());
    }

    #[test]
    fn test_tree_config_check() {
        assert_eq!(
            TreeConfig::default().check(),
            Err(ConfigError::MissingTreeKey("TreeSecret"))
        );
        assert!(TreeConfig {
            tree_secret: "123".into()
        }
        .check()
        .is_ok());
    }
}
