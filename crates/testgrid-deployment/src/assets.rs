//! Scripts bundled into the binary at compile time.
//!
//! Assets are looked up by logical name. A missing name is reported as
//! [`StagingError::AssetNotFound`](crate::error::StagingError::AssetNotFound)
//! by the stager before anything is written.

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Deploy script used by the Kubernetes deployer.
pub const KUBERNETES_DEPLOY_SCRIPT: &str = "kubernetes_deploy.sh";

/// Generic shell deploy entrypoint for deployment repositories that ship a
/// `deploy.sh` of their own.
pub const SHELL_DEPLOY_SCRIPT: &str = "shell_deploy.sh";

const KUBERNETES_DEPLOY_BYTES: &[u8] = include_bytes!("../assets/kubernetes_deploy.sh");
const SHELL_DEPLOY_BYTES: &[u8] = include_bytes!("../assets/shell_deploy.sh");

/// Immutable name -> bytes lookup of embedded assets.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    assets: BTreeMap<String, Arc<[u8]>>,
}

impl AssetCatalog {
    /// Catalog with no assets.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog with the scripts compiled into this crate.
    pub fn builtin() -> Self {
        Self::empty()
            .with_asset(KUBERNETES_DEPLOY_SCRIPT, KUBERNETES_DEPLOY_BYTES)
            .with_asset(SHELL_DEPLOY_SCRIPT, SHELL_DEPLOY_BYTES)
    }

    /// Add or replace an asset.
    pub fn with_asset(mut self, name: impl Into<String>, bytes: impl AsRef<[u8]>) -> Self {
        self.assets.insert(name.into(), Arc::from(bytes.as_ref()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.assets.get(name).map(|b| b.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.assets.contains_key(name)
    }

    /// Asset names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }

    /// Hex SHA-256 of an asset, if present.
    pub fn digest(&self, name: &str) -> Option<String> {
        self.get(name).map(sha256_hex)
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
