//! Materializes the on-disk working tree one engine invocation reads.
//!
//! Layout:
//!
//! ```text
//! <path>/
//!   project/            playbook copied in (empty for role targets)
//!   inventory/hosts     localhost, local connection
//!   env/extravars       run parameters, JSON
//!   env/settings        event receiver coordinates, JSON
//!   env/envvars         environment exported to the engine, JSON
//! ```

use crate::error::Result;
use crate::watches::Target;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

const INVENTORY: &str = "localhost ansible_connection=local\n";

/// One run's working tree. The path is stable per CR; the contents are
/// rewritten wholesale before every launch.
pub struct InputDir {
    pub path: PathBuf,
    pub target: Target,
    pub parameters: Map<String, Value>,
    pub env_vars: BTreeMap<String, String>,
    pub settings: BTreeMap<String, String>,
}

impl InputDir {
    /// Write the full tree, replacing whatever a previous run left behind.
    pub async fn write(&self) -> Result<()> {
        for subdir in ["project", "inventory", "env"] {
            tokio::fs::create_dir_all(self.path.join(subdir)).await?;
        }

        if let Target::Playbook(playbook) = &self.target {
            let file_name = playbook
                .file_name()
                .map(Path::new)
                .unwrap_or_else(|| Path::new("playbook.yaml"));
            tokio::fs::copy(playbook, self.path.join("project").join(file_name)).await?;
        }

        tokio::fs::write(self.path.join("inventory").join("hosts"), INVENTORY).await?;
        tokio::fs::write(
            self.path.join("env").join("extravars"),
            serde_json::to_vec(&self.parameters)?,
        )
        .await?;
        tokio::fs::write(
            self.path.join("env").join("settings"),
            serde_json::to_vec(&self.settings)?,
        )
        .await?;
        tokio::fs::write(
            self.path.join("env").join("envvars"),
            serde_json::to_vec(&self.env_vars)?,
        )
        .await?;
        debug!(msg = "wrote input directory", path = %self.path.display());
        Ok(())
    }
}
