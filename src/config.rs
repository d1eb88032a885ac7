//! Invocation configuration
//!
//! Defaults can come from a YAML (or JSON) file passed with `--config`,
//! then from `KOLA_*` environment variables; command line flags are applied
//! last by the binary.
//!
//! ```yaml
//! platform: qemu
//! backend: mock
//! parallel: 4
//! distro: fcos
//! output_dir: _kola_temp
//! tags: ["!reprovision"]
//! denylist: kola-denylist.yaml
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KolaConfig {
    /// Platform name used for filtering and reporting
    pub platform: String,
    /// Provisioning backend (`mock` or `local`)
    pub backend: String,
    /// Maximum number of top-level tests running at once
    pub parallel: usize,
    pub distro: String,
    pub output_dir: PathBuf,
    /// File holding the public key injected into machines
    pub ssh_key: Option<PathBuf>,
    pub tags: Vec<String>,
    pub firmware: Option<String>,
    /// Build version, skipping detection when set
    pub os_version: Option<String>,
    pub stream: Option<String>,
    /// Deselect tests needing internet access
    pub no_net: bool,
    pub denylist: PathBuf,
    /// Rerun failed tests once
    pub rerun: bool,
    /// Tags that let a passing rerun clear the original failure
    pub rerun_success_tags: Vec<String>,
}

impl Default for KolaConfig {
    fn default() -> Self {
        Self {
            platform: "qemu".to_string(),
            backend: "mock".to_string(),
            parallel: 1,
            distro: "fcos".to_string(),
            output_dir: PathBuf::from("_kola_temp"),
            ssh_key: None,
            tags: Vec::new(),
            firmware: None,
            os_version: None,
            stream: None,
            no_net: false,
            denylist: PathBuf::from("kola-denylist.yaml"),
            rerun: false,
            rerun_success_tags: Vec::new(),
        }
    }
}

impl KolaConfig {
    /// Read a config file; `.yaml`/`.yml` is YAML, anything else JSON
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let config: KolaConfig = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid YAML config {}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid JSON config {}: {}", path.display(), e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.platform.trim().is_empty() {
            return Err(Error::Config("platform cannot be empty".into()));
        }
        if self.parallel == 0 {
            return Err(Error::Config("parallel must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply `KOLA_PLATFORM`, `KOLA_PARALLEL`, `KOLA_DISTRO` and
    /// `KOLA_OUTPUT_DIR` from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(platform) = var("KOLA_PLATFORM") {
            self.platform = platform;
        }
        if let Some(parallel) = var("KOLA_PARALLEL") {
            self.parallel = parallel.trim().parse().map_err(|_| {
                Error::Config(format!("KOLA_PARALLEL must be a number, got {:?}", parallel))
            })?;
        }
        if let Some(distro) = var("KOLA_DISTRO") {
            self.distro = distro;
        }
        if let Some(dir) = var("KOLA_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        self.validate()
    }

    /// Contents of the configured public key file, if any
    pub fn ssh_public_key(&self) -> Result<Option<String>> {
        match &self.ssh_key {
            Some(path) => {
                let key = fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("failed to read ssh key {}: {}", path.display(), e))
                })?;
                Ok(Some(key.trim().to_string()))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_load_yaml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kola.yaml");
        fs::write(&path, "platform: aws\nparallel: 8\ntags: [\"!reprovision\"]\n").unwrap();
        let config = KolaConfig::load(&path).unwrap();
        assert_eq!(config.platform, "aws");
        assert_eq!(config.parallel, 8);
        assert_eq!(config.tags, vec!["!reprovision"]);
        assert_eq!(config.distro, "fcos");
        assert_eq!(config.backend, "mock");
    }

    #[test]
    fn test_load_json_and_reject_zero_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kola.json");
        fs::write(&path, r#"{"parallel": 0}"#).unwrap();
        assert!(matches!(KolaConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KOLA_PLATFORM", "gcp"),
            ("KOLA_PARALLEL", "3"),
            ("KOLA_OUTPUT_DIR", "/tmp/kola-out"),
        ]
        .into_iter()
        .collect();
        let mut config = KolaConfig::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.platform, "gcp");
        assert_eq!(config.parallel, 3);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/kola-out"));
        assert_eq!(config.distro, "fcos");

        let mut config = KolaConfig::default();
        let err = config
            .apply_overrides_from(|k| (k == "KOLA_PARALLEL").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KOLA_PARALLEL"));
    }

    #[test]
    fn test_ssh_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.pub");
        fs::write(&path, "ssh-ed25519 AAAA test@kola\n").unwrap();
        let config = KolaConfig {
            ssh_key: Some(path),
            ..Default::default()
        };
        assert_eq!(
            config.ssh_public_key().unwrap().as_deref(),
            Some("ssh-ed25519 AAAA test@kola")
        );
    }
}
