//! Platform Module
//!
//! Machines are provisioned through three traits so the dispatcher never
//! depends on a particular backend:
//! - [`Provider`] creates one [`Cluster`] per test
//! - [`Cluster`] boots [`Machine`]s from a rendered [`Conf`]
//! - [`Machine`] runs shell commands, reboots and is destroyed
//!
//! Two backends ship with the crate: [`mock`] (scriptable, in-memory) and
//! [`local`] (the host itself is the single machine).
//!
//! # Example
//!
//! ```no_run
//! use kola::platform::{mock::MockProvider, Provider, RuntimeConfig, MachineOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = MockProvider::new("qemu");
//!     let cluster = provider.new_cluster(RuntimeConfig::default()).await?;
//!     let m = cluster.new_machine(None, &MachineOptions::default()).await?;
//!
//!     let output = m.ssh("echo hello").await?;
//!     println!("Output: {}", output.stdout_str());
//!
//!     cluster.destroy().await?;
//!     Ok(())
//! }
//! ```

pub mod local;
pub mod mock;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::conf::{Conf, WarningsAction};
use crate::register::{Flag, Test};
use crate::util;
use crate::{Error, ExecOutput, Result};

/// Poll interval while waiting for a machine to come back from a reboot
const REBOOT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-test cluster configuration derived from the descriptor
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Directory for per-test artifacts (console logs, journals)
    pub output_dir: PathBuf,
    /// Public key authorized on every machine unless suppressed
    pub ssh_public_key: Option<String>,
    pub no_ssh_key_in_user_data: bool,
    pub no_ssh_key_in_metadata: bool,
    pub no_instance_creds: bool,
    /// Machines may reach the internet
    pub internet_access: bool,
    pub warnings_action: WarningsAction,
}

impl RuntimeConfig {
    /// Derive the cluster configuration for `test`
    pub fn for_test(test: &Test, output_dir: PathBuf, ssh_public_key: Option<String>) -> Self {
        Self {
            output_dir,
            ssh_public_key,
            no_ssh_key_in_user_data: test.has_flag(Flag::NoSshKeyInUserData),
            no_ssh_key_in_metadata: test.has_flag(Flag::NoSshKeyInMetadata),
            no_instance_creds: test.has_flag(Flag::NoInstanceCreds),
            internet_access: test.has_flag(Flag::RequiresInternet)
                || test.has_tag(crate::filter::NEEDS_INTERNET_TAG),
            warnings_action: if test.has_flag(Flag::AllowConfigWarnings) {
                WarningsAction::IgnoreWarnings
            } else {
                WarningsAction::FailWarnings
            },
        }
    }
}

/// Per-machine resources requested by the descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineOptions {
    pub additional_disks: Vec<String>,
    pub min_memory: Option<usize>,
    pub min_disk_size: Option<usize>,
    pub additional_nics: usize,
    pub append_kernel_args: Option<String>,
}

impl MachineOptions {
    pub fn for_test(test: &Test) -> Self {
        Self {
            additional_disks: test.additional_disks.clone(),
            min_memory: test.min_memory,
            min_disk_size: test.min_disk_size,
            additional_nics: test.additional_nics,
            append_kernel_args: test.append_kernel_args.clone(),
        }
    }
}

/// A provisioned machine
#[async_trait]
pub trait Machine: Send + Sync {
    /// Backend-specific identifier
    fn id(&self) -> &str;

    /// Address the harness reaches the machine on
    fn ip(&self) -> String;

    /// Run `cmd` through the remote shell, feeding `stdin`
    async fn exec(&self, cmd: &str, stdin: &[u8]) -> Result<ExecOutput>;

    /// Run `cmd` with no input
    async fn ssh(&self, cmd: &str) -> Result<ExecOutput> {
        self.exec(cmd, &[]).await
    }

    /// Trigger a reboot without waiting for it to complete
    async fn reboot(&self) -> Result<()>;

    /// Stop and release the machine
    async fn destroy(&self) -> Result<()>;

    /// Everything the machine wrote to its console so far
    async fn console_output(&self) -> String;

    /// Current kernel boot ID
    async fn boot_id(&self) -> Result<String> {
        let out = self.ssh("cat /proc/sys/kernel/random/boot_id").await?;
        if !out.success() {
            return Err(Error::ssh("cat /proc/sys/kernel/random/boot_id", &out));
        }
        Ok(out.stdout_str().trim().to_string())
    }

    /// Wait until the machine answers with a boot ID different from
    /// `old_boot_id`
    async fn wait_for_reboot(&self, timeout: Duration, old_boot_id: &str) -> Result<()> {
        util::retry_until(timeout, REBOOT_POLL_INTERVAL, move || async move {
            match self.boot_id().await {
                Ok(id) if id != old_boot_id => Ok(()),
                Ok(_) => Err(Error::Timeout(format!(
                    "machine {} has not rebooted yet",
                    self.id()
                ))),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| Error::Timeout(format!("waiting for {} to reboot: {}", self.id(), e)))
    }

    /// Write `contents` to `path` with `mode`
    async fn install_file(&self, contents: &[u8], path: &str, mode: u32) -> Result<()> {
        let path = shell_words::quote(path);
        let cmd = format!("cat > {path} && chmod {mode:o} {path}");
        let out = self.exec(&cmd, contents).await?;
        if !out.success() {
            return Err(Error::ssh(cmd, &out));
        }
        Ok(())
    }
}

/// The set of machines owned by one test
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Platform name used for filtering and reporting
    fn platform(&self) -> &str;

    fn runtime_config(&self) -> &RuntimeConfig;

    /// Boot a machine with `conf` as first-boot configuration
    async fn new_machine(
        &self,
        conf: Option<&Conf>,
        options: &MachineOptions,
    ) -> Result<Arc<dyn Machine>>;

    /// Machines created so far, in creation order
    fn machines(&self) -> Vec<Arc<dyn Machine>>;

    /// Destroy every machine
    async fn destroy(&self) -> Result<()>;
}

/// A provisioning backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Platform name (`qemu`, `aws`, ...)
    fn name(&self) -> &str;

    async fn new_cluster(&self, config: RuntimeConfig) -> Result<Arc<dyn Cluster>>;
}

/// Build the provider for `backend`, reporting itself as `platform`
pub fn provider_for(backend: &str, platform: &str) -> Result<Arc<dyn Provider>> {
    match backend {
        "mock" => Ok(Arc::new(mock::MockProvider::new(platform))),
        "local" => Ok(Arc::new(local::LocalProvider::new(platform))),
        other => Err(Error::Unsupported(format!(
            "no provisioning backend named {:?} (available: local, mock)",
            other
        ))),
    }
}

/// Apply the descriptor's user-data policy and produce the configuration a
/// machine boots with
pub fn render_conf(
    user_data: Option<&crate::conf::UserData>,
    config: &RuntimeConfig,
) -> Result<Conf> {
    let mut conf = match user_data {
        Some(ud) => ud.render(config.warnings_action)?,
        None => Conf::Empty,
    };
    if !config.no_ssh_key_in_user_data {
        if let Some(key) = &config.ssh_public_key {
            conf.add_authorized_keys("core", std::slice::from_ref(key))?;
        }
    }
    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::UserData;

    #[test]
    fn test_runtime_config_from_flags() {
        let test = Test::new("a.b", |_c| async { Ok(()) })
            .flag(Flag::NoSshKeyInUserData)
            .flag(Flag::AllowConfigWarnings)
            .tags(&["needs-internet"]);
        let rc = RuntimeConfig::for_test(&test, PathBuf::from("/tmp/out"), Some("ssh-rsa A".into()));
        assert!(rc.no_ssh_key_in_user_data);
        assert!(!rc.no_ssh_key_in_metadata);
        assert!(rc.internet_access);
        assert_eq!(rc.warnings_action, WarningsAction::IgnoreWarnings);
    }

    #[test]
    fn test_render_conf_injects_key() {
        let rc = RuntimeConfig {
            ssh_public_key: Some("ssh-ed25519 KOLA".into()),
            ..Default::default()
        };
        let conf = render_conf(None, &rc).unwrap();
        assert!(conf.to_string().contains("ssh-ed25519 KOLA"));

        let rc = RuntimeConfig {
            no_ssh_key_in_user_data: true,
            ..rc
        };
        let ud = UserData::ignition(r#"{"ignition":{"version":"3.0.0"}}"#);
        let conf = render_conf(Some(&ud), &rc).unwrap();
        assert!(!conf.to_string().contains("ssh-ed25519 KOLA"));
    }

    #[test]
    fn test_provider_for_unknown_backend() {
        assert!(provider_for("mock", "qemu").is_ok());
        assert!(matches!(
            provider_for("gce-real", "gce"),
            Err(Error::Unsupported(_))
        ));
    }
}
