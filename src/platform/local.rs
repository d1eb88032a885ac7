//! Local platform
//!
//! Treats the host running the harness as the one machine of every
//! cluster. Commands run through `sh -c`; rebooting is not supported.
//! Useful for running native functions and shell-only checks directly on a
//! CoreOS host.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Cluster, Machine, MachineOptions, Provider, RuntimeConfig};
use crate::conf::Conf;
use crate::{Error, ExecOutput, Result};

/// Provider whose clusters contain the local host
#[derive(Debug, Clone)]
pub struct LocalProvider {
    platform: String,
}

impl LocalProvider {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.platform
    }

    async fn new_cluster(&self, config: RuntimeConfig) -> Result<Arc<dyn Cluster>> {
        Ok(Arc::new(LocalCluster {
            platform: self.platform.clone(),
            config,
            machine: Mutex::new(None),
        }))
    }
}

/// A cluster holding at most one [`LocalMachine`]
pub struct LocalCluster {
    platform: String,
    config: RuntimeConfig,
    machine: Mutex<Option<Arc<LocalMachine>>>,
}

#[async_trait]
impl Cluster for LocalCluster {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn runtime_config(&self) -> &RuntimeConfig {
        &self.config
    }

    async fn new_machine(
        &self,
        conf: Option<&Conf>,
        _options: &MachineOptions,
    ) -> Result<Arc<dyn Machine>> {
        let mut slot = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(Error::Unsupported(
                "the local platform provides a single machine".into(),
            ));
        }
        if conf.is_some_and(|c| !c.is_empty()) {
            tracing::warn!("local platform ignores first-boot configuration");
        }
        let machine = Arc::new(LocalMachine::new());
        *slot = Some(machine.clone());
        Ok(machine)
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| m.clone() as Arc<dyn Machine>)
            .collect()
    }

    async fn destroy(&self) -> Result<()> {
        let machine = self.machine.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(m) = machine {
            m.destroy().await?;
        }
        Ok(())
    }
}

/// The host, seen as a machine
pub struct LocalMachine {
    id: String,
    destroyed: AtomicBool,
}

impl LocalMachine {
    fn new() -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::now_v7()),
            destroyed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Machine for LocalMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> String {
        "127.0.0.1".to_string()
    }

    async fn exec(&self, cmd: &str, stdin: &[u8]) -> Result<ExecOutput> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Provision(format!("machine {} is destroyed", self.id)));
        }
        tracing::debug!(machine = %self.id, "exec: {}", cmd);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            if !stdin.is_empty() {
                pipe.write_all(stdin).await?;
            }
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        Ok(ExecOutput::new(
            output.stdout,
            output.stderr,
            output.status.code().unwrap_or(-1),
        ))
    }

    async fn reboot(&self) -> Result<()> {
        Err(Error::Unsupported(
            "rebooting the local platform would stop the harness".into(),
        ))
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn console_output(&self) -> String {
        String::new()
    }
}
