//! Mock platform for testing
//!
//! Machines live in memory. Commands are answered from scripted responses
//! (matched by prefix) or from a small set of simulated shell commands:
//! `echo`, `true`, `false`, `cat`, `cat > path`, `mv`, `chmod`, `mkdir`,
//! `logger`, boot-id and os-release reads and `rpm-ostree status --json`.
//! Commands containing a registered trigger reboot the machine, optionally
//! into a new OS version.
//!
//! Every command, created machine and destroyed machine is recorded so
//! tests can assert on what the dispatcher did.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Cluster, Machine, MachineOptions, Provider, RuntimeConfig};
use crate::conf::Conf;
use crate::{Error, ExecOutput, Result};

const DEFAULT_OS_VERSION: &str = "39.20240104.3.0";

/// Counters shared by every cluster a [`MockProvider`] creates
#[derive(Debug, Default)]
pub struct MockStats {
    pub clusters_created: AtomicUsize,
    pub clusters_destroyed: AtomicUsize,
    pub machines_created: AtomicUsize,
    pub machines_destroyed: AtomicUsize,
}

impl MockStats {
    pub fn clusters_created(&self) -> usize {
        self.clusters_created.load(Ordering::SeqCst)
    }

    pub fn clusters_destroyed(&self) -> usize {
        self.clusters_destroyed.load(Ordering::SeqCst)
    }

    pub fn machines_created(&self) -> usize {
        self.machines_created.load(Ordering::SeqCst)
    }

    pub fn machines_destroyed(&self) -> usize {
        self.machines_destroyed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Script {
    platform: String,
    os_version: Mutex<String>,
    console: Mutex<String>,
    responses: Mutex<Vec<(String, ExecOutput)>>,
    reboot_triggers: Mutex<Vec<(String, Option<String>)>>,
    failing_creates: AtomicUsize,
    stats: Arc<MockStats>,
    history: Mutex<Vec<String>>,
    confs: Mutex<Vec<String>>,
}

impl Script {
    fn record(&self, line: String) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
    }

    fn os_version(&self) -> String {
        self.os_version.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// In-memory provider with scripted machine behavior
#[derive(Debug)]
pub struct MockProvider {
    script: Arc<Script>,
}

impl MockProvider {
    /// Create a provider reporting itself as `platform`
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            script: Arc::new(Script {
                platform: platform.into(),
                os_version: Mutex::new(DEFAULT_OS_VERSION.to_string()),
                console: Mutex::new(String::new()),
                responses: Mutex::new(Vec::new()),
                reboot_triggers: Mutex::new(Vec::new()),
                failing_creates: AtomicUsize::new(0),
                stats: Arc::new(MockStats::default()),
                history: Mutex::new(Vec::new()),
                confs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Answer commands starting with `prefix` with `output`
    pub fn respond(self, prefix: impl Into<String>, output: ExecOutput) -> Self {
        self.script
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.into(), output));
        self
    }

    /// `VERSION_ID` reported by `/etc/os-release` and `rpm-ostree status`
    pub fn os_version(self, version: impl Into<String>) -> Self {
        *self.script.os_version.lock().unwrap_or_else(|e| e.into_inner()) = version.into();
        self
    }

    /// Console output every machine reports
    pub fn console(self, text: impl Into<String>) -> Self {
        *self.script.console.lock().unwrap_or_else(|e| e.into_inner()) = text.into();
        self
    }

    /// Reboot a machine whenever it runs a command containing `needle`,
    /// booting into `version` if given
    pub fn reboot_on(self, needle: impl Into<String>, version: Option<&str>) -> Self {
        self.script
            .reboot_triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((needle.into(), version.map(str::to_string)));
        self
    }

    /// Make the next `count` machine creations fail
    pub fn fail_creates(self, count: usize) -> Self {
        self.script.failing_creates.store(count, Ordering::SeqCst);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.script.stats.clone()
    }

    /// Every command run so far, as `<machine id>: <command>`
    pub fn history(&self) -> Vec<String> {
        self.script
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Serialized configurations machines were booted with
    pub fn confs(&self) -> Vec<String> {
        self.script
            .confs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.script.platform
    }

    async fn new_cluster(&self, config: RuntimeConfig) -> Result<Arc<dyn Cluster>> {
        self.script
            .stats
            .clusters_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockCluster {
            config,
            script: self.script.clone(),
            machines: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// Cluster of [`MockMachine`]s
pub struct MockCluster {
    config: RuntimeConfig,
    script: Arc<Script>,
    machines: Mutex<Vec<Arc<MockMachine>>>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Cluster for MockCluster {
    fn platform(&self) -> &str {
        &self.script.platform
    }

    fn runtime_config(&self) -> &RuntimeConfig {
        &self.config
    }

    async fn new_machine(
        &self,
        conf: Option<&Conf>,
        options: &MachineOptions,
    ) -> Result<Arc<dyn Machine>> {
        let failing = &self.script.failing_creates;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Provision(format!(
                "{}: simulated boot failure",
                self.script.platform
            )));
        }

        let mut machines = self.machines.lock().unwrap_or_else(|e| e.into_inner());
        let machine = Arc::new(MockMachine::new(
            machines.len(),
            self.script.clone(),
            options.clone(),
        ));
        if let Some(conf) = conf {
            self.script
                .confs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(conf.to_string());
        }
        self.script
            .stats
            .machines_created
            .fetch_add(1, Ordering::SeqCst);
        tracing::debug!(machine = %machine.id, platform = %self.script.platform, "mock machine created");
        machines.push(machine.clone());
        Ok(machine)
    }

    fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.machines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|m| m.clone() as Arc<dyn Machine>)
            .collect()
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(Error::Provision("cluster destroyed twice".into()));
        }
        let machines = self.machines.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for m in machines {
            m.destroy().await?;
        }
        self.script
            .stats
            .clusters_destroyed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A simulated machine
pub struct MockMachine {
    id: String,
    index: usize,
    script: Arc<Script>,
    options: MachineOptions,
    files: Mutex<HashMap<String, Vec<u8>>>,
    boot_id: Mutex<String>,
    // Booted version once a trigger rebooted into a new one
    version: Mutex<Option<String>>,
    destroyed: AtomicBool,
}

impl MockMachine {
    fn new(index: usize, script: Arc<Script>, options: MachineOptions) -> Self {
        Self {
            id: format!("mock-{}", uuid::Uuid::now_v7()),
            index,
            script,
            options,
            files: Mutex::new(HashMap::new()),
            boot_id: Mutex::new(uuid::Uuid::now_v7().to_string()),
            version: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Resources the machine was created with
    pub fn options(&self) -> &MachineOptions {
        &self.options
    }

    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn booted_version(&self) -> String {
        self.version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.script.os_version())
    }

    fn new_boot(&self, version: Option<String>) {
        *self.boot_id.lock().unwrap_or_else(|e| e.into_inner()) = uuid::Uuid::now_v7().to_string();
        if let Some(version) = version {
            *self.version.lock().unwrap_or_else(|e| e.into_inner()) = Some(version);
        }
    }

    fn check_triggers(&self, cmd: &str) {
        let hit = self
            .script
            .reboot_triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(needle, _)| cmd.contains(needle.as_str()))
            .map(|(_, version)| version.clone());
        if let Some(version) = hit {
            self.script.record(format!("{}: <reboot>", self.id));
            self.new_boot(version);
        }
    }

    fn simulate(&self, cmd: &str, stdin: &[u8]) -> ExecOutput {
        let scripted = self
            .script
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(prefix, _)| cmd.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone());
        if let Some(output) = scripted {
            return output;
        }

        let ok = |stdout: Vec<u8>| ExecOutput::new(stdout, Vec::new(), 0);
        let fail = |msg: String| ExecOutput::new(Vec::new(), msg.into_bytes(), 1);

        let cmd = cmd.trim();
        if cmd == "cat /proc/sys/kernel/random/boot_id" {
            let id = self.boot_id.lock().unwrap_or_else(|e| e.into_inner()).clone();
            return ok(format!("{}\n", id).into_bytes());
        }
        if cmd == "grep ^VERSION_ID= /etc/os-release" {
            return ok(format!("VERSION_ID={}\n", self.booted_version()).into_bytes());
        }
        if cmd == "rpm-ostree status --json" {
            let status = serde_json::json!({
                "deployments": [{
                    "booted": true,
                    "version": self.booted_version(),
                    "checksum": "7f3e1c2b9a8d4e5f60718293a4b5c6d7e8f90123456789abcdef0123456789ab",
                    "origin": "fedora:fedora/x86_64/coreos/stable",
                }]
            });
            return ok(status.to_string().into_bytes());
        }
        if let Some(rest) = cmd.strip_prefix("cat > ") {
            return match shell_words::split(rest) {
                Ok(args) if args.len() == 1 => {
                    self.files().insert(args[0].clone(), stdin.to_vec());
                    ok(Vec::new())
                }
                _ => fail(format!("cat: bad redirect {:?}\n", rest)),
            };
        }

        let args = match shell_words::split(cmd) {
            Ok(args) => args,
            Err(e) => return fail(format!("sh: {}\n", e)),
        };
        let Some((program, args)) = args.split_first() else {
            return ok(Vec::new());
        };
        match program.as_str() {
            "true" | "logger" | "chmod" | "mkdir" | "systemctl" | "sync" => ok(Vec::new()),
            "false" => ExecOutput::new(Vec::new(), Vec::new(), 1),
            "echo" => ok(format!("{}\n", args.join(" ")).into_bytes()),
            "cat" => {
                let mut out = Vec::new();
                let files = self.files();
                for path in args {
                    match files.get(path) {
                        Some(data) => out.extend_from_slice(data),
                        None => {
                            return fail(format!("cat: {}: No such file or directory\n", path))
                        }
                    }
                }
                ok(out)
            }
            "mv" if args.len() == 2 => {
                let mut files = self.files();
                match files.remove(&args[0]) {
                    Some(data) => {
                        files.insert(args[1].clone(), data);
                        ok(Vec::new())
                    }
                    None => fail(format!("mv: cannot stat '{}'\n", args[0])),
                }
            }
            "test" if args.len() == 2 && args[0] == "-e" => {
                if self.files().contains_key(&args[1]) {
                    ok(Vec::new())
                } else {
                    ExecOutput::new(Vec::new(), Vec::new(), 1)
                }
            }
            _ => ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Machine for MockMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> String {
        format!("10.0.2.{}", 15 + self.index)
    }

    async fn exec(&self, cmd: &str, stdin: &[u8]) -> Result<ExecOutput> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Provision(format!("machine {} is destroyed", self.id)));
        }
        self.script.record(format!("{}: {}", self.id, cmd));

        // `a && b` runs sequentially, stdin goes to the first command
        let mut output = ExecOutput::new(Vec::new(), Vec::new(), 0);
        for (i, part) in cmd.split(" && ").enumerate() {
            let input = if i == 0 { stdin } else { &[] };
            let out = self.simulate(part, input);
            self.check_triggers(part);
            output.stdout.extend_from_slice(&out.stdout);
            output.stderr.extend_from_slice(&out.stderr);
            output.exit_code = out.exit_code;
            if !out.success() {
                break;
            }
        }
        Ok(output)
    }

    async fn reboot(&self) -> Result<()> {
        self.script.record(format!("{}: <reboot>", self.id));
        self.new_boot(None);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.script
                .stats
                .machines_destroyed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn console_output(&self) -> String {
        self.script.console.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
