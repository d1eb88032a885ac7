//! Test Cluster
//!
//! [`TestCluster`] is the handle a test body receives. It bundles the
//! machines of the test's cluster, the current node of the result tree and
//! the fail-fast state of the current nesting level.
//!
//! Helpers come in two flavours: `ssh`-style calls return a crate
//! [`Result`](crate::Result) and leave the decision to the caller, while
//! `must_*`/`assert_*` calls record a fatal failure and hand back an
//! [`Abort`] for the body to propagate with `?`.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::conf::UserData;
use crate::harness::{run_body, Abort, TestResult, H};
use crate::platform::{render_conf, Cluster, Machine, MachineOptions, RuntimeConfig};
use crate::register::{NativeFunc, Test};
use crate::{Error, Result};

/// Message recorded on sub-tests skipped by fail-fast
pub const NOT_RUN_MESSAGE: &str = "A previous test has already failed";

/// Syslog identifier used for every journal entry written by the harness
const JOURNAL_TAG: &str = "kola";

const REBOOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Handle passed to test bodies
#[derive(Clone)]
pub struct TestCluster {
    h: Arc<H>,
    cluster: Arc<dyn Cluster>,
    test: Arc<Test>,
    // Shared by the siblings of one level, fresh for every child level
    has_failure: Arc<AtomicBool>,
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("name", &self.h.name())
            .field("platform", &self.cluster.platform())
            .field("fail_fast", &self.test.fail_fast)
            .field("has_failure", &self.has_failure.load(Ordering::SeqCst))
            .finish()
    }
}

impl TestCluster {
    pub fn new(h: Arc<H>, cluster: Arc<dyn Cluster>, test: Arc<Test>) -> Self {
        Self {
            h,
            cluster,
            test,
            has_failure: Arc::new(AtomicBool::new(false)),
        }
    }

    fn child(&self, h: Arc<H>) -> Self {
        Self::new(h, self.cluster.clone(), self.test.clone())
    }

    /// Full name of the current node
    pub fn name(&self) -> &str {
        self.h.name()
    }

    /// The result node of the current (sub-)test
    pub fn h(&self) -> &Arc<H> {
        &self.h
    }

    /// The descriptor this cluster was created for
    pub fn test(&self) -> &Test {
        &self.test
    }

    pub fn platform(&self) -> &str {
        self.cluster.platform()
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        self.cluster.runtime_config()
    }

    /// Machines currently in the cluster, in creation order
    pub fn machines(&self) -> Vec<Arc<dyn Machine>> {
        self.cluster.machines()
    }

    /// The `index`th machine, or a fatal failure if the cluster is smaller
    pub fn machine(&self, index: usize) -> std::result::Result<Arc<dyn Machine>, Abort> {
        let machines = self.machines();
        machines.get(index).cloned().ok_or_else(|| {
            self.fatal(format!(
                "cluster has {} machines, wanted machine {}",
                machines.len(),
                index
            ))
        })
    }

    /// Boot an extra machine. Used by tests with a cluster size of 0 that
    /// need to control the configuration themselves.
    pub async fn new_machine(&self, user_data: Option<&UserData>) -> Result<Arc<dyn Machine>> {
        let conf = render_conf(user_data, self.cluster.runtime_config())?;
        self.cluster
            .new_machine(Some(&conf), &MachineOptions::for_test(&self.test))
            .await
    }

    pub fn log(&self, msg: impl Into<String>) {
        self.h.log(msg);
    }

    /// Record an error and keep going
    pub fn errorf(&self, msg: impl Into<String>) {
        self.h.error(msg);
    }

    pub fn fatal(&self, msg: impl Into<String>) -> Abort {
        self.h.fatal(msg)
    }

    pub fn skip(&self, msg: impl Into<String>) -> Abort {
        self.h.skip(msg)
    }

    /// Run `cmd` on `m` and return its stdout. Remote stderr is copied to
    /// the test output; a non-zero exit is an [`Error::Ssh`].
    pub async fn ssh(&self, m: &dyn Machine, cmd: &str) -> Result<String> {
        let out = m.ssh(cmd).await?;
        for line in out.stderr_str().lines().filter(|l| !l.is_empty()) {
            self.h.log(line.to_string());
        }
        if !out.success() {
            return Err(Error::ssh(cmd, &out));
        }
        Ok(out.stdout_str())
    }

    /// Like [`ssh`](Self::ssh) but any failure is fatal for the test
    pub async fn must_ssh(
        &self,
        m: &dyn Machine,
        cmd: &str,
    ) -> std::result::Result<String, Abort> {
        match self.ssh(m, cmd).await {
            Ok(stdout) => Ok(stdout),
            Err(Error::Ssh {
                stdout, exit_code, ..
            }) => Err(self.fatal(format!(
                "{:?} failed: output {}, status {}",
                cmd,
                stdout.trim(),
                exit_code
            ))),
            Err(e) => Err(self.fatal(format!("{:?} failed: {}", cmd, e))),
        }
    }

    /// Run a named sub-test and report whether it passed.
    ///
    /// Under fail-fast, a sub-test started after a failed sibling is not
    /// executed and is reported as not run.
    pub async fn run<F, Fut>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(TestCluster) -> Fut,
        Fut: Future<Output = TestResult>,
    {
        let h = self.h.sub(name);
        if self.test.fail_fast && self.has_failure.load(Ordering::SeqCst) {
            h.mark_not_run(NOT_RUN_MESSAGE);
            return false;
        }
        run_body(&h, f(self.child(h.clone()))).await;
        let passed = !h.failed();
        if !passed {
            self.has_failure.store(true, Ordering::SeqCst);
        }
        passed
    }

    /// Like [`run`](Self::run), bracketed by `=== RUN` / `=== DONE` markers
    /// in every machine's journal
    pub async fn run_logged<F, Fut>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(TestCluster) -> Fut,
        Fut: Future<Output = TestResult>,
    {
        let full = format!("{}/{}", self.h.name(), name);
        let machines = self.machines();
        for m in &machines {
            self.mark_journal(m.as_ref(), &format!("=== RUN: {} ===", full))
                .await;
        }
        tracing::info!(test = %full, "=== RUN ===");
        let passed = self.run(name, f).await;
        tracing::info!(test = %full, passed, "=== DONE ===");
        for m in &machines {
            self.mark_journal(m.as_ref(), &format!("=== DONE: {} ===", full))
                .await;
        }
        passed
    }

    async fn mark_journal(&self, m: &dyn Machine, msg: &str) {
        let cmd = format!("logger --tag {} {}", JOURNAL_TAG, shell_words::quote(msg));
        if let Err(e) = self.ssh(m, &cmd).await {
            self.errorf(format!("writing journal marker on {}: {}", m.id(), e));
        }
    }

    /// Run a declared native function inside `m` through `kolet`, as a
    /// sub-test named after the function
    pub async fn run_native(&self, func: &NativeFunc, m: &dyn Machine) -> bool {
        if self.test.native_func(func.name).is_none() {
            let msg = format!(
                "native function {} is not declared by {}",
                func.name, self.test.name
            );
            return self.run(func.name, |c| async move { Err(c.fatal(msg)) }).await;
        }

        let command = format!(
            "./kolet run {} {}",
            shell_words::quote(&self.test.name),
            shell_words::quote(func.name)
        );
        self.run(func.name, |c| async move {
            let out = m
                .ssh(&command)
                .await
                .map_err(|e| c.fatal(format!("kolet: {}", e)))?;
            let combined = out.combined();
            if !combined.is_empty() {
                c.log(format!("kolet:\n{}", combined));
            }
            if !out.success() {
                c.errorf(format!("kolet: exit status {}", out.exit_code));
            }
            Ok(())
        })
        .await
    }

    /// Copy a local file into the home directory of every machine
    pub async fn drop_file(&self, local: &Path) -> Result<()> {
        drop_file(&self.machines(), local, 0o644).await
    }

    /// Write `msg` into the journal of `m` under the `kola` identifier
    pub async fn journal_log(&self, m: &dyn Machine, msg: &str) -> TestResult {
        let cmd = format!("logger -t {} {}", JOURNAL_TAG, shell_words::quote(msg));
        self.must_ssh(m, &cmd).await.map(|_| ())
    }

    /// Run `cmd` with its output piped to the journal. On failure the tail
    /// of the journal is attached to the fatal message.
    pub async fn run_cmd_sync(&self, m: &dyn Machine, cmd: &str) -> TestResult {
        self.journal_log(m, &format!("+ {}", cmd)).await?;
        let piped = format!("set -o pipefail; {} |& logger -t {}", cmd, JOURNAL_TAG);
        if let Err(e) = self.ssh(m, &piped).await {
            let journal = self
                .ssh(
                    m,
                    &format!("journalctl -q --no-pager -n 20 -o cat -t {}", JOURNAL_TAG),
                )
                .await
                .unwrap_or_else(|je| format!("<failed to gather journal for kola: {}>", je));
            return Err(self.fatal(format!(
                "{:?} failed: {}; logs from journalctl -t kola:\n{}",
                cmd, e, journal
            )));
        }
        Ok(())
    }

    pub async fn assert_cmd_output_contains(
        &self,
        m: &dyn Machine,
        cmd: &str,
        expected: &str,
    ) -> TestResult {
        self.journal_log(m, &format!("+ {}", cmd)).await?;
        let output = self.must_ssh(m, cmd).await?;
        if !output.contains(expected) {
            return Err(self.fatal(format!("cmd {} did not output {}", cmd, expected)));
        }
        Ok(())
    }

    pub async fn assert_cmd_output_matches(
        &self,
        m: &dyn Machine,
        cmd: &str,
        expected: &Regex,
    ) -> TestResult {
        self.journal_log(m, &format!("+ {}", cmd)).await?;
        let output = self.must_ssh(m, cmd).await?;
        if !expected.is_match(&output) {
            return Err(self.fatal(format!(
                "cmd {} output did not match regexp {}: {}",
                cmd, expected, output
            )));
        }
        Ok(())
    }

    /// Reboot `m` and wait until it reports a new boot ID
    pub async fn reboot(&self, m: &dyn Machine) -> Result<()> {
        let old = m.boot_id().await?;
        m.reboot().await?;
        m.wait_for_reboot(REBOOT_TIMEOUT, &old).await?;
        self.log(format!("{} rebooted", m.id()));
        Ok(())
    }
}

/// Install `local` as `~/<file name>` on every machine. The file is
/// written to a `.partial` path first and renamed into place.
pub async fn drop_file(machines: &[Arc<dyn Machine>], local: &Path, mode: u32) -> Result<()> {
    let base = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("cannot upload {}", local.display())))?;
    let contents = tokio::fs::read(local).await?;
    let partial = format!("{}.partial", base);
    let mv = format!(
        "mv {} {}",
        shell_words::quote(&partial),
        shell_words::quote(base)
    );
    for m in machines {
        m.install_file(&contents, &partial, mode).await?;
        let out = m.ssh(&mv).await?;
        if !out.success() {
            return Err(Error::ssh(mv.clone(), &out));
        }
        tracing::debug!(machine = %m.id(), file = base, "dropped file");
    }
    Ok(())
}

/// Recursively install the contents of `local` under `remote` on every
/// machine, keeping file permissions
pub async fn drop_dir(machines: &[Arc<dyn Machine>], local: &Path, remote: &str) -> Result<()> {
    let mut files = Vec::new();
    collect_files(local, Path::new(""), &mut files)?;
    for m in machines {
        let mkdir = format!("mkdir -p {}", shell_words::quote(remote));
        let out = m.ssh(&mkdir).await?;
        if !out.success() {
            return Err(Error::ssh(mkdir, &out));
        }
        for (rel, mode) in &files {
            let target = format!("{}/{}", remote.trim_end_matches('/'), rel.display());
            if let Some(parent) = rel.parent().filter(|p| !p.as_os_str().is_empty()) {
                let dir = format!("{}/{}", remote.trim_end_matches('/'), parent.display());
                m.ssh(&format!("mkdir -p {}", shell_words::quote(&dir)))
                    .await?;
            }
            let contents = tokio::fs::read(local.join(rel)).await?;
            m.install_file(&contents, &target, *mode).await?;
        }
        tracing::debug!(machine = %m.id(), dir = %local.display(), remote, "dropped directory");
    }
    Ok(())
}

fn collect_files(
    root: &Path,
    rel: &Path,
    out: &mut Vec<(std::path::PathBuf, u32)>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(root.join(rel))?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = rel.join(entry.file_name());
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_files(root, &path, out)?;
        } else if meta.is_file() {
            out.push((path, file_mode(&meta)));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}
