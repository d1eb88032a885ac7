//! Dispatcher
//!
//! [`Runner`] turns a [`Registry`] and a list of operator patterns into a
//! [`SuiteReport`]:
//!
//! 1. check that every pattern names at least one registered test
//! 2. filter for the invocation context, then apply the denylist
//! 3. if a glob-selected test is version gated and no version was given,
//!    boot one machine, read `VERSION_ID` and filter again
//! 4. run each test on its own cluster, at most `parallel` at a time
//! 5. optionally rerun hard failures once
//!
//! A test whose cluster cannot be provisioned fails on its own; the rest of
//! the suite keeps going.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use semver::Version;
use tokio::sync::Semaphore;

use crate::cluster::{drop_dir, drop_file, TestCluster};
use crate::config::KolaConfig;
use crate::console::check_console;
use crate::denylist::{DenyList, DenyListContext};
use crate::filter::{
    self, current_arch, FilterContext, Patterns, ALLOW_RERUN_SUCCESS_TAG, SKIP_BASE_CHECKS_TAG,
};
use crate::harness::{panic_message, run_body, H};
use crate::platform::{render_conf, Cluster, MachineOptions, Provider, RuntimeConfig};
use crate::register::Test;
use crate::registry::{Registry, Table};
use crate::report::{SuiteReport, TestReport};
use crate::util;
use crate::{Error, Result};

const MACHINE_CREATE_ATTEMPTS: usize = 2;
const MACHINE_CREATE_DELAY: Duration = Duration::from_secs(1);
const OS_RELEASE_VERSION: &str = "grep ^VERSION_ID= /etc/os-release";
const RERUN_DIR: &str = "rerun";

/// Everything a run needs besides the registry and the provider
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub platform: String,
    pub distro: String,
    pub arch: String,
    pub firmware: Option<String>,
    /// Build version; detected from a booted machine when needed and unset
    pub os_version: Option<Version>,
    pub tags: Vec<String>,
    pub no_net: bool,
    pub parallel: usize,
    pub output_dir: PathBuf,
    pub ssh_public_key: Option<String>,
    pub denylist: DenyList,
    pub rerun: bool,
    pub rerun_success_tags: Vec<String>,
    pub table: Table,
    /// Path of the `kolet` binary uploaded for native functions. Defaults
    /// to a `kolet` next to the running executable.
    pub kolet: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            distro: "fcos".to_string(),
            arch: current_arch().to_string(),
            firmware: None,
            os_version: None,
            tags: Vec::new(),
            no_net: false,
            parallel: 1,
            output_dir: PathBuf::from("_kola_temp"),
            ssh_public_key: None,
            denylist: DenyList::default(),
            rerun: false,
            rerun_success_tags: Vec::new(),
            table: Table::Tests,
            kolet: None,
        }
    }

    /// Resolve a [`KolaConfig`], reading the SSH key and denylist files
    pub fn from_config(config: &KolaConfig) -> Result<Self> {
        let os_version = config
            .os_version
            .as_deref()
            .map(filter::parse_os_version)
            .transpose()?;
        let deny_ctx = DenyListContext {
            stream: config.stream.clone(),
            os_version: config.os_version.clone(),
            ..DenyListContext::new(current_arch(), config.platform.clone())
        };
        Ok(Self {
            distro: config.distro.clone(),
            firmware: config.firmware.clone(),
            os_version,
            tags: config.tags.clone(),
            no_net: config.no_net,
            parallel: config.parallel.max(1),
            output_dir: config.output_dir.clone(),
            ssh_public_key: config.ssh_public_key()?,
            denylist: DenyList::load(&config.denylist, &deny_ctx)?,
            rerun: config.rerun,
            rerun_success_tags: config.rerun_success_tags.clone(),
            ..Self::new(config.platform.clone())
        })
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn os_version(mut self, version: Version) -> Self {
        self.os_version = Some(version);
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn denylist(mut self, denylist: DenyList) -> Self {
        self.denylist = denylist;
        self
    }

    pub fn rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    pub fn table(mut self, table: Table) -> Self {
        self.table = table;
        self
    }

    pub fn kolet(mut self, path: impl Into<PathBuf>) -> Self {
        self.kolet = Some(path.into());
        self
    }

    pub fn ssh_public_key(mut self, key: impl Into<String>) -> Self {
        self.ssh_public_key = Some(key.into());
        self
    }

    fn filter_context(&self) -> FilterContext {
        FilterContext {
            firmware: self.firmware.clone(),
            version: self.os_version.clone(),
            tags: self.tags.clone(),
            ..FilterContext::new(self.platform.clone(), self.distro.clone())
                .arch(self.arch.clone())
                .no_net(self.no_net)
        }
    }
}

/// Result of one top-level test
struct Finished {
    report: TestReport,
    // Console checks found only problems that tolerate a passing rerun
    allow_rerun_success: bool,
}

impl Finished {
    fn crashed(name: &str, msg: &str) -> Self {
        tracing::error!(test = %name, "harness panicked: {}", msg);
        let h = H::root(name);
        h.error(format!("harness panic: {}", msg));
        Self {
            report: h.report(),
            allow_rerun_success: false,
        }
    }
}

/// Filters and dispatches tests onto clusters
#[derive(Clone)]
pub struct Runner {
    provider: Arc<dyn Provider>,
    options: Arc<RunOptions>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("provider", &self.provider.name())
            .field("options", &self.options)
            .finish()
    }
}

impl Runner {
    pub fn new(provider: Arc<dyn Provider>, options: RunOptions) -> Self {
        Self {
            provider,
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Tests selected by `patterns` before version detection.
    ///
    /// Errors if a pattern matches no registered test or if nothing is
    /// left after filtering. Denylisted tests are removed silently.
    pub fn select<S: AsRef<str>>(
        &self,
        registry: &Registry,
        patterns: &[S],
    ) -> Result<(Patterns, Vec<Arc<Test>>)> {
        let table = registry.table(self.options.table);
        let patterns = Patterns::new(patterns)?;
        patterns.ensure_all_match(table.keys().map(String::as_str))?;

        let tests = filter::filter_tests(table.values(), &patterns, &self.options.filter_context());
        if tests.is_empty() {
            tracing::error!(
                arch = %self.options.arch,
                platform = %self.options.platform,
                "no matching tests to run on this architecture/platform"
            );
            return Err(Error::SuiteEmpty);
        }
        let tests = self.options.denylist.apply(tests)?;
        Ok((patterns, tests))
    }

    /// Select, run and report. The returned report is also written to
    /// `report.json` in the output directory.
    pub async fn run<S: AsRef<str>>(&self, registry: &Registry, patterns: &[S]) -> Result<SuiteReport> {
        let started = Instant::now();
        let (patterns, mut tests) = self.select(registry, patterns)?;
        let mut report = SuiteReport::new(self.options.platform.clone());

        let mut version = self.options.os_version.clone();
        let mut detected_version = None;
        if version.is_none() && filter::needs_version(&tests, &patterns) {
            let detected = self.detect_version().await?;
            tracing::info!(version = %detected, "detected build version");
            let ctx = FilterContext {
                version: Some(detected.clone()),
                ..self.options.filter_context()
            };
            tests = filter::filter_tests(tests.iter(), &patterns, &ctx);
            detected_version = Some(detected.clone());
            version = Some(detected);
        }
        report.version = version.map(|v| v.to_string());

        if tests.is_empty() {
            tracing::info!(
                output = %self.options.output_dir.display(),
                "{}",
                nothing_to_run_reason(detected_version.as_ref())
            );
            report.write_json(&self.options.output_dir)?;
            return Ok(report);
        }

        let finished = self.run_tests(tests.clone(), &self.options.output_dir).await?;
        let mut rerun_candidates = HashSet::new();
        for f in finished {
            let mut t = f.report;
            if t.failed() && self.options.denylist.warns(&t.name) {
                tracing::warn!(test = %t.name, "test failed but is marked warn-on-failure");
                t.warn_only = true;
            } else if t.failed() && f.allow_rerun_success {
                rerun_candidates.insert(t.name.clone());
            }
            report.tests.push(t);
        }

        let failed: Vec<Arc<Test>> = tests
            .iter()
            .filter(|t| report.hard_failures().iter().any(|r| r.name == t.name))
            .cloned()
            .collect();
        if self.options.rerun && !failed.is_empty() {
            tracing::info!(count = failed.len(), "re-running failed tests (flake detection)");
            let dir = self.options.output_dir.join(RERUN_DIR);
            let mut rerun = SuiteReport::new(self.options.platform.clone());
            rerun.version = report.version.clone();
            for f in self.run_tests(failed.clone(), &dir).await? {
                rerun.tests.push(f.report);
            }
            rerun.duration_ms = started.elapsed().as_millis() as u64;
            rerun.write_json(&dir)?;
            report.flakes_tolerated = rerun.success()
                && self.all_allow_rerun_success(&failed, &rerun_candidates);
            report.rerun = Some(Box::new(rerun));
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report.write_json(&self.options.output_dir)?;
        Ok(report)
    }

    fn all_allow_rerun_success(&self, tests: &[Arc<Test>], candidates: &HashSet<String>) -> bool {
        let tags = &self.options.rerun_success_tags;
        if tags.iter().any(|t| t == "all" || t == "*") {
            return true;
        }
        tests.iter().all(|t| {
            candidates.contains(&t.name)
                || t.has_tag(ALLOW_RERUN_SUCCESS_TAG)
                || tags.iter().any(|tag| t.has_tag(tag))
        })
    }

    async fn run_tests(&self, tests: Vec<Arc<Test>>, output_dir: &std::path::Path) -> Result<Vec<Finished>> {
        let semaphore = Arc::new(Semaphore::new(self.options.parallel.max(1)));
        let mut join_set = tokio::task::JoinSet::new();
        for (index, test) in tests.into_iter().enumerate() {
            let runner = self.clone();
            let semaphore = semaphore.clone();
            let dir = output_dir.join(&test.name);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Harness(format!("worker pool closed: {}", e)))?;
                let name = test.name.clone();
                // Panics outside the test body fail this test only
                let finished = match AssertUnwindSafe(runner.run_test(test, dir))
                    .catch_unwind()
                    .await
                {
                    Ok(finished) => finished,
                    Err(panic) => Finished::crashed(&name, &panic_message(panic.as_ref())),
                };
                Ok::<_, Error>((index, finished))
            });
        }

        let mut finished = Vec::new();
        while let Some(result) = join_set.join_next().await {
            let item = result.map_err(|e| Error::Harness(format!("Join error: {}", e)))??;
            finished.push(item);
        }
        finished.sort_by_key(|(index, _)| *index);
        Ok(finished.into_iter().map(|(_, f)| f).collect())
    }

    async fn run_test(&self, test: Arc<Test>, dir: PathBuf) -> Finished {
        let h = H::root(test.name.clone());
        tracing::info!(test = %test.name, "=== RUN ===");

        let config = RuntimeConfig::for_test(&test, dir.clone(), self.options.ssh_public_key.clone());
        let cluster = match self.provider.new_cluster(config).await {
            Ok(cluster) => cluster,
            Err(e) => {
                h.error(format!("Cluster failed: {}", e));
                return Finished {
                    report: h.report(),
                    allow_rerun_success: false,
                };
            }
        };
        let guard = DestroyGuard::new(cluster.clone());

        match self.prepare(&test, &cluster).await {
            Ok(()) => {
                let c = TestCluster::new(h.clone(), cluster.clone(), test.clone());
                run_body(&h, (test.run)(c)).await;
            }
            Err(e) => h.error(format!("Cluster failed starting machines: {}", e)),
        }

        let mut consoles = Vec::new();
        for m in cluster.machines() {
            consoles.push((m.id().to_string(), m.console_output().await));
        }
        guard.destroy().await;

        let allow_rerun_success = if test.has_tag(SKIP_BASE_CHECKS_TAG) {
            tracing::debug!(test = %test.name, "skipping base checks");
            false
        } else {
            self.console_checks(&test, &h, &dir, &consoles)
        };

        let report = h.report();
        tracing::info!(test = %test.name, outcome = %report.outcome, "=== DONE ===");
        Finished {
            report,
            allow_rerun_success,
        }
    }

    /// Boot the declared machines and upload what the test needs
    async fn prepare(&self, test: &Test, cluster: &Arc<dyn Cluster>) -> Result<()> {
        if test.cluster_size == 0 {
            return Ok(());
        }
        let conf = render_conf(test.user_data.as_ref(), cluster.runtime_config())?;
        let options = MachineOptions::for_test(test);
        util::run_concurrently(test.cluster_size, 0..test.cluster_size, |_| {
            let (conf, options) = (&conf, &options);
            util::retry(MACHINE_CREATE_ATTEMPTS, MACHINE_CREATE_DELAY, move || {
                cluster.new_machine(Some(conf), options)
            })
        })
        .await?;

        let machines = cluster.machines();
        if test.needs_kolet() {
            drop_file(&machines, &self.kolet_path()?, 0o755).await?;
        }
        if let Some(external) = &test.external_test {
            drop_file(&machines, external, 0o755).await?;
        }
        for dir in &test.dependency_dirs {
            drop_dir(&machines, &dir.local, &dir.remote).await?;
        }
        Ok(())
    }

    fn kolet_path(&self) -> Result<PathBuf> {
        let path = match &self.options.kolet {
            Some(path) => path.clone(),
            None => std::env::current_exe()?.with_file_name("kolet"),
        };
        if !path.is_file() {
            return Err(Error::Config(format!(
                "kolet binary not found at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Check console logs; returns whether every problem found tolerates
    /// a passing rerun
    fn console_checks(
        &self,
        test: &Test,
        h: &H,
        dir: &std::path::Path,
        consoles: &[(String, String)],
    ) -> bool {
        let mut allow_rerun_success = false;
        for (id, output) in consoles {
            if !output.is_empty() {
                if let Err(e) = std::fs::create_dir_all(dir)
                    .and_then(|_| std::fs::write(dir.join(format!("console-{}.txt", id)), output))
                {
                    tracing::warn!(test = %test.name, machine = %id, "saving console: {}", e);
                }
            }

            let findings = check_console(output, Some(test));
            if findings.is_empty() {
                continue;
            }
            let warn_only = findings.warn_only || self.options.denylist.skip_console_warnings;
            for badline in &findings.badlines {
                if warn_only {
                    tracing::warn!(test = %test.name, machine = %id, "found {} on console", badline);
                } else {
                    h.error(format!("Found {} on machine {} console", badline, id));
                }
            }
            if findings.allow_rerun_success {
                tracing::warn!(test = %test.name, "console check: candidate for rerun success");
                allow_rerun_success = true;
            }
        }
        allow_rerun_success
    }

    /// Boot a throwaway machine and read its `VERSION_ID`
    async fn detect_version(&self) -> Result<Version> {
        let config = RuntimeConfig {
            output_dir: self.options.output_dir.join("version-detect"),
            ssh_public_key: self.options.ssh_public_key.clone(),
            ..RuntimeConfig::default()
        };
        let cluster = self.provider.new_cluster(config).await?;
        let guard = DestroyGuard::new(cluster.clone());
        let result = async {
            let conf = render_conf(None, cluster.runtime_config())?;
            let m = cluster
                .new_machine(Some(&conf), &MachineOptions::default())
                .await?;
            let out = m.ssh(OS_RELEASE_VERSION).await?;
            if !out.success() {
                return Err(Error::ssh(OS_RELEASE_VERSION, &out));
            }
            let stdout = out.stdout_str();
            let raw = stdout
                .trim()
                .strip_prefix("VERSION_ID=")
                .ok_or_else(|| Error::Config(format!("unexpected os-release line {:?}", stdout.trim())))?;
            filter::parse_os_version(raw)
        }
        .await;
        guard.destroy().await;
        result
    }
}

/// Why a selection that passed filtering ended up empty. Tests only drop
/// out after selection through the denylist or the detected version.
fn nothing_to_run_reason(detected: Option<&Version>) -> String {
    match detected {
        Some(version) => format!(
            "no tests to run because none apply to detected OS version {}",
            version
        ),
        None => "no tests to run because all tests are denylisted".to_string(),
    }
}

/// Destroys a cluster exactly once, even if the owning task is cancelled
struct DestroyGuard {
    cluster: Mutex<Option<Arc<dyn Cluster>>>,
}

impl DestroyGuard {
    fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self {
            cluster: Mutex::new(Some(cluster)),
        }
    }

    fn take(&self) -> Option<Arc<dyn Cluster>> {
        self.cluster.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn destroy(self) {
        if let Some(cluster) = self.take() {
            if let Err(e) = cluster.destroy().await {
                tracing::warn!(platform = %cluster.platform(), "destroying cluster: {}", e);
            }
        }
    }
}

impl Drop for DestroyGuard {
    fn drop(&mut self) {
        let Some(cluster) = self.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = cluster.destroy().await {
                        tracing::warn!("destroying abandoned cluster: {}", e);
                    }
                });
            }
            Err(_) => tracing::error!("cluster leaked: no runtime to destroy it on"),
        }
    }
}
