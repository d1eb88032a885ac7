//! Test State Tree
//!
//! Every running test (and every sub-test started with
//! [`TestCluster::run`](crate::cluster::TestCluster::run)) owns an [`H`]
//! node. Nodes accumulate log output, record failure/skip state and keep
//! their children in declaration order so the final report mirrors the
//! execution tree.
//!
//! Failing a node also fails all of its ancestors. `fatal` and `skip`
//! return an [`Abort`] that the test body propagates with `?` to stop
//! executing.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::report::TestReport;

/// Reason a test body stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// Unrecoverable failure; already recorded on the node
    Fatal,
    /// Deliberate skip; already recorded on the node
    Skip,
}

impl std::fmt::Display for Abort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Abort::Fatal => write!(f, "test aborted"),
            Abort::Skip => write!(f, "test skipped"),
        }
    }
}

/// Return type of every test body
pub type TestResult = std::result::Result<(), Abort>;

/// Final state of a test node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    /// Never started because an earlier sibling failed under fail-fast
    NotRun,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail => write!(f, "FAIL"),
            Outcome::Skip => write!(f, "SKIP"),
            Outcome::NotRun => write!(f, "NOT RUN"),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    failed: bool,
    skipped: bool,
    not_run: bool,
    output: Vec<String>,
    subtests: Vec<Arc<H>>,
    start: Option<Instant>,
    duration: Duration,
}

/// A node in the test tree
#[derive(Debug)]
pub struct H {
    name: String,
    level: usize,
    parent: Option<Arc<H>>,
    state: Mutex<State>,
}

impl H {
    /// Create a top-level test node
    pub fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            level: 0,
            parent: None,
            state: Mutex::new(State::default()),
        })
    }

    /// Create a child node named `<parent>/<name>`
    pub fn sub(self: &Arc<Self>, name: &str) -> Arc<Self> {
        let child = Arc::new(Self {
            name: format!("{}/{}", self.name, name),
            level: self.level + 1,
            parent: Some(self.clone()),
            state: Mutex::new(State::default()),
        });
        self.lock().subtests.push(child.clone());
        child
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test body must not poison the tree for the reporter.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Full slash-separated name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nesting depth (0 for top-level tests)
    pub fn level(&self) -> usize {
        self.level
    }

    /// Record a line of output
    pub fn log(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::debug!(test = %self.name, "{}", msg);
        self.lock().output.push(msg);
    }

    /// Mark the node (and its ancestors) failed and continue
    pub fn fail(&self) {
        if let Some(parent) = &self.parent {
            parent.fail();
        }
        self.lock().failed = true;
    }

    /// Log followed by [`fail`](Self::fail)
    pub fn error(&self, msg: impl Into<String>) {
        self.log(msg);
        self.fail();
    }

    /// Log, fail, and return the [`Abort`] to propagate
    pub fn fatal(&self, msg: impl Into<String>) -> Abort {
        self.error(msg);
        Abort::Fatal
    }

    /// Log, mark skipped, and return the [`Abort`] to propagate
    pub fn skip(&self, msg: impl Into<String>) -> Abort {
        self.log(msg);
        self.lock().skipped = true;
        Abort::Skip
    }

    /// Record that this node was never executed
    pub fn mark_not_run(&self, msg: impl Into<String>) {
        self.log(msg);
        self.lock().not_run = true;
    }

    pub fn failed(&self) -> bool {
        self.lock().failed
    }

    pub fn skipped(&self) -> bool {
        self.lock().skipped
    }

    /// Final outcome. A test that failed and then skipped is still failed.
    pub fn outcome(&self) -> Outcome {
        let state = self.lock();
        if state.failed {
            Outcome::Fail
        } else if state.not_run {
            Outcome::NotRun
        } else if state.skipped {
            Outcome::Skip
        } else {
            Outcome::Pass
        }
    }

    pub fn duration(&self) -> Duration {
        self.lock().duration
    }

    /// Direct children in execution order
    pub fn subtests(&self) -> Vec<Arc<H>> {
        self.lock().subtests.clone()
    }

    /// Captured output lines
    pub fn output(&self) -> Vec<String> {
        self.lock().output.clone()
    }

    fn start(&self) {
        self.lock().start = Some(Instant::now());
    }

    fn finish(&self) {
        let mut state = self.lock();
        if let Some(start) = state.start.take() {
            state.duration += start.elapsed();
        }
    }

    /// Snapshot this node and its children
    pub fn report(&self) -> TestReport {
        TestReport {
            name: self.name.clone(),
            outcome: self.outcome(),
            duration_ms: self.duration().as_millis() as u64,
            output: self.output(),
            subtests: self.subtests().iter().map(|s| s.report()).collect(),
            warn_only: false,
        }
    }
}

/// Drive a test body to completion on `h`.
///
/// `Abort` values are already recorded by the call that produced them;
/// a panic is recorded as a failure carrying the panic message.
pub async fn run_body<Fut>(h: &Arc<H>, body: Fut)
where
    Fut: std::future::Future<Output = TestResult>,
{
    h.start();
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(())) | Ok(Err(Abort::Fatal)) | Ok(Err(Abort::Skip)) => {}
        Err(panic) => h.error(format!("panic: {}", panic_message(panic.as_ref()))),
    }
    h.finish();
}

/// Text of a caught panic payload
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
