//! Result reporting
//!
//! A [`SuiteReport`] is the serializable outcome of one invocation. It is
//! written to `report.json` in the output directory and rendered as a text
//! summary on stdout.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::harness::Outcome;
use crate::{Error, Result};

/// File name of the machine readable report
pub const REPORT_FILE: &str = "report.json";

/// Outcome of one test node and its sub-tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtests: Vec<TestReport>,
    /// Failure is reported but does not fail the suite
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub warn_only: bool,
}

impl TestReport {
    pub fn failed(&self) -> bool {
        self.outcome == Outcome::Fail
    }

    fn write_summary(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        let _ = writeln!(
            out,
            "{}--- {}: {} ({:.2}s){}",
            indent,
            self.outcome,
            self.name,
            self.duration_ms as f64 / 1000.0,
            if self.warn_only && self.failed() {
                " [warn]"
            } else {
                ""
            }
        );
        for line in &self.output {
            let _ = writeln!(out, "{}        {}", indent, line);
        }
        for sub in &self.subtests {
            sub.write_summary(out, depth + 1);
        }
    }
}

/// Outcome of a whole invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// RFC 3339 start time
    pub started: String,
    pub duration_ms: u64,
    pub tests: Vec<TestReport>,
    /// Results of the flake-detection rerun, if one happened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun: Option<Box<SuiteReport>>,
    /// Every failure passed on rerun and was allowed to
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flakes_tolerated: bool,
}

impl SuiteReport {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            version: None,
            started: chrono::Utc::now().to_rfc3339(),
            duration_ms: 0,
            tests: Vec::new(),
            rerun: None,
            flakes_tolerated: false,
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.tests.iter().filter(|t| t.outcome == outcome).count()
    }

    /// Failed top-level tests that are not warn-only
    pub fn hard_failures(&self) -> Vec<&TestReport> {
        self.tests
            .iter()
            .filter(|t| t.failed() && !t.warn_only)
            .collect()
    }

    /// Failed top-level tests whose failure is only a warning
    pub fn warnings(&self) -> Vec<&TestReport> {
        self.tests
            .iter()
            .filter(|t| t.failed() && t.warn_only)
            .collect()
    }

    pub fn success(&self) -> bool {
        self.hard_failures().is_empty() || self.flakes_tolerated
    }

    /// [`Error::SuiteFailed`] unless the suite succeeded
    pub fn check(&self) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(Error::SuiteFailed)
        }
    }

    /// Serialize to `<dir>/report.json`
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "wrote report");
        Ok(path)
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    /// Text rendering, one `--- OUTCOME: name (secs)` line per node
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for test in &self.tests {
            test.write_summary(&mut out, 0);
        }
        if let Some(rerun) = &self.rerun {
            let _ = writeln!(out, "rerun of failed tests:");
            for test in &rerun.tests {
                test.write_summary(&mut out, 1);
            }
        }
        let _ = writeln!(
            out,
            "{} passed, {} failed, {} skipped, {} not run",
            self.count(Outcome::Pass),
            self.count(Outcome::Fail),
            self.count(Outcome::Skip),
            self.count(Outcome::NotRun),
        );
        out
    }
}
