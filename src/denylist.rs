//! Denylist handling
//!
//! A YAML file (conventionally `kola-denylist.yaml`) lists known-broken
//! tests:
//!
//! ```yaml
//! - pattern: coreos.ignition.journald-log
//!   tracker: https://github.com/coreos/fedora-coreos-tracker/issues/1234
//!   arches: [s390x]
//!   snooze: 2024-06-01
//! - pattern: ext.config.*
//!   warn: true
//! - pattern: coreos.basic/usr-read-only
//! ```
//!
//! Entries scoped to another arch, platform, stream or OS version are
//! ignored. A `snooze` date denylists the pattern until that day; after it,
//! the entry only applies if it also asks to `warn`. `test/glob` patterns
//! drop matching native functions instead of the whole test.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::register::Test;
use crate::{Error, Result};

/// Special pattern disabling console warning checks
pub const SKIP_CONSOLE_WARNINGS: &str = "skip-console-warnings";

const SNOOZE_FORMAT: &str = "%Y-%m-%d";

/// One denylist entry as written in the file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyListEntry {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<String>,
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default)]
    pub arches: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snooze: Option<String>,
    #[serde(default)]
    pub osversion: Vec<String>,
    #[serde(default)]
    pub warn: bool,
}

/// Where the denylist is being applied
#[derive(Debug, Clone)]
pub struct DenyListContext {
    pub arch: String,
    pub platform: String,
    pub stream: Option<String>,
    pub os_version: Option<String>,
    pub today: NaiveDate,
}

impl DenyListContext {
    pub fn new(arch: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            platform: platform.into(),
            stream: None,
            os_version: None,
            today: chrono::Local::now().date_naive(),
        }
    }

    fn applies(&self, entry: &DenyListEntry) -> bool {
        let scoped = |list: &[String], value: Option<&str>| match value {
            Some(v) if !list.is_empty() => list.iter().any(|i| i == v),
            _ => true,
        };
        (entry.arches.is_empty() || entry.arches.contains(&self.arch))
            && (entry.platforms.is_empty() || entry.platforms.contains(&self.platform))
            && scoped(&entry.streams, self.stream.as_deref())
            && scoped(&entry.osversion, self.os_version.as_deref())
    }
}

/// Resolved denylist for one invocation
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    /// Patterns whose tests are not run
    pub denied: Vec<String>,
    /// Patterns whose failures are reported as warnings
    pub warn_on_error: Vec<String>,
    pub skip_console_warnings: bool,
}

impl DenyList {
    /// Read and resolve `path`; a missing file is an empty denylist
    pub fn load(path: &Path, ctx: &DenyListContext) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, ctx),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no denylist");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(yaml: &str, ctx: &DenyListContext) -> Result<Self> {
        let entries: Vec<DenyListEntry> = if yaml.trim().is_empty() {
            Vec::new()
        } else {
            serde_yaml::from_str(yaml)?
        };
        Self::resolve(&entries, ctx)
    }

    pub fn resolve(entries: &[DenyListEntry], ctx: &DenyListContext) -> Result<Self> {
        let mut out = Self::default();
        for entry in entries.iter().filter(|e| ctx.applies(e)) {
            if entry.pattern == SKIP_CONSOLE_WARNINGS {
                out.skip_console_warnings = true;
                continue;
            }

            let snoozed = match &entry.snooze {
                Some(date) => {
                    let until = NaiveDate::parse_from_str(date, SNOOZE_FORMAT).map_err(|e| {
                        Error::Config(format!("denylist snooze {:?}: {}", date, e))
                    })?;
                    if ctx.today < until {
                        tracing::info!(pattern = %entry.pattern, until = %until, "snoozing test pattern");
                        true
                    } else {
                        tracing::info!(pattern = %entry.pattern, expired = %until, "snooze expired");
                        false
                    }
                }
                None => false,
            };

            if snoozed {
                out.denied.push(entry.pattern.clone());
            } else if entry.warn {
                tracing::info!(pattern = %entry.pattern, "will warn on failure");
                out.warn_on_error.push(entry.pattern.clone());
            } else if entry.snooze.is_none() {
                tracing::info!(pattern = %entry.pattern, "skipping test pattern");
                out.denied.push(entry.pattern.clone());
            }
            if let Some(tracker) = &entry.tracker {
                tracing::info!(pattern = %entry.pattern, "tracker: {}", tracker);
            }
        }
        Ok(out)
    }

    /// Remove denylisted tests and native functions
    pub fn apply(&self, tests: Vec<Arc<Test>>) -> Result<Vec<Arc<Test>>> {
        let mut test_patterns = Vec::new();
        let mut native_patterns = Vec::new();
        for raw in &self.denied {
            match raw.split_once('/') {
                Some((test, native)) => {
                    native_patterns.push((compile(test)?, compile(native)?));
                }
                None => test_patterns.push(compile(raw)?),
            }
        }

        let mut out = Vec::new();
        for test in tests {
            if test_patterns.iter().any(|p| p.matches(&test.name)) {
                tracing::info!(test = %test.name, "skipping denylisted test");
                continue;
            }
            let drop: Vec<&str> = test
                .native_funcs
                .iter()
                .filter(|f| {
                    native_patterns
                        .iter()
                        .any(|(t, n)| t.matches(&test.name) && n.matches(f.name))
                })
                .map(|f| f.name)
                .collect();
            if drop.is_empty() {
                out.push(test);
                continue;
            }
            let mut copy = Test::clone(&test);
            copy.native_funcs.retain(|f| !drop.contains(&f.name));
            tracing::info!(test = %test.name, funcs = ?drop, "skipping denylisted native functions");
            out.push(Arc::new(copy));
        }
        Ok(out)
    }

    /// Whether failures of `name` should only warn
    pub fn warns(&self, name: &str) -> bool {
        self.warn_on_error
            .iter()
            .any(|p| Pattern::new(p).map(|p| p.matches(name)).unwrap_or(p == name))
    }
}

fn compile(raw: &str) -> Result<Pattern> {
    Pattern::new(raw).map_err(|e| Error::Pattern {
        pattern: raw.to_string(),
        reason: e.to_string(),
    })
}
