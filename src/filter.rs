//! Test selection
//!
//! Decides which registered tests apply to an invocation. Checks run in a
//! fixed order and the first failing check excludes the test:
//!
//! 1. internet requirement when networking is disabled
//! 2. name against the operator's patterns (exact or glob)
//! 3. platform, distro, architecture and (when known) firmware allow/deny
//!    lists
//! 4. version range, for tests selected by glob when the build version is
//!    known
//! 5. tags
//!
//! Empty allow-lists allow everything and empty deny-lists deny nothing.

use std::sync::Arc;

use glob::Pattern;
use semver::Version;

use crate::register::{Flag, Test};
use crate::{Error, Result};

/// Tag marking tests that need to reach the internet
pub const NEEDS_INTERNET_TAG: &str = "needs-internet";
/// Tag disabling the post-run console checks
pub const SKIP_BASE_CHECKS_TAG: &str = "skip-base-checks";
/// Tag allowing a failed test to pass on rerun
pub const ALLOW_RERUN_SUCCESS_TAG: &str = "allow-rerun-success";

/// The invocation a test is being selected for
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub platform: String,
    pub distro: String,
    pub arch: String,
    /// Only checked when known
    pub firmware: Option<String>,
    /// Version of the build under test, if already known
    pub version: Option<Version>,
    /// Requested tags; a leading `!` excludes tests carrying the tag
    pub tags: Vec<String>,
    /// Networking is unavailable to machines
    pub no_net: bool,
}

impl FilterContext {
    pub fn new(platform: impl Into<String>, distro: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            distro: distro.into(),
            arch: current_arch().to_string(),
            firmware: None,
            version: None,
            tags: Vec::new(),
            no_net: false,
        }
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    pub fn firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware = Some(firmware.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn no_net(mut self, no_net: bool) -> Self {
        self.no_net = no_net;
        self
    }

    fn positive_tags(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter(|t| !t.starts_with('!'))
            .map(String::as_str)
    }

    fn negative_tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().filter_map(|t| t.strip_prefix('!'))
    }
}

/// Outcome of checking one test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Selected,
    Excluded(&'static str),
}

/// Compiled operator patterns. No patterns means `*`.
#[derive(Debug, Clone)]
pub struct Patterns {
    raw: Vec<String>,
    compiled: Vec<Pattern>,
    typed: bool,
}

impl Patterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut raw: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        if raw.is_empty() {
            raw.push("*".to_string());
        }
        let compiled = raw
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| Error::Pattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let typed = !raw.iter().any(|p| p == "*");
        Ok(Self {
            raw,
            compiled,
            typed,
        })
    }

    /// Whether any pattern matches `name`
    pub fn matches(&self, name: &str) -> bool {
        self.compiled.iter().any(|p| p.matches(name))
    }

    /// Whether `name` was given literally
    pub fn is_exact(&self, name: &str) -> bool {
        self.raw.iter().any(|p| p == name)
    }

    /// Whether the operator typed patterns rather than relying on the
    /// default `*`
    pub fn typed(&self) -> bool {
        self.typed
    }

    pub fn as_slice(&self) -> &[String] {
        &self.raw
    }

    /// Fail if some pattern selects none of `names`
    pub fn ensure_all_match<'a>(&self, names: impl IntoIterator<Item = &'a str> + Clone) -> Result<()> {
        for (raw, pattern) in self.raw.iter().zip(&self.compiled) {
            if !names.clone().into_iter().any(|n| pattern.matches(n)) {
                return Err(Error::Config(format!(
                    "pattern {:?} does not match any registered test",
                    raw
                )));
            }
        }
        Ok(())
    }
}

/// Run every check against `test`
pub fn check(test: &Test, patterns: &Patterns, ctx: &FilterContext) -> Decision {
    if ctx.no_net
        && (test.has_flag(Flag::RequiresInternet) || test.has_tag(NEEDS_INTERNET_TAG))
    {
        return Decision::Excluded("requires internet");
    }

    let name_match = patterns.matches(&test.name);
    if !name_match {
        return Decision::Excluded("name does not match");
    }

    if !allowed(&ctx.platform, &test.platforms, &test.exclude_platforms) {
        return Decision::Excluded("platform");
    }
    if !allowed(&ctx.distro, &test.distros, &test.exclude_distros) {
        return Decision::Excluded("distro");
    }
    if !allowed(&ctx.arch, &test.architectures, &test.exclude_architectures) {
        return Decision::Excluded("architecture");
    }
    if let Some(firmware) = &ctx.firmware {
        if !allowed(firmware, &test.firmwares, &test.exclude_firmwares) {
            return Decision::Excluded("firmware");
        }
    }

    if let Some(version) = &ctx.version {
        if !patterns.is_exact(&test.name)
            && version_outside_range(version, test.min_version.as_ref(), test.end_version.as_ref())
        {
            return Decision::Excluded("version outside range");
        }
    }

    if ctx.negative_tags().any(|t| test.has_tag(t)) {
        return Decision::Excluded("excluded tag");
    }
    let positive: Vec<&str> = ctx.positive_tags().collect();
    let tag_match = positive
        .iter()
        .any(|t| test.has_tag(t) || test.required_tag.as_deref() == Some(*t));
    if let Some(required) = &test.required_tag {
        if !positive.contains(&required.as_str()) && !patterns.typed() {
            return Decision::Excluded("required tag not requested");
        }
    }
    if !positive.is_empty() && !tag_match {
        return Decision::Excluded("no requested tag");
    }

    Decision::Selected
}

/// Allow-list (empty allows all) and deny-list (empty denies none)
fn allowed(item: &str, include: &[String], exclude: &[String]) -> bool {
    (include.is_empty() || include.iter().any(|i| i == item)) && !exclude.iter().any(|e| e == item)
}

/// Whether `version` falls outside `[min, end)`. Missing bounds are open.
pub fn version_outside_range(version: &Version, min: Option<&Version>, end: Option<&Version>) -> bool {
    if let Some(min) = min {
        if version < min {
            return true;
        }
    }
    if let Some(end) = end {
        if version >= end {
            return true;
        }
    }
    false
}

/// Select the tests from `tests` that apply to `ctx`, in input order.
///
/// Native functions excluded on the current distro or architecture are
/// dropped from the returned descriptors.
pub fn filter_tests<'a>(
    tests: impl IntoIterator<Item = &'a Arc<Test>>,
    patterns: &Patterns,
    ctx: &FilterContext,
) -> Vec<Arc<Test>> {
    let mut out = Vec::new();
    for test in tests {
        match check(test, patterns, ctx) {
            Decision::Selected => out.push(drop_excluded_natives(test, ctx)),
            Decision::Excluded(reason) => {
                tracing::debug!(test = %test.name, reason, "test filtered out");
            }
        }
    }
    out
}

fn drop_excluded_natives(test: &Arc<Test>, ctx: &FilterContext) -> Arc<Test> {
    let excluded = |exclusions: &[&str]| {
        exclusions
            .iter()
            .any(|e| *e == ctx.distro || *e == ctx.arch)
    };
    if !test.native_funcs.iter().any(|f| excluded(f.exclusions)) {
        return test.clone();
    }
    let mut copy = Test::clone(test);
    copy.native_funcs.retain(|f| {
        let keep = !excluded(f.exclusions);
        if !keep {
            tracing::debug!(test = %test.name, func = f.name, "native function excluded");
        }
        keep
    });
    Arc::new(copy)
}

/// Whether any test in `tests` needs the build version to be selected
pub fn needs_version(tests: &[Arc<Test>], patterns: &Patterns) -> bool {
    tests
        .iter()
        .any(|t| t.is_version_gated() && !patterns.is_exact(&t.name))
}

/// Parse an os-release `VERSION_ID` into a semantic version.
///
/// Takes up to the first three numeric components and pads missing ones
/// with zero, so `39.20240104.3.0` becomes `39.20240104.3` and `"1745"`
/// becomes `1745.0.0`.
pub fn parse_os_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_matches('"');
    let mut parts = [0u64; 3];
    let mut count = 0;
    for (i, component) in trimmed.split('.').take(3).enumerate() {
        parts[i] = component.parse().map_err(|_| {
            Error::Config(format!("cannot parse OS version {:?}", raw.trim()))
        })?;
        count += 1;
    }
    if count == 0 {
        return Err(Error::Config("empty OS version".into()));
    }
    Ok(Version::new(parts[0], parts[1], parts[2]))
}

/// Architecture name as used in RPM (`x86_64`, `aarch64`, `ppc64le`, `s390x`)
pub fn current_arch() -> &'static str {
    match std::env::consts::ARCH {
        "powerpc64" => "ppc64le",
        other => other,
    }
}
