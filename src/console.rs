//! Console and journal checks run after every test
//!
//! Machine console output is scanned for signs of trouble that a test body
//! would not notice on its own: emergency shells, kernel panics, oopses,
//! segfaults and similar. Each hit becomes a short description, with the
//! first capture group appended when the pattern has one.

use std::sync::OnceLock;

use regex::Regex;

use crate::register::{Flag, Test};

struct ConsoleCheck {
    desc: &'static str,
    pattern: &'static str,
    warn_only: bool,
    allow_rerun_success: bool,
    skip_flag: Option<Flag>,
}

const fn check(desc: &'static str, pattern: &'static str) -> ConsoleCheck {
    ConsoleCheck {
        desc,
        pattern,
        warn_only: false,
        allow_rerun_success: false,
        skip_flag: None,
    }
}

const CHECKS: &[ConsoleCheck] = &[
    ConsoleCheck {
        skip_flag: Some(Flag::NoEmergencyShellCheck),
        ..check(
            "emergency shell",
            "Press Enter for emergency shell|Starting Emergency Shell|You are in emergency mode",
        )
    },
    check("dracut fatal", "dracut: Refusing to continue"),
    check("kernel panic", "Kernel panic - not syncing: (.*)"),
    check("kernel oops", "Oops:"),
    // Usually slow I/O on the host rather than a bug in the image
    ConsoleCheck {
        warn_only: true,
        allow_rerun_success: true,
        ..check("kernel soft lockup", "watchdog: BUG: soft lockup - CPU")
    },
    check("kernel warning", r"WARNING: CPU: \d+ PID: \d+ at (.+)"),
    check("failure of disk under I/O", "rejecting I/O to offline device"),
    check(
        "ext4 delayed allocation failure",
        r"EXT4-fs \([^)]+\): Delayed block allocation failed for inode \d+ at logical offset \d+ with max blocks \d+ with (error \d+)",
    ),
    check("GRUB memory corruption", "((alloc|free) magic) (is )?broken"),
    check(
        "Ignition fetch cancellation race",
        r"ignition\[[0-9]+\]: failed to fetch config: context canceled",
    ),
    check(
        "initrd-cleanup.service terminated",
        r"initrd-cleanup\.service: Main process exited, code=killed, status=15/TERM",
    ),
    check("segfault", "SIGSEGV|=11/SEGV"),
    check("core dump", "[Cc]ore dump"),
    check("systemd ordering cycle", "Ordering cycle found"),
    check("oom killer", "invoked oom-killer"),
    check(
        "systemd generator failure",
        "(/.*/system-generators/.*) (failed with exit status|terminated by signal|failed due to unknown reason)",
    ),
];

fn compiled() -> &'static [(&'static ConsoleCheck, Regex)] {
    static COMPILED: OnceLock<Vec<(&'static ConsoleCheck, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        CHECKS
            .iter()
            .filter_map(|c| match Regex::new(c.pattern) {
                Ok(re) => Some((c, re)),
                Err(e) => {
                    tracing::error!(check = c.desc, "invalid console check: {}", e);
                    None
                }
            })
            .collect()
    })
}

/// Problems found in one console log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleFindings {
    /// Short descriptions of each bad line
    pub badlines: Vec<String>,
    /// Every hit is warning-only
    pub warn_only: bool,
    /// Every hit tolerates a successful rerun
    pub allow_rerun_success: bool,
}

impl ConsoleFindings {
    pub fn is_empty(&self) -> bool {
        self.badlines.is_empty()
    }
}

/// Scan `output`, honoring the skip flags of `test`
pub fn check_console(output: &str, test: Option<&Test>) -> ConsoleFindings {
    let mut findings = ConsoleFindings {
        badlines: Vec::new(),
        warn_only: true,
        allow_rerun_success: true,
    };
    for (c, re) in compiled() {
        if let (Some(flag), Some(test)) = (c.skip_flag, test) {
            if test.has_flag(flag) {
                continue;
            }
        }
        let Some(caps) = re.captures(output) else {
            continue;
        };
        let badline = match caps.get(1) {
            Some(detail) => format!("{} ({})", c.desc, detail.as_str()),
            None => c.desc.to_string(),
        };
        findings.badlines.push(badline);
        findings.warn_only &= c.warn_only;
        findings.allow_rerun_success &= c.allow_rerun_success;
    }
    findings
}
