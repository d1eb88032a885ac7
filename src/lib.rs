//! kola: integration tests for CoreOS-family images
//!
//! Tests are declared as [`register::Test`] descriptors and collected into a
//! [`registry::Registry`]. For each invocation the [`runner::Runner`]
//! selects the tests that apply to the platform, distro, architecture and
//! build version, provisions one cluster per test through a
//! [`platform::Provider`], runs the test body and tears the cluster down.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kola::prelude::*;
//! use kola::platform::mock::MockProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut builder = RegistryBuilder::new();
//!     builder.register(
//!         Test::new("coreos.example", |c| async move {
//!             let m = c.machine(0)?;
//!             c.must_ssh(m.as_ref(), "systemctl is-system-running").await?;
//!             Ok(())
//!         })
//!         .cluster_size(1),
//!     );
//!     let registry = builder.build()?;
//!
//!     let runner = Runner::new(Arc::new(MockProvider::new("qemu")), RunOptions::new("qemu"));
//!     let report = runner.run(&registry, &["coreos.*"]).await?;
//!     print!("{}", report.summary());
//!     report.check()?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod conf;
pub mod config;
pub mod console;
pub mod denylist;
pub mod error;
pub mod external;
pub mod filter;
pub mod harness;
pub mod platform;
pub mod register;
pub mod registry;
pub mod report;
pub mod runner;
pub mod suites;
pub mod upgrade;
pub mod util;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::cluster::TestCluster;
    pub use crate::conf::UserData;
    pub use crate::error::{Error, Result};
    pub use crate::harness::{Abort, TestResult};
    pub use crate::platform::{Cluster, Machine, Provider};
    pub use crate::register::{Flag, NativeFunc, NativeFuture, Test};
    pub use crate::registry::{Registry, RegistryBuilder, Table};
    pub use crate::report::SuiteReport;
    pub use crate::runner::{RunOptions, Runner};
    pub use crate::ExecOutput;
}

/// Output of a command run on a machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Remote exit status; -1 if the command was killed by a signal
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    /// Lossy UTF-8 stdout
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Lossy UTF-8 stderr
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        let mut out = self.stdout_str();
        out.push_str(&self.stderr_str());
        out.trim().to_string()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output() {
        let output = ExecOutput::new(b"active\n".to_vec(), b"warning: stale\n".to_vec(), 0);
        assert!(output.success());
        assert_eq!(output.stdout_str(), "active\n");
        assert_eq!(output.combined(), "active\nwarning: stale");
    }

    #[test]
    fn test_exec_output_failure() {
        let output = ExecOutput::new(Vec::new(), b"Unit not found.\n".to_vec(), 4);
        assert!(!output.success());
        assert_eq!(output.combined(), "Unit not found.");
    }
}
