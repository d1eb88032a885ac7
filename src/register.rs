//! Test Descriptors
//!
//! A [`Test`] statically declares everything the dispatcher needs to know
//! before a test body runs: how many machines to boot, which platforms,
//! distros, architectures and firmwares it applies to, what first-boot
//! configuration to inject and which native functions must be available in
//! the guest.
//!
//! # Example
//!
//! ```no_run
//! use kola::register::{Flag, Test};
//!
//! let test = Test::new("coreos.example", |c| async move {
//!     let m = c.machine(0)?;
//!     c.must_ssh(&m, "true").await?;
//!     Ok(())
//! })
//! .cluster_size(1)
//! .distros(&["fcos"])
//! .flag(Flag::NoEmergencyShellCheck);
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use semver::Version;

use crate::cluster::TestCluster;
use crate::conf::UserData;
use crate::harness::TestResult;
use crate::Result;

/// Type alias for test entry points
pub type RunFn =
    Arc<dyn Fn(TestCluster) -> Pin<Box<dyn Future<Output = TestResult> + Send>> + Send + Sync>;

/// Future returned by a native function when it runs inside the guest
pub type NativeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Special-case options for a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Don't inject the SSH key into Ignition/cloud-config
    NoSshKeyInUserData,
    /// Don't add the SSH key to platform metadata
    NoSshKeyInMetadata,
    /// Don't grant credentials (instance profile, service account) to the instance
    NoInstanceCreds,
    /// Don't check console output for emergency shell invocation
    NoEmergencyShellCheck,
    /// Ignore Ignition and Butane warnings instead of failing
    AllowConfigWarnings,
    /// The test needs to reach the internet
    RequiresInternet,
}

/// A function compiled into `kolet` and executed inside the guest.
///
/// Declared as a constant next to the test that uses it, listed on the
/// descriptor with [`Test::native`] and invoked with
/// [`TestCluster::run_native`](crate::cluster::TestCluster::run_native).
#[derive(Clone, Copy)]
pub struct NativeFunc {
    /// Name used on the `kolet run <test> <func>` command line
    pub name: &'static str,
    /// Entry point
    pub func: fn() -> NativeFuture,
    /// Architectures and/or distros on which this function is dropped
    pub exclusions: &'static [&'static str],
}

impl NativeFunc {
    /// Create a native function with no exclusions
    pub const fn new(name: &'static str, func: fn() -> NativeFuture) -> Self {
        Self {
            name,
            func,
            exclusions: &[],
        }
    }

    /// Exclude this function on the given architectures and/or distros
    pub const fn excluding(mut self, exclusions: &'static [&'static str]) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Run the function in the current process
    pub async fn call(&self) -> Result<()> {
        (self.func)().await
    }
}

impl std::fmt::Debug for NativeFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunc")
            .field("name", &self.name)
            .field("exclusions", &self.exclusions)
            .finish()
    }
}

/// A local directory uploaded to every machine before the test runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDir {
    /// Directory on the host
    pub local: PathBuf,
    /// Destination directory on the machine
    pub remote: String,
}

/// The main test abstraction.
///
/// `run` is the actual testing function; every other field declares state
/// of the [`TestCluster`] before `run` is called.
#[derive(Clone)]
pub struct Test {
    /// Unique name within its table (dotted namespace)
    pub name: String,
    /// Entry point
    pub run: RunFn,
    /// Human readable description
    pub description: String,
    /// Machines booted before `run`; 0 means the test creates its own
    pub cluster_size: usize,
    /// Allowlist of platforms (empty means all)
    pub platforms: Vec<String>,
    /// Denylist of platforms (empty means none)
    pub exclude_platforms: Vec<String>,
    /// Allowlist of distros
    pub distros: Vec<String>,
    /// Denylist of distros
    pub exclude_distros: Vec<String>,
    /// Allowlist of machine architectures
    pub architectures: Vec<String>,
    /// Denylist of machine architectures
    pub exclude_architectures: Vec<String>,
    /// Allowlist of firmwares
    pub firmwares: Vec<String>,
    /// Denylist of firmwares
    pub exclude_firmwares: Vec<String>,
    /// Special-case options
    pub flags: Vec<Flag>,
    /// Free-form labels
    pub tags: Vec<String>,
    /// If set, the test is filtered out unless this tag is requested or
    /// the test is selected by exact name
    pub required_tag: Option<String>,
    /// First version the test applies to (inclusive)
    pub min_version: Option<Version>,
    /// First version the test no longer applies to (exclusive)
    pub end_version: Option<Version>,
    /// First-boot configuration
    pub user_data: Option<UserData>,
    /// Functions available through `kolet` inside the guest
    pub native_funcs: Vec<NativeFunc>,
    /// Skip remaining sub-tests once one fails
    pub fail_fast: bool,
    /// Sizes of additional empty disks, e.g. `["1G", "5G:mpath"]`
    pub additional_disks: Vec<String>,
    /// Minimum memory in MB
    pub min_memory: Option<usize>,
    /// Minimum primary disk size in GB
    pub min_disk_size: Option<usize>,
    /// Additional NICs
    pub additional_nics: usize,
    /// Extra kernel arguments
    pub append_kernel_args: Option<String>,
    /// Executable uploaded to the machines and run by the test
    pub external_test: Option<PathBuf>,
    /// Directories uploaded to the machines
    pub dependency_dirs: Vec<DependencyDir>,
}

impl std::fmt::Debug for Test {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Test")
            .field("name", &self.name)
            .field("cluster_size", &self.cluster_size)
            .field("platforms", &self.platforms)
            .field("exclude_platforms", &self.exclude_platforms)
            .field("distros", &self.distros)
            .field("exclude_distros", &self.exclude_distros)
            .field("flags", &self.flags)
            .field("tags", &self.tags)
            .field("min_version", &self.min_version)
            .field("end_version", &self.end_version)
            .field("native_funcs", &self.native_funcs)
            .field("fail_fast", &self.fail_fast)
            .finish()
    }
}

impl Test {
    /// Start describing a new test
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(TestCluster) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |c| Box::pin(run(c))),
            description: String::new(),
            cluster_size: 0,
            platforms: Vec::new(),
            exclude_platforms: Vec::new(),
            distros: Vec::new(),
            exclude_distros: Vec::new(),
            architectures: Vec::new(),
            exclude_architectures: Vec::new(),
            firmwares: Vec::new(),
            exclude_firmwares: Vec::new(),
            flags: Vec::new(),
            tags: Vec::new(),
            required_tag: None,
            min_version: None,
            end_version: None,
            user_data: None,
            native_funcs: Vec::new(),
            fail_fast: false,
            additional_disks: Vec::new(),
            min_memory: None,
            min_disk_size: None,
            additional_nics: 0,
            append_kernel_args: None,
            external_test: None,
            dependency_dirs: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn cluster_size(mut self, size: usize) -> Self {
        self.cluster_size = size;
        self
    }

    pub fn platforms(mut self, platforms: &[&str]) -> Self {
        self.platforms = to_strings(platforms);
        self
    }

    pub fn exclude_platforms(mut self, platforms: &[&str]) -> Self {
        self.exclude_platforms = to_strings(platforms);
        self
    }

    pub fn distros(mut self, distros: &[&str]) -> Self {
        self.distros = to_strings(distros);
        self
    }

    pub fn exclude_distros(mut self, distros: &[&str]) -> Self {
        self.exclude_distros = to_strings(distros);
        self
    }

    pub fn architectures(mut self, arches: &[&str]) -> Self {
        self.architectures = to_strings(arches);
        self
    }

    pub fn exclude_architectures(mut self, arches: &[&str]) -> Self {
        self.exclude_architectures = to_strings(arches);
        self
    }

    pub fn firmwares(mut self, firmwares: &[&str]) -> Self {
        self.firmwares = to_strings(firmwares);
        self
    }

    pub fn exclude_firmwares(mut self, firmwares: &[&str]) -> Self {
        self.exclude_firmwares = to_strings(firmwares);
        self
    }

    pub fn flag(mut self, flag: Flag) -> Self {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(to_strings(tags));
        self
    }

    pub fn required_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tag = Some(tag.into());
        self
    }

    pub fn min_version(mut self, version: Version) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn end_version(mut self, version: Version) -> Self {
        self.end_version = Some(version);
        self
    }

    pub fn user_data(mut self, user_data: UserData) -> Self {
        self.user_data = Some(user_data);
        self
    }

    /// Make a native function available to this test
    pub fn native(mut self, func: NativeFunc) -> Self {
        self.native_funcs.push(func);
        self
    }

    pub fn fail_fast(mut self, enable: bool) -> Self {
        self.fail_fast = enable;
        self
    }

    pub fn additional_disks(mut self, disks: &[&str]) -> Self {
        self.additional_disks = to_strings(disks);
        self
    }

    pub fn min_memory(mut self, mb: usize) -> Self {
        self.min_memory = Some(mb);
        self
    }

    pub fn min_disk_size(mut self, gb: usize) -> Self {
        self.min_disk_size = Some(gb);
        self
    }

    pub fn additional_nics(mut self, count: usize) -> Self {
        self.additional_nics = count;
        self
    }

    pub fn append_kernel_args(mut self, args: impl Into<String>) -> Self {
        self.append_kernel_args = Some(args.into());
        self
    }

    pub fn external_test(mut self, path: impl Into<PathBuf>) -> Self {
        self.external_test = Some(path.into());
        self
    }

    pub fn dependency_dir(mut self, local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        self.dependency_dirs.push(DependencyDir {
            local: local.into(),
            remote: remote.into(),
        });
        self
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the test declares a version range at all
    pub fn is_version_gated(&self) -> bool {
        self.min_version.is_some() || self.end_version.is_some()
    }

    /// Look up a declared native function by name
    pub fn native_func(&self, name: &str) -> Option<&NativeFunc> {
        self.native_funcs.iter().find(|f| f.name == name)
    }

    /// Whether `kolet` has to be uploaded before the test runs
    pub fn needs_kolet(&self) -> bool {
        !self.native_funcs.is_empty() || self.external_test.is_some()
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
