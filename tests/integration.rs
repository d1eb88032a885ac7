//! Integration Tests for kola
//!
//! These tests drive the public API end to end against the mock platform:
//! - Registration and selection
//! - The built-in test catalog
//! - External tests

use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;

use kola::external;
use kola::filter::{self, FilterContext, Patterns};
use kola::harness::Outcome;
use kola::platform::mock::MockProvider;
use kola::register::Test;
use kola::registry::{Registry, RegistryBuilder, Table};
use kola::report::SuiteReport;
use kola::runner::{RunOptions, Runner};
use kola::suites;
use kola::{Error, ExecOutput};

fn noop(name: &str) -> Test {
    Test::new(name, |_c| async { Ok(()) })
}

fn catalog() -> Registry {
    let mut builder = RegistryBuilder::new();
    suites::register_all(&mut builder);
    builder.build().unwrap()
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput::new(stdout.as_bytes().to_vec(), Vec::new(), 0)
}

/// A stand-in for the kolet binary; the mock never executes it
fn fake_kolet(dir: &Path) -> PathBuf {
    let path = dir.join("kolet");
    std::fs::write(&path, b"\x7fELF").unwrap();
    path
}

async fn run(provider: MockProvider, options: RunOptions, patterns: &[&str]) -> SuiteReport {
    Runner::new(Arc::new(provider), options)
        .run(&catalog(), patterns)
        .await
        .unwrap()
}

// =============================================================================
// REGISTRATION TESTS
// =============================================================================

/// Two descriptors with the same name in one table are rejected
#[test]
fn test_duplicate_registration() {
    let mut builder = RegistryBuilder::new();
    builder.register(noop("coreos.basic"));
    builder.register(noop("coreos.basic"));
    let err = builder.build().unwrap_err();
    assert!(matches!(err, Error::Registration(_)));
    assert!(err.to_string().contains("already registered"));
}

/// A name registered as both a standard and an upgrade test is rejected
#[test]
fn test_name_shared_across_tables() {
    let mut builder = RegistryBuilder::new();
    builder.register(noop("coreos.basic"));
    builder.register_upgrade(noop("coreos.basic"));
    assert!(matches!(builder.build(), Err(Error::Registration(_))));

    let registry = catalog();
    assert_eq!(registry.table(Table::UpgradeTests).len(), 1);
    assert!(registry.get("fcos.upgrade.basic").is_some());
}

/// An end version must come after the min version
#[test]
fn test_version_range_rejected() {
    for (min, end) in [(Some((2, 0, 0)), (2, 0, 0)), (Some((3, 0, 0)), (2, 0, 0)), (None, (0, 0, 0))] {
        let mut test = noop("coreos.ranged").end_version(Version::new(end.0, end.1, end.2));
        if let Some((a, b, c)) = min {
            test = test.min_version(Version::new(a, b, c));
        }
        let mut builder = RegistryBuilder::new();
        builder.register(test);
        assert!(matches!(builder.build(), Err(Error::Registration(_))));
    }

    let mut builder = RegistryBuilder::new();
    builder.register(
        noop("coreos.ranged")
            .min_version(Version::new(2, 0, 0))
            .end_version(Version::new(2, 0, 1)),
    );
    assert!(builder.build().is_ok());
}

// =============================================================================
// SELECTION TESTS
// =============================================================================

fn selected(test: Test, patterns: &[&str], ctx: &FilterContext) -> bool {
    let test = Arc::new(test);
    let patterns = Patterns::new(patterns).unwrap();
    !filter::filter_tests([&test], &patterns, ctx).is_empty()
}

#[test]
fn test_platform_allowlist() {
    let aws_only = || noop("coreos.cloud").platforms(&["aws"]);
    assert!(!selected(aws_only(), &["*"], &FilterContext::new("qemu", "fcos")));
    assert!(selected(aws_only(), &["*"], &FilterContext::new("aws", "fcos")));
}

#[test]
fn test_platform_denylist() {
    let not_qemu = || noop("coreos.cloud").exclude_platforms(&["qemu"]);
    assert!(!selected(not_qemu(), &["*"], &FilterContext::new("qemu", "fcos")));
    for platform in ["aws", "gcp", "azure", "metal"] {
        assert!(selected(not_qemu(), &["*"], &FilterContext::new(platform, "fcos")));
    }
}

#[test]
fn test_version_gating() {
    let gated = || noop("coreos.new-feature").min_version(Version::new(1745, 0, 0));
    let at = |v: u64| FilterContext::new("qemu", "fcos").version(Version::new(v, 0, 0));

    assert!(!selected(gated(), &["coreos.*"], &at(1744)));
    assert!(selected(gated(), &["coreos.*"], &at(1746)));
    // typed by exact name, the range is ignored
    assert!(selected(gated(), &["coreos.new-feature"], &at(1744)));
}

#[test]
fn test_no_net_excludes_internet_tests() {
    let ctx = FilterContext::new("qemu", "fcos").no_net(true);
    assert!(!selected(
        noop("fcos.internet").flag(kola::register::Flag::RequiresInternet),
        &["*"],
        &ctx
    ));
    assert!(!selected(noop("fcos.pull").tags(&["needs-internet"]), &["*"], &ctx));
    assert!(selected(noop("fcos.offline"), &["*"], &ctx));
}

#[test]
fn test_unmatched_pattern_is_an_error() {
    let runner = Runner::new(Arc::new(MockProvider::new("qemu")), RunOptions::new("qemu"));
    assert!(matches!(
        runner.select(&catalog(), &["coreos.basic", "does.not.exist"]),
        Err(Error::Config(_))
    ));
}

// =============================================================================
// BUILT-IN CATALOG TESTS
// =============================================================================

/// Every native function runs as a sub-test through kolet
#[tokio::test]
async fn test_coreos_basic_runs_native_functions() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu");
    let stats = provider.stats();
    let options = RunOptions::new("qemu")
        .output_dir(dir.path().join("out"))
        .kolet(fake_kolet(dir.path()));
    let report = run(provider, options, &["coreos.basic"]).await;
    assert_eq!(report.tests.len(), 1);
    let basic = &report.tests[0];
    assert_eq!(basic.outcome, Outcome::Pass, "{:?}", basic);
    let subtests: Vec<_> = basic.subtests.iter().map(|s| s.name.as_str()).collect();
    assert!(subtests.contains(&"coreos.basic/PortSSH"));
    assert!(subtests.contains(&"coreos.basic/MachineID"));
    assert_eq!(stats.machines_created(), 1);
    assert_eq!(stats.machines_destroyed(), 1);
}

/// Native functions excluded on the architecture are not run
#[tokio::test]
async fn test_native_exclusions_by_arch() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = RunOptions::new("qemu")
        .output_dir(dir.path().join("out"))
        .kolet(fake_kolet(dir.path()));
    options.arch = "s390x".to_string();
    let provider = MockProvider::new("qemu");
    let report = run(provider, options, &["coreos.basic"]).await;
    let subtests: Vec<_> = report.tests[0]
        .subtests
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert!(!subtests.contains(&"coreos.basic/NetworkScripts"));
    assert!(subtests.contains(&"coreos.basic/ReadOnly"));
}

/// A failing kolet call fails only its sub-test
#[tokio::test]
async fn test_native_function_failure() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu").respond(
        "./kolet run coreos.basic ReadOnly",
        ExecOutput::new(Vec::new(), b"/usr is mounted read-write (rw)\n".to_vec(), 1),
    );
    let options = RunOptions::new("qemu")
        .output_dir(dir.path().join("out"))
        .kolet(fake_kolet(dir.path()));
    let report = run(provider, options, &["coreos.basic"]).await;
    let basic = &report.tests[0];
    assert_eq!(basic.outcome, Outcome::Fail);
    let failed: Vec<_> = basic
        .subtests
        .iter()
        .filter(|s| s.outcome == Outcome::Fail)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "coreos.basic/ReadOnly");
    assert!(failed[0].output.iter().any(|l| l.contains("read-write")));
    assert!(!report.success());
}

#[tokio::test]
async fn test_machine_id_survives_reboot() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu")
        .respond("cat /etc/machine-id", ok("0123456789abcdef0123456789abcdef\n"));
    let report = run(
        provider,
        RunOptions::new("qemu").output_dir(dir.path()),
        &["coreos.misc.machine-id-persists"],
    )
    .await;
    let test = &report.tests[0];
    assert_eq!(test.outcome, Outcome::Pass, "{:?}", test);
    assert_eq!(test.subtests.len(), 2);
}

#[tokio::test]
async fn test_network_reachability() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu")
        .respond("ss -Htln", ok("LISTEN 0 10 0.0.0.0:9988 0.0.0.0:*\n"))
        .respond("cat /tmp/kola-received", ok("kola-network-ping\n"));
    let stats = provider.stats();
    let report = run(
        provider,
        RunOptions::new("qemu").output_dir(dir.path()),
        &["coreos.network.reachability"],
    )
    .await;
    assert_eq!(report.tests[0].outcome, Outcome::Pass, "{:?}", report.tests[0]);
    assert_eq!(stats.machines_created(), 2);
}

/// Zincati reboots into the synthesized update
#[tokio::test]
async fn test_upgrade_basic() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu")
        .os_version("39.20240104.3.0")
        .respond("sudo ostree commit", ok("4e1b9d5ac31f\n"))
        .reboot_on("systemctl start zincati.service", Some("39.20240104.3.0.kola"));
    let options = RunOptions::new("qemu")
        .output_dir(dir.path().join("out"))
        .kolet(fake_kolet(dir.path()))
        .table(Table::UpgradeTests);
    let report = run(provider, options, &["fcos.upgrade.basic"]).await;

    let upgrade = &report.tests[0];
    assert_eq!(upgrade.outcome, Outcome::Pass, "{:?}", upgrade);
    let names: Vec<_> = upgrade.subtests.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["fcos.upgrade.basic/setup", "fcos.upgrade.basic/upgrade-from-current"]
    );
}

/// Without a reboot into the new version the remaining sub-tests fail
#[tokio::test]
async fn test_upgrade_basic_without_commit() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu");
    let options = RunOptions::new("qemu")
        .output_dir(dir.path().join("out"))
        .kolet(fake_kolet(dir.path()))
        .table(Table::UpgradeTests);
    let report = run(provider, options, &["fcos.upgrade.*"]).await;
    let upgrade = &report.tests[0];
    assert_eq!(upgrade.outcome, Outcome::Fail);
    assert!(upgrade.subtests[1]
        .output
        .iter()
        .any(|l| l.contains("ostree commit printed no checksum")));
}

// =============================================================================
// EXTERNAL TESTS
// =============================================================================

#[cfg(unix)]
fn external_tree(root: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let kola = root.join("tests/kola/files");
    std::fs::create_dir_all(kola.join("data")).unwrap();
    let exe = kola.join("test.sh");
    std::fs::write(&exe, "#!/bin/bash\n# kola: {\"tags\": \"files\"}\ntest -f \"$KOLA_EXT_DATA/expected\"\n").unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::write(kola.join("data/expected"), "x").unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_test_runs_through_kolet() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("config");
    external_tree(&root);

    let mut builder = RegistryBuilder::new();
    external::register_external_tests(&mut builder, &root).unwrap();
    let registry = builder.build().unwrap();

    let provider = MockProvider::new("qemu");
    let options = RunOptions::new("qemu")
        .output_dir(dir.path().join("out"))
        .kolet(fake_kolet(dir.path()));
    let runner = Runner::new(Arc::new(provider), options);
    let report = runner.run(&registry, &["ext.config.*"]).await.unwrap();
    assert_eq!(report.tests[0].name, "ext.config.files");
    assert_eq!(report.tests[0].outcome, Outcome::Pass, "{:?}", report.tests[0]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_test_failure() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("config");
    external_tree(&root);

    let mut builder = RegistryBuilder::new();
    external::register_external_tests(&mut builder, &root).unwrap();
    let registry = builder.build().unwrap();

    let provider = MockProvider::new("qemu").respond(
        "sudo ./kolet run-ext",
        ExecOutput::new(Vec::new(), b"expected file missing\n".to_vec(), 1),
    );
    let provider = Arc::new(provider);
    let options = RunOptions::new("qemu")
        .output_dir(dir.path().join("out"))
        .kolet(fake_kolet(dir.path()));
    let report = Runner::new(provider.clone(), options)
        .run(&registry, &["ext.config.files"])
        .await
        .unwrap();
    assert_eq!(report.tests[0].outcome, Outcome::Fail);
    assert!(report.tests[0]
        .output
        .iter()
        .any(|l| l.contains("expected file missing")));
    assert!(provider
        .history()
        .iter()
        .any(|cmd| cmd.contains("/var/opt/kola/extdata/expected")));
}
