//! Dispatcher Tests
//!
//! Ordering, fail-fast, cleanup and rerun behaviour of the runner, plus the
//! helpers test bodies lean on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use kola::cluster::NOT_RUN_MESSAGE;
use kola::harness::Outcome;
use kola::platform::mock::MockProvider;
use kola::register::Test;
use kola::registry::{Registry, RegistryBuilder};
use kola::report::{SuiteReport, REPORT_FILE};
use kola::runner::{RunOptions, Runner};
use kola::upgrade::{Graph, AGE_INDEX_KEY};
use kola::util::run_paired;
use kola::Error;

fn registry(tests: Vec<Test>) -> Registry {
    let mut builder = RegistryBuilder::new();
    for test in tests {
        builder.register(test);
    }
    builder.build().unwrap()
}

fn options(dir: &tempfile::TempDir) -> RunOptions {
    RunOptions::new("qemu").output_dir(dir.path())
}

// =============================================================================
// FAIL-FAST
// =============================================================================

/// After the first failed sub-test the remaining siblings are reported but
/// never executed
#[tokio::test]
async fn test_fail_fast_skips_later_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    let test = Test::new("dispatch.failfast", move |c| {
        let executed = counter.clone();
        async move {
            c.run("a", |c| async move { Err(c.fatal("a broke")) }).await;
            for name in ["b", "c"] {
                let executed = executed.clone();
                c.run(name, |_c| async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            }
            Ok(())
        }
    })
    .cluster_size(1)
    .fail_fast(true);

    let runner = Runner::new(Arc::new(MockProvider::new("qemu")), options(&dir));
    let report = runner.run(&registry(vec![test]), &["dispatch.*"]).await.unwrap();

    let top = &report.tests[0];
    assert_eq!(top.outcome, Outcome::Fail);
    let outcomes: Vec<_> = top.subtests.iter().map(|s| s.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Fail, Outcome::NotRun, Outcome::NotRun]);
    assert_eq!(top.subtests[1].output, vec![NOT_RUN_MESSAGE.to_string()]);
    assert_eq!(executed.load(Ordering::SeqCst), 0);
}

/// Without fail-fast every sibling runs
#[tokio::test]
async fn test_siblings_run_without_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    let test = Test::new("dispatch.nofailfast", move |c| {
        let executed = counter.clone();
        async move {
            c.run("a", |c| async move { Err(c.fatal("a broke")) }).await;
            let executed = executed.clone();
            c.run("b", |_c| async move {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
            Ok(())
        }
    });

    let runner = Runner::new(Arc::new(MockProvider::new("qemu")), options(&dir));
    let report = runner.run(&registry(vec![test]), &["dispatch.*"]).await.unwrap();
    let outcomes: Vec<_> = report.tests[0].subtests.iter().map(|s| s.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Fail, Outcome::Pass]);
    assert_eq!(executed.load(Ordering::SeqCst), 1);
}

// =============================================================================
// CLEANUP
// =============================================================================

/// Every cluster is destroyed exactly once whatever the test body did
#[tokio::test]
async fn test_clusters_destroyed_once() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu");
    let stats = provider.stats();
    let tests = vec![
        Test::new("dispatch.pass", |_c| async { Ok(()) }).cluster_size(2),
        Test::new("dispatch.fatal", |c| async move { Err(c.fatal("broken")) }).cluster_size(1),
        Test::new("dispatch.skip", |c| async move { Err(c.skip("not today")) }).cluster_size(1),
        Test::new("dispatch.panic", |_c| async move {
            let broken = true;
            if broken {
                panic!("boom");
            }
            Ok(())
        })
        .cluster_size(1),
    ];

    let runner = Runner::new(Arc::new(provider), options(&dir).parallel(4));
    let report = runner.run(&registry(tests), &["dispatch.*"]).await.unwrap();

    assert_eq!(report.count(Outcome::Pass), 1);
    assert_eq!(report.count(Outcome::Fail), 2);
    assert_eq!(report.count(Outcome::Skip), 1);
    let panicked = report.tests.iter().find(|t| t.name == "dispatch.panic").unwrap();
    assert!(panicked.output.iter().any(|l| l.contains("panic: boom")));

    assert_eq!(stats.clusters_created(), 4);
    assert_eq!(stats.clusters_destroyed(), 4);
    assert_eq!(stats.machines_created(), 5);
    assert_eq!(stats.machines_destroyed(), 5);
}

/// A machine that fails to boot fails its test and the cluster is still
/// torn down
#[tokio::test]
async fn test_boot_failure_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("qemu").fail_creates(10);
    let stats = provider.stats();
    let test = Test::new("dispatch.noboot", |_c| async { Ok(()) }).cluster_size(1);

    let runner = Runner::new(Arc::new(provider), options(&dir));
    let report = runner.run(&registry(vec![test]), &["dispatch.noboot"]).await.unwrap();
    assert_eq!(report.tests[0].outcome, Outcome::Fail);
    assert!(report.tests[0]
        .output
        .iter()
        .any(|l| l.starts_with("Cluster failed starting machines")));
    assert_eq!(stats.clusters_created(), stats.clusters_destroyed());
}

// =============================================================================
// ORDERING AND CONCURRENCY
// =============================================================================

/// Results are reported in registry order, not completion order
#[tokio::test]
async fn test_report_order_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let sleepy = |name: &str, ms: u64| {
        Test::new(name, move |_c| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        })
    };
    let tests = vec![
        sleepy("dispatch.c", 1),
        sleepy("dispatch.a", 60),
        sleepy("dispatch.b", 20),
    ];

    let runner = Runner::new(Arc::new(MockProvider::new("qemu")), options(&dir).parallel(3));
    let report = runner.run(&registry(tests), &["dispatch.*"]).await.unwrap();
    let names: Vec<_> = report.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["dispatch.a", "dispatch.b", "dispatch.c"]);
}

/// No more than `parallel` tests run at once
#[tokio::test]
async fn test_parallelism_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tests = (0..6)
        .map(|i| {
            let (running, peak) = (running.clone(), peak.clone());
            Test::new(format!("dispatch.worker{}", i), move |_c| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        })
        .collect();

    let runner = Runner::new(Arc::new(MockProvider::new("qemu")), options(&dir).parallel(2));
    let report = runner.run(&registry(tests), &["dispatch.*"]).await.unwrap();
    assert!(report.success());
    assert_eq!(report.tests.len(), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

// =============================================================================
// RERUN AND REPORTING
// =============================================================================

/// A failure that passes on rerun is still a failure unless the test
/// allows it
#[tokio::test]
async fn test_rerun_without_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let test = Test::new("dispatch.flaky", move |c| {
        let attempts = counter.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(c.fatal("first attempt fails"));
            }
            Ok(())
        }
    });

    let runner = Runner::new(Arc::new(MockProvider::new("qemu")), options(&dir).rerun(true));
    let report = runner.run(&registry(vec![test]), &["dispatch.flaky"]).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let rerun = report.rerun.as_ref().unwrap();
    assert!(rerun.success());
    assert!(!report.flakes_tolerated);
    assert!(!report.success());
    assert!(matches!(report.check(), Err(Error::SuiteFailed)));
}

/// The report written to disk matches the one returned
#[tokio::test]
async fn test_report_written_to_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let test = Test::new("dispatch.logged", |c| async move {
        c.log("hello from the body");
        Ok(())
    });

    let runner = Runner::new(Arc::new(MockProvider::new("qemu")), options(&dir));
    let report = runner.run(&registry(vec![test]), &["dispatch.logged"]).await.unwrap();
    let written = SuiteReport::read_json(&dir.path().join(REPORT_FILE)).unwrap();
    assert_eq!(written.tests.len(), 1);
    assert_eq!(written.tests[0].name, report.tests[0].name);
    assert_eq!(written.tests[0].output, vec!["hello from the body".to_string()]);
    assert!(report.summary().contains("dispatch.logged"));
}

// =============================================================================
// HELPERS
// =============================================================================

/// Each update points at its predecessor and carries its age
#[test]
fn test_graph_document() {
    let mut graph = Graph::new();
    graph.seed("39.20240104.3.0", "aaaa");
    graph.push_update("39.20240104.3.0.kola", "bbbb");
    graph.push_update("39.20240104.3.0.kola.2", "cccc");

    let json = serde_json::to_value(&graph).unwrap();
    assert_eq!(json["edges"], serde_json::json!([[0, 1], [1, 2]]));
    assert_eq!(json["nodes"][2]["payload"], "cccc");
    assert_eq!(json["nodes"][2]["metadata"][AGE_INDEX_KEY], "2");

    let back: Graph = serde_json::from_value(json).unwrap();
    assert_eq!(back, graph);

    graph.seed("40.20240301.1.0", "dddd");
    assert_eq!(graph.nodes.len(), 1);
    assert!(graph.edges.is_empty());
}

#[tokio::test]
async fn test_run_paired_talker_waits_for_listener() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (l, t) = (order.clone(), order.clone());
    run_paired(
        Duration::from_secs(5),
        |ready| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            l.lock().unwrap().push("listening");
            ready.signal();
            Ok(())
        },
        || async move {
            t.lock().unwrap().push("talking");
            Ok(())
        },
    )
    .await
    .unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["listening", "talking"]);
}

#[tokio::test]
async fn test_run_paired_deadline() {
    let result = run_paired(
        Duration::from_millis(50),
        |_ready| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        },
        || async { Ok(()) },
    )
    .await;
    assert!(matches!(result, Err(Error::Timeout(_))));
}
