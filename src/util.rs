//! Retry, polling and small concurrency helpers shared by the dispatcher and
//! test bodies.

use std::future::Future;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Call `f` up to `attempts` times, sleeping `delay` between failures.
/// Returns the last error if every attempt fails.
pub async fn retry<F, Fut, T>(attempts: usize, delay: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    "attempt failed: {}",
                    e
                );
                last_error = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Timeout("retry exhausted".into())))
}

/// Poll `f` every `interval` until it succeeds or `timeout` elapses
pub async fn retry_until<F, Fut, T>(timeout: Duration, interval: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if Instant::now() + interval > deadline {
                    return Err(Error::Timeout(format!(
                        "{} (gave up after {})",
                        e,
                        humantime::format_duration(timeout)
                    )));
                }
                tracing::debug!("still waiting: {}", e);
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Readiness handle passed to the listening side of [`run_paired`]
#[derive(Debug)]
pub struct Ready(oneshot::Sender<()>);

impl Ready {
    /// Let the talking side start
    pub fn signal(self) {
        let _ = self.0.send(());
    }
}

/// Run a listener/talker pair under one deadline.
///
/// The talker starts only after the listener calls [`Ready::signal`]. The
/// pair fails if either side fails, if the listener finishes without
/// signalling, or if `deadline` elapses; the other side is dropped.
pub async fn run_paired<L, LF, T, TF>(deadline: Duration, listener: L, talker: T) -> Result<()>
where
    L: FnOnce(Ready) -> LF,
    LF: Future<Output = Result<()>>,
    T: FnOnce() -> TF,
    TF: Future<Output = Result<()>>,
{
    let (tx, rx) = oneshot::channel();
    let listen = listener(Ready(tx));
    let talk = async move {
        rx.await
            .map_err(|_| Error::Provision("listener finished without becoming ready".into()))?;
        talker().await
    };

    tokio::time::timeout(deadline, futures_util::future::try_join(listen, talk))
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "paired tasks did not finish within {}",
                humantime::format_duration(deadline)
            ))
        })?
        .map(|_| ())
}

/// Run `f` over `items` with at most `limit` in flight; results keep input
/// order and the first error wins.
pub async fn run_concurrently<I, F, Fut, T>(limit: usize, items: I, f: F) -> Result<Vec<T>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    stream::iter(items)
        .map(f)
        .buffered(limit.max(1))
        .try_collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let v = retry(2, Duration::from_millis(1), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Provision("boot failed".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let err = retry(2, Duration::from_millis(1), || async {
            Err::<(), _>(Error::Provision("boot failed".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Provision(_)));
    }

    #[tokio::test]
    async fn test_retry_until_times_out() {
        let err = retry_until(Duration::from_millis(30), Duration::from_millis(10), || async {
            Err::<(), _>(Error::Provision("service not active".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.to_string().contains("service not active"));
    }

    #[tokio::test]
    async fn test_run_paired_talker_waits_for_listener() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        run_paired(
            Duration::from_secs(5),
            |ready| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                o1.lock().unwrap().push("bound");
                ready.signal();
                Ok(())
            },
            || async move {
                o2.lock().unwrap().push("connect");
                Ok(())
            },
        )
        .await
        .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["bound", "connect"]);
    }

    #[tokio::test]
    async fn test_run_paired_deadline_before_ready() {
        let err = run_paired(
            Duration::from_millis(20),
            |ready| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ready.signal();
                Ok(())
            },
            || async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_run_paired_listener_without_signal() {
        let err = run_paired(
            Duration::from_secs(1),
            |_ready| async { Ok(()) },
            || async { Ok(()) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("without becoming ready"));
    }

    #[tokio::test]
    async fn test_run_concurrently_bounded_and_ordered() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let out = run_concurrently(2, 0..6, |i| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(i * 10)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, vec![0, 10, 20, 30, 40, 50]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
