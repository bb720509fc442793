use std::{future::Future, sync::Arc};

use anyhow::anyhow;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::run_unless_cancelled;

/// Default parallelism of per-session batch work.
pub const FANOUT_LIMIT: usize = 8;

/// Runs `task` for every item with at most `limit` running at once.
///
/// The first failure cancels the token handed to remaining tasks and is
/// returned once all spawned tasks have finished. On cancellation (of the
/// batch or of `token`) pending tasks are skipped and running ones are
/// dropped at their next suspension point.
pub async fn for_each_bounded<I, T, F, Fut>(
    items: I,
    limit: usize,
    token: &CancellationToken,
    task: F,
) -> anyhow::Result<()>
where
    I: IntoIterator<Item = T>,
    F: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let batch_token = token.child_token();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let mut first_error = None;

    for item in items {
        let permit = tokio::select! {
            biased;
            () = batch_token.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // reap finished tasks so an early failure stops the batch promptly
        while let Some(result) = tasks.try_join_next() {
            record_result(result, &batch_token, &mut first_error);
        }
        if batch_token.is_cancelled() {
            break;
        }

        let future = task(item, batch_token.clone());
        let task_token = batch_token.clone();
        tasks.spawn(async move {
            let _permit = permit;
            // in-flight work is abandoned as soon as the batch is cancelled
            run_unless_cancelled(&task_token, future)
                .await
                .unwrap_or(Ok(()))
        });
    }

    while let Some(result) = tasks.join_next().await {
        record_result(result, &batch_token, &mut first_error);
    }

    first_error.map_or(Ok(()), Err)
}

fn record_result(
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
    batch_token: &CancellationToken,
    first_error: &mut Option<anyhow::Error>,
) {
    let err = match result {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(err) => anyhow!("batch task terminated abnormally: {err}"),
    };
    batch_token.cancel();
    if first_error.is_none() {
        *first_error = Some(err);
    } else {
        debug!("Suppressing additional batch error: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use anyhow::bail;
    use tokio::time::sleep;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        for_each_bounded(0..50, FANOUT_LIMIT, &token, |_, _| {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 50);
        assert!(peak.load(Ordering::SeqCst) <= FANOUT_LIMIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_cancels_batch() {
        let started = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let result = for_each_bounded(0..100u32, 2, &token, |item, task_token| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if item == 3 {
                    bail!("session {item} lookup failed");
                }
                tokio::select! {
                    () = task_token.cancelled() => {}
                    () = sleep(Duration::from_secs(1)) => {}
                }
                Ok(())
            }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "session 3 lookup failed");
        assert!(started.load(Ordering::SeqCst) < 100);
        // the caller's token is untouched
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_all_work() {
        let started = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        token.cancel();

        for_each_bounded(0..10, FANOUT_LIMIT, &token, |_, _| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let token = CancellationToken::new();
        for_each_bounded(Vec::<u64>::new(), FANOUT_LIMIT, &token, |_, _| async {
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_running_tasks() {
        let finished = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        // tasks ignore their token, as a slow ledger query would
        for_each_bounded(0..4, FANOUT_LIMIT, &token, |_, _| {
            let finished = finished.clone();
            async move {
                sleep(Duration::from_secs(15)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
