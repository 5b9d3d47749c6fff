//! Parallel fan-out: run a batch of handles to completion, or drive
//! a bounded-concurrency map over a list of items.

use crate::errors::XecResult;
use crate::process::ProcessHandle;
use crate::result::ExecResult;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Options for [`all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllOptions {
    /// When set, collect every handle's outcome instead of failing fast on
    /// the first error.
    pub settled: bool,
}

/// Run every handle in `handles` concurrently.
///
/// By default this fails fast: the first error encountered is returned and
/// the remaining handles are left to run to completion in the background
/// (their results are simply not collected). With `settled: true`, every
/// handle's `Result` is collected and returned in input order, regardless of
/// failure.
///
/// # Errors
/// When `settled` is `false`, propagates the first error encountered.
pub async fn all(handles: Vec<ProcessHandle>, opts: AllOptions) -> XecResult<Vec<ExecResult>> {
    if opts.settled {
        let settled = all_settled(handles).await;
        let mut out = Vec::with_capacity(settled.len());
        for r in settled {
            out.push(r?);
        }
        Ok(out)
    } else {
        let futures: FuturesUnordered<_> = handles.into_iter().map(|h| h.output()).collect();
        let results: Vec<_> = futures.collect().await;
        results.into_iter().collect()
    }
}

/// Run every handle in `handles` concurrently, always collecting every
/// outcome rather than short-circuiting on the first failure. Order of the
/// returned `Vec` matches input order.
pub async fn all_settled(handles: Vec<ProcessHandle>) -> Vec<XecResult<ExecResult>> {
    let mut tasks = Vec::with_capacity(handles.len());
    for handle in handles {
        tasks.push(tokio::spawn(async move { handle.output().await }));
    }
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(result) => out.push(result),
            Err(e) => out.push(Err(crate::errors::XecError::Unsupported(format!("task panicked: {e}")))),
        }
    }
    out
}

/// Map `f` over `items` with at most `concurrency` calls in flight at once.
///
/// Execution order is not guaranteed (work is driven through a
/// [`FuturesUnordered`] so a fast item does not wait behind a slow one), but
/// the returned `Vec` preserves input order even though execution order
/// is not guaranteed.
pub async fn batch<T, F, Fut, R>(items: Vec<T>, concurrency: usize, f: F) -> Vec<R>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let concurrency = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let f = Arc::new(f);

    let mut indexed: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let semaphore = semaphore.clone();
            let f = f.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let result = f(item).await;
                (idx, result)
            })
        })
        .collect();

    let mut slots: Vec<Option<R>> = Vec::new();
    while let Some(joined) = indexed.next().await {
        match joined {
            Ok((idx, result)) => {
                if slots.len() <= idx {
                    slots.resize_with(idx + 1, || None);
                }
                slots[idx] = Some(result);
            }
            Err(e) => {
                // A panicking worker drops its slot; callers that need strict
                // per-item accounting should have `f` catch its own panics.
                tracing::warn!(error = %e, "batch worker task panicked");
            }
        }
    }
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalAdapter;
    use crate::command::Command;
    use std::sync::Arc as StdArc;

    fn handle(script: &str) -> ProcessHandle {
        ProcessHandle::new(StdArc::new(LocalAdapter::new()), Command::shell_string(script))
    }

    #[tokio::test]
    async fn all_settled_collects_every_outcome_even_on_failure() {
        let handles = vec![handle("exit 0"), handle("exit 7"), handle("exit 0")];
        let results = all_settled(handles).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn all_fails_fast_by_default() {
        let handles = vec![handle("exit 0"), handle("exit 3")];
        let result = all(handles, AllOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let items: Vec<u32> = (0..10).collect();
        let results = batch(items, 3, |n| async move { n * 2 }).await;
        assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<_>>());
    }
}
