// Bounded parallel pool over a list of work items.
use anyhow::{bail, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct PoolOutput<O> {
    /// Index-aligned with the input items. `None` for items that never finished.
    pub results: Vec<Option<O>>,
    pub canceled: bool,
}

impl<O> PoolOutput<O> {
    pub fn completed(self) -> impl Iterator<Item = O> {
        self.results.into_iter().flatten()
    }
}

/// Run `work` over `items` with at most `pool_size` in flight.
///
/// On cancellation no new items are dispatched and in-flight tasks are detached;
/// whatever finished before that is returned with `canceled` set.
pub async fn run_parallel_pool<I, O, F, Fut>(
    pool_size: usize,
    items: Vec<I>,
    cancel: CancellationToken,
    work: F,
) -> Result<PoolOutput<O>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    if pool_size == 0 {
        bail!("Pool size must be positive");
    }

    let mut results: Vec<Option<O>> = items.iter().map(|_| None).collect();
    let mut canceled = false;

    let work = Arc::new(work);
    let semaphore = Arc::new(Semaphore::new(pool_size));
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                canceled = true;
                break;
            }
            permit = semaphore.clone().acquire_owned() => permit?,
        };

        let work = work.clone();
        tasks.spawn(async move {
            let _permit = permit;
            (index, work(item).await)
        });
    }

    while !canceled {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                canceled = true;
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok((index, output))) => results[index] = Some(output),
                Some(Err(err)) => {
                    warn!(error = %err, "Pool worker failed");
                    bail!("Pool worker failed: {}", err);
                }
            },
        }
    }

    if canceled {
        debug!(in_flight = tasks.len(), "Pool cancelled, detaching in-flight work");
        tasks.detach_all();
    }

    Ok(PoolOutput { results, canceled })
}
