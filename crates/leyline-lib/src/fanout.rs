//! Fixed fan-out over regions and over image fetches
//!
//! `FanOut` runs one unit of work per item of a known list. Every launch
//! takes a ticket; a batch starts only after every batch with a smaller
//! ticket has fully drained, so batches apply in launch order while units
//! inside one batch run in parallel. A launched batch always runs to
//! completion on its own task; callers can only wait for it.
//!
//! `bounded_map` is the image-fetch pool: at most `limit` units in flight,
//! results returned in input order.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

/// How the units of one batch are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutMode {
    /// One task per unit
    Parallel,
    /// Units one after another, pausing `cooldown` between them
    Sequential { cooldown: Duration },
}

/// Ticket-ordered launcher of fan-out batches
#[derive(Debug, Clone)]
pub struct FanOut {
    mode: FanOutMode,
    next_ticket: Arc<AtomicU64>,
    serving: Arc<watch::Sender<u64>>,
}

impl FanOut {
    pub fn new(mode: FanOutMode) -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            mode,
            next_ticket: Arc::new(AtomicU64::new(0)),
            serving: Arc::new(serving),
        }
    }

    pub fn parallel() -> Self {
        Self::new(FanOutMode::Parallel)
    }

    pub fn sequential(cooldown: Duration) -> Self {
        Self::new(FanOutMode::Sequential { cooldown })
    }

    pub fn mode(&self) -> FanOutMode {
        self.mode
    }

    /// Launch `f` once per unit. The ticket is taken now; work starts when
    /// every earlier batch has finished.
    pub fn launch<T, R, F, Fut>(&self, units: Vec<T>, f: F) -> FanOutHandle<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let mut now_serving = self.serving.subscribe();
        let turn = Turn {
            serving: Arc::clone(&self.serving),
            ticket,
        };
        let mode = self.mode;

        let handle = tokio::spawn(async move {
            // The sender lives in `turn`, so the channel cannot close here
            let _ = now_serving.wait_for(|now| *now >= ticket).await;
            debug!(ticket = ticket, units = units.len(), "Fan-out batch started");

            let results = match mode {
                FanOutMode::Parallel => run_parallel(units, f).await,
                FanOutMode::Sequential { cooldown } => run_sequential(units, f, cooldown).await,
            };

            drop(turn);
            results
        });

        FanOutHandle { ticket, handle }
    }

    /// Launch and wait
    pub async fn run<T, R, F, Fut>(&self, units: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.launch(units, f).join().await
    }
}

/// Advances "now serving" past its ticket when the batch ends, even on panic
struct Turn {
    serving: Arc<watch::Sender<u64>>,
    ticket: u64,
}

impl Drop for Turn {
    fn drop(&mut self) {
        let next = self.ticket + 1;
        self.serving.send_modify(|now| *now = (*now).max(next));
    }
}

/// A launched batch
pub struct FanOutHandle<R> {
    ticket: u64,
    handle: JoinHandle<Result<Vec<R>>>,
}

impl<R> FanOutHandle<R> {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// True once the batch has drained
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the batch; results are in unit order
    pub async fn join(self) -> Result<Vec<R>> {
        self.handle.await?
    }
}

async fn run_parallel<T, R, F, Fut>(units: Vec<T>, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let mut set = JoinSet::new();
    let total = units.len();
    for (index, unit) in units.into_iter().enumerate() {
        let fut = f(unit);
        set.spawn(async move { (index, fut.await) });
    }
    collect_indexed(set, total).await
}

async fn run_sequential<T, R, F, Fut>(units: Vec<T>, f: F, cooldown: Duration) -> Result<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let total = units.len();
    let mut results = Vec::with_capacity(total);
    for (index, unit) in units.into_iter().enumerate() {
        results.push(f(unit).await);
        if index + 1 < total && !cooldown.is_zero() {
            debug!(cooldown_secs = cooldown.as_secs_f64(), "Waiting between units");
            tokio::time::sleep(cooldown).await;
        }
    }
    Ok(results)
}

/// Run `f` over `items` with at most `limit` in flight; output order matches input
pub async fn bounded_map<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let total = items.len();
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let permits = Arc::clone(&permits);
        let fut = f(item);
        set.spawn(async move {
            // The semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            (index, fut.await)
        });
    }

    collect_indexed(set, total).await
}

async fn collect_indexed<R: Send + 'static>(
    mut set: JoinSet<(usize, R)>,
    total: usize,
) -> Result<Vec<R>> {
    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
    while let Some(joined) = set.join_next().await {
        let (index, result) = joined?;
        slots[index] = Some(result);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| slot.ok_or_else(|| Error::Model(format!("fan-out unit {i} produced no result"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_results_keep_unit_order() {
        let fanout = FanOut::parallel();
        let results = fanout
            .run(vec![30u64, 10, 20], |ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ms * 2
            })
            .await
            .unwrap();
        assert_eq!(results, vec![60, 20, 40]);
    }

    #[tokio::test]
    async fn test_batches_apply_in_launch_order() {
        let fanout = FanOut::parallel();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = Arc::clone(&log);
        let first = fanout.launch(vec![1, 2], move |unit| {
            let log = Arc::clone(&slow_log);
            async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                log.lock().unwrap().push(("first", unit));
            }
        });

        let fast_log = Arc::clone(&log);
        let second = fanout.launch(vec![3], move |unit| {
            let log = Arc::clone(&fast_log);
            async move {
                log.lock().unwrap().push(("second", unit));
            }
        });

        assert_eq!(second.ticket(), first.ticket() + 1);
        second.join().await.unwrap();
        assert!(first.is_finished());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], ("second", 3));
    }

    #[tokio::test]
    async fn test_panicking_batch_releases_next_ticket() {
        let fanout = FanOut::parallel();
        let failed = fanout.launch(vec![()], |_| async { panic!("unit failed") });
        let next = fanout.launch(vec![5], |v| async move { v });

        assert!(failed.join().await.is_err());
        assert_eq!(next.join().await.unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_sequential_matches_parallel() {
        let work = |v: i32| async move { v * v };
        let parallel = FanOut::parallel().run(vec![1, 2, 3], work).await.unwrap();
        let sequential = FanOut::sequential(Duration::ZERO)
            .run(vec![1, 2, 3], work)
            .await
            .unwrap();
        assert_eq!(parallel, sequential);
    }

    #[tokio::test]
    async fn test_bounded_map_caps_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let results = bounded_map((0..20).collect(), 3, move |i: usize| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                i * 10
            }
        })
        .await
        .unwrap();

        assert_eq!(results, (0..20).map(|i| i * 10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
