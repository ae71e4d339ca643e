//! Bounded worker pool and run cancellation.
//!
//! Pages (detection) and batches (application) are independent units of
//! I/O-bound work. [`run_bounded`] keeps at most `limit` of them in flight on
//! a [`JoinSet`] and hands each result to a callback on the caller's task, so
//! the callback can write to the ledger or update counters without locking.
//!
//! [`StopFlag`] is checked between batches: once set, no new batch starts,
//! in-flight batches run to completion, and the unstarted jobs are returned
//! to the caller.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag on the first Ctrl-C.
    pub fn stop_on_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight batches");
                flag.stop();
            }
        });
    }
}

/// Run `work` over `jobs` with at most `limit` in flight.
///
/// `on_done` receives each output as it completes (in completion order) and
/// may return [`ControlFlow::Break`] to stop scheduling new jobs, e.g. on a
/// fatal error. Jobs never started, because of a break or the stop flag, are
/// returned in their original order.
pub async fn run_bounded<J, T, F, Fut, D>(
    jobs: Vec<J>,
    limit: usize,
    stop: &StopFlag,
    mut work: F,
    mut on_done: D,
) -> Vec<J>
where
    F: FnMut(J) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
    D: FnMut(T) -> ControlFlow<()>,
{
    let limit = limit.max(1);
    let mut pending = jobs.into_iter();
    let mut running: JoinSet<T> = JoinSet::new();
    let mut halted = false;

    loop {
        while !halted && running.len() < limit {
            if stop.is_stopped() {
                halted = true;
                break;
            }
            match pending.next() {
                Some(job) => {
                    running.spawn(work(job));
                }
                None => break,
            }
        }

        match running.join_next().await {
            Some(Ok(output)) => {
                if on_done(output).is_break() {
                    halted = true;
                }
            }
            Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Some(Err(e)) => warn!(error = %e, "batch task was cancelled"),
            None => break,
        }
    }

    pending.collect()
}
