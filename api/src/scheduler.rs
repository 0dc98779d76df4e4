//! Periodic task driver.
//!
//! Each registered task has a period, a jitter fraction and a cancellation
//! handle. Firings never overlap with their own previous run: a period
//! that elapses while the task body is still executing is dropped and
//! counted as an overrun.

use std::{future::Future,
          sync::{atomic::{AtomicU64, Ordering},
                 Arc},
          time::Duration};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::shutdown::{Shutdown, ShutdownHandle};

#[derive(Debug, Default)]
pub struct TaskCounters {
    pub runs:     AtomicU64,
    pub overruns: AtomicU64,
}

/// Handle to one scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub name: &'static str,
    counters: Arc<TaskCounters>,
}

impl TaskHandle {
    pub fn runs(&self) -> u64 { self.counters.runs.load(Ordering::Relaxed) }

    pub fn overruns(&self) -> u64 { self.counters.overruns.load(Ordering::Relaxed) }
}

/// Spawns periodic tasks onto the ambient tokio runtime and owns their
/// shutdown signalling.
#[derive(Debug)]
pub struct Scheduler {
    shutdown: ShutdownHandle,
    tasks:    Vec<TaskHandle>,
}

impl Default for Scheduler {
    fn default() -> Self { Self::new() }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shutdown: ShutdownHandle::new(),
            tasks:    Vec::new(),
        }
    }

    pub fn subscribe_shutdown(&self) -> Shutdown { self.shutdown.subscribe() }

    pub fn handles(&self) -> &[TaskHandle] { &self.tasks }

    /// Register `body` to run every `period` with up to ±10% jitter. The
    /// body runs to completion; a firing that catches it still running is
    /// dropped.
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, body: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let counters = Arc::new(TaskCounters::default());
        let handle = TaskHandle {
            name,
            counters: Arc::clone(&counters),
        };
        self.tasks.push(handle.clone());

        let mut shutdown = self.shutdown.subscribe();
        // the busy flag is what makes firings non-overlapping: a firing
        // that cannot take it is dropped, never queued
        let busy = Arc::new(Mutex::new(()));
        tokio::spawn(async move {
            debug!(task = name, ?period, "scheduled");
            loop {
                let sleep_for = jittered(period);
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {},
                    _ = shutdown.recv() => break,
                }
                match Arc::clone(&busy).try_lock_owned() {
                    Ok(guard) => {
                        counters.runs.fetch_add(1, Ordering::Relaxed);
                        let run = body();
                        tokio::spawn(async move {
                            run.await;
                            drop(guard);
                        });
                    },
                    Err(_) => {
                        counters.overruns.fetch_add(1, Ordering::Relaxed);
                        warn!(task = name, "previous run still active, firing dropped");
                    },
                }
            }
            debug!(task = name, "stopped");
        });
        handle
    }

    /// Signal all tasks and wait for them to finish their current body.
    pub async fn shutdown(self) { self.shutdown.shutdown().await; }
}

fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    period.mul_f64(factor)
}
