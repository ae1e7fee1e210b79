//! Coalescing pass scheduler
//!
//! Triggers from timers, health events and the admin API all land on one
//! `Notify`. A single worker runs passes one at a time; any number of
//! triggers arriving during a pass collapse into exactly one follow-up pass.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

#[derive(Default)]
pub struct Scheduler {
    notify: Notify,
    triggers: AtomicU64,
    passes: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass; coalesces with any request already pending
    pub fn trigger(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn triggers(&self) -> u64 {
        self.triggers.load(Ordering::Relaxed)
    }

    /// Passes started so far
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Run `work` on every tick of `interval` and on every trigger until
    /// `shutdown` flips to true
    pub fn start<F, Fut>(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        work: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = self.notify.notified() => {}
                    _ = ticker.tick() => {}
                }
                self.passes.fetch_add(1, Ordering::Relaxed);
                work().await;
            }
            tracing::info!(passes = self.passes(), "Scheduler stopped");
        })
    }
}
