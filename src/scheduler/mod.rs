//! Fixed-interval scheduler. Handlers are short, enqueue-only, and run
//! serially each tick; replica coordination happens inside the handlers via
//! the advisory [`lock::DistLock`].

pub mod decay;
pub mod lock;
pub mod refresh;

use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[async_trait]
pub trait TickHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> AppResult<()>;
}

pub struct Scheduler {
    tick: Duration,
    handlers: Vec<Arc<dyn TickHandler>>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            handlers: Vec::new(),
        }
    }

    pub fn register(mut self, handler: Arc<dyn TickHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Ticks until cancelled. The first tick fires immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("scheduler cancelled, exiting");
                    return;
                }
                _ = ticker.tick() => {}
            }

            for handler in &self.handlers {
                if cancel.is_cancelled() {
                    info!("scheduler cancelled mid-tick, exiting");
                    return;
                }
                info!(scheduler.handler = handler.name(), "running scheduled handler");
                if let Err(err) = handler.run().await {
                    error!(
                        scheduler.handler = handler.name(),
                        "scheduled handler failed: {err}"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        ticks: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TickHandler for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn run(&self) -> AppResult<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_handlers_each_tick_and_exits_on_cancel() {
        let ticks = Arc::new(AtomicU32::new(0));
        let scheduler = Scheduler::new(Duration::from_secs(3600)).register(Arc::new(Counter {
            ticks: ticks.clone(),
        }));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        // First tick is immediate.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
        let after_cancel = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_errors_do_not_stop_the_loop() {
        struct Failing {
            ticks: Arc<AtomicU32>,
        }

        #[async_trait]
        impl TickHandler for Failing {
            fn name(&self) -> &str {
                "failing"
            }

            async fn run(&self) -> AppResult<()> {
                self.ticks.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("tick failed").into())
            }
        }

        let ticks = Arc::new(AtomicU32::new(0));
        let scheduler = Scheduler::new(Duration::from_secs(60)).register(Arc::new(Failing {
            ticks: ticks.clone(),
        }));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
