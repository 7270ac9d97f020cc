//! ⏱️ Periodic Flush Scheduler — one task, one ticker, one flush at a time.
//!
//! Every `period` the flush worker awaits [`FlushTarget::flush`]. Because the
//! cycle is awaited inside the loop, two cycles can never overlap; a cycle that
//! runs long simply eats the ticks it missed (`MissedTickBehavior::Skip`).
//!
//! [`PeriodicFlusher::stop`] signals the worker, which runs one last flush and
//! exits. `stop` returns only after that final flush is done.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::workers::Worker;

/// 🚽 Something that knows how to flush itself.
#[async_trait]
pub trait FlushTarget: Send + Sync + 'static {
    async fn flush(&self);
}

/// ⏱️ Handle to the running flush worker.
#[derive(Debug)]
pub struct PeriodicFlusher {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl PeriodicFlusher {
    /// 🚀 Start ticking. The first flush happens one full `period` from now.
    pub fn start(period: Duration, target: Arc<dyn FlushTarget>) -> Result<Self> {
        if period.is_zero() {
            bail!("💀 The flush period must be greater than zero");
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = FlushWorker {
            period,
            target,
            stop_rx,
        }
        .start();
        debug!("⏱️ Periodic flusher started (every {:?})", period);
        Ok(Self { stop_tx, handle })
    }

    /// 🛑 Stop ticking and wait for the final flush.
    ///
    /// A flush cycle that panicked takes the caller down with it.
    pub async fn stop(self) {
        // 🤷 A send error means the worker is already gone; joining tells us why.
        let _ = self.stop_tx.send(());
        match self.handle.await {
            Ok(Ok(())) => debug!("🏁 Periodic flusher stopped"),
            Ok(Err(err)) => error!("💀 Periodic flusher ended with an error: {err:#}"),
            Err(join_err) if join_err.is_panic() => std::panic::resume_unwind(join_err.into_panic()),
            Err(join_err) => error!("💀 Periodic flusher was cancelled: {join_err}"),
        }
    }
}

struct FlushWorker {
    period: Duration,
    target: Arc<dyn FlushTarget>,
    stop_rx: oneshot::Receiver<()>,
}

impl Worker for FlushWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.target.flush().await,
                    _ = &mut self.stop_rx => {
                        debug!("🛑 Flush worker asked to stop; one last flush for the road");
                        self.target.flush().await;
                        return Ok(());
                    }
                }
            }
        })
    }
}
