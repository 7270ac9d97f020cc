//! 🧵 Workers: background tasks that own their state and report back through a JoinHandle.
//!
//! Bulk workers drain the document queue; the flush worker ticks the sample buffer.
//! Both are spawned the same way and joined the same way.

use anyhow::Result;
use tokio::task::JoinHandle;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Spawn onto the runtime. The handle resolves once the worker is done for good.
    fn start(self) -> JoinHandle<Result<()>>;
}
