//! 🎯 Per-document outcomes — every document gets exactly one ending.
//!
//! Happy ending: `Success`. Sad ending: `Failure`, which is either the network
//! ghosting us (`Transport`) or Elasticsearch reading the document and saying
//! "no" with a reason (`Remote`). Either way the handler hears about it once,
//! logs it (or counts it, or whatever a test wants), and the pipeline moves on.

use std::fmt;

use tracing::{error, trace};

use crate::bulk::BulkItem;

/// 🎯 The terminal outcome of one submitted document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success { status: u16 },
    Failure(ItemFailure),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }
}

/// 💀 Why a document didn't make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemFailure {
    /// 📡 The request never got a usable HTTP answer.
    Transport { message: String },
    /// 🔒 Elasticsearch answered and refused this document (or the whole request).
    Remote {
        status: u16,
        kind: String,
        reason: String,
    },
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemFailure::Transport { message } => write!(f, "{message}"),
            ItemFailure::Remote { kind, reason, .. } => write!(f, "{kind}: {reason}"),
        }
    }
}

/// 📬 Receives each document's terminal outcome, exactly once.
///
/// # Contract 📜
/// - Called from bulk worker tasks, possibly concurrently. Keep it quick.
/// - Must not panic. Log, count, return. The pipeline keeps going regardless.
pub trait OutcomeHandler: Send + Sync {
    fn on_outcome(&self, item: &BulkItem, outcome: &ItemOutcome);
}

/// 📝 The production handler: failures go to the error log, successes to trace.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOutcomeHandler;

impl OutcomeHandler for LoggingOutcomeHandler {
    fn on_outcome(&self, _item: &BulkItem, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Success { status } => trace!("✅ Document indexed (status {status})"),
            ItemOutcome::Failure(failure) => error!("💀 Could not write metric document: {failure}"),
        }
    }
}
