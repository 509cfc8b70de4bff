//! Buffered early approval decisions (tool dialect).
//!
//! The tool-dialect peer announces an approval-eligible action twice: once
//! through a general event notification carrying the call identifier, and
//! once through the formal elicitation request that actually wants an
//! answer. The two arrive in no guaranteed order. When the event
//! notification wins the race under an automatic policy, there is nothing
//! to respond to yet — the decision is parked here, keyed by call id, and
//! consumed exactly once when the formal request shows up.
//!
//! An event that never gets a matching formal request would otherwise leak
//! its entry forever, so entries older than the eviction horizon are
//! pruned on every insert and claim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::driver::ApprovalDecision;

#[derive(Debug, Clone)]
struct BufferedDecision {
    decision: ApprovalDecision,
    recorded_at: Instant,
}

/// Side table of decisions that arrived before their formal request.
///
/// Cheaply cloneable; all clones share the table. Mutated only from the
/// notification path (insert) and the elicitation path (claim), both of
/// which run on the single dispatch flow — the mutex exists for the
/// adapter's clones living on spawned responder tasks.
#[derive(Debug, Clone)]
pub struct ApprovalLedger {
    entries: Arc<Mutex<HashMap<String, BufferedDecision>>>,
    horizon: Duration,
}

impl ApprovalLedger {
    /// Create a ledger whose unclaimed entries expire after `horizon`.
    #[must_use]
    pub fn new(horizon: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            horizon,
        }
    }

    /// Park a decision for `call_id` until its formal request arrives.
    ///
    /// A second record for the same call id replaces the first.
    pub async fn record(&self, call_id: &str, decision: ApprovalDecision) {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, self.horizon);
        entries.insert(
            call_id.to_owned(),
            BufferedDecision {
                decision,
                recorded_at: Instant::now(),
            },
        );
        debug!(call_id, ?decision, "approval ledger: decision buffered");
    }

    /// Consume the buffered decision for `call_id`, if one exists.
    ///
    /// The entry is removed — a decision is applied at most once.
    pub async fn claim(&self, call_id: &str) -> Option<ApprovalDecision> {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, self.horizon);
        let claimed = entries.remove(call_id).map(|entry| entry.decision);
        if claimed.is_some() {
            debug!(call_id, "approval ledger: buffered decision claimed");
        }
        claimed
    }

    /// Number of unclaimed entries (after pruning).
    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        Self::prune(&mut entries, self.horizon);
        entries.len()
    }

    /// Whether the ledger currently holds no unclaimed entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn prune(entries: &mut HashMap<String, BufferedDecision>, horizon: Duration) {
        entries.retain(|call_id, entry| {
            let keep = entry.recorded_at.elapsed() < horizon;
            if !keep {
                debug!(call_id, "approval ledger: evicting unclaimed decision");
            }
            keep
        });
    }
}
