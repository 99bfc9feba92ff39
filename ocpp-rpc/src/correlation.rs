//! Request/response correlation
//!
//! Outstanding CALLs are keyed solely by request id. Each pending entry is
//! resolved exactly once by whichever comes first: a matching CALLRESULT, a
//! matching error, a transport failure, or its deadline. The entry leaves
//! the table at the moment of resolution, so a late duplicate response finds
//! nothing and is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::error::SendError;
use crate::identity::{Identity, RequestId};

/// What a pending request resolves to
pub type Resolution = Result<Value, SendError>;

/// Deadline used when `now + timeout` does not fit in an `Instant` (~30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct PendingSlot {
    target: Identity,
    action: String,
    via: ConnectionId,
    sent_at: DateTime<Utc>,
    resolve_tx: oneshot::Sender<Resolution>,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, PendingSlot>>>;

/// Table of outstanding requests
#[derive(Clone, Default)]
pub struct CorrelationEngine {
    pending: PendingTable,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outgoing request before it is transmitted
    pub fn register(
        &self,
        request_id: RequestId,
        target: Identity,
        action: impl Into<String>,
        via: ConnectionId,
        timeout: Duration,
    ) -> Result<PendingRequest, SendError> {
        let action = action.into();
        let sent_at = Utc::now();
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let (resolve_tx, resolve_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(SendError::DuplicateRequestId(request_id));
            }
            pending.insert(
                request_id.clone(),
                PendingSlot {
                    target: target.clone(),
                    action: action.clone(),
                    via,
                    sent_at,
                    resolve_tx,
                },
            );
        }

        debug!("Pending {} {} -> {}", action, request_id, target);

        Ok(PendingRequest {
            request_id,
            target,
            action,
            sent_at,
            deadline,
            resolve_rx,
            table: self.pending.clone(),
        })
    }

    /// Resolve a pending request. Returns false if nothing was pending
    /// under this id (unknown, already resolved, or timed out).
    pub fn resolve(&self, request_id: &RequestId, outcome: Resolution) -> bool {
        let slot = self.pending.lock().remove(request_id);

        match slot {
            Some(slot) => {
                let latency = Utc::now() - slot.sent_at;
                debug!(
                    "Resolved {} {} from {} after {}ms (ok={})",
                    slot.action,
                    request_id,
                    slot.target,
                    latency.num_milliseconds(),
                    outcome.is_ok()
                );
                // The caller may have given up in the meantime
                let _ = slot.resolve_tx.send(outcome);
                true
            }
            None => {
                debug!("Dropping response for unknown request id {}", request_id);
                false
            }
        }
    }

    /// Target identity of a pending request
    pub fn target_of(&self, request_id: &RequestId) -> Option<Identity> {
        self.pending.lock().get(request_id).map(|s| s.target.clone())
    }

    /// Fail every request that was sent over a connection that went away
    pub fn fail_connection(&self, via: ConnectionId, reason: &str) -> usize {
        let failed: Vec<(RequestId, PendingSlot)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, slot)| slot.via == via)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        for (request_id, slot) in &failed {
            warn!(
                "Failing {} {} to {}: {}",
                slot.action, request_id, slot.target, reason
            );
        }
        let count = failed.len();
        for (_, slot) in failed {
            let _ = slot
                .resolve_tx
                .send(Err(SendError::TransmissionFailed(reason.to_string())));
        }
        count
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Handle to one outstanding request.
///
/// Dropping it before resolution (e.g. when the caller's task is cancelled)
/// removes the entry from the table.
pub struct PendingRequest {
    request_id: RequestId,
    target: Identity,
    action: String,
    sent_at: DateTime<Utc>,
    deadline: Instant,
    resolve_rx: oneshot::Receiver<Resolution>,
    table: PendingTable,
}

impl PendingRequest {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn target(&self) -> &Identity {
        &self.target
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the outcome: response, error, transport failure or timeout
    pub async fn resolution(mut self) -> Resolution {
        match tokio::time::timeout_at(self.deadline, &mut self.resolve_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SendError::TransmissionFailed("request abandoned".to_string())),
            Err(_) => {
                let removed = self.table.lock().remove(&self.request_id).is_some();
                if removed {
                    debug!(
                        "{} {} to {} timed out",
                        self.action, self.request_id, self.target
                    );
                    return Err(SendError::Timeout);
                }
                // Resolved concurrently with the deadline: take that outcome
                self.resolve_rx.try_recv().unwrap_or(Err(SendError::Timeout))
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.table.lock().remove(&self.request_id).is_some() {
            debug!(
                "{} {} to {} cancelled by caller",
                self.action, self.request_id, self.target
            );
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request_id)
            .field("target", &self.target)
            .field("action", &self.action)
            .field("sent_at", &self.sent_at)
            .finish()
    }
}
