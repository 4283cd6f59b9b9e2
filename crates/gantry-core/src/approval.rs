//! In-memory approval gate.
//!
//! A blocked approval stage registers a waiter here keyed by request id.
//! The first decision removes the waiter under the lock and delivers it
//! over a oneshot channel; later decisions for the same request find no
//! waiter. Persistence of the disposition is the engine's job.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use gantry_state::RequestId;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// An explicit human decision on a pending approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

#[derive(Debug, Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, oneshot::Sender<(Decision, Identity)>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the request and return its receiving end.
    /// Replaces any stale waiter left behind by an interrupted run.
    pub fn open(&self, request_id: &RequestId) -> oneshot::Receiver<(Decision, Identity)> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.0.clone(), tx);
        debug!(request_id = %request_id, "approval gate opened");
        rx
    }

    /// Deliver a decision to the waiting stage. Exactly one decision per
    /// request wins; all others get [`Error::AlreadyDecided`].
    pub fn decide(
        &self,
        request_id: &RequestId,
        decision: Decision,
        decided_by: Identity,
    ) -> Result<()> {
        let waiter = self.pending.lock().unwrap().remove(&request_id.0);
        match waiter {
            Some(tx) => {
                debug!(request_id = %request_id, decision = decision.as_str(), "approval decided");
                // Receiver dropped means the stage expired or aborted
                // between our remove and its cleanup.
                tx.send((decision, decided_by))
                    .map_err(|_| Error::AlreadyDecided(request_id.0.clone()))
            }
            None => Err(Error::AlreadyDecided(request_id.0.clone())),
        }
    }

    /// Drop the waiter without a decision (expiry or abort).
    pub fn close(&self, request_id: &RequestId) {
        self.pending.lock().unwrap().remove(&request_id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_decision_wins() {
        let gate = ApprovalGate::new();
        let req = RequestId::new();
        let rx = gate.open(&req);

        gate.decide(&req, Decision::Approve, Identity::new("alice"))
            .unwrap();
        let err = gate
            .decide(&req, Decision::Reject, Identity::new("bob"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyDecided(_)));

        let (decision, who) = rx.await.unwrap();
        assert_eq!(decision, Decision::Approve);
        assert_eq!(who.as_str(), "alice");
    }

    #[tokio::test]
    async fn closed_request_rejects_decisions() {
        let gate = ApprovalGate::new();
        let req = RequestId::new();
        let _rx = gate.open(&req);
        gate.close(&req);

        let err = gate
            .decide(&req, Decision::Approve, Identity::new("alice"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyDecided(_)));
    }

    #[tokio::test]
    async fn unknown_request_rejects_decisions() {
        let gate = ApprovalGate::new();
        let err = gate
            .decide(&RequestId::new(), Decision::Approve, Identity::new("alice"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyDecided(_)));
    }
}
