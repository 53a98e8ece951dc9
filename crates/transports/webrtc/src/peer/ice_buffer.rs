//! ICE candidates held back until a remote description exists

use super::link::PeerLink;
use crate::signaling::IceCandidate;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Outcome of one drain
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

/// Candidates held per peer; the oldest are dropped beyond this
pub const MAX_PENDING_PER_PEER: usize = 32;

/// Per-peer queue of early ICE candidates
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    pending: HashMap<String, Vec<IceCandidate>>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate for `peer_id`, preserving arrival order
    pub fn add(&mut self, peer_id: &str, candidate: IceCandidate) {
        let queue = self.pending.entry(peer_id.to_string()).or_default();
        if queue.len() >= MAX_PENDING_PER_PEER {
            let dropped = queue.remove(0);
            debug!(peer_id, candidate = %dropped.candidate, "Candidate queue full, dropping oldest");
        }
        queue.push(candidate);
    }

    /// Apply every queued candidate once the link has a remote description
    ///
    /// Candidates are applied in arrival order and the queue is cleared. A
    /// candidate that fails is logged and skipped without aborting the rest.
    pub async fn drain_if_ready(&mut self, peer_id: &str, link: &PeerLink) -> DrainReport {
        let mut report = DrainReport::default();
        if !link.remote_description_set() {
            return report;
        }

        let Some(candidates) = self.pending.remove(peer_id) else {
            return report;
        };

        for candidate in candidates {
            match link.transport().add_ice_candidate(candidate.clone()).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        peer_id,
                        candidate = %candidate.candidate,
                        "Skipping ICE candidate: {}", e
                    );
                }
            }
        }

        debug!(
            peer_id,
            applied = report.applied,
            failed = report.failed,
            "Drained buffered ICE candidates"
        );
        report
    }

    /// Number of candidates waiting for `peer_id`
    pub fn pending(&self, peer_id: &str) -> usize {
        self.pending.get(peer_id).map_or(0, Vec::len)
    }

    /// Drop anything queued for `peer_id`
    pub fn discard(&mut self, peer_id: &str) {
        self.pending.remove(peer_id);
    }

    /// Drop the queues of peers for which `keep` is false
    ///
    /// Returns the number of candidates dropped.
    pub fn retain_peers(&mut self, keep: impl Fn(&str) -> bool) -> usize {
        let mut dropped = 0;
        self.pending.retain(|peer_id, queue| {
            let kept = keep(peer_id);
            if !kept {
                dropped += queue.len();
            }
            kept
        });
        dropped
    }
}
