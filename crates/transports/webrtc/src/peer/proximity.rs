//! Proximity policy for the mesh

use crate::identity::{LocalIdentity, RemotePeerRecord};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Default window for an offer/answer exchange to complete
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Glare rule: between two peers, the greater id sends the offer
///
/// Ids are unique, so equality never occurs between two live peers.
pub fn is_designated_offerer(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

/// Links to open and close after one sweep
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProximityPlan {
    /// Peers to connect to, nearest first
    pub connect: Vec<String>,
    /// Linked peers now out of range
    pub disconnect: Vec<String>,
}

/// Radius, capacity and negotiation limits for the proximity sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityPolicy {
    pub connect_radius: f64,
    pub max_peers: usize,
    /// Links negotiating for longer than this are torn down by the sweep
    pub negotiation_timeout: Duration,
}

impl ProximityPolicy {
    pub fn new(connect_radius: f64, max_peers: usize) -> Self {
        Self {
            connect_radius,
            max_peers,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Decide which links to open and close
    ///
    /// Out-of-range links are closed. A new link is planned for a peer in
    /// range that advertises media, has no link and for which the local side
    /// is the designated offerer, nearest first, while the total stays within
    /// `max_peers`.
    pub fn plan(
        &self,
        local: &LocalIdentity,
        records: &HashMap<String, RemotePeerRecord>,
        linked: &HashSet<String>,
    ) -> ProximityPlan {
        let mut plan = ProximityPlan::default();
        let mut candidates = Vec::new();

        for (peer_id, record) in records {
            let distance = local.position.planar_distance(&record.state.position);
            let in_range = distance <= self.connect_radius;

            if linked.contains(peer_id) {
                if !in_range {
                    plan.disconnect.push(peer_id.clone());
                }
                continue;
            }

            if in_range
                && record.state.has_media
                && is_designated_offerer(&local.id, peer_id)
            {
                candidates.push((distance, peer_id.clone()));
            }
        }

        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let remaining = linked.len().saturating_sub(plan.disconnect.len());
        let capacity = self.max_peers.saturating_sub(remaining);
        plan.connect = candidates
            .into_iter()
            .take(capacity)
            .map(|(_, peer_id)| peer_id)
            .collect();
        plan.disconnect.sort();

        plan
    }
}
