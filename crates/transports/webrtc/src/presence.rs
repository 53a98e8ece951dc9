//! Dead-band change detection for local avatar broadcasts

use crate::config::PresenceOptions;
use crate::identity::LocalIdentity;

/// Decides when the local avatar state is worth publishing
///
/// Position, velocity and rotation are compared per component against their
/// own epsilon. Name, color, media flags and billboard placement compare
/// exactly. The first poll always reports a change.
#[derive(Debug, Clone)]
pub struct PresenceBroadcaster {
    options: PresenceOptions,
    last_sent: Option<LocalIdentity>,
}

impl PresenceBroadcaster {
    pub fn new(options: PresenceOptions) -> Self {
        Self {
            options,
            last_sent: None,
        }
    }

    /// Whether `current` differs from the last broadcast beyond the dead-band
    pub fn has_changed(&self, current: &LocalIdentity) -> bool {
        let Some(last) = &self.last_sent else {
            return true;
        };

        current.position.max_abs_delta(&last.position) > self.options.position_epsilon
            || current.velocity.max_abs_delta(&last.velocity) > self.options.velocity_epsilon
            || current.rotation.max_abs_delta(&last.rotation) > self.options.rotation_epsilon
            || current.has_media != last.has_media
            || current.screen_sharing != last.screen_sharing
            || current.billboard != last.billboard
            || current.name != last.name
            || current.color != last.color
    }

    /// Return the state to send if it changed, taking it as the new baseline
    pub fn poll(&mut self, current: &LocalIdentity) -> Option<LocalIdentity> {
        if !self.has_changed(current) {
            return None;
        }
        self.mark_sent(current);
        Some(current.clone())
    }

    /// Record `state` as broadcast
    pub fn mark_sent(&mut self, state: &LocalIdentity) {
        self.last_sent = Some(state.clone());
    }

    pub fn last_sent(&self) -> Option<&LocalIdentity> {
        self.last_sent.as_ref()
    }
}
