//! Stage state for a room's conference mode: who hosts, who may speak and
//! who is waiting with a raised hand.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::PeerId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceState {
    pub is_active: bool,
    pub host_id: Option<PeerId>,
    pub speakers: BTreeSet<PeerId>,
    /// Participant to the unix time (seconds) the hand went up
    pub raised_hands: BTreeMap<PeerId, i64>,
}

impl ConferenceState {
    /// Start with `host` on stage; a running conference keeps its host
    pub fn start(&mut self, host: &PeerId) -> bool {
        if self.is_active {
            return false;
        }
        self.is_active = true;
        self.host_id = Some(host.clone());
        self.speakers.insert(host.clone());
        true
    }

    /// Only the host may stop; stopping clears the stage
    pub fn stop(&mut self, by: &PeerId) -> bool {
        if !self.is_host(by) {
            return false;
        }
        *self = Self::default();
        true
    }

    pub fn raise_hand(&mut self, participant: &PeerId, timestamp: i64) {
        self.raised_hands.insert(participant.clone(), timestamp);
    }

    pub fn lower_hand(&mut self, participant: &PeerId) -> bool {
        self.raised_hands.remove(participant).is_some()
    }

    pub fn promote(&mut self, host: &PeerId, participant: &PeerId) -> bool {
        if !self.is_host(host) {
            return false;
        }
        self.speakers.insert(participant.clone());
        self.raised_hands.remove(participant);
        true
    }

    /// The host stays on stage
    pub fn demote(&mut self, host: &PeerId, participant: &PeerId) -> bool {
        if !self.is_host(host) || self.is_host(participant) {
            return false;
        }
        self.speakers.remove(participant);
        true
    }

    /// Drop a departing participant's hand and speaker slot.
    /// A departing host ends the conference; returns whether it did.
    pub fn remove_participant(&mut self, participant: &PeerId) -> bool {
        if self.is_host(participant) {
            *self = Self::default();
            return true;
        }
        self.raised_hands.remove(participant);
        self.speakers.remove(participant);
        false
    }

    #[must_use]
    pub fn is_host(&self, participant: &PeerId) -> bool {
        self.is_active && self.host_id.as_ref() == Some(participant)
    }

    #[must_use]
    pub fn is_speaker(&self, participant: &PeerId) -> bool {
        self.speakers.contains(participant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    #[test]
    fn test_host_flow() {
        let mut state = ConferenceState::default();
        assert!(state.start(&id("1")));
        assert!(!state.start(&id("2")));
        assert_eq!(state.host_id, Some(id("1")));

        state.raise_hand(&id("2"), 100);
        assert!(!state.promote(&id("3"), &id("2")));
        assert!(state.promote(&id("1"), &id("2")));
        assert!(state.is_speaker(&id("2")));
        assert!(state.raised_hands.is_empty());

        assert!(state.demote(&id("1"), &id("2")));
        assert!(!state.is_speaker(&id("2")));
        assert!(!state.demote(&id("1"), &id("1")));

        assert!(!state.stop(&id("2")));
        assert!(state.stop(&id("1")));
        assert_eq!(state, ConferenceState::default());
    }

    #[test]
    fn test_promote_without_conference_fails() {
        let mut state = ConferenceState::default();
        assert!(!state.promote(&id("1"), &id("2")));
        assert!(!state.stop(&id("1")));
    }

    #[test]
    fn test_remove_participant_clears_hand_and_stage() {
        let mut state = ConferenceState::default();
        state.start(&id("1"));
        state.promote(&id("1"), &id("2"));
        state.raise_hand(&id("3"), 5);

        assert!(!state.remove_participant(&id("2")));
        assert!(!state.remove_participant(&id("3")));

        assert_eq!(state.speakers, BTreeSet::from([id("1")]));
        assert!(state.raised_hands.is_empty());
        assert!(state.is_host(&id("1")));
    }

    #[test]
    fn test_host_departure_ends_conference() {
        let mut state = ConferenceState::default();
        state.start(&id("1"));
        state.promote(&id("1"), &id("2"));
        state.raise_hand(&id("3"), 5);

        assert!(state.remove_participant(&id("1")));
        assert_eq!(state, ConferenceState::default());

        // Nothing to end once it is over
        assert!(!state.remove_participant(&id("1")));
    }

    #[test]
    fn test_wire_shape() {
        let mut state = ConferenceState::default();
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"is_active": false, "host_id": null, "speakers": [], "raised_hands": {}})
        );

        state.start(&id("7"));
        state.raise_hand(&id("9"), 1_700_000_000);
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({
                "is_active": true,
                "host_id": "7",
                "speakers": ["7"],
                "raised_hands": {"9": 1_700_000_000}
            })
        );
    }
}
