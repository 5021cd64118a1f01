//! Per-peer offer/answer state machine.
//!
//! Offering side:  `Idle -> OfferSent -> AwaitingAnswer -> Connected`
//! Answering side: `Idle -> OfferReceived -> AnswerSent -> Connected`
//!
//! `Connected` here means both descriptions are in place; ICE connectivity
//! is tracked separately by the engine.

use fullmesh_common::{Error, Result};
use serde::Serialize;

/// Which side of the offer/answer exchange this node plays for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// We initiated the handshake and send the offer.
    Offerer,
    /// The peer handshook with us; we wait for its offer.
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    /// Local offer created and set as local description
    OfferSent,
    /// Offer delivered to the peer's `/sdp`
    AwaitingAnswer,
    /// Remote offer set as remote description
    OfferReceived,
    /// Answer delivered back to the offerer
    AnswerSent,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    LocalOfferSet,
    OfferDelivered,
    RemoteAnswerSet,
    RemoteOfferSet,
    AnswerDelivered,
    LocalAnswerSet,
}

#[derive(Debug, Clone)]
pub struct Negotiation {
    role: Role,
    state: NegotiationState,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Whether the peer's description has been applied on our side.
    pub fn has_remote_description(&self) -> bool {
        match self.role {
            Role::Offerer => self.state == NegotiationState::Connected,
            Role::Answerer => self.state != NegotiationState::Idle,
        }
    }

    /// Apply an event, returning the new state or an error for a transition
    /// the role does not allow. The state is left untouched on error.
    pub fn apply(&mut self, event: NegotiationEvent) -> Result<NegotiationState> {
        use NegotiationEvent as E;
        use NegotiationState as S;

        let next = match (self.role, self.state, event) {
            (Role::Offerer, S::Idle, E::LocalOfferSet) => S::OfferSent,
            (Role::Offerer, S::OfferSent, E::OfferDelivered) => S::AwaitingAnswer,
            // The answer can race the HTTP response that confirms delivery.
            (Role::Offerer, S::OfferSent | S::AwaitingAnswer, E::RemoteAnswerSet) => S::Connected,
            (Role::Offerer, S::Connected, E::OfferDelivered) => S::Connected,
            (Role::Answerer, S::Idle, E::RemoteOfferSet) => S::OfferReceived,
            (Role::Answerer, S::OfferReceived, E::AnswerDelivered) => S::AnswerSent,
            (Role::Answerer, S::AnswerSent, E::LocalAnswerSet) => S::Connected,
            (role, state, event) => {
                return Err(Error::negotiation(format!(
                    "{event:?} not allowed for {role:?} in state {state:?}"
                )))
            }
        };

        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offerer_lifecycle() {
        let mut n = Negotiation::new(Role::Offerer);
        assert_eq!(n.state(), NegotiationState::Idle);
        assert!(!n.has_remote_description());

        assert_eq!(
            n.apply(NegotiationEvent::LocalOfferSet).unwrap(),
            NegotiationState::OfferSent
        );
        assert_eq!(
            n.apply(NegotiationEvent::OfferDelivered).unwrap(),
            NegotiationState::AwaitingAnswer
        );
        assert!(!n.has_remote_description());
        assert_eq!(
            n.apply(NegotiationEvent::RemoteAnswerSet).unwrap(),
            NegotiationState::Connected
        );
        assert!(n.has_remote_description());
    }

    #[test]
    fn test_answer_racing_delivery_ack() {
        let mut n = Negotiation::new(Role::Offerer);
        n.apply(NegotiationEvent::LocalOfferSet).unwrap();
        n.apply(NegotiationEvent::RemoteAnswerSet).unwrap();
        assert_eq!(
            n.apply(NegotiationEvent::OfferDelivered).unwrap(),
            NegotiationState::Connected
        );
    }

    #[test]
    fn test_answerer_lifecycle() {
        let mut n = Negotiation::new(Role::Answerer);
        n.apply(NegotiationEvent::RemoteOfferSet).unwrap();
        assert!(n.has_remote_description());
        n.apply(NegotiationEvent::AnswerDelivered).unwrap();
        assert_eq!(
            n.apply(NegotiationEvent::LocalAnswerSet).unwrap(),
            NegotiationState::Connected
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut n = Negotiation::new(Role::Answerer);
        assert!(n.apply(NegotiationEvent::LocalOfferSet).is_err());
        assert!(n.apply(NegotiationEvent::AnswerDelivered).is_err());
        assert_eq!(n.state(), NegotiationState::Idle);

        let mut n = Negotiation::new(Role::Offerer);
        assert!(n.apply(NegotiationEvent::RemoteAnswerSet).is_err());
        assert!(n.apply(NegotiationEvent::RemoteOfferSet).is_err());
    }

    #[test]
    fn test_second_offer_rejected_after_connect() {
        let mut n = Negotiation::new(Role::Answerer);
        n.apply(NegotiationEvent::RemoteOfferSet).unwrap();
        n.apply(NegotiationEvent::AnswerDelivered).unwrap();
        n.apply(NegotiationEvent::LocalAnswerSet).unwrap();
        assert!(n.apply(NegotiationEvent::RemoteOfferSet).is_err());
        assert_eq!(n.state(), NegotiationState::Connected);
    }
}
