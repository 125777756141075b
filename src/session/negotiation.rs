//! Negotiation controller state machine
//!
//! Serializes negotiation per session: at most one batch queued, at most one
//! round in flight, and a round requested mid-flight is deferred until the
//! signaling state returns to stable. The machine is pure; the session owns
//! scheduling and transport calls and feeds transitions in.

use crate::session::Role;

/// Where the controller currently is in the negotiation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationState {
    /// Nothing queued, nothing in flight
    Idle,
    /// A batch is queued for the next scheduler tick
    BatchPending,
    /// A negotiation round is in flight
    Negotiating,
}

/// What the session must do after reporting a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerOutcome {
    /// Schedule a batch for the next tick
    Schedule,
    /// A batch is already queued; the trigger was coalesced into it
    Coalesced,
    /// A round is in flight; the trigger is deferred until stable
    Deferred,
}

/// What the session must do when a queued batch fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    /// Perform a negotiation round for the session's role
    Negotiate,
    /// Responder's very first batch: consumed with no action
    SuppressedFirst,
    /// The batch was orphaned (state moved on underneath it)
    Skip,
}

#[derive(Debug)]
pub(crate) struct Negotiator {
    state: NegotiationState,

    /// A trigger arrived while a round was in flight
    pending_renegotiation: bool,

    /// Consumed by the first batch; the responder's initial state is driven
    /// by the incoming offer, not by self-initiated negotiation
    suppress_first_batch: bool,
}

impl Negotiator {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            state: NegotiationState::Idle,
            pending_renegotiation: false,
            suppress_first_batch: role == Role::Responder,
        }
    }

    /// A negotiation trigger fired (construction, `add_stream`, incoming
    /// `Renegotiate`)
    pub(crate) fn on_trigger(&mut self) -> TriggerOutcome {
        match self.state {
            NegotiationState::Idle => {
                self.state = NegotiationState::BatchPending;
                TriggerOutcome::Schedule
            }
            NegotiationState::BatchPending => TriggerOutcome::Coalesced,
            NegotiationState::Negotiating => {
                self.pending_renegotiation = true;
                TriggerOutcome::Deferred
            }
        }
    }

    /// The queued batch reached the front of the scheduler
    pub(crate) fn on_batch(&mut self) -> BatchOutcome {
        if self.state != NegotiationState::BatchPending {
            return BatchOutcome::Skip;
        }
        if self.suppress_first_batch {
            self.suppress_first_batch = false;
            self.state = NegotiationState::Idle;
            return BatchOutcome::SuppressedFirst;
        }
        self.state = NegotiationState::Negotiating;
        BatchOutcome::Negotiate
    }

    /// The round failed before a signaling transition could complete it
    pub(crate) fn on_round_failed(&mut self) {
        if self.state == NegotiationState::Negotiating {
            self.state = NegotiationState::Idle;
        }
    }

    /// The transport's signaling state returned to stable; returns true if a
    /// deferred renegotiation must be re-triggered
    pub(crate) fn on_stable(&mut self) -> bool {
        if self.state == NegotiationState::Negotiating {
            self.state = NegotiationState::Idle;
        }
        std::mem::take(&mut self.pending_renegotiation)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_schedules_once() {
        let mut n = Negotiator::new(Role::Initiator);
        assert_eq!(n.on_trigger(), TriggerOutcome::Schedule);
        assert_eq!(n.on_trigger(), TriggerOutcome::Coalesced);
        assert_eq!(n.on_trigger(), TriggerOutcome::Coalesced);
        assert_eq!(n.state(), NegotiationState::BatchPending);
    }

    #[test]
    fn test_initiator_batch_negotiates() {
        let mut n = Negotiator::new(Role::Initiator);
        n.on_trigger();
        assert_eq!(n.on_batch(), BatchOutcome::Negotiate);
        assert_eq!(n.state(), NegotiationState::Negotiating);
    }

    #[test]
    fn test_responder_first_batch_suppressed() {
        let mut n = Negotiator::new(Role::Responder);
        n.on_trigger();
        assert_eq!(n.on_batch(), BatchOutcome::SuppressedFirst);
        assert_eq!(n.state(), NegotiationState::Idle);

        // the suppression is consumed: the next batch negotiates
        n.on_trigger();
        assert_eq!(n.on_batch(), BatchOutcome::Negotiate);
    }

    #[test]
    fn test_trigger_while_negotiating_is_deferred() {
        let mut n = Negotiator::new(Role::Initiator);
        n.on_trigger();
        n.on_batch();
        assert_eq!(n.on_trigger(), TriggerOutcome::Deferred);
        assert_eq!(n.state(), NegotiationState::Negotiating);

        // stable consumes the deferred request exactly once
        assert!(n.on_stable());
        assert_eq!(n.state(), NegotiationState::Idle);
        assert!(!n.on_stable());
    }

    #[test]
    fn test_stable_without_pending_round() {
        let mut n = Negotiator::new(Role::Initiator);
        assert!(!n.on_stable());
        assert_eq!(n.state(), NegotiationState::Idle);
    }

    #[test]
    fn test_orphaned_batch_skips() {
        let mut n = Negotiator::new(Role::Initiator);
        assert_eq!(n.on_batch(), BatchOutcome::Skip);
    }

    #[test]
    fn test_round_failure_returns_to_idle() {
        let mut n = Negotiator::new(Role::Initiator);
        n.on_trigger();
        n.on_batch();
        n.on_round_failed();
        assert_eq!(n.state(), NegotiationState::Idle);
        assert_eq!(n.on_trigger(), TriggerOutcome::Schedule);
    }
}
