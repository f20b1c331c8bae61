//! Room membership and call control
//!
//! The roster is whatever the server last said it was: every `room:update`
//! (or `joined`) replaces it wholesale, never merged. Call-control messages
//! are relayed as [`CallEvent`]s without any state of their own.

use std::sync::Arc;

use parking_lot::RwLock;
use tandem_core::models::{PeerDescriptor, PeerId, RoomId};
use tandem_core::protocol::{Inbound, Outbound, OutboundEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{CallEvent, SessionEvent};
use crate::signaling::SignalingChannel;

pub struct MembershipTracker {
    room_id: RoomId,
    local_id: PeerId,
    signaling: Arc<dyn SignalingChannel>,
    roster: RwLock<Vec<PeerId>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl MembershipTracker {
    pub fn new(
        room_id: RoomId,
        local_id: PeerId,
        signaling: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            room_id,
            local_id,
            signaling,
            roster: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Participants in server order, ourselves included
    #[must_use]
    pub fn roster(&self) -> Vec<PeerId> {
        self.roster.read().clone()
    }

    /// Participants other than ourselves
    #[must_use]
    pub fn remote_participants(&self) -> Vec<PeerId> {
        self.roster
            .read()
            .iter()
            .filter(|id| **id != self.local_id)
            .cloned()
            .collect()
    }

    /// Replace the roster with the server's current list, returning the
    /// remote participants that were not in the previous one
    pub fn apply_roster(&self, clients: Vec<PeerId>) -> Vec<PeerId> {
        let previous = std::mem::replace(&mut *self.roster.write(), clients.clone());
        let joined: Vec<PeerId> = clients
            .iter()
            .filter(|id| **id != self.local_id && !previous.contains(*id))
            .cloned()
            .collect();

        info!(
            room_id = %self.room_id,
            participants = clients.len(),
            joined = joined.len(),
            "Roster updated"
        );
        let _ = self.events.send(SessionEvent::RosterChanged(clients));
        joined
    }

    /// Turn a call-control message into a [`CallEvent`] and publish it.
    ///
    /// Returns `None` for messages that are not call control.
    pub fn handle_call_message(&self, payload: &Inbound) -> Option<CallEvent> {
        let event = match payload {
            Inbound::IncomingCall {
                caller,
                caller_socket_id,
            } => CallEvent::Incoming {
                caller: PeerDescriptor::new(caller_socket_id.clone(), caller.clone()),
            },
            Inbound::CallAccepted { accepter } => CallEvent::Accepted {
                by: accepter.clone(),
            },
            Inbound::CallRejected { rejecter } => CallEvent::Rejected {
                by: rejecter.clone(),
            },
            Inbound::CallEnded { ender } => CallEvent::Ended { by: ender.clone() },
            Inbound::UserDisconnected {
                disconnected_socket,
            } => CallEvent::UserLeft {
                peer: disconnected_socket.clone(),
            },
            _ => return None,
        };
        debug!(kind = payload.kind(), "Call event");
        let _ = self.events.send(SessionEvent::Call(event.clone()));
        Some(event)
    }

    pub fn call_user(&self, target: &PeerId) -> Result<()> {
        self.send_call(Outbound::CallUser {
            target_socket_id: self.check_target(target)?,
        })
    }

    pub fn accept_call(&self, caller: &PeerId) -> Result<()> {
        self.send_call(Outbound::CallAccepted {
            target_socket_id: self.check_target(caller)?,
        })
    }

    pub fn reject_call(&self, caller: &PeerId) -> Result<()> {
        self.send_call(Outbound::CallRejected {
            target_socket_id: self.check_target(caller)?,
        })
    }

    pub fn end_call(&self, peer: &PeerId) -> Result<()> {
        self.send_call(Outbound::EndCall {
            target_socket_id: self.check_target(peer)?,
        })
    }

    fn check_target(&self, target: &PeerId) -> Result<PeerId> {
        if target.is_empty() {
            return Err(Error::InvalidInput("call target must not be empty".to_string()));
        }
        if *target == self.local_id {
            return Err(Error::InvalidInput("cannot call ourselves".to_string()));
        }
        Ok(target.clone())
    }

    fn send_call(&self, payload: Outbound) -> Result<()> {
        let kind = payload.kind();
        self.signaling.send(OutboundEnvelope::new(
            self.room_id.clone(),
            self.local_id.clone(),
            payload,
        ))?;
        info!(kind, "Call control sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MockSignalingChannel;
    use tandem_core::models::UserId;

    fn tracker(
        signaling: MockSignalingChannel,
    ) -> (MembershipTracker, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = MembershipTracker::new(
            RoomId::from("lobby"),
            PeerId::from("alice"),
            Arc::new(signaling),
            tx,
        );
        (tracker, rx)
    }

    #[test]
    fn test_roster_is_replaced_not_merged() {
        let (tracker, mut rx) = tracker(MockSignalingChannel::new());

        assert_eq!(
            tracker.apply_roster(vec!["alice".into(), "bob".into()]),
            vec![PeerId::from("bob")]
        );
        assert_eq!(
            tracker.apply_roster(vec!["alice".into(), "carol".into()]),
            vec![PeerId::from("carol")]
        );

        assert_eq!(tracker.roster(), vec![PeerId::from("alice"), PeerId::from("carol")]);
        assert_eq!(tracker.remote_participants(), vec![PeerId::from("carol")]);

        let mut changes = 0;
        while let Ok(SessionEvent::RosterChanged(_)) = rx.try_recv() {
            changes += 1;
        }
        assert_eq!(changes, 2);
    }

    #[test]
    fn test_incoming_call_event() {
        let (tracker, mut rx) = tracker(MockSignalingChannel::new());

        let event = tracker.handle_call_message(&Inbound::IncomingCall {
            caller: UserId::from("Bob"),
            caller_socket_id: PeerId::from("sock-9"),
        });

        let expected = CallEvent::Incoming {
            caller: PeerDescriptor::new("sock-9", "Bob"),
        };
        assert_eq!(event, Some(expected.clone()));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Call(expected));
        assert!(tracker
            .handle_call_message(&Inbound::RoomUpdate { clients: vec![] })
            .is_none());
    }

    #[test]
    fn test_call_user_sends_target() {
        let mut signaling = MockSignalingChannel::new();
        signaling
            .expect_send()
            .withf(|envelope| {
                envelope.payload
                    == Outbound::CallUser {
                        target_socket_id: PeerId::from("bob"),
                    }
                    && envelope.sender.as_str() == "alice"
            })
            .times(1)
            .returning(|_| Ok(()));
        let (tracker, _rx) = tracker(signaling);

        tracker.call_user(&PeerId::from("bob")).unwrap();
        assert!(matches!(
            tracker.end_call(&PeerId::from("alice")),
            Err(Error::InvalidInput(_))
        ));
    }
}
