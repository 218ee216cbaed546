//! Message routing between device slots.
//!
//! The router never looks inside payloads. It resolves targets against the
//! registry, stamps outbound messages with a per-sender sequence number, and
//! drops inbound messages that would break per-sender ordering.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{Result, SessionError};
use crate::registry::DeviceRegistry;
use crate::types::DeviceId;

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Unicast(DeviceId),
    /// Every occupied slot except the sender, as currently known locally.
    /// The host expands the broadcast against its own view when relaying.
    Broadcast { recipients: Vec<DeviceId> },
}

impl Route {
    /// Wire target: `None` means broadcast.
    pub fn target(&self) -> Option<DeviceId> {
        match self {
            Route::Unicast(id) => Some(*id),
            Route::Broadcast { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    next_seq: u64,
    /// Highest sequence number delivered per sender.
    last_delivered: HashMap<DeviceId, u64>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `to` against the registry. An explicit target must be occupied;
    /// a broadcast never fails because of absent slots.
    pub fn resolve(&self, registry: &DeviceRegistry, to: Option<DeviceId>) -> Result<Route> {
        let sender = registry
            .self_id()
            .ok_or(SessionError::NotReady("send before join"))?;

        match to {
            Some(target) if registry.is_occupied(target) => Ok(Route::Unicast(target)),
            Some(target) => Err(SessionError::InvalidTarget(target)),
            None => Ok(Route::Broadcast {
                recipients: registry
                    .occupied()
                    .map(|(id, _)| id)
                    .filter(|id| *id != sender)
                    .collect(),
            }),
        }
    }

    /// Next outbound sequence number. Starts at 1.
    pub fn stamp(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Check an inbound message against per-sender ordering. Returns `false`
    /// for a duplicate or regressed sequence number, which must not be
    /// delivered.
    pub fn accept_inbound(&mut self, from: DeviceId, seq: u64) -> bool {
        let last = self.last_delivered.entry(from).or_insert(0);
        if seq <= *last {
            warn!(from = %from, seq, last = *last, "dropping out-of-order message");
            return false;
        }
        *last = seq;
        true
    }

    /// Reset ordering state for a slot whose device left. A later occupant
    /// starts its own sequence.
    pub fn forget_sender(&mut self, from: DeviceId) {
        self.last_delivered.remove(&from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceState;

    fn registry_with(self_id: u32, occupied: &[u32]) -> DeviceRegistry {
        let mut reg = DeviceRegistry::new();
        for id in occupied {
            reg.upsert(DeviceId(*id), DeviceState::new(format!("u{id}")))
                .unwrap();
        }
        reg.assign_self(DeviceId(self_id)).unwrap();
        reg
    }

    #[test]
    fn unicast_to_occupied_slot() {
        let reg = registry_with(0, &[0, 1, 2]);
        let route = MessageRouter::new().resolve(&reg, Some(DeviceId(2))).unwrap();
        assert_eq!(route, Route::Unicast(DeviceId(2)));
        assert_eq!(route.target(), Some(DeviceId(2)));
    }

    #[test]
    fn unicast_to_absent_slot_fails() {
        let mut reg = registry_with(0, &[0, 1, 2]);
        reg.remove(DeviceId(1));
        let router = MessageRouter::new();
        assert!(matches!(
            router.resolve(&reg, Some(DeviceId(1))),
            Err(SessionError::InvalidTarget(DeviceId(1)))
        ));
        assert!(matches!(
            router.resolve(&reg, Some(DeviceId(40))),
            Err(SessionError::InvalidTarget(DeviceId(40)))
        ));
    }

    #[test]
    fn broadcast_skips_sender_and_gaps() {
        let mut reg = registry_with(2, &[0, 1, 2, 3]);
        reg.remove(DeviceId(1));
        let route = MessageRouter::new().resolve(&reg, None).unwrap();
        assert_eq!(
            route,
            Route::Broadcast {
                recipients: vec![DeviceId(0), DeviceId(3)]
            }
        );
        assert_eq!(route.target(), None);
    }

    #[test]
    fn resolve_before_join_is_not_ready() {
        let reg = DeviceRegistry::new();
        assert!(matches!(
            MessageRouter::new().resolve(&reg, None),
            Err(SessionError::NotReady(_))
        ));
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut router = MessageRouter::new();
        assert_eq!(router.stamp(), 1);
        assert_eq!(router.stamp(), 2);
    }

    #[test]
    fn inbound_ordering_is_per_sender() {
        let mut router = MessageRouter::new();
        assert!(router.accept_inbound(DeviceId(1), 1));
        assert!(router.accept_inbound(DeviceId(2), 1));
        assert!(router.accept_inbound(DeviceId(1), 3));
        assert!(!router.accept_inbound(DeviceId(1), 2));
        assert!(!router.accept_inbound(DeviceId(1), 3));

        router.forget_sender(DeviceId(1));
        assert!(router.accept_inbound(DeviceId(1), 1));
    }
}
