//! Device registry: the ordered, possibly sparse table of device slots.
//!
//! Slots are addressed by [`DeviceId`] and never compacted. A device that
//! leaves turns its slot absent while every other id keeps its position, so
//! messages already in flight still reach the right device.

use tracing::debug;

use crate::error::{Result, SessionError};
use crate::types::DeviceId;
use crate::types::DeviceState;

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    /// Never occupied as far as this client knows.
    Empty,
    Occupied(DeviceState),
    /// Previously occupied. Remembers the departed uid so re-occupation can
    /// be checked for a fresh identity.
    Left { last_uid: String },
}

/// Outcome of [`DeviceRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChange {
    Joined,
    Updated,
    /// The incoming state matched what was already stored.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    slots: Vec<Slot>,
    self_id: Option<DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this client's own slot. Can only be set once.
    pub fn assign_self(&mut self, id: DeviceId) -> Result<()> {
        match self.self_id {
            Some(existing) if existing != id => Err(SessionError::Protocol(format!(
                "device id already assigned as {existing}, host tried {id}"
            ))),
            _ => {
                self.self_id = Some(id);
                Ok(())
            }
        }
    }

    pub fn self_id(&self) -> Option<DeviceId> {
        self.self_id
    }

    /// Install or replace the state of a slot, growing the table as needed.
    ///
    /// Rejects a uid change on an occupied slot and a re-occupation that
    /// reuses the previous occupant's uid. A rejected upsert leaves the
    /// registry untouched.
    pub fn upsert(&mut self, id: DeviceId, state: DeviceState) -> Result<SlotChange> {
        let change = match self.slots.get(id.index()) {
            Some(Slot::Occupied(current)) if current.uid != state.uid => {
                return Err(SessionError::Protocol(format!(
                    "{id} changed uid from {} to {} while connected",
                    current.uid, state.uid
                )));
            }
            Some(Slot::Occupied(current)) if *current == state => SlotChange::Unchanged,
            Some(Slot::Occupied(_)) => SlotChange::Updated,
            Some(Slot::Left { last_uid }) if *last_uid == state.uid => {
                return Err(SessionError::Protocol(format!(
                    "{id} re-occupied with the departed uid {last_uid}"
                )));
            }
            _ => SlotChange::Joined,
        };

        if self.slots.len() <= id.index() {
            self.slots.resize(id.index() + 1, Slot::Empty);
        }
        debug!(device = %id, ?change, "registry upsert");
        self.slots[id.index()] = Slot::Occupied(state);
        Ok(change)
    }

    /// Mark a slot absent, keeping its position. Returns the departed state,
    /// or `None` if the slot was not occupied.
    pub fn remove(&mut self, id: DeviceId) -> Option<DeviceState> {
        let slot = self.slots.get_mut(id.index())?;
        match std::mem::replace(slot, Slot::Empty) {
            Slot::Occupied(state) => {
                *slot = Slot::Left {
                    last_uid: state.uid.clone(),
                };
                debug!(device = %id, "registry remove");
                Some(state)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    /// State of `id`, or of this device when `id` is `None`. Ids past the end
    /// of the table are simply absent.
    pub fn get(&self, id: Option<DeviceId>) -> Option<&DeviceState> {
        let id = id.or(self.self_id)?;
        match self.slots.get(id.index()) {
            Some(Slot::Occupied(state)) => Some(state),
            _ => None,
        }
    }

    pub fn is_occupied(&self, id: DeviceId) -> bool {
        self.get(Some(id)).is_some()
    }

    /// Replace only the `custom` field of this device's own slot.
    pub fn set_custom_state(&mut self, custom: serde_json::Value) -> Result<()> {
        let id = self
            .self_id
            .ok_or(SessionError::NotReady("set_custom_state before join"))?;
        match self.slots.get_mut(id.index()) {
            Some(Slot::Occupied(state)) => {
                state.custom = Some(custom);
                Ok(())
            }
            _ => Err(SessionError::NotReady("own device slot not populated")),
        }
    }

    pub fn get_custom_state(&self, id: Option<DeviceId>) -> Option<&serde_json::Value> {
        self.get(id)?.custom.as_ref()
    }

    pub fn get_nickname(&self, id: Option<DeviceId>) -> Option<&str> {
        self.get(id)?.nickname.as_deref()
    }

    /// Number of slot positions, absent ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Positional view of all slots; `None` marks an absent slot.
    pub fn devices(&self) -> Vec<Option<&DeviceState>> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Occupied(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Occupied slots in id order.
    pub fn occupied(&self) -> impl Iterator<Item = (DeviceId, &DeviceState)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(state) => Some((DeviceId(index as u32), state)),
                _ => None,
            })
    }

    /// Controller ids currently occupied (never includes the screen).
    pub fn controller_ids(&self) -> Vec<DeviceId> {
        self.occupied()
            .map(|(id, _)| id)
            .filter(|id| !id.is_screen())
            .collect()
    }
}
