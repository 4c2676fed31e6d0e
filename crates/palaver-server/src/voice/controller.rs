//! Controller passthrough pairings.
//!
//! While screen sharing, a host can hand out up to four virtual gamepad
//! slots. Each (channel, host, guest) pairing walks a tiny state machine:
//! requested by the guest, accepted into a slot or declined by the host,
//! stopped by either party, and collapsed when either leaves the channel.

use crate::error::{AppError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const MAX_SLOTS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pairing {
    Pending,
    Active(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PairingKey {
    channel_id: Uuid,
    host_id: Uuid,
    guest_id: Uuid,
}

/// A pairing torn down because a user left the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapsedPairing {
    pub host_id: Uuid,
    pub guest_id: Uuid,
    pub was_active: bool,
}

#[derive(Default)]
pub struct ControllerSessions {
    pairings: RwLock<HashMap<PairingKey, Pairing>>,
}

impl ControllerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guest asks for a slot. Repeats while pending or active are tolerated.
    pub async fn request(&self, channel_id: Uuid, host_id: Uuid, guest_id: Uuid) -> Result<()> {
        if host_id == guest_id {
            return Err(AppError::BadInput(
                "Cannot request controller access from yourself".to_string(),
            ));
        }
        let mut pairings = self.pairings.write().await;
        pairings
            .entry(PairingKey {
                channel_id,
                host_id,
                guest_id,
            })
            .or_insert(Pairing::Pending);
        Ok(())
    }

    /// Host grants a pending request a slot; the slot must be free among the
    /// host's active guests.
    pub async fn accept(
        &self,
        channel_id: Uuid,
        host_id: Uuid,
        guest_id: Uuid,
        slot: u8,
    ) -> Result<()> {
        if slot >= MAX_SLOTS {
            return Err(AppError::BadInput(format!(
                "Slot must be below {MAX_SLOTS}"
            )));
        }
        let mut pairings = self.pairings.write().await;
        let slot_taken = pairings.iter().any(|(key, pairing)| {
            key.channel_id == channel_id
                && key.host_id == host_id
                && *pairing == Pairing::Active(slot)
        });
        if slot_taken {
            return Err(AppError::Conflict(format!("Slot {slot} is already taken")));
        }

        let key = PairingKey {
            channel_id,
            host_id,
            guest_id,
        };
        match pairings.get_mut(&key) {
            Some(pairing @ Pairing::Pending) => {
                *pairing = Pairing::Active(slot);
                Ok(())
            }
            Some(Pairing::Active(_)) => Err(AppError::BadState(
                "Guest already holds a slot".to_string(),
            )),
            None => Err(AppError::BadState(
                "No pending controller request from that guest".to_string(),
            )),
        }
    }

    /// Host declines a pending request. Returns false if nothing was pending.
    pub async fn decline(&self, channel_id: Uuid, host_id: Uuid, guest_id: Uuid) -> bool {
        let key = PairingKey {
            channel_id,
            host_id,
            guest_id,
        };
        let mut pairings = self.pairings.write().await;
        if pairings.get(&key).copied() == Some(Pairing::Pending) {
            pairings.remove(&key);
            true
        } else {
            false
        }
    }

    /// Either party tears the pairing down. Returns the freed slot, if any.
    pub async fn stop(&self, channel_id: Uuid, host_id: Uuid, guest_id: Uuid) -> Option<u8> {
        let key = PairingKey {
            channel_id,
            host_id,
            guest_id,
        };
        match self.pairings.write().await.remove(&key) {
            Some(Pairing::Active(slot)) => Some(slot),
            _ => None,
        }
    }

    /// The guest's slot, iff the pairing is active.
    pub async fn authorized_slot(
        &self,
        channel_id: Uuid,
        host_id: Uuid,
        guest_id: Uuid,
    ) -> Option<u8> {
        match self.pairings.read().await.get(&PairingKey {
            channel_id,
            host_id,
            guest_id,
        }) {
            Some(Pairing::Active(slot)) => Some(*slot),
            _ => None,
        }
    }

    /// A user left the channel: collapse every pairing they were part of, as
    /// host or as guest, and report the counterparts to notify.
    pub async fn remove_user(&self, channel_id: Uuid, user_id: Uuid) -> Vec<CollapsedPairing> {
        let mut pairings = self.pairings.write().await;
        let affected: Vec<(PairingKey, Pairing)> = pairings
            .iter()
            .filter(|(key, _)| {
                key.channel_id == channel_id
                    && (key.host_id == user_id || key.guest_id == user_id)
            })
            .map(|(key, pairing)| (*key, *pairing))
            .collect();

        let mut collapsed = Vec::with_capacity(affected.len());
        for (key, pairing) in affected {
            pairings.remove(&key);
            collapsed.push(CollapsedPairing {
                host_id: key.host_id,
                guest_id: key.guest_id,
                was_active: matches!(pairing, Pairing::Active(_)),
            });
        }
        collapsed
    }
}
