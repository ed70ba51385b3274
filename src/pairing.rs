//! Pairing engines, one per role.
//!
//! Both peers camp on the dedicated pairing channel for the length of a
//! session; the tracker drives, the receiver reacts:
//!
//! ```norust
//! tracker                       receiver
//! PAIR_REQ{mac, ...}      -->   allocate / re-use slot
//!                         <--   PAIR_RESP{slot, receiver_mac, key}
//! PAIR_CONFIRM{slot, mac} -->   activate + persist
//! ```
//!
//! The two state machines share nothing but the codec — they are small
//! enough that a generalized engine would cost more clarity than it saves.
//! All timeouts are wall-clock deadlines checked from the owning MAC's tick;
//! `stop` is the only cancellation path and is idempotent.

use log::{debug, info};

use crate::store::Binding;
use crate::{MacAddr, NetworkKey, TrackerId};

/// What a PAIR_RESP offers; persisted by the tracker on completion.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairOffer {
    pub slot: TrackerId,
    pub receiver_mac: MacAddr,
    pub network_key: NetworkKey,
}

// ---------------------------------------------------------------------------
// Tracker side

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPairPhase {
    Idle,
    /// Held for exactly one poll today; kept as a named phase so request
    /// emission can later be gated on hearing the pairing channel first.
    WaitBeacon,
    SendRequest,
    WaitResponse,
    SendConfirm,
    Complete,
    TimedOut,
}

pub struct TrackerPairing {
    phase: TrackerPairPhase,
    deadline_ms: u32,
    next_request_ms: u32,
    offer: Option<PairOffer>,
}

/// What the tracker's poll wants transmitted this pass.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPairTx {
    Request,
    /// Confirm the offered slot; the offer is echoed for frame building.
    Confirm(PairOffer),
}

impl TrackerPairing {
    pub const fn new() -> Self {
        Self {
            phase: TrackerPairPhase::Idle,
            deadline_ms: 0,
            next_request_ms: 0,
            offer: None,
        }
    }

    pub fn phase(&self) -> TrackerPairPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        !matches!(
            self.phase,
            TrackerPairPhase::Idle | TrackerPairPhase::Complete | TrackerPairPhase::TimedOut
        )
    }

    pub fn start(&mut self, now_ms: u32, timeout_ms: u32) {
        self.phase = TrackerPairPhase::WaitBeacon;
        self.deadline_ms = now_ms.wrapping_add(timeout_ms);
        self.next_request_ms = now_ms;
        self.offer = None;
        debug!("pairing: session opened, deadline +{} ms", timeout_ms);
    }

    /// Idempotent; safe to call in any phase.
    pub fn stop(&mut self) {
        self.phase = TrackerPairPhase::Idle;
        self.offer = None;
    }

    /// Advance the machine; `jitter_ms` staggers request retries so two
    /// trackers started together do not collide every round.
    pub fn poll(&mut self, now_ms: u32, jitter_ms: u32, period_ms: u32) -> Option<TrackerPairTx> {
        if self.is_active() && now_ms.wrapping_sub(self.deadline_ms) < 0x8000_0000 {
            self.phase = TrackerPairPhase::TimedOut;
            debug!("pairing: session timed out");
            return None;
        }

        match self.phase {
            TrackerPairPhase::WaitBeacon => {
                self.phase = TrackerPairPhase::SendRequest;
                None
            }
            TrackerPairPhase::SendRequest | TrackerPairPhase::WaitResponse => {
                if now_ms.wrapping_sub(self.next_request_ms) < 0x8000_0000 {
                    self.next_request_ms = now_ms.wrapping_add(period_ms + jitter_ms);
                    self.phase = TrackerPairPhase::WaitResponse;
                    Some(TrackerPairTx::Request)
                } else {
                    None
                }
            }
            TrackerPairPhase::SendConfirm => {
                let offer = self.offer?;
                self.phase = TrackerPairPhase::Complete;
                info!("pairing: confirmed slot {}", offer.slot.raw());
                Some(TrackerPairTx::Confirm(offer))
            }
            _ => None,
        }
    }

    /// Feed a PAIR_RESP heard on the pairing channel.
    pub fn handle_response(&mut self, offer: PairOffer) {
        if !matches!(
            self.phase,
            TrackerPairPhase::SendRequest | TrackerPairPhase::WaitResponse
        ) {
            return;
        }
        if !offer.network_key.is_valid() {
            debug!("pairing: response carried reserved key, ignoring");
            return;
        }
        self.offer = Some(offer);
        self.phase = TrackerPairPhase::SendConfirm;
    }

    /// The accepted offer, once the machine reaches `Complete`.
    pub fn result(&self) -> Option<PairOffer> {
        if self.phase == TrackerPairPhase::Complete {
            self.offer
        } else {
            None
        }
    }
}

impl Default for TrackerPairing {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Receiver side

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverPairPhase {
    Idle,
    Listening,
    Responding,
    Complete,
    TimedOut,
}

/// The candidate a PAIR_RESP went out for; not yet active.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBind {
    pub mac: MacAddr,
    pub slot: TrackerId,
}

pub struct ReceiverPairing {
    phase: ReceiverPairPhase,
    deadline_ms: u32,
    pending: Option<PendingBind>,
}

impl ReceiverPairing {
    pub const fn new() -> Self {
        Self {
            phase: ReceiverPairPhase::Idle,
            deadline_ms: 0,
            pending: None,
        }
    }

    pub fn phase(&self) -> ReceiverPairPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            ReceiverPairPhase::Listening | ReceiverPairPhase::Responding
        )
    }

    pub fn start(&mut self, now_ms: u32, timeout_ms: u32) {
        self.phase = ReceiverPairPhase::Listening;
        self.deadline_ms = now_ms.wrapping_add(timeout_ms);
        self.pending = None;
    }

    /// Idempotent; safe to call in any phase.
    pub fn stop(&mut self) {
        self.phase = ReceiverPairPhase::Idle;
        self.pending = None;
    }

    /// Deadline check; returns true exactly once when the session expires.
    pub fn poll_expired(&mut self, now_ms: u32) -> bool {
        if self.is_active() && now_ms.wrapping_sub(self.deadline_ms) < 0x8000_0000 {
            self.phase = ReceiverPairPhase::TimedOut;
            return true;
        }
        false
    }

    /// Allocate (or re-use) a slot for a requesting MAC.
    ///
    /// An already-bound MAC gets its existing slot back; otherwise the
    /// lowest-indexed free slot wins. A full table returns `None` and the
    /// request dies silently — the tracker keeps retrying into its own
    /// timeout.
    pub fn handle_request(
        &mut self,
        mac: MacAddr,
        bindings: &[Option<Binding>],
        n_max: u8,
    ) -> Option<TrackerId> {
        if !self.is_active() {
            return None;
        }
        if let Some(pending) = self.pending {
            // mid-handshake: keep answering the same peer, ignore others
            if pending.mac == mac {
                return Some(pending.slot);
            }
            debug!("pairing: busy with another candidate, ignoring request");
            return None;
        }

        let slot = allocate_slot(mac, bindings, n_max)?;
        self.pending = Some(PendingBind { mac, slot });
        self.phase = ReceiverPairPhase::Responding;
        debug!("pairing: offering slot {}", slot.raw());
        Some(slot)
    }

    /// Feed a PAIR_CONFIRM; a match against the pending candidate completes
    /// the session and hands the bind back for activation + persistence.
    pub fn handle_confirm(&mut self, slot: TrackerId, mac: MacAddr) -> Option<PendingBind> {
        if self.phase != ReceiverPairPhase::Responding {
            return None;
        }
        let pending = self.pending?;
        if pending.slot != slot || pending.mac != mac {
            // stays in Responding until its deadline
            debug!("pairing: confirm did not match pending candidate");
            return None;
        }
        self.phase = ReceiverPairPhase::Complete;
        Some(pending)
    }
}

impl Default for ReceiverPairing {
    fn default() -> Self {
        Self::new()
    }
}

fn allocate_slot(mac: MacAddr, bindings: &[Option<Binding>], n_max: u8) -> Option<TrackerId> {
    let limit = (n_max as usize).min(bindings.len());
    for (i, b) in bindings.iter().enumerate().take(limit) {
        if let Some(b) = b {
            if b.mac == mac {
                return TrackerId::try_from(i as u8).ok();
            }
        }
    }
    for (i, b) in bindings.iter().enumerate().take(limit) {
        if b.is_none() {
            return TrackerId::try_from(i as u8).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0x10, 0x20, 0x30, 0x40, 0x50, last])
    }

    fn bound(last: u8) -> Option<Binding> {
        Some(Binding { mac: mac(last), paired_time_ms: 0 })
    }

    #[test]
    fn allocation_prefers_existing_then_lowest_free() {
        let table = [bound(1), None, bound(3), None];
        assert_eq!(allocate_slot(mac(3), &table, 4).map(|s| s.raw()), Some(2));
        assert_eq!(allocate_slot(mac(9), &table, 4).map(|s| s.raw()), Some(1));
        let full = [bound(1), bound(2)];
        assert_eq!(allocate_slot(mac(9), &full, 2), None);
    }

    #[test]
    fn confirm_must_match_pending() {
        let mut rx = ReceiverPairing::new();
        rx.start(0, 30_000);
        let table: [Option<Binding>; 4] = [None, None, None, None];
        let slot = rx.handle_request(mac(7), &table, 4).unwrap();
        assert!(rx.handle_confirm(slot, mac(8)).is_none());
        assert_eq!(rx.phase(), ReceiverPairPhase::Responding);
        let done = rx.handle_confirm(slot, mac(7)).unwrap();
        assert_eq!(done.mac, mac(7));
        assert_eq!(rx.phase(), ReceiverPairPhase::Complete);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut trk = TrackerPairing::new();
        trk.start(0, 5_000);
        trk.stop();
        trk.stop();
        assert_eq!(trk.phase(), TrackerPairPhase::Idle);
    }
}
