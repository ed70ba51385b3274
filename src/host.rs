//! Upstream framing toward the USB-CDC host transport.
//!
//! `AA 55 | type | len | payload | checksum`, where the checksum is the
//! additive inverse of every preceding byte (summing a whole frame modulo
//! 256 yields zero). The transport itself is a collaborator; this module
//! only renders receiver events into it.

use crate::{MacAddr, TrackerId};

pub const HOST_SYNC: [u8; 2] = [0xAA, 0x55];

pub const HOST_TYPE_STATUS: u8 = 0x01;
pub const HOST_TYPE_ROTATION: u8 = 0x02;
pub const HOST_TYPE_PAIRED: u8 = 0x03;
pub const HOST_TYPE_UNPAIRED: u8 = 0x04;

/// Header + largest payload (rotation: id + packed quat + accel) + checksum.
pub const HOST_MAX_FRAME: usize = 4 + 11 + 1;

/// Receiver-side events queued for the host.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Status {
        id: TrackerId,
        battery: u8,
        rssi: i8,
        flags: u8,
    },
    Rotation {
        id: TrackerId,
        /// Smallest-three word, see [`crate::quant::pack_smallest_three`].
        quat: u32,
        accel_fixed7: [i16; 3],
    },
    Paired {
        id: TrackerId,
        mac: MacAddr,
    },
    Unpaired {
        id: TrackerId,
    },
}

/// Render one event; returns the encoded length.
pub fn encode_event(buf: &mut [u8], event: &HostEvent) -> usize {
    buf[0] = HOST_SYNC[0];
    buf[1] = HOST_SYNC[1];
    let len = match *event {
        HostEvent::Status { id, battery, rssi, flags } => {
            buf[2] = HOST_TYPE_STATUS;
            buf[4] = id.raw();
            buf[5] = battery;
            buf[6] = rssi as u8;
            buf[7] = flags;
            4
        }
        HostEvent::Rotation { id, quat, accel_fixed7 } => {
            buf[2] = HOST_TYPE_ROTATION;
            buf[4] = id.raw();
            buf[5..9].copy_from_slice(&quat.to_le_bytes());
            for (i, v) in accel_fixed7.iter().enumerate() {
                buf[9 + i * 2..11 + i * 2].copy_from_slice(&v.to_le_bytes());
            }
            11
        }
        HostEvent::Paired { id, mac } => {
            buf[2] = HOST_TYPE_PAIRED;
            buf[4] = id.raw();
            buf[5..11].copy_from_slice(&mac.0);
            7
        }
        HostEvent::Unpaired { id } => {
            buf[2] = HOST_TYPE_UNPAIRED;
            buf[4] = id.raw();
            1
        }
    };
    buf[3] = len as u8;
    let total = 4 + len;
    buf[total] = checksum(&buf[..total]);
    total + 1
}

/// Additive-inverse checksum: `sum(frame) % 256 == 0` for a sealed frame.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}
