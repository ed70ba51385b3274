//! Channel plan and hop schedule.
//!
//! Both peers derive the superframe channel locally from the frame number and
//! the shared network key; the channel index itself is never negotiated on
//! air. The mix below is part of the wire-compatibility surface and must not
//! change shape: a receiver and tracker disagreeing on one bit here never
//! hear each other again.

use crate::NetworkKey;

/// 2.4 GHz channel whitelist, `2400 MHz + n`.
///
/// The sixteen entries sit in the gaps of the North-American Wi-Fi plan: the
/// slivers between channels 1/6 and 6/11, plus the band above channel 11.
pub const HOP_WHITELIST: [u8; 16] = [
    3, 4, 24, 25, 26, 48, 49, 50, 51, 74, 75, 76, 77, 78, 79, 80,
];

/// Superframe channel for `frame_number` under `key`.
///
/// Avalanche mix (xor-shift with two odd multiplications) over the key XOR
/// the zero-extended frame number, reduced into the whitelist. Each hop
/// depends on every key bit, so observing the sequence without the key gives
/// no purchase on the next channel.
pub fn hop_channel(frame_number: u16, key: NetworkKey) -> u8 {
    let mut h = key.0 ^ frame_number as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2_AE35);
    h ^= h >> 16;
    HOP_WHITELIST[(h % HOP_WHITELIST.len() as u32) as usize]
}
