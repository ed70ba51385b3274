//! RF wire codec: framing, CRC, and per-type field access.
//!
//! Every frame is `header | payload | crc16` with the CRC computed over all
//! preceding bytes and appended little-endian — except the ACK, which is four
//! bytes flat so it always fits the slot tail.
//!
//! Layouts (lengths in bytes, integers little-endian):
//!
//! ```norust
//! SYNC_BEACON (11): 0x53 | key[4] | frame_number[2] | channel | count | crc16
//! PAIR_REQ    (13): 0x80 | version | mac[6] | imu_kind | fw_major | fw_minor | crc16
//! PAIR_RESP   (14): 0x81 | slot | receiver_mac[6] | network_key[4] | crc16
//! PAIR_CONFIRM(11): 0x82 | slot | mac[6] | status | crc16
//! DATA        (20): 0b01<id:6> | seq | quat w,x,y,z[2 ea] | accel x,y,z[2 ea]
//!                   | battery | flags | crc16
//! ACK          (4): 0x41 | tracker_id | seq | cmd
//! ```
//!
//! The DATA header byte carries the slot in its low six bits; the `0b01` tag
//! in the top two marks the frame as DATA. Decoding is split by direction —
//! a receiver only ever parses uplink bytes and a tracker only downlink — so
//! the tag never collides with the ACK or beacon type bytes.

use crc::{Crc, CRC_16_IBM_3740};
use modular_bitfield::prelude::*;

use crate::{MacAddr, NetworkKey, TrackerId};

/// Link CRC: poly 0x1021, init 0xFFFF, byte-at-a-time over a 256-entry table.
pub const LINK_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub const TYPE_SYNC_BEACON: u8 = 0x53;
pub const TYPE_DATA: u8 = 0x54;
pub const TYPE_ACK: u8 = 0x41;
pub const TYPE_PAIR_REQ: u8 = 0x80;
pub const TYPE_PAIR_RESP: u8 = 0x81;
pub const TYPE_PAIR_CONFIRM: u8 = 0x82;

/// Top two bits of a DATA header; the rest is the slot.
pub const DATA_TAG_MASK: u8 = 0xC0;
pub const DATA_TAG: u8 = TYPE_DATA & DATA_TAG_MASK;
pub const DATA_ID_MASK: u8 = 0x3F;
/// [`DataHeader::tag`] value marking a DATA frame.
pub const DATA_TAG_BITS: u8 = TYPE_DATA >> 6;

/// DATA header byte: a 2-bit frame tag over the 6-bit slot.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct DataHeader {
    pub id: B6,
    pub tag: B2,
}

pub const SYNC_BEACON_LEN: usize = 11;
pub const PAIR_REQ_LEN: usize = 13;
pub const PAIR_RESP_LEN: usize = 14;
pub const PAIR_CONFIRM_LEN: usize = 11;
pub const DATA_LEN: usize = 20;
pub const ACK_LEN: usize = 4;

/// Largest frame on the air; RX/TX buffers are sized off this.
pub const MAX_FRAME_LEN: usize = DATA_LEN;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Checksum mismatch. Never reinterpreted as any other error.
    BadCrc,
    TruncatedFrame { have: usize, need: usize },
    UnknownType { type_byte: u8 },
    OutOfRangeField,
}

/// Frames a receiver accepts on the air.
#[derive(Debug, Clone, Copy)]
pub enum Uplink<'a> {
    PairReq(PairReq<'a>),
    PairConfirm(PairConfirm<'a>),
    Data(Data<'a>),
}

impl<'a> Uplink<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, FrameError> {
        let first = *bytes.first().ok_or(FrameError::TruncatedFrame { have: 0, need: 1 })?;
        match first {
            TYPE_PAIR_REQ => Ok(Uplink::PairReq(PairReq::from_bytes(bytes)?)),
            TYPE_PAIR_CONFIRM => Ok(Uplink::PairConfirm(PairConfirm::from_bytes(bytes)?)),
            b if DataHeader::from_bytes([b]).tag() == DATA_TAG_BITS => {
                Ok(Uplink::Data(Data::from_bytes(bytes)?))
            }
            b => Err(FrameError::UnknownType { type_byte: b }),
        }
    }
}

/// Frames a tracker accepts on the air.
#[derive(Debug, Clone, Copy)]
pub enum Downlink<'a> {
    SyncBeacon(SyncBeacon<'a>),
    PairResp(PairResp<'a>),
    Ack(Ack<'a>),
}

impl<'a> Downlink<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, FrameError> {
        let first = *bytes.first().ok_or(FrameError::TruncatedFrame { have: 0, need: 1 })?;
        match first {
            TYPE_SYNC_BEACON => Ok(Downlink::SyncBeacon(SyncBeacon::from_bytes(bytes)?)),
            TYPE_PAIR_RESP => Ok(Downlink::PairResp(PairResp::from_bytes(bytes)?)),
            TYPE_ACK => Ok(Downlink::Ack(Ack::from_bytes(bytes)?)),
            b => Err(FrameError::UnknownType { type_byte: b }),
        }
    }
}

fn check_len(bytes: &[u8], need: usize) -> Result<(), FrameError> {
    if bytes.len() != need {
        return Err(FrameError::TruncatedFrame { have: bytes.len(), need });
    }
    Ok(())
}

fn check_crc(bytes: &[u8]) -> Result<(), FrameError> {
    let body = bytes.len() - 2;
    let want = u16::from_le_bytes(bytes[body..].try_into().unwrap());
    if LINK_CRC.checksum(&bytes[..body]) != want {
        return Err(FrameError::BadCrc);
    }
    Ok(())
}

/// Write the CRC over `buf[..len]` into `buf[len..len + 2]`.
fn seal(buf: &mut [u8], len: usize) -> usize {
    let crc = LINK_CRC.checksum(&buf[..len]);
    buf[len..len + 2].copy_from_slice(&crc.to_le_bytes());
    len + 2
}

// ---------------------------------------------------------------------------
// Sync beacon

#[derive(Debug, Clone, Copy)]
pub struct SyncBeacon<'a> {
    bytes: &'a [u8],
}

impl<'a> SyncBeacon<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameError> {
        check_len(bytes, SYNC_BEACON_LEN)?;
        check_crc(bytes)?;
        Ok(Self { bytes })
    }

    pub fn key(&self) -> NetworkKey {
        NetworkKey(u32::from_le_bytes(self.bytes[1..5].try_into().unwrap()))
    }

    pub fn frame_number(&self) -> u16 {
        u16::from_le_bytes(self.bytes[5..7].try_into().unwrap())
    }

    pub fn channel(&self) -> u8 {
        self.bytes[7]
    }

    pub fn tracker_count(&self) -> u8 {
        self.bytes[8]
    }
}

pub fn encode_sync_beacon(
    buf: &mut [u8],
    key: NetworkKey,
    frame_number: u16,
    channel: u8,
    tracker_count: u8,
) -> usize {
    buf[0] = TYPE_SYNC_BEACON;
    buf[1..5].copy_from_slice(&key.0.to_le_bytes());
    buf[5..7].copy_from_slice(&frame_number.to_le_bytes());
    buf[7] = channel;
    buf[8] = tracker_count;
    seal(buf, SYNC_BEACON_LEN - 2)
}

// ---------------------------------------------------------------------------
// Pairing frames

#[derive(Debug, Clone, Copy)]
pub struct PairReq<'a> {
    bytes: &'a [u8],
}

impl<'a> PairReq<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameError> {
        check_len(bytes, PAIR_REQ_LEN)?;
        check_crc(bytes)?;
        Ok(Self { bytes })
    }

    pub fn version(&self) -> u8 {
        self.bytes[1]
    }

    pub fn mac(&self) -> MacAddr {
        MacAddr(self.bytes[2..8].try_into().unwrap())
    }

    pub fn imu_kind(&self) -> u8 {
        self.bytes[8]
    }

    pub fn fw_version(&self) -> (u8, u8) {
        (self.bytes[9], self.bytes[10])
    }
}

pub fn encode_pair_req(
    buf: &mut [u8],
    version: u8,
    mac: MacAddr,
    imu_kind: u8,
    fw_version: (u8, u8),
) -> usize {
    buf[0] = TYPE_PAIR_REQ;
    buf[1] = version;
    buf[2..8].copy_from_slice(&mac.0);
    buf[8] = imu_kind;
    buf[9] = fw_version.0;
    buf[10] = fw_version.1;
    seal(buf, PAIR_REQ_LEN - 2)
}

#[derive(Debug, Clone, Copy)]
pub struct PairResp<'a> {
    bytes: &'a [u8],
}

impl<'a> PairResp<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameError> {
        check_len(bytes, PAIR_RESP_LEN)?;
        check_crc(bytes)?;
        TrackerId::try_from(bytes[1]).map_err(|_| FrameError::OutOfRangeField)?;
        Ok(Self { bytes })
    }

    pub fn slot(&self) -> TrackerId {
        TrackerId::try_from(self.bytes[1]).unwrap()
    }

    pub fn receiver_mac(&self) -> MacAddr {
        MacAddr(self.bytes[2..8].try_into().unwrap())
    }

    pub fn network_key(&self) -> NetworkKey {
        NetworkKey(u32::from_le_bytes(self.bytes[8..12].try_into().unwrap()))
    }
}

pub fn encode_pair_resp(
    buf: &mut [u8],
    slot: TrackerId,
    receiver_mac: MacAddr,
    key: NetworkKey,
) -> usize {
    buf[0] = TYPE_PAIR_RESP;
    buf[1] = slot.raw();
    buf[2..8].copy_from_slice(&receiver_mac.0);
    buf[8..12].copy_from_slice(&key.0.to_le_bytes());
    seal(buf, PAIR_RESP_LEN - 2)
}

/// Status byte of a PAIR_CONFIRM.
pub const CONFIRM_OK: u8 = 0x00;

#[derive(Debug, Clone, Copy)]
pub struct PairConfirm<'a> {
    bytes: &'a [u8],
}

impl<'a> PairConfirm<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameError> {
        check_len(bytes, PAIR_CONFIRM_LEN)?;
        check_crc(bytes)?;
        TrackerId::try_from(bytes[1]).map_err(|_| FrameError::OutOfRangeField)?;
        Ok(Self { bytes })
    }

    pub fn slot(&self) -> TrackerId {
        TrackerId::try_from(self.bytes[1]).unwrap()
    }

    pub fn mac(&self) -> MacAddr {
        MacAddr(self.bytes[2..8].try_into().unwrap())
    }

    pub fn status(&self) -> u8 {
        self.bytes[8]
    }
}

pub fn encode_pair_confirm(buf: &mut [u8], slot: TrackerId, mac: MacAddr, status: u8) -> usize {
    buf[0] = TYPE_PAIR_CONFIRM;
    buf[1] = slot.raw();
    buf[2..8].copy_from_slice(&mac.0);
    buf[8] = status;
    seal(buf, PAIR_CONFIRM_LEN - 2)
}

// ---------------------------------------------------------------------------
// Data + ACK

#[derive(Debug, Clone, Copy)]
pub struct Data<'a> {
    bytes: &'a [u8],
}

impl<'a> Data<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameError> {
        check_len(bytes, DATA_LEN)?;
        check_crc(bytes)?;
        let header = DataHeader::from_bytes([bytes[0]]);
        TrackerId::try_from(header.id()).map_err(|_| FrameError::OutOfRangeField)?;
        Ok(Self { bytes })
    }

    pub fn tracker_id(&self) -> TrackerId {
        TrackerId::try_from(DataHeader::from_bytes([self.bytes[0]]).id()).unwrap()
    }

    pub fn seq(&self) -> u8 {
        self.bytes[1]
    }

    /// Attitude in Q15, w-first.
    pub fn quat_q15(&self) -> [i16; 4] {
        let mut out = [0i16; 4];
        for (i, v) in out.iter_mut().enumerate() {
            let at = 2 + i * 2;
            *v = i16::from_le_bytes(self.bytes[at..at + 2].try_into().unwrap());
        }
        out
    }

    /// Acceleration in fixed-7 wire units.
    pub fn accel_fixed7(&self) -> [i16; 3] {
        let mut out = [0i16; 3];
        for (i, v) in out.iter_mut().enumerate() {
            let at = 10 + i * 2;
            *v = i16::from_le_bytes(self.bytes[at..at + 2].try_into().unwrap());
        }
        out
    }

    pub fn battery(&self) -> u8 {
        self.bytes[16]
    }

    pub fn flags(&self) -> u8 {
        self.bytes[17]
    }
}

#[allow(clippy::too_many_arguments)]
pub fn encode_data(
    buf: &mut [u8],
    id: TrackerId,
    seq: u8,
    quat_q15: [i16; 4],
    accel_fixed7: [i16; 3],
    battery: u8,
    flags: u8,
) -> usize {
    buf[0] = DataHeader::new()
        .with_id(id.raw())
        .with_tag(DATA_TAG_BITS)
        .into_bytes()[0];
    buf[1] = seq;
    for (i, v) in quat_q15.iter().enumerate() {
        let at = 2 + i * 2;
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
    for (i, v) in accel_fixed7.iter().enumerate() {
        let at = 10 + i * 2;
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }
    buf[16] = battery;
    buf[17] = flags;
    seal(buf, DATA_LEN - 2)
}

/// ACK command byte: no command this slot.
pub const ACK_CMD_NONE: u8 = 0x00;
/// ACK command byte: run a stationary calibration.
pub const ACK_CMD_CALIBRATE: u8 = 0x01;

#[derive(Debug, Clone, Copy)]
pub struct Ack<'a> {
    bytes: &'a [u8],
}

impl<'a> Ack<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameError> {
        check_len(bytes, ACK_LEN)?;
        TrackerId::try_from(bytes[1]).map_err(|_| FrameError::OutOfRangeField)?;
        Ok(Self { bytes })
    }

    pub fn tracker_id(&self) -> TrackerId {
        TrackerId::try_from(self.bytes[1]).unwrap()
    }

    pub fn seq(&self) -> u8 {
        self.bytes[2]
    }

    pub fn cmd(&self) -> u8 {
        self.bytes[3]
    }
}

pub fn encode_ack(buf: &mut [u8], id: TrackerId, seq: u8, cmd: u8) -> usize {
    buf[0] = TYPE_ACK;
    buf[1] = id.raw();
    buf[2] = seq;
    buf[3] = cmd;
    ACK_LEN
}
