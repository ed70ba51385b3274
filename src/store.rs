//! Persistent records over page-erase flash.
//!
//! Every record is `magic | payload | crc16` at a fixed, 16-byte-aligned
//! offset, so a sequential scan enumerates the binding table without
//! allocation. Writes are not atomic at the hardware level: a torn write
//! leaves a bad magic or bad CRC behind, and both read back as "absent" —
//! the caller re-creates the record rather than trusting half of one.
//!
//! Offsets are relative to the flash region each role owns:
//!
//! ```norust
//! receiver  0x0000            NetworkKeyRecord
//!           0x0100 + i * 16   BindingRecord[i]
//! tracker   0x0000            PairingRecord
//!           0x0100            FusionSnapshot
//! ```

use log::warn;

use crate::frame::LINK_CRC;
use crate::hal::{Entropy, Flash, FlashError};
use crate::math::{Quat, Vec3};
use crate::{MacAddr, NetworkKey, TrackerId, MAX_TRACKERS};

pub const RX_KEY_OFFSET: u32 = 0x0000;
pub const RX_BINDING_BASE: u32 = 0x0100;
pub const BINDING_STRIDE: u32 = 16;

pub const TRK_PAIRING_OFFSET: u32 = 0x0000;
pub const TRK_SNAPSHOT_OFFSET: u32 = 0x0100;

pub const KEY_MAGIC: u32 = 0x534C_5652;
pub const PAIRING_MAGIC: u32 = 0x5041_4952;
pub const SNAPSHOT_MAGIC: u32 = 0x5245_5441;
pub const SNAPSHOT_VERSION: u8 = 1;

const KEY_RECORD_LEN: usize = 10;
const BINDING_RECORD_LEN: usize = 16;
const PAIRING_RECORD_LEN: usize = 32;
const SNAPSHOT_RECORD_LEN: usize = 48;

/// Largest page geometry the read-modify-write path supports.
const MAX_PAGE: usize = 256;

/// Program `data` at `offset`, preserving the rest of the touched page(s).
fn update<F: Flash>(flash: &mut F, offset: u32, data: &[u8]) -> Result<(), FlashError> {
    let page = F::PAGE_SIZE;
    if page > MAX_PAGE {
        return Err(FlashError::OutOfRange);
    }
    let mut scratch = [0u8; MAX_PAGE];
    let end = offset + data.len() as u32;
    let mut base = offset - (offset % page as u32);
    while base < end {
        flash.read(base, &mut scratch[..page])?;
        let from = base.max(offset);
        let to = (base + page as u32).min(end);
        scratch[(from - base) as usize..(to - base) as usize]
            .copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);
        flash.erase(base, page)?;
        flash.write(base, &scratch[..page])?;
        base += page as u32;
    }
    Ok(())
}

fn seal(buf: &mut [u8]) {
    let body = buf.len() - 2;
    let crc = LINK_CRC.checksum(&buf[..body]);
    buf[body..].copy_from_slice(&crc.to_le_bytes());
}

fn crc_ok(buf: &[u8]) -> bool {
    let body = buf.len() - 2;
    let want = u16::from_le_bytes(buf[body..].try_into().unwrap());
    LINK_CRC.checksum(&buf[..body]) == want
}

// ---------------------------------------------------------------------------
// Network key (receiver)

pub fn load_network_key<F: Flash>(flash: &mut F) -> Result<Option<NetworkKey>, FlashError> {
    let mut rec = [0u8; KEY_RECORD_LEN];
    flash.read(RX_KEY_OFFSET, &mut rec)?;
    if u32::from_le_bytes(rec[0..4].try_into().unwrap()) != KEY_MAGIC || !crc_ok(&rec) {
        return Ok(None);
    }
    let key = NetworkKey(u32::from_le_bytes(rec[4..8].try_into().unwrap()));
    Ok(if key.is_valid() { Some(key) } else { None })
}

pub fn save_network_key<F: Flash>(flash: &mut F, key: NetworkKey) -> Result<(), FlashError> {
    let mut rec = [0u8; KEY_RECORD_LEN];
    rec[0..4].copy_from_slice(&KEY_MAGIC.to_le_bytes());
    rec[4..8].copy_from_slice(&key.0.to_le_bytes());
    seal(&mut rec);
    update(flash, RX_KEY_OFFSET, &rec)
}

/// Load the receiver's key, minting and persisting one on first boot.
///
/// Generation prefers the hardware entropy source; when that is dry the
/// fallback is a maximal 32-bit LFSR seeded from the MAC and boot time.
/// Either path re-draws until the key is neither zero nor all-ones.
pub fn load_or_create_network_key<F: Flash, E: Entropy>(
    flash: &mut F,
    entropy: Option<&mut E>,
    mac: MacAddr,
    boot_time_ms: u32,
) -> Result<NetworkKey, FlashError> {
    if let Some(key) = load_network_key(flash)? {
        return Ok(key);
    }

    let mut lfsr = key_seed(mac, boot_time_ms);
    let mut hw = entropy;
    let mut hw_draws = 0u8;
    let key = loop {
        let word = match hw.as_mut() {
            // a broken source that keeps handing back reserved words gets
            // abandoned for the LFSR after a few draws
            Some(e) if hw_draws < 4 => {
                hw_draws += 1;
                e.try_random()
            }
            _ => None,
        };
        let word = match word {
            Some(w) => w,
            None => {
                lfsr = lfsr_word(lfsr);
                lfsr
            }
        };
        let candidate = NetworkKey(word);
        if candidate.is_valid() {
            break candidate;
        }
    };

    save_network_key(flash, key)?;
    Ok(key)
}

fn key_seed(mac: MacAddr, boot_time_ms: u32) -> u32 {
    let a = u32::from_le_bytes(mac.0[0..4].try_into().unwrap());
    let b = u32::from_le_bytes(mac.0[2..6].try_into().unwrap());
    let seed = a ^ b.rotate_left(16) ^ boot_time_ms;
    if seed == 0 {
        0x5EED_0001
    } else {
        seed
    }
}

/// 32 Galois steps; taps 32,22,2,1.
fn lfsr_word(mut s: u32) -> u32 {
    for _ in 0..32 {
        let lsb = s & 1;
        s >>= 1;
        if lsb != 0 {
            s ^= 0x8020_0003;
        }
    }
    s
}

/// Wipe the key and every binding; the next boot mints a fresh key.
pub fn factory_reset<F: Flash>(flash: &mut F) -> Result<(), FlashError> {
    let end = RX_BINDING_BASE + BINDING_STRIDE * MAX_TRACKERS as u32;
    let page = F::PAGE_SIZE as u32;
    let span = end.div_ceil(page) * page;
    flash.erase(0, span as usize)
}

// ---------------------------------------------------------------------------
// Binding table (receiver)

/// One receiver-side slot binding. Existence implies `active`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub mac: MacAddr,
    pub paired_time_ms: u32,
}

fn binding_offset(slot: TrackerId) -> u32 {
    RX_BINDING_BASE + BINDING_STRIDE * slot.index() as u32
}

pub fn load_binding<F: Flash>(
    flash: &mut F,
    slot: TrackerId,
) -> Result<Option<Binding>, FlashError> {
    let mut rec = [0u8; BINDING_RECORD_LEN];
    flash.read(binding_offset(slot), &mut rec)?;
    if !crc_ok(&rec[..14]) || rec[6] == 0 || rec[7] != slot.raw() {
        return Ok(None);
    }
    Ok(Some(Binding {
        mac: MacAddr(rec[0..6].try_into().unwrap()),
        paired_time_ms: u32::from_le_bytes(rec[8..12].try_into().unwrap()),
    }))
}

pub fn save_binding<F: Flash>(
    flash: &mut F,
    slot: TrackerId,
    binding: &Binding,
) -> Result<(), FlashError> {
    let mut rec = [0u8; BINDING_RECORD_LEN];
    rec[0..6].copy_from_slice(&binding.mac.0);
    rec[6] = 1;
    rec[7] = slot.raw();
    rec[8..12].copy_from_slice(&binding.paired_time_ms.to_le_bytes());
    seal(&mut rec[..14]);
    update(flash, binding_offset(slot), &rec)
}

/// Zero the slot record; zeros fail the CRC check, so the slot reads absent.
pub fn clear_binding<F: Flash>(flash: &mut F, slot: TrackerId) -> Result<(), FlashError> {
    let rec = [0u8; BINDING_RECORD_LEN];
    update(flash, binding_offset(slot), &rec)
}

// ---------------------------------------------------------------------------
// Pairing record (tracker)

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRecord {
    pub tracker_id: TrackerId,
    pub own_mac: MacAddr,
    pub receiver_mac: MacAddr,
    pub network_key: NetworkKey,
}

pub fn load_pairing<F: Flash>(flash: &mut F) -> Result<Option<PairingRecord>, FlashError> {
    let mut rec = [0u8; PAIRING_RECORD_LEN];
    flash.read(TRK_PAIRING_OFFSET, &mut rec)?;
    if u32::from_le_bytes(rec[0..4].try_into().unwrap()) != PAIRING_MAGIC || !crc_ok(&rec) {
        return Ok(None);
    }
    // paired flag cleared means an unpair was persisted over a live record
    if rec[21] == 0 {
        return Ok(None);
    }
    let tracker_id = match TrackerId::try_from(rec[4]) {
        Ok(id) => id,
        Err(_) => {
            warn!("pairing record slot {} out of range, ignoring", rec[4]);
            return Ok(None);
        }
    };
    let key = NetworkKey(u32::from_le_bytes(rec[17..21].try_into().unwrap()));
    if !key.is_valid() {
        return Ok(None);
    }
    Ok(Some(PairingRecord {
        tracker_id,
        own_mac: MacAddr(rec[5..11].try_into().unwrap()),
        receiver_mac: MacAddr(rec[11..17].try_into().unwrap()),
        network_key: key,
    }))
}

pub fn save_pairing<F: Flash>(flash: &mut F, rec: &PairingRecord) -> Result<(), FlashError> {
    let mut buf = [0u8; PAIRING_RECORD_LEN];
    buf[0..4].copy_from_slice(&PAIRING_MAGIC.to_le_bytes());
    buf[4] = rec.tracker_id.raw();
    buf[5..11].copy_from_slice(&rec.own_mac.0);
    buf[11..17].copy_from_slice(&rec.receiver_mac.0);
    buf[17..21].copy_from_slice(&rec.network_key.0.to_le_bytes());
    buf[21] = 1;
    // buf[22..30] reserved
    seal(&mut buf);
    update(flash, TRK_PAIRING_OFFSET, &buf)
}

pub fn clear_pairing<F: Flash>(flash: &mut F) -> Result<(), FlashError> {
    let buf = [0u8; PAIRING_RECORD_LEN];
    update(flash, TRK_PAIRING_OFFSET, &buf)
}

// ---------------------------------------------------------------------------
// Fusion snapshot (tracker)

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionSnapshot {
    pub save_time_ms: u32,
    pub quat: Quat,
    pub gyro_bias: Vec3,
    pub sleep_count: u16,
    pub wake_count: u16,
    pub total_runtime_ms: u32,
}

pub fn load_snapshot<F: Flash>(flash: &mut F) -> Result<Option<FusionSnapshot>, FlashError> {
    let mut rec = [0u8; SNAPSHOT_RECORD_LEN];
    flash.read(TRK_SNAPSHOT_OFFSET, &mut rec)?;
    if u32::from_le_bytes(rec[0..4].try_into().unwrap()) != SNAPSHOT_MAGIC
        || rec[4] != SNAPSHOT_VERSION
        || !crc_ok(&rec)
    {
        return Ok(None);
    }
    let f = |at: usize| f32::from_le_bytes(rec[at..at + 4].try_into().unwrap());
    Ok(Some(FusionSnapshot {
        save_time_ms: u32::from_le_bytes(rec[5..9].try_into().unwrap()),
        quat: Quat::new(f(9), f(13), f(17), f(21)),
        gyro_bias: Vec3::new(f(25), f(29), f(33)),
        sleep_count: u16::from_le_bytes(rec[37..39].try_into().unwrap()),
        wake_count: u16::from_le_bytes(rec[39..41].try_into().unwrap()),
        total_runtime_ms: u32::from_le_bytes(rec[41..45].try_into().unwrap()),
    }))
}

pub fn save_snapshot<F: Flash>(flash: &mut F, snap: &FusionSnapshot) -> Result<(), FlashError> {
    let mut rec = [0u8; SNAPSHOT_RECORD_LEN];
    rec[0..4].copy_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
    rec[4] = SNAPSHOT_VERSION;
    rec[5..9].copy_from_slice(&snap.save_time_ms.to_le_bytes());
    for (i, c) in [snap.quat.w, snap.quat.x, snap.quat.y, snap.quat.z]
        .into_iter()
        .enumerate()
    {
        rec[9 + i * 4..13 + i * 4].copy_from_slice(&c.to_le_bytes());
    }
    for (i, c) in [snap.gyro_bias.x, snap.gyro_bias.y, snap.gyro_bias.z]
        .into_iter()
        .enumerate()
    {
        rec[25 + i * 4..29 + i * 4].copy_from_slice(&c.to_le_bytes());
    }
    rec[37..39].copy_from_slice(&snap.sleep_count.to_le_bytes());
    rec[39..41].copy_from_slice(&snap.wake_count.to_le_bytes());
    rec[41..45].copy_from_slice(&snap.total_runtime_ms.to_le_bytes());
    seal(&mut rec);
    update(flash, TRK_SNAPSHOT_OFFSET, &rec)
}

/// Flash-wear throttle for periodic snapshot writes.
///
/// Background saves are spaced at least `min_interval_ms` apart; the
/// pre-sleep save passes `force` and always lands.
pub struct SnapshotWriter {
    min_interval_ms: u32,
    last_save_ms: Option<u32>,
}

impl SnapshotWriter {
    pub const fn new(min_interval_ms: u32) -> Self {
        Self { min_interval_ms, last_save_ms: None }
    }

    /// Returns whether a write actually happened.
    pub fn maybe_save<F: Flash>(
        &mut self,
        flash: &mut F,
        snap: &FusionSnapshot,
        now_ms: u32,
        force: bool,
    ) -> Result<bool, FlashError> {
        if !force {
            if let Some(last) = self.last_save_ms {
                if now_ms.wrapping_sub(last) < self.min_interval_ms {
                    return Ok(false);
                }
            }
        }
        save_snapshot(flash, snap)?;
        self.last_save_ms = Some(now_ms);
        Ok(true)
    }
}
