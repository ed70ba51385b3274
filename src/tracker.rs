//! Link MAC, tracker role.
//!
//! The tracker is a slave to the receiver's superframe clock. It finds the
//! network by dwelling on each whitelist channel until a beacon carrying its
//! network key arrives, aligns its local superframe phase to the beacon's
//! reception timestamp, then runs a fixed cadence per frame: sleep until
//! just before its slot, transmit one DATA frame, listen briefly for the
//! ACK, hop to the next frame's channel, wait for the next beacon.
//!
//! Short fades are ridden out on the free-running local clock; a long
//! silence (`miss_limit` consecutive beacons) sends the MAC back to a full
//! scan. Losing a beacon never aborts a frame already in flight.

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::channels::{hop_channel, HOP_WHITELIST};
use crate::config::{recommended, FusionConfig, LinkConfig};
use crate::frame::{self, Downlink, ACK_CMD_CALIBRATE, CONFIRM_OK, MAX_FRAME_LEN};
use crate::fusion::FusionPipeline;
use crate::hal::{Clock, Flash, Imu, Radio, RxMeta};
use crate::math::Vec3;
use crate::pairing::{PairOffer, TrackerPairTx, TrackerPairing};
use crate::quant;
use crate::signal::IrqLatch;
use crate::store::{self, FusionSnapshot, PairingRecord, SnapshotWriter};
use crate::{InitError, LinkError, MacAddr};

/// Default stationary-calibration window, samples.
const CALIBRATION_SAMPLES: u32 = 400;

bitflags! {
    /// Status bits latched into every DATA frame.
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrackerFlags: u8 {
        const RESTING = 0x01;
        const CALIBRATING = 0x02;
        const CHARGING = 0x04;
        const IMU_FAULT = 0x08;
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// No persisted binding; waits for the app to start pairing.
    Unpaired,
    /// Scanning the hop whitelist for a beacon carrying our key.
    SyncSearch,
    /// Locked to the superframe; transmitting in our slot.
    Running,
    /// Session on the pairing channel.
    Pairing,
    /// IMU suspended, state snapshotted; only `wake` leaves this.
    Sleep,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerStats {
    pub beacons_seen: u32,
    pub frames_sent: u32,
    pub acks_received: u32,
    pub acks_missed: u32,
    pub crc_errors: u32,
    pub imu_errors: u32,
    pub resyncs: u32,
}

pub struct Tracker<R: Radio, F: Flash, C: Clock, I: Imu> {
    cfg: LinkConfig,
    state: TrackerState,
    radio: R,
    flash: F,
    clock: C,
    imu: I,

    mac: MacAddr,
    imu_kind: u8,
    fw_version: (u8, u8),
    binding: Option<PairingRecord>,
    /// Data-ready hand-off from the IMU interrupt; `None` polls the bus.
    imu_ready: Option<&'static IrqLatch>,

    fusion: FusionPipeline,
    snapshots: SnapshotWriter,
    sleep_count: u16,
    wake_count: u16,

    // payload latched for the next slot
    quat_q15: [i16; 4],
    accel_fixed7: [i16; 3],
    battery: u8,
    flags: TrackerFlags,
    seq: u8,

    // superframe phase (Running)
    frame_number: u16,
    frame_start_us: u64,
    beacon_seen_this_frame: bool,
    sent_this_frame: bool,
    missed_beacons: u32,
    ack_deadline_us: Option<u64>,
    ack_seq: u8,

    // scan state (SyncSearch)
    search_idx: usize,
    dwell_until_ms: u32,

    pairing: TrackerPairing,
    stats: TrackerStats,
}

impl<R: Radio, F: Flash, C: Clock, I: Imu> Tracker<R, F, C, I> {
    pub fn new(
        radio: R,
        flash: F,
        clock: C,
        imu: I,
        mac: MacAddr,
        imu_kind: u8,
        fw_version: (u8, u8),
        cfg: LinkConfig,
        fusion_cfg: FusionConfig,
    ) -> Result<Self, InitError<R::Error>> {
        if !cfg.validate() {
            return Err(InitError::BadConfig);
        }

        let mut s = Self {
            cfg,
            state: TrackerState::Unpaired,
            radio,
            flash,
            clock,
            imu,
            mac,
            imu_kind,
            fw_version,
            binding: None,
            imu_ready: None,
            fusion: FusionPipeline::new(fusion_cfg),
            snapshots: SnapshotWriter::new(recommended::SNAPSHOT_MIN_INTERVAL_MS),
            sleep_count: 0,
            wake_count: 0,
            quat_q15: quant::quat_to_q15(crate::math::Quat::IDENTITY),
            accel_fixed7: [0; 3],
            battery: 0,
            flags: TrackerFlags::default(),
            seq: 0,
            frame_number: 0,
            frame_start_us: 0,
            beacon_seen_this_frame: false,
            sent_this_frame: false,
            missed_beacons: 0,
            ack_deadline_us: None,
            ack_seq: 0,
            search_idx: 0,
            dwell_until_ms: 0,
            pairing: TrackerPairing::new(),
            stats: TrackerStats::default(),
        };

        s.binding = store::load_pairing(&mut s.flash).map_err(InitError::Flash)?;
        if let Some(snap) = store::load_snapshot(&mut s.flash).map_err(InitError::Flash)? {
            s.fusion.restore(&snap);
            s.sleep_count = snap.sleep_count;
            s.wake_count = snap.wake_count;
        }

        if let Err(e) = s.imu.configure(fusion_cfg.sample_rate_hz) {
            // the link still runs; frames carry the fault flag
            warn!("imu configure failed: {:?}", e);
            s.flags |= TrackerFlags::IMU_FAULT;
            s.stats.imu_errors += 1;
        }

        if s.binding.is_some() {
            s.enter_search().map_err(InitError::Radio)?;
            info!("tracker: binding restored, searching for sync");
        } else {
            info!("tracker: unpaired");
        }
        Ok(s)
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    pub fn binding(&self) -> Option<&PairingRecord> {
        self.binding.as_ref()
    }

    pub fn fusion(&self) -> &FusionPipeline {
        &self.fusion
    }

    pub fn set_battery(&mut self, percent: u8) {
        self.battery = percent.min(100);
    }

    pub fn set_charging(&mut self, charging: bool) {
        self.flags.set(TrackerFlags::CHARGING, charging);
    }

    /// Wire the IMU's data-ready line. The interrupt top-half calls
    /// [`IrqLatch::raise`]; `tick` then consumes one sample per raise
    /// instead of polling the bus every pass.
    pub fn attach_imu_latch(&mut self, latch: &'static IrqLatch) {
        self.imu_ready = Some(latch);
    }

    /// Earliest time the main loop must run again; the app may WFI until
    /// then. `None` when the MAC wants polling as fast as convenient.
    pub fn next_deadline_us(&self) -> Option<u64> {
        match self.state {
            TrackerState::Running => {
                if let Some(dl) = self.ack_deadline_us {
                    return Some(dl);
                }
                let binding = self.binding.as_ref()?;
                if !self.sent_this_frame {
                    let slot = self.frame_start_us
                        + self.cfg.slot_offset_us(binding.tracker_id.raw()) as u64;
                    Some(slot.saturating_sub(self.cfg.wake_early_us as u64))
                } else {
                    Some(self.frame_start_us + self.cfg.superframe_us() as u64)
                }
            }
            _ => None,
        }
    }

    /// One cooperative pass: drain the radio, advance the state machine,
    /// step fusion if the IMU has a sample.
    pub fn tick(&mut self) -> Result<(), LinkError<R::Error>> {
        let now_us = self.clock.now_us();
        let now_ms = (now_us / 1_000) as u32;

        let mut buf = [0u8; MAX_FRAME_LEN];
        while let Some(meta) = self.radio.poll_receive(&mut buf).map_err(LinkError::Radio)? {
            let len = meta.len.min(buf.len());
            self.handle_rx(&buf[..len], meta);
        }

        match self.state {
            TrackerState::Unpaired | TrackerState::Sleep => {}
            TrackerState::SyncSearch => self.tick_search(now_ms)?,
            TrackerState::Running => self.tick_running(now_us)?,
            TrackerState::Pairing => self.tick_pairing(now_us, now_ms)?,
        }

        self.service_imu(now_ms);
        Ok(())
    }

    /// Open a pairing session on the dedicated channel.
    pub fn start_pairing(&mut self) -> Result<(), LinkError<R::Error>> {
        let now_ms = self.clock.now_ms();
        self.pairing.start(now_ms, self.cfg.pairing_timeout_tracker_ms);
        self.radio
            .set_channel(self.cfg.pairing_channel)
            .map_err(LinkError::Radio)?;
        self.radio.start_receive().map_err(LinkError::Radio)?;
        self.state = TrackerState::Pairing;
        Ok(())
    }

    /// Abort a pairing session; harmless when none is open.
    pub fn stop_pairing(&mut self) -> Result<(), LinkError<R::Error>> {
        self.pairing.stop();
        if self.state == TrackerState::Pairing {
            self.leave_pairing()?;
        }
        Ok(())
    }

    /// Snapshot fusion state and suspend the IMU ahead of deep sleep.
    pub fn prepare_sleep(&mut self) -> Result<(), LinkError<R::Error>> {
        let now_ms = self.clock.now_ms();
        self.sleep_count = self.sleep_count.wrapping_add(1);
        let snap = self.make_snapshot(now_ms);
        self.snapshots
            .maybe_save(&mut self.flash, &snap, now_ms, true)?;
        if let Err(e) = self.imu.enable_wake_on_motion() {
            debug!("wake-on-motion unavailable: {:?}", e);
        }
        if let Err(e) = self.imu.suspend() {
            warn!("imu suspend failed: {:?}", e);
        }
        self.state = TrackerState::Sleep;
        info!("tracker: sleeping (count {})", self.sleep_count);
        Ok(())
    }

    pub fn wake(&mut self) -> Result<(), LinkError<R::Error>> {
        if self.state != TrackerState::Sleep {
            return Ok(());
        }
        self.wake_count = self.wake_count.wrapping_add(1);
        if let Err(e) = self.imu.resume() {
            warn!("imu resume failed: {:?}", e);
            self.flags |= TrackerFlags::IMU_FAULT;
        }
        if self.binding.is_some() {
            self.enter_search().map_err(LinkError::Radio)?;
        } else {
            self.state = TrackerState::Unpaired;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------

    fn handle_rx(&mut self, bytes: &[u8], meta: RxMeta) {
        let decoded = match Downlink::decode(bytes) {
            Ok(d) => d,
            Err(frame::FrameError::BadCrc) => {
                self.stats.crc_errors += 1;
                return;
            }
            Err(_) => return,
        };

        match decoded {
            Downlink::SyncBeacon(b) => self.handle_beacon(&b, meta),
            Downlink::Ack(a) => self.handle_ack(&a),
            Downlink::PairResp(r) => {
                if self.state == TrackerState::Pairing {
                    self.pairing.handle_response(PairOffer {
                        slot: r.slot(),
                        receiver_mac: r.receiver_mac(),
                        network_key: r.network_key(),
                    });
                }
            }
        }
    }

    fn handle_beacon(&mut self, b: &frame::SyncBeacon<'_>, meta: RxMeta) {
        let Some(binding) = self.binding.as_ref() else {
            return;
        };
        if b.key() != binding.network_key {
            return;
        }

        match self.state {
            TrackerState::SyncSearch => {
                self.adopt_frame(b.frame_number(), meta.timestamp_us, true);
                self.state = TrackerState::Running;
                self.stats.beacons_seen += 1;
                info!(
                    "tracker: sync acquired, frame {} on channel {}",
                    b.frame_number(),
                    b.channel()
                );
            }
            TrackerState::Running => {
                // re-anchoring on a beacon for the frame we already occupy
                // must not re-open a slot we have transmitted in
                let advanced = b.frame_number() != self.frame_number;
                self.adopt_frame(b.frame_number(), meta.timestamp_us, advanced);
                self.stats.beacons_seen += 1;
            }
            _ => {}
        }
    }

    fn adopt_frame(&mut self, frame_number: u16, timestamp_us: u64, reset_sent: bool) {
        self.frame_number = frame_number;
        self.frame_start_us = timestamp_us;
        self.beacon_seen_this_frame = true;
        if reset_sent {
            self.sent_this_frame = false;
        }
        self.missed_beacons = 0;
    }

    fn handle_ack(&mut self, a: &frame::Ack<'_>) {
        let Some(binding) = self.binding.as_ref() else {
            return;
        };
        if self.ack_deadline_us.is_none()
            || a.tracker_id() != binding.tracker_id
            || a.seq() != self.ack_seq
        {
            return;
        }
        self.ack_deadline_us = None;
        self.stats.acks_received += 1;
        if a.cmd() == ACK_CMD_CALIBRATE {
            info!("tracker: calibration requested over the air");
            self.fusion.begin_calibration(CALIBRATION_SAMPLES);
        }
    }

    fn tick_search(&mut self, now_ms: u32) -> Result<(), LinkError<R::Error>> {
        if now_ms.wrapping_sub(self.dwell_until_ms) < 0x8000_0000 {
            self.search_idx = (self.search_idx + 1) % HOP_WHITELIST.len();
            self.radio
                .set_channel(HOP_WHITELIST[self.search_idx])
                .map_err(LinkError::Radio)?;
            self.radio.start_receive().map_err(LinkError::Radio)?;
            self.dwell_until_ms = now_ms.wrapping_add(self.cfg.sync_dwell_ms);
        }
        Ok(())
    }

    fn tick_running(&mut self, now_us: u64) -> Result<(), LinkError<R::Error>> {
        let Some(binding) = self.binding.as_ref().copied() else {
            self.state = TrackerState::Unpaired;
            return Ok(());
        };
        let sf = self.cfg.superframe_us() as u64;

        // ACK window bookkeeping first; a lost beacon never aborts the
        // frame in flight
        if let Some(deadline) = self.ack_deadline_us {
            if now_us >= deadline {
                self.ack_deadline_us = None;
                self.stats.acks_missed += 1;
                debug!("tracker: ack missed ({} total)", self.stats.acks_missed);
            }
        }

        // roll into the next superframe on the local clock when the beacon
        // hasn't already re-anchored us
        while now_us >= self.frame_start_us + sf {
            if !self.beacon_seen_this_frame {
                self.missed_beacons += 1;
                if self.missed_beacons >= self.cfg.miss_limit {
                    warn!(
                        "tracker: {} beacons missed, rescanning",
                        self.missed_beacons
                    );
                    self.stats.resyncs += 1;
                    self.enter_search().map_err(LinkError::Radio)?;
                    return Ok(());
                }
            }
            self.frame_number = self.frame_number.wrapping_add(1);
            self.frame_start_us += sf;
            self.beacon_seen_this_frame = false;
            self.sent_this_frame = false;

            let ch = hop_channel(self.frame_number, binding.network_key);
            self.radio.set_channel(ch).map_err(LinkError::Radio)?;
            self.radio.start_receive().map_err(LinkError::Radio)?;
        }

        // a short fade is ridden out silently; past the tolerance we stop
        // transmitting into guessed slots and just hunt for the beacon
        if self.missed_beacons > self.cfg.beacon_miss_tolerance {
            return Ok(());
        }

        let slot_open = self.frame_start_us + self.cfg.slot_offset_us(binding.tracker_id.raw()) as u64;
        let slot_close = slot_open + self.cfg.slot_us() as u64;
        if !self.sent_this_frame && now_us >= slot_open && now_us < slot_close {
            let mut buf = [0u8; MAX_FRAME_LEN];
            let n = frame::encode_data(
                &mut buf,
                binding.tracker_id,
                self.seq,
                self.quat_q15,
                self.accel_fixed7,
                self.battery,
                self.flags.bits(),
            );
            self.radio.transmit(&buf[..n]).map_err(LinkError::Radio)?;
            self.radio.start_receive().map_err(LinkError::Radio)?;
            self.ack_seq = self.seq;
            self.seq = self.seq.wrapping_add(1);
            self.sent_this_frame = true;
            self.stats.frames_sent += 1;
            self.ack_deadline_us = Some(now_us + self.cfg.ack_wait_us as u64);
        }
        Ok(())
    }

    fn tick_pairing(&mut self, now_us: u64, now_ms: u32) -> Result<(), LinkError<R::Error>> {
        let jitter_ms = (now_us & 0x3F) as u32;
        match self
            .pairing
            .poll(now_ms, jitter_ms, self.cfg.pair_request_period_ms)
        {
            Some(TrackerPairTx::Request) => {
                let mut buf = [0u8; MAX_FRAME_LEN];
                let n = frame::encode_pair_req(
                    &mut buf,
                    1,
                    self.mac,
                    self.imu_kind,
                    self.fw_version,
                );
                self.radio.transmit(&buf[..n]).map_err(LinkError::Radio)?;
                self.radio.start_receive().map_err(LinkError::Radio)?;
            }
            Some(TrackerPairTx::Confirm(offer)) => {
                let mut buf = [0u8; MAX_FRAME_LEN];
                let n = frame::encode_pair_confirm(&mut buf, offer.slot, self.mac, CONFIRM_OK);
                self.radio.transmit(&buf[..n]).map_err(LinkError::Radio)?;
                self.complete_pairing(offer)?;
                return Ok(());
            }
            None => {}
        }

        if !self.pairing.is_active() && self.state == TrackerState::Pairing {
            self.leave_pairing()?;
        }
        Ok(())
    }

    fn complete_pairing(&mut self, offer: PairOffer) -> Result<(), LinkError<R::Error>> {
        let record = PairingRecord {
            tracker_id: offer.slot,
            own_mac: self.mac,
            receiver_mac: offer.receiver_mac,
            network_key: offer.network_key,
        };
        // the link can run on the in-RAM binding either way; a failed write
        // costs a re-pair after the next power cycle
        let persisted = store::save_pairing(&mut self.flash, &record);
        self.binding = Some(record);
        self.enter_search().map_err(LinkError::Radio)?;
        info!("tracker: paired into slot {}", offer.slot.raw());
        persisted.map_err(LinkError::Flash)
    }

    fn leave_pairing(&mut self) -> Result<(), LinkError<R::Error>> {
        if self.binding.is_some() {
            self.enter_search().map_err(LinkError::Radio)?;
        } else {
            self.state = TrackerState::Unpaired;
        }
        Ok(())
    }

    fn enter_search(&mut self) -> Result<(), R::Error> {
        self.state = TrackerState::SyncSearch;
        self.search_idx = 0;
        self.radio.set_channel(HOP_WHITELIST[0])?;
        self.radio.start_receive()?;
        self.dwell_until_ms = self.clock.now_ms().wrapping_add(self.cfg.sync_dwell_ms);
        self.ack_deadline_us = None;
        self.sent_this_frame = false;
        self.beacon_seen_this_frame = false;
        self.missed_beacons = 0;
        Ok(())
    }

    fn service_imu(&mut self, now_ms: u32) {
        let ready = match self.imu_ready {
            // wired data-ready line: the top-half raised the latch
            Some(latch) => latch.take().is_some(),
            None => match self.imu.data_ready() {
                Ok(r) => r,
                Err(e) => {
                    debug!("imu data_ready failed: {:?}", e);
                    self.stats.imu_errors += 1;
                    return;
                }
            },
        };
        if !ready {
            return;
        }
        let sample = match self.imu.read_sample() {
            Ok(s) => s,
            Err(e) => {
                // skip the sample; fusion state stays untouched
                debug!("imu read failed: {:?}", e);
                self.stats.imu_errors += 1;
                return;
            }
        };

        let gyro = Vec3::new(sample.gyro[0], sample.gyro[1], sample.gyro[2]);
        let accel = Vec3::new(sample.accel[0], sample.accel[1], sample.accel[2]);
        let mag = sample.mag.map(|m| Vec3::new(m[0], m[1], m[2]));
        let out = self.fusion.update(gyro, accel, mag, sample.temp_c, now_ms);

        self.quat_q15 = quant::quat_to_q15(out.quat);
        self.accel_fixed7 = quant::accel_to_fixed7(out.linear_accel);
        self.flags.set(TrackerFlags::RESTING, out.resting);
        self.flags
            .set(TrackerFlags::CALIBRATING, self.fusion.is_calibrating());

        // opportunistic wear-limited snapshot so a battery pull loses little
        let snap = self.make_snapshot(now_ms);
        if let Err(e) = self.snapshots.maybe_save(&mut self.flash, &snap, now_ms, false) {
            warn!("snapshot write failed: {:?}", e);
        }
    }

    fn make_snapshot(&self, now_ms: u32) -> FusionSnapshot {
        FusionSnapshot {
            save_time_ms: now_ms,
            quat: self.fusion.quat(),
            gyro_bias: self.fusion.gyro_bias(),
            sleep_count: self.sleep_count,
            wake_count: self.wake_count,
            total_runtime_ms: now_ms,
        }
    }
}
