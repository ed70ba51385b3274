//! Link MAC, receiver role.
//!
//! The receiver owns the superframe clock. Every `sync_interval_ms` it hops
//! to the next channel in the schedule, emits a sync beacon, then listens
//! through the slot windows for tracker DATA frames, answering each valid
//! one with an ACK in the same slot's tail. Pairing mode parks the
//! superframe, camps on the pairing channel, and hands the byte stream to
//! the reactive pairing engine until completion or timeout.
//!
//! Beacon cadence is scheduled against the microsecond clock and the actual
//! emission lateness is tracked — the jitter budget (`slot/4`) is the
//! tightest soft-real-time bound in the system, and blowing it is worth a
//! log line long before trackers start missing their slots.

use heapless::Deque;
use log::{debug, error, info, warn};

use crate::channels::hop_channel;
use crate::config::LinkConfig;
use crate::frame::{self, Uplink, ACK_CMD_NONE, MAX_FRAME_LEN};
use crate::hal::{Clock, Entropy, Flash, Radio, RxMeta};
use crate::host::HostEvent;
use crate::pairing::ReceiverPairing;
use crate::quant;
use crate::store::{self, Binding};
use crate::{InitError, LinkError, MacAddr, NetworkKey, TrackerId, MAX_TRACKERS};

/// Host events buffered between `tick` and `poll_host`.
const HOST_QUEUE_DEPTH: usize = 32;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Constructed but not running (post factory-reset).
    Idle,
    /// Owning the superframe.
    Normal,
    /// Camped on the pairing channel.
    Pairing,
    /// A radio fault stopped the MAC; re-init required.
    Error,
}

/// Live per-slot view, rebuilt from the air; cleared on unpair.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerRuntime {
    pub rssi: i8,
    pub last_seen_ms: u32,
    pub sequence: u8,
    pub packet_loss: u32,
    pub battery: u8,
    pub flags: u8,
    pub last_quat: [i16; 4],
    pub last_accel: [i16; 3],
    /// False until the first DATA frame after (re)activation.
    pub seen: bool,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStats {
    pub crc_errors: u32,
    pub rejected_frames: u32,
    pub beacons_sent: u32,
    pub frames_ok: u32,
    pub host_drops: u32,
    /// Worst observed beacon lateness against the schedule grid.
    pub max_jitter_us: u32,
}

pub struct Receiver<R: Radio, F: Flash, C: Clock> {
    cfg: LinkConfig,
    state: ReceiverState,
    radio: R,
    flash: F,
    clock: C,

    mac: MacAddr,
    key: NetworkKey,
    bindings: [Option<Binding>; MAX_TRACKERS],
    runtime: [TrackerRuntime; MAX_TRACKERS],
    pending_cmd: [u8; MAX_TRACKERS],

    frame_number: u16,
    next_frame_us: u64,

    pairing: ReceiverPairing,
    host: Deque<HostEvent, HOST_QUEUE_DEPTH>,
    stats: ReceiverStats,
}

impl<R: Radio, F: Flash, C: Clock> Receiver<R, F, C> {
    /// Bring the receiver up: load (or mint) the network key, replay the
    /// binding table, and arm the superframe clock.
    pub fn new<E: Entropy>(
        radio: R,
        mut flash: F,
        clock: C,
        mac: MacAddr,
        cfg: LinkConfig,
        entropy: Option<&mut E>,
    ) -> Result<Self, InitError<R::Error>> {
        if !cfg.validate() {
            return Err(InitError::BadConfig);
        }

        let boot_ms = clock.now_ms();
        let key = store::load_or_create_network_key(&mut flash, entropy, mac, boot_ms)
            .map_err(InitError::Flash)?;

        let mut bindings: [Option<Binding>; MAX_TRACKERS] = [None; MAX_TRACKERS];
        for (i, slot) in bindings.iter_mut().enumerate().take(cfg.n_max as usize) {
            let id = TrackerId::try_from(i as u8).map_err(|_| InitError::BadConfig)?;
            *slot = store::load_binding(&mut flash, id).map_err(InitError::Flash)?;
        }
        let active = bindings.iter().filter(|b| b.is_some()).count();
        info!("receiver: up with {} bound trackers", active);

        let next_frame_us = clock.now_us();
        Ok(Self {
            cfg,
            state: ReceiverState::Normal,
            radio,
            flash,
            clock,
            mac,
            key,
            bindings,
            runtime: [TrackerRuntime::default(); MAX_TRACKERS],
            pending_cmd: [ACK_CMD_NONE; MAX_TRACKERS],
            frame_number: 0,
            next_frame_us,
            pairing: ReceiverPairing::new(),
            host: Deque::new(),
            stats: ReceiverStats::default(),
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    pub fn network_key(&self) -> NetworkKey {
        self.key
    }

    pub fn frame_number(&self) -> u16 {
        self.frame_number
    }

    pub fn active_count(&self) -> u8 {
        self.bindings.iter().filter(|b| b.is_some()).count() as u8
    }

    pub fn binding(&self, id: TrackerId) -> Option<&Binding> {
        self.bindings[id.index()].as_ref()
    }

    /// Runtime view of an active slot; `None` for free slots.
    pub fn tracker(&self, id: TrackerId) -> Option<&TrackerRuntime> {
        self.bindings[id.index()].as_ref()?;
        Some(&self.runtime[id.index()])
    }

    /// One cooperative pass.
    pub fn tick(&mut self) -> Result<(), LinkError<R::Error>> {
        let r = self.tick_inner();
        if let Err(LinkError::Radio(_)) = &r {
            self.state = ReceiverState::Error;
        }
        r
    }

    fn tick_inner(&mut self) -> Result<(), LinkError<R::Error>> {
        let now_us = self.clock.now_us();
        let now_ms = (now_us / 1_000) as u32;

        match self.state {
            ReceiverState::Normal => {
                if now_us >= self.next_frame_us {
                    self.emit_beacon(now_us)?;
                }
                let mut buf = [0u8; MAX_FRAME_LEN];
                while let Some(meta) =
                    self.radio.poll_receive(&mut buf).map_err(LinkError::Radio)?
                {
                    let len = meta.len.min(buf.len());
                    self.handle_uplink(&buf[..len], meta, now_ms)?;
                }
            }
            ReceiverState::Pairing => {
                if self.pairing.poll_expired(now_ms) {
                    info!("receiver: pairing window expired");
                    self.exit_pairing()?;
                    return Ok(());
                }
                let mut buf = [0u8; MAX_FRAME_LEN];
                while let Some(meta) =
                    self.radio.poll_receive(&mut buf).map_err(LinkError::Radio)?
                {
                    let len = meta.len.min(buf.len());
                    self.handle_pairing_rx(&buf[..len], now_ms)?;
                }
            }
            ReceiverState::Idle | ReceiverState::Error => {}
        }
        Ok(())
    }

    /// Enter pairing mode; the superframe pauses until exit.
    pub fn start_pairing(&mut self) -> Result<(), LinkError<R::Error>> {
        let now_ms = self.clock.now_ms();
        self.pairing
            .start(now_ms, self.cfg.pairing_timeout_receiver_ms);
        self.radio
            .set_channel(self.cfg.pairing_channel)
            .map_err(LinkError::Radio)?;
        self.radio.start_receive().map_err(LinkError::Radio)?;
        self.state = ReceiverState::Pairing;
        info!("receiver: pairing mode open");
        Ok(())
    }

    /// Leave pairing mode; harmless when not pairing.
    pub fn stop_pairing(&mut self) -> Result<(), LinkError<R::Error>> {
        self.pairing.stop();
        if self.state == ReceiverState::Pairing {
            self.exit_pairing()?;
        }
        Ok(())
    }

    /// Queue a stationary-calibration command into the slot's next ACK.
    pub fn request_calibration(&mut self, id: TrackerId) {
        self.pending_cmd[id.index()] = frame::ACK_CMD_CALIBRATE;
    }

    /// Deactivate one slot and persist the cleared record. Idempotent.
    pub fn unpair(&mut self, id: TrackerId) -> Result<(), LinkError<R::Error>> {
        store::clear_binding(&mut self.flash, id)?;
        if self.bindings[id.index()].take().is_some() {
            self.runtime[id.index()] = TrackerRuntime::default();
            self.pending_cmd[id.index()] = ACK_CMD_NONE;
            self.push_host(HostEvent::Unpaired { id });
            info!("receiver: slot {} unpaired", id.raw());
        }
        Ok(())
    }

    pub fn unpair_all(&mut self) -> Result<(), LinkError<R::Error>> {
        for i in 0..MAX_TRACKERS {
            let id = TrackerId::try_from(i as u8).unwrap();
            self.unpair(id)?;
        }
        Ok(())
    }

    /// Wipe key and bindings; the next init mints a fresh key.
    pub fn factory_reset(&mut self) -> Result<(), LinkError<R::Error>> {
        store::factory_reset(&mut self.flash)?;
        self.bindings = [None; MAX_TRACKERS];
        self.runtime = [TrackerRuntime::default(); MAX_TRACKERS];
        self.state = ReceiverState::Idle;
        warn!("receiver: factory reset, re-init required");
        Ok(())
    }

    /// Drain one host-bound frame into `buf`; returns the encoded length.
    pub fn poll_host(&mut self, buf: &mut [u8]) -> Option<usize> {
        let event = self.host.pop_front()?;
        Some(crate::host::encode_event(buf, &event))
    }

    // -----------------------------------------------------------------------

    fn emit_beacon(&mut self, now_us: u64) -> Result<(), LinkError<R::Error>> {
        let late = (now_us - self.next_frame_us) as u32;
        if late > self.stats.max_jitter_us {
            self.stats.max_jitter_us = late;
        }
        if late > self.cfg.jitter_budget_us() {
            warn!("receiver: beacon {} us late (budget {})", late, self.cfg.jitter_budget_us());
        }

        self.frame_number = self.frame_number.wrapping_add(1);
        let channel = hop_channel(self.frame_number, self.key);
        self.radio.set_channel(channel).map_err(LinkError::Radio)?;

        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = frame::encode_sync_beacon(
            &mut buf,
            self.key,
            self.frame_number,
            channel,
            self.active_count(),
        );
        self.radio.transmit(&buf[..n]).map_err(LinkError::Radio)?;
        self.radio.start_receive().map_err(LinkError::Radio)?;
        self.stats.beacons_sent += 1;

        // hold the schedule grid; only re-seed it after a long pause
        self.next_frame_us += self.cfg.superframe_us() as u64;
        if self.next_frame_us <= now_us {
            self.next_frame_us = now_us + self.cfg.superframe_us() as u64;
        }
        Ok(())
    }

    fn handle_uplink(
        &mut self,
        bytes: &[u8],
        meta: RxMeta,
        now_ms: u32,
    ) -> Result<(), LinkError<R::Error>> {
        let decoded = match Uplink::decode(bytes) {
            Ok(d) => d,
            Err(frame::FrameError::BadCrc) => {
                // never ACKed, never reinterpreted
                self.stats.crc_errors += 1;
                return Ok(());
            }
            Err(_) => {
                self.stats.rejected_frames += 1;
                return Ok(());
            }
        };

        match decoded {
            Uplink::Data(d) => self.handle_data(&d, meta, now_ms),
            // pairing frames outside pairing mode are protocol violations
            Uplink::PairReq(_) | Uplink::PairConfirm(_) => {
                self.stats.rejected_frames += 1;
                Ok(())
            }
        }
    }

    fn handle_data(
        &mut self,
        d: &frame::Data<'_>,
        meta: RxMeta,
        now_ms: u32,
    ) -> Result<(), LinkError<R::Error>> {
        let id = d.tracker_id();
        let idx = id.index();
        if idx >= self.cfg.n_max as usize || self.bindings[idx].is_none() {
            // inactive slot: drop silently, no ACK
            self.stats.rejected_frames += 1;
            return Ok(());
        }

        let rt = &mut self.runtime[idx];
        let expected = rt.sequence.wrapping_add(1);
        if rt.seen && d.seq() != expected {
            rt.packet_loss += 1;
            debug!(
                "receiver: slot {} seq {} (expected {})",
                id.raw(),
                d.seq(),
                expected
            );
        }
        let battery_changed = !rt.seen || rt.battery != d.battery() || rt.flags != d.flags();
        rt.sequence = d.seq();
        rt.seen = true;
        rt.rssi = meta.rssi;
        rt.last_seen_ms = now_ms;
        rt.battery = d.battery();
        rt.flags = d.flags();
        rt.last_quat = d.quat_q15();
        rt.last_accel = d.accel_fixed7();
        self.stats.frames_ok += 1;

        // ACK rides the tail of the same slot, piggybacking one command
        let cmd = core::mem::replace(&mut self.pending_cmd[idx], ACK_CMD_NONE);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = frame::encode_ack(&mut buf, id, d.seq(), cmd);
        self.radio.transmit(&buf[..n]).map_err(LinkError::Radio)?;
        self.radio.start_receive().map_err(LinkError::Radio)?;

        let quat = quant::pack_smallest_three(quant::q15_to_quat(d.quat_q15()));
        self.push_host(HostEvent::Rotation {
            id,
            quat,
            accel_fixed7: d.accel_fixed7(),
        });
        if battery_changed {
            let (battery, rssi, flags) = {
                let rt = &self.runtime[idx];
                (rt.battery, rt.rssi, rt.flags)
            };
            self.push_host(HostEvent::Status { id, battery, rssi, flags });
        }
        Ok(())
    }

    fn handle_pairing_rx(&mut self, bytes: &[u8], now_ms: u32) -> Result<(), LinkError<R::Error>> {
        let decoded = match Uplink::decode(bytes) {
            Ok(d) => d,
            Err(frame::FrameError::BadCrc) => {
                self.stats.crc_errors += 1;
                return Ok(());
            }
            Err(_) => {
                self.stats.rejected_frames += 1;
                return Ok(());
            }
        };

        match decoded {
            Uplink::PairReq(req) => {
                let mac = req.mac();
                if let Some(slot) =
                    self.pairing
                        .handle_request(mac, &self.bindings, self.cfg.n_max)
                {
                    let mut buf = [0u8; MAX_FRAME_LEN];
                    let n = frame::encode_pair_resp(&mut buf, slot, self.mac, self.key);
                    self.radio.transmit(&buf[..n]).map_err(LinkError::Radio)?;
                    self.radio.start_receive().map_err(LinkError::Radio)?;
                }
                Ok(())
            }
            Uplink::PairConfirm(c) => {
                let Some(done) = self.pairing.handle_confirm(c.slot(), c.mac()) else {
                    return Ok(());
                };
                let binding = Binding { mac: done.mac, paired_time_ms: now_ms };
                if let Err(e) = store::save_binding(&mut self.flash, done.slot, &binding) {
                    // the slot must not activate on a failed persist; the
                    // tracker re-pairs after its own timeout
                    error!("receiver: binding persist failed: {:?}", e);
                    self.exit_pairing()?;
                    return Err(LinkError::Flash(e));
                }
                self.bindings[done.slot.index()] = Some(binding);
                self.runtime[done.slot.index()] = TrackerRuntime::default();
                self.push_host(HostEvent::Paired { id: done.slot, mac: done.mac });
                info!("receiver: paired slot {}", done.slot.raw());
                self.exit_pairing()?;
                Ok(())
            }
            Uplink::Data(_) => {
                self.stats.rejected_frames += 1;
                Ok(())
            }
        }
    }

    fn exit_pairing(&mut self) -> Result<(), LinkError<R::Error>> {
        self.pairing.stop();
        self.state = ReceiverState::Normal;
        // re-seed the beacon grid; the channel is set by the next beacon
        self.next_frame_us = self.clock.now_us();
        Ok(())
    }

    fn push_host(&mut self, event: HostEvent) {
        if self.host.push_back(event).is_err() {
            // oldest motion update is the cheapest thing to lose
            let _ = self.host.pop_front();
            self.stats.host_drops += 1;
            let _ = self.host.push_back(event);
        }
    }
}
