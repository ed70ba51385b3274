//! Link and fusion tunables.
//!
//! Everything a product build may want to move lives here, with the shipped
//! defaults collected in [`recommended`]. Timing fields are split between
//! milliseconds (wall-clock deadlines: pairing, re-sync) and microseconds
//! (superframe phase, which is scheduled against the radio's µs clock).

use crate::MAX_TRACKERS;

/// Shipping defaults.
pub mod recommended {
    /// Active trackers served per receiver.
    pub const N_MAX: u8 = 8;

    /// Channel both peers tune for enrollment. Outside the hop whitelist.
    pub const PAIRING_CHANNEL: u8 = 37;

    /// Tracker gives up on a pairing session after this long.
    pub const PAIRING_TIMEOUT_TRACKER_MS: u32 = 5_000;

    /// Receiver stays in pairing mode this long waiting for a tracker.
    pub const PAIRING_TIMEOUT_RECEIVER_MS: u32 = 30_000;

    /// Gap between repeated pairing requests.
    pub const PAIR_REQUEST_PERIOD_MS: u32 = 500;

    /// Superframe length. One beacon plus one slot per tracker fits inside.
    pub const SYNC_INTERVAL_MS: u32 = 5;

    /// Time reserved at superframe offset zero for the sync beacon.
    pub const BEACON_WINDOW_US: u32 = 500;

    /// How long a tracker keeps RX open for the slot-tail ACK.
    pub const ACK_WAIT_US: u32 = 250;

    /// Radio warm-up lead before a slot opens.
    pub const WAKE_EARLY_US: u32 = 500;

    /// Per-channel listen time while scanning for sync.
    pub const SYNC_DWELL_MS: u32 = 10;

    /// Consecutive beacon misses ridden out on the free-running local clock.
    pub const BEACON_MISS_TOLERANCE: u32 = 3;

    /// Consecutive beacon misses that force a full re-scan.
    pub const N_MISS_MAX: u32 = 50;

    /// IMU output data rate.
    pub const SAMPLE_RATE_HZ: u32 = 200;

    /// Gravity-correction time constant, seconds.
    pub const TAU_ACC_S: f32 = 2.0;

    /// Heading-correction time constant, seconds.
    pub const TAU_MAG_S: f32 = 5.0;

    /// Gyro magnitude below which the device may be at rest, rad/s.
    pub const REST_GYRO_RAD_S: f32 = 0.02;

    /// Deviation of |accel| from 1 g below which the device may be at rest.
    pub const REST_ACCEL_G: f32 = 0.05;

    /// Both rest conditions must hold this long before ZUPT engages.
    pub const REST_TIME_MS: u32 = 1_500;

    /// Per-sample pull of the bias estimate toward the raw reading at rest.
    pub const BIAS_ALPHA: f32 = 1e-3;

    /// Output clamp below the IMU quantization floor, rad/s.
    pub const GYRO_DEADZONE_RAD_S: f32 = 7.0e-5;

    /// Scalar Kalman process variance for the gyro chain.
    pub const KALMAN_PROCESS_VAR: f32 = 1e-4;

    /// Measurement variance before a stationary calibration refines it.
    pub const KALMAN_MEASUREMENT_VAR: f32 = 4e-4;

    /// Minimum spacing of fusion-snapshot flash writes.
    pub const SNAPSHOT_MIN_INTERVAL_MS: u32 = 5_000;
}

/// MAC-layer configuration, shared by both roles.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Slots served per superframe; at most [`MAX_TRACKERS`].
    pub n_max: u8,
    pub pairing_channel: u8,
    pub pairing_timeout_tracker_ms: u32,
    pub pairing_timeout_receiver_ms: u32,
    pub pair_request_period_ms: u32,
    pub sync_interval_ms: u32,
    pub beacon_window_us: u32,
    pub ack_wait_us: u32,
    pub wake_early_us: u32,
    pub sync_dwell_ms: u32,
    pub beacon_miss_tolerance: u32,
    pub miss_limit: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            n_max: recommended::N_MAX,
            pairing_channel: recommended::PAIRING_CHANNEL,
            pairing_timeout_tracker_ms: recommended::PAIRING_TIMEOUT_TRACKER_MS,
            pairing_timeout_receiver_ms: recommended::PAIRING_TIMEOUT_RECEIVER_MS,
            pair_request_period_ms: recommended::PAIR_REQUEST_PERIOD_MS,
            sync_interval_ms: recommended::SYNC_INTERVAL_MS,
            beacon_window_us: recommended::BEACON_WINDOW_US,
            ack_wait_us: recommended::ACK_WAIT_US,
            wake_early_us: recommended::WAKE_EARLY_US,
            sync_dwell_ms: recommended::SYNC_DWELL_MS,
            beacon_miss_tolerance: recommended::BEACON_MISS_TOLERANCE,
            miss_limit: recommended::N_MISS_MAX,
        }
    }
}

impl LinkConfig {
    pub const fn superframe_us(&self) -> u32 {
        self.sync_interval_ms * 1_000
    }

    /// Width of one tracker slot, beacon window excluded.
    pub const fn slot_us(&self) -> u32 {
        (self.superframe_us() - self.beacon_window_us) / self.n_max as u32
    }

    /// Offset of slot `i`'s opening edge from the superframe start.
    pub const fn slot_offset_us(&self, slot: u8) -> u32 {
        self.beacon_window_us + self.slot_us() * slot as u32
    }

    /// Beacon jitter budget; exceeding it is logged by the receiver.
    pub const fn jitter_budget_us(&self) -> u32 {
        self.slot_us() / 4
    }

    pub fn validate(&self) -> bool {
        self.n_max >= 1
            && (self.n_max as usize) <= MAX_TRACKERS
            && self.beacon_window_us < self.superframe_us()
            && self.slot_us() > self.ack_wait_us
    }
}

/// Fusion-pipeline configuration (tracker only).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    pub sample_rate_hz: u32,
    pub tau_acc_s: f32,
    pub tau_mag_s: f32,
    pub rest_gyro_rad_s: f32,
    pub rest_accel_g: f32,
    pub rest_time_ms: u32,
    pub bias_alpha: f32,
    pub deadzone_rad_s: f32,
    pub kalman_process_var: f32,
    pub kalman_measurement_var: f32,
    /// Per-degree gyro drift, rad/s/°C; `None` disables compensation.
    pub temp_coeff: Option<f32>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: recommended::SAMPLE_RATE_HZ,
            tau_acc_s: recommended::TAU_ACC_S,
            tau_mag_s: recommended::TAU_MAG_S,
            rest_gyro_rad_s: recommended::REST_GYRO_RAD_S,
            rest_accel_g: recommended::REST_ACCEL_G,
            rest_time_ms: recommended::REST_TIME_MS,
            bias_alpha: recommended::BIAS_ALPHA,
            deadzone_rad_s: recommended::GYRO_DEADZONE_RAD_S,
            kalman_process_var: recommended::KALMAN_PROCESS_VAR,
            kalman_measurement_var: recommended::KALMAN_MEASUREMENT_VAR,
            temp_coeff: None,
        }
    }
}

impl FusionConfig {
    pub fn dt(&self) -> f32 {
        1.0 / self.sample_rate_hz as f32
    }
}
