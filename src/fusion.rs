//! Tracker sensor-fusion pipeline.
//!
//! Per sample, in order: bias subtraction, temperature compensation, the
//! per-axis denoising chain, rest detection (with ZUPT and slow bias
//! learning), then the quaternion filter. The pipeline never reports errors
//! upstream — a skipped IMU read simply means no call, and degenerate math
//! resets only the state it ruined.

pub mod ahrs;
pub mod filter;

use crate::config::FusionConfig;
use crate::math::{Quat, Vec3};
use crate::store::FusionSnapshot;
use ahrs::Ahrs;
use filter::AxisChain;

use log::{debug, info};

/// What one fusion step hands to the MAC.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOutput {
    pub quat: Quat,
    /// Specific force minus gravity, body axes, g.
    pub linear_accel: Vec3,
    pub resting: bool,
}

/// Accumulator for the stationary calibration window.
#[derive(Debug, Clone, Copy)]
struct Calibration {
    target: u32,
    n: u32,
    sum: Vec3,
    sum_sq: Vec3,
    temp_sum: f32,
    temp_n: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct RestDetector {
    since_ms: Option<u32>,
    resting: bool,
}

pub struct FusionPipeline {
    cfg: FusionConfig,
    chains: [AxisChain; 3],
    ahrs: Ahrs,
    bias: Vec3,
    bias_calibrated: bool,
    temp_cal_c: Option<f32>,
    rest: RestDetector,
    calib: Option<Calibration>,
}

impl FusionPipeline {
    pub fn new(cfg: FusionConfig) -> Self {
        let chain = AxisChain::new(
            cfg.kalman_process_var,
            cfg.kalman_measurement_var,
            cfg.deadzone_rad_s,
        );
        Self {
            cfg,
            chains: [chain; 3],
            ahrs: Ahrs::new(cfg.tau_acc_s, cfg.tau_mag_s),
            bias: Vec3::ZERO,
            bias_calibrated: false,
            temp_cal_c: None,
            rest: RestDetector::default(),
            calib: None,
        }
    }

    pub fn quat(&self) -> Quat {
        self.ahrs.quat()
    }

    pub fn gyro_bias(&self) -> Vec3 {
        self.bias
    }

    pub fn is_resting(&self) -> bool {
        self.rest.resting
    }

    pub fn is_calibrating(&self) -> bool {
        self.calib.is_some()
    }

    /// Collect `samples` stationary samples; on completion the mean becomes
    /// the gyro bias and the per-axis variance the Kalman noise floor.
    pub fn begin_calibration(&mut self, samples: u32) {
        debug!("fusion: stationary calibration over {} samples", samples);
        self.calib = Some(Calibration {
            target: samples.max(1),
            n: 0,
            sum: Vec3::ZERO,
            sum_sq: Vec3::ZERO,
            temp_sum: 0.0,
            temp_n: 0,
        });
    }

    /// Re-seed attitude and bias from a persisted snapshot.
    pub fn restore(&mut self, snap: &FusionSnapshot) {
        self.ahrs.restore(snap.quat);
        self.bias = snap.gyro_bias;
        self.bias_calibrated = true;
    }

    pub fn snapshot(&self, save_time_ms: u32) -> FusionSnapshot {
        FusionSnapshot {
            save_time_ms,
            quat: self.ahrs.quat(),
            gyro_bias: self.bias,
            sleep_count: 0,
            wake_count: 0,
            total_runtime_ms: save_time_ms,
        }
    }

    /// One sample through the whole pipeline.
    pub fn update(
        &mut self,
        gyro: Vec3,
        accel: Vec3,
        mag: Option<Vec3>,
        temp_c: Option<f32>,
        now_ms: u32,
    ) -> FusionOutput {
        if self.feed_calibration(gyro, temp_c) {
            // hold attitude while the device is meant to sit still
            return FusionOutput {
                quat: self.ahrs.quat(),
                linear_accel: self.ahrs.linear_accel(accel),
                resting: true,
            };
        }

        let mut g = gyro;
        if self.bias_calibrated {
            g = g - self.bias;
        }
        if let (Some(coeff), Some(t), Some(t_cal)) = (self.cfg.temp_coeff, temp_c, self.temp_cal_c)
        {
            let drift = coeff * (t - t_cal);
            g = g - Vec3::new(drift, drift, drift);
        }

        let mut filtered = Vec3::new(
            self.chains[0].filter(g.x),
            self.chains[1].filter(g.y),
            self.chains[2].filter(g.z),
        );

        if self.detect_rest(g, accel, now_ms) {
            // ZUPT: the device is provably still, so integrate nothing and
            // let the bias estimate chase the raw reading
            filtered = Vec3::ZERO;
            self.bias = self.bias + (gyro - self.bias) * self.cfg.bias_alpha;
            self.bias_calibrated = true;
        }

        self.ahrs.update(filtered, accel, mag, self.cfg.dt());

        FusionOutput {
            quat: self.ahrs.quat(),
            linear_accel: self.ahrs.linear_accel(accel),
            resting: self.rest.resting,
        }
    }

    /// Returns true while a calibration window is absorbing the sample.
    fn feed_calibration(&mut self, gyro: Vec3, temp_c: Option<f32>) -> bool {
        let Some(c) = self.calib.as_mut() else {
            return false;
        };
        c.n += 1;
        c.sum = c.sum + gyro;
        c.sum_sq = c.sum_sq + Vec3::new(gyro.x * gyro.x, gyro.y * gyro.y, gyro.z * gyro.z);
        if let Some(t) = temp_c {
            c.temp_sum += t;
            c.temp_n += 1;
        }
        if c.n < c.target {
            return true;
        }

        let n = c.n as f32;
        let mean = c.sum * (1.0 / n);
        let var = Vec3::new(
            c.sum_sq.x / n - mean.x * mean.x,
            c.sum_sq.y / n - mean.y * mean.y,
            c.sum_sq.z / n - mean.z * mean.z,
        );
        self.bias = mean;
        self.bias_calibrated = true;
        self.chains[0].set_noise_floor(var.x);
        self.chains[1].set_noise_floor(var.y);
        self.chains[2].set_noise_floor(var.z);
        if c.temp_n > 0 {
            self.temp_cal_c = Some(c.temp_sum / c.temp_n as f32);
        }
        info!("fusion: calibration done over {} samples", c.n);
        self.calib = None;
        for chain in &mut self.chains {
            chain.reset();
        }
        true
    }

    /// Both magnitudes under threshold for the configured hold time declares
    /// rest; a single violating sample clears it instantly.
    fn detect_rest(&mut self, gyro: Vec3, accel: Vec3, now_ms: u32) -> bool {
        let still = gyro.norm() < self.cfg.rest_gyro_rad_s
            && libm::fabsf(accel.norm() - 1.0) < self.cfg.rest_accel_g;

        if !still {
            self.rest.since_ms = None;
            self.rest.resting = false;
            return false;
        }

        let since = *self.rest.since_ms.get_or_insert(now_ms);
        if now_ms.wrapping_sub(since) >= self.cfg.rest_time_ms {
            self.rest.resting = true;
        }
        self.rest.resting
    }
}
