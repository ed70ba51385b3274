//! Madgwick-style attitude filter.
//!
//! The quaternion integrates the corrected gyro rate; the accelerometer,
//! low-passed and normalized, pulls the estimate toward measured gravity
//! with proportional gain `2β` where `β = √(3/4)/τ`. A magnetometer, when
//! present, adds the same style of correction toward magnetic north. A slow
//! integral term on the gravity error adapts residual gyro drift once the
//! filter has seen enough samples to trust itself.

use crate::math::{inv_sqrt, Quat, Vec3};

/// √(3/4), the Madgwick gain shape factor.
const BETA_SHAPE: f32 = 0.866_025_4;

/// Samples before the drift integrator is allowed to act.
const DRIFT_WARMUP_SAMPLES: u32 = 200;

/// Integral gain of the drift adaptation.
const DRIFT_GAIN: f32 = 1e-4;

/// Squared-norm floor; below this the state is considered destroyed.
const NORM_FLOOR: f32 = 1e-10;

#[derive(Debug, Clone, Copy)]
pub struct Ahrs {
    q: Quat,
    accel_lp: Vec3,
    drift: Vec3,
    samples: u32,
    beta_acc: f32,
    beta_mag: f32,
    tau_acc: f32,
}

impl Ahrs {
    pub fn new(tau_acc_s: f32, tau_mag_s: f32) -> Self {
        Self {
            q: Quat::IDENTITY,
            accel_lp: Vec3::ZERO,
            drift: Vec3::ZERO,
            samples: 0,
            beta_acc: BETA_SHAPE / tau_acc_s,
            beta_mag: BETA_SHAPE / tau_mag_s,
            tau_acc: tau_acc_s,
        }
    }

    pub fn quat(&self) -> Quat {
        self.q
    }

    pub fn sample_count(&self) -> u32 {
        self.samples
    }

    /// Re-seed the attitude (wake from sleep with a persisted snapshot).
    pub fn restore(&mut self, q: Quat) {
        let nsq = q.norm_sq();
        self.q = if nsq < NORM_FLOOR { Quat::IDENTITY } else { q.scale(inv_sqrt(nsq)) };
        self.accel_lp = Vec3::ZERO;
        self.samples = 0;
    }

    /// One fusion step. `gyro` is the filtered, bias-corrected rate in
    /// rad/s; `accel` the specific force in g; `dt` the sample period.
    pub fn update(&mut self, gyro: Vec3, accel: Vec3, mag: Option<Vec3>, dt: f32) {
        // accelerometer low-pass, coefficient dt/(τ+dt)
        let alpha = dt / (self.tau_acc + dt);
        self.accel_lp = self.accel_lp + (accel - self.accel_lp) * alpha;

        let mut omega = gyro + self.drift;

        if let Some(a) = self.accel_lp.normalized() {
            let v = self.gravity_body();
            let err = a.cross(v);
            if self.samples >= DRIFT_WARMUP_SAMPLES {
                self.drift = self.drift + err * DRIFT_GAIN;
            }
            omega = omega + err * (2.0 * self.beta_acc);
        }

        if let Some(m) = mag.and_then(Vec3::normalized) {
            omega = omega + self.heading_error(m) * (2.0 * self.beta_mag);
        }

        // q̇ = ½ q ⊗ (0, ω)
        let qdot = self
            .q
            .mul(Quat::new(0.0, omega.x, omega.y, omega.z))
            .scale(0.5);
        self.q = self.q.add(qdot.scale(dt));

        let nsq = self.q.norm_sq();
        if nsq < NORM_FLOOR {
            self.q = Quat::IDENTITY;
            self.samples = 0;
            return;
        }
        self.q = self.q.scale(inv_sqrt(nsq));
        self.samples = self.samples.saturating_add(1);
    }

    /// Specific force minus attitude-rotated gravity, in body axes.
    pub fn linear_accel(&self, accel: Vec3) -> Vec3 {
        accel - self.gravity_body()
    }

    /// Expected gravity direction in the body frame for the current attitude.
    fn gravity_body(&self) -> Vec3 {
        let q = self.q;
        Vec3::new(
            2.0 * (q.x * q.z - q.w * q.y),
            2.0 * (q.w * q.x + q.y * q.z),
            q.w * q.w - q.x * q.x - q.y * q.y + q.z * q.z,
        )
    }

    /// Magnetometer error: distortion-tolerant north reference rebuilt in
    /// the earth frame, compared against the measurement in body axes.
    fn heading_error(&self, m: Vec3) -> Vec3 {
        let h = self.q.rotate(m);
        let bx = libm::sqrtf(h.x * h.x + h.y * h.y);
        let reference = Vec3::new(bx, 0.0, h.z);
        let expected = self.q.rotate_inv(reference);
        m.cross(expected)
    }
}
