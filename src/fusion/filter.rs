//! Per-axis gyro denoising chain.
//!
//! Order matters and is fixed: median (kills isolated spikes before they can
//! smear), moving average (whitens what's left), scalar Kalman (adaptive
//! low-pass whose measurement variance is the axis noise floor), deadzone
//! (clamps residue below the IMU's quantization).

/// Median over the last five samples; shorter while the window fills.
#[derive(Debug, Clone, Copy, Default)]
pub struct Median5 {
    buf: [f32; 5],
    len: u8,
    at: u8,
}

impl Median5 {
    pub fn push(&mut self, v: f32) -> f32 {
        self.buf[self.at as usize] = v;
        self.at = (self.at + 1) % 5;
        if self.len < 5 {
            self.len += 1;
        }

        let n = self.len as usize;
        let mut sorted = self.buf;
        // insertion sort over the filled prefix; n is at most five
        for i in 1..n {
            let mut j = i;
            while j > 0 && sorted[j - 1] > sorted[j] {
                sorted.swap(j - 1, j);
                j -= 1;
            }
        }
        if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) * 0.5
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Boxcar over the last four samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct MovingAvg4 {
    buf: [f32; 4],
    len: u8,
    at: u8,
    sum: f32,
}

impl MovingAvg4 {
    pub fn push(&mut self, v: f32) -> f32 {
        if self.len < 4 {
            self.len += 1;
        } else {
            self.sum -= self.buf[self.at as usize];
        }
        self.buf[self.at as usize] = v;
        self.at = (self.at + 1) % 4;
        self.sum += v;
        self.sum / self.len as f32
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One-dimensional Kalman filter on a scalar rate.
///
/// `r` starts at the configured default and is replaced by the measured
/// noise floor after a stationary calibration.
#[derive(Debug, Clone, Copy)]
pub struct Kalman1 {
    x: f32,
    p: f32,
    q: f32,
    r: f32,
}

impl Kalman1 {
    pub fn new(process_var: f32, measurement_var: f32) -> Self {
        Self { x: 0.0, p: 1.0, q: process_var, r: measurement_var }
    }

    pub fn update(&mut self, z: f32) -> f32 {
        self.p += self.q;
        let k = self.p / (self.p + self.r);
        self.x += k * (z - self.x);
        self.p *= 1.0 - k;
        self.x
    }

    /// Install the measured noise floor; floored so the gain never pins.
    pub fn set_measurement_var(&mut self, r: f32) {
        self.r = r.max(1e-10);
    }

    pub fn reset(&mut self) {
        self.x = 0.0;
        self.p = 1.0;
    }
}

/// The full chain for one gyro axis.
#[derive(Debug, Clone, Copy)]
pub struct AxisChain {
    median: Median5,
    avg: MovingAvg4,
    kalman: Kalman1,
    deadzone: f32,
}

impl AxisChain {
    pub fn new(process_var: f32, measurement_var: f32, deadzone: f32) -> Self {
        Self {
            median: Median5::default(),
            avg: MovingAvg4::default(),
            kalman: Kalman1::new(process_var, measurement_var),
            deadzone,
        }
    }

    pub fn filter(&mut self, v: f32) -> f32 {
        let v = self.median.push(v);
        let v = self.avg.push(v);
        let v = self.kalman.update(v);
        if libm::fabsf(v) < self.deadzone {
            0.0
        } else {
            v
        }
    }

    pub fn set_noise_floor(&mut self, variance: f32) {
        self.kalman.set_measurement_var(variance);
    }

    pub fn reset(&mut self) {
        self.median.reset();
        self.avg.reset();
        self.kalman.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_rejects_single_spike() {
        let mut m = Median5::default();
        for _ in 0..5 {
            m.push(1.0);
        }
        assert_eq!(m.push(100.0), 1.0);
    }

    #[test]
    fn moving_avg_settles_on_constant() {
        let mut a = MovingAvg4::default();
        let mut last = 0.0;
        for _ in 0..8 {
            last = a.push(2.5);
        }
        assert!((last - 2.5).abs() < 1e-6);
    }

    #[test]
    fn kalman_tracks_step_input() {
        let mut k = Kalman1::new(1e-4, 4e-4);
        let mut last = 0.0;
        for _ in 0..200 {
            last = k.update(1.0);
        }
        assert!((last - 1.0).abs() < 1e-2);
    }

    #[test]
    fn deadzone_clamps_residue() {
        let mut c = AxisChain::new(1e-2, 1e-6, 7e-5);
        let mut out = 1.0;
        for _ in 0..50 {
            out = c.filter(1e-5);
        }
        assert_eq!(out, 0.0);
    }
}
