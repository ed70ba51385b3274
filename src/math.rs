//! Small fixed-size vector/quaternion arithmetic for the fusion pipeline.

use core::ops::{Add, Mul, Neg, Sub};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Vec3 { x, y, z }
    }

    pub fn dot(self, o: Vec3) -> f32 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }

    pub fn cross(self, o: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * o.z - self.z * o.y,
            y: self.z * o.x - self.x * o.z,
            z: self.x * o.y - self.y * o.x,
        }
    }

    pub fn norm_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn norm(self) -> f32 {
        libm::sqrtf(self.norm_sq())
    }

    /// Unit vector, or `None` when the norm is too small to divide by.
    pub fn normalized(self) -> Option<Vec3> {
        let n = self.norm_sq();
        if n < 1e-12 {
            return None;
        }
        Some(self * inv_sqrt(n))
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;
    fn mul(self, s: f32) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

/// Unit quaternion, scalar-first. Attitude is body-to-earth.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Quat { w, x, y, z }
    }

    pub fn norm_sq(self) -> f32 {
        self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z
    }

    pub fn conj(self) -> Quat {
        Quat::new(self.w, -self.x, -self.y, -self.z)
    }

    pub fn dot(self, o: Quat) -> f32 {
        self.w * o.w + self.x * o.x + self.y * o.y + self.z * o.z
    }

    /// Hamilton product.
    pub fn mul(self, o: Quat) -> Quat {
        Quat {
            w: self.w * o.w - self.x * o.x - self.y * o.y - self.z * o.z,
            x: self.w * o.x + self.x * o.w + self.y * o.z - self.z * o.y,
            y: self.w * o.y - self.x * o.z + self.y * o.w + self.z * o.x,
            z: self.w * o.z + self.x * o.y - self.y * o.x + self.z * o.w,
        }
    }

    /// Rotate a body-frame vector into the earth frame.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = self.mul(Quat::new(0.0, v.x, v.y, v.z)).mul(self.conj());
        Vec3::new(p.x, p.y, p.z)
    }

    /// Rotate an earth-frame vector into the body frame.
    pub fn rotate_inv(self, v: Vec3) -> Vec3 {
        self.conj().rotate(v)
    }

    /// Scale every component; used for integration steps and renormalization.
    pub fn scale(self, s: f32) -> Quat {
        Quat::new(self.w * s, self.x * s, self.y * s, self.z * s)
    }

    pub fn add(self, o: Quat) -> Quat {
        Quat::new(self.w + o.w, self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

/// Fast reciprocal square root: magic-constant bit shift plus two Newton
/// steps. Relative error stays under 5e-6, tight enough that a renormalized
/// quaternion holds `|‖q‖ − 1| < 1e-4`.
pub fn inv_sqrt(x: f32) -> f32 {
    let half = 0.5 * x;
    let mut y = f32::from_bits(0x5f37_59df - (x.to_bits() >> 1));
    y = y * (1.5 - half * y * y);
    y = y * (1.5 - half * y * y);
    y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inv_sqrt_close_to_exact() {
        for v in [0.25f32, 0.9, 1.0, 2.0, 100.0, 40000.0] {
            let exact = 1.0 / libm::sqrtf(v);
            let fast = inv_sqrt(v);
            assert!((fast - exact).abs() / exact < 5e-6, "v={v}");
        }
    }

    #[test]
    fn rotate_round_trip() {
        // 90 degrees about z
        let s = libm::sqrtf(0.5);
        let q = Quat::new(s, 0.0, 0.0, s);
        let v = Vec3::new(1.0, 0.0, 0.0);
        let r = q.rotate(v);
        assert!((r.x).abs() < 1e-6 && (r.y - 1.0).abs() < 1e-6);
        let b = q.rotate_inv(r);
        assert!((b.x - 1.0).abs() < 1e-6 && b.y.abs() < 1e-6);
    }
}
