//! Numeric wire encodings shared by the RF codec and the host codec.
//!
//! All three contracts are bit-exact: both ends of the link and the host
//! decoder reproduce them independently, so any change here is a protocol
//! break.

use modular_bitfield::prelude::*;

use crate::math::{inv_sqrt, Quat, Vec3};

/// Quaternion component to Q15: clamp to `[-1, 1]`, scale by 32767, truncate.
pub fn quat_to_q15(q: Quat) -> [i16; 4] {
    [to_q15(q.w), to_q15(q.x), to_q15(q.y), to_q15(q.z)]
}

pub fn q15_to_quat(v: [i16; 4]) -> Quat {
    Quat::new(from_q15(v[0]), from_q15(v[1]), from_q15(v[2]), from_q15(v[3]))
}

fn to_q15(c: f32) -> i16 {
    (c.clamp(-1.0, 1.0) * 32767.0) as i16
}

fn from_q15(v: i16) -> f32 {
    v as f32 / 32767.0
}

/// Acceleration in milli-g to the fixed-7 wire unit: `mg * 125525 / 100000`,
/// clamped to `i16`.
pub fn mg_to_fixed7(mg: i32) -> i16 {
    ((mg as i64 * 125_525) / 100_000).clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

/// Convenience over [`mg_to_fixed7`] for a g-unit float sample.
pub fn accel_g_to_fixed7(g: f32) -> i16 {
    mg_to_fixed7((g * 1000.0) as i32)
}

pub fn fixed7_to_g(v: i16) -> f32 {
    v as f32 / 1255.25
}

pub fn accel_to_fixed7(a: Vec3) -> [i16; 3] {
    [
        accel_g_to_fixed7(a.x),
        accel_g_to_fixed7(a.y),
        accel_g_to_fixed7(a.z),
    ]
}

/// Smallest-three quaternion word: `[index:2][a:10][b:10][c:10]` packed into
/// 32 bits, read as a little-endian integer.
///
/// Field order is lowest-bit-first, so `c` lands in bits 0..10 and the
/// dropped-component index in the top two.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PackedQuat {
    pub c: B10,
    pub b: B10,
    pub a: B10,
    pub largest: B2,
}

/// Compress a unit quaternion to the smallest-three word.
///
/// The largest-magnitude component is dropped (negating the whole quaternion
/// first if it is negative; `q` and `-q` are the same rotation) and the
/// remaining three are encoded as signed 10-bit values scaled by 512/32768.
pub fn pack_smallest_three(q: Quat) -> u32 {
    let comps = [q.w, q.x, q.y, q.z];
    let mut largest = 0usize;
    for (i, c) in comps.iter().enumerate() {
        if libm::fabsf(*c) > libm::fabsf(comps[largest]) {
            largest = i;
        }
    }

    let sign = if comps[largest] < 0.0 { -1.0 } else { 1.0 };
    let mut small = [0u16; 3];
    let mut n = 0;
    for (i, c) in comps.iter().enumerate() {
        if i == largest {
            continue;
        }
        small[n] = to_s10(*c * sign);
        n += 1;
    }

    let packed = PackedQuat::new()
        .with_largest(largest as u8)
        .with_a(small[0])
        .with_b(small[1])
        .with_c(small[2]);
    u32::from_le_bytes(packed.into_bytes())
}

/// Inverse of [`pack_smallest_three`]; the dropped component is rebuilt from
/// the unit-norm constraint and the result renormalized.
pub fn unpack_smallest_three(word: u32) -> Quat {
    let packed = PackedQuat::from_bytes(word.to_le_bytes());
    let small = [
        from_s10(packed.a()),
        from_s10(packed.b()),
        from_s10(packed.c()),
    ];

    let sum_sq = small[0] * small[0] + small[1] * small[1] + small[2] * small[2];
    let rebuilt = if sum_sq >= 1.0 { 0.0 } else { libm::sqrtf(1.0 - sum_sq) };

    let largest = packed.largest() as usize;
    let mut comps = [0.0f32; 4];
    let mut n = 0;
    for (i, c) in comps.iter_mut().enumerate() {
        if i == largest {
            *c = rebuilt;
        } else {
            *c = small[n];
            n += 1;
        }
    }

    let q = Quat::new(comps[0], comps[1], comps[2], comps[3]);
    let nsq = q.norm_sq();
    if nsq < 1e-12 {
        return Quat::IDENTITY;
    }
    q.scale(inv_sqrt(nsq))
}

/// Signed 10-bit field: scale by 512, truncate, clamp to `[-512, 511]`,
/// two's complement in the low ten bits.
fn to_s10(c: f32) -> u16 {
    let v = (c.clamp(-1.0, 1.0) * 512.0) as i32;
    (v.clamp(-512, 511) as u16) & 0x3FF
}

fn from_s10(raw: u16) -> f32 {
    let v = if raw & 0x200 != 0 {
        (raw | !0x3FF) as i16 as i32
    } else {
        raw as i32
    };
    v as f32 / 512.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q15_truncates_toward_zero() {
        assert_eq!(to_q15(1.0), 32767);
        assert_eq!(to_q15(-1.0), -32767);
        assert_eq!(to_q15(1.5), 32767);
        assert_eq!(to_q15(0.5), 16383);
        assert_eq!(to_q15(-0.5), -16383);
    }

    #[test]
    fn fixed7_matches_integer_formula() {
        assert_eq!(mg_to_fixed7(1000), 1255);
        assert_eq!(mg_to_fixed7(-1000), -1255);
        assert_eq!(mg_to_fixed7(100_000), i16::MAX);
        assert_eq!(mg_to_fixed7(-100_000), i16::MIN);
    }

    #[test]
    fn s10_round_trips_extremes() {
        assert_eq!(to_s10(-1.0), 0x200);
        assert_eq!(to_s10(1.0), 0x1FF);
        assert!((from_s10(to_s10(0.7071)) - 0.7071).abs() < 1.0 / 512.0 + 1e-6);
    }
}
