//! Minimal rigid-transform math for the plugin surface.
//!
//! The script boundary traffics in plain arrays: positions as `[x, y, z]`,
//! quaternions as `[x, y, z, w]`, transforms as 3×4 row-major matrices of 12
//! values, Euler angles as intrinsic X-Y-Z rotations. Everything here is
//! `f64`; engines convert at their own boundary if they work in another
//! precision.

use serde::{Deserialize, Serialize};

/// Unit quaternion. Stored as scalar + vector; use the array helpers for the
/// `[x, y, z, w]` interface ordering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn from_xyzw(v: [f64; 4]) -> Self {
        Self {
            x: v[0],
            y: v[1],
            z: v[2],
            w: v[3],
        }
        .normalized()
    }

    pub fn to_xyzw(self) -> [f64; 4] {
        [self.x, self.y, self.z, self.w]
    }

    pub fn from_axis_angle(axis: [f64; 3], angle: f64) -> Self {
        let half = angle * 0.5;
        let (s, c) = half.sin_cos();
        let norm = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
        if norm < f64::EPSILON {
            return Self::IDENTITY;
        }
        Self {
            w: c,
            x: axis[0] / norm * s,
            y: axis[1] / norm * s,
            z: axis[2] / norm * s,
        }
    }

    /// Intrinsic X-Y-Z Euler angles (alpha, beta, gamma).
    pub fn from_euler(euler: [f64; 3]) -> Self {
        let qx = Self::from_axis_angle([1.0, 0.0, 0.0], euler[0]);
        let qy = Self::from_axis_angle([0.0, 1.0, 0.0], euler[1]);
        let qz = Self::from_axis_angle([0.0, 0.0, 1.0], euler[2]);
        qx.mul(qy).mul(qz)
    }

    pub fn to_euler(self) -> [f64; 3] {
        let m = self.to_matrix3();
        // r02 = sin(beta); gimbal lock when beta is at +-pi/2
        if m[0][2].abs() > 1.0 - 1e-9 {
            let beta = if m[0][2] > 0.0 {
                std::f64::consts::FRAC_PI_2
            } else {
                -std::f64::consts::FRAC_PI_2
            };
            [m[1][0].atan2(m[1][1]), beta, 0.0]
        } else {
            [
                (-m[1][2]).atan2(m[2][2]),
                m[0][2].asin(),
                (-m[0][1]).atan2(m[0][0]),
            ]
        }
    }

    pub fn normalized(self) -> Self {
        let n = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if n < f64::EPSILON {
            return Self::IDENTITY;
        }
        Self {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }

    pub fn conjugate(self) -> Self {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn mul(self, rhs: Self) -> Self {
        Self {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }

    pub fn rotate(self, v: [f64; 3]) -> [f64; 3] {
        // v' = v + 2w(q x v) + 2(q x (q x v))
        let qv = [self.x, self.y, self.z];
        let t = [
            2.0 * (qv[1] * v[2] - qv[2] * v[1]),
            2.0 * (qv[2] * v[0] - qv[0] * v[2]),
            2.0 * (qv[0] * v[1] - qv[1] * v[0]),
        ];
        [
            v[0] + self.w * t[0] + qv[1] * t[2] - qv[2] * t[1],
            v[1] + self.w * t[1] + qv[2] * t[0] - qv[0] * t[2],
            v[2] + self.w * t[2] + qv[0] * t[1] - qv[1] * t[0],
        ]
    }

    pub fn to_matrix3(self) -> [[f64; 3]; 3] {
        let (w, x, y, z) = (self.w, self.x, self.y, self.z);
        [
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - w * z),
                2.0 * (x * z + w * y),
            ],
            [
                2.0 * (x * y + w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - w * x),
            ],
            [
                2.0 * (x * z - w * y),
                2.0 * (y * z + w * x),
                1.0 - 2.0 * (x * x + y * y),
            ],
        ]
    }

    pub fn from_matrix3(m: [[f64; 3]; 3]) -> Self {
        // Shepperd's method: pick the largest diagonal term for stability.
        let trace = m[0][0] + m[1][1] + m[2][2];
        let q = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Self {
                w: 0.25 * s,
                x: (m[2][1] - m[1][2]) / s,
                y: (m[0][2] - m[2][0]) / s,
                z: (m[1][0] - m[0][1]) / s,
            }
        } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
            let s = (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.0;
            Self {
                w: (m[2][1] - m[1][2]) / s,
                x: 0.25 * s,
                y: (m[0][1] + m[1][0]) / s,
                z: (m[0][2] + m[2][0]) / s,
            }
        } else if m[1][1] > m[2][2] {
            let s = (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.0;
            Self {
                w: (m[0][2] - m[2][0]) / s,
                x: (m[0][1] + m[1][0]) / s,
                y: 0.25 * s,
                z: (m[1][2] + m[2][1]) / s,
            }
        } else {
            let s = (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.0;
            Self {
                w: (m[1][0] - m[0][1]) / s,
                x: (m[0][2] + m[2][0]) / s,
                y: (m[1][2] + m[2][1]) / s,
                z: 0.25 * s,
            }
        };
        q.normalized()
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Rigid transform: position plus unit-quaternion orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub orientation: Quaternion,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: [0.0; 3],
        orientation: Quaternion::IDENTITY,
    };

    pub fn new(position: [f64; 3], orientation: Quaternion) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// `self` applied first, then `rhs` in `self`'s frame.
    pub fn compose(self, rhs: Self) -> Self {
        let rotated = self.orientation.rotate(rhs.position);
        Self {
            position: [
                self.position[0] + rotated[0],
                self.position[1] + rotated[1],
                self.position[2] + rotated[2],
            ],
            orientation: self.orientation.mul(rhs.orientation),
        }
    }

    pub fn inverse(self) -> Self {
        let inv = self.orientation.conjugate();
        let p = inv.rotate(self.position);
        Self {
            position: [-p[0], -p[1], -p[2]],
            orientation: inv,
        }
    }

    /// 3×4 row-major matrix, rotation in the left 3×3, translation in the
    /// fourth column.
    pub fn to_matrix12(self) -> [f64; 12] {
        let m = self.orientation.to_matrix3();
        [
            m[0][0],
            m[0][1],
            m[0][2],
            self.position[0],
            m[1][0],
            m[1][1],
            m[1][2],
            self.position[1],
            m[2][0],
            m[2][1],
            m[2][2],
            self.position[2],
        ]
    }

    pub fn from_matrix12(v: [f64; 12]) -> Self {
        let m = [[v[0], v[1], v[2]], [v[4], v[5], v[6]], [v[8], v[9], v[10]]];
        Self {
            position: [v[3], v[7], v[11]],
            orientation: Quaternion::from_matrix3(m),
        }
    }

    pub fn distance_to(self, other: Self, metric: [f64; 4]) -> f64 {
        let dp = [
            (self.position[0] - other.position[0]) * metric[0],
            (self.position[1] - other.position[1]) * metric[1],
            (self.position[2] - other.position[2]) * metric[2],
        ];
        let dot = (self.orientation.w * other.orientation.w
            + self.orientation.x * other.orientation.x
            + self.orientation.y * other.orientation.y
            + self.orientation.z * other.orientation.z)
            .abs()
            .min(1.0);
        let angle = 2.0 * dot.acos();
        (dp[0] * dp[0] + dp[1] * dp[1] + dp[2] * dp[2] + (angle * metric[3]).powi(2)).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_3};

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn euler_round_trip() {
        let e = [0.3, -0.7, FRAC_PI_3];
        let q = Quaternion::from_euler(e);
        let back = q.to_euler();
        for i in 0..3 {
            assert_close(e[i], back[i]);
        }
    }

    #[test]
    fn matrix_round_trip() {
        let pose = Pose::new(
            [1.0, -2.0, 0.5],
            Quaternion::from_euler([0.1, 0.2, 0.3]),
        );
        let back = Pose::from_matrix12(pose.to_matrix12());
        for i in 0..3 {
            assert_close(pose.position[i], back.position[i]);
        }
        assert_close(pose.orientation.w.abs(), back.orientation.w.abs());
    }

    #[test]
    fn compose_inverse_is_identity() {
        let pose = Pose::new(
            [0.4, 0.1, -0.9],
            Quaternion::from_axis_angle([0.0, 1.0, 0.0], FRAC_PI_2),
        );
        let ident = pose.compose(pose.inverse());
        for i in 0..3 {
            assert_close(ident.position[i], 0.0);
        }
        assert_close(ident.orientation.w.abs(), 1.0);
    }

    #[test]
    fn rotate_matches_matrix() {
        let q = Quaternion::from_euler([0.2, 0.5, -0.4]);
        let v = [0.3, -1.2, 2.0];
        let m = q.to_matrix3();
        let by_matrix = [
            m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
            m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
            m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
        ];
        let by_quat = q.rotate(v);
        for i in 0..3 {
            assert_close(by_matrix[i], by_quat[i]);
        }
    }
}
