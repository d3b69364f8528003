use micromath::F32Ext;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

impl Quaternion {
    /// Unit quaternion from its vector part, taking `w >= 0`.
    pub fn from_vector(x: f32, y: f32, z: f32) -> Self {
        let magnitude = (x * x + y * y + z * z).min(1.0);
        Self {
            w: libm::sqrtf(1.0 - magnitude),
            x,
            y,
            z,
        }
    }

    pub fn norm(&self) -> f32 {
        libm::sqrtf(self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z)
    }

    pub fn is_finite(&self) -> bool {
        self.w.is_finite() && self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Same rotation with `w >= 0`.
    pub fn canonical(self) -> Self {
        if self.w < 0.0 {
            Self {
                w: -self.w,
                x: -self.x,
                y: -self.y,
                z: -self.z,
            }
        } else {
            self
        }
    }

    /// Rotate (x, y, z) from BODY frame to EARTH frame: q * v * q_conj
    pub fn rotate(&self, x: f32, y: f32, z: f32) -> (f32, f32, f32) {
        let q0 = self.w;
        let q1 = self.x;
        let q2 = self.y;
        let q3 = self.z;

        let q00 = q0 * q0;
        let q11 = q1 * q1;
        let q22 = q2 * q2;
        let q33 = q3 * q3;

        let x_out = x * (q00 + q11 - q22 - q33)
            + y * (2. * (q1 * q2 - q0 * q3))
            + z * (2. * (q1 * q3 + q0 * q2));
        let y_out = x * (2. * (q1 * q2 + q0 * q3))
            + y * (q00 - q11 + q22 - q33)
            + z * (2. * (q2 * q3 - q0 * q1));
        let z_out = x * (2. * (q1 * q3 - q0 * q2))
            + y * (2. * (q2 * q3 + q0 * q1))
            + z * (q00 - q11 - q22 + q33);

        (x_out, y_out, z_out)
    }
}

/// Mahony complementary filter, gyro + accelerometer only.
pub struct Mahony {
    // PI constants
    kp: f32,
    ki: f32,

    // Integral error
    ix: f32,
    iy: f32,
    iz: f32,

    pub q: Quaternion,
}

impl Default for Mahony {
    fn default() -> Self {
        Self::new()
    }
}

impl Mahony {
    pub fn new() -> Self {
        Self {
            kp: 2.0,
            ki: 0.005,
            ix: 0.0,
            iy: 0.0,
            iz: 0.0,
            q: Quaternion::default(),
        }
    }

    /// `g*` in rad/s, `a*` in any unit (normalised here).
    pub fn update(&mut self, dt: f32, gx: f32, gy: f32, gz: f32, ax: f32, ay: f32, az: f32) {
        let mut q0 = self.q.w;
        let mut q1 = self.q.x;
        let mut q2 = self.q.y;
        let mut q3 = self.q.z;

        // Normalise accelerometer measurement
        let mut recip_norm = ax * ax + ay * ay + az * az;
        if recip_norm == 0.0 {
            return;
        }
        recip_norm = recip_norm.sqrt().recip();
        let ax = ax * recip_norm;
        let ay = ay * recip_norm;
        let az = az * recip_norm;

        // Estimated direction of gravity
        let halfvx = q1 * q3 - q0 * q2;
        let halfvy = q0 * q1 + q2 * q3;
        let halfvz = q0 * q0 - 0.5 + q3 * q3;

        // Error is cross product between estimated and measured direction of gravity
        let halfex = ay * halfvz - az * halfvy;
        let halfey = az * halfvx - ax * halfvz;
        let halfez = ax * halfvy - ay * halfvx;

        if self.ki > 0.0 {
            self.ix += self.ki * halfex * dt;
            self.iy += self.ki * halfey * dt;
            self.iz += self.ki * halfez * dt;
        } else {
            self.ix = 0.0;
            self.iy = 0.0;
            self.iz = 0.0;
        }

        // Apply proportional feedback
        let gx = gx + (self.kp * halfex + self.ix);
        let gy = gy + (self.kp * halfey + self.iy);
        let gz = gz + (self.kp * halfez + self.iz);

        // Integrate rate of change of quaternion
        let gx = gx * (0.5 * dt);
        let gy = gy * (0.5 * dt);
        let gz = gz * (0.5 * dt);

        let qa = q0;
        let qb = q1;
        let qc = q2;
        q0 += -qb * gx - qc * gy - q3 * gz;
        q1 += qa * gx + qc * gz - q3 * gy;
        q2 += qa * gy - qb * gz + q3 * gx;
        q3 += qa * gz + qb * gy - qc * gx;

        // Normalise quaternion
        recip_norm = q0 * q0 + q1 * q1 + q2 * q2 + q3 * q3;
        recip_norm = recip_norm.sqrt().recip();
        self.q.w = q0 * recip_norm;
        self.q.x = q1 * recip_norm;
        self.q.y = q2 * recip_norm;
        self.q.z = q3 * recip_norm;
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn rotates_about_x() {
        let half = core::f32::consts::FRAC_PI_4;
        let q = Quaternion { w: half.cos(), x: half.sin(), y: 0.0, z: 0.0 };
        let (x, y, z) = q.rotate(0.0, 1.0, 0.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(z, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn vector_part_reconstructs_unit_quaternion() {
        let q = Quaternion::from_vector(0.6, 0.0, 0.0);
        assert_abs_diff_eq!(q.w, 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(q.norm(), 1.0, epsilon = 1e-6);

        // Slightly over unit length clamps to w = 0
        assert_eq!(Quaternion::from_vector(0.8, 0.7, 0.0).w, 0.0);
    }

    #[test]
    fn canonical_has_non_negative_w() {
        let q = Quaternion { w: -0.5, x: 0.5, y: -0.5, z: 0.5 }.canonical();
        assert_eq!(q, Quaternion { w: 0.5, x: -0.5, y: 0.5, z: -0.5 });
    }

    #[test]
    fn level_and_still_stays_identity() {
        let mut ahrs = Mahony::new();
        for _ in 0..100 {
            ahrs.update(0.05, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        }
        assert_abs_diff_eq!(ahrs.q.w, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn converges_to_tilt() {
        let mut ahrs = Mahony::new();
        let tilt = 0.5f32;
        let (ay, az) = (tilt.sin(), tilt.cos());
        for _ in 0..2000 {
            ahrs.update(0.01, 0.0, 0.0, 0.0, 0.0, ay, az);
        }
        let (_, _, z) = ahrs.q.rotate(0.0, ay, az);
        assert_abs_diff_eq!(z, 1.0, epsilon = 0.02);
    }
}
