//! Numeric kernel: fixed point decoding and the matrix/vector operations of the vertex pipeline.
//!
//! Matrices use the row vector convention of the guest: a point is transformed as `v · M`, and
//! `M[3]` holds the translation.

mod scalar;
mod vector;

use tracing::debug;

use crate::config::MathBackend;

pub use scalar::ScalarKernel;
pub use vector::GlamKernel;

pub type Matrix = [[f32; 4]; 4];

pub const IDENTITY: Matrix = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Size of a guest matrix in bytes.
pub const MATRIX_LEN: usize = 64;

/// Decodes a Q16.16 value from its integer and fractional halves.
#[inline(always)]
pub fn decode_q16(int: u16, frac: u16) -> f32 {
    let raw = ((int as u32) << 16) | frac as u32;
    raw as i32 as f32 / 65536.0
}

/// Encodes a value as Q16.16, rounding to nearest, returning the integer and fractional halves.
#[inline(always)]
pub fn encode_q16(value: f32) -> (u16, u16) {
    let raw = (value * 65536.0).round() as i32;
    ((raw >> 16) as u16, raw as u16)
}

/// Decodes a guest matrix: sixteen big endian integer halves followed by sixteen fractional
/// halves, in row major order.
pub fn decode_matrix(bytes: &[u8; MATRIX_LEN]) -> Matrix {
    let half = |index: usize| u16::from_be_bytes([bytes[2 * index], bytes[2 * index + 1]]);

    let mut out = [[0.0; 4]; 4];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            let index = i * 4 + j;
            *value = decode_q16(half(index), half(16 + index));
        }
    }

    out
}

/// Encodes a matrix into the guest layout.
pub fn encode_matrix(matrix: &Matrix) -> [u8; MATRIX_LEN] {
    let mut out = [0; MATRIX_LEN];
    for (i, row) in matrix.iter().enumerate() {
        for (j, value) in row.iter().enumerate() {
            let index = i * 4 + j;
            let (int, frac) = encode_q16(*value);
            out[2 * index..][..2].copy_from_slice(&int.to_be_bytes());
            out[32 + 2 * index..][..2].copy_from_slice(&frac.to_be_bytes());
        }
    }

    out
}

/// Matrix and vector operations used by the vertex pipeline.
pub trait Kernel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Returns `a · b`.
    fn mult_matrix(&self, a: &Matrix, b: &Matrix) -> Matrix;

    /// Replaces `a` with `b · a`.
    fn mult_matrix_in_place(&self, a: &mut Matrix, b: &Matrix) {
        *a = self.mult_matrix(b, a);
    }

    /// Transforms the point `v` (with `w = 1`) by `m`.
    fn transform_vector(&self, v: [f32; 3], m: &Matrix) -> [f32; 4];

    /// Transforms the direction `v` by the transpose of the upper 3x3 of `m`, without
    /// normalizing.
    fn inverse_transform(&self, v: [f32; 3], m: &Matrix) -> [f32; 3];

    fn dot(&self, a: [f32; 3], b: [f32; 3]) -> f32 {
        a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
    }

    /// Normalizes `v`. A zero length vector is returned unchanged.
    fn normalize(&self, v: [f32; 3]) -> [f32; 3] {
        let len = self.dot(v, v);
        if len == 0.0 {
            return v;
        }

        let len = len.sqrt();
        [v[0] / len, v[1] / len, v[2] / len]
    }

    /// Transforms the direction `v` by the transpose of the upper 3x3 of `m` and renormalizes.
    fn inverse_transform_normalize(&self, v: [f32; 3], m: &Matrix) -> [f32; 3] {
        self.normalize(self.inverse_transform(v, m))
    }

    /// Transforms the direction `v` by the upper 3x3 of `m` and renormalizes.
    fn transform_direction_normalize(&self, v: [f32; 3], m: &Matrix) -> [f32; 3] {
        let [x, y, z] = v;
        let out = [
            x * m[0][0] + y * m[1][0] + z * m[2][0],
            x * m[0][1] + y * m[1][1] + z * m[2][1],
            x * m[0][2] + y * m[1][2] + z * m[2][2],
        ];
        self.normalize(out)
    }

    /// Transforms a batch of points in place. The `w` component of each input is ignored.
    fn transform_vertices(&self, m: &Matrix, positions: &mut [[f32; 4]]) {
        for p in positions {
            *p = self.transform_vector([p[0], p[1], p[2]], m);
        }
    }

    /// Inverse transforms and renormalizes a batch of directions in place.
    fn inverse_transform_normalize_batch(&self, m: &Matrix, normals: &mut [[f32; 3]]) {
        for n in normals {
            *n = self.inverse_transform_normalize(*n, m);
        }
    }
}

static SCALAR: ScalarKernel = ScalarKernel;
static VECTOR: GlamKernel = GlamKernel;

/// Whether the vector kernel is backed by SIMD instructions on this host.
pub fn vector_available() -> bool {
    cfg!(any(
        all(target_arch = "x86_64", target_feature = "sse2"),
        all(target_arch = "aarch64", target_feature = "neon"),
    ))
}

/// Resolves the kernel to use for the whole session.
pub fn select(backend: MathBackend) -> &'static dyn Kernel {
    let kernel: &'static dyn Kernel = match backend {
        MathBackend::Scalar => &SCALAR,
        MathBackend::Vector => &VECTOR,
        MathBackend::Auto if vector_available() => &VECTOR,
        MathBackend::Auto => &SCALAR,
    };

    debug!(kernel = kernel.name(), "selected numeric kernel");
    kernel
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    const EPSILON: f32 = 1e-5;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() <= EPSILON * a.abs().max(b.abs()).max(1.0)
    }

    fn matrix() -> impl Strategy<Value = Matrix> {
        prop::array::uniform4(prop::array::uniform4(-100.0f32..100.0))
    }

    fn vec3() -> impl Strategy<Value = [f32; 3]> {
        prop::array::uniform3(-1000.0f32..1000.0)
    }

    #[test]
    fn identity_from_guest_layout() {
        let mut bytes = [0u8; MATRIX_LEN];
        for i in 0..4 {
            bytes[2 * (i * 4 + i) + 1] = 1;
        }

        assert_eq!(decode_matrix(&bytes), IDENTITY);
        assert_eq!(encode_matrix(&IDENTITY), bytes);
    }

    #[test]
    fn direction_ignores_translation() {
        let mut m = IDENTITY;
        m[3] = [5.0, 6.0, 7.0, 1.0];
        m[0][1] = 1.0;

        let out = SCALAR.transform_direction_normalize([3.0, 0.0, 0.0], &m);
        let half = 1.0 / 2.0f32.sqrt();
        assert!(close(out[0], half) && close(out[1], half) && out[2] == 0.0);
    }

    #[test]
    fn zero_vector_is_unchanged() {
        assert_eq!(SCALAR.normalize([0.0; 3]), [0.0; 3]);
        assert_eq!(VECTOR.normalize([0.0; 3]), [0.0; 3]);
    }

    proptest! {
        #[test]
        fn q16_roundtrip(raw in -(1i32 << 24)..=(1i32 << 24)) {
            let value = decode_q16((raw >> 16) as u16, raw as u16);
            let (int, frac) = encode_q16(value);
            prop_assert_eq!((((int as u32) << 16) | frac as u32) as i32, raw);
        }

        #[test]
        fn q16_monotonic(a: i32, b: i32) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo = decode_q16((lo >> 16) as u16, lo as u16);
            let hi = decode_q16((hi >> 16) as u16, hi as u16);
            prop_assert!(lo <= hi);
        }

        #[test]
        fn normalize_is_idempotent(v in vec3()) {
            for kernel in [&SCALAR as &dyn Kernel, &VECTOR] {
                let once = kernel.normalize(v);
                let twice = kernel.normalize(once);
                for i in 0..3 {
                    prop_assert!(close(once[i], twice[i]));
                }
            }
        }

        #[test]
        fn kernels_agree_on_multiply(a in matrix(), b in matrix()) {
            let scalar = SCALAR.mult_matrix(&a, &b);
            let vector = VECTOR.mult_matrix(&a, &b);
            for i in 0..4 {
                for j in 0..4 {
                    prop_assert!((scalar[i][j] - vector[i][j]).abs() <= 1e-5 * 4e4);
                }
            }
        }

        #[test]
        fn batched_matches_scalar(m in matrix(), points in prop::collection::vec(vec3(), 0..32)) {
            let mut batch: Vec<[f32; 4]> = points.iter().map(|p| [p[0], p[1], p[2], 0.0]).collect();
            VECTOR.transform_vertices(&m, &mut batch);

            for (point, batched) in points.iter().zip(&batch) {
                let single = SCALAR.transform_vector(*point, &m);
                for i in 0..4 {
                    prop_assert!((single[i] - batched[i]).abs() <= 1e-5 * 4e5);
                }
            }

            let mut normals = points.clone();
            VECTOR.inverse_transform_normalize_batch(&m, &mut normals);
            for (point, batched) in points.iter().zip(&normals) {
                let single = SCALAR.inverse_transform_normalize(*point, &m);
                for i in 0..3 {
                    prop_assert!((single[i] - batched[i]).abs() <= 1e-4);
                }
            }
        }
    }
}
