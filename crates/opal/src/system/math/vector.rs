use glam::{Mat4, Vec3, Vec4};

use super::{Kernel, Matrix};

/// SIMD kernel backed by [`glam`].
///
/// Guest matrices are row vector matrices, so loading their rows as glam columns yields the
/// transpose, which is exactly the column vector matrix glam expects.
#[derive(Debug, Clone, Copy)]
pub struct GlamKernel;

#[inline(always)]
fn load(m: &Matrix) -> Mat4 {
    Mat4::from_cols_array_2d(m)
}

impl Kernel for GlamKernel {
    fn name(&self) -> &'static str {
        "glam"
    }

    fn mult_matrix(&self, a: &Matrix, b: &Matrix) -> Matrix {
        // (a · b)ᵀ = bᵀ · aᵀ
        (load(b) * load(a)).to_cols_array_2d()
    }

    fn transform_vector(&self, v: [f32; 3], m: &Matrix) -> [f32; 4] {
        (load(m) * Vec4::new(v[0], v[1], v[2], 1.0)).to_array()
    }

    fn inverse_transform(&self, v: [f32; 3], m: &Matrix) -> [f32; 3] {
        let v = Vec3::from_array(v);
        let row = |i: usize| Vec3::new(m[i][0], m[i][1], m[i][2]);
        [row(0).dot(v), row(1).dot(v), row(2).dot(v)]
    }

    fn transform_vertices(&self, m: &Matrix, positions: &mut [[f32; 4]]) {
        let m = load(m);
        for p in positions {
            *p = (m * Vec4::new(p[0], p[1], p[2], 1.0)).to_array();
        }
    }
}
