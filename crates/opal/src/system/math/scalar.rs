use seq_macro::seq;

use super::{Kernel, Matrix};

/// Reference kernel, one lane at a time.
#[derive(Debug, Clone, Copy)]
pub struct ScalarKernel;

impl Kernel for ScalarKernel {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn mult_matrix(&self, a: &Matrix, b: &Matrix) -> Matrix {
        let mut out = [[0.0; 4]; 4];
        seq! {
            I in 0..4 {
                seq! {
                    J in 0..4 {
                        out[I][J] = a[I][0] * b[0][J]
                            + a[I][1] * b[1][J]
                            + a[I][2] * b[2][J]
                            + a[I][3] * b[3][J];
                    }
                }
            }
        }

        out
    }

    fn transform_vector(&self, v: [f32; 3], m: &Matrix) -> [f32; 4] {
        let [x, y, z] = v;
        let mut out = [0.0; 4];
        seq! {
            J in 0..4 {
                out[J] = x * m[0][J] + y * m[1][J] + z * m[2][J] + m[3][J];
            }
        }

        out
    }

    fn inverse_transform(&self, v: [f32; 3], m: &Matrix) -> [f32; 3] {
        let [x, y, z] = v;
        let mut out = [0.0; 3];
        seq! {
            I in 0..3 {
                out[I] = m[I][0] * x + m[I][1] * y + m[I][2] * z;
            }
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::system::math::IDENTITY;

    #[test]
    fn translation_is_last_row() {
        let mut m = IDENTITY;
        m[3] = [10.0, 20.0, 30.0, 1.0];

        assert_eq!(
            ScalarKernel.transform_vector([1.0, 2.0, 3.0], &m),
            [11.0, 22.0, 33.0, 1.0]
        );
    }

    #[test]
    fn multiply_order() {
        let mut scale = IDENTITY;
        scale[0][0] = 2.0;
        let mut translate = IDENTITY;
        translate[3][0] = 5.0;

        // scale first, then translate
        let combined = ScalarKernel.mult_matrix(&scale, &translate);
        assert_eq!(ScalarKernel.transform_vector([1.0, 0.0, 0.0], &combined)[0], 7.0);
    }
}
