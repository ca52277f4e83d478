//! Dense host linear algebra on row-major `f64` square matrices.
//!
//! Only what the GPTQ update needs: a Cholesky factorization that reports
//! failure instead of producing NaNs, and the upper Cholesky factor of the
//! inverse of a positive definite matrix.

/// Lower Cholesky factor `L` with `a = L L^T`.
///
/// Returns `None` when a pivot is not strictly positive or not finite, which
/// is how an indefinite (or numerically singular) matrix shows up.
pub fn cholesky_lower(a: &[f64], n: usize) -> Option<Vec<f64>> {
    debug_assert_eq!(a.len(), n * n);
    let mut l = vec![0f64; n * n];
    for j in 0..n {
        let mut diag = a[j * n + j];
        for k in 0..j {
            diag -= l[j * n + k] * l[j * n + k];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return None;
        }
        let ljj = diag.sqrt();
        l[j * n + j] = ljj;

        for i in (j + 1)..n {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            l[i * n + j] = sum / ljj;
        }
    }
    Some(l)
}

/// Inverse of a lower triangular matrix with non-zero diagonal
pub fn invert_lower(l: &[f64], n: usize) -> Vec<f64> {
    let mut inv = vec![0f64; n * n];
    for col in 0..n {
        inv[col * n + col] = 1.0 / l[col * n + col];
        for i in (col + 1)..n {
            let mut sum = 0f64;
            for k in col..i {
                sum += l[i * n + k] * inv[k * n + col];
            }
            inv[i * n + col] = -sum / l[i * n + i];
        }
    }
    inv
}

/// `(L L^T)^-1` from the lower Cholesky factor `L`
pub fn cholesky_inverse(l: &[f64], n: usize) -> Vec<f64> {
    let linv = invert_lower(l, n);
    // (L L^T)^-1 = L^-T L^-1, and L^-1 is lower triangular
    let mut out = vec![0f64; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0f64;
            for k in i..n {
                sum += linv[k * n + i] * linv[k * n + j];
            }
            out[i * n + j] = sum;
            out[j * n + i] = sum;
        }
    }
    out
}

/// Upper factor `U` of `a^-1 = U^T U`, or `None` if `a` is not positive
/// definite.
pub fn inverse_upper_cholesky(a: &[f64], n: usize) -> Option<Vec<f64>> {
    let l = cholesky_lower(a, n)?;
    let inv = cholesky_inverse(&l, n);
    let l_inv = cholesky_lower(&inv, n)?;
    Some(transpose(&l_inv, n))
}

pub fn transpose(a: &[f64], n: usize) -> Vec<f64> {
    let mut t = vec![0f64; n * n];
    for i in 0..n {
        for j in 0..n {
            t[j * n + i] = a[i * n + j];
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matmul(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
        let mut c = vec![0f64; n * n];
        for i in 0..n {
            for k in 0..n {
                for j in 0..n {
                    c[i * n + j] += a[i * n + k] * b[k * n + j];
                }
            }
        }
        c
    }

    fn spd() -> Vec<f64> {
        vec![4.0, 2.0, 0.6, 2.0, 5.0, 1.0, 0.6, 1.0, 3.0]
    }

    #[test]
    fn test_cholesky_reconstructs() {
        let a = spd();
        let l = cholesky_lower(&a, 3).unwrap();
        let back = matmul(&l, &transpose(&l, 3), 3);
        for (x, y) in a.iter().zip(back.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cholesky_inverse_is_inverse() {
        let a = spd();
        let l = cholesky_lower(&a, 3).unwrap();
        let inv = cholesky_inverse(&l, 3);
        let eye = matmul(&a, &inv, 3);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((eye[i * 3 + j] - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_inverse_upper_cholesky() {
        let a = spd();
        let u = inverse_upper_cholesky(&a, 3).unwrap();
        // upper triangular
        assert_eq!(u[3], 0.0);
        assert_eq!(u[6], 0.0);
        assert_eq!(u[7], 0.0);

        let inv = matmul(&transpose(&u, 3), &u, 3);
        let eye = matmul(&a, &inv, 3);
        for i in 0..3 {
            assert!((eye[i * 3 + i] - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_indefinite_matrix_fails() {
        let a = vec![1.0, 1.05, 1.05, 1.0];
        assert!(cholesky_lower(&a, 2).is_none());
        assert!(cholesky_lower(&[0.0; 4], 2).is_none());
        assert!(cholesky_lower(&[f64::NAN, 0.0, 0.0, 1.0], 2).is_none());
    }
}
