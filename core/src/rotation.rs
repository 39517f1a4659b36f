//! Symbolic rotation and manifold helpers for error-state filter models.
//!
//! Orientation states are carried as full 3x3 direction cosine matrices, while
//! their error states live in the 3-dimensional tangent space. The pair
//! [`boxplus_rotation`] / [`boxminus_rotation`] maps between the two:
//!
//! - retraction: `R ⊞ δ = R·(I + hat(δ))`, the first-order exponential map;
//! - local coordinates: `R₂ ⊟ R₁ = inv_skew((D - Dᵀ)/2)` with `D = R₁ᵀ·R₂`,
//!   the antisymmetric projection of the relative rotation.
//!
//! For small `δ`, `(R ⊞ δ) ⊟ R = δ + O(‖δ‖²)`, which is exactly the
//! consistency the error-state Jacobians rely on.
//!
//! All functions build expressions in the active trace; see [`crate::expr`].

use crate::expr::{SymMatrix, horzcat, vertcat};

/// Skew-symmetric (cross-product) matrix of a 3-vector:
///
/// ```text
///            [  0  -v2   v1 ]
/// hat(v) =   [  v2   0  -v0 ]
///            [ -v1   v0   0 ]
/// ```
///
/// satisfying `hat(v)·w = v × w`.
pub fn skew_symmetric(v: &SymMatrix) -> SymMatrix {
    assert_eq!(v.shape(), (3, 1), "skew_symmetric expects a 3x1 vector");
    let (v0, v1, v2) = (v.element(0, 0), v.element(1, 0), v.element(2, 0));
    let zero = SymMatrix::zeros(1, 1);
    vertcat(&[
        horzcat(&[zero.clone(), -&v2, v1.clone()]),
        horzcat(&[v2, zero.clone(), -&v0]),
        horzcat(&[-&v1, v0, zero]),
    ])
}

/// `hat(v)²` in closed form: `v·vᵀ - (vᵀ·v)·I`.
pub fn skew_symmetric_squared(v: &SymMatrix) -> SymMatrix {
    assert_eq!(
        v.shape(),
        (3, 1),
        "skew_symmetric_squared expects a 3x1 vector"
    );
    let outer = v * &v.t();
    let norm_sq = &v.t() * v; // 1x1
    &outer - &(&norm_sq * &SymMatrix::identity(3))
}

/// Extract the vector of a skew-symmetric matrix, the inverse of
/// [`skew_symmetric`]: `inv_skew(hat(v)) = v`. Reads the three entries where
/// the components appear with positive sign; no symmetry check is performed.
pub fn inv_skew(m: &SymMatrix) -> SymMatrix {
    assert_eq!(m.shape(), (3, 3), "inv_skew expects a 3x3 matrix");
    vertcat(&[m.element(2, 1), m.element(0, 2), m.element(1, 0)])
}

/// Rodrigues' formula for the rotation about `axis` (unit 3-vector) by
/// `angle` (1x1):
///
/// `R = I + sin(θ)·hat(a) + (1 - cos(θ))·hat(a)²`
pub fn rotation_from_axis_angle(axis: &SymMatrix, angle: &SymMatrix) -> SymMatrix {
    assert_eq!(
        axis.shape(),
        (3, 1),
        "rotation_from_axis_angle expects a 3x1 axis"
    );
    assert!(
        angle.is_scalar(),
        "rotation_from_axis_angle expects a scalar angle"
    );
    let hat = skew_symmetric(axis);
    let hat_sq = skew_symmetric_squared(axis);
    let one_minus_cos = &SymMatrix::scalar(1.0) - &angle.cos();
    &(&SymMatrix::identity(3) + &(&angle.sin() * &hat)) + &(&one_minus_cos * &hat_sq)
}

/// Rotation about the body x axis by `angle`.
pub fn rotation_about_x(angle: &SymMatrix) -> SymMatrix {
    rotation_from_axis_angle(&SymMatrix::from_column_slice(&[1.0, 0.0, 0.0]), angle)
}

/// Rotation about the body y axis by `angle`.
pub fn rotation_about_y(angle: &SymMatrix) -> SymMatrix {
    rotation_from_axis_angle(&SymMatrix::from_column_slice(&[0.0, 1.0, 0.0]), angle)
}

/// Rotation about the body z axis by `angle`.
pub fn rotation_about_z(angle: &SymMatrix) -> SymMatrix {
    rotation_from_axis_angle(&SymMatrix::from_column_slice(&[0.0, 0.0, 1.0]), angle)
}

/// First-order retraction of a tangent perturbation onto the rotation
/// manifold: `R ⊞ δ = R·(I + hat(δ))`.
pub fn boxplus_rotation(r: &SymMatrix, delta: &SymMatrix) -> SymMatrix {
    assert_eq!(r.shape(), (3, 3), "boxplus_rotation expects a 3x3 rotation");
    assert_eq!(
        delta.shape(),
        (3, 1),
        "boxplus_rotation expects a 3x1 perturbation"
    );
    r * &(&SymMatrix::identity(3) + &skew_symmetric(delta))
}

/// Tangent-space difference of two rotations:
/// `R₂ ⊟ R₁ = inv_skew((D - Dᵀ)/2)` with `D = R₁ᵀ·R₂`.
///
/// Inverse of [`boxplus_rotation`] to first order:
/// `boxminus_rotation(boxplus_rotation(R, δ), R) = δ + O(‖δ‖²)`.
pub fn boxminus_rotation(r2: &SymMatrix, r1: &SymMatrix) -> SymMatrix {
    assert_eq!(r1.shape(), (3, 3), "boxminus_rotation expects 3x3 rotations");
    assert_eq!(r2.shape(), (3, 3), "boxminus_rotation expects 3x3 rotations");
    let d = &r1.t() * r2;
    let antisym = &SymMatrix::scalar(0.5) * &(&d - &d.t());
    inv_skew(&antisym)
}
