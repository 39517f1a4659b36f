//! Reference model: attitude estimation from a rate gyro and an
//! accelerometer-derived gravity direction.
//!
//! The nominal state is the body-to-world rotation matrix `R`; its error
//! state is the 3-vector tangent perturbation applied through
//! [`boxplus_rotation`]. The error dynamics are driven directly by the
//! measured angular rate plus gyro noise, and the measurement is the gravity
//! direction seen in the body frame, `Rᵀ·e₃`, corrupted by accelerometer
//! noise.
//!
//! The derived design has a familiar closed form, which makes this model the
//! standard end-to-end check: `df_dx = 0`, `df_dw = I`, `dh_dv = I`, and
//! `dh_dx = hat(Rᵀ·e₃)`.

use crate::expr::SymMatrix;
use crate::model::EskfModel;
use crate::rotation::boxplus_rotation;

/// Gyro-driven attitude model with a gravity-direction measurement.
pub struct AttitudeModel;

impl EskfModel for AttitudeModel {
    fn states(&self) -> Vec<SymMatrix> {
        vec![SymMatrix::sym("R", 3, 3)]
    }

    fn state_perturbation(&self) -> Vec<SymMatrix> {
        vec![SymMatrix::sym("d_rot", 3, 1)]
    }

    fn inputs(&self) -> Vec<SymMatrix> {
        vec![SymMatrix::sym("ang_vel", 3, 1)]
    }

    fn process_noises(&self) -> Vec<SymMatrix> {
        vec![SymMatrix::sym("n_ang_vel", 3, 1)]
    }

    fn measurement_noises(&self) -> Vec<SymMatrix> {
        vec![SymMatrix::sym("n_lin_acc", 3, 1)]
    }

    fn dynamics(
        &self,
        _states: &[SymMatrix],
        inputs: &[SymMatrix],
        process_noises: &[SymMatrix],
        _parameters: &[SymMatrix],
    ) -> SymMatrix {
        &inputs[0] + &process_noises[0]
    }

    fn measurement(
        &self,
        states: &[SymMatrix],
        measurement_noises: &[SymMatrix],
        _parameters: &[SymMatrix],
    ) -> Vec<SymMatrix> {
        let gravity_dir = SymMatrix::from_column_slice(&[0.0, 0.0, 1.0]);
        vec![&(&states[0].t() * &gravity_dir) + &measurement_noises[0]]
    }

    fn perturb_states(
        &self,
        states: &[SymMatrix],
        perturbations: &[SymMatrix],
    ) -> Vec<SymMatrix> {
        vec![boxplus_rotation(&states[0], &perturbations[0])]
    }

    fn measurement_perturbation(
        &self,
        perturbed: &[SymMatrix],
        nominal: &[SymMatrix],
    ) -> Vec<SymMatrix> {
        perturbed.iter().zip(nominal).map(|(p, n)| p - n).collect()
    }
}
