//! The model contract a filter design is derived from.
//!
//! A model declares its symbol lists (parameters, states, error states,
//! inputs, process noises, measurement noises) and the relations tying them
//! together (dynamics, measurement, and the manifold operations connecting
//! states to their error states). Everything else -- Jacobian derivation,
//! densification, compilation, code emission -- is the
//! [`FilterDesigner`](crate::designer::FilterDesigner)'s job.
//!
//! Declaration methods are called once, inside the designer's trace, and must
//! create fresh symbols via [`SymMatrix::sym`]. Relation methods are pure
//! functions of the matrices they are handed; they may be called several times
//! with different arguments (nominal and perturbed) and must not create new
//! variables.

use crate::expr::SymMatrix;

/// Contract implemented by every filter model handed to the designer.
///
/// The slice arguments of the relation methods line up positionally with the
/// corresponding declaration lists: `states[i]` in [`EskfModel::dynamics`] has
/// the shape declared by the `i`-th entry of [`EskfModel::states`], and so on.
pub trait EskfModel {
    /// Constant parameters. May be empty.
    fn parameters(&self) -> Vec<SymMatrix> {
        Vec::new()
    }

    /// Nominal states. Orientation states are full 3x3 matrices.
    fn states(&self) -> Vec<SymMatrix>;

    /// Error (tangent-space) states, one per nominal state. A 3x3 orientation
    /// state pairs with a 3x1 error state.
    fn state_perturbation(&self) -> Vec<SymMatrix>;

    /// Control inputs.
    fn inputs(&self) -> Vec<SymMatrix>;

    /// Process noise terms entering the dynamics.
    fn process_noises(&self) -> Vec<SymMatrix>;

    /// Measurement noise terms entering the measurement relation.
    fn measurement_noises(&self) -> Vec<SymMatrix>;

    /// Continuous dynamics of the error state: a single column whose length
    /// matches the stacked error-state vector.
    fn dynamics(
        &self,
        states: &[SymMatrix],
        inputs: &[SymMatrix],
        process_noises: &[SymMatrix],
        parameters: &[SymMatrix],
    ) -> SymMatrix;

    /// Measurement relation: one column per declared measurement noise term.
    fn measurement(
        &self,
        states: &[SymMatrix],
        measurement_noises: &[SymMatrix],
        parameters: &[SymMatrix],
    ) -> Vec<SymMatrix>;

    /// Apply the error states to the nominal states (the per-state ⊞). Must
    /// preserve each state's shape, and must reduce to the identity when the
    /// perturbations are zero.
    fn perturb_states(
        &self,
        states: &[SymMatrix],
        perturbations: &[SymMatrix],
    ) -> Vec<SymMatrix>;

    /// Tangent-space difference of two measurement lists (the per-measurement
    /// ⊟), used to express measurement Jacobians in local coordinates. For
    /// vector-valued measurements this is plain subtraction.
    fn measurement_perturbation(
        &self,
        perturbed: &[SymMatrix],
        nominal: &[SymMatrix],
    ) -> Vec<SymMatrix>;
}
