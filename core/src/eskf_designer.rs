//! Symbolic linearization and code generation for error-state Kalman filters.
//!
//! Error-state (indirect) Kalman filters need six functions of the model:
//! the dynamics `f` and measurement `h`, plus the four Jacobians `df_dx`,
//! `df_dw`, `dh_dx` and `dh_dv` taken with respect to the *error* state and
//! the noise terms. Deriving those by hand is mechanical and error-prone,
//! doubly so for orientation states living on SO(3). This crate derives them
//! symbolically from a declarative model contract instead:
//!
//! 1. implement [`model::EskfModel`] -- declare the model's symbols and write
//!    its dynamics, measurement, and manifold operations;
//! 2. hand it to [`designer::FilterDesigner`], which traces the model,
//!    differentiates through the manifold retraction, and compiles the six
//!    functions to in-memory tapes callable on `nalgebra` matrices;
//! 3. optionally call `generate_code` to emit them as standalone C (or Rust)
//!    source for the target filter runtime.
//!
//! [`rotation`] provides the SO(3) building blocks (`hat`, Rodrigues,
//! `⊞`/`⊟`), and [`attitude`] a small complete model using them.

pub mod attitude;
pub mod codegen;
pub mod designer;
pub mod expr;
pub mod model;
pub mod rotation;

pub use codegen::{CodeGenOptions, CodeGenerator, TargetLanguage};
pub use designer::{DesignError, FilterDesigner};
pub use expr::{ExprError, ExprGraph, Function, SymMatrix, trace};
pub use model::EskfModel;
