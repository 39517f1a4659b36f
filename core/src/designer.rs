//! Derivation of the six error-state filter functions from a model contract.
//!
//! Given an [`EskfModel`], the designer traces the model's symbol
//! declarations and relations, derives the four Jacobians an error-state
//! Kalman filter needs, compiles everything to callable [`Function`]s, and
//! can emit them as standalone source code:
//!
//! | function | value | arguments |
//! |----------|-------|-----------|
//! | `f`      | dynamics | states.., inputs.., w, params.. |
//! | `df_dx`  | ∂/∂δx of dynamics at perturbed states, zero noise | states.., dx, inputs.., params.. |
//! | `df_dw`  | ∂/∂w of dynamics | states.., inputs.., w, params.. |
//! | `h`      | measurement | states.., v, params.. |
//! | `dh_dx`  | ∂/∂δx of the measurement residual under state perturbation | states.., dx, params.. |
//! | `dh_dv`  | ∂/∂v of the measurement residual | states.., v, params.. |
//!
//! `dx`, `w` and `v` are the stacked error-state, process-noise and
//! measurement-noise vectors; the per-list arguments appear in declaration
//! order. The state Jacobians are taken *through the manifold*: states are
//! perturbed with the model's ⊞ before differentiation, and measurement
//! differences go through the model's ⊟, so orientation states parameterized
//! as full rotation matrices still produce minimal 3-column Jacobian blocks.
//!
//! # Example
//!
//! ```no_run
//! use eskf_designer::attitude::AttitudeModel;
//! use eskf_designer::codegen::CodeGenOptions;
//! use eskf_designer::designer::FilterDesigner;
//!
//! let designer = FilterDesigner::new(
//!     &AttitudeModel,
//!     "attitude_filter",
//!     CodeGenOptions::default(),
//!     true,
//! )?;
//! designer.generate_code("generated/")?;
//! # Ok::<(), eskf_designer::designer::DesignError>(())
//! ```

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::codegen::{CodeGenOptions, CodeGenerator};
use crate::expr::{ExprError, ExprGraph, Function, SymMatrix, trace, vertcat};
use crate::model::EskfModel;

/// Errors raised while deriving a filter design.
#[derive(Debug, Error)]
pub enum DesignError {
    /// The model broke a rule of the [`EskfModel`] contract.
    #[error("model contract violation: {0}")]
    ContractViolation(String),
    /// Symbolic differentiation or compilation failed.
    #[error("differentiation failed: {0}")]
    Differentiation(#[from] ExprError),
    /// Writing generated code to disk failed.
    #[error("code generation failed: {0}")]
    CodeGen(#[from] io::Error),
}

fn violation(msg: impl Into<String>) -> DesignError {
    DesignError::ContractViolation(msg.into())
}

/// Everything captured while tracing the model, kept for diagnostics and
/// differentiation.
struct Traced {
    params: Vec<SymMatrix>,
    states: Vec<SymMatrix>,
    inputs: Vec<SymMatrix>,
    dx_vec: SymMatrix,
    w_vec: SymMatrix,
    v_vec: SymMatrix,
    expr_dyn: SymMatrix,
    dyn_perturbed: SymMatrix,
    expr_meas: Vec<SymMatrix>,
    meas_residual_x: SymMatrix,
    meas_residual_v: SymMatrix,
}

/// A fully derived filter design: the six compiled functions plus the
/// symbolic expressions they came from.
#[derive(Debug)]
pub struct FilterDesigner {
    name: String,
    graph: ExprGraph,
    expr_dyn: SymMatrix,
    expr_meas: Vec<SymMatrix>,
    jac_df_dx: SymMatrix,
    jac_df_dw: SymMatrix,
    jac_dh_dx: SymMatrix,
    jac_dh_dv: SymMatrix,
    f: Function,
    df_dx: Function,
    df_dw: Function,
    h: Function,
    dh_dx: Function,
    dh_dv: Function,
    options: CodeGenOptions,
}

fn require_columns(list: &[SymMatrix], what: &str) -> Result<(), DesignError> {
    for (i, m) in list.iter().enumerate() {
        if m.cols() != 1 {
            return Err(violation(format!(
                "{what}[{i}] must be a column vector, got {}x{}",
                m.rows(),
                m.cols()
            )));
        }
    }
    Ok(())
}

fn require_nonempty(list: &[SymMatrix], what: &str) -> Result<(), DesignError> {
    if list.is_empty() {
        return Err(violation(format!("the model must declare at least one {what}")));
    }
    Ok(())
}

fn zeros_like(list: &[SymMatrix]) -> Vec<SymMatrix> {
    list.iter()
        .map(|m| SymMatrix::zeros(m.rows(), m.cols()))
        .collect()
}

fn trace_model(model: &impl EskfModel) -> Result<Traced, DesignError> {
    let params = model.parameters();
    let states = model.states();
    let dx = model.state_perturbation();
    let inputs = model.inputs();
    let w = model.process_noises();
    let v = model.measurement_noises();

    require_nonempty(&states, "state")?;
    require_nonempty(&dx, "error state")?;
    require_nonempty(&inputs, "input")?;
    require_nonempty(&w, "process noise")?;
    require_nonempty(&v, "measurement noise")?;
    require_columns(&dx, "error state")?;
    require_columns(&w, "process noise")?;
    require_columns(&v, "measurement noise")?;
    if states.len() != dx.len() {
        return Err(violation(format!(
            "each state needs exactly one error state: {} state(s), {} error state(s)",
            states.len(),
            dx.len()
        )));
    }

    let dx_vec = vertcat(&dx);
    let w_vec = vertcat(&w);
    let v_vec = vertcat(&v);

    let expr_dyn = model.dynamics(&states, &inputs, &w, &params);
    if expr_dyn.shape() != (dx_vec.rows(), 1) {
        return Err(violation(format!(
            "dynamics must be a {}x1 column matching the stacked error state, got {}x{}",
            dx_vec.rows(),
            expr_dyn.rows(),
            expr_dyn.cols()
        )));
    }

    let perturbed = model.perturb_states(&states, &dx);
    if perturbed.len() != states.len() {
        return Err(violation(format!(
            "perturb_states must return one matrix per state: got {} for {} state(s)",
            perturbed.len(),
            states.len()
        )));
    }
    for (i, (s, p)) in states.iter().zip(&perturbed).enumerate() {
        if s.shape() != p.shape() {
            return Err(violation(format!(
                "perturb_states must preserve state shapes: state {i} is {}x{}, perturbed is {}x{}",
                s.rows(),
                s.cols(),
                p.rows(),
                p.cols()
            )));
        }
    }
    let dyn_perturbed = model.dynamics(&perturbed, &inputs, &zeros_like(&w), &params);
    if dyn_perturbed.shape() != expr_dyn.shape() {
        return Err(violation(
            "dynamics changed shape when handed perturbed states".to_string(),
        ));
    }

    let meas = model.measurement(&states, &v, &params);
    let meas_nominal = model.measurement(&states, &zeros_like(&v), &params);
    let meas_perturbed = model.measurement(&perturbed, &zeros_like(&v), &params);
    if meas.is_empty() {
        return Err(violation(
            "measurement must return at least one column".to_string(),
        ));
    }
    if meas_nominal.len() != meas.len() || meas_perturbed.len() != meas.len() {
        return Err(violation(
            "measurement returned lists of differing lengths across calls".to_string(),
        ));
    }
    require_columns(&meas, "measurement")?;

    let residual_x = model.measurement_perturbation(&meas_perturbed, &meas_nominal);
    let residual_v = model.measurement_perturbation(&meas, &meas_nominal);
    if residual_x.len() != meas.len() || residual_v.len() != meas.len() {
        return Err(violation(
            "measurement_perturbation must return one column per measurement".to_string(),
        ));
    }
    require_columns(&residual_x, "measurement residual")?;
    require_columns(&residual_v, "measurement residual")?;

    Ok(Traced {
        params,
        states,
        inputs,
        dx_vec,
        w_vec,
        v_vec,
        expr_dyn,
        dyn_perturbed,
        expr_meas: meas,
        meas_residual_x: vertcat(&residual_x),
        meas_residual_v: vertcat(&residual_v),
    })
}

impl FilterDesigner {
    /// Trace `model`, derive and compile the six filter functions. With
    /// `enforce_dense`, Jacobians are densified so every generated function
    /// writes its full output buffer; without it, structural zeros are kept
    /// through compilation (the generated code still zeroes those entries).
    pub fn new(
        model: &impl EskfModel,
        name: &str,
        options: CodeGenOptions,
        enforce_dense: bool,
    ) -> Result<Self, DesignError> {
        info!("deriving filter design `{name}`");
        let (mut graph, traced) = trace(|| trace_model(model));
        let mut traced = traced?;
        debug!(
            "traced `{name}`: {} expression node(s), dx {}x1, w {}x1, v {}x1",
            graph.len(),
            traced.dx_vec.rows(),
            traced.w_vec.rows(),
            traced.v_vec.rows()
        );

        let mut jac_df_dx = graph.jacobian(&traced.dyn_perturbed, &traced.dx_vec)?;
        let mut jac_df_dw = graph.jacobian(&traced.expr_dyn, &traced.w_vec)?;
        let mut jac_dh_dx = graph.jacobian(&traced.meas_residual_x, &traced.dx_vec)?;
        let mut jac_dh_dv = graph.jacobian(&traced.meas_residual_v, &traced.v_vec)?;

        if enforce_dense {
            let blocks = [&mut traced.expr_dyn]
                .into_iter()
                .chain(traced.expr_meas.iter_mut())
                .chain([&mut jac_df_dx, &mut jac_df_dw, &mut jac_dh_dx, &mut jac_dh_dv]);
            for block in blocks {
                if !block.is_dense() {
                    *block = block.densify(&mut graph);
                }
            }
        }

        // Fixed argument orders; downstream runtimes rely on them.
        let mut f_args = traced.states.clone();
        f_args.extend(traced.inputs.iter().cloned());
        f_args.push(traced.w_vec.clone());
        f_args.extend(traced.params.iter().cloned());

        let mut df_dx_args = traced.states.clone();
        df_dx_args.push(traced.dx_vec.clone());
        df_dx_args.extend(traced.inputs.iter().cloned());
        df_dx_args.extend(traced.params.iter().cloned());

        let df_dw_args = f_args.clone();

        let mut h_args = traced.states.clone();
        h_args.push(traced.v_vec.clone());
        h_args.extend(traced.params.iter().cloned());

        let mut dh_dx_args = traced.states.clone();
        dh_dx_args.push(traced.dx_vec.clone());
        dh_dx_args.extend(traced.params.iter().cloned());

        let dh_dv_args = h_args.clone();

        let f = Function::compile(&graph, "f", &f_args, &[traced.expr_dyn.clone()])?;
        let df_dx = Function::compile(&graph, "df_dx", &df_dx_args, &[jac_df_dx.clone()])?;
        let df_dw = Function::compile(&graph, "df_dw", &df_dw_args, &[jac_df_dw.clone()])?;
        let h = Function::compile(&graph, "h", &h_args, &traced.expr_meas)?;
        let dh_dx = Function::compile(&graph, "dh_dx", &dh_dx_args, &[jac_dh_dx.clone()])?;
        let dh_dv = Function::compile(&graph, "dh_dv", &dh_dv_args, &[jac_dh_dv.clone()])?;
        info!(
            "compiled `{name}`: f {f}, df_dx {df_dx}, df_dw {df_dw}, h {h}, dh_dx {dh_dx}, dh_dv {dh_dv}"
        );

        Ok(Self {
            name: name.to_string(),
            graph,
            expr_dyn: traced.expr_dyn,
            expr_meas: traced.expr_meas,
            jac_df_dx,
            jac_df_dw,
            jac_dh_dx,
            jac_dh_dv,
            f,
            df_dx,
            df_dw,
            h,
            dh_dx,
            dh_dv,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compiled dynamics `f(states.., inputs.., w, params..)`.
    pub fn f(&self) -> &Function {
        &self.f
    }

    /// Compiled state Jacobian of the dynamics,
    /// `df_dx(states.., dx, inputs.., params..)`.
    pub fn df_dx(&self) -> &Function {
        &self.df_dx
    }

    /// Compiled process-noise Jacobian of the dynamics,
    /// `df_dw(states.., inputs.., w, params..)`.
    pub fn df_dw(&self) -> &Function {
        &self.df_dw
    }

    /// Compiled measurement `h(states.., v, params..)`, one output per
    /// measurement block.
    pub fn h(&self) -> &Function {
        &self.h
    }

    /// Compiled state Jacobian of the measurement residual,
    /// `dh_dx(states.., dx, params..)`.
    pub fn dh_dx(&self) -> &Function {
        &self.dh_dx
    }

    /// Compiled measurement-noise Jacobian of the measurement residual,
    /// `dh_dv(states.., v, params..)`.
    pub fn dh_dv(&self) -> &Function {
        &self.dh_dv
    }

    /// Write the six functions as source code into `dir`; returns the path of
    /// the generated source file.
    pub fn generate_code<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf, DesignError> {
        let mut generator = CodeGenerator::new(&self.name, self.options);
        for func in [
            &self.f,
            &self.df_dx,
            &self.df_dw,
            &self.h,
            &self.dh_dx,
            &self.dh_dv,
        ] {
            generator.add(func.clone());
        }
        Ok(generator.generate(dir.as_ref())?)
    }

    /// Human-readable dump of the derived symbolic expressions.
    pub fn describe_expressions(&self) -> String {
        let mut s = String::new();
        let g = &self.graph;
        let _ = writeln!(s, "dynamics:\n{}", g.format_matrix(&self.expr_dyn));
        for (i, block) in self.expr_meas.iter().enumerate() {
            let _ = writeln!(s, "measurement[{i}]:\n{}", g.format_matrix(block));
        }
        let _ = writeln!(s, "jac_df_dx:\n{}", g.format_matrix(&self.jac_df_dx));
        let _ = writeln!(s, "jac_df_dw:\n{}", g.format_matrix(&self.jac_df_dw));
        let _ = writeln!(s, "jac_dh_dx:\n{}", g.format_matrix(&self.jac_dh_dx));
        let _ = write!(s, "jac_dh_dv:\n{}", g.format_matrix(&self.jac_dh_dv));
        s
    }

    /// One-line signature summary per compiled function.
    pub fn describe_functions(&self) -> String {
        [
            &self.f,
            &self.df_dx,
            &self.df_dw,
            &self.h,
            &self.dh_dx,
            &self.dh_dv,
        ]
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DMatrix;

    /// Linear toy model: x' = -x + u + w, y = x + v, vector state.
    struct LinearModel {
        n: usize,
    }

    impl EskfModel for LinearModel {
        fn states(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("x", self.n, 1)]
        }

        fn state_perturbation(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("dx", self.n, 1)]
        }

        fn inputs(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("u", self.n, 1)]
        }

        fn process_noises(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("w", self.n, 1)]
        }

        fn measurement_noises(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("v", self.n, 1)]
        }

        fn dynamics(
            &self,
            states: &[SymMatrix],
            inputs: &[SymMatrix],
            process_noises: &[SymMatrix],
            _parameters: &[SymMatrix],
        ) -> SymMatrix {
            &(&-&states[0] + &inputs[0]) + &process_noises[0]
        }

        fn measurement(
            &self,
            states: &[SymMatrix],
            measurement_noises: &[SymMatrix],
            _parameters: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            vec![&states[0] + &measurement_noises[0]]
        }

        fn perturb_states(
            &self,
            states: &[SymMatrix],
            perturbations: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            states
                .iter()
                .zip(perturbations)
                .map(|(s, d)| s + d)
                .collect()
        }

        fn measurement_perturbation(
            &self,
            perturbed: &[SymMatrix],
            nominal: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            perturbed.iter().zip(nominal).map(|(p, n)| p - n).collect()
        }
    }

    fn col(values: &[f64]) -> DMatrix<f64> {
        DMatrix::from_column_slice(values.len(), 1, values)
    }

    #[test]
    fn linear_model_jacobians_are_signed_identities() {
        let designer =
            FilterDesigner::new(&LinearModel { n: 2 }, "lin", CodeGenOptions::default(), true)
                .unwrap();

        let x = col(&[1.0, -2.0]);
        let dx = col(&[0.0, 0.0]);
        let u = col(&[0.5, 0.5]);
        let w = col(&[0.0, 0.0]);
        let v = col(&[0.0, 0.0]);

        let fdot = &designer.f().call(&[x.clone(), u.clone(), w.clone()])[0];
        assert_approx_eq!(fdot[(0, 0)], -0.5, 1e-12);
        assert_approx_eq!(fdot[(1, 0)], 2.5, 1e-12);

        let a = &designer
            .df_dx()
            .call(&[x.clone(), dx.clone(), u.clone()])[0];
        let l = &designer.df_dw().call(&[x.clone(), u, w])[0];
        let hx = &designer.dh_dx().call(&[x.clone(), dx])[0];
        let m = &designer.dh_dv().call(&[x, v])[0];
        for r in 0..2 {
            for c in 0..2 {
                let id = if r == c { 1.0 } else { 0.0 };
                assert_approx_eq!(a[(r, c)], -id, 1e-12);
                assert_approx_eq!(l[(r, c)], id, 1e-12);
                assert_approx_eq!(hx[(r, c)], id, 1e-12);
                assert_approx_eq!(m[(r, c)], id, 1e-12);
            }
        }
    }

    /// Linear model with one declaration list emptied out.
    struct Gutted {
        empty: &'static str,
    }

    impl Gutted {
        fn list(&self, which: &str, name: &str) -> Vec<SymMatrix> {
            if self.empty == which {
                Vec::new()
            } else {
                vec![SymMatrix::sym(name, 2, 1)]
            }
        }
    }

    impl EskfModel for Gutted {
        fn states(&self) -> Vec<SymMatrix> {
            self.list("states", "x")
        }
        fn state_perturbation(&self) -> Vec<SymMatrix> {
            self.list("dx", "dx")
        }
        fn inputs(&self) -> Vec<SymMatrix> {
            self.list("inputs", "u")
        }
        fn process_noises(&self) -> Vec<SymMatrix> {
            self.list("w", "w")
        }
        fn measurement_noises(&self) -> Vec<SymMatrix> {
            self.list("v", "v")
        }
        fn dynamics(
            &self,
            states: &[SymMatrix],
            _: &[SymMatrix],
            _: &[SymMatrix],
            _: &[SymMatrix],
        ) -> SymMatrix {
            states.first().cloned().unwrap_or_else(|| SymMatrix::zeros(0, 1))
        }
        fn measurement(
            &self,
            states: &[SymMatrix],
            _: &[SymMatrix],
            _: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            states.to_vec()
        }
        fn perturb_states(
            &self,
            states: &[SymMatrix],
            _: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            states.to_vec()
        }
        fn measurement_perturbation(
            &self,
            perturbed: &[SymMatrix],
            nominal: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            perturbed.iter().zip(nominal).map(|(p, n)| p - n).collect()
        }
    }

    #[test]
    fn every_empty_declaration_list_is_rejected() {
        for which in ["states", "dx", "inputs", "w", "v"] {
            let err = FilterDesigner::new(
                &Gutted { empty: which },
                "gutted",
                CodeGenOptions::default(),
                true,
            )
            .unwrap_err();
            assert!(
                matches!(err, DesignError::ContractViolation(_)),
                "empty `{which}` list should be a contract violation, got {err:?}"
            );
        }
    }

    #[test]
    fn dynamics_shape_mismatch_is_a_contract_violation() {
        struct ShortDynamics;
        impl EskfModel for ShortDynamics {
            fn states(&self) -> Vec<SymMatrix> {
                vec![SymMatrix::sym("x", 2, 1)]
            }
            fn state_perturbation(&self) -> Vec<SymMatrix> {
                vec![SymMatrix::sym("dx", 2, 1)]
            }
            fn inputs(&self) -> Vec<SymMatrix> {
                vec![SymMatrix::sym("u", 1, 1)]
            }
            fn process_noises(&self) -> Vec<SymMatrix> {
                vec![SymMatrix::sym("w", 2, 1)]
            }
            fn measurement_noises(&self) -> Vec<SymMatrix> {
                vec![SymMatrix::sym("v", 2, 1)]
            }
            fn dynamics(
                &self,
                states: &[SymMatrix],
                _: &[SymMatrix],
                _: &[SymMatrix],
                _: &[SymMatrix],
            ) -> SymMatrix {
                // 1x1 where 2x1 is required.
                states[0].element(0, 0)
            }
            fn measurement(
                &self,
                states: &[SymMatrix],
                noises: &[SymMatrix],
                _: &[SymMatrix],
            ) -> Vec<SymMatrix> {
                vec![&states[0] + &noises[0]]
            }
            fn perturb_states(
                &self,
                states: &[SymMatrix],
                perturbations: &[SymMatrix],
            ) -> Vec<SymMatrix> {
                vec![&states[0] + &perturbations[0]]
            }
            fn measurement_perturbation(
                &self,
                perturbed: &[SymMatrix],
                nominal: &[SymMatrix],
            ) -> Vec<SymMatrix> {
                perturbed.iter().zip(nominal).map(|(p, n)| p - n).collect()
            }
        }
        let err = FilterDesigner::new(&ShortDynamics, "bad", CodeGenOptions::default(), true)
            .unwrap_err();
        match err {
            DesignError::ContractViolation(msg) => assert!(msg.contains("dynamics")),
            other => panic!("expected contract violation, got {other:?}"),
        }
    }

    /// Two scalar measurement blocks sharing one declared noise term.
    struct SharedNoiseModel;

    impl EskfModel for SharedNoiseModel {
        fn states(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("x", 2, 1)]
        }
        fn state_perturbation(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("dx", 2, 1)]
        }
        fn inputs(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("u", 2, 1)]
        }
        fn process_noises(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("w", 2, 1)]
        }
        fn measurement_noises(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("v", 1, 1)]
        }
        fn dynamics(
            &self,
            states: &[SymMatrix],
            inputs: &[SymMatrix],
            process_noises: &[SymMatrix],
            _: &[SymMatrix],
        ) -> SymMatrix {
            &(&-&states[0] + &inputs[0]) + &process_noises[0]
        }
        fn measurement(
            &self,
            states: &[SymMatrix],
            measurement_noises: &[SymMatrix],
            _: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            vec![
                &states[0].element(0, 0) + &measurement_noises[0],
                &states[0].element(1, 0) + &measurement_noises[0],
            ]
        }
        fn perturb_states(
            &self,
            states: &[SymMatrix],
            perturbations: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            states
                .iter()
                .zip(perturbations)
                .map(|(s, d)| s + d)
                .collect()
        }
        fn measurement_perturbation(
            &self,
            perturbed: &[SymMatrix],
            nominal: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            perturbed.iter().zip(nominal).map(|(p, n)| p - n).collect()
        }
    }

    #[test]
    fn measurement_blocks_may_share_noise_terms() {
        // More measurement blocks than noise declarations is a valid model.
        let designer =
            FilterDesigner::new(&SharedNoiseModel, "shared", CodeGenOptions::default(), true)
                .unwrap();
        assert_eq!(designer.h().n_outputs(), 2);
        let x = col(&[1.5, -0.5]);
        let v = col(&[0.25]);
        let out = designer.h().call(&[x, v]);
        assert_eq!(out.len(), 2);
        assert_approx_eq!(out[0][(0, 0)], 1.75, 1e-12);
        assert_approx_eq!(out[1][(0, 0)], -0.25, 1e-12);
    }

    #[test]
    fn measurement_keeps_one_compiled_output_per_block() {
        let designer =
            FilterDesigner::new(&SharedNoiseModel, "shared", CodeGenOptions::default(), true)
                .unwrap();
        // dh_dv stacks the per-block residuals: both depend on the one noise.
        let x = col(&[0.0, 0.0]);
        let v = col(&[0.0]);
        let jac = &designer.dh_dv().call(&[x, v])[0];
        assert_eq!(jac.shape(), (2, 1));
        assert_approx_eq!(jac[(0, 0)], 1.0, 1e-12);
        assert_approx_eq!(jac[(1, 0)], 1.0, 1e-12);
    }

    /// Dynamics with a structurally zero row, to observe densification.
    struct ZeroRowModel;

    impl EskfModel for ZeroRowModel {
        fn states(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("x", 2, 1)]
        }
        fn state_perturbation(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("dx", 2, 1)]
        }
        fn inputs(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("u", 1, 1)]
        }
        fn process_noises(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("w", 1, 1)]
        }
        fn measurement_noises(&self) -> Vec<SymMatrix> {
            vec![SymMatrix::sym("v", 1, 1)]
        }
        fn dynamics(
            &self,
            _: &[SymMatrix],
            inputs: &[SymMatrix],
            process_noises: &[SymMatrix],
            _: &[SymMatrix],
        ) -> SymMatrix {
            vertcat(&[&inputs[0] + &process_noises[0], SymMatrix::zeros(1, 1)])
        }
        fn measurement(
            &self,
            states: &[SymMatrix],
            measurement_noises: &[SymMatrix],
            _: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            vec![&states[0].element(0, 0) + &measurement_noises[0]]
        }
        fn perturb_states(
            &self,
            states: &[SymMatrix],
            perturbations: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            states
                .iter()
                .zip(perturbations)
                .map(|(s, d)| s + d)
                .collect()
        }
        fn measurement_perturbation(
            &self,
            perturbed: &[SymMatrix],
            nominal: &[SymMatrix],
        ) -> Vec<SymMatrix> {
            perturbed.iter().zip(nominal).map(|(p, n)| p - n).collect()
        }
    }

    #[test]
    fn dense_designs_materialize_dynamics_zeros() {
        // Structural zeros print as `0`; densified entries are the literal
        // constant and print as `0.0`.
        let dense =
            FilterDesigner::new(&ZeroRowModel, "zr", CodeGenOptions::default(), true).unwrap();
        let text = dense.describe_expressions();
        let dyn_part = text.split("measurement").next().unwrap();
        assert!(dyn_part.contains("0.0"), "dynamics not densified:\n{dyn_part}");

        let sparse =
            FilterDesigner::new(&ZeroRowModel, "zr", CodeGenOptions::default(), false).unwrap();
        let text = sparse.describe_expressions();
        let dyn_part = text.split("measurement").next().unwrap();
        assert!(
            !dyn_part.contains("0.0"),
            "sparse design should keep structural zeros:\n{dyn_part}"
        );
    }

    #[test]
    fn describe_functions_lists_all_six() {
        let designer =
            FilterDesigner::new(&LinearModel { n: 3 }, "lin", CodeGenOptions::default(), true)
                .unwrap();
        let text = designer.describe_functions();
        for name in ["f:", "df_dx:", "df_dw:", "h:", "dh_dx:", "dh_dv:"] {
            assert!(text.contains(name), "missing `{name}` in:\n{text}");
        }
        assert!(!designer.describe_expressions().is_empty());
    }
}
