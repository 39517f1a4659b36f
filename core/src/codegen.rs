//! Emission of compiled functions as dependency-free source code.
//!
//! The generator collects [`Function`]s and writes them out as a single
//! translation unit in the requested dialect. Both dialects share a calling
//! convention: each argument and each result is a flat row-major `f64` buffer,
//! indexed `row * cols + col`, so callers can hand over matrix storage without
//! copies regardless of their own matrix library.
//!
//! C output is the default and matches the classic embedded-filter workflow:
//! `void f(const double* const* arg, double* const* res)`, no allocation, no
//! libm beyond `sin`/`cos`/`sqrt`. The Rust dialect emits the same tape as
//! `pub fn f(arg: &[&[f64]], res: &mut [&mut [f64]])` for projects that link
//! the filter functions directly into a Rust runtime.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use log::info;
use serde::{Deserialize, Serialize};

use crate::expr::{Function, TapeOp};

/// Output dialect of the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    /// C99, the conventional target for embedded filter deployments.
    #[default]
    C,
    /// Rust, for linking the generated functions into a Rust runtime.
    Rust,
}

/// Options controlling code emission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeGenOptions {
    pub language: TargetLanguage,
    /// Emit a header with prototypes next to the C source.
    pub with_header: bool,
    /// Emit a `main` that calls every function once on zeroed inputs, for
    /// smoke-testing the generated unit standalone.
    pub with_main: bool,
    /// Log each function as it is added and emitted.
    pub verbose: bool,
    /// Caller-provided work buffers instead of stack locals: each C function
    /// takes a trailing `double* w` argument sized by its `<name>_work()`.
    pub with_mem: bool,
}

impl Default for CodeGenOptions {
    fn default() -> Self {
        Self {
            language: TargetLanguage::C,
            with_header: true,
            with_main: false,
            verbose: false,
            with_mem: false,
        }
    }
}

/// Collects compiled functions and writes them as one source unit.
#[derive(Debug)]
pub struct CodeGenerator {
    name: String,
    options: CodeGenOptions,
    functions: Vec<Function>,
}

impl CodeGenerator {
    pub fn new(name: &str, options: CodeGenOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            functions: Vec::new(),
        }
    }

    pub fn add(&mut self, function: Function) {
        if self.options.verbose {
            info!("code generator `{}`: adding {}", self.name, function);
        }
        self.functions.push(function);
    }

    /// Write the collected functions into `dir` and return the path of the
    /// generated source file. Existing files are overwritten, so repeated
    /// generation into the same directory is idempotent.
    pub fn generate(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = match self.options.language {
            TargetLanguage::C => {
                let src = dir.join(format!("{}.c", self.name));
                fs::write(&src, self.render_c())?;
                if self.options.with_header {
                    let header = dir.join(format!("{}.h", self.name));
                    fs::write(&header, self.render_c_header())?;
                }
                src
            }
            TargetLanguage::Rust => {
                let src = dir.join(format!("{}.rs", self.name));
                fs::write(&src, self.render_rust())?;
                src
            }
        };
        if self.options.verbose {
            info!(
                "code generator `{}`: wrote {} function(s) to {}",
                self.name,
                self.functions.len(),
                path.display()
            );
        }
        Ok(path)
    }

    fn c_signature(&self, f: &Function) -> String {
        if self.options.with_mem {
            format!(
                "void {}(const double* const* arg, double* const* res, double* w)",
                f.name
            )
        } else {
            format!("void {}(const double* const* arg, double* const* res)", f.name)
        }
    }

    fn render_c(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "/* Generated filter functions: {} */", self.name);
        let _ = writeln!(s, "#include <math.h>");
        if self.options.with_main {
            let _ = writeln!(s, "#include <stdio.h>");
        }
        let _ = writeln!(s);
        for f in &self.functions {
            self.push_c_function(&mut s, f);
            let _ = writeln!(s);
        }
        if self.options.with_main {
            self.push_c_main(&mut s);
        }
        s
    }

    fn push_c_function(&self, s: &mut String, f: &Function) {
        let _ = writeln!(s, "/* {f} */");
        if self.options.with_mem {
            let _ = writeln!(s, "int {}_work(void) {{ return {}; }}", f.name, f.work);
        }
        let _ = writeln!(s, "{} {{", self.c_signature(f));
        if !self.options.with_mem && f.work > 0 {
            let _ = writeln!(s, "  double w[{}];", f.work);
        }
        for op in &f.tape {
            let line = match *op {
                TapeOp::Load { dst, arg, row, col } => {
                    let cols = f.args[arg].cols;
                    format!("w[{dst}] = arg[{arg}][{}];", row * cols + col)
                }
                TapeOp::Const { dst, value } => format!("w[{dst}] = {value:?};"),
                TapeOp::Add { dst, a, b } => format!("w[{dst}] = w[{a}] + w[{b}];"),
                TapeOp::Sub { dst, a, b } => format!("w[{dst}] = w[{a}] - w[{b}];"),
                TapeOp::Mul { dst, a, b } => format!("w[{dst}] = w[{a}] * w[{b}];"),
                TapeOp::Div { dst, a, b } => format!("w[{dst}] = w[{a}] / w[{b}];"),
                TapeOp::Neg { dst, a } => format!("w[{dst}] = -w[{a}];"),
                TapeOp::Sin { dst, a } => format!("w[{dst}] = sin(w[{a}]);"),
                TapeOp::Cos { dst, a } => format!("w[{dst}] = cos(w[{a}]);"),
                TapeOp::Sqrt { dst, a } => format!("w[{dst}] = sqrt(w[{a}]);"),
            };
            let _ = writeln!(s, "  {line}");
        }
        for (j, out) in f.outs.iter().enumerate() {
            for (k, reg) in out.regs.iter().enumerate() {
                let line = match reg {
                    Some(i) => format!("res[{j}][{k}] = w[{i}];"),
                    None => format!("res[{j}][{k}] = 0.0;"),
                };
                let _ = writeln!(s, "  {line}");
            }
        }
        let _ = writeln!(s, "}}");
    }

    fn push_c_main(&self, s: &mut String) {
        let _ = writeln!(s, "int main(void) {{");
        for f in &self.functions {
            let _ = writeln!(s, "  {{");
            for (i, a) in f.args.iter().enumerate() {
                let n = (a.rows * a.cols).max(1);
                let _ = writeln!(s, "    static double a{i}[{n}] = {{0}};");
            }
            for (j, o) in f.outs.iter().enumerate() {
                let n = (o.rows * o.cols).max(1);
                let _ = writeln!(s, "    static double r{j}[{n}] = {{0}};");
            }
            let args = (0..f.args.len())
                .map(|i| format!("a{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let ress = (0..f.outs.len())
                .map(|j| format!("r{j}"))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(s, "    const double* arg[] = {{{args}}};");
            let _ = writeln!(s, "    double* res[] = {{{ress}}};");
            if self.options.with_mem {
                let _ = writeln!(s, "    static double w[{}];", f.work.max(1));
                let _ = writeln!(s, "    {}(arg, res, w);", f.name);
            } else {
                let _ = writeln!(s, "    {}(arg, res);", f.name);
            }
            let _ = writeln!(s, "    printf(\"{}: %g\\n\", r0[0]);", f.name);
            let _ = writeln!(s, "  }}");
        }
        let _ = writeln!(s, "  return 0;");
        let _ = writeln!(s, "}}");
    }

    fn render_c_header(&self) -> String {
        let guard = format!(
            "{}_H",
            self.name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                .collect::<String>()
        );
        let mut s = String::new();
        let _ = writeln!(s, "/* Generated filter function prototypes: {} */", self.name);
        let _ = writeln!(s, "#ifndef {guard}");
        let _ = writeln!(s, "#define {guard}");
        let _ = writeln!(s);
        for f in &self.functions {
            let _ = writeln!(s, "/* {f} */");
            if self.options.with_mem {
                let _ = writeln!(s, "int {}_work(void);", f.name);
            }
            let _ = writeln!(s, "{};", self.c_signature(f));
        }
        let _ = writeln!(s);
        let _ = writeln!(s, "#endif /* {guard} */");
        s
    }

    fn render_rust(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "// Generated filter functions: {}", self.name);
        let _ = writeln!(s, "#![allow(clippy::needless_range_loop)]");
        let _ = writeln!(s);
        for f in &self.functions {
            let _ = writeln!(s, "/// {f}");
            let _ = writeln!(
                s,
                "pub fn {}(arg: &[&[f64]], res: &mut [&mut [f64]]) {{",
                f.name
            );
            if f.work > 0 {
                let _ = writeln!(s, "    let mut w = [0.0f64; {}];", f.work);
            }
            for op in &f.tape {
                let line = match *op {
                    TapeOp::Load { dst, arg, row, col } => {
                        let cols = f.args[arg].cols;
                        format!("w[{dst}] = arg[{arg}][{}];", row * cols + col)
                    }
                    TapeOp::Const { dst, value } => format!("w[{dst}] = {value:?};"),
                    TapeOp::Add { dst, a, b } => format!("w[{dst}] = w[{a}] + w[{b}];"),
                    TapeOp::Sub { dst, a, b } => format!("w[{dst}] = w[{a}] - w[{b}];"),
                    TapeOp::Mul { dst, a, b } => format!("w[{dst}] = w[{a}] * w[{b}];"),
                    TapeOp::Div { dst, a, b } => format!("w[{dst}] = w[{a}] / w[{b}];"),
                    TapeOp::Neg { dst, a } => format!("w[{dst}] = -w[{a}];"),
                    TapeOp::Sin { dst, a } => format!("w[{dst}] = w[{a}].sin();"),
                    TapeOp::Cos { dst, a } => format!("w[{dst}] = w[{a}].cos();"),
                    TapeOp::Sqrt { dst, a } => format!("w[{dst}] = w[{a}].sqrt();"),
                };
                let _ = writeln!(s, "    {line}");
            }
            for (j, out) in f.outs.iter().enumerate() {
                for (k, reg) in out.regs.iter().enumerate() {
                    let line = match reg {
                        Some(i) => format!("res[{j}][{k}] = w[{i}];"),
                        None => format!("res[{j}][{k}] = 0.0;"),
                    };
                    let _ = writeln!(s, "    {line}");
                }
            }
            let _ = writeln!(s, "}}");
            let _ = writeln!(s);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{SymMatrix, trace};

    fn sample_function(name: &str) -> Function {
        let (graph, (x, f_mat)) = trace(|| {
            let x = SymMatrix::sym("x", 2, 1);
            let f_mat = &x.element(0, 0) * &x.element(1, 0).sin();
            (x, f_mat)
        });
        Function::compile(&graph, name, &[x], &[f_mat]).unwrap()
    }

    #[test]
    fn c_output_contains_signature_and_tape() {
        let dir = std::env::temp_dir().join("eskf_designer_codegen_c");
        let mut generator = CodeGenerator::new("unit", CodeGenOptions::default());
        generator.add(sample_function("fsin"));
        let path = generator.generate(&dir).unwrap();
        let src = fs::read_to_string(&path).unwrap();
        assert!(src.contains("void fsin(const double* const* arg, double* const* res)"));
        assert!(src.contains("sin(w["));
        assert!(src.contains("#include <math.h>"));
        let header = fs::read_to_string(dir.join("unit.h")).unwrap();
        assert!(header.contains("#ifndef UNIT_H"));
        assert!(header.contains("void fsin(const double* const* arg, double* const* res);"));
    }

    #[test]
    fn with_mem_adds_workspace_argument_and_size_query() {
        let dir = std::env::temp_dir().join("eskf_designer_codegen_mem");
        let options = CodeGenOptions {
            with_mem: true,
            with_header: false,
            ..Default::default()
        };
        let mut generator = CodeGenerator::new("unit_mem", options);
        generator.add(sample_function("fsin"));
        let path = generator.generate(&dir).unwrap();
        let src = fs::read_to_string(&path).unwrap();
        assert!(src.contains("double* w)"));
        assert!(src.contains("int fsin_work(void)"));
        assert!(!src.contains("double w["));
    }

    #[test]
    fn rust_output_compilable_shape() {
        let dir = std::env::temp_dir().join("eskf_designer_codegen_rs");
        let options = CodeGenOptions {
            language: TargetLanguage::Rust,
            ..Default::default()
        };
        let mut generator = CodeGenerator::new("unit_rs", options);
        generator.add(sample_function("fsin"));
        let path = generator.generate(&dir).unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("rs"));
        let src = fs::read_to_string(&path).unwrap();
        assert!(src.contains("pub fn fsin(arg: &[&[f64]], res: &mut [&mut [f64]])"));
        assert!(src.contains(".sin();"));
    }

    #[test]
    fn generate_is_idempotent() {
        let dir = std::env::temp_dir().join("eskf_designer_codegen_idem");
        let mut generator = CodeGenerator::new("unit_idem", CodeGenOptions::default());
        generator.add(sample_function("fsin"));
        let first = generator.generate(&dir).unwrap();
        let a = fs::read_to_string(&first).unwrap();
        let second = generator.generate(&dir).unwrap();
        let b = fs::read_to_string(&second).unwrap();
        assert_eq!(first, second);
        assert_eq!(a, b);
    }

    #[test]
    fn with_main_emits_entry_point() {
        let dir = std::env::temp_dir().join("eskf_designer_codegen_main");
        let options = CodeGenOptions {
            with_main: true,
            with_header: false,
            ..Default::default()
        };
        let mut generator = CodeGenerator::new("unit_main", options);
        generator.add(sample_function("fsin"));
        let path = generator.generate(&dir).unwrap();
        let src = fs::read_to_string(&path).unwrap();
        assert!(src.contains("int main(void)"));
        assert!(src.contains("#include <stdio.h>"));
        assert!(src.contains("fsin(arg, res);"));
    }
}
