//! ESKF DESIGNER: derive and emit error-state Kalman filter functions.
//!
//! Runs the bundled attitude model (or a model selected in a JSON
//! configuration file) through the filter designer and writes the six
//! generated functions -- `f`, `df_dx`, `df_dw`, `h`, `dh_dx`, `dh_dv` -- as
//! standalone C or Rust source into the output directory.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use serde::Deserialize;

use eskf_designer::attitude::AttitudeModel;
use eskf_designer::codegen::{CodeGenOptions, TargetLanguage};
use eskf_designer::designer::FilterDesigner;

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Derive error-state Kalman filter functions and emit them as source code."
)]
struct Cli {
    /// Name of the generated unit (used for file and header names)
    #[arg(short, long, default_value = "attitude_filter")]
    name: String,

    /// Directory the generated source is written into
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Output dialect
    #[arg(short, long, value_enum, default_value_t = TargetLanguage::C)]
    language: TargetLanguage,

    /// Skip the C header file
    #[arg(long)]
    no_header: bool,

    /// Emit a smoke-test main alongside the functions
    #[arg(long)]
    with_main: bool,

    /// Generated functions take caller-provided work buffers
    #[arg(long)]
    with_mem: bool,

    /// Keep structural zeros in the Jacobians instead of densifying them
    #[arg(long)]
    sparse: bool,

    /// Load generation options from a JSON configuration file
    /// (overrides the individual flags)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the derived symbolic expressions before generating code
    #[arg(long)]
    print_expressions: bool,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// JSON configuration mirroring the command line flags.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct FileConfig {
    name: String,
    output_dir: PathBuf,
    options: CodeGenOptions,
    dense: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            name: "attitude_filter".to_string(),
            output_dir: PathBuf::from("."),
            options: CodeGenOptions::default(),
            dense: true,
        }
    }
}

fn init_logger(log_level: &str) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });
    builder.try_init()?;
    Ok(())
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let (name, output_dir, options, dense) = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            let config: FileConfig = serde_json::from_str(&text)?;
            info!("loaded configuration from {}", path.display());
            (config.name, config.output_dir, config.options, config.dense)
        }
        None => {
            let options = CodeGenOptions {
                language: cli.language,
                with_header: !cli.no_header,
                with_main: cli.with_main,
                verbose: true,
                with_mem: cli.with_mem,
            };
            (
                cli.name.clone(),
                cli.output_dir.clone(),
                options,
                !cli.sparse,
            )
        }
    };

    let designer = FilterDesigner::new(&AttitudeModel, &name, options, dense)?;
    if cli.print_expressions {
        println!("{}", designer.describe_expressions());
    }
    info!("compiled functions:\n{}", designer.describe_functions());
    let path = designer.generate_code(&output_dir)?;
    info!("wrote {}", path.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logger(&cli.log_level) {
        eprintln!("Failed to initialize logger: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = run(&cli) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
