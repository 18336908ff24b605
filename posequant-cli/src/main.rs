use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::{Parser, Subcommand};
use posequant::{
    Pipeline, PipelineError, PipelineSettings, TargetFormat, TargetPlatform,
    data::{CalibrationSource, ImageFolder, SyntheticSource},
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "POSEQUANT_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate, quantize and export a float ONNX model.
    Convert {
        /// Path to the float ONNX model.
        #[arg(short, long)]
        model: PathBuf,

        /// Directory of calibration images, searched recursively.
        #[arg(long, required_unless_present = "synthetic", conflicts_with = "synthetic")]
        calib_dir: Option<PathBuf>,

        /// Calibrate on this many seeded random samples instead of images.
        #[arg(long)]
        synthetic: Option<usize>,

        /// Seed of the synthetic samples.
        #[arg(long, default_value = "0", requires = "synthetic")]
        seed: u64,

        /// JSON run configuration.
        #[arg(short, long, env = "POSEQUANT_CONFIG")]
        config: PathBuf,

        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Base name of the artifacts, defaults to the model file stem.
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long, value_delimiter = ',', default_value = "onnx,espdl")]
        format: Vec<TargetFormat>,
    },

    /// Lower an int8 QDQ ONNX model to the device format without recalibrating.
    Lower {
        /// Path to the QDQ ONNX model.
        #[arg(short, long)]
        model: PathBuf,

        #[arg(short, long, default_value = "esp32p4")]
        platform: TargetPlatform,

        /// Device artifact, defaults to the model path with an `.espdl` extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the inputs, outputs and operators of an ONNX model.
    Inspect {
        #[arg(short, long)]
        model: PathBuf,
    },
}

fn setup_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("Setting up logging failed")
    } else {
        let subscriber = tracing_subscriber::fmt()
            .compact()
            .with_level(true)
            .with_file(false)
            .with_line_number(false)
            .with_target(false)
            .without_time()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("Setting up logging failed")
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Convert {
            model,
            calib_dir,
            synthetic,
            seed,
            config,
            output_dir,
            name,
            format,
        } => {
            let settings = PipelineSettings::from_file(&config)?;
            let source: Box<dyn CalibrationSource> = match (calib_dir, synthetic) {
                (Some(dir), _) => Box::new(ImageFolder::open(dir, &settings.input_shape)?),
                (None, Some(count)) => Box::new(SyntheticSource::new(count, settings.input_shape.clone(), seed)),
                (None, None) => anyhow::bail!("either --calib-dir or --synthetic is required"),
            };
            let base_name = match name {
                Some(name) => name,
                None => model
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .context("model path has no file name")?,
            };
            info!("converting {} for {}", model.display(), settings.platform);
            let handles = Pipeline::new(settings).run(&model, source.as_ref(), &output_dir, &base_name, &format)?;
            for handle in handles {
                println!("{}", serde_json::to_string(&handle)?);
            }
        }
        Command::Lower { model, platform, output } => {
            let output = output.unwrap_or_else(|| model.with_extension(TargetFormat::Espdl.extension()));
            info!("lowering {} for {}", model.display(), platform);
            let handle = posequant::lower_quantized(&model, platform, &output)?;
            println!("{}", serde_json::to_string(&handle)?);
        }
        Command::Inspect { model } => {
            let graph = posequant::load(&model)?;
            print!("{}", graph.summary());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = setup_logging(args.json_logs) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<PipelineError>() {
                Some(e) => eprintln!("error: {e}"),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
