use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use caffe_optimizer::infer::EquivalenceConfig;
use caffe_optimizer::io::{fuse_files, FuseOptions};
use caffe_optimizer::TransformError;

/// Fold BatchNorm and Scale layers into the preceding Convolution
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Network definition (prototxt)
    #[arg(short, long)]
    deploy: PathBuf,

    /// Trained weights (caffemodel)
    #[arg(short, long)]
    model: PathBuf,

    /// Compare predictions of the original and fused networks on random input
    #[arg(short, long)]
    test: bool,

    /// Seed for the random test input
    #[arg(long, requires = "test")]
    seed: Option<u64>,

    /// Epsilon added to the BatchNorm variance
    #[arg(long, default_value_t = 1e-5)]
    epsilon: f32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), TransformError> {
    let mut options = FuseOptions::default().with_epsilon(cli.epsilon);
    if cli.test {
        let mut config = EquivalenceConfig::default();
        if let Some(seed) = cli.seed {
            config = config.with_seed(seed);
        }
        options = options.with_equivalence_check(config);
    }

    let stats = fuse_files(&cli.deploy, &cli.model, options)?;

    println!(
        "{} -> {} layers ({} chains folded)",
        stats.original_layers, stats.fused_layers, stats.chains_fused
    );
    println!("  {}", stats.deploy_output.display());
    println!("  {}", stats.model_output.display());

    if let Some(report) = &stats.equivalence {
        println!(
            "{} vs {} (max abs diff {:.3e}, seed {})",
            report.original_class, report.fused_class, report.max_abs_diff, report.seed
        );
    }

    Ok(())
}
