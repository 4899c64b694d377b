use clap::Parser;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::path::PathBuf;

use connect4_net::logging::setup_logging;
use connect4_net::neural::export::{ExportOptions, Exporter, SafetensorsExporter};
use connect4_net::neural::model_io::load_exported;
use connect4_net::neural::tensor_conversion::{example_input, ExampleInput};
use connect4_net::neural::{DeviceChoice, NetworkConfig, NetworkOutput, NeuralManager};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Build the network and run one forward pass
    Probe,
    /// Probe, then write the exported graph to --output
    Export,
    /// Reload an exported graph from --output and run it
    Verify,
}

#[derive(Parser, Debug)]
#[command(name = "connect4_net", version, about)]
struct Config {
    #[arg(long, value_enum, default_value = "probe")]
    mode: Mode,

    /// JSON network config; unset fields keep their defaults
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the number of trunk convolutions
    #[arg(long)]
    trunk_depth: Option<usize>,

    /// Initialization seed
    #[arg(long)]
    seed: Option<u64>,

    /// Batch size of the example input
    #[arg(short = 'b', long, default_value_t = 5)]
    batch: i64,

    #[arg(long, value_enum, default_value = "randn")]
    input: ExampleInput,

    /// auto, cpu, mps, cuda or cuda:N
    #[arg(long, default_value = "auto")]
    device: DeviceChoice,

    #[arg(short = 'o', long, default_value = "connect4_net.safetensors")]
    output: PathBuf,

    #[arg(long, default_value_t = 16)]
    opset: u32,

    /// Fix the batch axis to --batch instead of exporting it as dynamic
    #[arg(long, default_value_t = false)]
    static_batch: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write rotating log files here instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn network_config(config: &Config) -> connect4_net::Result<NetworkConfig> {
    let mut network = match &config.config {
        Some(path) => NetworkConfig::from_json_file(path)?,
        None => NetworkConfig::default(),
    };
    if let Some(depth) = config.trunk_depth {
        network.trunk_depth = depth;
    }
    if config.seed.is_some() {
        network.seed = config.seed;
    }
    Ok(network)
}

fn report(output: &NetworkOutput) -> connect4_net::Result<()> {
    let values = Vec::<f32>::try_from(&output.value.flatten(0, -1))?;
    let policy = output.policy.flatten(1, -1);
    let best = Vec::<i64>::try_from(&policy.argmax(-1, false))?;
    let best_mass = Vec::<f32>::try_from(&policy.max_dim(-1, false).0)?;

    log::info!(
        "value {:?}, policy {:?}",
        output.value.size(),
        output.policy.size()
    );
    for (idx, value) in values.iter().enumerate() {
        println!(
            "#{idx}: value {value:+.4}, best cell {} (p={:.4})",
            best[idx], best_mass[idx]
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    let _logger = setup_logging(&config.log_level, config.log_dir.as_deref())?;

    let network = network_config(&config)?;
    let mut rng = StdRng::seed_from_u64(
        network
            .seed
            .unwrap_or_else(|| rand::rng().random_range(0..u64::MAX)),
    );

    match config.mode {
        Mode::Probe | Mode::Export => {
            let input = example_input(config.input, config.batch, &network, &mut rng)?;
            let manager = NeuralManager::with_config(network, config.device)?;
            println!("{}", manager.summary());

            let output = manager.evaluate(&input)?;
            report(&output)?;

            if config.mode == Mode::Export {
                let options = ExportOptions {
                    dynamic_batch_axis: !config.static_batch,
                    opset_version: config.opset,
                    ..ExportOptions::default()
                };
                let exported =
                    SafetensorsExporter.export(&manager, &input, &config.output, &options)?;
                println!(
                    "💾 {} tensors written to {}",
                    exported.tensors,
                    exported.path.display()
                );
            }
        }
        Mode::Verify => {
            let manager = load_exported(&config.output, config.device)?;
            println!("{}", manager.summary());
            let input = example_input(config.input, config.batch, manager.config(), &mut rng)?;
            let output = manager.evaluate(&input)?;
            report(&output)?;
        }
    }
    Ok(())
}
