//! dlc CLI
//!
//! Builds the images of a buildspec and drives the EKS and EC2 test suites.

mod commands;

use clap::{Parser, Subcommand};
use dlc_core::{Environment, HarnessConfig};
use dlc_runtime::{CommandRunner, DryRunRunner, LocalRunner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// dlc - build and test harness for deep learning containers
#[derive(Parser, Debug)]
#[command(name = "dlc")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Harness config file (defaults to dlc.toml when present)
    #[arg(long, global = true, env = "DLC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level, overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print external commands instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the selected images of a buildspec
    Build {
        /// Path to the buildspec YAML
        #[arg(long)]
        buildspec: PathBuf,

        /// Framework the buildspec describes
        #[arg(long)]
        framework: String,

        /// Comma separated device types, or "all"
        #[arg(long = "device_types", default_value = "all")]
        device_types: String,

        /// Comma separated image types, or "all"
        #[arg(long = "image_types", default_value = "all")]
        image_types: String,

        /// Comma separated python versions, or "all"
        #[arg(long = "py_versions", default_value = "all")]
        py_versions: String,

        /// Push images after building
        #[arg(long)]
        push: bool,
    },

    /// Run a test suite against an image
    Test {
        #[command(subcommand)]
        suite: TestSuite,
    },

    /// Show the facts parsed from an image URI
    Image {
        /// Image URI
        uri: String,
    },
}

#[derive(Subcommand, Debug)]
enum TestSuite {
    /// TensorFlow Serving single-node inference on EKS
    EksTensorflow {
        /// Image URI
        #[arg(long)]
        image: String,

        /// Scenario to run (neuron, neuronx, half-plus-two, albert); all when omitted
        #[arg(long)]
        scenario: Option<String>,
    },

    /// MXNet inference throughput on an EC2 instance
    Ec2MxnetPerformance {
        /// Image URI
        #[arg(long)]
        image: String,

        /// Instance to connect to
        #[arg(long)]
        host: String,

        /// SSH user
        #[arg(long, default_value = "ubuntu")]
        user: String,

        /// SSH private key
        #[arg(long)]
        key: Option<PathBuf>,

        /// Case to run (gpu, cpu, graviton)
        #[arg(long)]
        case: String,
    },
}

fn init_logging(cli: &Cli, config: &HarnessConfig) -> anyhow::Result<()> {
    let level = match (&cli.log_level, cli.verbose) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => config.logging.level.clone(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder().with_env_filter(filter).with_target(false);

    let result = if config.logging.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.map_err(|e| anyhow::anyhow!("Failed to set subscriber: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = HarnessConfig::load(cli.config.as_deref())?;
    init_logging(&cli, &config)?;

    let runner: Arc<dyn CommandRunner> = if cli.dry_run {
        Arc::new(DryRunRunner::new())
    } else {
        Arc::new(LocalRunner::new())
    };
    let env = Environment::from_env();

    match cli.command {
        Commands::Build {
            buildspec,
            framework,
            device_types,
            image_types,
            py_versions,
            push,
        } => {
            let request = commands::BuildRequest {
                buildspec,
                framework,
                device_types,
                image_types,
                py_versions,
                push,
            };
            commands::build(runner, &config, &env, &request).await?;
        }
        Commands::Test { suite } => match suite {
            TestSuite::EksTensorflow { image, scenario } => {
                commands::eks_tensorflow(runner, &config, &env, &image, scenario.as_deref())
                    .await?;
            }
            TestSuite::Ec2MxnetPerformance {
                image,
                host,
                user,
                key,
                case,
            } => {
                let target = commands::Ec2Target { host, user, key };
                commands::ec2_mxnet_performance(runner, &config, &env, &image, &target, &case)
                    .await?;
            }
        },
        Commands::Image { uri } => {
            commands::image(&uri)?;
        }
    }

    Ok(())
}
