//! mixsim CLI
//!
//! Builds images, runs coin-mixing load-test scenarios, cleans up after
//! them and generates scenario files.

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use mixsim_driver::DriverKind;
use mixsim_orchestrator::genscen::{self, Distribution, GenscenOptions};
use mixsim_orchestrator::images::prepare_images;
use mixsim_orchestrator::{Simulation, SimulationConfig};
use mixsim_rpc::RpcConnector;
use mixsim_types::Scenario;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mixsim")]
#[command(about = "Coin-mixing load-test orchestrator")]
#[command(version)]
struct Cli {
    /// Runtime backend (docker, podman, kubernetes)
    #[arg(long, global = true)]
    driver: Option<DriverKind>,

    /// Skip log collection on shutdown
    #[arg(long, global = true)]
    no_logs: bool,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by the subcommands that touch the runtime.
#[derive(Args)]
struct RuntimeArgs {
    /// Docker network / Kubernetes namespace [default: coinjoin]
    #[arg(long)]
    namespace: Option<String>,

    /// Image registry prefix; images are pulled instead of built
    #[arg(long)]
    image_prefix: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or pull the images
    Build {
        #[command(flatten)]
        runtime: RuntimeArgs,

        /// Rebuild images even when present
        #[arg(long)]
        force_rebuild: bool,

        /// Scenario whose client versions to build
        #[arg(long)]
        scenario: Option<PathBuf>,
    },

    /// Run a simulation
    Run {
        #[command(flatten)]
        runtime: RuntimeArgs,

        /// Rebuild images even when present
        #[arg(long)]
        force_rebuild: bool,

        /// Scenario specification file
        #[arg(long)]
        scenario: Option<PathBuf>,

        /// Override the ledger node address handed to other entities
        #[arg(long)]
        btc_node_ip: Option<String>,

        /// Override the coordinator address handed to clients
        #[arg(long)]
        wasabi_backend_ip: Option<String>,

        /// Host at which published ports are reachable [default: localhost]
        #[arg(long)]
        control_ip: Option<String>,

        /// HTTP proxy to reach entities by internal address
        #[arg(long)]
        proxy: Option<String>,

        /// Use an existing namespace and keep it
        #[arg(long)]
        reuse_namespace: bool,
    },

    /// Stop and remove everything a run left behind
    Clean {
        #[command(flatten)]
        runtime: RuntimeArgs,

        /// Use an existing namespace and keep it
        #[arg(long)]
        reuse_namespace: bool,
    },

    /// Generate a scenario file
    Genscen {
        /// Number of wallets
        #[arg(long, default_value = "10")]
        client_count: usize,

        /// Fund distribution strategy (uniformsum, paretosum)
        #[arg(long, default_value = "uniformsum")]
        distribution: Distribution,

        /// Number of UTXOs per wallet
        #[arg(long, default_value = "30")]
        utxo_count: usize,

        /// Maximal number of inputs to a coinjoin
        #[arg(long, default_value = "400")]
        max_coinjoin: u64,

        /// Minimal number of inputs to a coinjoin
        #[arg(long, default_value = "4")]
        min_coinjoin: u64,

        /// Terminate after N coinjoin rounds, 0 for no limit
        #[arg(long, default_value = "0")]
        stop_round: u64,

        /// Terminate after N blocks, 0 for no limit
        #[arg(long, default_value = "120")]
        stop_block: u64,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,

        /// Output directory
        #[arg(long, default_value = "scenarios")]
        out_dir: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "warn,mixsim=info,mixsim_orchestrator=info,mixsim_driver=info,mixsim_rpc=info",
            )
        }))
        .init();
}

fn load_config(cli: &Cli, runtime: &RuntimeArgs) -> anyhow::Result<SimulationConfig> {
    let mut config = match &cli.config {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(driver) = cli.driver {
        config = config.with_driver(driver);
    }
    if cli.no_logs {
        config = config.with_collect_logs(false);
    }
    if let Some(namespace) = &runtime.namespace {
        let reuse = config.reuse_namespace;
        config = config.with_namespace(namespace.clone(), reuse);
    }
    if let Some(prefix) = &runtime.image_prefix {
        config = config.with_image_prefix(prefix.clone());
    }
    Ok(config)
}

fn load_scenario(path: Option<&PathBuf>) -> anyhow::Result<Scenario> {
    match path {
        Some(path) => Scenario::load(path)
            .with_context(|| format!("Cannot load scenario {}", path.display())),
        None => Ok(Scenario::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Genscen {
            client_count,
            distribution,
            utxo_count,
            max_coinjoin,
            min_coinjoin,
            stop_round,
            stop_block,
            force,
            out_dir,
        } => {
            // Output goes to stdout, no tracing needed
            let options = GenscenOptions {
                client_count: *client_count,
                distribution: *distribution,
                utxo_count: *utxo_count,
                max_coinjoin: *max_coinjoin,
                min_coinjoin: *min_coinjoin,
                stop_round: *stop_round,
                stop_block: *stop_block,
            };
            let scenario = genscen::generate(&options, &mut rand::thread_rng())?;
            let path = genscen::write(&scenario, out_dir, *force)?;
            println!("Scenario generated and saved to {}", path.display());
            println!("- requires {} BTC", scenario.total_funds().to_btc_string());
        }

        Commands::Build {
            runtime,
            force_rebuild,
            scenario,
        } => {
            init_tracing();
            let config = load_config(&cli, runtime)?.with_force_rebuild(*force_rebuild);
            let scenario = load_scenario(scenario.as_ref())?;
            let driver = mixsim_driver::connect(config.driver, config.driver_options());
            prepare_images(driver.as_ref(), &config, &scenario.client_versions()).await?;
            info!("Images ready");
        }

        Commands::Clean {
            runtime,
            reuse_namespace,
        } => {
            init_tracing();
            let mut config = load_config(&cli, runtime)?;
            if *reuse_namespace {
                let namespace = config.namespace.clone();
                config = config.with_namespace(namespace, true);
            }
            let driver = mixsim_driver::connect(config.driver, config.driver_options());
            driver.cleanup(&config.image_prefix).await?;
            info!("Cleanup complete");
        }

        Commands::Run {
            runtime,
            force_rebuild,
            scenario,
            btc_node_ip,
            wasabi_backend_ip,
            control_ip,
            proxy,
            reuse_namespace,
        } => {
            init_tracing();
            let mut config = load_config(&cli, runtime)?
                .with_force_rebuild(*force_rebuild)
                .with_address_overrides(btc_node_ip.clone(), wasabi_backend_ip.clone());
            if proxy.is_some() {
                config = config.with_proxy(proxy.clone());
            }
            if let Some(control_ip) = control_ip {
                config = config.with_control_ip(control_ip.clone());
            }
            if *reuse_namespace {
                let namespace = config.namespace.clone();
                config = config.with_namespace(namespace, true);
            }
            config.validate()?;
            let scenario = load_scenario(scenario.as_ref())?;

            let driver = mixsim_driver::connect(config.driver, config.driver_options());
            let connector = Arc::new(RpcConnector::new(config.proxy.clone()));

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, shutting down");
                    interrupt.cancel();
                }
            });

            let simulation = Simulation::new(driver, connector, config, scenario);
            let (summary, result) = simulation.run(cancel).await;
            if let Some(archive) = &summary.archive {
                info!(archive = %archive.display(), "Logs archived");
            }
            if let Err(e) = result {
                eprintln!("Simulation failed: {e}");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
