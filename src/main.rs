use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pylon_host::runtime::Runtime;
use pylon_host::{
    ContainerRuntime, DirectoryDiscovery, HostConfig, LocalProcessRuntime, PluginDescriptor,
    PluginManager, PluginRegistry, PortAllocator, RemoteServiceRuntime,
};

/// Pylon - plugin lifecycle orchestrator for AI assistant capabilities
#[derive(Parser)]
#[command(name = "pylond", version, about)]
struct Cli {
    /// Path to the config file (defaults to ~/.config/pylon/config.toml)
    #[arg(short, long, env = "PYLON_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Additional plugin descriptor directory (repeatable)
    #[arg(long = "plugin-dir")]
    plugin_dirs: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the host until interrupted
    Run {
        /// Load every discovered plugin automatically
        #[arg(long, env = "PYLON_AUTO_LOAD")]
        auto_load: bool,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Validate a plugin descriptor file
    Descriptor {
        /// Path to a *.plugin.json file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let result = match cli.command {
        Some(Command::CheckConfig) => check_config(cli.config.as_deref()),
        Some(Command::Descriptor { path }) => check_descriptor(&path),
        Some(Command::Run { auto_load }) => {
            run_host(cli.config.as_deref(), cli.plugin_dirs, auto_load).await
        }
        None => run_host(cli.config.as_deref(), cli.plugin_dirs, false).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn check_config(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = HostConfig::load(config_path).context("failed to load configuration")?;

    println!("configuration OK");
    println!("  protocol version : {}", config.handshake.protocol_version);
    println!(
        "  port range       : {}..={}",
        config.ports.start, config.ports.end
    );
    println!("  registry TTL     : {:?}", config.registry_ttl);
    println!(
        "  failure threshold: {}",
        config.manager.failure_threshold
    );
    println!("  plugin dirs      :");
    for dir in &config.plugin_dirs {
        println!("    {}", dir.display());
    }
    Ok(())
}

fn check_descriptor(path: &std::path::Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let descriptor: PluginDescriptor =
        serde_json::from_str(&content).context("descriptor does not parse")?;
    descriptor.validate().context("descriptor is invalid")?;

    println!(
        "{} OK: {} v{} ({} deployment)",
        descriptor.id,
        descriptor.name,
        descriptor.version,
        descriptor.kind()
    );
    Ok(())
}

async fn run_host(
    config_path: Option<&std::path::Path>,
    extra_plugin_dirs: Vec<PathBuf>,
    auto_load: bool,
) -> anyhow::Result<()> {
    let mut config = HostConfig::load(config_path).context("failed to load configuration")?;
    config.plugin_dirs.extend(extra_plugin_dirs);
    if auto_load {
        config.manager.auto_load = true;
    }

    let ports = Arc::new(
        PortAllocator::new(config.ports.start, config.ports.end)
            .context("failed to build the port allocator")?,
    );
    let registry = Arc::new(PluginRegistry::new(config.registry_ttl));

    let mut runtimes: Vec<Arc<dyn Runtime>> = vec![
        Arc::new(LocalProcessRuntime::new(
            config.handshake.clone(),
            Arc::clone(&ports),
            config.process.clone(),
        )),
        Arc::new(RemoteServiceRuntime::new(
            config.handshake.clone(),
            config.remote.clone(),
        )),
    ];
    match ContainerRuntime::new(
        config.handshake.clone(),
        Arc::clone(&ports),
        config.container.clone(),
    ) {
        Ok(container) => runtimes.push(Arc::new(container)),
        Err(e) => {
            tracing::warn!(error = %e, "container deployments disabled");
        }
    }

    let discovery = Arc::new(DirectoryDiscovery::new(config.plugin_dirs.clone()));

    let manager = Arc::new(PluginManager::new(
        config.manager.clone(),
        registry,
        runtimes,
        ports,
        Some(discovery.clone()),
    ));
    PluginManager::start(&manager);

    // Load what is already on disk before the first discovery tick
    if config.manager.auto_load {
        use pylon_host::Discovery as _;
        match discovery.discover().await {
            Ok(descriptors) => {
                for descriptor in descriptors {
                    let id = descriptor.id.clone();
                    if let Err(e) = manager.load(descriptor).await {
                        tracing::warn!(id = %id, error = %e, "initial plugin load failed");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "initial discovery scan failed"),
        }
    }

    tracing::info!(
        plugins = manager.list().await.len(),
        "pylon host running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    manager.shutdown().await;
    tracing::info!("pylon host stopped");
    Ok(())
}
