//! Vigil agent
//!
//! Collects GPU metrics from a standalone hostengine, exposes them for
//! scraping and forwards every snapshot to a remote endpoint. SIGHUP
//! restarts the pipeline in place.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_agent::signals::UnixSignals;
use vigil_agent::{Agent, AgentConfig, AgentError, DcgmCollaborators, FileConfig};
use vigil_shared::utils::parse_duration;

#[derive(Parser, Debug)]
#[command(name = "vigil-agent")]
#[command(about = "GPU metrics agent for DCGM hostengines", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file, overridden by flags
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// CSV file listing additional fields to collect
    #[arg(short = 'f', long, env = "VIGIL_COLLECTORS")]
    collectors: Option<PathBuf>,

    /// Address of the local exposition server
    #[arg(short = 'a', long, env = "VIGIL_ADDRESS")]
    address: Option<String>,

    /// Collection interval (e.g., "20s", "500ms")
    #[arg(short = 'c', long, env = "VIGIL_COLLECT_INTERVAL")]
    collect_interval: Option<String>,

    /// host:port of the running nv-hostengine
    #[arg(short = 'r', long, env = "VIGIL_REMOTE_HOSTENGINE")]
    remote_hostengine: Option<String>,

    /// Path to the dcgmi binary
    #[arg(long, env = "VIGIL_DCGMI")]
    dcgmi: Option<PathBuf>,

    /// Base URL of the forwarding endpoint
    #[arg(long, env = "VIGIL_FORWARD_URL")]
    forward_url: Option<String>,

    #[arg(long, env = "VIGIL_FORWARD_PORT")]
    forward_port: Option<u16>,

    #[arg(long, env = "VIGIL_FORWARD_PATH")]
    forward_path: Option<String>,

    /// Omit the Hostname label
    #[arg(short = 'n', long, env = "VIGIL_NO_HOSTNAME")]
    no_hostname: bool,

    /// Debug logging
    #[arg(short, long, env = "VIGIL_DEBUG")]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "VIGIL_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print version and platform information
    Version {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install().map_err(|e| anyhow!("failed to install error reports: {}", e))?;

    let args = Args::parse();

    if let Some(Command::Version { json }) = args.command {
        print_version(json)?;
        return Ok(());
    }

    init_tracing(args.debug, args.log_json);

    let config = build_config(&args).context("Invalid configuration")?;
    info!("Starting vigil agent {}", env!("CARGO_PKG_VERSION"));
    debug!("Configuration: {:?}", config);

    let mut signals = UnixSignals::new().context("Failed to install signal handlers")?;
    let mut agent = Agent::new(config, Arc::new(DcgmCollaborators));
    agent
        .run(&mut signals)
        .await
        .context("failed to run the vigil agent")?;

    Ok(())
}

/// Defaults, then the config file, then flags and environment
fn build_config(args: &Args) -> Result<AgentConfig, AgentError> {
    let mut config = AgentConfig::default();

    if let Some(path) = &args.config {
        config.apply_file(FileConfig::load(path)?)?;
    }
    if let Some(path) = &args.collectors {
        config.collectors_path = Some(path.clone());
    }
    if let Some(addr) = &args.address {
        config.listen_addr = addr.clone();
    }
    if let Some(interval) = &args.collect_interval {
        let interval = parse_duration(interval).map_err(|e| {
            AgentError::config(format!("collect interval {:?}: {}", interval, e))
        })?;
        config.set_collect_interval(interval);
    }
    if let Some(addr) = &args.remote_hostengine {
        config.remote_hostengine = addr.clone();
    }
    if let Some(path) = &args.dcgmi {
        config.dcgmi_path = path.clone();
    }
    if let Some(url) = &args.forward_url {
        config.forward.url = url.clone();
    }
    if let Some(port) = args.forward_port {
        config.forward.port = port;
    }
    if let Some(path) = &args.forward_path {
        config.forward.path = path.clone();
    }
    if args.no_hostname {
        config.no_hostname = true;
    }
    config.debug = args.debug;

    config.validate()?;
    Ok(config)
}

fn print_version(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let commit = option_env!("VIGIL_BUILD_COMMIT").unwrap_or("unknown");
    let platform = format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH);

    if json {
        let info = serde_json::json!({
            "version": version,
            "commit": commit,
            "platform": platform,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("vigil-agent {}", version);
        println!("commit: {}", commit);
        println!("platform: {}", platform);
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}
