//! CAPI gateway main application

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use capi_gateway::{
    capi::transport::{ControllerProfile, SimulatedTransport},
    capi::CapiTransport,
    config::CapiConfig,
    core::call::{CallFrame, ControlEvent},
    core::engine::{CapiEngine, IncomingCall},
    utils::setup_logging,
    Result,
};

#[derive(Parser)]
#[command(name = "capi-gateway")]
#[command(about = "ISDN call control over CAPI 2.0")]
#[command(version = capi_gateway::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level overriding the configuration (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Start,
    /// Check engine status
    Status,
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_configuration(&cli)?;
    setup_logging(&config.logging, cli.log_level.as_deref())?;

    info!("Starting {} v{}", capi_gateway::NAME, capi_gateway::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => run_engine(config),
        Some(Commands::Status) => show_status(),
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()),
    }
}

fn load_configuration(cli: &Cli) -> Result<CapiConfig> {
    let config = if let Some(config_path) = &cli.config {
        CapiConfig::load_from_file(config_path)?
    } else {
        match CapiConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => CapiConfig::default_config(),
        }
    };

    config.validate()?;
    Ok(config)
}

fn run_engine(config: CapiConfig) -> Result<()> {
    info!("Initializing CAPI engine");

    // The kernel capi20 binding is an external component; this binary
    // drives the engine over the in-memory adapter so that the whole
    // signaling and voice path can be exercised standalone.
    let transport: Arc<dyn CapiTransport> = Arc::new(SimulatedTransport::new(vec![
        ControllerProfile::default(),
    ]));

    let engine = CapiEngine::new(transport, &config)?;
    let incoming = engine
        .take_incoming_receiver()
        .ok_or_else(|| capi_gateway::Error::internal("incoming receiver already taken"))?;
    engine.start()?;

    // consume incoming calls: log the events each call produces
    let consumer = std::thread::spawn(move || incoming_loop(incoming));

    loop {
        std::thread::sleep(Duration::from_secs(1));
        if engine.is_failed() {
            error!("engine hit a fatal transport error, shutting down");
            break;
        }
        if !engine.is_running() {
            break;
        }
    }

    engine.stop();
    drop(consumer);
    info!("CAPI gateway shutdown complete");
    Ok(())
}

fn incoming_loop(incoming: mpsc::Receiver<IncomingCall>) {
    while let Ok(call) = incoming.recv() {
        info!("incoming call '{}' -> '{}'", call.caller, call.called);
        std::thread::spawn(move || {
            while let Ok(frame) = call.handle.frames.recv() {
                match frame {
                    CallFrame::Voice(_) => {}
                    CallFrame::Digit(d) => info!("digit '{}'", d),
                    CallFrame::Control(ControlEvent::Hangup { cause }) => {
                        info!("call ended (cause={})", cause);
                        break;
                    }
                    CallFrame::Control(event) => info!("call event {:?}", event),
                }
            }
        });
    }
    warn!("incoming call stream closed");
}

fn show_status() -> Result<()> {
    // would connect to a running instance and query its status
    println!("Status command not implemented (inspect the logs of the running process)");
    Ok(())
}

fn validate_configuration(config: &CapiConfig) -> Result<()> {
    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!("  Lines: {}", config.lines.len());
    for line in &config.lines {
        println!(
            "  - {} ({} channels, controllers {:?}, mode {:?})",
            line.name, line.devices, line.controllers, line.isdn_mode
        );
    }
    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = CapiConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| capi_gateway::Error::internal(format!("Failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_generation() {
        assert!(generate_default_config(None).is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = CapiConfig::default_config();
        assert!(validate_configuration(&config).is_ok());
    }
}
