//! p2p-chunk-share - Main entry point
//!
//! Runs either the central tracker or a peer sharing a local directory.

use anyhow::{Context, Result};
use p2p_chunk_share::{
    CliArgs, Config, FixedStunClient, PeerRuntime, Role, StunClient, StunMapping, TrackerConfig,
    TrackerService,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        let location = panic_info.location().unwrap();

        error!(
            "PANIC occurred at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic handler
    setup_panic_handler();

    // Parse CLI arguments
    let args = CliArgs::parse_args();

    // Initialize logging
    init_logging(&args);
    info!("p2p-chunk-share starting");
    debug!("CLI arguments: {:?}", args);

    // Operator-supplied NAT mapping, when hole punching
    let stun = stun_client_from_args(&args)?;

    // Create configuration
    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    match config {
        Config::Tracker(tracker) => run_tracker(tracker).await,
        Config::Peer(settings) => {
            let runtime = PeerRuntime::start(settings, stun)
                .await
                .context("Failed to start peer")?;
            runtime.run_command_loop().await?;
            info!("p2p-chunk-share finished");
            Ok(())
        }
    }
}

/// Run the tracker until interrupted
async fn run_tracker(config: TrackerConfig) -> Result<()> {
    let (service, listener) = TrackerService::bind(config.port, config.signal_port)
        .await
        .context("Failed to start tracker")?;
    tokio::spawn(service.clone().run_signal_drain());
    service.run(listener).await
}

/// Build the STUN mapping from the operator-supplied public endpoint
fn stun_client_from_args(args: &CliArgs) -> Result<Option<Arc<dyn StunClient>>> {
    let Role::Peer {
        hole_punching,
        signal_port,
        external_ip,
        external_port,
        external_signal_port,
        ..
    } = &args.role
    else {
        return Ok(None);
    };
    if !*hole_punching {
        return Ok(None);
    }
    match (external_ip, external_port, external_signal_port) {
        (Some(ip), Some(port), Some(signal)) => Ok(Some(Arc::new(
            FixedStunClient::new(StunMapping {
                nat_type: "Full Cone".to_string(),
                external_ip: ip.clone(),
                external_port: *port,
            })
            .with_port(*signal_port, *signal),
        ))),
        _ => Err(anyhow::anyhow!(
            "--hole-punching requires --external-ip, --external-port and --external-signal-port"
        )),
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized successfully");
}
