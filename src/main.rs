//! SmartMotor link daemon
//!
//! Runs one side of the link (or the relay hub) with simulated hardware:
//!
//! ```bash
//! smartmotor receiver                      # listen on 0.0.0.0:4080
//! smartmotor controller --peer 10.0.0.7:4080
//! smartmotor --mode cooperative controller # single-threaded tick loop
//! smartmotor relay --bind 0.0.0.0:4090     # hub for relayed mode
//! smartmotor config --output link.toml     # write defaults
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};

use smartmotor_link::clock::MonotonicClock;
use smartmotor_link::config::{LinkConfig, TransportMode};
use smartmotor_link::contracts::Role;
use smartmotor_link::hardware::{
    AdcAngleSensor, ConsoleDisplay, Servo, ServoModel, SimulatedKnob, SimulatedPwm,
};
use smartmotor_link::roles::{run_cooperative, Controller, Receiver};
use smartmotor_link::session::ConnectionSession;
use smartmotor_link::transport::{Connector, StreamSettings, TcpAcceptor, TcpDialer};
use smartmotor_link::{relay, LinkError};

#[derive(Parser)]
#[command(name = "smartmotor")]
#[command(about = "Resilient SmartMotor controller/receiver link")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scheduling model for the link
    #[arg(short, long, value_enum, default_value_t = Mode::Threaded)]
    mode: Mode,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Dedicated send and receive threads
    Threaded,
    /// Single non-blocking tick loop
    Cooperative,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the (simulated) potentiometer and stream angles
    Controller {
        /// Receiver address in direct mode
        #[arg(short, long)]
        peer: Option<SocketAddr>,

        /// Dial the relay hub instead of the receiver
        #[arg(long)]
        relay: bool,
    },

    /// Drive the (simulated) servo from received angles
    Receiver {
        /// Listen address in direct mode
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Dial the relay hub instead of listening
        #[arg(long)]
        relay: bool,
    },

    /// Pair a controller and a receiver that cannot reach each other
    Relay {
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Write the default configuration to a file
    Config {
        #[arg(short, long, default_value = "smartmotor.toml")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        error!("{:#}", e);
        if matches!(e.downcast_ref::<LinkError>(), Some(LinkError::Fatal(_))) {
            error!("link requires a manual restart");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => LinkConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LinkConfig::default(),
    };

    match cli.command {
        Commands::Controller { peer, relay } => {
            if let Some(peer) = peer {
                config.transport.peer_addr = peer;
            }
            if relay {
                config.transport.mode = TransportMode::Relay;
            }
            run_controller(&config, cli.mode)
        }
        Commands::Receiver { listen, relay } => {
            if let Some(listen) = listen {
                config.transport.listen_addr = listen;
            }
            if relay {
                config.transport.mode = TransportMode::Relay;
            }
            run_receiver(&config, cli.mode)
        }
        Commands::Relay { bind } => {
            let addr = bind.unwrap_or(config.transport.relay_addr);
            relay::run_until_interrupted(addr).context("relay failed")
        }
        Commands::Config { output } => {
            config
                .save_to_file(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            info!("configuration written to {}", output.display());
            Ok(())
        }
    }
}

fn stream_settings(config: &LinkConfig, mode: Mode) -> StreamSettings {
    match mode {
        Mode::Threaded => StreamSettings::threaded(&config.session),
        Mode::Cooperative => StreamSettings::cooperative(&config.session),
    }
}

fn build_connector(config: &LinkConfig, role: Role, mode: Mode) -> Result<Box<dyn Connector>> {
    let settings = stream_settings(config, mode);
    let transport = &config.transport;
    let connector: Box<dyn Connector> = match (transport.mode, role) {
        (TransportMode::Relay, _) => {
            info!("{} dialing relay at {}", role, transport.relay_addr);
            Box::new(TcpDialer::new(transport.relay_addr, settings).via_relay())
        }
        (TransportMode::Direct, Role::Controller) => {
            info!("controller dialing receiver at {}", transport.peer_addr);
            Box::new(TcpDialer::new(transport.peer_addr, settings))
        }
        (TransportMode::Direct, Role::Receiver) => Box::new(
            TcpAcceptor::bind(transport.listen_addr, settings)
                .with_context(|| format!("binding {}", transport.listen_addr))?,
        ),
    };
    Ok(connector)
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;
    Ok(shutdown)
}

fn run_controller(config: &LinkConfig, mode: Mode) -> Result<()> {
    config.validate()?;
    let clock = MonotonicClock::shared();
    let connector = build_connector(config, Role::Controller, mode)?;
    let mut session = ConnectionSession::from_config(config, Role::Controller, connector, clock.clone());
    let shutdown = install_shutdown_handler()?;

    let sensor = AdcAngleSensor::new(SimulatedKnob::new(2048, 40.0));
    let mut controller = Controller::from_config(sensor, ConsoleDisplay::new(), config, clock);

    match mode {
        Mode::Threaded => controller.run_threaded(session, shutdown)?,
        Mode::Cooperative => {
            let period = Duration::from_millis(config.controller.sample_interval_ms);
            run_cooperative(&mut controller, &mut session, &shutdown, period)?
        }
    }
    info!("controller stopped");
    Ok(())
}

fn run_receiver(config: &LinkConfig, mode: Mode) -> Result<()> {
    config.validate()?;
    let clock = MonotonicClock::shared();
    let connector = build_connector(config, Role::Receiver, mode)?;
    let mut session = ConnectionSession::from_config(config, Role::Receiver, connector, clock);
    let shutdown = install_shutdown_handler()?;

    let servo = Servo::new(ServoModel::default(), SimulatedPwm::new());
    let mut receiver = Receiver::new(servo, ConsoleDisplay::new(), config.receiver.clone());

    match mode {
        Mode::Threaded => receiver.run_threaded(session, shutdown)?,
        Mode::Cooperative => {
            let period = config.session.poll_timeout();
            run_cooperative(&mut receiver, &mut session, &shutdown, period)?
        }
    }
    info!("receiver stopped");
    Ok(())
}
