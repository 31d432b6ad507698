//! evsim - DC charging restbus simulator
//!
//! Simulates the charge station side of a DC charging session around a
//! charge controller. With the virtual transport the controller is simulated
//! as well; with SocketCAN the controller is real hardware.
//!
//! # Usage
//!
//! Hardware-free run:
//! ```bash
//! evsim --transport virtual
//! ```
//!
//! Against a controller on can0, mirroring the plug status onto the
//! vehicle-side network:
//! ```bash
//! evsim --transport socketcan --interface can0 --mode can
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use evsim_bus::{SignalBus, VirtualCan};
use evsim_charge::{ChargeSessionDriver, ControllerSimulator, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::EvsimConfig;

/// Time allowed for tasks to finish after the stop flag clears
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How pilot state C reaches the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Wired pilot, the vehicle side is driven externally
    Gpio,
    /// Pilot state mirrored onto the vehicle-side CAN network
    Can,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// In-process bus with a simulated charge controller
    Virtual,
    /// SocketCAN interface with a real charge controller
    Socketcan,
}

#[derive(Parser, Debug)]
#[command(name = "evsim")]
#[command(about = "DC charging restbus simulator")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pilot control mode
    #[arg(short, long, value_enum, default_value_t = Mode::Gpio)]
    mode: Mode,

    /// Bus transport
    #[arg(short, long, value_enum, default_value_t = Transport::Virtual)]
    transport: Transport,

    /// CAN interface name (overrides the config file)
    #[arg(short, long)]
    interface: Option<String>,

    /// Message catalog of the charge controller network
    #[arg(long)]
    station_catalog: Option<PathBuf>,

    /// Message catalog of the vehicle-side network
    #[arg(long)]
    vehicle_catalog: Option<PathBuf>,

    /// Print session events to stdout as JSON lines
    #[arg(long)]
    events_json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "evsim=debug,evsim_charge=debug,evsim_bus=debug"
    } else {
        "evsim=info,evsim_charge=info,evsim_bus=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            EvsimConfig::load(path)?
        }
        None => EvsimConfig::default(),
    };
    if let Some(interface) = &args.interface {
        config.transport.interface = interface.clone();
    }
    if let Some(path) = &args.station_catalog {
        config.transport.station_catalog = path.clone();
    }
    if let Some(path) = &args.vehicle_catalog {
        config.transport.vehicle_catalog = path.clone();
    }

    info!(mode = ?args.mode, transport = ?args.transport, "Starting evsim");
    if args.mode == Mode::Can {
        warn!("Simulation started in CAN mode, pilot state C has to be controlled manually");
    }

    let running = Arc::new(AtomicBool::new(true));
    let driver = Arc::new(ChargeSessionDriver::new(config.driver.clone()));

    if args.events_json {
        tokio::spawn(print_events(driver.subscribe()));
    }

    let (station, peer, simulator) = match args.transport {
        Transport::Virtual => open_virtual(&config, args.mode, running.clone()),
        Transport::Socketcan => {
            let (station, peer) = open_socketcan(&config, args.mode)?;
            (station, peer, None)
        }
    };

    let driver_task = spawn_driver(driver, station, peer, running.clone());
    supervise(driver_task, simulator, running).await
}

/// Virtual medium with the controller simulator as counterpart
fn open_virtual(
    config: &EvsimConfig,
    mode: Mode,
    running: Arc<AtomicBool>,
) -> (Arc<dyn SignalBus>, Option<Arc<dyn SignalBus>>, Option<JoinHandle<()>>) {
    let can = VirtualCan::with_cycle(Duration::from_millis(config.transport.cycle_ms));
    let station: Arc<dyn SignalBus> = Arc::new(can.node("EVSE"));
    let controller = can.node(config.transport.station_dut.as_str());
    let peer: Option<Arc<dyn SignalBus>> = match mode {
        Mode::Can => Some(Arc::new(can.node(config.transport.vehicle_dut.as_str()))),
        Mode::Gpio => None,
    };

    let simulator = ControllerSimulator::new(config.simulator.clone());
    let handle = tokio::spawn(async move {
        let should_continue = move || running.load(Ordering::SeqCst);
        match simulator.run(&controller, &should_continue).await {
            Ok(cycles) => info!(cycles, "Controller simulator stopped"),
            Err(e) => error!(error = %e, "Controller simulator failed"),
        }
    });

    (station, peer, Some(handle))
}

/// SocketCAN restbus against a real charge controller
#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn open_socketcan(
    config: &EvsimConfig,
    mode: Mode,
) -> Result<(Arc<dyn SignalBus>, Option<Arc<dyn SignalBus>>)> {
    use anyhow::Context;
    use evsim_bus::{CanSignalBus, MessageCatalog};

    let transport = &config.transport;
    let catalog = MessageCatalog::from_file(&transport.station_catalog).with_context(|| {
        format!("Failed to load {}", transport.station_catalog.display())
    })?;
    info!(
        path = %transport.station_catalog.display(),
        messages = catalog.len(),
        "Loaded station catalog"
    );
    let station: Arc<dyn SignalBus> = Arc::new(CanSignalBus::open(
        &transport.interface,
        catalog,
        transport.station_dut.as_str(),
    )?);

    let peer: Option<Arc<dyn SignalBus>> = match mode {
        Mode::Can => {
            let catalog = MessageCatalog::from_file(&transport.vehicle_catalog).with_context(|| {
                format!("Failed to load {}", transport.vehicle_catalog.display())
            })?;
            let peer = CanSignalBus::open(
                &transport.interface,
                catalog,
                transport.vehicle_dut.as_str(),
            )?;
            Some(Arc::new(peer))
        }
        Mode::Gpio => None,
    };

    Ok((station, peer))
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn open_socketcan(
    _config: &EvsimConfig,
    _mode: Mode,
) -> Result<(Arc<dyn SignalBus>, Option<Arc<dyn SignalBus>>)> {
    anyhow::bail!("SocketCAN transport requires Linux and the socketcan feature")
}

fn spawn_driver(
    driver: Arc<ChargeSessionDriver>,
    station: Arc<dyn SignalBus>,
    peer: Option<Arc<dyn SignalBus>>,
    running: Arc<AtomicBool>,
) -> JoinHandle<evsim_charge::SessionResult<()>> {
    tokio::spawn(async move {
        if let Some(peer) = &peer {
            peer.start().await?;
        }
        let should_continue = move || running.load(Ordering::SeqCst);
        let result = driver
            .run_session_loop(station.as_ref(), &should_continue, peer.as_deref())
            .await;
        if let Some(peer) = &peer {
            let _ = peer.stop().await;
        }
        result
    })
}

/// Run until Enter or Ctrl+C, or until the session loop fails
async fn supervise(
    mut driver_task: JoinHandle<evsim_charge::SessionResult<()>>,
    simulator: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    println!("press enter to exit");

    let finished = tokio::select! {
        _ = wait_for_stop() => None,
        joined = &mut driver_task => Some(joined),
    };
    running.store(false, Ordering::SeqCst);

    let result = match finished {
        Some(joined) => joined?,
        None => {
            info!("Stopping...");
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut driver_task).await {
                Ok(joined) => joined?,
                Err(_) => {
                    warn!("Session still in progress, aborting it");
                    driver_task.abort();
                    Ok(())
                }
            }
        }
    };

    if let Some(mut simulator) = simulator {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut simulator).await.is_err() {
            simulator.abort();
        }
    }

    if let Err(e) = &result {
        error!(error = %e, "Session loop failed");
    }
    result?;

    info!("Main stopped");
    Ok(())
}

async fn wait_for_stop() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        line = lines.next_line() => {
            // No terminal attached, only Ctrl+C can stop
            if let Ok(None) = line {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
