use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use a10x_driver::logging::init_rust_logging;
use a10x_driver::{DeviceModel, DeviceProbe, Session, SessionConfig, TransmitterMode};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Single,
    Quadro,
}

impl From<Mode> for TransmitterMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => TransmitterMode::Single,
            Mode::Quadro => TransmitterMode::Quadro,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "a10x-demo", about = "Connect to an A1052 and stream A-scans")]
struct Args {
    /// Device IP address, optionally with port (e.g. 192.168.137.123)
    #[arg(default_value = "192.168.137.123")]
    address: String,
    /// Receiver gain in dB
    #[arg(long, default_value_t = 10)]
    gain: u8,
    /// A-scans averaged per capture
    #[arg(long, default_value_t = 1)]
    averaging: u8,
    /// Pulse repetition rate in Hz
    #[arg(long, default_value_t = 3.0)]
    prr: f64,
    /// Transmitter arrangement
    #[arg(long, value_enum, default_value_t = Mode::Single)]
    mode: Mode,
    /// Transmitter element (single) or column (quadro)
    #[arg(long, default_value_t = 0)]
    transmitter: u8,
    /// Seconds to stream before stopping
    #[arg(long, default_value_t = 5)]
    seconds: u64,
}

#[tokio::main]
async fn main() {
    init_rust_logging();
    if let Err(e) = run().await {
        error!("{e:#}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    // 1. Discovery
    let probe = DeviceProbe::default();
    if !probe.identify(&args.address).await {
        bail!("cannot identify device at {}", args.address);
    }
    let identity = probe.device_info(&args.address).await?;
    info!(
        "found device: serial={}, mac={}, firmware={}",
        identity.serial, identity.mac, identity.firmware
    );

    // 2. Connection
    let session = Session::new(DeviceModel::a1052(), SessionConfig::default());
    session.events().on_connectivity(|event| {
        info!("connectivity: connected={}, state={}", event.connected, event.state);
    });
    session.events().on_fault(|fault| warn!("session fault: {:?}", fault));
    session.events().on_acquisition(|scan| {
        info!(
            "A-scan: t={}us, samples={}, first={:?}",
            scan.capture_time_us,
            scan.sample_count,
            scan.samples.first()
        );
    });
    session.events().on_battery(|battery| {
        info!(
            "battery: master={}%, aux={}%, charging={}",
            battery.master_level, battery.aux_level, battery.master_charging
        );
    });

    session
        .connect(&args.address)
        .await
        .with_context(|| format!("connecting to {}", args.address))?;

    // 3. Configuration
    session.set_gain(args.gain).await?;
    session.set_averaging(args.averaging).await?;
    session.set_pulse_repetition_rate(args.prr).await?;
    session.set_quadro_transmitter(0).await?;
    session.set_single_transmitter(0).await?;
    session.request_battery_info().await?;

    // 4. Acquisition
    let mode = TransmitterMode::from(args.mode);
    info!("starting {} acquisition for {}s", mode, args.seconds);
    session
        .start_acquisition(mode, Some(args.transmitter))
        .await?;
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;

    // 5. Cleanup
    session.stop_acquisition().await?;
    let stats = session.stats().await;
    info!(
        "received {} frames ({} malformed, {} dropped notifications)",
        stats.frames_received, stats.malformed_frames, stats.dropped_notifications
    );
    session.disconnect().await;
    info!("done");
    Ok(())
}
