//! Session behaviour against a simulated instrument on an in-memory link.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use a10x_driver::codec::{encode_frame, Command, Decoded, FrameDecoder, InboundFrame};
use a10x_driver::{
    AcquisitionMode, AscanData, BatteryInfo, BoxedLink, ConnectionState, Connector, DecodeError,
    DeviceModel, DriverError, ParameterId, RequestKind, RequestOutcome, Session, SessionConfig,
    SessionFault, TransmitterMode,
};

const STEP: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

// ----------------------------------------------------------------------------
// Simulated instrument
// ----------------------------------------------------------------------------

/// Hands the device end of every opened link to the test.
struct SimConnector {
    links: mpsc::UnboundedSender<DuplexStream>,
}

impl Connector for SimConnector {
    fn open<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, io::Result<BoxedLink>> {
        Box::pin(async move {
            let (host, device) = tokio::io::duplex(64 * 1024);
            self.links
                .send(device)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no device"))?;
            Ok(Box::new(host) as BoxedLink)
        })
    }
}

/// Fails every attempt, counting them.
#[derive(Default)]
struct RefusingConnector {
    attempts: AtomicU32,
}

impl Connector for RefusingConnector {
    fn open<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, io::Result<BoxedLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
        })
    }
}

struct Device {
    stream: DuplexStream,
    decoder: FrameDecoder,
}

impl Device {
    /// Take the next opened link and complete the handshake.
    async fn accept(links: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Device {
        let stream = timeout(STEP, links.recv())
            .await
            .expect("no link opened")
            .expect("connector dropped");
        let mut device = Device {
            stream,
            decoder: FrameDecoder::new(),
        };
        match device.next_command().await {
            Command::Hello { .. } => {}
            other => panic!("expected Hello, got {other:?}"),
        }
        device
            .send(InboundFrame::ConnectivityChange { connected: true })
            .await;
        device
    }

    async fn read_command(&mut self) -> Command {
        let mut buf = [0u8; 1024];
        loop {
            match self.decoder.next_raw() {
                Decoded::Frame(raw) => return Command::from_raw(&raw).expect("bad command"),
                Decoded::Malformed(e) => panic!("host sent a malformed frame: {e}"),
                Decoded::NeedMoreData => {}
            }
            let n = self.stream.read(&mut buf).await.expect("read failed");
            assert!(n > 0, "link closed while waiting for a command");
            self.decoder.feed(&buf[..n]);
        }
    }

    async fn next_command(&mut self) -> Command {
        timeout(STEP, self.read_command())
            .await
            .expect("no command received")
    }

    async fn expect_silence(&mut self) {
        if let Ok(cmd) = timeout(QUIET, self.read_command()).await {
            panic!("unexpected command {cmd:?}");
        }
    }

    /// Drain until the host closes the link.
    async fn expect_closed(&mut self) {
        let mut buf = [0u8; 1024];
        let closed = timeout(STEP, async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "link was not closed");
    }

    async fn send(&mut self, frame: InboundFrame) {
        self.write_raw(&frame.encode()).await;
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write failed");
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(1),
        retry_delay: Duration::from_millis(10),
        ..SessionConfig::default()
    }
}

fn harness(config: SessionConfig) -> (Session, mpsc::UnboundedReceiver<DuplexStream>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::with_connector(
        DeviceModel::a1052(),
        config,
        Arc::new(SimConnector { links: tx }),
    );
    (session, rx)
}

async fn connected(config: SessionConfig) -> (Session, Device) {
    let (session, mut links) = harness(config);
    let (result, device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.expect("connect failed");
    (session, device)
}

fn battery(level: u8) -> InboundFrame {
    InboundFrame::BatteryTelemetry(BatteryInfo {
        master_level: level,
        aux_level: 0,
        master_charging: false,
        aux_charging: false,
        aux_present: false,
        master_millivolts: 3900,
        aux_millivolts: 0,
        received_at: Instant::now(),
    })
}

fn ascan(t: u64) -> InboundFrame {
    InboundFrame::AcquisitionData(AscanData::new(t, vec![t as i16, -1, 2, -3]))
}

async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
    timeout(STEP, rx.recv())
        .await
        .expect("no notification")
        .expect("observer closed")
}

// ----------------------------------------------------------------------------
// Connection lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn connect_and_disconnect_round_trip() {
    let (session, mut links) = harness(fast_config());
    let mut connectivity = session.events().observe_connectivity();

    let (result, mut device) =
        tokio::join!(session.connect("192.168.137.123"), Device::accept(&mut links));
    result.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.endpoint().await.as_deref(), Some("192.168.137.123"));
    let up = recv(&mut connectivity).await;
    assert!(up.connected);

    session.disconnect().await;
    assert_eq!(device.next_command().await, Command::Goodbye);
    device.expect_closed().await;

    assert_eq!(session.state(), ConnectionState::Disconnected);
    let down = recv(&mut connectivity).await;
    assert!(!down.connected);
    assert_eq!(down.state, ConnectionState::Disconnected);
    assert!(session.endpoint().await.is_none());
    assert_eq!(session.stats().await.connects, 1);
}

#[tokio::test]
async fn connect_while_connected_is_rejected() {
    let (session, _device) = connected(fast_config()).await;
    assert!(matches!(
        session.connect("sim").await,
        Err(DriverError::InvalidState {
            operation: "connect",
            state: ConnectionState::Connected
        })
    ));
}

#[tokio::test]
async fn connect_gives_up_after_retry_budget() {
    let connector = Arc::new(RefusingConnector::default());
    let session = Session::with_connector(
        DeviceModel::a1052(),
        fast_config(),
        Arc::clone(&connector) as Arc<dyn Connector>,
    );
    let mut connectivity = session.events().observe_connectivity();

    match session.connect("10.0.0.1").await {
        Err(DriverError::ConnectCancelled { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected ConnectCancelled, got {other:?}"),
    }
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(session.state(), ConnectionState::Cancelled);

    let event = recv(&mut connectivity).await;
    assert!(!event.connected);
    assert_eq!(event.state, ConnectionState::Cancelled);
}

#[tokio::test]
async fn refused_handshake_counts_as_failed_attempt() {
    let config = SessionConfig {
        max_connect_attempts: 2,
        ..fast_config()
    };
    let (session, mut links) = harness(config);
    tokio::spawn(async move {
        while let Some(stream) = links.recv().await {
            let mut device = Device {
                stream,
                decoder: FrameDecoder::new(),
            };
            let _ = device.next_command().await;
            device
                .send(InboundFrame::ConnectivityChange { connected: false })
                .await;
        }
    });

    match session.connect("sim").await {
        Err(DriverError::ConnectCancelled {
            attempts, reason, ..
        }) => {
            assert_eq!(attempts, 2);
            assert!(reason.contains("refused"), "reason: {reason}");
        }
        other => panic!("expected ConnectCancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn transport_loss_cancels_exactly_once() {
    let (session, mut links) = harness(fast_config());
    let mut connectivity = session.events().observe_connectivity();
    let mut faults = session.events().observe_faults();

    let (result, mut device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.unwrap();
    assert!(recv(&mut connectivity).await.connected);

    session
        .start_acquisition(TransmitterMode::Single, Some(0))
        .await
        .unwrap();
    assert!(matches!(
        device.next_command().await,
        Command::StartAcquisition { .. }
    ));
    drop(device);

    let down = recv(&mut connectivity).await;
    assert!(!down.connected);
    assert_eq!(down.state, ConnectionState::Cancelled);
    assert_eq!(session.state(), ConnectionState::Cancelled);
    assert_eq!(session.acquisition_mode(), AcquisitionMode::Idle);
    assert!(matches!(
        recv(&mut faults).await,
        SessionFault::TransportLost(_)
    ));
    assert!(timeout(QUIET, connectivity.recv()).await.is_err());

    assert!(matches!(
        session.set_gain(5).await,
        Err(DriverError::NotConnected {
            state: ConnectionState::Cancelled
        })
    ));
    assert_eq!(session.stats().await.transport_losses, 1);

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    let last = recv(&mut connectivity).await;
    assert_eq!(last.state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn device_reported_disconnect_cancels_session() {
    let (session, mut device) = connected(fast_config()).await;
    let mut connectivity = session.events().observe_connectivity();

    device
        .send(InboundFrame::ConnectivityChange { connected: false })
        .await;

    let down = recv(&mut connectivity).await;
    assert_eq!(down.state, ConnectionState::Cancelled);
    assert_eq!(session.state(), ConnectionState::Cancelled);
}

#[tokio::test]
async fn reconnect_after_cancel_uses_a_fresh_link() {
    let (session, mut links) = harness(fast_config());
    let (result, device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.unwrap();
    let mut status = session.watch_status();
    drop(device);
    status
        .wait_for(|s| s.state == ConnectionState::Cancelled)
        .await
        .unwrap();

    let (result, mut device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    session.set_gain(7).await.unwrap();
    assert_eq!(
        device.next_command().await,
        Command::SetParameter {
            parameter: ParameterId::Gain,
            value: 7.0
        }
    );
    assert_eq!(session.stats().await.connects, 2);
}

#[tokio::test]
async fn dropping_the_session_releases_the_link() {
    let (session, mut device) = connected(fast_config()).await;
    drop(session);
    device.expect_closed().await;
}

#[tokio::test]
async fn abandoned_connect_leaves_the_session_reusable() {
    let (session, mut links) = harness(fast_config());
    let mut connectivity = session.events().observe_connectivity();

    // The device never answers the hello, so the caller gives up first.
    let abandoned = timeout(Duration::from_millis(100), session.connect("sim")).await;
    assert!(abandoned.is_err());
    assert_eq!(session.state(), ConnectionState::Disconnected);
    let _silent = timeout(STEP, links.recv()).await.unwrap().unwrap();

    let down = recv(&mut connectivity).await;
    assert!(!down.connected);
    assert_eq!(down.state, ConnectionState::Disconnected);

    let (result, _device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    let up = recv(&mut connectivity).await;
    assert!(up.connected);
    assert_eq!(up.state, ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_interrupts_a_connect_in_progress() {
    // Three silent attempts would take longer than STEP.
    let (session, mut links) = harness(fast_config());
    let mut connectivity = session.events().observe_connectivity();

    let interrupt = async {
        let silent = timeout(STEP, links.recv()).await.unwrap().unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.endpoint().await.is_none());
        let started = Instant::now();
        session.disconnect().await;
        (silent, started.elapsed())
    };
    let (result, (_silent, elapsed)) = timeout(STEP, async {
        tokio::join!(session.connect("sim"), interrupt)
    })
    .await
    .expect("connect kept running after disconnect");

    assert!(
        matches!(result, Err(DriverError::ConnectInterrupted { .. })),
        "unexpected connect result {result:?}"
    );
    assert!(elapsed < Duration::from_millis(250), "disconnect took {elapsed:?}");
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let down = recv(&mut connectivity).await;
    assert!(!down.connected);
    assert_eq!(down.state, ConnectionState::Disconnected);
    assert!(
        timeout(QUIET, connectivity.recv()).await.is_err(),
        "extra connectivity notification"
    );
    assert_eq!(session.stats().await.connects, 0);

    // Nothing was left behind for the next connect.
    let (result, _device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
}

// ----------------------------------------------------------------------------
// Parameters
// ----------------------------------------------------------------------------

#[tokio::test]
async fn invalid_parameters_never_reach_the_wire() {
    let (session, mut device) = connected(fast_config()).await;

    assert!(matches!(
        session.set_gain(200).await,
        Err(DriverError::Validation(_))
    ));
    assert!(matches!(
        session.set_parameter(ParameterId::Averaging, 2.5).await,
        Err(DriverError::Validation(_))
    ));
    assert!(matches!(
        session.set_parameter_named("brightness", 1.0).await,
        Err(DriverError::Validation(_))
    ));
    device.expect_silence().await;
    assert_eq!(session.parameters().await.get(ParameterId::Gain), Some(0.0));

    assert_eq!(session.set_parameter_named("gain", 10.0).await.unwrap(), 10.0);
    assert_eq!(
        device.next_command().await,
        Command::SetParameter {
            parameter: ParameterId::Gain,
            value: 10.0
        }
    );
    assert_eq!(session.parameters().await.get(ParameterId::Gain), Some(10.0));
}

#[tokio::test]
async fn led_mask_uses_its_own_command() {
    let (session, mut device) = connected(fast_config()).await;
    session.set_led_mask(0b1010).await.unwrap();
    assert_eq!(device.next_command().await, Command::SetLedMask(0b1010));
    assert!(session.set_led_mask(0xF0).await.is_err());
}

#[tokio::test]
async fn staged_parameters_replay_after_connect() {
    let (session, mut links) = harness(fast_config());
    assert!(matches!(
        session.set_gain(12).await,
        Err(DriverError::NotConnected { .. })
    ));
    assert!(session.set_averaging(4).await.is_err());
    assert_eq!(session.staged_parameters().await.len(), 2);

    let (result, mut device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.unwrap();

    assert_eq!(
        device.next_command().await,
        Command::SetParameter {
            parameter: ParameterId::Gain,
            value: 12.0
        }
    );
    assert_eq!(
        device.next_command().await,
        Command::SetParameter {
            parameter: ParameterId::Averaging,
            value: 4.0
        }
    );
    let params = session.parameters().await;
    assert_eq!(params.get(ParameterId::Gain), Some(12.0));
    assert_eq!(params.get(ParameterId::Averaging), Some(4.0));
    assert!(session.staged_parameters().await.is_empty());
}

#[tokio::test]
async fn staged_parameters_are_discarded_when_replay_is_off() {
    let config = SessionConfig {
        replay_staged_parameters: false,
        ..fast_config()
    };
    let (session, mut links) = harness(config);
    assert!(session.set_gain(12).await.is_err());

    let (result, mut device) = tokio::join!(session.connect("sim"), Device::accept(&mut links));
    result.unwrap();
    device.expect_silence().await;
    assert_eq!(session.parameters().await.get(ParameterId::Gain), Some(0.0));
}

// ----------------------------------------------------------------------------
// Acquisition
// ----------------------------------------------------------------------------

#[tokio::test]
async fn single_acquisition_end_to_end() {
    let (session, mut device) = connected(fast_config()).await;
    let mut scans = session.events().observe_acquisition();

    session.set_gain(10).await.unwrap();
    assert!(session.set_gain(200).await.is_err());
    session
        .start_acquisition(TransmitterMode::Single, Some(0))
        .await
        .unwrap();

    assert_eq!(
        device.next_command().await,
        Command::SetParameter {
            parameter: ParameterId::Gain,
            value: 10.0
        }
    );
    assert_eq!(
        device.next_command().await,
        Command::StartAcquisition {
            mode: TransmitterMode::Single,
            transmitter: 0
        }
    );
    assert_eq!(
        session.acquisition_mode(),
        AcquisitionMode::SingleTransmitterActive
    );

    for t in 1..=3u64 {
        device.send(ascan(t)).await;
    }
    for t in 1..=3u64 {
        let scan = recv(&mut scans).await;
        assert_eq!(scan.capture_time_us, t);
        assert_eq!(scan.sample_count, scan.samples.len());
    }

    session.stop_acquisition().await.unwrap();
    assert_eq!(device.next_command().await, Command::StopAcquisition);
    assert_eq!(session.acquisition_mode(), AcquisitionMode::Idle);

    session.disconnect().await;
    assert_eq!(device.next_command().await, Command::Goodbye);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.stats().await.frames_received >= 3);
}

#[tokio::test]
async fn switching_modes_stops_the_previous_one_first() {
    let (session, mut device) = connected(fast_config()).await;

    session
        .start_acquisition(TransmitterMode::Single, Some(5))
        .await
        .unwrap();
    session
        .start_acquisition(TransmitterMode::Quadro, Some(1))
        .await
        .unwrap();

    assert_eq!(
        device.next_command().await,
        Command::StartAcquisition {
            mode: TransmitterMode::Single,
            transmitter: 5
        }
    );
    assert_eq!(device.next_command().await, Command::StopAcquisition);
    assert_eq!(
        device.next_command().await,
        Command::StartAcquisition {
            mode: TransmitterMode::Quadro,
            transmitter: 1
        }
    );
    device.expect_silence().await;
    assert_eq!(
        session.acquisition_mode(),
        AcquisitionMode::QuadroTransmitterActive
    );
}

#[tokio::test]
async fn stop_while_idle_sends_nothing() {
    let (session, mut device) = connected(fast_config()).await;
    session.stop_acquisition().await.unwrap();
    session.stop_acquisition().await.unwrap();
    device.expect_silence().await;
}

#[tokio::test]
async fn transmitter_must_be_selected_first() {
    let (session, mut device) = connected(fast_config()).await;

    assert!(matches!(
        session.start_acquisition(TransmitterMode::Single, None).await,
        Err(DriverError::TransmitterNotSelected(TransmitterMode::Single))
    ));
    assert!(matches!(
        session.start_acquisition(TransmitterMode::Single, Some(32)).await,
        Err(DriverError::Validation(_))
    ));
    device.expect_silence().await;

    session.set_single_transmitter(3).await.unwrap();
    session
        .start_acquisition(TransmitterMode::Single, None)
        .await
        .unwrap();
    assert!(matches!(
        device.next_command().await,
        Command::SetParameter {
            parameter: ParameterId::SingleTransmitter,
            ..
        }
    ));
    assert_eq!(
        device.next_command().await,
        Command::StartAcquisition {
            mode: TransmitterMode::Single,
            transmitter: 3
        }
    );
}

#[tokio::test]
async fn ascans_received_while_idle_are_not_dispatched() {
    let (session, mut device) = connected(fast_config()).await;
    let mut scans = session.events().observe_acquisition();
    let mut batteries = session.events().observe_battery();

    device.send(ascan(1)).await;
    // Frames are handled in order, so once this arrives the stale A-scan is gone.
    device.send(battery(50)).await;
    assert_eq!(recv(&mut batteries).await.master_level, 50);

    session
        .start_acquisition(TransmitterMode::Single, Some(0))
        .await
        .unwrap();
    device.send(ascan(2)).await;
    assert_eq!(recv(&mut scans).await.capture_time_us, 2);
}

// ----------------------------------------------------------------------------
// Telemetry and faults
// ----------------------------------------------------------------------------

#[tokio::test]
async fn battery_requests_coalesce_until_answered() {
    let (session, mut device) = connected(fast_config()).await;
    let mut batteries = session.events().observe_battery();

    assert_eq!(
        session.request_battery_info().await.unwrap(),
        RequestOutcome::Sent
    );
    assert_eq!(
        session.request_battery_info().await.unwrap(),
        RequestOutcome::Coalesced
    );
    assert_eq!(session.pending_requests().await, vec![RequestKind::Battery]);
    assert_eq!(device.next_command().await, Command::RequestBattery);
    device.expect_silence().await;

    device.send(battery(87)).await;
    assert_eq!(recv(&mut batteries).await.master_level, 87);
    assert!(session.pending_requests().await.is_empty());

    assert_eq!(
        session.request_battery_info().await.unwrap(),
        RequestOutcome::Sent
    );
    assert_eq!(device.next_command().await, Command::RequestBattery);
}

#[tokio::test]
async fn unanswered_request_times_out_without_dropping_the_session() {
    let config = SessionConfig {
        request_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let (session, mut device) = connected(config).await;
    let mut faults = session.events().observe_faults();

    session.request_diagnostic_info().await.unwrap();
    assert_eq!(device.next_command().await, Command::RequestDiagnostic);

    assert_eq!(
        recv(&mut faults).await,
        SessionFault::RequestTimeout(RequestKind::Diagnostic)
    );
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(session.pending_requests().await.is_empty());
    assert_eq!(session.stats().await.request_timeouts, 1);

    assert_eq!(
        session.request_diagnostic_info().await.unwrap(),
        RequestOutcome::Sent
    );
}

#[tokio::test]
async fn malformed_input_is_reported_and_skipped() {
    let (session, mut device) = connected(fast_config()).await;
    let mut faults = session.events().observe_faults();
    let mut buttons = session.events().observe_button();

    device.write_raw(&encode_frame(0x7E, &[])).await;
    device
        .send(InboundFrame::ButtonEvent(a10x_driver::ButtonEvent {
            received_at: Instant::now(),
        }))
        .await;

    assert_eq!(
        recv(&mut faults).await,
        SessionFault::MalformedFrame(DecodeError::UnknownKind(0x7E))
    );
    recv(&mut buttons).await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.stats().await.malformed_frames, 1);
}

#[tokio::test]
async fn slow_observer_does_not_stall_other_categories() {
    let config = SessionConfig {
        notification_capacity: 2,
        ..fast_config()
    };
    let (session, mut device) = connected(config).await;
    let _stalled = session.events().observe_acquisition();
    let mut batteries = session.events().observe_battery();

    session
        .start_acquisition(TransmitterMode::Single, Some(0))
        .await
        .unwrap();
    for t in 0..10u64 {
        device.send(ascan(t)).await;
    }
    device.send(battery(42)).await;

    assert_eq!(recv(&mut batteries).await.master_level, 42);
    assert_eq!(session.stats().await.dropped_notifications, 8);
}
