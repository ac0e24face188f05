use limonata_core::clock::LabClock;
use limonata_core::config::DriverConfig;
use limonata_core::protocol::{
    ConnectionRegistry, ConnectionState, Connector, DeviceMatch, Discovery, DriverContext,
    LabError, Limonata, Transport,
};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the simulated board does, plus everything that happened to it
#[derive(Default)]
struct Bench {
    /// Baud rates at which the board opens but never answers
    deaf_bauds: Vec<u32>,
    /// Baud rates at which the port cannot be opened
    unopenable_bauds: Vec<u32>,
    /// Line printed after the first reply of a session
    banner: Option<String>,
    temperature: String,
    version: String,
    /// Stop answering after this many replies
    reply_limit: Option<usize>,

    opened: Vec<u32>,
    closed: usize,
    replies: usize,
    heater: f64,
    raw: Vec<u8>,
    lines: Vec<String>,
}

type SharedBench = Arc<Mutex<Bench>>;

fn bench() -> SharedBench {
    Arc::new(Mutex::new(Bench {
        temperature: "23.50".to_string(),
        version: "Limonata Firmware 1.0.1".to_string(),
        ..Bench::default()
    }))
}

struct FakeTransport {
    bench: SharedBench,
    baud: u32,
    queue: VecDeque<String>,
    open: bool,
    greeted: bool,
}

impl FakeTransport {
    fn answer(bench: &mut Bench, line: &str) -> String {
        let mut parts = line.splitn(2, ' ');
        let name = parts.next().unwrap_or_default();
        let value: Option<f64> = parts.next().and_then(|v| v.parse().ok());
        match (name, value) {
            ("F", None) => bench.temperature.clone(),
            ("Q", Some(v)) => {
                bench.heater = v;
                format!("{:.2}", v)
            }
            ("R", None) => format!("{:.2}", bench.heater),
            ("P", Some(v)) => format!("{:.1}", v),
            ("VER", None) => bench.version.clone(),
            ("X", None) => "Stop".to_string(),
            _ => "?".to_string(),
        }
    }
}

impl Transport for FakeTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LabError> {
        if !self.open {
            return Err(LabError::Transport("port closed".to_string()));
        }
        let mut bench = self.bench.lock().unwrap();
        bench.raw.extend_from_slice(bytes);

        let text = String::from_utf8(bytes.to_vec()).unwrap();
        for line in text.split_terminator("\r\n") {
            bench.lines.push(line.to_string());
            if bench.deaf_bauds.contains(&self.baud) {
                continue;
            }
            if bench.reply_limit.is_some_and(|limit| bench.replies >= limit) {
                continue;
            }
            bench.replies += 1;
            let reply = Self::answer(&mut bench, line);
            self.queue.push_back(format!("{}\r\n", reply));
            if !self.greeted {
                self.greeted = true;
                if let Some(banner) = &bench.banner {
                    self.queue.push_back(format!("{}\r\n", banner));
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), LabError> {
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LabError> {
        self.queue
            .pop_front()
            .map(String::into_bytes)
            .ok_or(LabError::Timeout)
    }

    fn close(&mut self) -> Result<(), LabError> {
        if self.open {
            self.open = false;
            self.bench.lock().unwrap().closed += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct FakeConnector(SharedBench);

impl Connector for FakeConnector {
    fn open(
        &mut self,
        _port: &str,
        baud_rate: u32,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, LabError> {
        let mut bench = self.0.lock().unwrap();
        if bench.unopenable_bauds.contains(&baud_rate) {
            return Err(LabError::Transport(format!("cannot open at {}", baud_rate)));
        }
        bench.opened.push(baud_rate);
        Ok(Box::new(FakeTransport {
            bench: self.0.clone(),
            baud: baud_rate,
            queue: VecDeque::new(),
            open: true,
            greeted: false,
        }))
    }
}

struct FakeDiscovery(Option<DeviceMatch>);

impl Discovery for FakeDiscovery {
    fn locate(&self, filter: &str) -> Option<DeviceMatch> {
        self.0.clone().filter(|m| m.port.contains(filter))
    }
}

fn board() -> FakeDiscovery {
    FakeDiscovery(Some(DeviceMatch {
        port: "/dev/ttyACM0".to_string(),
        device: "Arduino Uno".to_string(),
    }))
}

fn config() -> DriverConfig {
    DriverConfig {
        settle_ms: 0,
        ..DriverConfig::default()
    }
}

fn context(bench: &SharedBench, registry: &Arc<ConnectionRegistry>) -> DriverContext {
    DriverContext {
        discovery: Box::new(board()),
        connector: Box::new(FakeConnector(bench.clone())),
        registry: registry.clone(),
        clock: LabClock::new(),
    }
}

fn connect(bench: &SharedBench, registry: &Arc<ConnectionRegistry>) -> Result<Limonata, LabError> {
    Limonata::connect_with(config(), context(bench, registry))
}

fn sent(bench: &SharedBench) -> Vec<String> {
    bench.lock().unwrap().lines.clone()
}

#[test]
fn test_connect_at_primary_baud() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());

    let lab = connect(&bench, &registry).unwrap();

    assert_eq!(lab.state(), ConnectionState::Connected);
    assert_eq!(lab.baud(), 115200);
    assert_eq!(lab.port(), "/dev/ttyACM0");
    assert_eq!(lab.device(), "Arduino Uno");
    assert_eq!(lab.version(), "Limonata Firmware 1.0.1");
    assert_eq!(lab.gain(), 200.0);
    assert!(registry.is_held());
    assert_eq!(bench.lock().unwrap().opened, vec![115200]);
    assert_eq!(sent(&bench), vec!["Q 0", "VER", "Q 0"]);
}

#[test]
fn test_startup_banner_is_discarded() {
    let bench = bench();
    bench.lock().unwrap().banner = Some("Limonata ready".to_string());
    let registry = Arc::new(ConnectionRegistry::new());

    let mut lab = connect(&bench, &registry).unwrap();

    assert_eq!(lab.version(), "Limonata Firmware 1.0.1");
    assert_eq!(lab.temperature().unwrap(), 23.5);
}

#[test]
fn test_already_connected_does_not_touch_transport() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    assert!(registry.try_acquire());

    let result = connect(&bench, &registry);

    assert!(matches!(result, Err(LabError::AlreadyConnected)));
    assert!(bench.lock().unwrap().opened.is_empty());
    assert!(sent(&bench).is_empty());
    assert!(registry.is_held());
}

#[test]
fn test_second_driver_waits_for_first_to_close() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());

    let mut first = connect(&bench, &registry).unwrap();
    assert!(matches!(
        connect(&bench, &registry),
        Err(LabError::AlreadyConnected)
    ));

    first.close();
    let second = connect(&bench, &registry).unwrap();
    assert_eq!(second.state(), ConnectionState::Connected);
}

#[test]
fn test_fallback_to_secondary_baud() {
    let bench = bench();
    bench.lock().unwrap().deaf_bauds = vec![115200];
    let registry = Arc::new(ConnectionRegistry::new());

    let lab = connect(&bench, &registry).unwrap();

    assert_eq!(lab.baud(), 9600);
    assert!(registry.is_held());
    let bench = bench.lock().unwrap();
    assert_eq!(bench.opened, vec![115200, 9600]);
    assert_eq!(bench.closed, 1);
}

#[test]
fn test_both_bauds_fail_leaves_nothing_behind() {
    let bench = bench();
    bench.lock().unwrap().deaf_bauds = vec![115200, 9600];
    let registry = Arc::new(ConnectionRegistry::new());

    let result = connect(&bench, &registry);

    assert!(matches!(result, Err(LabError::ConnectionFailed(_))));
    assert!(!registry.is_held());
    let bench = bench.lock().unwrap();
    assert_eq!(bench.opened, vec![115200, 9600]);
    assert_eq!(bench.closed, 2);
    assert_eq!(bench.lines, vec!["Q 0", "Q 0"]);
}

#[test]
fn test_unopenable_port_fails() {
    let bench = bench();
    bench.lock().unwrap().unopenable_bauds = vec![115200, 9600];
    let registry = Arc::new(ConnectionRegistry::new());

    let result = connect(&bench, &registry);

    assert!(matches!(result, Err(LabError::ConnectionFailed(_))));
    assert!(!registry.is_held());
    assert_eq!(bench.lock().unwrap().closed, 0);
}

#[test]
fn test_device_not_found() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let ctx = DriverContext {
        discovery: Box::new(FakeDiscovery(None)),
        ..context(&bench, &registry)
    };

    let result = Limonata::connect_with(config(), ctx);

    assert!(matches!(result, Err(LabError::DeviceNotFound(_))));
    assert!(bench.lock().unwrap().opened.is_empty());
    assert!(!registry.is_held());
}

#[test]
fn test_port_filter_is_passed_to_discovery() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());

    let result = Limonata::connect_with(
        DriverConfig {
            settle_ms: 0,
            ..DriverConfig::with_port("COM3")
        },
        context(&bench, &registry),
    );

    assert!(matches!(result, Err(LabError::DeviceNotFound(_))));
}

#[test]
fn test_handshake_failure_releases_everything() {
    let bench = bench();
    // Only the handshake is answered
    bench.lock().unwrap().reply_limit = Some(1);
    let registry = Arc::new(ConnectionRegistry::new());

    let result = connect(&bench, &registry);

    assert!(matches!(result, Err(LabError::Timeout)));
    assert!(!registry.is_held());
    let bench = bench.lock().unwrap();
    assert_eq!(bench.opened.len(), bench.closed);
    assert_eq!(bench.lines, vec!["Q 0", "VER"]);
}

#[test]
fn test_connect_starts_clock_in_real_time() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let clock = LabClock::new();
    clock.set_rate(5.0).unwrap();

    let ctx = DriverContext {
        clock: clock.clone(),
        ..context(&bench, &registry)
    };
    let _lab = Limonata::connect_with(config(), ctx).unwrap();

    assert_eq!(clock.rate(), 1.0);
    assert!(clock.is_running());
}

#[test]
fn test_read_temperature() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    assert_eq!(lab.temperature().unwrap(), 23.5);
    assert!(bench.lock().unwrap().raw.ends_with(b"F\r\n"));
}

#[test]
fn test_non_numeric_temperature_is_protocol_error() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    bench.lock().unwrap().temperature = "Err: sensor".to_string();
    assert!(matches!(lab.temperature(), Err(LabError::Protocol(_))));
}

#[test]
fn test_heater_is_clipped_on_the_wire() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    assert_eq!(lab.set_heater(150.0).unwrap(), 100.0);
    assert!(bench.lock().unwrap().raw.ends_with(b"Q 100\r\n"));
    assert_eq!(lab.last_heater(), 100.0);

    assert_eq!(lab.set_heater(-20.0).unwrap(), 0.0);
    assert!(bench.lock().unwrap().raw.ends_with(b"Q 0\r\n"));
}

#[test]
fn test_heater_query_does_not_change_value() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    lab.set_heater(42.5).unwrap();
    assert_eq!(lab.heater().unwrap(), 42.5);
    assert_eq!(sent(&bench).last().unwrap(), "R");
    assert_eq!(bench.lock().unwrap().heater, 42.5);
}

#[test]
fn test_gain_setter_and_cached_getter() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    assert_eq!(lab.set_gain(300.0).unwrap(), 255.0);
    assert_eq!(sent(&bench).last().unwrap(), "P 255");

    let before = sent(&bench).len();
    assert_eq!(lab.gain(), 255.0);
    assert_eq!(sent(&bench).len(), before);
}

#[test]
fn test_scan_is_two_round_trips_in_order() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();
    lab.set_heater(30.0).unwrap();

    let before = sent(&bench).len();
    assert_eq!(lab.scan().unwrap(), (23.5, 30.0));
    assert_eq!(sent(&bench)[before..].to_vec(), vec!["F", "R"]);
}

#[test]
fn test_raw_send_and_receive() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    lab.send("VER").unwrap();
    assert_eq!(lab.receive().unwrap(), "Limonata Firmware 1.0.1");
    assert!(matches!(lab.receive(), Err(LabError::Timeout)));
}

#[test]
fn test_silent_device_times_out() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    bench.lock().unwrap().reply_limit = Some(0);
    assert!(matches!(lab.temperature(), Err(LabError::Timeout)));
}

#[test]
fn test_close_is_idempotent() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();
    lab.set_heater(80.0).unwrap();

    lab.close();
    assert!(!registry.is_held());
    assert_eq!(lab.state(), ConnectionState::Closed);
    let lines = sent(&bench);
    assert_eq!(lines[lines.len() - 2..].to_vec(), vec!["Q 0", "X"]);
    assert_eq!(bench.lock().unwrap().heater, 0.0);

    let lines = sent(&bench).len();
    lab.close();
    assert_eq!(sent(&bench).len(), lines);
    assert_eq!(bench.lock().unwrap().closed, 1);
    assert!(matches!(lab.temperature(), Err(LabError::NotConnected)));
}

#[test]
fn test_close_survives_dead_device() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = connect(&bench, &registry).unwrap();

    bench.lock().unwrap().reply_limit = Some(0);
    lab.close();

    assert!(!registry.is_held());
    assert_eq!(bench.lock().unwrap().closed, 1);
}

#[test]
fn test_drop_closes() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    {
        let mut lab = connect(&bench, &registry).unwrap();
        lab.set_heater(60.0).unwrap();
    }

    assert!(!registry.is_held());
    assert_eq!(sent(&bench).last().unwrap(), "X");
    assert_eq!(bench.lock().unwrap().heater, 0.0);
}

#[test]
fn test_error_in_scope_still_closes() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());

    let experiment = || -> Result<f64, LabError> {
        let mut lab = connect(&bench, &registry)?;
        lab.set_heater(70.0)?;
        bench.lock().unwrap().temperature = "nan?".to_string();
        lab.temperature()
    };
    assert!(experiment().is_err());
    assert!(!registry.is_held());

    let panicking = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _lab = connect(&bench, &registry).unwrap();
        panic!("experiment aborted");
    }));
    assert!(panicking.is_err());
    assert!(!registry.is_held());
}

/// In-memory log sink for the wire echo
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture_logs() -> (LogCapture, tracing::dispatcher::DefaultGuard) {
    use tracing_subscriber::util::SubscriberInitExt;

    let capture = LogCapture::default();
    let writer = capture.clone();
    let guard = tracing_subscriber::fmt()
        .with_env_filter("limonata_core::wire=info")
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .set_default();
    (capture, guard)
}

#[test]
fn test_debug_echo_keeps_wire_bytes() {
    let (logs, _guard) = capture_logs();

    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = Limonata::connect_with(
        DriverConfig {
            debug: true,
            ..config()
        },
        context(&bench, &registry),
    )
    .unwrap();

    assert!(lab.is_debug());
    lab.temperature().unwrap();
    assert!(bench.lock().unwrap().raw.ends_with(b"F\r\n"));

    let text = logs.text();
    assert!(text.contains("limonata_core::wire"), "{text}");
    assert!(text.contains("Sent: \"F\""), "{text}");
    assert!(text.contains("Return: \"23.50\""), "{text}");
}

#[test]
fn test_quiet_driver_logs_no_wire_lines() {
    let (logs, _guard) = capture_logs();

    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());
    let mut lab = Limonata::connect_with(config(), context(&bench, &registry)).unwrap();

    assert!(!lab.is_debug());
    lab.temperature().unwrap();
    assert_eq!(logs.text(), "");
}

#[test]
fn test_invalid_config_rejected_before_discovery() {
    let bench = bench();
    let registry = Arc::new(ConnectionRegistry::new());

    let result = Limonata::connect_with(
        DriverConfig {
            baud_rates: vec![],
            ..config()
        },
        context(&bench, &registry),
    );

    assert!(matches!(result, Err(LabError::InvalidArgument(_))));
    assert!(bench.lock().unwrap().opened.is_empty());
}
