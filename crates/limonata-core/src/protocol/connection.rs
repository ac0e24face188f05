//! Connection management
//!
//! Handles the connection lifecycle and command execution with the device.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use super::{
    discovery::{Discovery, UsbDiscovery},
    registry::ConnectionRegistry,
    transport::{Connector, SerialConnector, Transport},
    Command, LabError, DEFAULT_GAIN, LINE_TERMINATOR,
};
use crate::clock::LabClock;
use crate::config::DriverConfig;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Device located, nothing opened yet
    Unconnected,
    /// Trying baud rates
    Connecting,
    /// Connected and ready
    Connected,
    /// Closed; the driver cannot be reused
    Closed,
}

/// Collaborators a driver is built from
pub struct DriverContext {
    /// Finds the port to open
    pub discovery: Box<dyn Discovery>,
    /// Opens the port at each baud rate tried
    pub connector: Box<dyn Connector>,
    /// Guards against a second live connection
    pub registry: Arc<ConnectionRegistry>,
    /// Started at rate 1 once the board answers
    pub clock: LabClock,
}

impl Default for DriverContext {
    /// USB discovery, real serial ports, and the process-wide registry and clock
    fn default() -> Self {
        Self {
            discovery: Box::new(UsbDiscovery),
            connector: Box::new(SerialConnector),
            registry: ConnectionRegistry::global(),
            clock: LabClock::global(),
        }
    }
}

/// Outcome of one connection attempt at a single baud rate
enum Attempt {
    Connected {
        transport: Box<dyn Transport>,
        baud: u32,
    },
    Failed(LabError),
}

/// Write one command line
fn write_line(transport: &mut dyn Transport, msg: &str, debug: bool) -> Result<(), LabError> {
    let line = format!("{}{}", msg, LINE_TERMINATOR);
    transport.write_all(line.as_bytes())?;

    if debug {
        tracing::info!(target: "limonata_core::wire", "Sent: \"{}\"", msg);
    }

    transport.flush()
}

/// Read one response line without its terminator
fn read_line(transport: &mut dyn Transport, debug: bool) -> Result<String, LabError> {
    let bytes = transport.read_line()?;
    let text = String::from_utf8(bytes)
        .map_err(|e| LabError::Protocol(format!("response is not UTF-8: {}", e)))?;
    let msg = text.trim_end_matches(['\r', '\n']).to_string();

    if debug {
        tracing::info!(target: "limonata_core::wire", "Return: \"{}\"", msg);
    }

    Ok(msg)
}

fn parse_response<T>(msg: &str, response: &str) -> Result<T, LabError>
where
    T: FromStr,
    T::Err: Display,
{
    response.trim().parse().map_err(|e: T::Err| {
        LabError::Protocol(format!("'{}' answered {:?}: {}", msg, response, e))
    })
}

/// Send the zero-heater handshake and check that a number comes back
fn handshake(transport: &mut dyn Transport, debug: bool) -> Result<f64, LabError> {
    let msg = Command::SetHeater(0.0).render();
    write_line(transport, &msg, debug)?;
    let response = read_line(transport, debug)?;
    parse_response(&msg, &response)
}

/// Driver for one Limonata device
///
/// Dropping the driver closes the connection, so a driver held in a scope is
/// released however that scope is left.
pub struct Limonata {
    port: String,
    device: String,
    baud: Option<u32>,
    version: String,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    registry: Arc<ConnectionRegistry>,
    clock: LabClock,
    debug: bool,
    /// Last heater value echoed by the firmware
    heater: f64,
    /// Last gain echoed by the firmware
    gain: f64,
}

impl std::fmt::Debug for Limonata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limonata")
            .field("port", &self.port)
            .field("device", &self.device)
            .field("baud", &self.baud)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("heater", &self.heater)
            .field("gain", &self.gain)
            .finish()
    }
}

impl Limonata {
    /// Find a device and connect using the default collaborators
    pub fn connect(config: DriverConfig) -> Result<Self, LabError> {
        Self::connect_with(config, DriverContext::default())
    }

    /// Find a device and connect using explicit collaborators
    pub fn connect_with(config: DriverConfig, context: DriverContext) -> Result<Self, LabError> {
        config.validate()?;

        let DriverContext {
            discovery,
            mut connector,
            registry,
            clock,
        } = context;

        tracing::info!("Limonata version {}", crate::VERSION);

        let found = discovery.locate(&config.port_filter).ok_or_else(|| {
            LabError::DeviceNotFound(if config.port_filter.is_empty() {
                "no known USB serial device is attached".to_string()
            } else {
                format!("no known device on a port matching '{}'", config.port_filter)
            })
        })?;

        let mut driver = Limonata {
            port: found.port,
            device: found.device,
            baud: None,
            version: String::new(),
            state: ConnectionState::Unconnected,
            transport: None,
            registry,
            clock,
            debug: config.debug,
            heater: 0.0,
            gain: DEFAULT_GAIN,
        };

        driver.open(connector.as_mut(), &config)?;

        if let Err(e) = driver.initialize() {
            tracing::warn!("initialization after connect failed: {}", e);
            driver.release();
            return Err(e);
        }

        tracing::info!(
            "{} connected on port {} at {} baud.",
            driver.device,
            driver.port,
            driver.baud()
        );
        Ok(driver)
    }

    /// Try each configured baud rate in turn until one answers the handshake
    fn open(&mut self, connector: &mut dyn Connector, config: &DriverConfig) -> Result<(), LabError> {
        self.state = ConnectionState::Connecting;
        let primary = config.baud_rates.first().copied();
        let mut last_error = None;

        for &baud in &config.baud_rates {
            match self.attempt(connector, baud, config) {
                Attempt::Connected { transport, baud } => {
                    if primary != Some(baud) {
                        tracing::warn!(
                            "Could not connect at {} baud, but succeeded at {} baud.",
                            primary.unwrap_or_default(),
                            baud
                        );
                    }
                    self.transport = Some(transport);
                    self.baud = Some(baud);
                    self.state = ConnectionState::Connected;
                    return Ok(());
                }
                Attempt::Failed(LabError::AlreadyConnected) => {
                    self.state = ConnectionState::Unconnected;
                    return Err(LabError::AlreadyConnected);
                }
                Attempt::Failed(e) => {
                    tracing::warn!(port = %self.port, baud, "connection attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        self.state = ConnectionState::Unconnected;
        Err(LabError::ConnectionFailed(match last_error {
            Some(e) => format!("{} did not answer at any baud rate ({})", self.port, e),
            None => format!("{}: no baud rates to try", self.port),
        }))
    }

    /// One attempt: claim the registry, open the port, handshake.
    ///
    /// On failure nothing stays claimed or open.
    fn attempt(&self, connector: &mut dyn Connector, baud: u32, config: &DriverConfig) -> Attempt {
        if !self.registry.try_acquire() {
            return Attempt::Failed(LabError::AlreadyConnected);
        }

        tracing::debug!(port = %self.port, baud, "opening port");
        let mut transport = match connector.open(&self.port, baud, config.timeout()) {
            Ok(transport) => transport,
            Err(e) => {
                self.registry.release();
                return Attempt::Failed(e);
            }
        };

        // Opening the port resets the board
        let settle = config.settle_time();
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }

        match handshake(transport.as_mut(), self.debug) {
            Ok(echo) => {
                tracing::debug!(baud, echo, "handshake answered");
                Attempt::Connected { transport, baud }
            }
            Err(e) => {
                if transport.is_open() {
                    if let Err(close_err) = transport.close() {
                        tracing::warn!("failed to close {}: {}", self.port, close_err);
                    }
                }
                self.registry.release();
                Attempt::Failed(e)
            }
        }
    }

    /// Handshake and initial state once the link is up
    fn initialize(&mut self) -> Result<(), LabError> {
        // The firmware prints a banner that is not a response to anything
        match self.receive() {
            Ok(line) => tracing::debug!("discarded startup line {:?}", line),
            Err(LabError::Timeout) => tracing::debug!("no startup line"),
            Err(e) => return Err(e),
        }

        self.version = self.send_and_receive::<String>(&Command::Version.render())?;

        self.clock.set_rate(1.0)?;
        self.clock.start();

        self.gain = DEFAULT_GAIN;
        self.set_heater(0.0)?;
        Ok(())
    }

    /// Close the transport and free the registry, sending nothing
    fn release(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                tracing::warn!("failed to close {}: {}", self.port, e);
            }
            self.registry.release();
        }
        self.state = ConnectionState::Closed;
    }

    /// Turn the heater off, tell the firmware we are leaving, and release the port.
    ///
    /// Errors are logged, not returned. Calling this again is a no-op.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }

        if let Err(e) = self.set_heater(0.0) {
            tracing::warn!("failed to switch heater off while closing: {}", e);
        }
        if let Err(e) = self.send_and_receive::<String>(&Command::Disconnect.render()) {
            tracing::warn!("disconnect command failed: {}", e);
        }

        self.release();
        tracing::info!("Limonata disconnected successfully.");
    }

    fn transport_mut(&mut self) -> Result<&mut dyn Transport, LabError> {
        match self.transport.as_mut() {
            Some(transport) => Ok(&mut **transport),
            None => Err(LabError::NotConnected),
        }
    }

    /// Send one command line (terminator appended, output flushed)
    pub fn send(&mut self, msg: &str) -> Result<(), LabError> {
        let debug = self.debug;
        write_line(self.transport_mut()?, msg, debug)
    }

    /// Block until one response line arrives; returns it without terminator
    pub fn receive(&mut self) -> Result<String, LabError> {
        let debug = self.debug;
        read_line(self.transport_mut()?, debug)
    }

    /// Send `msg`, read the reply and parse it as `T`
    pub fn send_and_receive<T>(&mut self, msg: &str) -> Result<T, LabError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.send(msg)?;
        let response = self.receive()?;
        parse_response(msg, &response)
    }

    fn request(&mut self, command: Command) -> Result<f64, LabError> {
        self.send_and_receive(&command.render())
    }

    /// Read the temperature
    pub fn temperature(&mut self) -> Result<f64, LabError> {
        self.request(Command::Temperature)
    }

    /// Set heater power (clipped to 0..=100); returns the value the firmware applied
    pub fn set_heater(&mut self, value: f64) -> Result<f64, LabError> {
        self.heater = self.request(Command::SetHeater(value))?;
        Ok(self.heater)
    }

    /// Ask the firmware for the applied heater power without changing it
    pub fn heater(&mut self) -> Result<f64, LabError> {
        self.heater = self.request(Command::ReadHeater)?;
        Ok(self.heater)
    }

    /// Last heater value the firmware reported, without a round trip
    pub fn last_heater(&self) -> f64 {
        self.heater
    }

    /// Set the heater gain (clipped to 0..=255); returns the value the firmware applied
    pub fn set_gain(&mut self, value: f64) -> Result<f64, LabError> {
        self.gain = self.request(Command::SetGain(value))?;
        Ok(self.gain)
    }

    /// Last gain the firmware reported. No I/O.
    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// Temperature followed by heater power
    pub fn scan(&mut self) -> Result<(f64, f64), LabError> {
        let temperature = self.temperature()?;
        let heater = self.heater()?;
        Ok((temperature, heater))
    }

    /// Name of the serial port in use
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Board name from the USB lookup
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Baud rate the link settled on; may differ from the first one configured
    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or_default()
    }

    /// Firmware version string
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Where the driver is in its lifecycle
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether wire lines are echoed to the log
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// The clock this driver started
    pub fn clock(&self) -> &LabClock {
        &self.clock
    }
}

impl Drop for Limonata {
    fn drop(&mut self) {
        self.close();
    }
}
