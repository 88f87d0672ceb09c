//! Serial command link for RS-232/USB-serial instruments.
//!
//! Wraps the `serialport` crate and provides async I/O by running the
//! synchronous serial operations on Tokio's blocking task executor.

use crate::error::{AppResult, DaqError};
use crate::link::CommandLink;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Serial command link.
///
/// Builder methods configure the protocol framing and the pacing the device
/// needs. Slow instruments that do not buffer commands get a `query_delay`
/// (pause between write and read) and a `command_gap` (minimum spacing
/// between consecutive commands).
pub struct SerialLink {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3").
    port_name: String,

    /// Baud rate (e.g. 9600, 115200).
    baud_rate: u32,

    /// Overall read timeout per query.
    timeout: Duration,

    /// Line terminator appended to commands.
    line_terminator: String,

    /// Response line ending character.
    response_delimiter: char,

    /// Pause between writing a query and reading its response.
    query_delay: Duration,

    /// Minimum spacing between consecutive commands.
    command_gap: Duration,

    /// Completion time of the last command, for `command_gap` pacing.
    last_command: Option<Instant>,

    /// The open port (behind Arc<Mutex> so blocking tasks can share it).
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialLink {
    /// Create a new serial link with default framing (`\r\n` / `\n`).
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_secs(2),
            line_terminator: "\r\n".to_string(),
            response_delimiter: '\n',
            query_delay: Duration::ZERO,
            command_gap: Duration::ZERO,
            last_command: None,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set the overall read timeout per query.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the line terminator appended to commands.
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// Set the response delimiter character.
    pub fn with_response_delimiter(mut self, delimiter: char) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    /// Pause between writing a query and reading its response.
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    /// Minimum spacing between consecutive commands.
    pub fn with_command_gap(mut self, gap: Duration) -> Self {
        self.command_gap = gap;
        self
    }

    /// Open the serial port.
    #[cfg(feature = "instrument_serial")]
    pub async fn connect(&mut self) -> AppResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(100)) // Internal read timeout
            .open()
            .map_err(|e| {
                DaqError::Transport(format!(
                    "Failed to open serial port '{}' at {} baud: {e}",
                    self.port_name, self.baud_rate
                ))
            })?;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(())
    }

    /// Open the serial port.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn connect(&mut self) -> AppResult<()> {
        Err(DaqError::SerialFeatureDisabled)
    }

    /// Close the serial port.
    pub fn disconnect(&mut self) {
        #[cfg(feature = "instrument_serial")]
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.port_name);
        }
    }

    /// Whether the port is open.
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    /// Sleep out the remainder of the command gap, if any.
    async fn pace(&mut self) {
        if let Some(last) = self.last_command {
            let elapsed = last.elapsed();
            if elapsed < self.command_gap {
                tokio::time::sleep(self.command_gap - elapsed).await;
            }
        }
    }

    #[cfg(feature = "instrument_serial")]
    async fn send(&mut self, command: &str, read_response: bool) -> AppResult<Option<String>> {
        let port = self
            .port
            .as_ref()
            .ok_or(DaqError::SerialPortNotConnected)?
            .clone();

        self.pace().await;

        let command_str = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();
        let delimiter = self.response_delimiter;
        let timeout = self.timeout;
        let query_delay = self.query_delay;

        // Execute blocking serial I/O on a dedicated thread.
        let result = tokio::task::spawn_blocking(move || -> AppResult<Option<String>> {
            use std::io::{Read, Write};

            let mut port_guard = port.blocking_lock();

            port_guard
                .write_all(command_str.as_bytes())
                .map_err(|e| DaqError::Transport(format!("Serial write failed: {e}")))?;
            port_guard
                .flush()
                .map_err(|e| DaqError::Transport(format!("Serial flush failed: {e}")))?;

            debug!("Sent serial command: {}", command_for_log.trim());

            if !read_response {
                return Ok(None);
            }

            // The device does not buffer; give it time to compose a reply.
            if !query_delay.is_zero() {
                std::thread::sleep(query_delay);
            }

            // Read byte-by-byte until the delimiter, bounded by the overall timeout.
            let mut response = String::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(DaqError::Transport(format!(
                        "Serial read timeout after {timeout:?}"
                    )));
                }

                match port_guard.read(&mut buffer) {
                    Ok(1) => {
                        let ch = buffer[0] as char;
                        if ch == delimiter {
                            break;
                        }
                        response.push(ch);
                    }
                    Ok(_) => {
                        return Err(DaqError::Transport(
                            "Unexpected EOF from serial port".to_string(),
                        ));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than our overall timeout.
                        continue;
                    }
                    Err(e) => {
                        return Err(DaqError::Transport(format!("Serial read error: {e}")));
                    }
                }
            }

            let response = response.trim().to_string();
            debug!("Received serial response: {}", response);
            Ok(Some(response))
        })
        .await
        .map_err(|e| DaqError::Transport(format!("Serial I/O task failed: {e}")))?;

        self.last_command = Some(Instant::now());
        result
    }
}

#[async_trait]
impl CommandLink for SerialLink {
    #[cfg(feature = "instrument_serial")]
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.send(command, false).await?;
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn write(&mut self, _command: &str) -> AppResult<()> {
        Err(DaqError::SerialFeatureDisabled)
    }

    #[cfg(feature = "instrument_serial")]
    async fn query(&mut self, command: &str) -> AppResult<String> {
        let response = self.send(command, true).await?;
        response.ok_or_else(|| DaqError::Transport("Empty serial response".to_string()))
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn query(&mut self, _command: &str) -> AppResult<String> {
        Err(DaqError::SerialFeatureDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_pacing_knobs() {
        let link = SerialLink::new("/dev/ttyUSB0".to_string(), 9600)
            .with_timeout(Duration::from_secs(12))
            .with_query_delay(Duration::from_millis(100))
            .with_command_gap(Duration::from_millis(100))
            .with_response_delimiter('\r');

        assert_eq!(link.timeout, Duration::from_secs(12));
        assert_eq!(link.query_delay, Duration::from_millis(100));
        assert_eq!(link.command_gap, Duration::from_millis(100));
        assert_eq!(link.response_delimiter, '\r');
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn query_without_connect_is_rejected() {
        let mut link = SerialLink::new("/dev/ttyUSB0".to_string(), 9600);
        let err = link.query("ID").await.unwrap_err();
        #[cfg(feature = "instrument_serial")]
        assert!(matches!(err, DaqError::SerialPortNotConnected));
        #[cfg(not(feature = "instrument_serial"))]
        assert!(matches!(err, DaqError::SerialFeatureDisabled));
    }
}
