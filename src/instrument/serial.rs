//! RS-232 / USB-serial endpoint.
//!
//! `serialport` is blocking, so every exchange runs on the blocking pool
//! with the port behind `Arc<Mutex<..>>`.

use super::endpoint::ScpiEndpoint;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const LINE_TERMINATOR: &str = "\n";
const RESPONSE_DELIMITER: u8 = b'\n';

/// SCPI over a serial line.
pub struct SerialEndpoint {
    address: String,
    timeout: Duration,
    session: Arc<Mutex<LineSession<Box<dyn SerialPort>>>>,
}

impl SerialEndpoint {
    /// Open `path` at `baud_rate`.
    pub fn open(address: &str, path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .with_context(|| {
                format!("Failed to open serial port '{}' at {} baud", path, baud_rate)
            })?;

        debug!(path, baud_rate, "serial port opened");
        Ok(Self {
            address: address.to_string(),
            timeout,
            session: Arc::new(Mutex::new(LineSession::new(port))),
        })
    }
}

/// Line-oriented exchange on a blocking port.
///
/// A failed exchange may leave its reply in flight. The session is then
/// marked stale and the next exchange first consumes one line (or waits out
/// the timeout) so that reply is never taken as the answer to a later query.
struct LineSession<P> {
    port: P,
    stale: bool,
}

impl<P: Read + Write> LineSession<P> {
    fn new(port: P) -> Self {
        Self { port, stale: false }
    }

    fn resync(&mut self, timeout: Duration) {
        if !self.stale {
            return;
        }
        match read_line(&mut self.port, timeout) {
            Ok(late) => debug!(reply = %late, "discarded late reply"),
            Err(err) => debug!(error = %err, "no late reply to discard"),
        }
        self.stale = false;
    }

    fn write(&mut self, command: &str, timeout: Duration) -> Result<()> {
        self.resync(timeout);
        let result = write_line(&mut self.port, command);
        self.stale = result.is_err();
        result
    }

    fn query(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.resync(timeout);
        let result =
            write_line(&mut self.port, command).and_then(|()| read_line(&mut self.port, timeout));
        self.stale = result.is_err();
        result
    }
}

fn write_line<P: Write + ?Sized>(port: &mut P, command: &str) -> Result<()> {
    port.write_all(format!("{}{}", command, LINE_TERMINATOR).as_bytes())
        .context("Failed to write to serial port")?;
    port.flush().context("Failed to flush serial port")
}

fn read_line<P: Read + ?Sized>(port: &mut P, timeout: Duration) -> Result<String> {
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    let start = Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(anyhow!("Serial read timeout after {:?}", timeout));
        }
        match port.read(&mut byte) {
            Ok(0) => return Err(anyhow!("Unexpected EOF on serial port")),
            Ok(_) => {
                if byte[0] == RESPONSE_DELIMITER {
                    break;
                }
                response.push(byte[0]);
            }
            // the port's own timeout is shorter than ours
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(anyhow!("Serial read error: {}", e)),
        }
    }

    Ok(String::from_utf8_lossy(&response).trim().to_string())
}

#[async_trait]
impl ScpiEndpoint for SerialEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, command: &str) -> Result<()> {
        let session = self.session.clone();
        let command = command.to_string();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || session.blocking_lock().write(&command, timeout))
            .await
            .context("Serial I/O task panicked")?
    }

    async fn query(&self, command: &str) -> Result<String> {
        let session = self.session.clone();
        let command = command.to_string();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || session.blocking_lock().query(&command, timeout))
            .await
            .context("Serial I/O task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Port whose input is whatever the test queued; reads time out when
    /// nothing is queued.
    #[derive(Default)]
    struct ScriptedPort {
        input: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.input.pop_front() {
                Some(byte) => {
                    buf[0] = byte;
                    Ok(1)
                }
                None => Err(std::io::ErrorKind::TimedOut.into()),
            }
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn late_reply_is_not_taken_by_next_query() {
        let timeout = Duration::from_millis(50);
        let mut session = LineSession::new(ScriptedPort::default());
        assert!(session.query("FETC?", timeout).is_err());

        // the fetch answer shows up late, followed by the voltage reply
        session.port.input.extend(b"+1.0E+00\n+5.0E+00\n");
        let reply = session.query("MEAS:VOLT?", timeout).unwrap();
        assert_eq!(reply, "+5.0E+00");
        assert_eq!(session.port.written, b"FETC?\nMEAS:VOLT?\n");
    }

    #[test]
    fn clean_session_reads_its_own_reply() {
        let timeout = Duration::from_millis(50);
        let mut session = LineSession::new(ScriptedPort::default());
        session.port.input.extend(b"SIM,PSU\n");
        assert_eq!(session.query("*IDN?", timeout).unwrap(), "SIM,PSU");
        session.write("OUTP ON", timeout).unwrap();
        assert!(!session.stale);
    }

    #[test]
    fn missing_port_reports_path() {
        let err = SerialEndpoint::open(
            "ASRL::/dev/does-not-exist::9600",
            "/dev/does-not-exist",
            9600,
            Duration::from_millis(100),
        )
        .err()
        .unwrap();
        assert!(format!("{:#}", err).contains("/dev/does-not-exist"));
    }
}
