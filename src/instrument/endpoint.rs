//! Transport seam.
//!
//! [`ScpiEndpoint`] is the request/response channel to one instrument;
//! [`ConnectionFactory`] turns an address string into a ready endpoint.
//!
//! ## Address formats
//!
//! - `TCPIP::192.168.1.20::5025::SOCKET`: raw SCPI socket
//! - `ASRL::/dev/ttyUSB0::9600`: serial port at the given baud rate
//! - anything else (e.g. `USB0::0x2A8D::0x0101::MY1234::INSTR`): VISA resource

use crate::config::InstrumentDefinition;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Request/response channel to one instrument.
///
/// Calls are sequential: an implementation finishes one exchange before
/// accepting the next.
#[async_trait]
pub trait ScpiEndpoint: Send + Sync {
    /// Connection string this endpoint was opened with.
    fn address(&self) -> &str;

    /// Send a command without reading a reply.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a command and read one reply line.
    async fn query(&self, command: &str) -> Result<String>;
}

/// Opens instrument sessions.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a session for the given definition or fail.
    async fn open(&self, definition: &InstrumentDefinition) -> Result<Arc<dyn ScpiEndpoint>>;
}

/// Parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Raw SCPI over TCP
    Tcp {
        /// Host name or IP
        host: String,
        /// Port (usually 5025)
        port: u16,
    },
    /// Serial line
    Serial {
        /// Device path
        path: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// VISA resource string
    Visa(String),
}

impl Transport {
    /// Classify an address string.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            bail!("empty instrument address");
        }
        let parts: Vec<&str> = address.split("::").collect();
        let prefix = parts[0].to_ascii_uppercase();

        let socket = parts.last().is_some_and(|p| p.eq_ignore_ascii_case("SOCKET"));
        if prefix.starts_with("TCPIP") && socket {
            if parts.len() != 4 {
                bail!("socket address must look like TCPIP::host::port::SOCKET, got '{}'", address);
            }
            let port = parts[2]
                .parse::<u16>()
                .map_err(|_| anyhow!("invalid port '{}' in '{}'", parts[2], address))?;
            return Ok(Transport::Tcp {
                host: parts[1].to_string(),
                port,
            });
        }

        if prefix.starts_with("ASRL") && parts.len() == 3 {
            if let Ok(baud_rate) = parts[2].parse::<u32>() {
                return Ok(Transport::Serial {
                    path: parts[1].to_string(),
                    baud_rate,
                });
            }
        }

        Ok(Transport::Visa(address.to_string()))
    }
}

/// Factory for real hardware, dispatching on the address format.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportFactory;

#[async_trait]
impl ConnectionFactory for TransportFactory {
    async fn open(&self, definition: &InstrumentDefinition) -> Result<Arc<dyn ScpiEndpoint>> {
        let timeout = definition.timeout();
        match Transport::parse(&definition.address)? {
            Transport::Tcp { host, port } => {
                let endpoint =
                    super::tcp::TcpEndpoint::connect(&definition.address, &host, port, timeout)
                        .await?;
                Ok(Arc::new(endpoint))
            }
            Transport::Serial { path, baud_rate } => open_serial(definition, path, baud_rate),
            Transport::Visa(resource) => open_visa(resource, timeout).await,
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn open_serial(
    definition: &InstrumentDefinition,
    path: String,
    baud_rate: u32,
) -> Result<Arc<dyn ScpiEndpoint>> {
    let endpoint = super::serial::SerialEndpoint::open(
        &definition.address,
        &path,
        baud_rate,
        definition.timeout(),
    )?;
    Ok(Arc::new(endpoint))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(
    _definition: &InstrumentDefinition,
    _path: String,
    _baud_rate: u32,
) -> Result<Arc<dyn ScpiEndpoint>> {
    Err(anyhow!(
        "Serial support not enabled. Rebuild with --features instrument_serial"
    ))
}

#[cfg(feature = "instrument_visa")]
async fn open_visa(
    resource: String,
    timeout: std::time::Duration,
) -> Result<Arc<dyn ScpiEndpoint>> {
    let endpoint = super::visa::VisaEndpoint::open(resource, timeout).await?;
    Ok(Arc::new(endpoint))
}

#[cfg(not(feature = "instrument_visa"))]
async fn open_visa(
    _resource: String,
    _timeout: std::time::Duration,
) -> Result<Arc<dyn ScpiEndpoint>> {
    Err(anyhow!(
        "VISA support not enabled. Rebuild with --features instrument_visa"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_address() {
        assert_eq!(
            Transport::parse("TCPIP0::192.168.1.20::5025::SOCKET").unwrap(),
            Transport::Tcp {
                host: "192.168.1.20".into(),
                port: 5025
            }
        );
    }

    #[test]
    fn socket_address_with_bad_port() {
        assert!(Transport::parse("TCPIP::host::http::SOCKET").is_err());
    }

    #[test]
    fn serial_address() {
        assert_eq!(
            Transport::parse("ASRL::/dev/ttyUSB0::115200").unwrap(),
            Transport::Serial {
                path: "/dev/ttyUSB0".into(),
                baud_rate: 115200
            }
        );
    }

    #[test]
    fn visa_resources_fall_through() {
        for resource in [
            "GPIB0::5::INSTR",
            "ASRL3::INSTR",
            "TCPIP0::192.168.0.10::inst0::INSTR",
        ] {
            assert_eq!(
                Transport::parse(resource).unwrap(),
                Transport::Visa(resource.to_string())
            );
        }
    }

    #[test]
    fn empty_address_rejected() {
        assert!(Transport::parse("  ").is_err());
    }
}
