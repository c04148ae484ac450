//! VISA endpoint for GPIB, USB-TMC and LXI resources.
//!
//! Needs a system VISA library at runtime. All I/O runs on the blocking pool.

use super::endpoint::ScpiEndpoint;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use visa_rs::prelude::*;

/// SCPI over a VISA session.
pub struct VisaEndpoint {
    address: String,
    session: Arc<Mutex<visa_rs::Instrument>>,
}

impl VisaEndpoint {
    /// Open `resource` through the default resource manager.
    pub async fn open(resource: String, timeout: Duration) -> Result<Self> {
        let address = resource.clone();
        let session = tokio::task::spawn_blocking(move || -> Result<visa_rs::Instrument> {
            let rm = DefaultRM::new()
                .map_err(|e| anyhow!("Failed to create VISA resource manager: {:?}", e))?;
            let name = CString::new(resource.as_str()).context("resource string contains NUL")?;
            rm.open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| anyhow!("Failed to open VISA resource '{}': {:?}", resource, e))
        })
        .await
        .context("VISA open task panicked")??;

        debug!(address = %address, "VISA session opened");
        Ok(Self {
            address,
            session: Arc::new(Mutex::new(session)),
        })
    }
}

fn write_line(session: &mut visa_rs::Instrument, command: &str) -> Result<()> {
    session
        .write_all(format!("{}\n", command).as_bytes())
        .with_context(|| format!("VISA write failed for: {}", command))
}

#[async_trait]
impl ScpiEndpoint for VisaEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, command: &str) -> Result<()> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = session.blocking_lock();
            write_line(&mut guard, &command)
        })
        .await
        .context("VISA I/O task panicked")?
    }

    async fn query(&self, command: &str) -> Result<String> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = session.blocking_lock();
            write_line(&mut guard, &command)?;
            let mut reply = String::new();
            BufReader::new(&*guard)
                .read_line(&mut reply)
                .with_context(|| format!("VISA read failed for: {}", command))?;
            Ok(reply.trim().to_string())
        })
        .await
        .context("VISA I/O task panicked")?
    }
}
