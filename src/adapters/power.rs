//! Power-supply adapter: a Modbus-TCP client built on `rmodbus`'s
//! sans-I/O frame encoder/decoder, driven over a plain `tokio::net::TcpStream`.

use std::time::Duration;

use rmodbus::client::ModbusRequest;
use rmodbus::guess_response_frame_len;
use rmodbus::ModbusProto;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::profiles::model::ModbusTcpConfiguration;

async fn connect(cfg: &ModbusTcpConfiguration) -> Result<TcpStream> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    tokio::time::timeout(cfg.connection_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::timeout(format!("connecting to {addr} timed out")))?
        .map_err(|e| Error::transport(format!("failed to connect to {addr}"), e))
}

async fn roundtrip(cfg: &ModbusTcpConfiguration, stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>> {
    tokio::time::timeout(cfg.write_timeout, stream.write_all(request))
        .await
        .map_err(|_| Error::timeout("writing Modbus request timed out"))?
        .map_err(|e| Error::transport("failed to write Modbus request", e))?;

    let mut header = [0u8; 6];
    tokio::time::timeout(cfg.read_timeout, stream.read_exact(&mut header))
        .await
        .map_err(|_| Error::timeout("reading Modbus response header timed out"))?
        .map_err(|e| Error::transport("failed to read Modbus response header", e))?;

    let mut response = header.to_vec();
    let total_len = guess_response_frame_len(&header, ModbusProto::TcpUdp)
        .map_err(|e| Error::protocol(format!("could not determine Modbus frame length: {e:?}")))?
        as usize;
    if total_len > header.len() {
        let mut rest = vec![0u8; total_len - header.len()];
        tokio::time::timeout(cfg.read_timeout, stream.read_exact(&mut rest))
            .await
            .map_err(|_| Error::timeout("reading Modbus response body timed out"))?
            .map_err(|e| Error::transport("failed to read Modbus response body", e))?;
        response.extend_from_slice(&rest);
    }
    Ok(response)
}

/// Writes the Single Coil (0x05) with 0xFF00/0x0000, Base0 address
/// already resolved by the caller via `ModbusTcpConfiguration::wire_coil_address`.
#[instrument(skip(cfg), fields(host = %cfg.host, port = cfg.port, coil))]
async fn set_coil_once(cfg: &ModbusTcpConfiguration, coil: u16, on: bool) -> Result<()> {
    let mut mreq = ModbusRequest::new(cfg.device_id, ModbusProto::TcpUdp);
    let mut request = Vec::new();
    mreq.generate_set_coil(coil, on, &mut request)
        .map_err(|e| Error::protocol(format!("failed to encode Modbus set-coil request: {e:?}")))?;

    let mut stream = connect(cfg).await?;
    let response = roundtrip(cfg, &mut stream, &request).await?;
    mreq.parse_ok(&response)
        .map_err(|e| Error::protocol(format!("Modbus device rejected set-coil request: {e:?}")))?;
    Ok(())
}

#[instrument(skip(cfg), fields(host = %cfg.host, port = cfg.port, coil))]
async fn read_coil_once(cfg: &ModbusTcpConfiguration, coil: u16) -> Result<bool> {
    let mut mreq = ModbusRequest::new(cfg.device_id, ModbusProto::TcpUdp);
    let mut request = Vec::new();
    mreq.generate_get_coils(coil, 1, &mut request)
        .map_err(|e| Error::protocol(format!("failed to encode Modbus read-coil request: {e:?}")))?;

    let mut stream = connect(cfg).await?;
    let response = roundtrip(cfg, &mut stream, &request).await?;
    let mut out = Vec::new();
    mreq.parse_bool(&response, &mut out)
        .map_err(|e| Error::protocol(format!("Modbus device rejected read-coil request: {e:?}")))?;
    out.first().copied().ok_or_else(|| Error::protocol("empty coil response"))
}

/// Retries `cfg.retry_count` times with exponential backoff capped at
/// `max_backoff`, honoring cancellation between attempts.
async fn with_retry<T, F, Fut>(
    cfg: &ModbusTcpConfiguration,
    cancel: &CancellationToken,
    max_backoff: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < cfg.retry_count && err.is_retryable_kind() => {
                attempt += 1;
                let backoff = Duration::from_millis(200 * 2u64.saturating_pow(attempt)).min(max_backoff);
                warn!(attempt, error = %err, "Modbus operation failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(Error::cancelled("power supply operation cancelled during backoff")),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

pub struct PowerSupplyAdapter;

impl PowerSupplyAdapter {
    pub async fn set_power(
        cfg: &ModbusTcpConfiguration,
        on: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let coil = cfg.wire_coil_address();
        let max_backoff = Duration::from_millis(cfg.retry_count as u64 * 1000).max(Duration::from_secs(1));
        with_retry(cfg, cancel, max_backoff, || set_coil_once(cfg, coil, on)).await
    }

    pub async fn read_power(cfg: &ModbusTcpConfiguration, cancel: &CancellationToken) -> Result<bool> {
        let coil = cfg.wire_coil_address();
        let max_backoff = Duration::from_millis(cfg.retry_count as u64 * 1000).max(Duration::from_secs(1));
        with_retry(cfg, cancel, max_backoff, || read_coil_once(cfg, coil)).await
    }

    /// Sets the coil off, sleeps `delay`, sets it on.
    #[instrument(skip(cfg), fields(host = %cfg.host, port = cfg.port))]
    pub async fn power_cycle(
        cfg: &ModbusTcpConfiguration,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::set_power(cfg, false, cancel).await?;
        debug!(?delay, "power off, waiting before re-enabling");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(Error::cancelled("power cycle cancelled during delay")),
        }
        Self::set_power(cfg, true, cancel).await
    }
}
