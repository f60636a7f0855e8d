//! Orchestrator: the dump pipeline, retry policy, and a facade of
//! side-effect-free or read-only operations the engine exposes directly
//! (`validate_resources`, `test_connection`, `get_bootloader_info`,
//! `estimate_operation_time`) without going through the task scheduler.

pub mod pipeline;
pub mod retry;

use std::time::Duration;

use tokio::net::TcpStream;

use crate::adapters::serial;
use crate::adapters::socat::check_port_free;
use crate::error::{Error, Result, ValidationReport};
use crate::plc::client::{BootloaderInfo, PlcClient};
use crate::plc::transport::PlcTransport;
use crate::profiles::model::{JobProfile, PowerSupplyProfile, SerialPortProfile, SocatProfile};
use crate::profiles::modbus_tcp_configuration;

/// A conservative default throughput figure for `estimate_operation_time`
/// when no live measurement is available yet, taken from the same order
/// of magnitude as the socat `-b` block size default.
const ASSUMED_BYTES_PER_SECOND: f64 = 4_096.0;

/// Fixed per-stage overhead the pipeline burns before the first dump byte
/// moves: serial config + bridge start + power cycle + handshake.
const FIXED_OVERHEAD: Duration = Duration::from_secs(8);

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Checks that a job's referenced profiles resolve and that the serial
/// device, TCP port, and power-supply host all look reachable, without
/// configuring the serial port, starting the bridge, or touching a coil.
pub async fn validate_resources(
    job: &JobProfile,
    serial: &SerialPortProfile,
    socat: &SocatProfile,
    power_supply: &PowerSupplyProfile,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !serial::test_accessible(&serial.device_path, PROBE_TIMEOUT).await {
        report.add("serial_profile_id", format!("{} is not accessible", serial.device_path));
    }

    if let Err(e) = check_port_free(socat.listen_port).await {
        report.add("socat_profile_id", e.to_string());
    }

    let modbus_cfg = modbus_tcp_configuration(power_supply);
    if probe_tcp(&modbus_cfg.host, modbus_cfg.port).await.is_err() {
        report.add(
            "power_supply_profile_id",
            format!("{}:{} is not reachable", modbus_cfg.host, modbus_cfg.port),
        );
    }

    if !region_within_known_layout(job.memory_region.start_address, job.memory_region.length) {
        report.add(
            "memory_region",
            "memory region falls outside the known S7-1200 address layout",
        );
    }

    report
}

/// A TCP reachability probe with no protocol roundtrip, deliberately kept
/// separate from `PowerSupplyAdapter` so validation never issues a coil
/// read or write.
async fn probe_tcp(host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::timeout(format!("connecting to {addr} timed out")))?
        .map_err(|e| Error::transport(format!("failed to reach {addr}"), e))?;
    Ok(())
}

/// Known S7-1200 bootloader-accessible memory windows, used only to
/// sanity-check a job profile's memory region before any PLC is actually
/// contacted. A live `GetBootloaderInfo` call reports the authoritative
/// layout once connected.
const KNOWN_REGIONS: &[(u32, u32)] = &[(0x0000_0000, 0x0010_0000), (0x0800_0000, 0x0010_0000)];

fn region_within_known_layout(start: u32, length: u32) -> bool {
    let end = start as u64 + length as u64;
    KNOWN_REGIONS
        .iter()
        .any(|(base, len)| start as u64 >= *base as u64 && end <= *base as u64 + *len as u64)
}

/// A handshake-only dry run against an already-listening bridge: connects
/// and completes the handshake, skipping power-cycle and bridge-start.
pub async fn test_connection(socat: &SocatProfile, power_supply: &PowerSupplyProfile) -> Result<()> {
    let modbus_cfg = modbus_tcp_configuration(power_supply);
    let transport = PlcTransport::connect(
        "127.0.0.1",
        socat.listen_port,
        Duration::from_secs(5),
        modbus_cfg.read_timeout,
        modbus_cfg.write_timeout,
    )
    .await?;
    let mut client = PlcClient::new(transport);
    client.handshake().await
}

/// Thin wrapper over `PlcClient::get_bootloader_info`, exposed on the
/// facade so callers can query capabilities without constructing a task.
pub async fn get_bootloader_info(socat: &SocatProfile, power_supply: &PowerSupplyProfile) -> Result<BootloaderInfo> {
    let modbus_cfg = modbus_tcp_configuration(power_supply);
    let transport = PlcTransport::connect(
        "127.0.0.1",
        socat.listen_port,
        Duration::from_secs(5),
        modbus_cfg.read_timeout,
        modbus_cfg.write_timeout,
    )
    .await?;
    let mut client = PlcClient::new(transport);
    client.handshake().await?;
    client.get_bootloader_info().await
}

/// A rough estimate of total operation time: fixed pipeline overhead plus
/// region length divided by an assumed transfer rate.
pub fn estimate_operation_time(region_length: u32, observed_bytes_per_second: Option<f64>) -> Duration {
    let rate = observed_bytes_per_second.filter(|r| *r > 0.0).unwrap_or(ASSUMED_BYTES_PER_SECOND);
    let transfer_secs = region_length as f64 / rate;
    FIXED_OVERHEAD + Duration::from_secs_f64(transfer_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_scales_with_region_length() {
        let small = estimate_operation_time(4_096, Some(4_096.0));
        let large = estimate_operation_time(40_960, Some(4_096.0));
        assert!(large > small);
    }

    #[test]
    fn known_layout_accepts_low_region_and_rejects_out_of_range() {
        assert!(region_within_known_layout(0, 0x1000));
        assert!(!region_within_known_layout(0x0F00_0000, 0x1000));
    }
}
