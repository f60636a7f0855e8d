//! Free-standing validation rules. Kept separate from the store so they
//! can be unit- and property-tested without any filesystem I/O.

use std::net::Ipv4Addr;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result, ValidationReport};
use crate::profiles::model::{
    AddressingMode, JobProfile, ModbusTcpConfiguration, SerialPortProfile, SocatProfile,
    ALLOWED_BAUD_RATES,
};

const MAX_NAME_LEN: usize = 100;
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_ENSURE_UNIQUE_ATTEMPTS: u32 = 1000;

static HOSTNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9\-\.]*[A-Za-z0-9])?$").unwrap());

/// `Name: non-empty after trim, ≤100, case-insensitive unique within type`.
pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::validation_field("name", "name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(Error::validation_field(
            "name",
            format!("name must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

/// Case-insensitive uniqueness check, excluding `exclude_id` (used on
/// Update so a profile doesn't collide with its own unchanged name).
pub fn is_name_unique(existing: &[(i64, String)], candidate: &str, exclude_id: Option<i64>) -> bool {
    let candidate_lower = candidate.to_lowercase();
    !existing.iter().any(|(id, name)| {
        Some(*id) != exclude_id && name.to_lowercase() == candidate_lower
    })
}

/// `EnsureUniqueName(base)`: if free, return base; else try `base_1`,
/// `base_2`, … up to 1000 attempts.
pub fn ensure_unique_name(base: &str, existing: &[(i64, String)]) -> Result<String> {
    if is_name_unique(existing, base, None) {
        return Ok(base.to_string());
    }
    for n in 1..=MAX_ENSURE_UNIQUE_ATTEMPTS {
        let candidate = format!("{base}_{n}");
        if is_name_unique(existing, &candidate, None) {
            return Ok(candidate);
        }
    }
    Err(Error::internal(format!(
        "could not find a unique name derived from '{base}' within {MAX_ENSURE_UNIQUE_ATTEMPTS} attempts"
    )))
}

/// `GetNextAvailableId`: lowest positive integer not currently in use.
pub fn next_available_id(existing_ids: &[i64]) -> i64 {
    let mut used: Vec<i64> = existing_ids.iter().copied().filter(|id| *id > 0).collect();
    used.sort_unstable();
    let mut candidate = 1i64;
    for id in used {
        if id == candidate {
            candidate += 1;
        } else if id > candidate {
            break;
        }
    }
    candidate
}

fn validate_hostname(host: &str) -> Result<()> {
    if host.parse::<Ipv4Addr>().is_ok() {
        return Ok(());
    }
    if host.is_empty() || host.chars().count() > MAX_HOSTNAME_LEN {
        return Err(Error::validation_field(
            "host",
            format!("hostname must be 1-{MAX_HOSTNAME_LEN} characters"),
        ));
    }
    if !HOSTNAME_RE.is_match(host) {
        return Err(Error::validation_field(
            "host",
            "hostname must contain only letters, digits, '-' and '.'",
        ));
    }
    Ok(())
}

pub fn validate_serial_port_profile(profile: &SerialPortProfile) -> Result<()> {
    let mut report = ValidationReport::new();
    if profile.device_path.trim().is_empty() {
        report.add("device_path", "device path must not be empty");
    }
    if !ALLOWED_BAUD_RATES.contains(&profile.baud_rate) {
        report.add("baud_rate", "baud rate is not one of the allowed values");
    }
    report.into_result(())
}

pub fn validate_socat_profile(profile: &SocatProfile) -> Result<()> {
    let mut report = ValidationReport::new();
    if profile.listen_port == 0 {
        report.add("listen_port", "port must be in 1-65535");
    }
    if profile.block_size == 0 {
        report.add("block_size", "block size must be greater than 0");
    }
    report.into_result(())
}

pub fn validate_modbus_tcp_configuration(cfg: &ModbusTcpConfiguration) -> Result<()> {
    let mut report = ValidationReport::new();
    if let Err(e) = validate_hostname(&cfg.host) {
        report.add(e.property().unwrap_or("host"), e.to_string());
    }
    if cfg.port == 0 {
        report.add("port", "port must be in 1-65535");
    }
    if cfg.device_id > 247 {
        report.add("device_id", "device id must be 0-247");
    }
    if cfg.addressing_mode == AddressingMode::Base1 && cfg.on_off_coil < 1 {
        report.add(
            "on_off_coil",
            "Base1 addressing requires on_off_coil to be at least 1",
        );
    }
    report.into_result(())
}

pub fn validate_job_profile(
    profile: &JobProfile,
    serial_ids: &[i64],
    socat_ids: &[i64],
    power_supply_ids: &[i64],
) -> Result<()> {
    let mut report = ValidationReport::new();
    if !serial_ids.contains(&profile.serial_profile_id) {
        report.add("serial_profile_id", "referenced serial profile not found");
    }
    if !socat_ids.contains(&profile.socat_profile_id) {
        report.add("socat_profile_id", "referenced socat profile not found");
    }
    if !power_supply_ids.contains(&profile.power_supply_profile_id) {
        report.add(
            "power_supply_profile_id",
            "referenced power supply profile not found",
        );
    }
    if profile.memory_region.length == 0 {
        report.add("memory_region", "memory region length must be > 0");
    }
    report.into_result(())?;

    if let Some(parent) = writable_check_path(&profile.output_directory) {
        if !parent {
            return Err(Error::validation_field(
                "output_directory",
                "output directory is not writeable",
            ));
        }
    }
    Ok(())
}

/// Returns `None` when the existence of the directory cannot be
/// determined from the path alone (not yet created); `Some(true)` /
/// `Some(false)` otherwise. Creation happens at task-dispatch time, not
/// here — resource validation must not have side effects.
fn writable_check_path(path: &Path) -> Option<bool> {
    if path.exists() {
        let meta = std::fs::metadata(path).ok()?;
        Some(!meta.permissions().readonly())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_available_id_fills_gaps() {
        assert_eq!(next_available_id(&[1, 2, 3]), 4);
        assert_eq!(next_available_id(&[1, 3]), 2);
        assert_eq!(next_available_id(&[]), 1);
    }

    #[test]
    fn ensure_unique_name_increments_suffix() {
        let existing = vec![
            (1, "Serial A".to_string()),
            (2, "Serial A_1".to_string()),
        ];
        assert_eq!(
            ensure_unique_name("Serial A", &existing).unwrap(),
            "Serial A_2"
        );
    }

    #[test]
    fn name_uniqueness_is_case_insensitive() {
        let existing = vec![(1, "Serial A".to_string())];
        assert!(!is_name_unique(&existing, "serial a", None));
        assert!(is_name_unique(&existing, "serial a", Some(1)));
    }

    #[test]
    fn hostname_boundary_253_254() {
        let host_253 = "a".repeat(253);
        let host_254 = "a".repeat(254);
        assert!(validate_hostname(&host_253).is_ok());
        assert!(validate_hostname(&host_254).is_err());
    }

    #[test]
    fn base1_coil_zero_fails_validation() {
        let cfg = ModbusTcpConfiguration {
            host: "10.0.0.5".to_string(),
            port: 502,
            device_id: 1,
            on_off_coil: 0,
            addressing_mode: AddressingMode::Base1,
            connection_timeout: std::time::Duration::from_secs(5),
            read_timeout: std::time::Duration::from_secs(3),
            write_timeout: std::time::Duration::from_secs(3),
            auto_reconnect: true,
            retry_count: 3,
        };
        let err = validate_modbus_tcp_configuration(&cfg).unwrap_err();
        assert_eq!(err.property(), Some("on_off_coil"));
    }
}
