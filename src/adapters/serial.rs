//! Serial-port adapter. Enumeration is backed by the `serialport`
//! crate rather than hand-parsing `/dev`; applying a profile shells out to
//! `stty` with a composed, allowlist-checked argument list.

use std::path::Path;
use std::time::{Duration, Instant};

use serialport::SerialPortType;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::profiles::model::{DataBits, FlowControl, Parity, SerialPortProfile, StopBits};

use super::CommandOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPortKind {
    Usb,
    Acm,
    Standard,
    Virtual,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DiscoveredSerialPort {
    pub device_path: String,
    pub kind: SerialPortKind,
    pub usb_vendor_id: Option<u16>,
    pub usb_product_id: Option<u16>,
}

fn classify(device_path: &str, port_type: &SerialPortType) -> SerialPortKind {
    match port_type {
        SerialPortType::UsbPort(_) => SerialPortKind::Usb,
        SerialPortType::PciPort => SerialPortKind::Standard,
        SerialPortType::BluetoothPort => SerialPortKind::Virtual,
        SerialPortType::Unknown => {
            if device_path.contains("ttyACM") {
                SerialPortKind::Acm
            } else if device_path.contains("ttyUSB") {
                SerialPortKind::Usb
            } else if device_path.contains("ttyS") {
                SerialPortKind::Standard
            } else {
                SerialPortKind::Unknown
            }
        }
    }
}

/// Enumerates `/dev/ttyUSB*`, `/dev/ttyACM*`, `/dev/ttyS*` via the
/// platform's serial port registry.
pub fn enumerate() -> Result<Vec<DiscoveredSerialPort>> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::transport("failed to enumerate serial ports", anyhow::anyhow!(e)))?;

    Ok(ports
        .into_iter()
        .filter(|p| {
            p.port_name.contains("ttyUSB")
                || p.port_name.contains("ttyACM")
                || p.port_name.contains("ttyS")
        })
        .map(|p| {
            let kind = classify(&p.port_name, &p.port_type);
            let (vid, pid) = match &p.port_type {
                SerialPortType::UsbPort(info) => (Some(info.vid), Some(info.pid)),
                _ => (None, None),
            };
            DiscoveredSerialPort {
                device_path: p.port_name,
                kind,
                usb_vendor_id: vid,
                usb_product_id: pid,
            }
        })
        .collect())
}

/// Tests accessibility by a non-blocking open with a timeout, without
/// leaving the port configured afterward.
pub async fn test_accessible(device_path: &str, timeout: Duration) -> bool {
    let path = device_path.to_string();
    tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || {
        serialport::new(&path, 115_200).open().is_ok()
    }))
    .await
    .map(|r| r.unwrap_or(false))
    .unwrap_or(false)
}

/// Tokens `stty` may be invoked with. Anything outside this allowlist is
/// refused before the subprocess is spawned, even though this adapter
/// only ever composes the command itself.
fn is_allowlisted_token(token: &str) -> bool {
    let static_tokens = [
        "raw", "-echo", "-echoe", "-echok", "-echoctl", "-echoke", "-isig", "-icanon", "-iexten",
        "-opost", "-onlcr", "-ignbrk", "-brkint", "-icrnl", "-imaxbel", "parenb", "-parenb",
        "parodd", "-parodd", "cstopb", "-cstopb", "crtscts", "-crtscts", "ixon", "-ixon",
    ];
    if static_tokens.contains(&token) {
        return true;
    }
    if let Some(digits) = token.strip_prefix("cs") {
        return digits.len() == 1 && digits.chars().all(|c| c.is_ascii_digit());
    }
    token.chars().all(|c| c.is_ascii_digit())
}

fn data_bits_token(bits: DataBits) -> &'static str {
    match bits {
        DataBits::Five => "cs5",
        DataBits::Six => "cs6",
        DataBits::Seven => "cs7",
        DataBits::Eight => "cs8",
    }
}

fn parity_tokens(parity: Parity) -> Vec<&'static str> {
    match parity {
        Parity::None => vec!["-parenb"],
        Parity::Odd => vec!["parenb", "parodd"],
        Parity::Even => vec!["parenb", "-parodd"],
        // stty has no first-class mark/space; closest approximation is
        // parenb+parodd/cmspar, which this crate doesn't assume is
        // present everywhere, so these fall back to odd/even.
        Parity::Mark => vec!["parenb", "parodd"],
        Parity::Space => vec!["parenb", "-parodd"],
    }
}

fn stop_bits_token(bits: StopBits) -> &'static str {
    match bits {
        StopBits::One | StopBits::OnePointFive => "-cstopb",
        StopBits::Two => "cstopb",
    }
}

fn flow_control_tokens(flow: FlowControl) -> Vec<&'static str> {
    match flow {
        FlowControl::None => vec!["-crtscts", "-ixon"],
        FlowControl::RtsCts => vec!["crtscts", "-ixon"],
        FlowControl::XonXoff => vec!["-crtscts", "ixon"],
    }
}

/// Composes the single `stty -F <device> …` command for a profile.
fn compose_stty_args(device_path: &str, profile: &SerialPortProfile) -> Vec<String> {
    let mut args: Vec<String> = vec!["-F".to_string(), device_path.to_string()];
    args.push(data_bits_token(profile.data_bits).to_string());
    args.push(profile.baud_rate.to_string());
    for t in parity_tokens(profile.parity) {
        args.push(t.to_string());
    }
    args.push(stop_bits_token(profile.stop_bits).to_string());
    for t in flow_control_tokens(profile.flow_control) {
        args.push(t.to_string());
    }
    if profile.raw_mode {
        for t in [
            "raw", "-echo", "-echoe", "-echok", "-echoctl", "-echoke", "-isig", "-icanon",
            "-iexten", "-opost", "-onlcr", "-ignbrk", "-brkint", "-icrnl", "-imaxbel",
        ] {
            args.push(t.to_string());
        }
    }
    args
}

fn validate_args(device_path: &str, args: &[String]) -> Result<()> {
    if device_path.chars().any(|c| !c.is_ascii() || c.is_whitespace()) {
        return Err(Error::validation_field(
            "device_path",
            "device path contains characters that cannot be safely passed to stty",
        ));
    }
    // args[0..2] are "-F" and the device path, checked separately above.
    for token in args.iter().skip(2) {
        if !is_allowlisted_token(token) {
            return Err(Error::internal(format!(
                "refusing to run stty with non-allowlisted token '{token}'"
            )));
        }
    }
    Ok(())
}

/// Applies a profile by running `stty -F <device> …`.
#[instrument(skip(profile), fields(device = %device_path))]
pub async fn apply_profile(
    stty_binary: &Path,
    device_path: &str,
    profile: &SerialPortProfile,
) -> Result<CommandOutcome> {
    let args = compose_stty_args(device_path, profile);
    validate_args(device_path, &args)?;

    let start = Instant::now();
    let output = Command::new(stty_binary)
        .args(&args)
        .output()
        .await
        .map_err(|e| Error::external(format!("failed to spawn {}", stty_binary.display())).with_source(e))?;
    let duration = start.elapsed();

    let outcome = CommandOutcome {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration,
    };
    debug!(success = outcome.success, exit_code = ?outcome.exit_code, "stty finished");
    if !outcome.success {
        return Err(Error::external(format!(
            "stty exited with {:?}: {}",
            outcome.exit_code, outcome.stderr
        )));
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::model::SerialPortProfile;

    #[test]
    fn composed_args_are_allowlisted() {
        let profile = SerialPortProfile::new_default("/dev/ttyUSB0");
        let args = compose_stty_args("/dev/ttyUSB0", &profile);
        assert!(validate_args("/dev/ttyUSB0", &args).is_ok());
    }

    #[test]
    fn rejects_token_outside_allowlist() {
        let bad = vec!["-F".to_string(), "/dev/ttyUSB0".to_string(), "; rm -rf /".to_string()];
        assert!(validate_args("/dev/ttyUSB0", &bad).is_err());
    }

    #[test]
    fn rejects_device_path_with_shell_metacharacters() {
        let profile = SerialPortProfile::new_default("/dev/ttyUSB0; rm -rf /");
        let args = compose_stty_args("/dev/ttyUSB0; rm -rf /", &profile);
        assert!(validate_args("/dev/ttyUSB0; rm -rf /", &args).is_err());
    }
}
