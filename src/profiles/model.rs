//! Typed profile data. Each profile type embeds a flattened [`ProfileBase`]
//! so a profile's JSON file is a flat object (no nested `base` field on
//! the wire).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fields common to every profile type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileBase {
    /// 0 means unassigned; the store stamps a positive id on Create.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_read_only: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub flags: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<HashMap<String, String>>,
}

fn default_version() -> String {
    "1".to_string()
}

impl ProfileBase {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            is_default: false,
            is_read_only: false,
            created_at: now,
            modified_at: now,
            version: default_version(),
            options: String::new(),
            flags: String::new(),
            metadata: None,
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// One member of the tagged profile union, used instead of a class
/// hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Serial,
    Socat,
    PowerSupply,
    Job,
}

impl ProfileKind {
    /// Directory name under the profiles base path.
    pub fn directory_name(self) -> &'static str {
        match self {
            ProfileKind::Serial => "SerialPortProfiles",
            ProfileKind::Socat => "SocatProfiles",
            ProfileKind::PowerSupply => "PowerSupplyProfiles",
            ProfileKind::Job => "JobProfiles",
        }
    }

    pub fn default_name(self) -> &'static str {
        match self {
            ProfileKind::Serial => "SerialDefault",
            ProfileKind::Socat => "SocatDefault",
            ProfileKind::PowerSupply => "PowerSupplyDefault",
            ProfileKind::Job => "S7Tools Default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five = 5,
    Six = 6,
    Seven = 7,
    Eight = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    RtsCts,
    XonXoff,
}

/// Serial link profile. Raw-mode toggles mirror the `stty` switches the
/// serial adapter composes from this profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortProfile {
    #[serde(flatten)]
    pub base: ProfileBase,
    pub device_path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    #[serde(default = "default_true")]
    pub raw_mode: bool,
}

fn default_true() -> bool {
    true
}

impl SerialPortProfile {
    pub fn new_default(device_path: impl Into<String>) -> Self {
        let mut base = ProfileBase::new(ProfileKind::Serial.default_name());
        base.is_default = true;
        base.is_read_only = true;
        Self {
            base,
            device_path: device_path.into(),
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            raw_mode: true,
        }
    }
}

/// Allowed baud rates.
pub const ALLOWED_BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115_200, 230_400, 460_800, 500_000, 576_000, 921_600, 1_000_000, 1_152_000, 1_500_000,
    2_000_000, 2_500_000, 3_000_000, 3_500_000, 4_000_000,
];

/// Socat bridge profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocatProfile {
    #[serde(flatten)]
    pub base: ProfileBase,
    pub listen_port: u16,
    pub block_size: u32,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub hex_dump: bool,
    #[serde(default = "default_true")]
    pub fork: bool,
    #[serde(default = "default_true")]
    pub reuse_addr: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serial_device_override: Option<String>,
}

impl SocatProfile {
    pub fn new_default(listen_port: u16) -> Self {
        let mut base = ProfileBase::new(ProfileKind::Socat.default_name());
        base.is_default = true;
        base.is_read_only = true;
        Self {
            base,
            listen_port,
            block_size: 4096,
            verbose: false,
            hex_dump: false,
            fork: true,
            reuse_addr: true,
            serial_device_override: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    Base0,
    Base1,
}

fn default_modbus_port() -> u16 {
    502
}

/// Modbus-TCP configuration — the mandatory variant of
/// `PowerSupplyConfiguration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusTcpConfiguration {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    pub device_id: u8,
    pub on_off_coil: u16,
    pub addressing_mode: AddressingMode,
    #[serde(with = "humantime_serde", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_io_timeout")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_io_timeout")]
    pub write_timeout: Duration,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_retry_count() -> u32 {
    3
}

impl ModbusTcpConfiguration {
    /// Translates a Base1 `on_off_coil` to the Base0 address the wire
    /// protocol expects, by subtracting one.
    pub fn wire_coil_address(&self) -> u16 {
        match self.addressing_mode {
            AddressingMode::Base0 => self.on_off_coil,
            AddressingMode::Base1 => self.on_off_coil.saturating_sub(1),
        }
    }
}

/// Polymorphic power-supply configuration. Modbus-TCP is the only
/// variant this implementation defines; the tag leaves room for future
/// extension points without breaking existing profile files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PowerSupplyConfiguration {
    ModbusTcp(ModbusTcpConfiguration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerSupplyProfile {
    #[serde(flatten)]
    pub base: ProfileBase,
    pub configuration: PowerSupplyConfiguration,
}

impl PowerSupplyProfile {
    pub fn new_default(host: impl Into<String>) -> Self {
        let mut base = ProfileBase::new(ProfileKind::PowerSupply.default_name());
        base.is_default = true;
        base.is_read_only = true;
        Self {
            base,
            configuration: PowerSupplyConfiguration::ModbusTcp(ModbusTcpConfiguration {
                host: host.into(),
                port: default_modbus_port(),
                device_id: 1,
                on_off_coil: 1,
                addressing_mode: AddressingMode::Base1,
                connection_timeout: default_connection_timeout(),
                read_timeout: default_io_timeout(),
                write_timeout: default_io_timeout(),
                auto_reconnect: true,
                retry_count: default_retry_count(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start_address: u32,
    pub length: u32,
}

/// References three other profiles by id plus the memory region to dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProfile {
    #[serde(flatten)]
    pub base: ProfileBase,
    pub serial_profile_id: i64,
    pub socat_profile_id: i64,
    pub power_supply_profile_id: i64,
    pub memory_region: MemoryRegion,
    pub output_directory: PathBuf,
    #[serde(default)]
    pub is_template: bool,
}

impl JobProfile {
    pub fn new_default(
        serial_profile_id: i64,
        socat_profile_id: i64,
        power_supply_profile_id: i64,
        output_directory: PathBuf,
    ) -> Self {
        let mut base = ProfileBase::new(ProfileKind::Job.default_name());
        base.is_default = true;
        base.is_read_only = true;
        Self {
            base,
            serial_profile_id,
            socat_profile_id,
            power_supply_profile_id,
            memory_region: MemoryRegion {
                start_address: 0,
                length: 0,
            },
            output_directory,
            is_template: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::DeserializeOwned;

    fn round_trips<T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug>(value: &T) {
        let encoded = serde_json::to_string(value).unwrap();
        let decoded: T = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, &decoded);
    }

    #[test]
    fn serial_port_profile_json_round_trips() {
        let profile = SerialPortProfile::new_default("/dev/ttyUSB0");
        let encoded = serde_json::to_string(&profile).unwrap();
        let decoded: SerialPortProfile = serde_json::from_str(&encoded).unwrap();
        assert_eq!(profile.base.id, decoded.base.id);
        assert_eq!(profile.base.name, decoded.base.name);
        assert_eq!(profile.device_path, decoded.device_path);
        assert_eq!(profile.baud_rate, decoded.baud_rate);
    }

    #[test]
    fn socat_profile_json_round_trips() {
        let profile = SocatProfile::new_default(9000);
        let encoded = serde_json::to_string(&profile).unwrap();
        let decoded: SocatProfile = serde_json::from_str(&encoded).unwrap();
        assert_eq!(profile.listen_port, decoded.listen_port);
        assert_eq!(profile.block_size, decoded.block_size);
    }

    #[test]
    fn power_supply_profile_json_round_trips() {
        let profile = PowerSupplyProfile::new_default("10.0.0.5");
        let encoded = serde_json::to_string(&profile).unwrap();
        let decoded: PowerSupplyProfile = serde_json::from_str(&encoded).unwrap();
        let PowerSupplyConfiguration::ModbusTcp(original) = &profile.configuration;
        let PowerSupplyConfiguration::ModbusTcp(round_tripped) = &decoded.configuration;
        assert_eq!(original.host, round_tripped.host);
        assert_eq!(original.on_off_coil, round_tripped.on_off_coil);
        assert_eq!(original.addressing_mode, round_tripped.addressing_mode);
    }

    #[test]
    fn job_profile_json_round_trips() {
        let profile = JobProfile::new_default(1, 1, 1, PathBuf::from("/tmp/out"));
        round_trips(&profile.memory_region);
        let encoded = serde_json::to_string(&profile).unwrap();
        let decoded: JobProfile = serde_json::from_str(&encoded).unwrap();
        assert_eq!(profile.serial_profile_id, decoded.serial_profile_id);
        assert_eq!(profile.output_directory, decoded.output_directory);
    }

    #[test]
    fn metadata_is_omitted_from_the_wire_when_absent() {
        let profile = SerialPortProfile::new_default("/dev/ttyUSB0");
        let encoded = serde_json::to_string(&profile).unwrap();
        assert!(!encoded.contains("\"metadata\""));
    }
}
