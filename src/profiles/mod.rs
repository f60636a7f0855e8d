//! Profile model, validator, and per-type stores (C2/C3).

pub mod model;
pub mod store;
pub mod validator;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use model::{
    JobProfile, ModbusTcpConfiguration, PowerSupplyConfiguration, PowerSupplyProfile,
    ProfileBase, ProfileKind, SerialPortProfile, SocatProfile,
};
use store::{ProfileRecord, ProfileStore};

impl ProfileRecord for SerialPortProfile {
    fn kind() -> ProfileKind {
        ProfileKind::Serial
    }
    fn base(&self) -> &ProfileBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut ProfileBase {
        &mut self.base
    }
}

impl ProfileRecord for SocatProfile {
    fn kind() -> ProfileKind {
        ProfileKind::Socat
    }
    fn base(&self) -> &ProfileBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut ProfileBase {
        &mut self.base
    }
}

impl ProfileRecord for PowerSupplyProfile {
    fn kind() -> ProfileKind {
        ProfileKind::PowerSupply
    }
    fn base(&self) -> &ProfileBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut ProfileBase {
        &mut self.base
    }
}

impl ProfileRecord for JobProfile {
    fn kind() -> ProfileKind {
        ProfileKind::Job
    }
    fn base(&self) -> &ProfileBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut ProfileBase {
        &mut self.base
    }
}

/// The four per-type stores, loaded together at engine construction.
pub struct ProfileStores {
    pub serial: ProfileStore<SerialPortProfile>,
    pub socat: ProfileStore<SocatProfile>,
    pub power_supply: ProfileStore<PowerSupplyProfile>,
    pub job: ProfileStore<JobProfile>,
}

impl ProfileStores {
    pub async fn load(base_path: &Path) -> Result<Self> {
        let serial = ProfileStore::load(
            base_path,
            Arc::new(|| SerialPortProfile::new_default("/dev/ttyUSB0")),
        )
        .await?;
        let socat =
            ProfileStore::load(base_path, Arc::new(|| SocatProfile::new_default(8000))).await?;
        let power_supply = ProfileStore::load(
            base_path,
            Arc::new(|| PowerSupplyProfile::new_default("127.0.0.1")),
        )
        .await?;

        // The job default references whichever profiles ended up holding
        // id 1 for each dependency store — the defaults above are always
        // created first in an empty store, so id 1 is stable here.
        let serial_default_id = serial.get_default().await.map(|p| p.base.id).unwrap_or(1);
        let socat_default_id = socat.get_default().await.map(|p| p.base.id).unwrap_or(1);
        let power_default_id = power_supply
            .get_default()
            .await
            .map(|p| p.base.id)
            .unwrap_or(1);
        let job = ProfileStore::load(
            base_path,
            Arc::new(move || {
                JobProfile::new_default(
                    serial_default_id,
                    socat_default_id,
                    power_default_id,
                    std::path::PathBuf::from("./s7tools-dumps"),
                )
            }),
        )
        .await?;

        Ok(Self {
            serial,
            socat,
            power_supply,
            job,
        })
    }
}

/// Resolves a [`ModbusTcpConfiguration`] out of a power-supply profile's
/// polymorphic `configuration` field; the only variant this crate defines
/// is Modbus-TCP, so this is infallible today but keeps the match
/// exhaustive as extension points are added.
pub fn modbus_tcp_configuration(profile: &PowerSupplyProfile) -> &ModbusTcpConfiguration {
    match &profile.configuration {
        PowerSupplyConfiguration::ModbusTcp(cfg) => cfg,
    }
}
