//! Bootloader orchestrator: the staged pipeline with progress, retry,
//! and guaranteed teardown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::adapters::power::PowerSupplyAdapter;
use crate::adapters::serial;
use crate::adapters::socat::SocatBridge;
use crate::error::{Error, Result};
use crate::orchestrator::retry::{OperationClass, RetryConfiguration};
use crate::plc::client::PlcClient;
use crate::plc::transport::PlcTransport;
use crate::profiles::model::{JobProfile, PowerSupplyProfile, SerialPortProfile, SocatProfile};
use crate::profiles::modbus_tcp_configuration;

/// Stage names reported through progress, in pipeline order.
pub const STAGE_PREPARE_SERIAL: &str = "prepare-serial";
pub const STAGE_START_BRIDGE: &str = "start-bridge";
pub const STAGE_POWER_CYCLE: &str = "power-cycle";
pub const STAGE_CONNECT_TCP: &str = "connect-tcp";
pub const STAGE_HANDSHAKE: &str = "handshake";
pub const STAGE_INSTALL_STAGER: &str = "install-stager";
pub const STAGE_DUMP_MEMORY: &str = "dump-memory";
pub const STAGE_TEARDOWN: &str = "teardown";

/// Gates pipeline execution between stages when the scheduler requests
/// pause; the pipeline never checks this mid-stream.
#[derive(Default)]
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait_if_paused(&self) {
        while self.paused.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }
}

pub struct ResolvedProfiles {
    pub job: JobProfile,
    pub serial: SerialPortProfile,
    pub socat: SocatProfile,
    pub power_supply: PowerSupplyProfile,
}

pub struct PipelineContext {
    pub stty_binary: PathBuf,
    pub socat_binary: PathBuf,
    pub power_cycle_delay: Duration,
    pub socat_stop_grace: Duration,
}

pub struct PipelineOutcome {
    pub output_path: PathBuf,
    pub bytes_written: u64,
}

/// A failed pipeline run, carrying the primary error plus any teardown
/// errors suppressed while unwinding — per 4.9/7, teardown failures never
/// mask the primary error but are still reported alongside it.
pub struct PipelineFailure {
    pub error: Error,
    pub suppressed: Vec<String>,
}

impl From<Error> for PipelineFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            suppressed: Vec::new(),
        }
    }
}

/// Resources acquired so far, torn down in reverse order on every exit
/// path.
enum TeardownItem {
    SerialConfigured,
    PowerOn(crate::profiles::model::ModbusTcpConfiguration),
    PlcConnected(PlcClient),
    BridgeStarted(SocatBridge),
}

async fn teardown(stack: Vec<TeardownItem>) -> Vec<String> {
    let mut suppressed = Vec::new();
    let teardown_cancel = CancellationToken::new(); // teardown itself is not cancellable
    for item in stack.into_iter().rev() {
        match item {
            TeardownItem::SerialConfigured => {}
            TeardownItem::PlcConnected(client) => {
                drop(client);
            }
            TeardownItem::PowerOn(cfg) => {
                if let Err(e) = PowerSupplyAdapter::set_power(&cfg, false, &teardown_cancel).await {
                    warn!(error = %e, "teardown: failed to power off");
                    suppressed.push(format!("power-off: {e}"));
                }
            }
            TeardownItem::BridgeStarted(mut bridge) => {
                if let Err(e) = bridge.stop(Duration::from_secs(3)).await {
                    warn!(error = %e, "teardown: failed to stop bridge");
                    suppressed.push(format!("stop-bridge: {e}"));
                }
            }
        }
    }
    suppressed
}

async fn retry_stage<T, F, Fut>(
    retry: &RetryConfiguration,
    class: OperationClass,
    cancel: &CancellationToken,
    mut on_attempt: impl FnMut(u32),
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("task cancelled before stage could run"));
        }
        on_attempt(attempt);
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if retry.should_retry(class, &err, attempt) => {
                let delay = retry.delay_for(class, attempt);
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::cancelled("task cancelled during retry backoff")),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs the full `prepare-serial → … → dump-memory` pipeline, then always
/// tears down acquired resources in reverse order before returning.
#[instrument(skip_all, fields(job_profile_id = profiles.job.base.id))]
pub async fn run_pipeline(
    ctx: &PipelineContext,
    profiles: &ResolvedProfiles,
    retry: &RetryConfiguration,
    cancel: CancellationToken,
    pause_gate: Arc<PauseGate>,
    mut progress: impl FnMut(u8, &str) + Send,
) -> std::result::Result<PipelineOutcome, PipelineFailure> {
    let mut stack: Vec<TeardownItem> = Vec::new();
    let result = run_stages(ctx, profiles, retry, &cancel, &pause_gate, &mut progress, &mut stack).await;
    let suppressed = teardown(stack).await;
    progress(100, STAGE_TEARDOWN);

    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if !suppressed.is_empty() {
                warn!(?suppressed, "primary error had suppressed teardown errors");
            }
            Err(PipelineFailure { error: err, suppressed })
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_stages(
    ctx: &PipelineContext,
    profiles: &ResolvedProfiles,
    retry: &RetryConfiguration,
    cancel: &CancellationToken,
    pause_gate: &Arc<PauseGate>,
    progress: &mut (impl FnMut(u8, &str) + Send),
    stack: &mut Vec<TeardownItem>,
) -> Result<PipelineOutcome> {
    let modbus_cfg = modbus_tcp_configuration(&profiles.power_supply).clone();

    // prepare-serial: 0-5
    progress(0, STAGE_PREPARE_SERIAL);
    pause_gate.wait_if_paused().await;
    retry_stage(retry, OperationClass::Connection, cancel, |_| {}, || {
        serial::apply_profile(&ctx.stty_binary, &profiles.serial.device_path, &profiles.serial)
    })
    .await?;
    stack.push(TeardownItem::SerialConfigured);
    progress(5, STAGE_PREPARE_SERIAL);

    // start-bridge: 5-10
    pause_gate.wait_if_paused().await;
    let bridge = retry_stage(retry, OperationClass::Connection, cancel, |_| {}, || {
        SocatBridge::start(&ctx.socat_binary, &profiles.serial.device_path, &profiles.socat)
    })
    .await?;
    stack.push(TeardownItem::BridgeStarted(bridge));
    progress(10, STAGE_START_BRIDGE);

    // power-cycle: 10-20
    pause_gate.wait_if_paused().await;
    retry_stage(retry, OperationClass::PowerControl, cancel, |_| {}, || {
        PowerSupplyAdapter::power_cycle(&modbus_cfg, ctx.power_cycle_delay, cancel)
    })
    .await?;
    stack.push(TeardownItem::PowerOn(modbus_cfg.clone()));
    progress(20, STAGE_POWER_CYCLE);

    // connect-tcp: 20-25
    pause_gate.wait_if_paused().await;
    let transport = retry_stage(retry, OperationClass::Connection, cancel, |_| {}, || {
        PlcTransport::connect(
            "127.0.0.1",
            profiles.socat.listen_port,
            Duration::from_secs(5),
            modbus_cfg.read_timeout,
            modbus_cfg.write_timeout,
        )
    })
    .await?;
    let mut client = PlcClient::new(transport);
    progress(25, STAGE_CONNECT_TCP);

    // handshake: 25-30, one progress emission per attempt so a caller
    // watching TaskProgressUpdated sees every retry, not just the result.
    pause_gate.wait_if_paused().await;
    retry_stage(
        retry,
        OperationClass::Handshake,
        cancel,
        |_| progress(25, STAGE_HANDSHAKE),
        || client.handshake(),
    )
    .await?;
    progress(30, STAGE_HANDSHAKE);

    // install-stager: 30-40
    pause_gate.wait_if_paused().await;
    let stager_payload = default_stager_payload();
    retry_stage(retry, OperationClass::PayloadInstallation, cancel, |_| {}, || {
        client.install_stager(&stager_payload)
    })
    .await?;
    progress(40, STAGE_INSTALL_STAGER);

    // dump-memory: 40-95, proportional to bytes streamed
    pause_gate.wait_if_paused().await;
    let region = profiles.job.memory_region;
    let dumper_payload = default_dumper_payload();
    let total = region.length.max(1) as u64;
    let mut bytes = Vec::new();
    let dump_result = retry_stage(retry, OperationClass::MemoryRead, cancel, |_| {}, || {
        client.dump_memory(region.start_address, region.length, &dumper_payload, &mut bytes, |written| {
            let fraction = (written as f64 / total as f64).clamp(0.0, 1.0);
            let percent = 40 + (fraction * 55.0) as u8;
            progress(percent.min(95), STAGE_DUMP_MEMORY);
        })
    })
    .await;

    stack.push(TeardownItem::PlcConnected(client));

    if let Err(err) = dump_result {
        if !bytes.is_empty() {
            let partial_path = write_output(&profiles.job.output_directory, profiles.job.base.id, &bytes).await?;
            let partial_path = mark_partial(&partial_path).await?;
            warn!(path = %partial_path.display(), bytes = bytes.len(), "dump failed, kept partial output");
        }
        return Err(err);
    }
    progress(95, STAGE_DUMP_MEMORY);

    let output_path = write_output(&profiles.job.output_directory, profiles.job.base.id, &bytes).await?;

    info!(bytes = bytes.len(), path = %output_path.display(), "memory dump written");
    Ok(PipelineOutcome {
        output_path,
        bytes_written: bytes.len() as u64,
    })
}

/// A minimal stager: this implementation's placeholder for whatever
/// bytes the real bootloader expects to receive.
fn default_stager_payload() -> Vec<u8> {
    vec![0u8; 0]
}

fn default_dumper_payload() -> Vec<u8> {
    vec![0u8; 0]
}

async fn write_output(output_directory: &std::path::Path, job_profile_id: i64, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_directory)
        .await
        .map_err(|e| Error::internal(format!("failed to create {}", output_directory.display())).with_source(e))?;
    let file_name = format!("job-{job_profile_id}-{}.bin", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"));
    let path = output_directory.join(file_name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| Error::internal(format!("failed to write {}", path.display())).with_source(e))?;
    Ok(path)
}

/// Renames a partially-written output file to a `.partial` suffix instead
/// of deleting it, so operators can inspect a failed dump (see
/// DESIGN.md for the reasoning).
pub async fn mark_partial(path: &std::path::Path) -> Result<PathBuf> {
    let partial_path = path.with_extension("partial");
    tokio::fs::rename(path, &partial_path)
        .await
        .map_err(|e| Error::internal(format!("failed to mark {} as partial", path.display())).with_source(e))?;
    Ok(partial_path)
}
