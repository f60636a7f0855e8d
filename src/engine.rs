//! The engine facade: the single composition root a host program
//! constructs and holds onto. Bundles profile storage, the resource
//! coordinator, and the task scheduler behind one API surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::adapters::serial::DiscoveredSerialPort;
use crate::config::EngineConfig;
use crate::error::{Result, ValidationReport};
use crate::orchestrator;
use crate::orchestrator::pipeline::PipelineContext;
use crate::plc::client::BootloaderInfo;
use crate::profiles::model::{JobProfile, PowerSupplyProfile, SerialPortProfile, SocatProfile};
use crate::profiles::store::ProfileChangeEvent;
use crate::profiles::ProfileStores;
use crate::resources::ResourceCoordinator;
use crate::tasks::{Priority, Scheduler, SchedulerEvent, SchedulerStatistics, TaskExecution, TaskId, TaskState};

/// The engine: profile stores, resource coordinator, and task scheduler
/// composed together per [`EngineConfig`].
pub struct Engine {
    config: EngineConfig,
    profiles: Arc<ProfileStores>,
    scheduler: Arc<Scheduler>,
}

impl Engine {
    /// Loads profile stores from `config.profiles_base_path` (bootstrapping
    /// hard-coded defaults on an empty directory) and builds the scheduler.
    /// Does not start the dispatcher; call [`Engine::start`] for that.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let profiles = Arc::new(ProfileStores::load(&config.profiles_base_path).await?);
        let coordinator = Arc::new(ResourceCoordinator::new());
        let pipeline_ctx = PipelineContext {
            stty_binary: config.stty_binary.clone(),
            socat_binary: config.socat_binary.clone(),
            power_cycle_delay: Duration::from_secs(2),
            socat_stop_grace: Duration::from_secs(3),
        };
        let scheduler = Scheduler::new(
            Arc::clone(&profiles),
            coordinator,
            config.retry_preset.configuration(),
            pipeline_ctx,
            config.max_concurrent_tasks,
            config.event_queue_capacity,
        );

        Ok(Self {
            config,
            profiles,
            scheduler,
        })
    }

    /// Starts the dispatcher loop. Idempotent.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Requests graceful shutdown and waits (bounded) for in-flight tasks
    /// to finish tearing down.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    pub fn set_max_concurrent_tasks(&self, max: usize) {
        self.scheduler.set_max_concurrent_tasks(max);
    }

    // ---- Task lifecycle ----

    pub fn create_task(&self, job_profile_id: i64, job_name: impl Into<String>, priority: Priority) -> TaskId {
        self.scheduler.create_task(job_profile_id, job_name, priority)
    }

    pub fn enqueue_task(&self, task_id: TaskId) -> Result<()> {
        self.scheduler.enqueue_task(task_id)
    }

    pub fn schedule_task(&self, task_id: TaskId, when: DateTime<Utc>) -> Result<()> {
        self.scheduler.schedule_task(task_id, when)
    }

    pub async fn cancel_task(&self, task_id: TaskId, reason: Option<String>) -> Result<bool> {
        self.scheduler.cancel_task(task_id, reason).await
    }

    pub fn pause_task(&self, task_id: TaskId) -> Result<()> {
        self.scheduler.pause_task(task_id)
    }

    pub fn resume_task(&self, task_id: TaskId) -> Result<()> {
        self.scheduler.resume_task(task_id)
    }

    pub fn restart_task(&self, task_id: TaskId) -> Result<TaskId> {
        self.scheduler.restart_task(task_id)
    }

    pub fn get_all_tasks(&self) -> Vec<TaskExecution> {
        self.scheduler.get_all()
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<TaskExecution> {
        self.scheduler.get_by_id(task_id)
    }

    pub fn get_tasks_by_state(&self, state: TaskState) -> Vec<TaskExecution> {
        self.scheduler.get_by_state(state)
    }

    pub fn get_tasks_by_priority(&self, priority: Priority) -> Vec<TaskExecution> {
        self.scheduler.get_by_priority(priority)
    }

    pub fn get_queued_tasks(&self) -> Vec<TaskExecution> {
        self.scheduler.get_queued()
    }

    pub fn get_running_tasks(&self) -> Vec<TaskExecution> {
        self.scheduler.get_running()
    }

    pub fn get_tasks_by_job_profile(&self, job_profile_id: i64) -> Vec<TaskExecution> {
        self.scheduler.get_by_job_profile(job_profile_id)
    }

    pub fn cleanup_old_tasks(&self) -> usize {
        self.scheduler.cleanup_old_tasks(self.config.task_reap_age)
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        self.scheduler.statistics()
    }

    // ---- Profile CRUD passthroughs ----

    pub fn serial_profiles(&self) -> &crate::profiles::store::ProfileStore<SerialPortProfile> {
        &self.profiles.serial
    }

    pub fn socat_profiles(&self) -> &crate::profiles::store::ProfileStore<SocatProfile> {
        &self.profiles.socat
    }

    pub fn power_supply_profiles(&self) -> &crate::profiles::store::ProfileStore<PowerSupplyProfile> {
        &self.profiles.power_supply
    }

    pub fn job_profiles(&self) -> &crate::profiles::store::ProfileStore<JobProfile> {
        &self.profiles.job
    }

    pub fn subscribe_profile_changes(&self) -> ProfileChangeSubscriptions {
        ProfileChangeSubscriptions {
            serial: self.profiles.serial.subscribe(),
            socat: self.profiles.socat.subscribe(),
            power_supply: self.profiles.power_supply.subscribe(),
            job: self.profiles.job.subscribe(),
        }
    }

    // ---- Orchestrator facade ----

    pub fn enumerate_serial_ports(&self) -> Result<Vec<DiscoveredSerialPort>> {
        crate::adapters::serial::enumerate()
    }

    /// Resolves `job_profile_id`'s referenced profiles and runs
    /// `ValidateResources` against them (side-effect-free; see
    /// [`orchestrator::validate_resources`]).
    pub async fn validate_resources(&self, job_profile_id: i64) -> Result<ValidationReport> {
        let job = self.profiles.job.get_by_id(job_profile_id).await?;
        let serial = self.profiles.serial.get_by_id(job.serial_profile_id).await?;
        let socat = self.profiles.socat.get_by_id(job.socat_profile_id).await?;
        let power_supply = self.profiles.power_supply.get_by_id(job.power_supply_profile_id).await?;
        Ok(orchestrator::validate_resources(&job, &serial, &socat, &power_supply).await)
    }

    pub async fn test_connection(&self, job_profile_id: i64) -> Result<()> {
        let job = self.profiles.job.get_by_id(job_profile_id).await?;
        let socat = self.profiles.socat.get_by_id(job.socat_profile_id).await?;
        let power_supply = self.profiles.power_supply.get_by_id(job.power_supply_profile_id).await?;
        orchestrator::test_connection(&socat, &power_supply).await
    }

    pub async fn get_bootloader_info(&self, job_profile_id: i64) -> Result<BootloaderInfo> {
        let job = self.profiles.job.get_by_id(job_profile_id).await?;
        let socat = self.profiles.socat.get_by_id(job.socat_profile_id).await?;
        let power_supply = self.profiles.power_supply.get_by_id(job.power_supply_profile_id).await?;
        orchestrator::get_bootloader_info(&socat, &power_supply).await
    }

    pub async fn estimate_operation_time(&self, job_profile_id: i64) -> Result<Duration> {
        let job = self.profiles.job.get_by_id(job_profile_id).await?;
        Ok(orchestrator::estimate_operation_time(job.memory_region.length, None))
    }
}

pub struct ProfileChangeSubscriptions {
    pub serial: broadcast::Receiver<ProfileChangeEvent>,
    pub socat: broadcast::Receiver<ProfileChangeEvent>,
    pub power_supply: broadcast::Receiver<ProfileChangeEvent>,
    pub job: broadcast::Receiver<ProfileChangeEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(dir.path());
        let engine = Engine::new(config).await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn bootstraps_default_profiles() {
        let (_dir, engine) = test_engine().await;
        assert_eq!(engine.serial_profiles().get_all().await.len(), 1);
        assert_eq!(engine.job_profiles().get_all().await.len(), 1);
    }

    #[tokio::test]
    async fn create_and_enqueue_a_task_for_the_default_job() {
        let (_dir, engine) = test_engine().await;
        let job = engine.job_profiles().get_all().await.into_iter().next().unwrap();
        let task_id = engine.create_task(job.base.id, "smoke", Priority::Normal);
        engine.enqueue_task(task_id).unwrap();
        assert_eq!(engine.get_task(task_id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn estimate_operation_time_accounts_for_region_length() {
        let (_dir, engine) = test_engine().await;
        let job = engine.job_profiles().get_all().await.into_iter().next().unwrap();
        let estimate = engine.estimate_operation_time(job.base.id).await.unwrap();
        assert!(estimate >= Duration::from_secs(8));
    }
}
