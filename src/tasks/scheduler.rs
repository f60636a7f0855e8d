//! Task scheduler (C6): task FSM, priority dispatch, concurrency cap,
//! cancellation/pause/resume, events, and statistics.
//!
//! The task table and queues use `std::sync::Mutex` rather than an async
//! lock — the same discipline as the resource coordinator: a single
//! mutex, held only for O(1)/O(log n) bookkeeping, never across I/O.
//! That also lets the orchestrator's
//! synchronous `FnMut(u8, &str)` progress callback update task state and
//! publish an event without needing to be `async`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::orchestrator::pipeline::{run_pipeline, PauseGate, PipelineContext, PipelineFailure, ResolvedProfiles};
use crate::orchestrator::retry::RetryConfiguration;
use crate::profiles::ProfileStores;
use crate::resources::{required_keys, ResourceCoordinator, ResourceKey};
use crate::tasks::events::SchedulerEvent;
use crate::tasks::execution::{Priority, TaskError, TaskExecution, TaskId, TaskState};

/// Bookkeeping kept alongside a `TaskExecution` for the duration it is
/// known to the scheduler; never serialized, never handed to the UI.
struct TaskHandle {
    cancel: CancellationToken,
    pause_gate: Arc<PauseGate>,
}

#[derive(Default)]
struct PriorityQueues {
    /// Index 0=Low, 1=Normal, 2=High, 3=Critical; FIFO within a band via
    /// push-back / scan-from-front.
    bands: [Vec<TaskId>; 4],
}

impl PriorityQueues {
    fn push(&mut self, priority: Priority, task_id: TaskId) {
        self.bands[priority as usize].push(task_id);
    }

    fn remove(&mut self, task_id: TaskId) -> bool {
        for band in &mut self.bands {
            if let Some(pos) = band.iter().position(|id| *id == task_id) {
                band.remove(pos);
                return true;
            }
        }
        false
    }

    fn is_empty(&self) -> bool {
        self.bands.iter().all(|b| b.is_empty())
    }
}

struct ScheduledEntry {
    task_id: TaskId,
    when: DateTime<Utc>,
}

/// Running aggregate counters backing `statistics()`.
#[derive(Default)]
struct Counters {
    total: AtomicUsize,
    successful: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    /// EMA of execution time in milliseconds, stored as fixed-point
    /// (milliseconds * 1000) so it can live in an atomic without a lock.
    ema_execution_ms_x1000: AtomicI64,
}

const EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct SchedulerStatistics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub by_state: HashMap<TaskState, usize>,
    pub ema_execution_time: Option<Duration>,
    pub uptime: Duration,
    pub resource_usage_percent: f64,
    pub running: usize,
    pub max_concurrent: usize,
}

/// The task FSM, priority queue, and dispatcher.
pub struct Scheduler {
    profiles: Arc<ProfileStores>,
    coordinator: Arc<ResourceCoordinator>,
    retry: RetryConfiguration,
    pipeline_ctx: PipelineContext,

    tasks: Mutex<HashMap<TaskId, TaskExecution>>,
    handles: Mutex<HashMap<TaskId, TaskHandle>>,
    ready: Mutex<PriorityQueues>,
    scheduled: Mutex<Vec<ScheduledEntry>>,

    events: broadcast::Sender<SchedulerEvent>,
    wake: Notify,
    shutdown: CancellationToken,
    running: AtomicBool,
    running_count: AtomicUsize,
    max_concurrent: AtomicUsize,
    started_at: Mutex<Option<DateTime<Utc>>>,
    counters: Counters,
}

impl Scheduler {
    pub fn new(
        profiles: Arc<ProfileStores>,
        coordinator: Arc<ResourceCoordinator>,
        retry: RetryConfiguration,
        pipeline_ctx: PipelineContext,
        max_concurrent_tasks: usize,
        event_queue_capacity: usize,
    ) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(event_queue_capacity);
        Arc::new(Self {
            profiles,
            coordinator,
            retry,
            pipeline_ctx,
            tasks: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            ready: Mutex::new(PriorityQueues::default()),
            scheduled: Mutex::new(Vec::new()),
            events,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            running_count: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(max_concurrent_tasks),
            started_at: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    fn publish_state(&self, task: &TaskExecution) {
        let _ = self.events.send(SchedulerEvent::TaskStateChanged {
            task: Box::new(task.clone()),
            dropped_before: None,
        });
    }

    fn publish_progress(&self, task_id: TaskId, percent: u8, operation: &str) {
        let _ = self.events.send(SchedulerEvent::TaskProgressUpdated {
            task_id,
            percent,
            operation: operation.to_string(),
        });
    }

    /// Starts the dispatcher loop. Idempotent: calling twice while already
    /// running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.started_at.lock().expect("started_at poisoned") = Some(Utc::now());
        info!("scheduler dispatcher starting");
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_loop().await });
    }

    /// Requests graceful shutdown: cancels every in-flight task and stops
    /// accepting new dispatch passes, then waits (bounded) for in-flight
    /// tasks to finish tearing down.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.wake.notify_waiters();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while self.running_count.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.running_count.load(Ordering::SeqCst) > 0 {
            warn!("scheduler shutdown deadline elapsed with tasks still running");
        }
    }

    pub fn set_max_concurrent_tasks(&self, max: usize) {
        self.max_concurrent.store(max.max(1), Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() && !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.promote_scheduled();
            self.dispatch_pass().await;

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = self.shutdown.cancelled() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    }

    /// Moves every `Scheduled` task whose time has arrived into the ready
    /// queue as `Queued`, the first time the dispatcher observes their
    /// scheduled time ≤ now.
    fn promote_scheduled(&self) {
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut scheduled = self.scheduled.lock().expect("scheduled queue poisoned");
            scheduled.retain(|entry| {
                if entry.when <= now {
                    due.push(entry.task_id);
                    false
                } else {
                    true
                }
            });
        }
        if due.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        let mut ready = self.ready.lock().expect("ready queue poisoned");
        for task_id in due {
            if let Some(task) = tasks.get_mut(&task_id) {
                if task.state == TaskState::Scheduled {
                    task.state = TaskState::Queued;
                    ready.push(task.priority, task_id);
                    self.publish_state(task);
                }
            }
        }
    }

    /// Dispatches ready tasks until the concurrency cap is hit or no
    /// remaining ready task can acquire its resources this pass.
    async fn dispatch_pass(self: &Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if self.running_count.load(Ordering::SeqCst) >= self.max_concurrent.load(Ordering::SeqCst) {
                return;
            }
            match self.try_dispatch_one().await {
                Some(()) => continue,
                None => return,
            }
        }
    }

    /// Scans the ready queue in priority-then-FIFO order. A task whose
    /// referenced profiles no longer resolve fails immediately; a task
    /// whose resources are busy is skipped (left Queued) for this pass
    /// only, per 4.6 "leave the task Queued and move on".
    async fn try_dispatch_one(self: &Arc<Self>) -> Option<()> {
        let candidates: Vec<TaskId> = {
            let ready = self.ready.lock().expect("ready queue poisoned");
            ready.bands.iter().rev().flatten().copied().collect()
        };

        for task_id in candidates {
            let job_profile_id = {
                let tasks = self.tasks.lock().expect("task table poisoned");
                match tasks.get(&task_id) {
                    Some(t) if t.state == TaskState::Queued => t.job_profile_id,
                    _ => continue,
                }
            };

            let resolved = match self.resolve_profiles(job_profile_id).await {
                Ok(r) => r,
                Err(e) => {
                    self.ready.lock().expect("ready queue poisoned").remove(task_id);
                    self.finish_task(task_id, Err(e.into())).await;
                    continue;
                }
            };
            let keys = required_keys(&resolved.serial, &resolved.socat, &resolved.power_supply);

            if !self.coordinator.try_acquire(task_id, &keys) {
                continue;
            }

            self.ready.lock().expect("ready queue poisoned").remove(task_id);
            self.spawn_task(task_id, resolved, keys);
            return Some(());
        }
        None
    }

    async fn resolve_profiles(&self, job_profile_id: i64) -> Result<ResolvedProfiles> {
        let job = self.profiles.job.get_by_id(job_profile_id).await?;
        let serial = self.profiles.serial.get_by_id(job.serial_profile_id).await?;
        let socat = self.profiles.socat.get_by_id(job.socat_profile_id).await?;
        let power_supply = self
            .profiles
            .power_supply
            .get_by_id(job.power_supply_profile_id)
            .await?;
        Ok(ResolvedProfiles {
            job,
            serial,
            socat,
            power_supply,
        })
    }

    #[instrument(skip(self, resolved, keys), fields(task_id = %task_id))]
    fn spawn_task(self: &Arc<Self>, task_id: TaskId, resolved: ResolvedProfiles, keys: Vec<ResourceKey>) {
        self.running_count.fetch_add(1, Ordering::SeqCst);

        let cancel = self.shutdown.child_token();
        let pause_gate = Arc::new(PauseGate::default());
        self.handles.lock().expect("handles poisoned").insert(
            task_id,
            TaskHandle {
                cancel: cancel.clone(),
                pause_gate: Arc::clone(&pause_gate),
            },
        );

        {
            let mut tasks = self.tasks.lock().expect("task table poisoned");
            if let Some(task) = tasks.get_mut(&task_id) {
                task.state = TaskState::Running;
                task.started_at = Some(Utc::now());
                task.locked_resources = keys.clone();
                self.publish_state(task);
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = run_pipeline(
                &this.pipeline_ctx,
                &resolved,
                &this.retry,
                cancel,
                pause_gate,
                |percent, operation| {
                    this.update_progress(task_id, percent, operation);
                },
            )
            .await;

            this.coordinator.release(&keys);
            this.handles.lock().expect("handles poisoned").remove(&task_id);
            this.running_count.fetch_sub(1, Ordering::SeqCst);

            let result = outcome.map(|o| o.output_path);
            this.finish_task(task_id, result).await;
            this.wake.notify_waiters();
        });
    }

    fn update_progress(&self, task_id: TaskId, percent: u8, operation: &str) {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        if let Some(task) = tasks.get_mut(&task_id) {
            task.progress.percent = percent;
            task.progress.operation = operation.to_string();
        }
        self.publish_progress(task_id, percent, operation);
    }

    /// Transitions a task out of `Running` (or a pre-dispatch failure) into
    /// its terminal state and updates statistics. Any teardown errors
    /// suppressed while unwinding the pipeline ride along on `last_error`
    /// rather than being dropped on the floor.
    async fn finish_task(&self, task_id: TaskId, result: std::result::Result<std::path::PathBuf, PipelineFailure>) {
        let (final_state, error, output_path) = match result {
            Ok(path) => (TaskState::Completed, None, Some(path)),
            Err(failure) if failure.error.kind() == crate::error::ErrorKind::Cancelled => {
                (TaskState::Cancelled, None, None)
            }
            Err(failure) => {
                let mut task_error = TaskError::from_error(&failure.error);
                task_error.suppressed = failure.suppressed;
                (TaskState::Failed, Some(task_error), None)
            }
        };

        let finished_task = {
            let mut tasks = self.tasks.lock().expect("task table poisoned");
            match tasks.get_mut(&task_id) {
                Some(task) => {
                    task.state = final_state;
                    task.finished_at = Some(Utc::now());
                    task.last_error = error;
                    task.output_path = output_path;
                    task.locked_resources.clear();
                    Some(task.clone())
                }
                None => None,
            }
        };

        let Some(task) = finished_task else { return };
        self.publish_state(&task);
        self.record_terminal(&task);
    }

    fn record_terminal(&self, task: &TaskExecution) {
        self.counters.total.fetch_add(1, Ordering::SeqCst);
        match task.state {
            TaskState::Completed => {
                self.counters.successful.fetch_add(1, Ordering::SeqCst);
            }
            TaskState::Failed => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            TaskState::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        if let Some(duration) = task.execution_time() {
            let ms = duration.num_milliseconds().max(0) as f64;
            let prev = self.counters.ema_execution_ms_x1000.load(Ordering::SeqCst) as f64 / 1000.0;
            let updated = if prev <= 0.0 {
                ms
            } else {
                EMA_ALPHA * ms + (1.0 - EMA_ALPHA) * prev
            };
            self.counters
                .ema_execution_ms_x1000
                .store((updated * 1000.0) as i64, Ordering::SeqCst);
        }
    }

    // ---- Engine-facing operations ----

    pub fn create_task(&self, job_profile_id: i64, job_name: impl Into<String>, priority: Priority) -> TaskId {
        let task = TaskExecution::new(job_profile_id, job_name, priority);
        let task_id = task.task_id;
        self.tasks.lock().expect("task table poisoned").insert(task_id, task.clone());
        self.publish_state(&task);
        task_id
    }

    pub fn enqueue_task(&self, task_id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id} not found")))?;
        if task.state != TaskState::Created {
            return Err(Error::conflict(format!(
                "task {task_id} cannot be enqueued from state {:?}",
                task.state
            )));
        }
        task.state = TaskState::Queued;
        self.ready.lock().expect("ready queue poisoned").push(task.priority, task_id);
        self.publish_state(task);
        drop(tasks);
        self.wake.notify_waiters();
        Ok(())
    }

    /// Schedules a task for a future time. A `when` already in the past is
    /// immediately eligible — it is queued directly rather than parked in
    /// `Scheduled`.
    pub fn schedule_task(&self, task_id: TaskId, when: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id} not found")))?;
        if task.state != TaskState::Created {
            return Err(Error::conflict(format!(
                "task {task_id} cannot be scheduled from state {:?}",
                task.state
            )));
        }
        task.scheduled_at = Some(when);
        if when <= Utc::now() {
            task.state = TaskState::Queued;
            self.ready.lock().expect("ready queue poisoned").push(task.priority, task_id);
        } else {
            task.state = TaskState::Scheduled;
            self.scheduled.lock().expect("scheduled queue poisoned").push(ScheduledEntry { task_id, when });
        }
        self.publish_state(task);
        drop(tasks);
        self.wake.notify_waiters();
        Ok(())
    }

    /// Idempotent: cancelling an already-terminal task is a no-op
    /// returning `false`.
    pub async fn cancel_task(&self, task_id: TaskId, _reason: Option<String>) -> Result<bool> {
        let snapshot = {
            let tasks = self.tasks.lock().expect("task table poisoned");
            tasks
                .get(&task_id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("task {task_id} not found")))?
        };

        if snapshot.is_terminal() {
            return Ok(false);
        }
        if !snapshot.can_cancel() {
            return Ok(false);
        }

        match snapshot.state {
            TaskState::Created | TaskState::Queued | TaskState::Scheduled => {
                self.ready.lock().expect("ready queue poisoned").remove(task_id);
                self.scheduled
                    .lock()
                    .expect("scheduled queue poisoned")
                    .retain(|e| e.task_id != task_id);
                let finished = {
                    let mut tasks = self.tasks.lock().expect("task table poisoned");
                    let task = tasks.get_mut(&task_id).expect("checked above");
                    task.state = TaskState::Cancelled;
                    task.finished_at = Some(Utc::now());
                    task.clone()
                };
                self.publish_state(&finished);
                self.record_terminal(&finished);
                Ok(true)
            }
            TaskState::Running | TaskState::Paused => {
                if let Some(handle) = self.handles.lock().expect("handles poisoned").get(&task_id) {
                    handle.cancel.cancel();
                    if snapshot.state == TaskState::Paused {
                        handle.pause_gate.resume();
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Pause/Resume are only honored while a task is `Running`, between
    /// pipeline stages.
    pub fn pause_task(&self, task_id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id} not found")))?;
        if task.state != TaskState::Running {
            return Err(Error::conflict(format!("task {task_id} is not running")));
        }
        let handles = self.handles.lock().expect("handles poisoned");
        let handle = handles
            .get(&task_id)
            .ok_or_else(|| Error::internal(format!("task {task_id} has no running handle")))?;
        handle.pause_gate.pause();
        task.state = TaskState::Paused;
        self.publish_state(task);
        Ok(())
    }

    pub fn resume_task(&self, task_id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id} not found")))?;
        if task.state != TaskState::Paused {
            return Err(Error::conflict(format!("task {task_id} is not paused")));
        }
        let handles = self.handles.lock().expect("handles poisoned");
        let handle = handles
            .get(&task_id)
            .ok_or_else(|| Error::internal(format!("task {task_id} has no running handle")))?;
        handle.pause_gate.resume();
        task.state = TaskState::Running;
        self.publish_state(task);
        Ok(())
    }

    /// Creates a fresh `TaskExecution` in `Created` for the same job,
    /// mirroring the source job/priority.
    pub fn restart_task(&self, task_id: TaskId) -> Result<TaskId> {
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        let source = tasks
            .get(&task_id)
            .ok_or_else(|| Error::not_found(format!("task {task_id} not found")))?;
        if !source.can_restart() {
            return Err(Error::conflict(format!(
                "task {task_id} cannot be restarted from state {:?}",
                source.state
            )));
        }
        let fresh = TaskExecution::new(source.job_profile_id, source.job_name.clone(), source.priority);
        let new_id = fresh.task_id;
        tasks.insert(new_id, fresh.clone());
        drop(tasks);
        self.publish_state(&fresh);
        Ok(new_id)
    }

    pub fn get_all(&self) -> Vec<TaskExecution> {
        self.tasks.lock().expect("task table poisoned").values().cloned().collect()
    }

    pub fn get_by_id(&self, task_id: TaskId) -> Result<TaskExecution> {
        self.tasks
            .lock()
            .expect("task table poisoned")
            .get(&task_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("task {task_id} not found")))
    }

    pub fn get_by_state(&self, state: TaskState) -> Vec<TaskExecution> {
        self.get_all().into_iter().filter(|t| t.state == state).collect()
    }

    pub fn get_by_priority(&self, priority: Priority) -> Vec<TaskExecution> {
        self.get_all().into_iter().filter(|t| t.priority == priority).collect()
    }

    pub fn get_queued(&self) -> Vec<TaskExecution> {
        self.get_by_state(TaskState::Queued)
    }

    pub fn get_running(&self) -> Vec<TaskExecution> {
        self.get_by_state(TaskState::Running)
    }

    pub fn get_by_job_profile(&self, job_profile_id: i64) -> Vec<TaskExecution> {
        self.get_all()
            .into_iter()
            .filter(|t| t.job_profile_id == job_profile_id)
            .collect()
    }

    /// Removes terminal tasks whose `finished_at` is older than `max_age`.
    pub fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        let threshold = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut tasks = self.tasks.lock().expect("task table poisoned");
        let before = tasks.len();
        tasks.retain(|_, task| match (task.is_terminal(), task.finished_at) {
            (true, Some(finished_at)) => finished_at > threshold,
            (true, None) => false,
            (false, _) => true,
        });
        before - tasks.len()
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let tasks = self.tasks.lock().expect("task table poisoned");
        let mut by_state: HashMap<TaskState, usize> = HashMap::new();
        for task in tasks.values() {
            *by_state.entry(task.state).or_insert(0) += 1;
        }
        drop(tasks);

        let uptime = self
            .started_at
            .lock()
            .expect("started_at poisoned")
            .map(|start| (Utc::now() - start).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        let ema_raw = self.counters.ema_execution_ms_x1000.load(Ordering::SeqCst);
        let ema_execution_time = (ema_raw > 0).then(|| Duration::from_millis((ema_raw / 1000).max(0) as u64));

        let running = self.running_count.load(Ordering::SeqCst);
        let max_concurrent = self.max_concurrent.load(Ordering::SeqCst).max(1);

        SchedulerStatistics {
            total: self.counters.total.load(Ordering::SeqCst),
            successful: self.counters.successful.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            cancelled: self.counters.cancelled.load(Ordering::SeqCst),
            by_state,
            ema_execution_time,
            uptime,
            resource_usage_percent: running as f64 / max_concurrent as f64 * 100.0,
            running,
            max_concurrent,
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("running_count", &self.running_count.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::model::{JobProfile, MemoryRegion, PowerSupplyProfile, SerialPortProfile, SocatProfile};

    async fn test_profiles() -> (Arc<ProfileStores>, i64) {
        let dir = tempfile::tempdir().unwrap();
        let stores = ProfileStores::load(dir.path()).await.unwrap();

        let serial = stores.serial.create(SerialPortProfile::new_default("/dev/ttyUSB9")).await.unwrap();
        let socat = stores.socat.create(SocatProfile::new_default(18_765)).await.unwrap();
        let power = stores
            .power_supply
            .create(PowerSupplyProfile::new_default("127.0.0.1"))
            .await
            .unwrap();
        let mut job = JobProfile::new_default(
            serial.base.id,
            socat.base.id,
            power.base.id,
            dir.path().join("out"),
        );
        job.base.name = "test job".into();
        job.memory_region = MemoryRegion {
            start_address: 0,
            length: 16,
        };
        let job = stores.job.create(job).await.unwrap();
        // Keep the tempdir alive for the duration of the test by leaking it;
        // these are short-lived unit tests run in an isolated process.
        std::mem::forget(dir);
        (Arc::new(stores), job.base.id)
    }

    fn test_scheduler(profiles: Arc<ProfileStores>) -> Arc<Scheduler> {
        Scheduler::new(
            profiles,
            Arc::new(ResourceCoordinator::new()),
            crate::orchestrator::retry::RetryPreset::Default.configuration(),
            PipelineContext {
                stty_binary: "stty".into(),
                socat_binary: "socat".into(),
                power_cycle_delay: Duration::from_millis(1),
                socat_stop_grace: Duration::from_millis(50),
            },
            4,
            64,
        )
    }

    #[tokio::test]
    async fn create_then_enqueue_transitions_state() {
        let (profiles, job_id) = test_profiles().await;
        let scheduler = test_scheduler(profiles);
        let task_id = scheduler.create_task(job_id, "job", Priority::Normal);
        assert_eq!(scheduler.get_by_id(task_id).unwrap().state, TaskState::Created);
        scheduler.enqueue_task(task_id).unwrap();
        assert_eq!(scheduler.get_by_id(task_id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn cancel_queued_task_short_circuits_to_cancelled() {
        let (profiles, job_id) = test_profiles().await;
        let scheduler = test_scheduler(profiles);
        let task_id = scheduler.create_task(job_id, "job", Priority::Normal);
        scheduler.enqueue_task(task_id).unwrap();
        assert!(scheduler.cancel_task(task_id, None).await.unwrap());
        assert_eq!(scheduler.get_by_id(task_id).unwrap().state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_task() {
        let (profiles, job_id) = test_profiles().await;
        let scheduler = test_scheduler(profiles);
        let task_id = scheduler.create_task(job_id, "job", Priority::Normal);
        scheduler.enqueue_task(task_id).unwrap();
        assert!(scheduler.cancel_task(task_id, None).await.unwrap());
        assert!(!scheduler.cancel_task(task_id, None).await.unwrap());
    }

    #[tokio::test]
    async fn scheduling_in_the_past_is_immediately_queued() {
        let (profiles, job_id) = test_profiles().await;
        let scheduler = test_scheduler(profiles);
        let task_id = scheduler.create_task(job_id, "job", Priority::Normal);
        scheduler.schedule_task(task_id, Utc::now() - chrono::Duration::seconds(5)).unwrap();
        assert_eq!(scheduler.get_by_id(task_id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_tasks() {
        let (profiles, job_id) = test_profiles().await;
        let scheduler = test_scheduler(profiles);
        let task_id = scheduler.create_task(job_id, "job", Priority::Normal);
        scheduler.enqueue_task(task_id).unwrap();
        scheduler.cancel_task(task_id, None).await.unwrap();

        assert_eq!(scheduler.cleanup_old_tasks(Duration::from_secs(3600)), 0);

        {
            let mut tasks = scheduler.tasks.lock().unwrap();
            let task = tasks.get_mut(&task_id).unwrap();
            task.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        }
        assert_eq!(scheduler.cleanup_old_tasks(Duration::from_secs(3600)), 1);
        assert!(scheduler.get_by_id(task_id).is_err());
    }

    #[tokio::test]
    async fn failed_task_carries_suppressed_teardown_errors() {
        let (profiles, job_id) = test_profiles().await;
        let scheduler = test_scheduler(profiles);
        let task_id = scheduler.create_task(job_id, "job", Priority::Normal);
        scheduler.enqueue_task(task_id).unwrap();

        let failure = PipelineFailure {
            error: Error::transport("bridge connect failed", anyhow::anyhow!("refused")),
            suppressed: vec!["stop-bridge: socat already exited".to_string()],
        };
        scheduler.finish_task(task_id, Err(failure)).await;

        let task = scheduler.get_by_id(task_id).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        let last_error = task.last_error.unwrap();
        assert_eq!(last_error.suppressed, vec!["stop-bridge: socat already exited".to_string()]);
    }

    #[tokio::test]
    async fn priority_queue_pops_critical_before_normal() {
        let (profiles, job_id) = test_profiles().await;
        let scheduler = test_scheduler(profiles);
        let low = scheduler.create_task(job_id, "low", Priority::Normal);
        let high = scheduler.create_task(job_id, "high", Priority::Critical);
        scheduler.enqueue_task(low).unwrap();
        scheduler.enqueue_task(high).unwrap();

        let candidate = {
            let ready = scheduler.ready.lock().unwrap();
            ready.bands.iter().rev().flatten().next().copied()
        };
        assert_eq!(candidate, Some(high));
    }
}
