// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative scheduler for VM groups.
//!
//! All scheduling state lives in one [JobData] record behind one mutex. A fixed pool of worker threads pulls groups
//! from two runnable queues and runs one slice of each at a time. At most one worker at a time acts as the
//! "pipewaiter": it blocks on the combined handle set of every group parked in `WaitForMultiple` and enforces running
//! timeouts. The debugger lock is always taken after the scheduler lock.

mod group;
mod history;
mod state;
mod status;
mod worker;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::Config,
    debugger::{
        Debugger,
        DebuggerConfig,
    },
    events::Event,
    ipc::{
        IpcEndpoint,
        NamedPort,
    },
    locks::NamedLockManager,
    runtime::fail::Fail,
    vm::{
        AbortReason,
        VirtualMachine,
    },
};
use ::parking_lot::{
    Condvar,
    Mutex,
    MutexGuard,
};
use ::serde_json::Value;
use ::std::{
    collections::BTreeMap,
    ops::Deref,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    group::{
        Callback,
        GroupId,
        VMGroup,
    },
    state::RunningState,
    status::{
        ErrorRecord,
        GroupInfo,
        JobManagerStatus,
        JobStatus,
    },
};
pub(crate) use self::{
    group::GroupRecord,
    state::JobData,
};

use self::history::FinishedHistory;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Start-time parameters of the scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Cap on low priority groups running at once. Zero disables the cap.
    pub max_running_low_priority: usize,
    pub finished_retention: Duration,
    pub max_finished_jobs: usize,
    /// Longest single sleep of the central wait.
    pub max_wait_granularity: Duration,
    pub debugger: DebuggerConfig,
}

/// Scheduler state shared by the workers, the debugger listener and every handle.
pub struct JobManager {
    config: SchedulerConfig,
    data: Mutex<JobData>,
    work_available: Condvar,
    wait_event: Arc<Event>,
    central_waits: AtomicU64,
    locks: NamedLockManager,
    debugger: Debugger,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SharedJobManager(Arc<JobManager>);

/// Exclusive access to a group that is not running. The VM is handed to the holder; dropping the guard gives it back
/// and restores the previous state.
pub struct LockedVMGroup {
    manager: SharedJobManager,
    group: VMGroup,
    vm: Option<Box<dyn VirtualMachine>>,
}

/// Outcome of a debugger pause request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PauseOutcome {
    Paused,
    /// The group pauses the next time it comes back to the scheduler.
    Pending,
    AlreadyPaused,
    Terminated,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            workers: config.workers()?,
            max_running_low_priority: config.max_running_low_priority()?,
            finished_retention: config.finished_retention()?,
            max_finished_jobs: config.max_finished_jobs()?,
            max_wait_granularity: config.max_wait_granularity()?,
            debugger: DebuggerConfig::from_config(config)?,
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_running_low_priority(mut self, max: usize) -> Self {
        self.max_running_low_priority = max;
        self
    }

    pub fn with_finished_history(mut self, retention: Duration, max_entries: usize) -> Self {
        self.finished_retention = retention;
        self.max_finished_jobs = max_entries;
        self
    }

    pub fn with_max_wait_granularity(mut self, granularity: Duration) -> Self {
        self.max_wait_granularity = granularity;
        self
    }

    pub fn with_debugger(mut self, debugger: DebuggerConfig) -> Self {
        self.debugger = debugger;
        self
    }
}

impl JobManager {
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn locks(&self) -> &NamedLockManager {
        &self.locks
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    /// Number of times a group parked in the central wait loop.
    pub fn central_wait_count(&self) -> u64 {
        self.central_waits.load(Ordering::Relaxed)
    }

    pub(crate) fn count_central_wait(&self) {
        self.central_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lock_data(&self) -> MutexGuard<'_, JobData> {
        self.data.lock()
    }

    /// Wakes one worker per group that became runnable or started waiting since the last call.
    pub(crate) fn release_wakeups(&self, data: &mut JobData) {
        let wakeups: usize = data.take_wakeups();
        if wakeups >= self.config.workers {
            self.work_available.notify_all();
        } else {
            for _ in 0..wakeups {
                self.work_available.notify_one();
            }
        }
    }

    pub(crate) fn signal_wait_event(&self) {
        self.wait_event.signal();
    }
}

impl SharedJobManager {
    /// Creates a scheduler and starts its worker threads, and the debugger listener if it is enabled.
    pub fn new(config: SchedulerConfig) -> Result<Self, Fail> {
        if config.workers == 0 {
            let cause: String = "at least one worker is required".to_string();
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let wait_event: Arc<Event> = Arc::new(Event::new()?);
        let history: FinishedHistory = FinishedHistory::new(config.finished_retention, config.max_finished_jobs);
        let data: JobData = JobData::new(config.max_running_low_priority, history, wait_event.clone());
        let manager: Self = Self(Arc::new(JobManager {
            debugger: Debugger::new(config.debugger.clone())?,
            config,
            data: Mutex::new(data),
            work_available: Condvar::new(),
            wait_event,
            central_waits: AtomicU64::new(0),
            locks: NamedLockManager::new(),
            threads: Mutex::new(Vec::new()),
        }));

        for index in 0..manager.config.workers {
            let worker: Self = manager.clone();
            let handle: JoinHandle<()> = thread::Builder::new()
                .name(format!("jobmgr-worker-{}", index))
                .spawn(move || worker.worker_loop(index))?;
            manager.threads.lock().push(handle);
        }
        if manager.config.debugger.enabled {
            let handle: JoinHandle<()> = manager.debugger.start(&manager)?;
            manager.threads.lock().push(handle);
        }
        info!(
            "new(): started job manager with {} workers (low priority cap {})",
            manager.config.workers, manager.config.max_running_low_priority
        );
        Ok(manager)
    }

    /// Stops every thread of the scheduler and releases the groups that are left. Must not be called from inside a
    /// VM slice.
    pub fn shutdown(&self) {
        {
            let mut data: MutexGuard<JobData> = self.data.lock();
            if data.abort {
                return;
            }
            data.abort = true;
        }
        self.work_available.notify_all();
        self.wait_event.signal();
        self.debugger.stop();
        let threads: Vec<JoinHandle<()>> = ::std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                warn!("shutdown(): a scheduler thread panicked");
            }
        }

        let records: Vec<GroupRecord> = {
            let mut data: MutexGuard<JobData> = self.data.lock();
            data.jobs.clear();
            data.groups.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            record.handle.signal_finished();
        }
        info!("shutdown(): job manager stopped");
    }

    /// Creates a group in the `Startup` state.
    pub fn create_vm_group(&self, high_priority: bool) -> Result<VMGroup, Fail> {
        let group: VMGroup = VMGroup::new()?;
        let mut data: MutexGuard<JobData> = self.data.lock();
        data.groups.insert(group.id(), GroupRecord::new(group.clone(), high_priority));
        trace!("create_vm_group(): created group {}", group.id());
        Ok(group)
    }

    /// Attaches the VM that runs the main script of a group that has not been started yet.
    pub fn attach_vm(&self, group: &VMGroup, script: &str, vm: Box<dyn VirtualMachine>) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        let record: &mut GroupRecord = Self::get_record(&mut data, group, "attach_vm")?;
        if record.state != RunningState::Startup {
            let cause: String = format!("group {} was already started", group.id());
            error!("attach_vm(): {}", cause);
            return Err(Fail::new(libc::EALREADY, &cause));
        }
        record.script = script.to_string();
        // Replacing a VM drops the old one, which must not happen under the lock.
        let old: Option<Box<dyn VirtualMachine>> = record.vm.replace(vm);
        drop(data);
        drop(old);
        Ok(())
    }

    pub fn start_vm_group(&self, group: &VMGroup) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        let id: GroupId = group.id();
        let record: &mut GroupRecord = Self::get_record(&mut data, group, "start_vm_group")?;
        if record.state != RunningState::Startup {
            let cause: String = format!("group {} was already started", id);
            error!("start_vm_group(): {}", cause);
            return Err(Fail::new(libc::EALREADY, &cause));
        }
        if record.vm.is_none() {
            let cause: String = format!("group {} has no virtual machine", id);
            error!("start_vm_group(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let pause_requested: bool = ::std::mem::take(&mut record.inform_next_suspend);
        debug!("start_vm_group(): starting group {} ({})", id, record.script);

        data.jobs.push(id);
        data.set_state(&id, RunningState::InitialRunnable);
        let debugger_pause: bool = self.debugger.on_job_start(&mut data, &id);
        if pause_requested || debugger_pause {
            if let Some(record) = data.groups.get_mut(&id) {
                record.old_state_debug = RunningState::InitialRunnable;
            }
            data.set_state(&id, RunningState::DebugStopped);
            self.debugger.on_paused(&data, &id);
        }
        self.release_wakeups(&mut data);
        Ok(())
    }

    /// Releases a group that was never started.
    pub fn discard_vm_group(&self, group: &VMGroup) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        let record: &mut GroupRecord = Self::get_record(&mut data, group, "discard_vm_group")?;
        if record.state != RunningState::Startup {
            let cause: String = format!("group {} was already started", group.id());
            error!("discard_vm_group(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let record: Option<GroupRecord> = data.groups.remove(&group.id());
        drop(data);
        if let Some(record) = record {
            let GroupRecord {
                handle,
                vm,
                pre_termination_callbacks,
                termination_callbacks,
                unlock_callbacks,
                ..
            } = record;
            drop(vm);
            for callback in pre_termination_callbacks
                .into_iter()
                .chain(termination_callbacks)
                .chain(unlock_callbacks)
            {
                callback();
            }
            handle.signal_finished();
        }
        Ok(())
    }

    /// Sets the abort flag of a group and wakes every worker. The VM stops at its next checkpoint; callers that need
    /// to know when it did should wait for the group to finish. A paused group that no debugger client is attached to
    /// is resumed so that it can reach that checkpoint.
    pub fn abort_vm_group(&self, group: &VMGroup, reason: AbortReason) {
        let id: GroupId = group.id();
        debug!("abort_vm_group(): aborting group {} ({})", id, reason.as_str());
        group.abort_flag().set(reason);
        if reason.is_terminating() {
            let mut data: MutexGuard<JobData> = self.data.lock();
            let paused: bool = data.groups.get(&id).is_some_and(|record| {
                record.state == RunningState::DebugStopped
                    || (record.state == RunningState::Locked && record.old_state == RunningState::DebugStopped)
            });
            if paused && !self.debugger.is_connected(&id) {
                debug!("abort_vm_group(): resuming paused group {}", id);
                self.resume_from_debug(&mut data, &id);
            }
        }
        self.work_available.notify_all();
        self.wait_event.signal();
    }

    /// Aborts a cancellable group silently. Returns `false` if the group is not cancellable.
    pub fn try_cancel(&self, group: &VMGroup) -> Result<bool, Fail> {
        {
            let mut data: MutexGuard<JobData> = self.data.lock();
            let record: &mut GroupRecord = Self::get_record(&mut data, group, "try_cancel")?;
            if !record.cancellable {
                return Ok(false);
            }
            record.cancelled = true;
        }
        self.abort_vm_group(group, AbortReason::SilentTerminate);
        Ok(true)
    }

    /// Takes a group into the `Locked` state unless a worker currently owns it. If it does, `callback` (if any) runs
    /// as soon as the group can be locked again, and `None` is returned.
    pub fn try_lock_vm_group(
        &self,
        group: &VMGroup,
        callback: Option<Callback>,
    ) -> Result<Option<LockedVMGroup>, Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        let id: GroupId = group.id();
        let record: &mut GroupRecord = Self::get_record(&mut data, group, "try_lock_vm_group")?;
        if !record.state.is_lockable() {
            if let Some(callback) = callback {
                record.unlock_callbacks.push(callback);
            }
            return Ok(None);
        }
        record.old_state = record.state;
        let vm: Option<Box<dyn VirtualMachine>> = record.vm.take();
        data.set_state(&id, RunningState::Locked);
        Ok(Some(LockedVMGroup {
            manager: self.clone(),
            group: group.clone(),
            vm,
        }))
    }

    pub fn set_group_priority(&self, group: &VMGroup, high_priority: bool) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "set_group_priority")?;
        data.set_priority(&group.id(), high_priority);
        self.release_wakeups(&mut data);
        Ok(())
    }

    /// Limits the time a group may spend running. `None` removes the limit.
    pub fn set_running_timeout(&self, group: &VMGroup, timeout: Option<Duration>) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "set_running_timeout")?.running_timeout = timeout;
        // The pipewaiter must take the new deadline into account.
        if data.pipewaiter_active {
            self.wait_event.signal();
        }
        Ok(())
    }

    pub fn set_cancellable(&self, group: &VMGroup, cancellable: bool) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "set_cancellable")?.cancellable = cancellable;
        Ok(())
    }

    pub fn set_session_data(&self, group: &VMGroup, session_data: &str) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "set_session_data")?.session_data = session_data.to_string();
        Ok(())
    }

    pub fn set_environment(&self, group: &VMGroup, environment: Option<BTreeMap<String, String>>) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "set_environment")?.environment = environment;
        Ok(())
    }

    /// Replaces the authentication record of a group and lets the debugger rules look at it.
    pub fn set_authentication_record(&self, group: &VMGroup, record: Value) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "set_authentication_record")?.auth_record = record;
        self.debugger.on_auth_record_changed(self, &mut data, &group.id());
        self.release_wakeups(&mut data);
        Ok(())
    }

    /// Registers a callback that runs outside the scheduler lock when the group terminates.
    pub fn add_termination_callback(&self, group: &VMGroup, callback: Callback) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "add_termination_callback")?
            .termination_callbacks
            .push(callback);
        Ok(())
    }

    /// Registers a callback that runs before the termination callbacks.
    pub fn add_pre_termination_callback(&self, group: &VMGroup, callback: Callback) -> Result<(), Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        Self::get_record(&mut data, group, "add_pre_termination_callback")?
            .pre_termination_callbacks
            .push(callback);
        Ok(())
    }

    pub fn find_group(&self, id: &GroupId) -> Option<VMGroup> {
        self.data.lock().groups.get(id).map(|record| record.handle.clone())
    }

    pub fn get_group_info(&self, group: &VMGroup) -> Result<GroupInfo, Fail> {
        let mut data: MutexGuard<JobData> = self.data.lock();
        let record: &mut GroupRecord = Self::get_record(&mut data, group, "get_group_info")?;
        Ok(GroupInfo::from_record(record, Instant::now()))
    }

    /// Status of a live or finished job, without VM internals.
    pub fn get_job_status(&self, id: &GroupId) -> Option<JobStatus> {
        let data: MutexGuard<JobData> = self.data.lock();
        match data.groups.get(id) {
            Some(record) => Some(JobStatus::from_record(
                record,
                Instant::now(),
                self.debugger.pause_reason(id),
                None,
            )),
            None => data.history.find(&id.to_string()).cloned(),
        }
    }

    pub fn get_status(&self) -> JobManagerStatus {
        let mut data: MutexGuard<JobData> = self.data.lock();
        let now: Instant = Instant::now();
        data.history.prune(now);
        let mut states: BTreeMap<String, usize> = BTreeMap::new();
        let mut jobs: Vec<JobStatus> = Vec::with_capacity(data.jobs.len());
        for id in &data.jobs {
            if let Some(record) = data.groups.get(id) {
                *states.entry(record.state.as_str().to_string()).or_default() += 1;
                jobs.push(JobStatus::from_record(record, now, self.debugger.pause_reason(id), None));
            }
        }
        let (runnable_high, runnable_low) = data.runnable_queues();
        JobManagerStatus {
            workers: self.config.workers,
            max_running_low_priority: data.max_running_low_priority,
            running_low_priority: data.running_low_priority,
            runnable_high: runnable_high.len(),
            runnable_low: runnable_low.len(),
            central_waits: self.central_wait_count(),
            states,
            jobs,
            finished: data.history.statuses(),
        }
    }

    pub fn create_named_port(&self, name: &str) -> Result<Arc<NamedPort>, Fail> {
        self.data.lock().ports.create(name)
    }

    pub fn connect_to_named_port(&self, name: &str) -> Result<IpcEndpoint, Fail> {
        self.data.lock().ports.connect(name)
    }

    /// Pauses a group for the debugger. Used with the scheduler lock held.
    pub(crate) fn request_debug_pause(&self, data: &mut JobData, id: &GroupId) -> Option<PauseOutcome> {
        let record: &mut GroupRecord = data.groups.get_mut(id)?;
        let state: RunningState = record.state;
        let outcome: PauseOutcome = match state {
            RunningState::Running | RunningState::Suspending => {
                record.inform_next_suspend = true;
                record.handle.abort_flag().set_yield();
                PauseOutcome::Pending
            },
            // Paused by `start_vm_group`. No worker owns the group, so there is nobody to yield.
            RunningState::Startup => {
                record.inform_next_suspend = true;
                PauseOutcome::Pending
            },
            RunningState::WaitForMultiple => {
                record.inform_next_suspend = true;
                record.handle.abort_flag().set_yield();
                self.wait_event.signal();
                PauseOutcome::Pending
            },
            RunningState::InitialRunnable | RunningState::Runnable => {
                record.old_state_debug = state;
                data.set_state(id, RunningState::DebugStopped);
                PauseOutcome::Paused
            },
            RunningState::Locked => match record.old_state {
                RunningState::DebugStopped => PauseOutcome::AlreadyPaused,
                RunningState::Terminated => PauseOutcome::Terminated,
                RunningState::Startup => {
                    record.inform_next_suspend = true;
                    PauseOutcome::Pending
                },
                old_state => {
                    record.old_state_debug = old_state;
                    record.old_state = RunningState::DebugStopped;
                    PauseOutcome::Paused
                },
            },
            RunningState::DebugStopped => PauseOutcome::AlreadyPaused,
            RunningState::Terminated => PauseOutcome::Terminated,
        };
        Some(outcome)
    }

    /// Undoes a pause, or withdraws a pause that has not taken effect yet. Returns whether anything changed.
    pub(crate) fn resume_from_debug(&self, data: &mut JobData, id: &GroupId) -> bool {
        let record: &mut GroupRecord = match data.groups.get_mut(id) {
            Some(record) => record,
            None => return false,
        };
        let was_pending: bool = ::std::mem::take(&mut record.inform_next_suspend);
        let state: RunningState = record.state;
        match state {
            RunningState::DebugStopped => {
                let target: RunningState = record.old_state_debug;
                data.set_state(id, target);
                self.release_wakeups(data);
                true
            },
            RunningState::Locked if record.old_state == RunningState::DebugStopped => {
                record.old_state = record.old_state_debug;
                true
            },
            _ if was_pending => {
                record.handle.abort_flag().clear_yield();
                true
            },
            _ => false,
        }
    }

    /// Removes a terminated group that was kept around for the debugger. The returned handle and VM must be released
    /// after the scheduler lock is dropped.
    pub(crate) fn remove_zombie(
        &self,
        data: &mut JobData,
        id: &GroupId,
    ) -> Option<(VMGroup, Option<Box<dyn VirtualMachine>>)> {
        let record: &GroupRecord = data.groups.get(id)?;
        let terminated: bool = match record.state {
            RunningState::Terminated => true,
            RunningState::Locked => record.old_state == RunningState::Terminated,
            _ => false,
        };
        if !terminated {
            return None;
        }
        data.groups.remove(id).map(|record| (record.handle, record.vm))
    }

    fn get_record<'a>(data: &'a mut JobData, group: &VMGroup, caller: &str) -> Result<&'a mut GroupRecord, Fail> {
        match data.groups.get_mut(&group.id()) {
            Some(record) => Ok(record),
            None => {
                let cause: String = format!("unknown group {}", group.id());
                error!("{}(): {}", caller, cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }
}

impl LockedVMGroup {
    pub fn group(&self) -> &VMGroup {
        &self.group
    }

    /// The VM of the group. Absent if none was attached yet.
    pub fn vm(&self) -> Option<&dyn VirtualMachine> {
        self.vm.as_deref()
    }

    pub fn vm_mut(&mut self) -> Option<&mut (dyn VirtualMachine + 'static)> {
        self.vm.as_deref_mut()
    }

    /// Same as dropping the guard.
    pub fn unlock(self) {}
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_running_low_priority: 2,
            finished_retention: Duration::from_secs(600),
            max_finished_jobs: 256,
            max_wait_granularity: Duration::from_secs(1),
            debugger: DebuggerConfig::default(),
        }
    }
}

impl Deref for SharedJobManager {
    type Target = JobManager;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for LockedVMGroup {
    fn drop(&mut self) {
        let id: GroupId = self.group.id();
        let mut data: MutexGuard<JobData> = self.manager.data.lock();
        let mut callbacks: Vec<Callback> = Vec::new();
        let mut orphan: Option<Box<dyn VirtualMachine>> = None;
        match data.groups.get_mut(&id) {
            Some(record) if record.state == RunningState::Locked => {
                record.vm = self.vm.take();
                callbacks = ::std::mem::take(&mut record.unlock_callbacks);
                let old_state: RunningState = record.old_state;
                data.set_state(&id, old_state);
            },
            // The group was released while locked.
            _ => orphan = self.vm.take(),
        }
        self.manager.release_wakeups(&mut data);
        drop(data);
        drop(orphan);
        for callback in callbacks {
            callback();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        GroupId,
        PauseOutcome,
        RunningState,
        SchedulerConfig,
        SharedJobManager,
        VMGroup,
    };
    use crate::vm::{
        AbortReason,
        RunContext,
        RunResult,
        VirtualMachine,
        VmError,
    };
    use ::anyhow::Result;
    use ::std::{
        sync::{
            atomic::{
                AtomicBool,
                Ordering,
            },
            Arc,
        },
        time::Duration,
    };

    struct NopVm;

    impl VirtualMachine for NopVm {
        fn run(&mut self, _ctx: &mut RunContext) -> Result<RunResult, VmError> {
            Ok(RunResult::Completed)
        }
    }

    fn manager() -> Result<SharedJobManager> {
        match SharedJobManager::new(SchedulerConfig::default().with_workers(1)) {
            Ok(manager) => Ok(manager),
            Err(e) => anyhow::bail!("failed to create job manager ({:?})", e),
        }
    }

    #[test]
    fn test_start_requires_vm_and_startup_state() -> Result<()> {
        let manager: SharedJobManager = manager()?;
        let group: VMGroup = manager.create_vm_group(false)?;
        crate::ensure_eq!(manager.start_vm_group(&group).map_err(|e| e.errno), Err(libc::EINVAL));

        manager.attach_vm(&group, "nop.whscr", Box::new(NopVm))?;
        manager.start_vm_group(&group)?;
        crate::ensure_eq!(manager.start_vm_group(&group).map_err(|e| e.errno), Err(libc::EALREADY));
        crate::ensure_eq!(group.wait_finished(Some(Duration::from_secs(10)))?, true);
        manager.shutdown();
        Ok(())
    }

    #[test]
    fn test_lock_startup_group_and_discard() -> Result<()> {
        let manager: SharedJobManager = manager()?;
        let group: VMGroup = manager.create_vm_group(true)?;
        manager.attach_vm(&group, "nop.whscr", Box::new(NopVm))?;

        let mut locked = match manager.try_lock_vm_group(&group, None)? {
            Some(locked) => locked,
            None => anyhow::bail!("a startup group should be lockable"),
        };
        crate::ensure_eq!(locked.vm_mut().is_some(), true);
        crate::ensure_eq!(manager.get_group_info(&group)?.state, RunningState::Locked);
        // Locked groups cannot be locked again.
        let called: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let flag: Arc<AtomicBool> = called.clone();
        let second = manager.try_lock_vm_group(&group, Some(Box::new(move || flag.store(true, Ordering::SeqCst))))?;
        crate::ensure_eq!(second.is_none(), true);
        locked.unlock();
        crate::ensure_eq!(called.load(Ordering::SeqCst), true);
        crate::ensure_eq!(manager.get_group_info(&group)?.state, RunningState::Startup);

        manager.discard_vm_group(&group)?;
        crate::ensure_eq!(group.is_finished(), true);
        crate::ensure_eq!(manager.find_group(&group.id()).is_none(), true);
        manager.shutdown();
        Ok(())
    }

    #[test]
    fn test_cancel_requires_cancellable() -> Result<()> {
        let manager: SharedJobManager = manager()?;
        let group: VMGroup = manager.create_vm_group(false)?;
        crate::ensure_eq!(manager.try_cancel(&group)?, false);
        manager.set_cancellable(&group, true)?;
        crate::ensure_eq!(manager.try_cancel(&group)?, true);
        crate::ensure_eq!(manager.get_group_info(&group)?.cancelled, true);
        crate::ensure_eq!(group.abort_flag().get(), crate::vm::AbortReason::SilentTerminate);
        manager.shutdown();
        Ok(())
    }

    #[test]
    fn test_pause_before_start_leaves_abort_flag_alone() -> Result<()> {
        let manager: SharedJobManager = manager()?;
        let group: VMGroup = manager.create_vm_group(false)?;
        let id: GroupId = group.id();
        manager.attach_vm(&group, "nop.whscr", Box::new(NopVm))?;
        let outcome: Option<PauseOutcome> = {
            let mut data = manager.lock_data();
            manager.request_debug_pause(&mut data, &id)
        };
        crate::ensure_eq!(outcome, Some(PauseOutcome::Pending));
        crate::ensure_eq!(group.abort_flag().get(), AbortReason::None);

        manager.start_vm_group(&group)?;
        crate::ensure_eq!(manager.get_group_info(&group)?.state, RunningState::DebugStopped);
        crate::ensure_eq!(group.abort_flag().get(), AbortReason::None);
        manager.shutdown();
        Ok(())
    }

    #[test]
    fn test_pause_while_locked_before_start() -> Result<()> {
        let manager: SharedJobManager = manager()?;
        let group: VMGroup = manager.create_vm_group(false)?;
        let id: GroupId = group.id();
        manager.attach_vm(&group, "nop.whscr", Box::new(NopVm))?;

        let locked = match manager.try_lock_vm_group(&group, None)? {
            Some(locked) => locked,
            None => anyhow::bail!("a startup group should be lockable"),
        };
        let outcome: Option<PauseOutcome> = {
            let mut data = manager.lock_data();
            manager.request_debug_pause(&mut data, &id)
        };
        crate::ensure_eq!(outcome, Some(PauseOutcome::Pending));
        locked.unlock();
        crate::ensure_eq!(manager.get_group_info(&group)?.state, RunningState::Startup);

        // The pause takes effect when the group is started.
        manager.start_vm_group(&group)?;
        crate::ensure_eq!(manager.get_group_info(&group)?.state, RunningState::DebugStopped);
        manager.shutdown();
        Ok(())
    }

    #[test]
    fn test_abort_resumes_unattended_paused_group() -> Result<()> {
        let manager: SharedJobManager = manager()?;
        let group: VMGroup = manager.create_vm_group(false)?;
        let id: GroupId = group.id();
        manager.attach_vm(&group, "nop.whscr", Box::new(NopVm))?;
        {
            let mut data = manager.lock_data();
            manager.request_debug_pause(&mut data, &id);
        }
        manager.start_vm_group(&group)?;
        crate::ensure_eq!(manager.get_group_info(&group)?.state, RunningState::DebugStopped);

        manager.abort_vm_group(&group, AbortReason::Manually);
        crate::ensure_eq!(group.wait_finished(Some(Duration::from_secs(10)))?, true);
        let finished: bool = manager.find_group(&id).is_none() && manager.get_job_status(&id).is_some();
        crate::ensure_eq!(finished, true);
        manager.shutdown();
        Ok(())
    }
}
