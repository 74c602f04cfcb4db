// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Out-of-process debugger support.
//!
//! One client at a time talks to the job manager through a named IPC port. It installs rules that attach to jobs at
//! given sites, and then pauses, inspects and resumes the attached jobs. Terminated jobs stay around as zombies while
//! attached, until the client lets go of them or the zombie timeout passes.
//!
//! The scheduler calls the hooks below with its own lock held. The debugger lock is always taken after it.

mod handlers;
mod listener;
mod protocol;
mod rules;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::Config,
    events::Event,
    ipc::IpcEndpoint,
    jobmgr::{
        GroupId,
        GroupRecord,
        JobData,
        JobStatus,
        PauseOutcome,
        RunningState,
        SharedJobManager,
        VMGroup,
    },
    runtime::fail::Fail,
    vm::VirtualMachine,
};
use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::serde_json::{
    json,
    Value,
};
use ::std::{
    collections::HashMap,
    sync::atomic::{
        AtomicBool,
        Ordering,
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
    protocol::{
        Envelope,
        PUSH_JOB_PAUSED,
        PUSH_JOB_REMOVED,
        PUSH_JOB_RULEHIT,
        PUSH_JOB_STARTED,
        PUSH_JOB_TERMINATED,
    },
    rules::{
        site,
        AuthRecordMatch,
        DebugRule,
    },
};

use self::rules::RuleHits;

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Debug)]
pub struct DebuggerConfig {
    pub enabled: bool,
    pub port_name: String,
    /// How long a terminated job is kept for an attached client.
    pub zombie_timeout: Duration,
}

/// What the debugger knows about one attached job.
#[derive(Debug, Default)]
pub(crate) struct DebugJob {
    pub connected: bool,
    pub zombie: bool,
    pub want_pause: bool,
    /// Bitmask of [site] values.
    pub pause_reason: u32,
    pub rule_tags: Vec<String>,
    pub terminated_at: Option<Instant>,
}

#[derive(Default)]
pub(crate) struct DebuggerState {
    pub client: Option<IpcEndpoint>,
    /// `None` until the client sends `configure`.
    pub rules: Option<Vec<DebugRule>>,
    pub jobs: HashMap<GroupId, DebugJob>,
}

pub struct Debugger {
    config: DebuggerConfig,
    state: Mutex<DebuggerState>,
    /// Wakes the listener: new zombies, shutdown.
    wakeup: Event,
    stopping: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl DebuggerConfig {
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Ok(Self {
            enabled: config.debugger_enabled()?,
            port_name: config.debugger_port_name()?,
            zombie_timeout: config.zombie_timeout()?,
        })
    }

    pub fn enabled(mut self, port_name: &str) -> Self {
        self.enabled = true;
        self.port_name = port_name.to_string();
        self
    }

    pub fn with_zombie_timeout(mut self, timeout: Duration) -> Self {
        self.zombie_timeout = timeout;
        self
    }
}

impl DebuggerState {
    /// Sends a notification to the client, if there is one.
    pub fn push(&self, kind: &str, id: Option<&GroupId>, payload: Value) {
        let client: &IpcEndpoint = match &self.client {
            Some(client) => client,
            None => return,
        };
        match Envelope::new(kind, id, payload).to_message() {
            Ok(message) => {
                client.send_message(message, false);
            },
            Err(e) => warn!("push(): cannot encode {} ({:?})", kind, e),
        }
    }

    pub fn pause_reason(&self, id: &GroupId) -> u32 {
        self.jobs.get(id).map_or(0, |job| job.pause_reason)
    }

    pub fn is_connected(&self, id: &GroupId) -> bool {
        self.jobs.get(id).is_some_and(|job| job.connected)
    }

    /// Attaches to a job. Returns `false` if it already was attached.
    pub fn connect(&mut self, id: &GroupId, tags: &[String]) -> bool {
        let job: &mut DebugJob = self.jobs.entry(*id).or_default();
        for tag in tags {
            if !job.rule_tags.contains(tag) {
                job.rule_tags.push(tag.clone());
            }
        }
        if job.connected {
            return false;
        }
        job.connected = true;
        info!("connect(): debugger attached to job {}", id);
        true
    }

    /// Status of a job as sent to the client. The VM is only looked at if nobody runs it.
    pub fn status_payload(&self, record: &GroupRecord, id: &GroupId) -> Value {
        let vm: Option<&dyn VirtualMachine> = if record.state.is_lockable() {
            record.vm.as_deref()
        } else {
            None
        };
        let status: JobStatus = JobStatus::from_record(record, Instant::now(), self.pause_reason(id), vm);
        serde_json::to_value(status).unwrap_or_default()
    }

    fn push_rule_hit(&self, record: &GroupRecord, id: &GroupId, site: u32, tags: &[String]) {
        self.push(
            PUSH_JOB_RULEHIT,
            Some(id),
            json!({ "site": site, "tags": tags, "status": self.status_payload(record, id) }),
        );
    }

    fn push_paused(&self, data: &JobData, id: &GroupId) {
        if let Some(record) = data.groups.get(id) {
            let payload: Value = json!({
                "pausereason": self.pause_reason(id),
                "status": self.status_payload(record, id),
            });
            self.push(PUSH_JOB_PAUSED, Some(id), payload);
        }
    }

    fn evaluate(&self, record: &GroupRecord, site: u32) -> RuleHits {
        match &self.rules {
            Some(rules) => RuleHits::evaluate(rules, site, &record.script, &record.auth_record),
            None => RuleHits::default(),
        }
    }
}

impl Debugger {
    pub(crate) fn new(config: DebuggerConfig) -> Result<Self, Fail> {
        Ok(Self {
            config,
            state: Mutex::new(DebuggerState::default()),
            wakeup: Event::new()?,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    /// Opens the debugger port and starts the listener thread.
    pub(crate) fn start(&self, manager: &SharedJobManager) -> Result<JoinHandle<()>, Fail> {
        let port = manager.create_named_port(&self.config.port_name)?;
        let manager: SharedJobManager = manager.clone();
        let handle: JoinHandle<()> = thread::Builder::new()
            .name("jobmgr-debugger".to_string())
            .spawn(move || listener::run(manager, port))?;
        Ok(handle)
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wakeup.signal();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DebuggerState> {
        self.state.lock()
    }

    pub fn pause_reason(&self, id: &GroupId) -> u32 {
        self.state.lock().pause_reason(id)
    }

    pub fn is_connected(&self, id: &GroupId) -> bool {
        self.state.lock().is_connected(id)
    }

    pub fn has_client(&self) -> bool {
        self.state.lock().client.is_some()
    }

    /// Site `START`. Returns `true` if the job must be paused before it runs.
    pub(crate) fn on_job_start(&self, data: &mut JobData, id: &GroupId) -> bool {
        let mut state: MutexGuard<DebuggerState> = self.state.lock();
        if state.client.is_none() {
            return false;
        }
        let record: &GroupRecord = match data.groups.get(id) {
            Some(record) => record,
            None => return false,
        };
        let hits: RuleHits = state.evaluate(record, site::START);
        if hits.inform {
            let payload: Value = json!({ "status": state.status_payload(record, id) });
            state.push(PUSH_JOB_STARTED, Some(id), payload);
        }
        if hits.connect.is_empty() {
            return false;
        }
        state.connect(id, &hits.connect);
        if let Some(job) = state.jobs.get_mut(id) {
            job.pause_reason |= site::START;
            job.want_pause = true;
        }
        state.push_rule_hit(record, id, site::START, &hits.connect);
        true
    }

    /// A job entered `DebugStopped`.
    pub(crate) fn on_paused(&self, data: &JobData, id: &GroupId) {
        let state: MutexGuard<DebuggerState> = self.state.lock();
        if state.is_connected(id) {
            state.push_paused(data, id);
        }
    }

    /// A job hit a debugger trap. Returns `true` if it must pause.
    pub(crate) fn on_debug_trap(&self, data: &mut JobData, id: &GroupId) -> bool {
        let mut state: MutexGuard<DebuggerState> = self.state.lock();
        if state.client.is_none() {
            return false;
        }
        let record: &GroupRecord = match data.groups.get(id) {
            Some(record) => record,
            None => return false,
        };
        if !state.is_connected(id) {
            let hits: RuleHits = state.evaluate(record, site::DEBUGTRAP);
            if hits.connect.is_empty() {
                return false;
            }
            state.connect(id, &hits.connect);
            state.push_rule_hit(record, id, site::DEBUGTRAP, &hits.connect);
        }
        if let Some(job) = state.jobs.get_mut(id) {
            job.pause_reason |= site::DEBUGTRAP;
            job.want_pause = true;
        }
        true
    }

    /// Sites `TERMINATE` and `TERMINATE_ERRORS`. Returns `true` if the job is kept as a zombie.
    pub(crate) fn on_job_terminate(&self, data: &mut JobData, id: &GroupId, status: &JobStatus) -> bool {
        let mut state: MutexGuard<DebuggerState> = self.state.lock();
        if state.client.is_none() {
            state.jobs.remove(id);
            return false;
        }
        let record: &GroupRecord = match data.groups.get(id) {
            Some(record) => record,
            None => return false,
        };
        let sites: u32 = if status.has_errors() {
            site::TERMINATE | site::TERMINATE_ERRORS
        } else {
            site::TERMINATE
        };
        let hits: RuleHits = state.evaluate(record, sites);
        if !hits.connect.is_empty() {
            state.connect(id, &hits.connect);
            state.push_rule_hit(record, id, sites, &hits.connect);
        }
        let connected: bool = state.is_connected(id);
        if hits.inform || connected {
            state.push(PUSH_JOB_TERMINATED, Some(id), json!({ "status": status }));
        }
        if !connected {
            state.jobs.remove(id);
            return false;
        }
        if let Some(job) = state.jobs.get_mut(id) {
            job.zombie = true;
            job.want_pause = false;
            job.pause_reason = 0;
            job.terminated_at = Some(Instant::now());
        }
        debug!("on_job_terminate(): keeping job {} for the debugger", id);
        self.wakeup.signal();
        true
    }

    /// Site `AUTHRECORD`.
    pub(crate) fn on_auth_record_changed(&self, manager: &SharedJobManager, data: &mut JobData, id: &GroupId) {
        let mut state: MutexGuard<DebuggerState> = self.state.lock();
        if state.client.is_none() {
            return;
        }
        let hits: RuleHits = match data.groups.get(id) {
            Some(record) if record.state != RunningState::Terminated => {
                state.evaluate(record, site::AUTHRECORD)
            },
            _ => return,
        };
        if hits.connect.is_empty() {
            return;
        }
        state.connect(id, &hits.connect);
        if let Some(job) = state.jobs.get_mut(id) {
            job.pause_reason |= site::AUTHRECORD;
            job.want_pause = true;
        }
        if let Some(record) = data.groups.get(id) {
            state.push_rule_hit(record, id, site::AUTHRECORD, &hits.connect);
        }
        if manager.request_debug_pause(data, id) == Some(PauseOutcome::Paused) {
            state.push_paused(data, id);
        }
    }

    /// Earliest time at which a zombie expires.
    pub(crate) fn next_zombie_expiry(&self) -> Option<Instant> {
        let state: MutexGuard<DebuggerState> = self.state.lock();
        state
            .jobs
            .values()
            .filter(|job| job.zombie)
            .filter_map(|job| job.terminated_at)
            .min()
            .map(|terminated_at| terminated_at + self.config.zombie_timeout)
    }

    /// Drops the client and lets go of every job it was attached to.
    pub(crate) fn detach_client(&self, manager: &SharedJobManager) {
        let mut zombies: Vec<(VMGroup, Option<Box<dyn VirtualMachine>>)> = Vec::new();
        let client: Option<IpcEndpoint> = {
            let mut data: MutexGuard<JobData> = manager.lock_data();
            let mut state: MutexGuard<DebuggerState> = self.state.lock();
            state.rules = None;
            for (id, job) in ::std::mem::take(&mut state.jobs) {
                if job.zombie {
                    if let Some(zombie) = manager.remove_zombie(&mut data, &id) {
                        zombies.push(zombie);
                    }
                } else {
                    manager.resume_from_debug(&mut data, &id);
                }
            }
            manager.release_wakeups(&mut data);
            state.client.take()
        };
        if client.is_some() {
            info!("detach_client(): debugger client detached ({} zombies released)", zombies.len());
        }
        drop(client);
        for (group, vm) in zombies {
            drop(vm);
            group.signal_finished();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port_name: "system:debugger".to_string(),
            zombie_timeout: Duration::from_secs(300),
        }
    }
}
