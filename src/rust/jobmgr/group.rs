// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::{
        Capabilities,
        Event,
        OutputObject,
        SignalledStatus,
        Waiter,
    },
    jobmgr::{
        status::ErrorRecord,
        RunningState,
    },
    runtime::fail::Fail,
    vm::{
        AbortFlag,
        AbortReason,
        BreakpointRequests,
        VirtualMachine,
    },
    waitfor::PendingWait,
};
use ::serde_json::Value;
use ::std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Random 128-bit token identifying a VM group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId([u8; 16]);

/// Work deferred until the scheduler lock is released.
pub type Callback = Box<dyn FnOnce() + Send>;

/// State of a group that is visible without taking the scheduler lock.
struct GroupShared {
    id: GroupId,
    created: SystemTime,
    abort: AbortFlag,
    /// Signalled once the group is gone for good.
    finish: Event,
    finished: AtomicBool,
}

/// Handle to a VM group. Clones refer to the same group.
#[derive(Clone)]
pub struct VMGroup(Arc<GroupShared>);

/// Scheduler-side record of a group. Only accessed under the scheduler lock.
pub(crate) struct GroupRecord {
    pub handle: VMGroup,
    pub script: String,
    pub high_priority: bool,
    pub state: RunningState,
    /// State to restore when a `Locked` excursion ends.
    pub old_state: RunningState,
    /// State to restore when a `DebugStopped` excursion ends.
    pub old_state_debug: RunningState,
    /// Absent while a worker runs the group or while a lock holder inspects it.
    pub vm: Option<Box<dyn VirtualMachine>>,
    /// Budget of time spent `Running`.
    pub running_timeout: Option<Duration>,
    pub total_running: Duration,
    pub run_start: Option<Instant>,
    pub session_data: String,
    pub auth_record: Value,
    pub environment: Option<BTreeMap<String, String>>,
    pub cancellable: bool,
    pub cancelled: bool,
    pub unlock_callbacks: Vec<Callback>,
    pub pre_termination_callbacks: Vec<Callback>,
    pub termination_callbacks: Vec<Callback>,
    pub pending_wait: Option<PendingWait>,
    pub wait_result: Option<Vec<i32>>,
    pub errors: Vec<ErrorRecord>,
    /// Abort that ended the group. `None` for a script that returned on its own.
    pub terminated_by: Option<AbortReason>,
    pub pending_breakpoints: Option<BreakpointRequests>,
    pub pending_profiling: Option<bool>,
    /// Switch to `DebugStopped` the next time the group comes back to the scheduler.
    pub inform_next_suspend: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl GroupId {
    pub fn random() -> Self {
        Self(::rand::random::<[u8; 16]>())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl VMGroup {
    pub(crate) fn new() -> Result<Self, Fail> {
        Ok(Self(Arc::new(GroupShared {
            id: GroupId::random(),
            created: SystemTime::now(),
            abort: AbortFlag::new(),
            finish: Event::new()?,
            finished: AtomicBool::new(false),
        })))
    }

    pub fn id(&self) -> GroupId {
        self.0.id
    }

    pub fn created(&self) -> SystemTime {
        self.0.created
    }

    pub fn abort_flag(&self) -> &AbortFlag {
        &self.0.abort
    }

    pub fn finish_event(&self) -> &Event {
        &self.0.finish
    }

    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire)
    }

    /// Blocks until the group has finished or `timeout` elapses. Returns whether the group finished.
    pub fn wait_finished(&self, timeout: Option<Duration>) -> Result<bool, Fail> {
        let deadline: Option<Instant> = timeout.map(|t| Instant::now() + t);
        let mut waiter: Waiter = Waiter::new();
        waiter.add_event(&self.0.finish);
        while !self.is_finished() {
            if !waiter.wait_until(deadline)? {
                return Ok(self.is_finished());
            }
        }
        Ok(true)
    }

    /// Marks the group finished. Returns `false` if it already was.
    pub(crate) fn signal_finished(&self) -> bool {
        if self.0.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.0.finish.signal();
        true
    }

    pub fn ptr_eq(&self, other: &VMGroup) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl GroupRecord {
    pub fn new(handle: VMGroup, high_priority: bool) -> Self {
        Self {
            handle,
            script: String::new(),
            high_priority,
            state: RunningState::Startup,
            old_state: RunningState::Startup,
            old_state_debug: RunningState::Startup,
            vm: None,
            running_timeout: None,
            total_running: Duration::ZERO,
            run_start: None,
            session_data: String::new(),
            auth_record: Value::Null,
            environment: None,
            cancellable: false,
            cancelled: false,
            unlock_callbacks: Vec::new(),
            pre_termination_callbacks: Vec::new(),
            termination_callbacks: Vec::new(),
            pending_wait: None,
            wait_result: None,
            errors: Vec::new(),
            terminated_by: None,
            pending_breakpoints: None,
            pending_profiling: None,
            inform_next_suspend: false,
        }
    }

    /// Time spent running, including the current slice.
    pub fn running_time(&self, now: Instant) -> Duration {
        match self.run_start {
            Some(start) => self.total_running + now.saturating_duration_since(start),
            None => self.total_running,
        }
    }

    /// State the group returns to once every transient excursion ends.
    pub fn real_state(&self) -> RunningState {
        let mut state: RunningState = self.state;
        if state == RunningState::Locked {
            state = self.old_state;
        }
        if state == RunningState::DebugStopped {
            state = self.old_state_debug;
        }
        state
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self)
    }
}

impl FromStr for GroupId {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Fail::new(libc::EINVAL, "group id must be 32 hex digits"));
        }
        let mut id: [u8; 16] = [0; 16];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| Fail::new(libc::EINVAL, "group id must be 32 hex digits"))?;
        }
        Ok(Self(id))
    }
}

impl fmt::Debug for VMGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VMGroup({})", self.0.id)
    }
}

/// A group handle is readable once the group has finished.
impl OutputObject for VMGroup {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READABLE
    }

    fn is_read_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::from(self.is_finished())
    }

    fn add_to_waiter_read(&self, waiter: &mut Waiter) -> bool {
        waiter.add_event(&self.0.finish);
        self.is_finished()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        GroupId,
        VMGroup,
    };
    use ::anyhow::Result;
    use ::std::{
        str::FromStr,
        time::Duration,
    };

    #[test]
    fn test_group_id_text_form() -> Result<()> {
        let id: GroupId = GroupId::random();
        let text: String = id.to_string();
        crate::ensure_eq!(text.len(), 32);
        crate::ensure_eq!(GroupId::from_str(&text).ok(), Some(id));
        crate::ensure_eq!(GroupId::from_str("xyz").is_err(), true);
        crate::ensure_eq!(GroupId::from_str(&"g".repeat(32)).is_err(), true);
        Ok(())
    }

    #[test]
    fn test_finish_is_signalled_once() -> Result<()> {
        let group: VMGroup = VMGroup::new()?;
        crate::ensure_eq!(group.wait_finished(Some(Duration::from_millis(5)))?, false);
        crate::ensure_eq!(group.signal_finished(), true);
        crate::ensure_eq!(group.signal_finished(), false);
        crate::ensure_eq!(group.wait_finished(Some(Duration::from_millis(0)))?, true);
        Ok(())
    }
}
