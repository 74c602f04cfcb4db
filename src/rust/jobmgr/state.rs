// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::Event,
    ipc::PortDirectory,
    jobmgr::{
        group::GroupRecord,
        history::FinishedHistory,
        GroupId,
    },
};
use ::std::{
    collections::{
        HashMap,
        VecDeque,
    },
    fmt,
    sync::Arc,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduling state of a VM group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunningState {
    /// Created, waiting for a VM and a start request.
    Startup,
    /// Started, not yet picked up by a worker.
    InitialRunnable,
    Runnable,
    Running,
    /// A worker returned from the VM and is deciding what comes next.
    Suspending,
    /// Parked in the central wait loop.
    WaitForMultiple,
    /// Held exclusively by a thread that inspects the VM.
    Locked,
    /// Paused by the debugger.
    DebugStopped,
    Terminated,
}

/// Everything protected by the scheduler lock.
pub(crate) struct JobData {
    /// Every group that has not been released yet, including groups that were never started and zombies.
    pub groups: HashMap<GroupId, GroupRecord>,
    /// Started groups that have not terminated, in start order.
    pub jobs: Vec<GroupId>,
    runnable_high: VecDeque<GroupId>,
    runnable_low: VecDeque<GroupId>,
    pub running_low_priority: usize,
    /// Zero disables the cap.
    pub max_running_low_priority: usize,
    /// Whether a worker currently runs the central wait.
    pub pipewaiter_active: bool,
    pub history: FinishedHistory,
    pub ports: PortDirectory,
    pub abort: bool,
    /// Wakes the pipewaiter out of its OS-level wait.
    wait_event: Arc<Event>,
    /// Workers to wake once the lock is released.
    pending_wakeups: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RunningState {
    pub fn is_runnable(self) -> bool {
        matches!(self, RunningState::InitialRunnable | RunningState::Runnable)
    }

    /// Whether a thread other than the running worker may take the group into `Locked`.
    pub fn is_lockable(self) -> bool {
        !matches!(
            self,
            RunningState::Running | RunningState::Suspending | RunningState::Locked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunningState::Startup => "startup",
            RunningState::InitialRunnable => "initialrunnable",
            RunningState::Runnable => "runnable",
            RunningState::Running => "running",
            RunningState::Suspending => "suspending",
            RunningState::WaitForMultiple => "waitformultiple",
            RunningState::Locked => "locked",
            RunningState::DebugStopped => "debugstopped",
            RunningState::Terminated => "terminated",
        }
    }

    /// Name shown to operators. Transient states are folded into the state they stand for.
    pub fn label(self) -> &'static str {
        match self {
            RunningState::Startup => "startup",
            RunningState::InitialRunnable | RunningState::Runnable => "runnable",
            RunningState::Running | RunningState::Suspending => "running",
            RunningState::WaitForMultiple => "waiting",
            RunningState::Locked => "locked",
            RunningState::DebugStopped => "paused",
            RunningState::Terminated => "terminated",
        }
    }
}

impl JobData {
    pub fn new(
        max_running_low_priority: usize,
        history: FinishedHistory,
        wait_event: Arc<Event>,
    ) -> Self {
        Self {
            groups: HashMap::new(),
            jobs: Vec::new(),
            runnable_high: VecDeque::new(),
            runnable_low: VecDeque::new(),
            running_low_priority: 0,
            max_running_low_priority,
            pipewaiter_active: false,
            history,
            ports: PortDirectory::default(),
            abort: false,
            wait_event,
            pending_wakeups: 0,
        }
    }

    /// Moves a group to `new`, keeping the runnable queues, the running counters and the live list consistent. This
    /// is the only place where the state of a group changes.
    pub fn set_state(&mut self, id: &GroupId, new: RunningState) {
        let now: Instant = Instant::now();
        let record: &mut GroupRecord = match self.groups.get_mut(id) {
            Some(record) => record,
            None => {
                warn!("set_state(): unknown group {}", id);
                return;
            },
        };
        let old: RunningState = record.state;
        if old == new {
            return;
        }
        trace!("set_state(): group {} {} -> {}", id, old, new);
        let high_priority: bool = record.high_priority;

        if old == RunningState::Running {
            if let Some(start) = record.run_start.take() {
                record.total_running += now.saturating_duration_since(start);
            }
        }
        if new == RunningState::Running {
            record.run_start = Some(now);
        }
        record.state = new;

        if old == RunningState::Running && !high_priority {
            self.running_low_priority -= 1;
        }
        if new == RunningState::Running && !high_priority {
            self.running_low_priority += 1;
        }
        if old.is_runnable() {
            let queue: &mut VecDeque<GroupId> = self.queue_mut(high_priority);
            if let Some(pos) = queue.iter().position(|queued| queued == id) {
                queue.remove(pos);
            }
        }
        if new.is_runnable() {
            self.queue_mut(high_priority).push_back(*id);
            self.pending_wakeups += 1;
        }
        if new == RunningState::Terminated {
            self.jobs.retain(|job| job != id);
        }
        match new {
            RunningState::WaitForMultiple => {
                // A pipewaiter blocked on an older handle set must rebuild it.
                self.wait_event.signal();
                self.pending_wakeups += 1;
            },
            _ if new.is_runnable() && self.pipewaiter_active => self.wait_event.signal(),
            _ => (),
        }

        debug_assert!(self.is_queued_consistently(id));
    }

    /// Changes the priority class of a group, moving it between queues and counters as needed.
    pub fn set_priority(&mut self, id: &GroupId, high_priority: bool) {
        let (state, old_priority) = match self.groups.get(id) {
            Some(record) => (record.state, record.high_priority),
            None => return,
        };
        if old_priority == high_priority {
            return;
        }
        if state.is_runnable() {
            let queue: &mut VecDeque<GroupId> = self.queue_mut(old_priority);
            if let Some(pos) = queue.iter().position(|queued| queued == id) {
                queue.remove(pos);
            }
            self.queue_mut(high_priority).push_back(*id);
        }
        if state == RunningState::Running {
            if high_priority {
                self.running_low_priority -= 1;
            } else {
                self.running_low_priority += 1;
            }
        }
        if let Some(record) = self.groups.get_mut(id) {
            record.high_priority = high_priority;
        }
        debug_assert!(self.is_queued_consistently(id));
    }

    /// Next group a worker should run: high priority first, low priority only while under the cap.
    pub fn pick_runnable(&self) -> Option<GroupId> {
        if let Some(id) = self.runnable_high.front() {
            return Some(*id);
        }
        if self.low_priority_allowed() {
            return self.runnable_low.front().copied();
        }
        None
    }

    pub fn has_runnable(&self) -> bool {
        self.pick_runnable().is_some()
    }

    fn low_priority_allowed(&self) -> bool {
        self.max_running_low_priority == 0 || self.running_low_priority < self.max_running_low_priority
    }

    /// Groups waiting to run, in service order within each class.
    pub fn runnable_queues(&self) -> (Vec<GroupId>, Vec<GroupId>) {
        (
            self.runnable_high.iter().copied().collect(),
            self.runnable_low.iter().copied().collect(),
        )
    }

    /// Number of workers that should be woken up. Resets the count.
    pub fn take_wakeups(&mut self) -> usize {
        ::std::mem::take(&mut self.pending_wakeups)
    }

    pub fn wait_event(&self) -> &Arc<Event> {
        &self.wait_event
    }

    fn queue_mut(&mut self, high_priority: bool) -> &mut VecDeque<GroupId> {
        if high_priority {
            &mut self.runnable_high
        } else {
            &mut self.runnable_low
        }
    }

    /// A group is queued exactly once if it is runnable, and not at all otherwise.
    pub fn is_queued_consistently(&self, id: &GroupId) -> bool {
        let high: usize = self.runnable_high.iter().filter(|queued| *queued == id).count();
        let low: usize = self.runnable_low.iter().filter(|queued| *queued == id).count();
        match self.groups.get(id) {
            Some(record) if record.state.is_runnable() => {
                if record.high_priority {
                    high == 1 && low == 0
                } else {
                    high == 0 && low == 1
                }
            },
            _ => high == 0 && low == 0,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        JobData,
        RunningState,
    };
    use crate::{
        events::Event,
        jobmgr::{
            group::GroupRecord,
            history::FinishedHistory,
            GroupId,
            VMGroup,
        },
    };
    use ::anyhow::Result;
    use ::std::{
        sync::Arc,
        time::Duration,
    };

    fn job_data(max_low: usize) -> Result<JobData> {
        let history: FinishedHistory = FinishedHistory::new(Duration::from_secs(60), 16);
        Ok(JobData::new(max_low, history, Arc::new(Event::new()?)))
    }

    fn add_group(data: &mut JobData, high_priority: bool) -> Result<GroupId> {
        let group: VMGroup = VMGroup::new()?;
        let id: GroupId = group.id();
        data.groups.insert(id, GroupRecord::new(group, high_priority));
        Ok(id)
    }

    #[test]
    fn test_runnable_queue_is_fifo() -> Result<()> {
        let mut data: JobData = job_data(0)?;
        let ids: Vec<GroupId> = (0..4).map(|_| add_group(&mut data, false)).collect::<Result<_>>()?;
        for id in &ids {
            data.set_state(id, RunningState::InitialRunnable);
        }
        for expected in &ids {
            let picked: Option<GroupId> = data.pick_runnable();
            crate::ensure_eq!(picked, Some(*expected));
            data.set_state(expected, RunningState::Running);
            data.set_state(expected, RunningState::Suspending);
            data.set_state(expected, RunningState::Terminated);
        }
        crate::ensure_eq!(data.pick_runnable(), None);
        crate::ensure_eq!(data.running_low_priority, 0);
        Ok(())
    }

    #[test]
    fn test_high_priority_first_and_low_priority_cap() -> Result<()> {
        let mut data: JobData = job_data(1)?;
        let low1: GroupId = add_group(&mut data, false)?;
        let low2: GroupId = add_group(&mut data, false)?;
        let high: GroupId = add_group(&mut data, true)?;
        data.set_state(&low1, RunningState::Runnable);
        data.set_state(&low2, RunningState::Runnable);
        data.set_state(&high, RunningState::Runnable);

        crate::ensure_eq!(data.pick_runnable(), Some(high));
        data.set_state(&high, RunningState::Running);
        crate::ensure_eq!(data.pick_runnable(), Some(low1));
        data.set_state(&low1, RunningState::Running);
        // The cap of one running low priority group is reached.
        crate::ensure_eq!(data.pick_runnable(), None);

        data.set_state(&low1, RunningState::Suspending);
        crate::ensure_eq!(data.pick_runnable(), Some(low2));
        Ok(())
    }

    #[test]
    fn test_queue_membership_follows_state() -> Result<()> {
        let mut data: JobData = job_data(0)?;
        let id: GroupId = add_group(&mut data, false)?;
        let path: [RunningState; 9] = [
            RunningState::InitialRunnable,
            RunningState::Locked,
            RunningState::Runnable,
            RunningState::DebugStopped,
            RunningState::Runnable,
            RunningState::Running,
            RunningState::Suspending,
            RunningState::WaitForMultiple,
            RunningState::Runnable,
        ];
        for state in path {
            data.set_state(&id, state);
            crate::ensure_eq!(data.is_queued_consistently(&id), true);
        }
        data.set_priority(&id, true);
        crate::ensure_eq!(data.is_queued_consistently(&id), true);
        crate::ensure_eq!(data.runnable_queues().0, vec![id]);
        crate::ensure_eq!(data.take_wakeups() > 0, true);
        crate::ensure_eq!(data.take_wakeups(), 0);
        Ok(())
    }
}
