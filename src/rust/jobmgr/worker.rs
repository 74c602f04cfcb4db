// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::{
        SignalledStatus,
        Waiter,
    },
    jobmgr::{
        group::{
            Callback,
            GroupRecord,
        },
        state::JobData,
        status::{
            ErrorRecord,
            JobStatus,
        },
        GroupId,
        RunningState,
        SharedJobManager,
        VMGroup,
    },
    vm::{
        AbortReason,
        BreakpointSet,
        RunContext,
        RunResult,
        SuspendReason,
        VirtualMachine,
        VmError,
    },
    waitfor::{
        PendingWait,
        WaitItem,
    },
};
use ::parking_lot::MutexGuard;
use ::std::{
    any::Any,
    panic::{
        self,
        AssertUnwindSafe,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

type SliceResult = Result<Result<RunResult, VmError>, Box<dyn Any + Send>>;

/// Side effects of a termination that must happen after the scheduler lock is released.
#[derive(Default)]
struct Cleanup {
    callbacks: Vec<Callback>,
    vm: Option<Box<dyn VirtualMachine>>,
    finished: Option<VMGroup>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Cleanup {
    fn run(self) {
        for callback in self.callbacks {
            callback();
        }
        drop(self.vm);
        if let Some(group) = self.finished {
            group.signal_finished();
        }
    }
}

impl SharedJobManager {
    /// Body of every worker thread.
    pub(super) fn worker_loop(&self, index: usize) {
        trace!("worker_loop(): worker {} started", index);
        let mut data: MutexGuard<JobData> = self.data.lock();
        loop {
            if data.abort {
                break;
            }
            if let Some(id) = data.pick_runnable() {
                data.set_state(&id, RunningState::Running);
                data = self.run_group(data, id);
                continue;
            }
            if !data.pipewaiter_active {
                data = self.central_wait(data);
                continue;
            }
            self.work_available.wait(&mut data);
        }
        trace!("worker_loop(): worker {} stopped", index);
    }

    /// Runs one slice of a group that was just moved to `Running`, then commits the state it asked for.
    fn run_group<'a>(&'a self, mut data: MutexGuard<'a, JobData>, id: GroupId) -> MutexGuard<'a, JobData> {
        let (mut vm, mut ctx): (Box<dyn VirtualMachine>, RunContext) = {
            let record: &mut GroupRecord = match data.groups.get_mut(&id) {
                Some(record) => record,
                None => panic!("run_group(): scheduled group {} does not exist", id),
            };
            let mut vm: Box<dyn VirtualMachine> = match record.vm.take() {
                Some(vm) => vm,
                None => panic!("run_group(): scheduled group {} has no virtual machine", id),
            };
            if let Some(requests) = record.pending_breakpoints.take() {
                let breakpoints: BreakpointSet = BreakpointSet::resolve(&requests, &vm.libraries());
                vm.set_breakpoints(breakpoints);
            }
            if let Some(enabled) = record.pending_profiling.take() {
                vm.set_profiling(enabled);
            }
            let run_deadline: Option<Instant> = record
                .running_timeout
                .map(|timeout| Instant::now() + timeout.saturating_sub(record.total_running));
            let ctx: RunContext = RunContext::new(
                self.clone(),
                record.handle.clone(),
                run_deadline,
                record.wait_result.take(),
            );
            (vm, ctx)
        };
        // Whoever else was woken for this group can serve the rest of the queue.
        self.release_wakeups(&mut data);

        let result: SliceResult =
            MutexGuard::unlocked(&mut data, || panic::catch_unwind(AssertUnwindSafe(|| vm.run(&mut ctx))));
        let pending_wait: Option<PendingWait> = ctx.take_pending_wait();

        let mut cleanup: Cleanup = Cleanup::default();
        match data.groups.get_mut(&id) {
            Some(record) => record.vm = Some(vm),
            None => {
                warn!("run_group(): group {} vanished while running", id);
                cleanup.vm = Some(vm);
            },
        }
        if cleanup.vm.is_none() {
            data.set_state(&id, RunningState::Suspending);
            cleanup = self.finish_slice(&mut data, &id, result, pending_wait);
        }
        self.release_wakeups(&mut data);
        drop(ctx);
        MutexGuard::unlocked(&mut data, || cleanup.run());
        data
    }

    /// Moves a group out of `Suspending` according to what its slice returned.
    fn finish_slice(
        &self,
        data: &mut JobData,
        id: &GroupId,
        result: SliceResult,
        pending_wait: Option<PendingWait>,
    ) -> Cleanup {
        let record: &mut GroupRecord = match data.groups.get_mut(id) {
            Some(record) => record,
            None => return Cleanup::default(),
        };
        let completed: bool = matches!(result, Ok(Ok(RunResult::Completed)));
        let next: RunningState = match result {
            Ok(Ok(RunResult::Completed)) | Ok(Ok(RunResult::Terminated)) => RunningState::Terminated,
            Ok(Ok(RunResult::Suspended(SuspendReason::Yield))) => {
                record.handle.abort_flag().clear_yield();
                RunningState::Runnable
            },
            Ok(Ok(RunResult::Suspended(SuspendReason::WaitForMultiple))) => match pending_wait {
                Some(wait) => {
                    record.pending_wait = Some(wait);
                    RunningState::WaitForMultiple
                },
                None => {
                    warn!("finish_slice(): group {} suspended for a wait it never recorded", id);
                    RunningState::Runnable
                },
            },
            Ok(Ok(RunResult::Suspended(SuspendReason::DebugTrap))) => {
                if self.debugger.on_debug_trap(data, id) {
                    if let Some(record) = data.groups.get_mut(id) {
                        record.inform_next_suspend = true;
                    }
                }
                RunningState::Runnable
            },
            Ok(Err(e)) => {
                debug!("finish_slice(): group {} failed: {}", id, e);
                record.errors.push(ErrorRecord::from(e));
                RunningState::Terminated
            },
            Err(payload) => {
                let message: String = match payload.downcast_ref::<&str>() {
                    Some(message) => message.to_string(),
                    None => match payload.downcast_ref::<String>() {
                        Some(message) => message.clone(),
                        None => "unknown panic".to_string(),
                    },
                };
                warn!("finish_slice(): group {} panicked: {}", id, message);
                let trace = record.vm.as_ref().map(|vm| vm.stack_trace()).unwrap_or_default();
                record.errors.push(ErrorRecord {
                    message: format!("panic: {}", message),
                    trace,
                });
                RunningState::Terminated
            },
        };

        if next == RunningState::Terminated {
            return self.terminate_group(data, id, completed);
        }
        self.park_or_enter(data, id, next);
        match data.groups.get_mut(id) {
            Some(record) => Cleanup {
                callbacks: ::std::mem::take(&mut record.unlock_callbacks),
                ..Default::default()
            },
            None => Cleanup::default(),
        }
    }

    /// Enters `next`, unless a pause was requested, in which case the group goes to `DebugStopped` and resumes into
    /// `next` later.
    fn park_or_enter(&self, data: &mut JobData, id: &GroupId, next: RunningState) {
        let pause: bool = match data.groups.get_mut(id) {
            Some(record) if record.inform_next_suspend => {
                record.inform_next_suspend = false;
                record.handle.abort_flag().clear_yield();
                record.old_state_debug = next;
                true
            },
            Some(_) => false,
            None => return,
        };
        if pause {
            data.set_state(id, RunningState::DebugStopped);
            self.debugger.on_paused(data, id);
        } else {
            data.set_state(id, next);
        }
    }

    /// Terminates a group: records its final status, lets the debugger keep it as a zombie, and collects the work
    /// that has to happen outside the lock. A group that did not complete on its own is charged to its abort reason.
    fn terminate_group(&self, data: &mut JobData, id: &GroupId, completed: bool) -> Cleanup {
        if let Some(record) = data.groups.get_mut(id) {
            let reason: AbortReason = record.handle.abort_flag().get();
            if !completed && reason.is_terminating() {
                record.terminated_by = Some(reason);
            }
        }
        data.set_state(id, RunningState::Terminated);
        let now: Instant = Instant::now();
        let status: JobStatus = match data.groups.get(id) {
            Some(record) => {
                let mut status: JobStatus =
                    JobStatus::from_record(record, now, self.debugger.pause_reason(id), record.vm.as_deref());
                if !status.has_errors() {
                    status.stacktrace = None;
                }
                status
            },
            None => return Cleanup::default(),
        };
        debug!(
            "terminate_group(): group {} terminated after {} ms{}{}",
            id,
            status.total_running,
            if status.has_errors() { " with errors" } else { "" },
            status.abortreason.as_deref().map(|reason| format!(" ({})", reason)).unwrap_or_default()
        );
        data.history.push(now, status.clone());

        let keep: bool = self.debugger.on_job_terminate(data, id, &status);
        let mut cleanup: Cleanup = Cleanup::default();
        if let Some(record) = data.groups.get_mut(id) {
            cleanup.callbacks.append(&mut record.pre_termination_callbacks);
            cleanup.callbacks.append(&mut record.termination_callbacks);
            cleanup.callbacks.append(&mut record.unlock_callbacks);
            record.pending_wait = None;
        }
        if !keep {
            if let Some(record) = data.groups.remove(id) {
                cleanup.vm = record.vm;
                cleanup.finished = Some(record.handle);
            }
        }
        cleanup
    }

    /// One round of the central wait: registers every waiting group, blocks outside the lock and makes the groups
    /// whose handles fired runnable again. Also enforces running timeouts.
    fn central_wait<'a>(&'a self, mut data: MutexGuard<'a, JobData>) -> MutexGuard<'a, JobData> {
        data.pipewaiter_active = true;
        self.wait_event.reset();

        let now: Instant = Instant::now();
        let mut waiter: Waiter = Waiter::new();
        waiter.add_event(&self.wait_event);
        let mut deadline: Option<Instant> = None;
        let mut waiting: Vec<GroupId> = Vec::new();
        let mut resolved: usize = 0;

        let jobs: Vec<GroupId> = data.jobs.clone();
        for id in &jobs {
            let state: RunningState = match data.groups.get(id) {
                Some(record) => record.state,
                None => continue,
            };
            match state {
                RunningState::WaitForMultiple => {
                    if self.intercept_waiting(&mut data, id) {
                        resolved += 1;
                        continue;
                    }
                    let record: &GroupRecord = match data.groups.get(id) {
                        Some(record) => record,
                        None => continue,
                    };
                    let (ready, wait_deadline): (Vec<i32>, Option<Instant>) = match &record.pending_wait {
                        Some(wait) => (Self::register_wait(&wait.items, &mut waiter), wait.deadline),
                        None => (Vec::new(), Some(now)),
                    };
                    if !ready.is_empty() || wait_deadline.is_some_and(|d| d <= now) {
                        Self::resolve_wait(&mut data, id, ready);
                        resolved += 1;
                    } else {
                        waiting.push(*id);
                        deadline = earliest(deadline, wait_deadline);
                    }
                },
                RunningState::Running => {
                    if let Some(expiry) = Self::enforce_timeout(&data, id, now) {
                        deadline = earliest(deadline, Some(expiry));
                    }
                },
                _ => (),
            }
        }

        if resolved > 0 {
            data.pipewaiter_active = false;
            self.release_wakeups(&mut data);
            return data;
        }
        if waiting.is_empty() && deadline.is_none() {
            // Nothing to watch. Sleep until there is work or a group starts waiting.
            data.pipewaiter_active = false;
            if !data.has_runnable() && !data.abort {
                self.work_available.wait(&mut data);
            }
            return data;
        }

        // With runnable work pending, only probe so that this worker can go and run it.
        let wait_until: Instant = if data.has_runnable() {
            now
        } else {
            let bound: Instant = now + self.config.max_wait_granularity;
            deadline.map_or(bound, |d| d.min(bound))
        };
        trace!(
            "central_wait(): waiting on {} groups ({} descriptors) for {:?}",
            waiting.len(),
            waiter.len(),
            wait_until.saturating_duration_since(now)
        );
        if let Err(e) = MutexGuard::unlocked(&mut data, || waiter.wait_until(Some(wait_until))) {
            warn!("central_wait(): wait failed ({:?})", e);
        }

        let now: Instant = Instant::now();
        for id in &waiting {
            match data.groups.get(id) {
                Some(record) if record.state == RunningState::WaitForMultiple => (),
                _ => continue,
            }
            if self.intercept_waiting(&mut data, id) {
                continue;
            }
            let (ready, wait_deadline): (Vec<i32>, Option<Instant>) = match data.groups.get(id) {
                Some(GroupRecord {
                    pending_wait: Some(wait),
                    ..
                }) => (Self::check_wait(&wait.items, &waiter), wait.deadline),
                _ => (Vec::new(), Some(now)),
            };
            if !ready.is_empty() || wait_deadline.is_some_and(|d| d <= now) {
                Self::resolve_wait(&mut data, id, ready);
            }
        }
        data.pipewaiter_active = false;
        self.release_wakeups(&mut data);
        data
    }

    /// Handles the abort flag of a waiting group. Returns `true` if the group left `WaitForMultiple`.
    fn intercept_waiting(&self, data: &mut JobData, id: &GroupId) -> bool {
        let (abort, pause): (AbortReason, bool) = match data.groups.get(id) {
            Some(record) => (record.handle.abort_flag().get(), record.inform_next_suspend),
            None => return false,
        };
        if abort.is_terminating() {
            Self::resolve_wait(data, id, Vec::new());
            return true;
        }
        if pause {
            self.park_or_enter(data, id, RunningState::WaitForMultiple);
            return true;
        }
        if abort == AbortReason::Yield {
            // A waiting group has nothing to yield.
            if let Some(record) = data.groups.get(id) {
                record.handle.abort_flag().clear_yield();
            }
        }
        false
    }

    /// Adds the handles of a wait to `waiter`. Returns the ids of handles that are already signalled.
    fn register_wait(items: &[WaitItem], waiter: &mut Waiter) -> Vec<i32> {
        let mut ready: Vec<i32> = Vec::new();
        for item in items {
            let signalled: bool = if item.write {
                item.object.add_to_waiter_write(waiter)
            } else {
                item.object.add_to_waiter_read(waiter)
            };
            if signalled {
                ready.push(item.id);
            }
        }
        ready
    }

    fn check_wait(items: &[WaitItem], waiter: &Waiter) -> Vec<i32> {
        items
            .iter()
            .filter(|item| {
                let status: SignalledStatus = if item.write {
                    item.object.is_write_signalled(Some(waiter))
                } else {
                    item.object.is_read_signalled(Some(waiter))
                };
                status == SignalledStatus::Signalled
            })
            .map(|item| item.id)
            .collect()
    }

    fn resolve_wait(data: &mut JobData, id: &GroupId, ready: Vec<i32>) {
        if let Some(record) = data.groups.get_mut(id) {
            trace!("resolve_wait(): group {} woke up on {:?}", id, ready);
            record.pending_wait = None;
            record.wait_result = Some(ready);
            data.set_state(id, RunningState::Runnable);
        }
    }

    /// Aborts a running group whose running timeout has passed. Otherwise returns when it will pass.
    fn enforce_timeout(data: &JobData, id: &GroupId, now: Instant) -> Option<Instant> {
        let record: &GroupRecord = data.groups.get(id)?;
        let timeout: Duration = record.running_timeout?;
        if record.handle.abort_flag().get().is_terminating() {
            return None;
        }
        let remaining: Duration = timeout.saturating_sub(record.running_time(now));
        if remaining.is_zero() {
            debug!("enforce_timeout(): group {} exceeded its running timeout", id);
            record.handle.abort_flag().raise(AbortReason::Timeout);
            return None;
        }
        Some(now + remaining)
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
