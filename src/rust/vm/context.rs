// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    jobmgr::{
        SharedJobManager,
        VMGroup,
    },
    runtime::fail::Fail,
    vm::AbortReason,
    waitfor::{
        PendingWait,
        WaitItem,
    },
};
use ::std::time::Instant;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-slice state handed to [super::VirtualMachine::run].
pub struct RunContext {
    manager: SharedJobManager,
    group: VMGroup,
    /// Whether the VM may park through [Self::wait_for_multiple].
    can_suspend: bool,
    /// Moment at which the group's running timeout expires, if it has one.
    run_deadline: Option<Instant>,
    /// Handles resolved by the central wait since the last slice.
    wait_result: Option<Vec<i32>>,
    pending_wait: Option<PendingWait>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RunContext {
    pub(crate) fn new(
        manager: SharedJobManager,
        group: VMGroup,
        run_deadline: Option<Instant>,
        wait_result: Option<Vec<i32>>,
    ) -> Self {
        Self {
            manager,
            group,
            can_suspend: true,
            run_deadline,
            wait_result,
            pending_wait: None,
        }
    }

    pub fn manager(&self) -> &SharedJobManager {
        &self.manager
    }

    pub fn group(&self) -> &VMGroup {
        &self.group
    }

    pub fn can_suspend(&self) -> bool {
        self.can_suspend
    }

    /// Forbids or allows suspension, e.g. around a nested native call that cannot be resumed.
    pub fn set_can_suspend(&mut self, can_suspend: bool) {
        self.can_suspend = can_suspend;
    }

    pub fn run_deadline(&self) -> Option<Instant> {
        self.run_deadline
    }

    /// Reads the abort flag. A VM must call this at its checkpoints. Raises [AbortReason::Timeout] once the running
    /// timeout has passed, so that the limit holds even when no other worker is free to enforce it.
    pub fn abort_reason(&self) -> AbortReason {
        if let Some(deadline) = self.run_deadline {
            if Instant::now() >= deadline {
                self.group.abort_flag().raise(AbortReason::Timeout);
            }
        }
        self.group.abort_flag().get()
    }

    /// Parks the group until one of `items` is signalled or `deadline` passes. The VM must return
    /// `RunResult::Suspended(SuspendReason::WaitForMultiple)` right after this succeeds; the resolved ids are then
    /// available from [Self::take_wait_result] in the next slice.
    pub fn wait_for_multiple(&mut self, items: Vec<WaitItem>, deadline: Option<Instant>) -> Result<(), Fail> {
        if !self.can_suspend {
            let cause: String = format!("group {} cannot suspend right now", self.group.id());
            error!("wait_for_multiple(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if self.pending_wait.is_some() {
            let cause: String = format!("group {} already has a pending wait", self.group.id());
            error!("wait_for_multiple(): {}", cause);
            return Err(Fail::new(libc::EALREADY, &cause));
        }
        trace!("wait_for_multiple(): group {} parks on {} handles", self.group.id(), items.len());
        self.manager.count_central_wait();
        self.pending_wait = Some(PendingWait { items, deadline });
        Ok(())
    }

    /// Ids resolved by the last central wait. An empty list means the wait timed out or the group was aborted.
    pub fn take_wait_result(&mut self) -> Option<Vec<i32>> {
        self.wait_result.take()
    }

    pub(crate) fn take_pending_wait(&mut self) -> Option<PendingWait> {
        self.pending_wait.take()
    }
}
