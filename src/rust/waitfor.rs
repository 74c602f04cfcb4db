// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Waiting on several handles from inside a running script.
//!
//! Resolution happens in three tiers. First every handle is probed without blocking. Handles that cannot answer that
//! way are put into a local [Waiter]. Only when nothing is ready and the VM may suspend does the group park in the
//! scheduler's central wait, freeing its worker for other groups. A group that may not suspend blocks in its own slice,
//! in rounds no longer than the scheduler's wait granularity, and gives up with an empty result once it is aborted or
//! its running timeout passes.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::{
        OutputObject,
        SignalledStatus,
        Waiter,
    },
    runtime::fail::Fail,
    vm::RunContext,
};
use ::std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One handle of a wait, identified towards the script by `id`.
#[derive(Clone)]
pub struct WaitItem {
    pub id: i32,
    pub object: Arc<dyn OutputObject>,
    /// Wait for writability instead of readability.
    pub write: bool,
}

/// A wait recorded on a group that is parked in the central wait.
#[derive(Clone)]
pub struct PendingWait {
    pub items: Vec<WaitItem>,
    pub deadline: Option<Instant>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Ids of the items that are ready. Empty if the deadline passed.
    Ready(Vec<i32>),
    /// The group must return `RunResult::Suspended(SuspendReason::WaitForMultiple)` and will find the result through
    /// `RunContext::take_wait_result` once it runs again.
    Suspended,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WaitItem {
    pub fn read(id: i32, object: Arc<dyn OutputObject>) -> Self {
        Self {
            id,
            object,
            write: false,
        }
    }

    pub fn write(id: i32, object: Arc<dyn OutputObject>) -> Self {
        Self {
            id,
            object,
            write: true,
        }
    }

    fn probe(&self, waiter: Option<&Waiter>) -> SignalledStatus {
        if self.write {
            self.object.is_write_signalled(waiter)
        } else {
            self.object.is_read_signalled(waiter)
        }
    }

    fn add_to_waiter(&self, waiter: &mut Waiter) -> bool {
        if self.write {
            self.object.add_to_waiter_write(waiter)
        } else {
            self.object.add_to_waiter_read(waiter)
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Waits until one of `items` is ready or `deadline` passes, suspending the group if that is allowed and needed.
pub fn wait_for_multiple(
    ctx: &mut RunContext,
    items: Vec<WaitItem>,
    deadline: Option<Instant>,
) -> Result<WaitOutcome, Fail> {
    let can_suspend: bool = ctx.can_suspend();
    let expired: bool = deadline.is_some_and(|d| d <= Instant::now());

    let mut ready: Vec<i32> = Vec::new();
    let mut escalated: Vec<&WaitItem> = Vec::new();
    for item in &items {
        match item.probe(None) {
            SignalledStatus::Signalled => ready.push(item.id),
            SignalledStatus::Unknown => escalated.push(item),
            // Without suspension the whole wait has to happen here.
            SignalledStatus::NotSignalled if !can_suspend && !expired => escalated.push(item),
            SignalledStatus::NotSignalled => (),
        }
    }

    if !ready.is_empty() || (expired && escalated.is_empty()) {
        return Ok(WaitOutcome::Ready(ready));
    }

    if !escalated.is_empty() {
        let mut waiter: Waiter = Waiter::new();
        let mut pending: Vec<&WaitItem> = Vec::with_capacity(escalated.len());
        for item in escalated {
            if item.add_to_waiter(&mut waiter) {
                ready.push(item.id);
            } else {
                pending.push(item);
            }
        }
        if !ready.is_empty() || (expired && pending.is_empty()) {
            return Ok(WaitOutcome::Ready(ready));
        }

        if !pending.is_empty() {
            loop {
                if can_suspend {
                    waiter.wait(Some(Duration::ZERO))?;
                } else {
                    waiter.wait_until(Some(blocking_round_end(ctx, deadline)))?;
                }
                ready.extend(
                    pending
                        .iter()
                        .filter(|item| item.probe(Some(&waiter)) == SignalledStatus::Signalled)
                        .map(|item| item.id),
                );
                if !ready.is_empty() || deadline.is_some_and(|d| d <= Instant::now()) {
                    return Ok(WaitOutcome::Ready(ready));
                }
                if can_suspend {
                    break;
                }
                if ctx.abort_reason().is_terminating() {
                    return Ok(WaitOutcome::Ready(Vec::new()));
                }
            }
        }
    }

    if !can_suspend {
        // Only reachable without any handle to wait on.
        if deadline.is_none() {
            let cause: String = "cannot wait forever on nothing without suspending".to_string();
            error!("wait_for_multiple(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        while deadline.is_some_and(|d| d > Instant::now()) && !ctx.abort_reason().is_terminating() {
            Waiter::new().wait_until(Some(blocking_round_end(ctx, deadline)))?;
        }
        return Ok(WaitOutcome::Ready(Vec::new()));
    }

    ctx.wait_for_multiple(items, deadline)?;
    Ok(WaitOutcome::Suspended)
}

/// End of one blocking round of a wait that cannot suspend. Never later than the wait's deadline, the group's running
/// timeout or one wait granularity from now.
fn blocking_round_end(ctx: &RunContext, deadline: Option<Instant>) -> Instant {
    let bound: Instant = Instant::now() + ctx.manager().config().max_wait_granularity;
    [deadline, ctx.run_deadline()].into_iter().flatten().fold(bound, Instant::min)
}
