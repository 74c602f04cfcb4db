// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative job scheduler for VM groups.
//!
//! A [jobmgr::SharedJobManager] runs many independent VM groups on a fixed pool of worker threads. Groups suspend
//! cooperatively: when a script waits on I/O through [waitfor::wait_for_multiple] and nothing is ready, the group is
//! parked in the central wait loop and its worker returns to the runnable queues. The same waitable primitives back
//! the IPC links, named ports and named locks, so a script can wait on any mix of them at once. A debugger listener
//! can attach to jobs, pause them and inspect them without breaking the scheduler's locking discipline.

#![deny(clippy::all)]

#[macro_use]
extern crate log;

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod debugger;
pub mod events;
pub mod glob;
pub mod ipc;
pub mod jobmgr;
pub mod locks;
pub mod runtime;
pub mod vm;
pub mod waitfor;

pub use self::{
    config::Config,
    events::{
        Event,
        OutputObject,
        SignalledStatus,
        Waiter,
    },
    jobmgr::{
        GroupId,
        RunningState,
        SchedulerConfig,
        SharedJobManager,
        VMGroup,
    },
    runtime::fail::Fail,
    vm::{
        AbortReason,
        RunContext,
        RunResult,
        SuspendReason,
        VirtualMachine,
        VmError,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, returning an [anyhow::Error] from the enclosing function otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if *left != *right {
            anyhow::bail!(
                "ensure_eq!({}, {}) failed: left={:?} right={:?}",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

/// Ensures that two expressions differ, returning an [anyhow::Error] from the enclosing function otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if *left == *right {
            anyhow::bail!(
                "ensure_neq!({}, {}) failed: both={:?}",
                stringify!($left),
                stringify!($right),
                left
            );
        }
    }};
}
