// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Contract between the scheduler and the virtual machines it hosts.
//!
//! A VM executes in slices. Each call to [VirtualMachine::run] executes until the script completes, is aborted, or
//! needs to park, and reports which of these happened through a [RunResult]. Suspension is never modelled as control
//! flow unwinding out of the VM: a VM that wants to wait records the wait on its [RunContext] and returns.

mod abort;
mod context;
mod debug;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::serde::{
    Deserialize,
    Serialize,
};
use ::serde_json::Value;
use ::std::fmt;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    abort::{
        AbortFlag,
        AbortReason,
    },
    context::RunContext,
    debug::{
        BreakpointRequest,
        BreakpointRequests,
        BreakpointSet,
        BreakpointTarget,
        CodeAddress,
        LibraryInfo,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Outcome of one execution slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunResult {
    /// The script ran to its end.
    Completed,
    /// The script observed a terminating abort reason and stopped.
    Terminated,
    /// The script parked and wants to be resumed later.
    Suspended(SuspendReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendReason {
    /// Gave up the worker voluntarily, usually because the abort flag asked for a yield.
    Yield,
    /// Recorded a wait through [RunContext::wait_for_multiple].
    WaitForMultiple,
    /// Hit a debugger trap or breakpoint.
    DebugTrap,
}

/// A script-level failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmError {
    pub message: String,
    #[serde(default)]
    pub trace: Vec<StackFrame>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub location: String,
}

/// Counters a VM reports for status queries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatistics {
    pub instructions: u64,
    pub stack_depth: usize,
    pub heap_bytes: u64,
    pub objects: u64,
}

/// A script VM hosted by the scheduler.
///
/// Everything except [Self::run] is only invoked while the group is owned by the calling thread, either because the
/// thread is the worker running the group or because it holds the group in the `Locked` state.
pub trait VirtualMachine: Send {
    /// Executes one slice.
    fn run(&mut self, ctx: &mut RunContext) -> Result<RunResult, VmError>;

    fn stack_trace(&self) -> Vec<StackFrame> {
        Vec::new()
    }

    fn statistics(&self) -> VmStatistics {
        VmStatistics::default()
    }

    /// Libraries currently loaded, in the order used by [CodeAddress::library].
    fn libraries(&self) -> Vec<LibraryInfo> {
        Vec::new()
    }

    fn set_breakpoints(&mut self, _breakpoints: BreakpointSet) {}

    /// Variables visible in the given stack frame.
    fn variables(&self, _frame: usize) -> Value {
        Value::Null
    }

    fn set_profiling(&mut self, _enabled: bool) {}

    fn profile(&self) -> Value {
        Value::Null
    }

    fn memory_snapshot(&self) -> Value {
        Value::Null
    }

    fn blob_references(&self) -> Value {
        Value::Null
    }

    fn handle_list(&self) -> Value {
        Value::Null
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n    at {} ({})", frame.function, frame.location)?;
        }
        Ok(())
    }
}

impl From<&str> for VmError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
            trace: Vec::new(),
        }
    }
}
