// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    jobmgr::{
        group::GroupRecord,
        GroupId,
        RunningState,
    },
    vm::{
        StackFrame,
        VirtualMachine,
        VmError,
        VmStatistics,
    },
};
use ::serde::{
    Deserialize,
    Serialize,
};
use ::serde_json::Value;
use ::std::{
    collections::BTreeMap,
    time::{
        Duration,
        Instant,
        SystemTime,
        UNIX_EPOCH,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure recorded on a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default)]
    pub trace: Vec<StackFrame>,
}

/// Status of one job, live or finished.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub groupid: String,
    pub script: String,
    pub status: String,
    pub realstatus: String,
    /// Milliseconds since the Unix epoch.
    pub creationdate: u64,
    /// Milliseconds spent running.
    pub total_running: u64,
    pub pausereason: u32,
    pub authenticationrecord: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Vec<StackFrame>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<VmStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorRecord>>,
    /// Set when the job was stopped by an abort instead of finishing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abortreason: Option<String>,
}

/// Status of the whole scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobManagerStatus {
    pub workers: usize,
    pub max_running_low_priority: usize,
    pub running_low_priority: usize,
    pub runnable_high: usize,
    pub runnable_low: usize,
    pub central_waits: u64,
    /// Number of live groups per state.
    pub states: BTreeMap<String, usize>,
    pub jobs: Vec<JobStatus>,
    pub finished: Vec<JobStatus>,
}

/// Scheduling attributes of a live group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupInfo {
    pub id: GroupId,
    pub script: String,
    pub state: RunningState,
    pub real_state: RunningState,
    pub high_priority: bool,
    pub cancellable: bool,
    pub cancelled: bool,
    pub running_timeout: Option<Duration>,
    pub total_running: Duration,
    pub session_data: String,
    pub environment: Option<BTreeMap<String, String>>,
    pub authentication_record: Value,
    pub errors: Vec<ErrorRecord>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl JobStatus {
    /// Builds the status of `record`. Stack trace and statistics are only available when the caller owns the VM.
    pub(crate) fn from_record(
        record: &GroupRecord,
        now: Instant,
        pause_reason: u32,
        vm: Option<&dyn VirtualMachine>,
    ) -> Self {
        let errors: Option<Vec<ErrorRecord>> = if record.errors.is_empty() {
            None
        } else {
            Some(record.errors.clone())
        };
        Self {
            groupid: record.handle.id().to_string(),
            script: record.script.clone(),
            status: record.state.label().to_string(),
            realstatus: record.real_state().as_str().to_string(),
            creationdate: millis_since_epoch(record.handle.created()),
            total_running: record.running_time(now).as_millis() as u64,
            pausereason: pause_reason,
            authenticationrecord: record.auth_record.clone(),
            stacktrace: vm.map(|vm| vm.stack_trace()),
            statistics: vm.map(|vm| vm.statistics()),
            errors,
            abortreason: record.terminated_by.map(|reason| reason.as_str().to_string()),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|errors| !errors.is_empty())
    }
}

impl GroupInfo {
    pub(crate) fn from_record(record: &GroupRecord, now: Instant) -> Self {
        Self {
            id: record.handle.id(),
            script: record.script.clone(),
            state: record.state,
            real_state: record.real_state(),
            high_priority: record.high_priority,
            cancellable: record.cancellable,
            cancelled: record.cancelled,
            running_timeout: record.running_timeout,
            total_running: record.running_time(now),
            session_data: record.session_data.clone(),
            environment: record.environment.clone(),
            authentication_record: record.auth_record.clone(),
            errors: record.errors.clone(),
        }
    }
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<VmError> for ErrorRecord {
    fn from(e: VmError) -> Self {
        Self {
            message: e.message,
            trace: e.trace,
        }
    }
}
