// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::jobmgr::{
    debugger::DebuggerConfig,
    vm::{
        BreakpointSet,
        LibraryInfo,
        StackFrame,
        VmStatistics,
    },
    AbortReason,
    RunContext,
    RunResult,
    SchedulerConfig,
    SharedJobManager,
    VMGroup,
    VirtualMachine,
    VmError,
};
use ::parking_lot::Mutex;
use ::serde_json::{
    json,
    Value,
};
use ::std::{
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

//======================================================================================================================
// Structures
//======================================================================================================================

pub type Slice = Box<dyn FnMut(&mut RunContext) -> Result<RunResult, VmError> + Send>;

/// A VM whose slices are a closure. Introspection answers are canned.
pub struct ScriptVm {
    slice: Slice,
    libraries: Vec<LibraryInfo>,
    pub breakpoints: Arc<Mutex<Option<BreakpointSet>>>,
    pub profiling: Arc<Mutex<Option<bool>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ScriptVm {
    pub fn new<F>(slice: F) -> Self
    where
        F: FnMut(&mut RunContext) -> Result<RunResult, VmError> + Send + 'static,
    {
        Self {
            slice: Box::new(slice),
            libraries: vec![LibraryInfo {
                uri: "mod::test/main.whscr".to_string(),
                compile_id: 7,
                code_len: 1024,
            }],
            breakpoints: Arc::new(Mutex::new(None)),
            profiling: Arc::new(Mutex::new(None)),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl VirtualMachine for ScriptVm {
    fn run(&mut self, ctx: &mut RunContext) -> Result<RunResult, VmError> {
        (self.slice)(ctx)
    }

    fn stack_trace(&self) -> Vec<StackFrame> {
        vec![StackFrame {
            function: "main".to_string(),
            location: "mod::test/main.whscr(1,1)".to_string(),
        }]
    }

    fn statistics(&self) -> VmStatistics {
        VmStatistics {
            instructions: 42,
            stack_depth: 1,
            ..Default::default()
        }
    }

    fn libraries(&self) -> Vec<LibraryInfo> {
        self.libraries.clone()
    }

    fn set_breakpoints(&mut self, breakpoints: BreakpointSet) {
        *self.breakpoints.lock() = Some(breakpoints);
    }

    fn variables(&self, frame: usize) -> Value {
        json!({ "frame": frame, "counter": 1 })
    }

    fn set_profiling(&mut self, enabled: bool) {
        *self.profiling.lock() = Some(enabled);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

pub fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_workers(workers)
        .with_max_running_low_priority(0)
        .with_max_wait_granularity(Duration::from_millis(100))
}

pub fn manager(config: SchedulerConfig) -> Result<SharedJobManager> {
    match SharedJobManager::new(config) {
        Ok(manager) => Ok(manager),
        Err(e) => anyhow::bail!("failed to create job manager ({:?})", e),
    }
}

pub fn debugging_manager(workers: usize, port_name: &str) -> Result<SharedJobManager> {
    manager(config(workers).with_debugger(DebuggerConfig::default().enabled(port_name)))
}

/// Creates a group running `vm` without starting it.
pub fn prepare(manager: &SharedJobManager, script: &str, high_priority: bool, vm: ScriptVm) -> Result<VMGroup> {
    let group: VMGroup = manager.create_vm_group(high_priority)?;
    manager.attach_vm(&group, script, Box::new(vm))?;
    Ok(group)
}

pub fn spawn<F>(manager: &SharedJobManager, script: &str, high_priority: bool, slice: F) -> Result<VMGroup>
where
    F: FnMut(&mut RunContext) -> Result<RunResult, VmError> + Send + 'static,
{
    let group: VMGroup = prepare(manager, script, high_priority, ScriptVm::new(slice))?;
    manager.start_vm_group(&group)?;
    Ok(group)
}

pub fn wait_finished(group: &VMGroup) -> Result<()> {
    if !group.wait_finished(Some(WAIT_TIMEOUT))? {
        anyhow::bail!("group {} did not finish in time", group.id());
    }
    Ok(())
}

/// Polls `condition` until it holds.
pub fn eventually<F: FnMut() -> bool>(mut condition: F) -> Result<()> {
    let deadline: Instant = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            anyhow::bail!("condition not reached in time");
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// Slice body that keeps running until the group is aborted, checking the flag every millisecond.
pub fn spin_until_aborted(ctx: &mut RunContext) -> Result<RunResult, VmError> {
    loop {
        let reason: AbortReason = ctx.abort_reason();
        if reason.is_terminating() {
            return Ok(RunResult::Terminated);
        }
        if reason == AbortReason::Yield {
            return Ok(RunResult::Suspended(::jobmgr::SuspendReason::Yield));
        }
        thread::sleep(Duration::from_millis(1));
    }
}
