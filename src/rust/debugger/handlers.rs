// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Debugger requests. Each handler takes the scheduler lock before the debugger lock, and inspects VMs only through
//! a locked group.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    debugger::{
        protocol::Envelope,
        rules::{
            site,
            DebugRule,
        },
        Debugger,
        DebuggerState,
    },
    jobmgr::{
        GroupId,
        GroupRecord,
        JobData,
        LockedVMGroup,
        PauseOutcome,
        SharedJobManager,
        VMGroup,
    },
    runtime::fail::Fail,
    vm::{
        AbortReason,
        BreakpointRequests,
        BreakpointSet,
        VirtualMachine,
    },
};
use ::parking_lot::MutexGuard;
use ::serde::Deserialize;
use ::serde_json::{
    json,
    Value,
};

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Default, Deserialize)]
struct ConfigureRequest {
    #[serde(default)]
    rules: Vec<DebugRule>,
}

#[derive(Default, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    pause: bool,
}

#[derive(Default, Deserialize)]
struct VariablesRequest {
    #[serde(default)]
    frame: usize,
}

#[derive(Deserialize)]
struct ProfilingRequest {
    enabled: bool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Answers one request. Failures are answered with `<type>-error`.
pub(super) fn handle(manager: &SharedJobManager, request: &Envelope) -> Envelope {
    trace!("handle(): {} for {:?}", request.kind, request.groupid);
    match dispatch(manager, request) {
        Ok(response) => response,
        Err(e) => {
            debug!("handle(): {} failed ({:?})", request.kind, e);
            Envelope::reply(
                request,
                &format!("{}-error", request.kind),
                json!({ "errno": e.errno, "message": e.cause }),
            )
        },
    }
}

fn dispatch(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    match request.kind.as_str() {
        "configure" => configure(manager.debugger(), request),
        "getjobmgrstatus" => get_jobmgr_status(manager, request),
        "getjobstatus" => get_job_status(manager, request),
        "terminatejob" => terminate_job(manager, request),
        "connectjob" => connect_job(manager, request),
        "disconnectjob" => disconnect_job(manager, request),
        "pausejob" => pause_job(manager, request),
        "continuejob" => continue_job(manager, request),
        "getvariables" => {
            let args: VariablesRequest = parse_payload(request)?;
            inspect(manager, request, |vm| Ok(json!({ "frame": args.frame, "variables": vm.variables(args.frame) })))
        },
        "getlibraries" => inspect(manager, request, |vm| Ok(json!({ "libraries": vm.libraries() }))),
        "setbreakpoints" => set_breakpoints(manager, request),
        "setprofiling" => set_profiling(manager, request),
        "getprofile" => inspect(manager, request, |vm| Ok(json!({ "profile": vm.profile() }))),
        "getmemorysnapshot" => inspect(manager, request, |vm| Ok(json!({ "snapshot": vm.memory_snapshot() }))),
        "getblobreferences" => inspect(manager, request, |vm| Ok(json!({ "blobs": vm.blob_references() }))),
        "gethandlelist" => inspect(manager, request, |vm| Ok(json!({ "handles": vm.handle_list() }))),
        other => {
            let cause: String = format!("unknown request type {}", other);
            warn!("dispatch(): {}", cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

fn ok(request: &Envelope, payload: Value) -> Result<Envelope, Fail> {
    Ok(Envelope::reply(request, &format!("{}-ok", request.kind), payload))
}

fn parse_payload<T: Default + for<'de> Deserialize<'de>>(request: &Envelope) -> Result<T, Fail> {
    if request.payload.is_null() {
        return Ok(T::default());
    }
    Ok(T::deserialize(&request.payload)?)
}

fn unknown_job(caller: &str, id: &GroupId) -> Fail {
    let cause: String = format!("no job {}", id);
    debug!("{}(): {}", caller, cause);
    Fail::new(libc::ENOENT, &cause)
}

fn not_connected(caller: &str, id: &GroupId) -> Fail {
    let cause: String = format!("job {} is not connected", id);
    debug!("{}(): {}", caller, cause);
    Fail::new(libc::EINVAL, &cause)
}

fn find_group(manager: &SharedJobManager, id: &GroupId, caller: &str) -> Result<VMGroup, Fail> {
    manager.find_group(id).ok_or_else(|| unknown_job(caller, id))
}

fn require_connected(state: &DebuggerState, id: &GroupId, caller: &str) -> Result<(), Fail> {
    if state.is_connected(id) {
        Ok(())
    } else {
        Err(not_connected(caller, id))
    }
}

fn configure(debugger: &Debugger, request: &Envelope) -> Result<Envelope, Fail> {
    let args: ConfigureRequest = parse_payload(request)?;
    let count: usize = args.rules.len();
    debugger.lock_state().rules = Some(args.rules);
    info!("configure(): installed {} debugger rules", count);
    ok(request, json!({ "rules": count }))
}

fn get_jobmgr_status(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let status: Value = serde_json::to_value(manager.get_status())?;
    let locks: Value = serde_json::to_value(manager.locks().status())?;
    let connected: Vec<String> = {
        let state: MutexGuard<DebuggerState> = manager.debugger().lock_state();
        state
            .jobs
            .iter()
            .filter(|(_, job)| job.connected)
            .map(|(id, _)| id.to_string())
            .collect()
    };
    ok(request, json!({ "jobmgr": status, "locks": locks, "connected": connected }))
}

fn get_job_status(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    {
        let data: MutexGuard<JobData> = manager.lock_data();
        let state: MutexGuard<DebuggerState> = manager.debugger().lock_state();
        if let Some(record) = data.groups.get(&id) {
            let payload: Value = json!({
                "connected": state.is_connected(&id),
                "status": state.status_payload(record, &id),
            });
            return ok(request, payload);
        }
    }
    match manager.get_job_status(&id) {
        Some(status) => ok(request, json!({ "connected": false, "status": status })),
        None => Err(unknown_job("get_job_status", &id)),
    }
}

fn terminate_job(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    let group: VMGroup = find_group(manager, &id, "terminate_job")?;
    manager.abort_vm_group(&group, AbortReason::Manually);
    let mut data: MutexGuard<JobData> = manager.lock_data();
    let mut state: MutexGuard<DebuggerState> = manager.debugger().lock_state();
    // A paused job has to run to notice the abort.
    let resumed: bool = manager.resume_from_debug(&mut data, &id);
    if let Some(job) = state.jobs.get_mut(&id) {
        job.want_pause = false;
        job.pause_reason = 0;
    }
    drop(state);
    drop(data);
    ok(request, json!({ "resumed": resumed }))
}

fn connect_job(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    let args: ConnectRequest = parse_payload(request)?;
    let mut data: MutexGuard<JobData> = manager.lock_data();
    let mut state: MutexGuard<DebuggerState> = manager.debugger().lock_state();
    if !data.groups.contains_key(&id) {
        return Err(unknown_job("connect_job", &id));
    }
    if !state.connect(&id, &[]) {
        let payload: Value = status_of(&data, &state, &id);
        return Ok(Envelope::reply(request, "connectjob-alreadyconnected", payload));
    }
    let mut result: Option<PauseOutcome> = None;
    if args.pause {
        result = pause(manager, &mut data, &mut state, &id);
    }
    let mut payload: Value = status_of(&data, &state, &id);
    if let Some(outcome) = result {
        payload["pause"] = Value::from(pause_outcome_name(outcome));
    }
    ok(request, payload)
}

fn disconnect_job(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    let zombie: Option<(VMGroup, Option<Box<dyn VirtualMachine>>)> = {
        let mut data: MutexGuard<JobData> = manager.lock_data();
        let mut state: MutexGuard<DebuggerState> = manager.debugger().lock_state();
        require_connected(&state, &id, "disconnect_job")?;
        let job = match state.jobs.remove(&id) {
            Some(job) => job,
            None => return Err(not_connected("disconnect_job", &id)),
        };
        if job.zombie {
            manager.remove_zombie(&mut data, &id)
        } else {
            manager.resume_from_debug(&mut data, &id);
            None
        }
    };
    info!("disconnect_job(): debugger detached from job {}", id);
    let removed: bool = zombie.is_some();
    if let Some((group, vm)) = zombie {
        drop(vm);
        group.signal_finished();
    }
    ok(request, json!({ "removed": removed }))
}

fn pause_job(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    let mut data: MutexGuard<JobData> = manager.lock_data();
    let mut state: MutexGuard<DebuggerState> = manager.debugger().lock_state();
    require_connected(&state, &id, "pause_job")?;
    match pause(manager, &mut data, &mut state, &id) {
        Some(outcome) => ok(request, json!({ "result": pause_outcome_name(outcome) })),
        None => Err(unknown_job("pause_job", &id)),
    }
}

fn continue_job(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    let mut data: MutexGuard<JobData> = manager.lock_data();
    let mut state: MutexGuard<DebuggerState> = manager.debugger().lock_state();
    require_connected(&state, &id, "continue_job")?;
    let resumed: bool = manager.resume_from_debug(&mut data, &id);
    if let Some(job) = state.jobs.get_mut(&id) {
        job.want_pause = false;
        job.pause_reason = 0;
    }
    ok(request, json!({ "resumed": resumed }))
}

fn set_breakpoints(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    let requests: BreakpointRequests = parse_payload(request)?;
    let group: VMGroup = connected_group(manager, &id, "set_breakpoints")?;
    let requested: usize = requests.breakpoints.len();
    match manager.try_lock_vm_group(&group, None)? {
        Some(mut locked) => {
            let vm: &mut (dyn VirtualMachine + 'static) = locked_vm(&mut locked, &id, "set_breakpoints")?;
            let breakpoints: BreakpointSet = BreakpointSet::resolve(&requests, &vm.libraries());
            let installed: usize = breakpoints.len();
            vm.set_breakpoints(breakpoints);
            ok(request, json!({ "requested": requested, "installed": installed, "deferred": false }))
        },
        None => {
            with_record(manager, &id, "set_breakpoints", |record| {
                record.pending_breakpoints = Some(requests)
            })?;
            ok(request, json!({ "requested": requested, "deferred": true }))
        },
    }
}

fn set_profiling(manager: &SharedJobManager, request: &Envelope) -> Result<Envelope, Fail> {
    let id: GroupId = request.group_id()?;
    let args: ProfilingRequest = ProfilingRequest::deserialize(&request.payload)?;
    let group: VMGroup = connected_group(manager, &id, "set_profiling")?;
    match manager.try_lock_vm_group(&group, None)? {
        Some(mut locked) => {
            locked_vm(&mut locked, &id, "set_profiling")?.set_profiling(args.enabled);
            ok(request, json!({ "enabled": args.enabled, "deferred": false }))
        },
        None => {
            with_record(manager, &id, "set_profiling", |record| {
                record.pending_profiling = Some(args.enabled)
            })?;
            ok(request, json!({ "enabled": args.enabled, "deferred": true }))
        },
    }
}

/// Runs `f` on the VM of a connected job that is not running right now.
fn inspect<F>(manager: &SharedJobManager, request: &Envelope, f: F) -> Result<Envelope, Fail>
where
    F: FnOnce(&mut (dyn VirtualMachine + 'static)) -> Result<Value, Fail>,
{
    let id: GroupId = request.group_id()?;
    let group: VMGroup = connected_group(manager, &id, "inspect")?;
    let mut locked: LockedVMGroup = match manager.try_lock_vm_group(&group, None)? {
        Some(locked) => locked,
        None => {
            let cause: String = format!("job {} is running, pause it first", id);
            debug!("inspect(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        },
    };
    let payload: Value = f(locked_vm(&mut locked, &id, "inspect")?)?;
    drop(locked);
    ok(request, payload)
}

fn connected_group(manager: &SharedJobManager, id: &GroupId, caller: &str) -> Result<VMGroup, Fail> {
    require_connected(&manager.debugger().lock_state(), id, caller)?;
    find_group(manager, id, caller)
}

fn locked_vm<'a>(
    locked: &'a mut LockedVMGroup,
    id: &GroupId,
    caller: &str,
) -> Result<&'a mut (dyn VirtualMachine + 'static), Fail> {
    match locked.vm_mut() {
        Some(vm) => Ok(vm),
        None => {
            let cause: String = format!("job {} has no virtual machine", id);
            debug!("{}(): {}", caller, cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

fn with_record<F>(manager: &SharedJobManager, id: &GroupId, caller: &str, f: F) -> Result<(), Fail>
where
    F: FnOnce(&mut GroupRecord),
{
    let mut data: MutexGuard<JobData> = manager.lock_data();
    match data.groups.get_mut(id) {
        Some(record) => {
            f(record);
            Ok(())
        },
        None => Err(unknown_job(caller, id)),
    }
}

/// Pauses a connected job and tells the client if it stopped right away.
fn pause(
    manager: &SharedJobManager,
    data: &mut JobData,
    state: &mut DebuggerState,
    id: &GroupId,
) -> Option<PauseOutcome> {
    let outcome: PauseOutcome = manager.request_debug_pause(data, id)?;
    if let Some(job) = state.jobs.get_mut(id) {
        job.want_pause = true;
        job.pause_reason |= site::MANUAL;
    }
    if outcome == PauseOutcome::Paused {
        state.push_paused(data, id);
    }
    Some(outcome)
}

fn status_of(data: &JobData, state: &DebuggerState, id: &GroupId) -> Value {
    match data.groups.get(id) {
        Some(record) => json!({ "status": state.status_payload(record, id) }),
        None => json!({}),
    }
}

fn pause_outcome_name(outcome: PauseOutcome) -> &'static str {
    match outcome {
        PauseOutcome::Paused => "paused",
        PauseOutcome::Pending => "pending",
        PauseOutcome::AlreadyPaused => "alreadypaused",
        PauseOutcome::Terminated => "terminated",
    }
}
