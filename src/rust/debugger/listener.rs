// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    debugger::{
        handlers,
        protocol::{
            Envelope,
            PUSH_JOB_REMOVED,
        },
        Debugger,
        DebuggerState,
    },
    events::{
        OutputObject,
        Waiter,
    },
    ipc::{
        IpcEndpoint,
        Message,
        NamedPort,
    },
    jobmgr::{
        GroupId,
        JobData,
        SharedJobManager,
        VMGroup,
    },
    vm::VirtualMachine,
};
use ::parking_lot::MutexGuard;
use ::serde_json::json;
use ::std::{
    sync::Arc,
    time::Instant,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Body of the debugger thread: accepts clients, serves their requests and reclaims expired zombies.
pub(super) fn run(manager: SharedJobManager, port: Arc<NamedPort>) {
    let debugger: &Debugger = manager.debugger();
    info!("run(): debugger listening on port {}", port.name());
    loop {
        debugger.wakeup.reset();
        if debugger.is_stopping() {
            break;
        }

        let mut waiter: Waiter = Waiter::new();
        waiter.add_event(&debugger.wakeup);
        let mut ready: bool = port.add_to_waiter_read(&mut waiter);
        if let Some(client) = &debugger.lock_state().client {
            ready |= client.add_to_waiter_read(&mut waiter);
        }
        if !ready {
            let deadline: Option<Instant> = debugger.next_zombie_expiry();
            if let Err(e) = waiter.wait_until(deadline) {
                warn!("run(): wait failed ({:?})", e);
            }
        }

        while let Some(endpoint) = port.accept() {
            attach_client(&manager, debugger, endpoint);
        }
        serve_client(&manager, debugger);
        reclaim_zombies(&manager, debugger);
    }
    debugger.detach_client(&manager);
    info!("run(): debugger stopped");
}

fn attach_client(manager: &SharedJobManager, debugger: &Debugger, endpoint: IpcEndpoint) {
    // One client at a time. The newest one wins.
    debugger.detach_client(manager);
    debugger.lock_state().client = Some(endpoint);
    info!("attach_client(): debugger client connected");
}

/// Answers every request that is waiting, then drops the client if it went away.
fn serve_client(manager: &SharedJobManager, debugger: &Debugger) {
    loop {
        let message: Message = {
            let state: MutexGuard<DebuggerState> = debugger.lock_state();
            match state.client.as_ref().and_then(IpcEndpoint::receive_message) {
                Some(message) => message,
                None => break,
            }
        };
        let response: Envelope = match Envelope::from_message(&message) {
            Ok(request) => handlers::handle(manager, &request),
            Err(e) => {
                warn!("serve_client(): malformed request ({:?})", e);
                let mut response: Envelope =
                    Envelope::new("error", None, json!({ "errno": e.errno, "message": e.cause }));
                response.replyto = message.id;
                response
            },
        };
        match response.to_message() {
            Ok(reply) => {
                if let Some(client) = &debugger.lock_state().client {
                    client.send_message(reply, false);
                }
            },
            Err(e) => warn!("serve_client(): cannot encode {} ({:?})", response.kind, e),
        }
    }

    let broken: bool = debugger
        .lock_state()
        .client
        .as_ref()
        .is_some_and(IpcEndpoint::is_broken);
    if broken {
        debugger.detach_client(manager);
    }
}

/// Releases zombies whose timeout passed.
fn reclaim_zombies(manager: &SharedJobManager, debugger: &Debugger) {
    let now: Instant = Instant::now();
    let mut removed: Vec<(VMGroup, Option<Box<dyn VirtualMachine>>)> = Vec::new();
    {
        let mut data: MutexGuard<JobData> = manager.lock_data();
        let mut state: MutexGuard<DebuggerState> = debugger.lock_state();
        let expired: Vec<GroupId> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.zombie)
            .filter(|(_, job)| {
                job.terminated_at
                    .is_some_and(|at| at + debugger.config().zombie_timeout <= now)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            state.jobs.remove(&id);
            if let Some(zombie) = manager.remove_zombie(&mut data, &id) {
                removed.push(zombie);
            }
            debug!("reclaim_zombies(): released job {} after the zombie timeout", id);
            state.push(PUSH_JOB_REMOVED, Some(&id), json!({ "reason": "timeout" }));
        }
    }
    for (group, vm) in removed {
        drop(vm);
        group.signal_finished();
    }
}
