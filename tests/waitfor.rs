// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::common::{
    config,
    manager,
    prepare,
    spawn,
    wait_finished,
    ScriptVm,
    WAIT_TIMEOUT,
};
use ::anyhow::Result;
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::jobmgr::{
    waitfor::{
        wait_for_multiple,
        WaitItem,
        WaitOutcome,
    },
    AbortReason,
    Event,
    RunContext,
    RunResult,
    RunningState,
    SharedJobManager,
    SuspendReason,
    VMGroup,
    VmError,
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
// Standalone Functions
//======================================================================================================================

/// Slice body that waits once on `items` and reports the ids it got back.
fn wait_once(
    items: Vec<WaitItem>,
    timeout: Option<Duration>,
    tx: Sender<Vec<i32>>,
) -> impl FnMut(&mut RunContext) -> Result<RunResult, VmError> + Send + 'static {
    move |ctx| {
        if let Some(ids) = ctx.take_wait_result() {
            let _ = tx.send(ids);
            if ctx.abort_reason().is_terminating() {
                return Ok(RunResult::Terminated);
            }
            return Ok(RunResult::Completed);
        }
        let deadline: Option<Instant> = timeout.map(|timeout| Instant::now() + timeout);
        match wait_for_multiple(ctx, items.clone(), deadline) {
            Ok(WaitOutcome::Suspended) => Ok(RunResult::Suspended(SuspendReason::WaitForMultiple)),
            Ok(WaitOutcome::Ready(ids)) => {
                let _ = tx.send(ids);
                Ok(RunResult::Completed)
            },
            Err(e) => Err(VmError::from(e.cause.as_str())),
        }
    }
}

fn received(rx: &Receiver<Vec<i32>>) -> Result<Vec<i32>> {
    match rx.recv_timeout(WAIT_TIMEOUT) {
        Ok(ids) => Ok(ids),
        Err(e) => anyhow::bail!("no wait result ({:?})", e),
    }
}

//======================================================================================================================
// Fast Path
//======================================================================================================================

/// A handle that is already signalled resolves without parking the group.
#[test]
fn waitfor_ready_handle_skips_central_wait() -> Result<()> {
    let manager: SharedJobManager = manager(config(2))?;
    let ready: Arc<Event> = Arc::new(Event::new_signalled()?);
    let idle: Arc<Event> = Arc::new(Event::new()?);
    let items: Vec<WaitItem> = vec![WaitItem::read(1, idle), WaitItem::read(2, ready)];
    let (tx, rx): (Sender<Vec<i32>>, Receiver<Vec<i32>>) = crossbeam_channel::unbounded();
    let group: VMGroup = spawn(&manager, "ready.whscr", false, wait_once(items, None, tx))?;
    wait_finished(&group)?;
    ::jobmgr::ensure_eq!(received(&rx)?, vec![2]);
    ::jobmgr::ensure_eq!(manager.central_wait_count(), 0);
    manager.shutdown();
    Ok(())
}

/// A deadline in the past with nothing ready returns an empty result right away.
#[test]
fn waitfor_expired_deadline_returns_empty() -> Result<()> {
    let manager: SharedJobManager = manager(config(1))?;
    let idle: Arc<Event> = Arc::new(Event::new()?);
    let (tx, rx): (Sender<Vec<i32>>, Receiver<Vec<i32>>) = crossbeam_channel::unbounded();
    let group: VMGroup = spawn(
        &manager,
        "expired.whscr",
        false,
        wait_once(vec![WaitItem::read(1, idle)], Some(Duration::ZERO), tx),
    )?;
    wait_finished(&group)?;
    ::jobmgr::ensure_eq!(received(&rx)?, Vec::<i32>::new());
    ::jobmgr::ensure_eq!(manager.central_wait_count(), 0);
    manager.shutdown();
    Ok(())
}

//======================================================================================================================
// Central Wait
//======================================================================================================================

/// A handle signalled later wakes the group through the central wait.
#[test]
fn waitfor_signal_wakes_parked_group() -> Result<()> {
    let manager: SharedJobManager = manager(config(2))?;
    let event: Arc<Event> = Arc::new(Event::new()?);
    let (tx, rx): (Sender<Vec<i32>>, Receiver<Vec<i32>>) = crossbeam_channel::unbounded();
    let items: Vec<WaitItem> = vec![WaitItem::read(5, event.clone())];
    let group: VMGroup = spawn(&manager, "later.whscr", false, wait_once(items, None, tx))?;

    thread::sleep(Duration::from_millis(50));
    ::jobmgr::ensure_eq!(manager.get_group_info(&group)?.state, RunningState::WaitForMultiple);
    event.signal();
    ::jobmgr::ensure_eq!(received(&rx)?, vec![5]);
    wait_finished(&group)?;
    ::jobmgr::ensure_eq!(manager.central_wait_count(), 1);
    manager.shutdown();
    Ok(())
}

/// A parked group whose deadline passes resumes with an empty result.
#[test]
fn waitfor_deadline_resumes_parked_group() -> Result<()> {
    let manager: SharedJobManager = manager(config(2))?;
    let idle: Arc<Event> = Arc::new(Event::new()?);
    let (tx, rx): (Sender<Vec<i32>>, Receiver<Vec<i32>>) = crossbeam_channel::unbounded();
    let start: Instant = Instant::now();
    let group: VMGroup = spawn(
        &manager,
        "deadline.whscr",
        false,
        wait_once(vec![WaitItem::read(1, idle)], Some(Duration::from_millis(150)), tx),
    )?;
    ::jobmgr::ensure_eq!(received(&rx)?, Vec::<i32>::new());
    ::jobmgr::ensure_eq!(start.elapsed() >= Duration::from_millis(150), true);
    wait_finished(&group)?;
    manager.shutdown();
    Ok(())
}

/// Aborting a parked group wakes it with an empty result so that it can observe the abort.
#[test]
fn waitfor_abort_wakes_parked_group() -> Result<()> {
    let manager: SharedJobManager = manager(config(2))?;
    let idle: Arc<Event> = Arc::new(Event::new()?);
    let (tx, rx): (Sender<Vec<i32>>, Receiver<Vec<i32>>) = crossbeam_channel::unbounded();
    let group: VMGroup = spawn(&manager, "abort.whscr", false, wait_once(vec![WaitItem::read(1, idle)], None, tx))?;
    thread::sleep(Duration::from_millis(50));
    manager.abort_vm_group(&group, AbortReason::Manually);
    ::jobmgr::ensure_eq!(received(&rx)?, Vec::<i32>::new());
    wait_finished(&group)?;
    manager.shutdown();
    Ok(())
}

//======================================================================================================================
// Without Suspension
//======================================================================================================================

/// A group that may not suspend waits inside its own slice.
#[test]
fn waitfor_without_suspension_blocks_in_slice() -> Result<()> {
    let manager: SharedJobManager = manager(config(1))?;
    let event: Arc<Event> = Arc::new(Event::new()?);
    let handle: Arc<Event> = event.clone();
    let (tx, rx): (Sender<Vec<i32>>, Receiver<Vec<i32>>) = crossbeam_channel::unbounded();
    let mut wait = wait_once(vec![WaitItem::read(3, handle)], None, tx);
    let group: VMGroup = spawn(&manager, "nosuspend.whscr", false, move |ctx| {
        ctx.set_can_suspend(false);
        wait(ctx)
    })?;
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        event.signal();
    });
    ::jobmgr::ensure_eq!(received(&rx)?, vec![3]);
    wait_finished(&group)?;
    ::jobmgr::ensure_eq!(manager.central_wait_count(), 0);
    if signaller.join().is_err() {
        anyhow::bail!("signaller thread panicked");
    }
    manager.shutdown();
    Ok(())
}

/// Waiting forever on nothing is an error when the group may not suspend. With a deadline it is a sleep.
#[test]
fn waitfor_without_suspension_empty_wait() -> Result<()> {
    let manager: SharedJobManager = manager(config(1))?;
    let (tx, rx): (Sender<Result<Vec<i32>, i32>>, Receiver<Result<Vec<i32>, i32>>) = crossbeam_channel::unbounded();
    let group: VMGroup = spawn(&manager, "sleep.whscr", false, move |ctx| {
        ctx.set_can_suspend(false);
        for deadline in [None, Some(Instant::now() + Duration::from_millis(50))] {
            let result: Result<Vec<i32>, i32> = match wait_for_multiple(ctx, Vec::new(), deadline) {
                Ok(WaitOutcome::Ready(ids)) => Ok(ids),
                Ok(WaitOutcome::Suspended) => Err(0),
                Err(e) => Err(e.errno),
            };
            let _ = tx.send(result);
        }
        Ok(RunResult::Completed)
    })?;
    wait_finished(&group)?;
    let results: Vec<Result<Vec<i32>, i32>> = rx.try_iter().collect();
    ::jobmgr::ensure_eq!(results, vec![Err(libc::EINVAL), Ok(Vec::new())]);
    manager.shutdown();
    Ok(())
}

/// Slice body that may not suspend and waits without a deadline on an event nobody signals.
fn wait_on_idle_event(
    event: Arc<Event>,
    tx: Sender<(Vec<i32>, AbortReason)>,
) -> impl FnMut(&mut RunContext) -> Result<RunResult, VmError> + Send + 'static {
    move |ctx| {
        ctx.set_can_suspend(false);
        match wait_for_multiple(ctx, vec![WaitItem::read(1, event.clone())], None) {
            Ok(WaitOutcome::Ready(ids)) => {
                let _ = tx.send((ids, ctx.abort_reason()));
                Ok(RunResult::Terminated)
            },
            Ok(WaitOutcome::Suspended) => Err(VmError::from("suspended although suspension is disabled")),
            Err(e) => Err(VmError::from(e.cause.as_str())),
        }
    }
}

/// An abort ends a wait that blocks inside the slice.
#[test]
fn waitfor_without_suspension_honours_abort() -> Result<()> {
    let manager: SharedJobManager = manager(config(1))?;
    let event: Arc<Event> = Arc::new(Event::new()?);
    let (tx, rx): (Sender<(Vec<i32>, AbortReason)>, Receiver<(Vec<i32>, AbortReason)>) = crossbeam_channel::unbounded();
    let group: VMGroup = spawn(&manager, "blocked.whscr", false, wait_on_idle_event(event, tx))?;
    thread::sleep(Duration::from_millis(50));
    manager.abort_vm_group(&group, AbortReason::Manually);

    let outcome: (Vec<i32>, AbortReason) = match rx.recv_timeout(WAIT_TIMEOUT) {
        Ok(outcome) => outcome,
        Err(e) => anyhow::bail!("blocked wait did not return ({:?})", e),
    };
    ::jobmgr::ensure_eq!(outcome, (Vec::new(), AbortReason::Manually));
    wait_finished(&group)?;
    manager.shutdown();
    Ok(())
}

/// The running timeout ends a wait that blocks inside the slice.
#[test]
fn waitfor_without_suspension_honours_running_timeout() -> Result<()> {
    let manager: SharedJobManager = manager(config(1))?;
    let event: Arc<Event> = Arc::new(Event::new()?);
    let (tx, rx): (Sender<(Vec<i32>, AbortReason)>, Receiver<(Vec<i32>, AbortReason)>) = crossbeam_channel::unbounded();
    let group: VMGroup = prepare(&manager, "blocked.whscr", false, ScriptVm::new(wait_on_idle_event(event, tx)))?;
    manager.set_running_timeout(&group, Some(Duration::from_secs(1)))?;
    let start: Instant = Instant::now();
    manager.start_vm_group(&group)?;

    let outcome: (Vec<i32>, AbortReason) = match rx.recv_timeout(WAIT_TIMEOUT) {
        Ok(outcome) => outcome,
        Err(e) => anyhow::bail!("blocked wait did not return ({:?})", e),
    };
    let elapsed: Duration = start.elapsed();
    ::jobmgr::ensure_eq!(outcome, (Vec::new(), AbortReason::Timeout));
    ::jobmgr::ensure_eq!(elapsed >= Duration::from_secs(1), true);
    ::jobmgr::ensure_eq!(elapsed < Duration::from_secs(4), true);
    wait_finished(&group)?;
    manager.shutdown();
    Ok(())
}
