// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deadlock detection for named locks.
//!
//! Mutex-only cycles are found by following the chain of "waits for the lock held by" links, which costs at most one
//! step per process. Once a semaphore shows up on that chain the walk cannot tell, and the whole wait graph is
//! evaluated instead: processes that are not waiting can always make progress, and so can any process whose entry
//! would be granted once every process known to make progress has released its locks. Whatever is left over is
//! deadlocked.

//======================================================================================================================
// Imports
//======================================================================================================================

use super::{
    EntryRecord,
    ProcessRecord,
};
use crate::jobmgr::GroupId;
use ::slab::Slab;
use ::std::collections::{
    HashMap,
    HashSet,
    VecDeque,
};

//======================================================================================================================
// Structures
//======================================================================================================================

enum ChainResult {
    Deadlock,
    Free,
    Inconclusive,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Whether the queued entry `key` can never be granted.
pub(super) fn detect(
    locks: &HashMap<String, VecDeque<usize>>,
    entries: &Slab<EntryRecord>,
    processes: &HashMap<GroupId, ProcessRecord>,
    key: usize,
) -> bool {
    match walk_chain(locks, entries, processes, key) {
        ChainResult::Deadlock => true,
        ChainResult::Free => false,
        ChainResult::Inconclusive => {
            debug!("detect(): semaphore on the wait chain, evaluating the whole graph");
            !stuck_processes(locks, entries, processes).is_empty()
        },
    }
}

fn walk_chain(
    locks: &HashMap<String, VecDeque<usize>>,
    entries: &Slab<EntryRecord>,
    processes: &HashMap<GroupId, ProcessRecord>,
    key: usize,
) -> ChainResult {
    let requester: GroupId = entries[key].group;
    let mut waiting: usize = key;
    for _ in 0..=processes.len() {
        let entry: &EntryRecord = &entries[waiting];
        if entry.max_concurrent != 1 {
            return ChainResult::Inconclusive;
        }
        let holder: &EntryRecord = match locks.get(&entry.name).and_then(|queue| queue.front()) {
            Some(front) if *front != waiting => &entries[*front],
            _ => return ChainResult::Free,
        };
        if holder.max_concurrent != 1 {
            return ChainResult::Inconclusive;
        }
        if holder.group == requester {
            return ChainResult::Deadlock;
        }
        waiting = match processes.get(&holder.group).and_then(|process| process.waiting_for) {
            Some(next) => next,
            None => return ChainResult::Free,
        };
    }
    // Longer than the number of processes means a cycle that does not involve the requester.
    ChainResult::Inconclusive
}

/// Groups that cannot make progress in the current wait graph.
fn stuck_processes(
    locks: &HashMap<String, VecDeque<usize>>,
    entries: &Slab<EntryRecord>,
    processes: &HashMap<GroupId, ProcessRecord>,
) -> Vec<GroupId> {
    let mut progressing: HashSet<GroupId> = processes
        .iter()
        .filter(|(_, process)| process.waiting_for.is_none())
        .map(|(group, _)| *group)
        .collect();

    loop {
        let mut changed: bool = false;
        for (group, process) in processes {
            if progressing.contains(group) {
                continue;
            }
            let waiting: usize = match process.waiting_for {
                Some(waiting) => waiting,
                None => continue,
            };
            if would_be_granted(locks, entries, &progressing, waiting) {
                progressing.insert(*group);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    processes
        .keys()
        .filter(|group| !progressing.contains(group))
        .copied()
        .collect()
}

/// Whether `key` is granted once every entry owned by a group in `released` is gone.
fn would_be_granted(
    locks: &HashMap<String, VecDeque<usize>>,
    entries: &Slab<EntryRecord>,
    released: &HashSet<GroupId>,
    key: usize,
) -> bool {
    let queue: &VecDeque<usize> = match locks.get(&entries[key].name) {
        Some(queue) => queue,
        None => return false,
    };
    let mut limit: usize = usize::MAX;
    let mut position: usize = 0;
    for candidate in queue {
        let entry: &EntryRecord = &entries[*candidate];
        if released.contains(&entry.group) {
            continue;
        }
        limit = limit.min(entry.max_concurrent);
        if position >= limit {
            return false;
        }
        if *candidate == key {
            return true;
        }
        position += 1;
    }
    false
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::{
        jobmgr::GroupId,
        locks::{
            LockEntry,
            LockOutcome,
            NamedLockManager,
        },
    };
    use ::anyhow::Result;

    fn entry(outcome: LockOutcome) -> Result<LockEntry> {
        match outcome {
            LockOutcome::Granted(entry) | LockOutcome::Queued(entry) => Ok(entry),
            LockOutcome::Unavailable => anyhow::bail!("lock unavailable"),
        }
    }

    #[test]
    fn test_mutex_cycle_is_rejected() -> Result<()> {
        let locks: NamedLockManager = NamedLockManager::new();
        let (g1, g2) = (GroupId::random(), GroupId::random());
        let _a: LockEntry = entry(locks.add_queue_entry(g1, "a", 1, false)?)?;
        let _b: LockEntry = entry(locks.add_queue_entry(g2, "b", 1, false)?)?;
        let _g1_b: LockEntry = entry(locks.add_queue_entry(g1, "b", 1, false)?)?;
        let outcome = locks.add_queue_entry(g2, "a", 1, false);
        crate::ensure_eq!(outcome.map(|_| ()).map_err(|e| e.errno), Err(libc::EDEADLK));
        crate::ensure_eq!(locks.queue_len("a"), 1);
        crate::ensure_eq!(locks.is_waiting(&g2), false);
        Ok(())
    }

    #[test]
    fn test_relocking_a_held_mutex_is_rejected() -> Result<()> {
        let locks: NamedLockManager = NamedLockManager::new();
        let group: GroupId = GroupId::random();
        let _held: LockEntry = entry(locks.add_queue_entry(group, "a", 1, false)?)?;
        let outcome = locks.add_queue_entry(group, "a", 1, false);
        crate::ensure_eq!(outcome.map(|_| ()).map_err(|e| e.errno), Err(libc::EDEADLK));
        Ok(())
    }

    #[test]
    fn test_three_way_mutex_cycle_is_rejected() -> Result<()> {
        let locks: NamedLockManager = NamedLockManager::new();
        let (g1, g2, g3) = (GroupId::random(), GroupId::random(), GroupId::random());
        let _a: LockEntry = entry(locks.add_queue_entry(g1, "a", 1, false)?)?;
        let _b: LockEntry = entry(locks.add_queue_entry(g2, "b", 1, false)?)?;
        let _c: LockEntry = entry(locks.add_queue_entry(g3, "c", 1, false)?)?;
        let _g1_b: LockEntry = entry(locks.add_queue_entry(g1, "b", 1, false)?)?;
        let _g2_c: LockEntry = entry(locks.add_queue_entry(g2, "c", 1, false)?)?;
        let outcome = locks.add_queue_entry(g3, "a", 1, false);
        crate::ensure_eq!(outcome.map(|_| ()).map_err(|e| e.errno), Err(libc::EDEADLK));
        Ok(())
    }

    #[test]
    fn test_semaphore_with_free_slot_is_not_deadlock() -> Result<()> {
        let locks: NamedLockManager = NamedLockManager::new();
        let (g1, g2, g3) = (GroupId::random(), GroupId::random(), GroupId::random());
        // g1 and g2 share the semaphore, g3 holds the mutex and runs freely.
        let _s1: LockEntry = entry(locks.add_queue_entry(g1, "s", 2, false)?)?;
        let _s2: LockEntry = entry(locks.add_queue_entry(g2, "s", 2, false)?)?;
        let _m: LockEntry = entry(locks.add_queue_entry(g3, "m", 1, false)?)?;
        let _g1_m: LockEntry = entry(locks.add_queue_entry(g1, "m", 1, false)?)?;
        // g3 waits for the semaphore. g2 never waits, so it releases a slot eventually.
        let waiting: LockEntry = match locks.add_queue_entry(g3, "s", 2, false)? {
            LockOutcome::Queued(entry) => entry,
            other => anyhow::bail!("expected to queue, got {:?}", other),
        };
        crate::ensure_eq!(waiting.is_granted(), false);
        Ok(())
    }

    #[test]
    fn test_semaphore_cycle_is_rejected() -> Result<()> {
        let locks: NamedLockManager = NamedLockManager::new();
        let (g1, g2, g3) = (GroupId::random(), GroupId::random(), GroupId::random());
        let _s1: LockEntry = entry(locks.add_queue_entry(g1, "s", 2, false)?)?;
        let _s2: LockEntry = entry(locks.add_queue_entry(g2, "s", 2, false)?)?;
        let _m: LockEntry = entry(locks.add_queue_entry(g3, "m", 1, false)?)?;
        let _g1_m: LockEntry = entry(locks.add_queue_entry(g1, "m", 1, false)?)?;
        let _g2_m: LockEntry = entry(locks.add_queue_entry(g2, "m", 1, false)?)?;
        // Both semaphore holders wait for the mutex that g3 holds.
        let outcome = locks.add_queue_entry(g3, "s", 2, false);
        crate::ensure_eq!(outcome.map(|_| ()).map_err(|e| e.errno), Err(libc::EDEADLK));
        crate::ensure_eq!(locks.queue_len("s"), 2);
        Ok(())
    }
}
