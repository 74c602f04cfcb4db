// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Named locks shared by all groups of a job manager.
//!
//! Every name owns a FIFO queue of entries. An entry carries the number of concurrent holders it tolerates, so one
//! name can act as a mutex (`1`) or a semaphore (`n`). Scanning from the front with a running minimum of those
//! values, the entries within that minimum hold the lock. A request that would have to wait is checked for deadlock
//! first and refused if granting it could never happen.

mod deadlock;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::{
        Capabilities,
        Event,
        OutputObject,
        SignalledStatus,
        Waiter,
    },
    jobmgr::GroupId,
    runtime::fail::Fail,
};
use ::parking_lot::{
    Mutex,
    MutexGuard,
};
use ::serde::Serialize;
use ::slab::Slab;
use ::std::{
    collections::{
        BTreeMap,
        HashMap,
        VecDeque,
    },
    fmt,
    sync::Arc,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct EntryRecord {
    name: String,
    group: GroupId,
    max_concurrent: usize,
    granted: bool,
    queued_at: Instant,
    granted_at: Option<Instant>,
    event: Arc<Event>,
}

#[derive(Default)]
struct ProcessRecord {
    entries: Vec<usize>,
    /// Entry this group is queued behind, if any.
    waiting_for: Option<usize>,
}

#[derive(Default)]
struct LockData {
    locks: HashMap<String, VecDeque<usize>>,
    entries: Slab<EntryRecord>,
    processes: HashMap<GroupId, ProcessRecord>,
}

/// Process-wide registry of named locks.
#[derive(Clone, Default)]
pub struct NamedLockManager {
    data: Arc<Mutex<LockData>>,
}

/// A place in the queue of a named lock. Readable once the lock is held. Dropping it leaves the queue and releases
/// the lock if it was held.
pub struct LockEntry {
    data: Arc<Mutex<LockData>>,
    key: usize,
    name: String,
    group: GroupId,
    event: Arc<Event>,
}

pub enum LockOutcome {
    Granted(LockEntry),
    /// Waits in line. The entry becomes readable when it is granted.
    Queued(LockEntry),
    /// The lock was not free and the caller did not want to queue.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LockHolderStatus {
    pub groupid: String,
    pub maxconcurrent: usize,
    pub granted: bool,
    /// Milliseconds spent holding the lock, or waiting for it if not granted.
    pub duration: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub name: String,
    pub queue: Vec<LockHolderStatus>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LockData {
    /// Grants every entry of `name` that the running-minimum rule admits. Returns the events to signal.
    fn grant(&mut self, name: &str) -> Vec<Arc<Event>> {
        let mut signalled: Vec<Arc<Event>> = Vec::new();
        let queue: &VecDeque<usize> = match self.locks.get(name) {
            Some(queue) => queue,
            None => return signalled,
        };
        let now: Instant = Instant::now();
        let mut limit: usize = usize::MAX;
        for (position, key) in queue.iter().enumerate() {
            let entry: &mut EntryRecord = &mut self.entries[*key];
            limit = limit.min(entry.max_concurrent);
            if position >= limit {
                break;
            }
            if !entry.granted {
                entry.granted = true;
                entry.granted_at = Some(now);
                signalled.push(entry.event.clone());
                if let Some(process) = self.processes.get_mut(&entry.group) {
                    if process.waiting_for == Some(*key) {
                        process.waiting_for = None;
                    }
                }
            }
        }
        signalled
    }

    /// Drops an entry from its queue and its owner. Returns the name of the lock it belonged to.
    fn remove(&mut self, key: usize) -> Option<String> {
        let entry: EntryRecord = self.entries.try_remove(key)?;
        if let Some(queue) = self.locks.get_mut(&entry.name) {
            queue.retain(|k| *k != key);
            if queue.is_empty() {
                self.locks.remove(&entry.name);
            }
        }
        let drop_process: bool = match self.processes.get_mut(&entry.group) {
            Some(process) => {
                process.entries.retain(|k| *k != key);
                if process.waiting_for == Some(key) {
                    process.waiting_for = None;
                }
                process.entries.is_empty()
            },
            None => false,
        };
        if drop_process {
            self.processes.remove(&entry.group);
        }
        Some(entry.name)
    }
}

impl NamedLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `group` for the lock `name`, tolerating up to `max_concurrent` holders including itself.
    ///
    /// Fails with `EDEADLK` if waiting would deadlock, in which case nothing is left queued.
    pub fn add_queue_entry(
        &self,
        group: GroupId,
        name: &str,
        max_concurrent: usize,
        fail_on_queuing: bool,
    ) -> Result<LockOutcome, Fail> {
        if max_concurrent == 0 {
            let cause: String = format!("lock {} requested with a concurrency of zero", name);
            error!("add_queue_entry(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let mut data: MutexGuard<LockData> = self.data.lock();
        if let Some(key) = data.processes.get(&group).and_then(|process| process.waiting_for) {
            let cause: String = format!("group {} is already waiting for lock {}", group, data.entries[key].name);
            error!("add_queue_entry(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let event: Arc<Event> = Arc::new(Event::new()?);
        let key: usize = data.entries.insert(EntryRecord {
            name: name.to_string(),
            group,
            max_concurrent,
            granted: false,
            queued_at: Instant::now(),
            granted_at: None,
            event: event.clone(),
        });
        data.locks.entry(name.to_string()).or_default().push_back(key);
        data.processes.entry(group).or_default().entries.push(key);

        let signalled: Vec<Arc<Event>> = data.grant(name);
        for event in &signalled {
            event.signal();
        }
        if data.entries[key].granted {
            trace!("add_queue_entry(): group {} holds lock {}", group, name);
            return Ok(LockOutcome::Granted(self.make_entry(key, name, group, event)));
        }

        if fail_on_queuing {
            data.remove(key);
            return Ok(LockOutcome::Unavailable);
        }

        if let Some(process) = data.processes.get_mut(&group) {
            process.waiting_for = Some(key);
        }
        if deadlock::detect(&data.locks, &data.entries, &data.processes, key) {
            data.remove(key);
            let cause: String = format!("waiting for lock {} would deadlock group {}", name, group);
            warn!("add_queue_entry(): {}", cause);
            return Err(Fail::new(libc::EDEADLK, &cause));
        }
        trace!("add_queue_entry(): group {} queued for lock {}", group, name);
        Ok(LockOutcome::Queued(self.make_entry(key, name, group, event)))
    }

    fn make_entry(&self, key: usize, name: &str, group: GroupId, event: Arc<Event>) -> LockEntry {
        LockEntry {
            data: self.data.clone(),
            key,
            name: name.to_string(),
            group,
            event,
        }
    }

    /// Groups currently holding `name`.
    pub fn holders(&self, name: &str) -> Vec<GroupId> {
        let data: MutexGuard<LockData> = self.data.lock();
        match data.locks.get(name) {
            Some(queue) => queue
                .iter()
                .map(|key| &data.entries[*key])
                .filter(|entry| entry.granted)
                .map(|entry| entry.group)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of entries, holders included, queued on `name`.
    pub fn queue_len(&self, name: &str) -> usize {
        self.data.lock().locks.get(name).map_or(0, VecDeque::len)
    }

    pub fn is_waiting(&self, group: &GroupId) -> bool {
        self.data
            .lock()
            .processes
            .get(group)
            .is_some_and(|process| process.waiting_for.is_some())
    }

    pub fn status(&self) -> Vec<LockStatus> {
        let data: MutexGuard<LockData> = self.data.lock();
        let now: Instant = Instant::now();
        let sorted: BTreeMap<&String, &VecDeque<usize>> = data.locks.iter().collect();
        sorted
            .into_iter()
            .map(|(name, queue)| LockStatus {
                name: name.clone(),
                queue: queue
                    .iter()
                    .map(|key| {
                        let entry: &EntryRecord = &data.entries[*key];
                        let since: Instant = entry.granted_at.unwrap_or(entry.queued_at);
                        LockHolderStatus {
                            groupid: entry.group.to_string(),
                            maxconcurrent: entry.max_concurrent,
                            granted: entry.granted,
                            duration: now.saturating_duration_since(since).as_millis() as u64,
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

impl LockEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn is_granted(&self) -> bool {
        self.data.lock().entries.get(self.key).is_some_and(|entry| entry.granted)
    }

    /// Same as dropping the entry.
    pub fn release(self) {}
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl OutputObject for LockEntry {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READABLE
    }

    fn is_read_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::from(self.event.is_signalled())
    }

    fn add_to_waiter_read(&self, waiter: &mut Waiter) -> bool {
        self.event.add_to_waiter_read(waiter)
    }
}

impl Drop for LockEntry {
    fn drop(&mut self) {
        let mut data: MutexGuard<LockData> = self.data.lock();
        if let Some(name) = data.remove(self.key) {
            let signalled: Vec<Arc<Event>> = data.grant(&name);
            drop(data);
            trace!("drop(): group {} left lock {}", self.group, name);
            for event in signalled {
                event.signal();
            }
        }
    }
}

impl fmt::Debug for LockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockEntry(name={}, group={})", self.name, self.group)
    }
}

impl fmt::Debug for LockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOutcome::Granted(entry) => write!(f, "Granted({:?})", entry),
            LockOutcome::Queued(entry) => write!(f, "Queued({:?})", entry),
            LockOutcome::Unavailable => write!(f, "Unavailable"),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
