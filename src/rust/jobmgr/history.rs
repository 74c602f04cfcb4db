// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::jobmgr::status::JobStatus;
use ::std::{
    collections::VecDeque,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Statuses of terminated jobs, bounded by age and by count. Oldest first.
pub(crate) struct FinishedHistory {
    retention: Duration,
    max_entries: usize,
    entries: VecDeque<(Instant, JobStatus)>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FinishedHistory {
    pub fn new(retention: Duration, max_entries: usize) -> Self {
        Self {
            retention,
            max_entries,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, now: Instant, status: JobStatus) {
        self.entries.push_back((now, status));
        self.prune(now);
    }

    /// Drops entries older than the retention window and, after that, the oldest entries over the count limit.
    pub fn prune(&mut self, now: Instant) {
        while let Some((finished, _)) = self.entries.front() {
            if now.saturating_duration_since(*finished) <= self.retention {
                break;
            }
            self.entries.pop_front();
        }
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn find(&self, groupid: &str) -> Option<&JobStatus> {
        self.entries
            .iter()
            .rev()
            .find(|(_, status)| status.groupid == groupid)
            .map(|(_, status)| status)
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.entries.iter().map(|(_, status)| status.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
