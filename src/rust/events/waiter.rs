// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::Event,
    runtime::fail::Fail,
};
use ::libc::{
    c_int,
    pollfd,
};
use ::std::{
    os::fd::RawFd,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Longest single poll(2). Longer waits are split so that timeouts above `c_int::MAX` milliseconds still work.
const MAX_POLL_MS: u128 = 60_000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A set of descriptors to block on, with per-descriptor results after a wait.
#[derive(Default)]
pub struct Waiter {
    fds: Vec<pollfd>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Waiter {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    pub fn add_read_fd(&mut self, fd: RawFd) {
        self.add_fd(fd, libc::POLLIN);
    }

    pub fn add_write_fd(&mut self, fd: RawFd) {
        self.add_fd(fd, libc::POLLOUT);
    }

    pub fn add_event(&mut self, event: &Event) {
        self.add_read_fd(event.read_fd());
    }

    fn add_fd(&mut self, fd: RawFd, events: i16) {
        match self.fds.iter_mut().find(|p| p.fd == fd) {
            Some(entry) => entry.events |= events,
            None => self.fds.push(pollfd { fd, events, revents: 0 }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.iter().any(|p| p.fd == fd)
    }

    /// Blocks until at least one descriptor is ready or `timeout` elapses. `None` waits forever. Returns whether
    /// anything became ready.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<bool, Fail> {
        let deadline: Option<Instant> = timeout.map(|t| Instant::now() + t);
        self.wait_until(deadline)
    }

    /// Like [Self::wait], but bounded by an absolute deadline.
    pub fn wait_until(&mut self, deadline: Option<Instant>) -> Result<bool, Fail> {
        for p in self.fds.iter_mut() {
            p.revents = 0;
        }
        loop {
            let timeout_ms: c_int = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining: Duration = deadline.saturating_duration_since(Instant::now());
                    // Round up so that a short remaining time does not turn into a busy loop.
                    let mut ms: u128 = remaining.as_millis();
                    if Duration::from_millis(ms as u64) < remaining {
                        ms += 1;
                    }
                    ms.min(MAX_POLL_MS) as c_int
                },
            };

            let ret: c_int = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms) };
            if ret < 0 {
                let err: ::std::io::Error = ::std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                let cause: String = format!("poll failed: {:?}", err);
                error!("wait_until(): {}", cause);
                return Err(Fail::new(err.raw_os_error().unwrap_or(libc::EIO), &cause));
            }
            if ret > 0 {
                return Ok(true);
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(false),
                _ => continue,
            }
        }
    }

    /// Whether `fd` was reported readable (or hung up) by the last wait.
    pub fn is_readable(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    }

    /// Whether `fd` was reported writable by the last wait.
    pub fn is_writable(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLOUT | libc::POLLERR) != 0
    }

    fn revents(&self, fd: RawFd) -> i16 {
        self.fds.iter().find(|p| p.fd == fd).map(|p| p.revents).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
