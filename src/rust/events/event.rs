// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    events::{
        Capabilities,
        OutputObject,
        SignalledStatus,
        Waiter,
    },
    runtime::fail::Fail,
};
use ::libc::{
    c_int,
    c_void,
};
use ::parking_lot::Mutex;
use ::std::os::fd::RawFd;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A level-triggered signal. While the event is signalled, its read descriptor stays readable, so any [Waiter] that
/// includes it returns immediately.
pub struct Event {
    /// Current state. Guards the pipe so that the byte count in the pipe always matches the flag.
    signalled: Mutex<bool>,
    /// Read end of the notification pipe.
    read_fd: RawFd,
    /// Write end of the notification pipe.
    write_fd: RawFd,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Event {
    /// Creates a new event in the unsignalled state.
    pub fn new() -> Result<Self, Fail> {
        let mut fds: [c_int; 2] = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            let fail: Fail = Fail::last_os_error("failed to create event pipe");
            error!("new(): {:?}", fail);
            return Err(fail);
        }
        for fd in fds {
            if let Err(e) = Self::set_nonblocking_cloexec(fd) {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(e);
            }
        }
        Ok(Self {
            signalled: Mutex::new(false),
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Creates a new event that starts out signalled.
    pub fn new_signalled() -> Result<Self, Fail> {
        let event: Self = Self::new()?;
        event.set_signalled(true);
        Ok(event)
    }

    /// Sets the state of the event. Setting the state it already has is a no-op.
    pub fn set_signalled(&self, signalled: bool) {
        let mut state = self.signalled.lock();
        if *state == signalled {
            return;
        }
        *state = signalled;
        if signalled {
            let byte: u8 = 1;
            let nwritten: isize = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const c_void, 1) };
            if nwritten != 1 {
                warn!("set_signalled(): failed to write to event pipe ({:?})", ::std::io::Error::last_os_error());
            }
        } else {
            self.drain();
        }
    }

    /// Signals the event.
    pub fn signal(&self) {
        self.set_signalled(true)
    }

    /// Resets the event to the unsignalled state.
    pub fn reset(&self) {
        self.set_signalled(false)
    }

    /// Returns the current state of the event.
    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    /// Returns the descriptor that is readable while the event is signalled.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Removes every pending byte from the notification pipe.
    fn drain(&self) {
        let mut buf: [u8; 64] = [0; 64];
        loop {
            let nread: isize = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if nread <= 0 {
                break;
            }
        }
    }

    fn set_nonblocking_cloexec(fd: RawFd) -> Result<(), Fail> {
        unsafe {
            let flags: c_int = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(Fail::last_os_error("failed to set O_NONBLOCK on event pipe"));
            }
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(Fail::last_os_error("failed to set FD_CLOEXEC on event pipe"));
            }
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl OutputObject for Event {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READABLE
    }

    fn is_read_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::from(self.is_signalled())
    }

    fn add_to_waiter_read(&self, waiter: &mut Waiter) -> bool {
        waiter.add_event(self);
        self.is_signalled()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Event;
    use crate::events::Waiter;
    use ::anyhow::Result;
    use ::std::time::Duration;

    #[test]
    fn test_event_is_level_triggered() -> Result<()> {
        let event: Event = Event::new()?;
        crate::ensure_eq!(event.is_signalled(), false);

        event.signal();
        event.signal();
        crate::ensure_eq!(event.is_signalled(), true);

        // A signalled event keeps waking waiters until it is reset.
        for _ in 0..2 {
            let mut waiter: Waiter = Waiter::new();
            waiter.add_event(&event);
            crate::ensure_eq!(waiter.wait(Some(Duration::from_millis(0)))?, true);
            crate::ensure_eq!(waiter.is_readable(event.read_fd()), true);
        }

        event.reset();
        let mut waiter: Waiter = Waiter::new();
        waiter.add_event(&event);
        crate::ensure_eq!(waiter.wait(Some(Duration::from_millis(0)))?, false);
        Ok(())
    }

    #[test]
    fn test_event_starts_signalled() -> Result<()> {
        let event: Event = Event::new_signalled()?;
        crate::ensure_eq!(event.is_signalled(), true);
        Ok(())
    }
}
