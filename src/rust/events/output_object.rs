// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::events::Waiter;
use ::std::{
    ops::BitOr,
    os::fd::RawFd,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Answer of a non-blocking readiness probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalledStatus {
    Signalled,
    NotSignalled,
    /// The object cannot answer without an OS-level wait.
    Unknown,
}

/// Directions in which an output object may be waited on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities(u8);

/// Anything a script may wait on.
///
/// The `add_to_waiter_*` functions register the object's descriptors with a [Waiter] and return `true` if the object
/// is already known to be signalled, in which case the caller need not block at all.
pub trait OutputObject: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn is_read_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::Unknown
    }

    fn is_write_signalled(&self, _waiter: Option<&Waiter>) -> SignalledStatus {
        SignalledStatus::Unknown
    }

    fn add_to_waiter_read(&self, _waiter: &mut Waiter) -> bool {
        false
    }

    fn add_to_waiter_write(&self, _waiter: &mut Waiter) -> bool {
        false
    }
}

/// Output object over a raw descriptor owned elsewhere, such as a socket.
pub struct FdOutputObject {
    fd: RawFd,
    capabilities: Capabilities,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(1);
    pub const WRITABLE: Self = Self(2);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl FdOutputObject {
    pub fn new(fd: RawFd, capabilities: Capabilities) -> Self {
        Self { fd, capabilities }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<bool> for SignalledStatus {
    fn from(signalled: bool) -> Self {
        if signalled {
            SignalledStatus::Signalled
        } else {
            SignalledStatus::NotSignalled
        }
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl OutputObject for FdOutputObject {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// A bare descriptor is only known to be ready after a wait that included it.
    fn is_read_signalled(&self, waiter: Option<&Waiter>) -> SignalledStatus {
        match waiter {
            Some(waiter) if waiter.contains(self.fd) => SignalledStatus::from(waiter.is_readable(self.fd)),
            _ => SignalledStatus::Unknown,
        }
    }

    fn is_write_signalled(&self, waiter: Option<&Waiter>) -> SignalledStatus {
        match waiter {
            Some(waiter) if waiter.contains(self.fd) => SignalledStatus::from(waiter.is_writable(self.fd)),
            _ => SignalledStatus::Unknown,
        }
    }

    fn add_to_waiter_read(&self, waiter: &mut Waiter) -> bool {
        waiter.add_read_fd(self.fd);
        false
    }

    fn add_to_waiter_write(&self, waiter: &mut Waiter) -> bool {
        waiter.add_write_fd(self.fd);
        false
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Capabilities,
        FdOutputObject,
        OutputObject,
        SignalledStatus,
    };
    use crate::events::Waiter;
    use ::anyhow::Result;
    use ::std::time::Duration;

    #[test]
    fn test_fd_object_is_unknown_without_waiter() -> Result<()> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        crate::ensure_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let reader: FdOutputObject = FdOutputObject::new(fds[0], Capabilities::READABLE);
        let writer: FdOutputObject = FdOutputObject::new(fds[1], Capabilities::WRITABLE);

        crate::ensure_eq!(reader.is_read_signalled(None), SignalledStatus::Unknown);

        let mut waiter: Waiter = Waiter::new();
        crate::ensure_eq!(reader.add_to_waiter_read(&mut waiter), false);
        crate::ensure_eq!(writer.add_to_waiter_write(&mut waiter), false);
        crate::ensure_eq!(waiter.wait(Some(Duration::from_millis(0)))?, true);
        crate::ensure_eq!(reader.is_read_signalled(Some(&waiter)), SignalledStatus::NotSignalled);
        crate::ensure_eq!(writer.is_write_signalled(Some(&waiter)), SignalledStatus::Signalled);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        Ok(())
    }

    #[test]
    fn test_capabilities() {
        let both: Capabilities = Capabilities::READABLE | Capabilities::WRITABLE;
        assert!(both.contains(Capabilities::READABLE));
        assert!(both.contains(Capabilities::WRITABLE));
        assert!(!Capabilities::READABLE.contains(Capabilities::WRITABLE));
    }
}
